//! Replies shaped like a chat model's answer, taken through every stage.

use autoopt::llm::prompt::{PULP_EXAMPLE, PYOMO_EXAMPLE};
use autoopt::{
    analyze, extract_fragments, normalize, select_best_fragment, validate, Config, Executor, Framework,
    GenerationError, Pipeline, SolveStatus, SolverMetadata, SolverRegistry, StructuralFacts,
};
use float_eq::assert_float_eq;

fn reply(code: &str) -> String {
    format!(
        "Sure! Here is a model for your problem.\n\n```python\n{code}```\n\n\
         Running it prints something like:\n\n```\nTermination: optimal\n```\n"
    )
}

fn executor(framework: Framework) -> Executor {
    Executor::new(framework, "microlp", &SolverRegistry::for_framework(framework)).unwrap()
}

#[test]
fn the_code_block_is_the_selected_fragment() {
    let text = reply(PYOMO_EXAMPLE);
    let fragments = extract_fragments(&text);
    assert_eq!(fragments.len(), 2);
    assert_eq!(select_best_fragment(&fragments), PYOMO_EXAMPLE.trim_end());
}

#[test]
fn pyomo_reply_is_analyzed_and_valid() {
    let text = reply(PYOMO_EXAMPLE);
    let fragments = extract_fragments(&text);
    let facts = analyze(select_best_fragment(&fragments), Framework::ConstraintBased);
    let StructuralFacts::ConstraintBased(model) = &facts else {
        panic!("expected constraint-based facts, got {facts:?}");
    };
    assert_eq!(model.sets, vec!["i"]);
    assert_eq!(model.parameters, vec!["profit", "resource_usage", "resource_limit"]);
    assert_eq!(model.variables, vec!["x"]);
    assert_eq!(model.constraints, vec!["resource_constraint"]);
    assert_eq!(model.solver.as_deref(), Some("highs"));
    assert!(validate(&facts, Framework::ConstraintBased).is_valid());
    // the same facts judged against the other framework
    assert!(!validate(&facts, Framework::LinearExpression).is_valid());
}

#[test]
fn pulp_reply_is_analyzed_and_valid() {
    let facts = analyze(PULP_EXAMPLE, Framework::LinearExpression);
    let StructuralFacts::LinearExpression(problem) = &facts else {
        panic!("expected linear-expression facts, got {facts:?}");
    };
    assert_eq!(problem.problem.as_deref(), Some("model"));
    assert_eq!(problem.objective_sense.as_deref(), Some("maximize"));
    assert_eq!(problem.variables, vec!["x1", "x2"]);
    assert!(problem.objective.is_some());
    assert_eq!(problem.constraints.len(), 1);
    assert!(validate(&facts, Framework::LinearExpression).is_valid());
}

#[test]
fn prompt_examples_solve() {
    let best = 100. / 7. * 15.;

    let record = executor(Framework::ConstraintBased).solve(PYOMO_EXAMPLE);
    assert_eq!(record.status, SolveStatus::Optimal, "{:?}", record.message);
    assert_float_eq!(record.objective_value.unwrap(), best, abs <= 1e-6);
    assert_float_eq!(record.variables["x[product1]"].value.unwrap(), 0., abs <= 1e-6);
    assert_float_eq!(record.variables["x[product2]"].value.unwrap(), 100. / 7., abs <= 1e-6);

    let record = executor(Framework::LinearExpression).solve(PULP_EXAMPLE);
    assert_eq!(record.status, SolveStatus::Optimal, "{:?}", record.message);
    assert_float_eq!(record.objective_value.unwrap(), best, abs <= 1e-6);
    assert!(record.constraints.contains_key("Resource_Constraint"));
}

#[test]
fn every_declared_variable_is_reported_with_a_value() {
    let code = "\
import pulp
model = pulp.LpProblem('production', pulp.LpMaximize)
x1 = pulp.LpVariable('x1', lowBound=0)
x2 = pulp.LpVariable('x2', lowBound=0)
model += 10 * x1 + 15 * x2
model += 5 * x1 + 7 * x2 <= 100
model.solve()
";
    let record = executor(Framework::LinearExpression).solve(select_best_fragment(&extract_fragments(&reply(code))));
    assert_eq!(record.status, SolveStatus::Optimal, "{:?}", record.message);
    let names: Vec<&str> = record.variables.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["x1", "x2"]);
    assert!(record.variables.values().all(|v| v.value.is_some()));
    assert_float_eq!(record.variables["x2"].value.unwrap(), 100. / 7., abs <= 1e-6);
    assert_float_eq!(record.objective_value.unwrap(), 1500. / 7., abs <= 1e-6);
}

#[test]
fn code_without_a_model_gives_an_error_record() {
    let record = executor(Framework::ConstraintBased).solve("import pyomo.environ as pyo\nm = pyo.ConcreteModel()\n");
    assert!(record.is_error());
    assert!(record.message.is_some());
    assert_eq!(record.objective_value, None);
    assert!(record.variables.is_empty());
}

#[test]
fn staged_files_do_not_outlive_the_call() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(Framework::LinearExpression).with_staging_dir(dir.path());
    let ok = executor.solve(PULP_EXAMPLE);
    assert_eq!(ok.status, SolveStatus::Optimal);
    let failed = executor.solve("raise ValueError('boom')\n");
    assert!(failed.is_error());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn normalizing_twice_gives_the_same_record() {
    let executor = executor(Framework::ConstraintBased);
    let (solved, _) = executor.execute(PYOMO_EXAMPLE).unwrap();
    let metadata = SolverMetadata {
        name: "microlp".to_string(),
        requested: "microlp".to_string(),
        ..SolverMetadata::default()
    };
    assert_eq!(normalize(&solved, &metadata), normalize(&solved, &metadata));
}

#[test]
fn infeasible_models_are_a_status_not_an_error() {
    let code = "\
import pyomo.environ as pyo
model = pyo.ConcreteModel()
model.x = pyo.Var(domain=pyo.NonNegativeReals)
model.obj = pyo.Objective(expr=model.x)
model.impossible = pyo.Constraint(expr=model.x <= -1)
pyo.SolverFactory('glpk').solve(model)
";
    let record = executor(Framework::ConstraintBased).solve(code);
    assert_eq!(record.status, SolveStatus::Infeasible);
    assert_eq!(record.message, None);
    assert_eq!(record.objective_value, None);
    assert_eq!(record.variables["x"].value, None);
    assert_eq!(record.solver.termination_condition.as_deref(), Some("infeasible"));
}

#[test]
fn pipeline_runs_a_pyomo_reply() {
    let text = reply(PYOMO_EXAMPLE);
    let generator = move |prompt: &str| -> Result<String, GenerationError> {
        assert!(prompt.contains("pyomo"));
        Ok(text.clone())
    };
    let mut config = Config::default();
    config.solver.name = Some("microlp".to_string());
    let pipeline = Pipeline::new(generator, config);
    let report = pipeline
        .run("maximize profit of two products", Framework::ConstraintBased, None)
        .unwrap();
    assert!(report.verdict.is_valid());
    assert_eq!(report.record.status, SolveStatus::Optimal);
    assert_eq!(report.record.solver.requested, "microlp");

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["facts"]["framework"], "constraint-based");
    assert_eq!(json["record"]["status"], "optimal");
}
