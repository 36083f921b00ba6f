//! The operations callers use: generate and analyze, validate, solve, or all of them in turn.
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analyze::{analyze, StructuralFacts};
use crate::config::Config;
use crate::error::BridgeError;
use crate::executor::Executor;
use crate::extract::{extract_fragments, select_best_fragment};
use crate::framework::Framework;
use crate::llm::{build_prompt, TextGenerator};
use crate::normalize::SolutionRecord;
use crate::solvers::SolverRegistry;
use crate::validate::{is_executable, validate, Verdict};

/// Everything a full run produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub framework: Framework,
    pub facts: StructuralFacts,
    pub verdict: Verdict,
    /// `None` when the code parses, the parse error otherwise
    pub syntax_error: Option<String>,
    pub record: SolutionRecord,
}

/// A text generator together with the configuration the stages run under
pub struct Pipeline<G> {
    generator: G,
    config: Config,
}

impl<G: TextGenerator> Pipeline<G> {
    pub fn new(generator: G, config: Config) -> Self {
        Pipeline { generator, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The model code generated for `description`: the best fenced block of the reply
    pub fn generate(&self, description: &str, framework: Framework) -> Result<String, BridgeError> {
        let prompt = build_prompt(description, framework, self.config.llm.prompt_style);
        debug!(%framework, style = %self.config.llm.prompt_style, "built prompt");
        let text = self.generator.generate(&prompt)?;
        let fragments = extract_fragments(&text);
        Ok(select_best_fragment(&fragments).to_string())
    }

    /// Generate model code for `description` and read its structural facts
    pub fn generate_and_parse(&self, description: &str, framework: Framework) -> Result<StructuralFacts, BridgeError> {
        let code = self.generate(description, framework)?;
        Ok(analyze(&code, framework))
    }

    pub fn validate(&self, facts: &StructuralFacts, framework: Framework) -> Verdict {
        validate(facts, framework)
    }

    fn executor(&self, framework: Framework, solver_name: Option<&str>) -> Result<Executor, BridgeError> {
        let registry = SolverRegistry::for_framework(framework).with_time_limit(self.config.solver.time_limit);
        let name = solver_name
            .or(self.config.solver.name.as_deref())
            .unwrap_or_else(|| registry.default_solver());
        Ok(Executor::new(framework, name, &registry)?
            .with_limits(self.config.sandbox.limits())
            .with_gate(self.config.validation.gate))
    }

    /// Run `code` and solve its model.
    ///
    /// Fails only for an unknown solver name. Failures of the code itself are reported in
    /// the record. Without a `solver_name` the configured one, then the registry default, is used.
    pub fn solve(&self, code: &str, framework: Framework, solver_name: Option<&str>) -> Result<SolutionRecord, BridgeError> {
        Ok(self.executor(framework, solver_name)?.solve(code))
    }

    /// Generate, analyze, validate and solve
    pub fn run(&self, description: &str, framework: Framework, solver_name: Option<&str>) -> Result<RunReport, BridgeError> {
        let executor = self.executor(framework, solver_name)?;
        let code = self.generate(description, framework)?;
        let facts = analyze(&code, framework);
        let verdict = validate(&facts, framework);
        if !verdict.is_valid() {
            warn!(issues = ?verdict.issues(), "generated model has structural issues");
        }
        let (_, syntax_error) = is_executable(&code);
        let record = executor.solve(&code);
        info!(%framework, status = %record.status, objective = ?record.objective_value, "pipeline finished");
        Ok(RunReport {
            framework,
            facts,
            verdict,
            syntax_error,
            record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatePolicy;
    use crate::llm::GenerationError;
    use crate::normalize::SolveStatus;
    use float_eq::assert_float_eq;

    const REPLY: &str = "Here is the model:\n\n```python\nimport pulp\n\
        model = pulp.LpProblem('toys', pulp.LpMaximize)\n\
        cars = pulp.LpVariable('cars', lowBound=0, cat='Integer')\n\
        planes = pulp.LpVariable('planes', lowBound=0, cat='Integer')\n\
        model += 3 * cars + 5 * planes, 'profit'\n\
        model += cars + 2 * planes <= 14, 'hours'\n\
        model += 3 * cars - planes >= 0, 'mix'\n\
        model += cars - planes <= 2, 'balance'\n\
        model.solve(pulp.PULP_CBC_CMD(msg=False))\n```\n\nOutput:\n```\nok\n```\n";

    fn canned(reply: &'static str) -> impl Fn(&str) -> Result<String, GenerationError> {
        move |_: &str| Ok(reply.to_string())
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.solver.name = Some("microlp".to_string());
        config
    }

    #[test]
    fn generated_code_is_extracted_and_analyzed() {
        let pipeline = Pipeline::new(canned(REPLY), config());
        let facts = pipeline
            .generate_and_parse("toys", Framework::LinearExpression)
            .unwrap();
        let StructuralFacts::LinearExpression(linear) = &facts else {
            panic!("wrong facts type");
        };
        assert_eq!(linear.problem.as_deref(), Some("model"));
        assert_eq!(linear.variables, vec!["cars", "planes"]);
        assert!(pipeline.validate(&facts, Framework::LinearExpression).is_valid());
    }

    #[test]
    fn full_run_solves_the_generated_model() {
        let pipeline = Pipeline::new(canned(REPLY), config());
        let report = pipeline.run("toys", Framework::LinearExpression, None).unwrap();
        assert!(report.verdict.is_valid());
        assert_eq!(report.syntax_error, None);
        assert_eq!(report.record.status, SolveStatus::Optimal, "{:?}", report.record.message);
        assert_float_eq!(report.record.objective_value.unwrap(), 38., abs <= 1e-6);
        assert_eq!(report.record.solver.name, "microlp");
    }

    #[test]
    fn boxed_generators_drive_a_pipeline() {
        let boxed: Box<dyn Fn(&str) -> Result<String, GenerationError>> = Box::new(canned(REPLY));
        let pipeline = Pipeline::new(boxed, config());
        let code = pipeline.generate("toys", Framework::LinearExpression).unwrap();
        assert!(code.contains("LpProblem"));
    }

    #[test]
    fn generation_errors_are_fatal() {
        let failing = |_: &str| -> Result<String, GenerationError> {
            Err(GenerationError::Request("timeout".to_string()))
        };
        let pipeline = Pipeline::new(failing, config());
        let err = pipeline.generate_and_parse("x", Framework::ConstraintBased).unwrap_err();
        assert_eq!(err.code(), "GENERATION_FAILED");
    }

    #[test]
    fn unknown_solvers_are_configuration_errors() {
        let pipeline = Pipeline::new(canned(REPLY), config());
        let err = pipeline
            .solve("model = 1", Framework::LinearExpression, Some("mosek"))
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_SOLVER");
    }

    #[test]
    fn configured_gate_applies_to_solve() {
        let mut config = config();
        config.validation.gate = GatePolicy::Syntax;
        let pipeline = Pipeline::new(canned(REPLY), config);
        let record = pipeline
            .solve("model = (", Framework::ConstraintBased, None)
            .unwrap();
        assert!(record.is_error());
        assert!(record.message.unwrap().starts_with("refused to execute"));
    }
}
