//! Structural facts about a fragment, read off its text.
//!
//! The analyzer never runs anything. It looks for the handful of statement shapes generated
//! model code is made of (imports, the model or problem binding, component declarations and
//! the solver call) with line-anchored regular expressions. Comment lines are ignored.
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BridgeError;
use crate::framework::Framework;

/// Whether a constraint-based model is built directly or instantiated from data later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Concrete,
    Abstract,
}

/// What a constraint-based (`pyomo`) fragment declares
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConstraintFacts {
    pub raw_code: String,
    pub imports: Vec<String>,
    pub model_type: Option<ModelType>,
    pub sets: Vec<String>,
    pub parameters: Vec<String>,
    pub variables: Vec<String>,
    pub objective: Option<String>,
    pub constraints: Vec<String>,
    pub solver: Option<String>,
}

/// What a linear-expression (`pulp`) fragment declares
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinearFacts {
    pub raw_code: String,
    pub imports: Vec<String>,
    /// The name the problem object is bound to
    pub problem: Option<String>,
    /// `maximize` or `minimize`
    pub objective_sense: Option<String>,
    pub variables: Vec<String>,
    pub objective: Option<String>,
    pub constraints: Vec<String>,
    pub solver: Option<String>,
}

/// The facts of one fragment. The two record types share nothing but the code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "framework", rename_all = "kebab-case")]
pub enum StructuralFacts {
    ConstraintBased(ConstraintFacts),
    LinearExpression(LinearFacts),
}

impl StructuralFacts {
    /// The framework the facts were read for
    pub fn framework(&self) -> Framework {
        match self {
            StructuralFacts::ConstraintBased(_) => Framework::ConstraintBased,
            StructuralFacts::LinearExpression(_) => Framework::LinearExpression,
        }
    }

    /// The analyzed fragment, verbatim
    pub fn raw_code(&self) -> &str {
        match self {
            StructuralFacts::ConstraintBased(facts) => &facts.raw_code,
            StructuralFacts::LinearExpression(facts) => &facts.raw_code,
        }
    }

    pub fn imports(&self) -> &[String] {
        match self {
            StructuralFacts::ConstraintBased(facts) => &facts.imports,
            StructuralFacts::LinearExpression(facts) => &facts.imports,
        }
    }
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("analyzer patterns are valid")
}

static IMPORT: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s*import\s+(.+?)\s*$"));
static FROM_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^\s*from\s+([\w.]+)\s+import\s+\(?(.+?)\)?\s*$"));
static MODEL: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"^\s*(\w+)\s*=\s*(?:[\w.]+\.)?(ConcreteModel|AbstractModel)\s*\(")
});
static COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"^\s*\w+\.(\w+)\s*=\s*(?:[\w.]+\.)?(Set|RangeSet|Param|Var|Objective|Constraint|ConstraintList)\s*\(")
});
static SOLVER_FACTORY: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"SolverFactory\s*\(\s*(?:name\s*=\s*)?['"]([^'"]+)['"]"#));
static PROBLEM: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^\s*(\w+)\s*=\s*(?:[\w.]+\.)?LpProblem\s*\("));
static LP_VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"^\s*(\w+)(?:\[[^\]]*\])?\s*=\s*(?:[\w.]+\.)?LpVariable(?:\.dicts|\.dict|\.matrix)?\s*\(")
});
static ADD_ASSIGN: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s*(\w+)\s*\+=\s*(.+?)\s*$"));
static SET_OBJECTIVE: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^\s*(\w+)\.setObjective\s*\((.+)\)\s*$"));
static ADD_CONSTRAINT: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^\s*(\w+)\.addConstraint\s*\((.+)\)\s*$"));
static PULP_SOLVE: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"\.solve\s*\(\s*(?:solver\s*=\s*)?(?:[\w.]+\.)?([A-Za-z_]\w*)\s*\(")
});
static GET_SOLVER: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"getSolver\s*\(\s*['"]([^'"]+)['"]"#));
static COMPARISON: LazyLock<Regex> = LazyLock::new(|| regex(r"<=|>=|=="));

/// Lines that are not comments
fn code_lines(code: &str) -> impl Iterator<Item = &str> {
    code.lines().filter(|line| {
        let trimmed = line.trim_start();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    })
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

/// `import x as y` gives `"x as y"`, `from m import a, b` gives `"m.a"` and `"m.b"`
fn imports(code: &str) -> Vec<String> {
    let mut found = Vec::new();
    for line in code_lines(code) {
        if let Some(caps) = FROM_IMPORT.captures(line) {
            let module = &caps[1];
            for name in caps[2].split(',').map(str::trim).filter(|n| !n.is_empty()) {
                push_unique(&mut found, &format!("{module}.{name}"));
            }
        } else if let Some(caps) = IMPORT.captures(line) {
            for name in caps[1].split(',').map(str::trim).filter(|n| !n.is_empty()) {
                push_unique(&mut found, name);
            }
        }
    }
    found
}

/// Read the structural facts of `fragment` for `framework`. Never executes the code.
pub fn analyze(fragment: &str, framework: Framework) -> StructuralFacts {
    let facts = match framework {
        Framework::ConstraintBased => StructuralFacts::ConstraintBased(constraint_facts(fragment)),
        Framework::LinearExpression => StructuralFacts::LinearExpression(linear_facts(fragment)),
    };
    debug!(%framework, imports = facts.imports().len(), "analyzed fragment");
    facts
}

/// [analyze] for a framework given by name
pub fn analyze_named(fragment: &str, framework: &str) -> Result<StructuralFacts, BridgeError> {
    Ok(analyze(fragment, framework.parse()?))
}

fn constraint_facts(code: &str) -> ConstraintFacts {
    let mut facts = ConstraintFacts {
        raw_code: code.to_string(),
        imports: imports(code),
        ..ConstraintFacts::default()
    };
    for line in code_lines(code) {
        if let Some(caps) = MODEL.captures(line) {
            if facts.model_type.is_none() {
                facts.model_type = Some(match &caps[2] {
                    "AbstractModel" => ModelType::Abstract,
                    _ => ModelType::Concrete,
                });
            }
        }
        if let Some(caps) = COMPONENT.captures(line) {
            let name = &caps[1];
            match &caps[2] {
                "Set" | "RangeSet" => push_unique(&mut facts.sets, name),
                "Param" => push_unique(&mut facts.parameters, name),
                "Var" => push_unique(&mut facts.variables, name),
                "Objective" => {
                    facts.objective.get_or_insert_with(|| name.to_string());
                }
                _ => push_unique(&mut facts.constraints, name),
            }
        }
        if let Some(caps) = SOLVER_FACTORY.captures(line) {
            facts.solver.get_or_insert_with(|| caps[1].to_string());
        }
    }
    facts
}

fn linear_facts(code: &str) -> LinearFacts {
    let mut facts = LinearFacts {
        raw_code: code.to_string(),
        imports: imports(code),
        ..LinearFacts::default()
    };
    for line in code_lines(code) {
        if facts.problem.is_none() {
            if let Some(caps) = PROBLEM.captures(line) {
                facts.problem = Some(caps[1].to_string());
                if line.contains("LpMaximize") {
                    facts.objective_sense = Some("maximize".to_string());
                }
            }
        }
        if let Some(caps) = LP_VARIABLE.captures(line) {
            push_unique(&mut facts.variables, &caps[1]);
        }
    }
    if let Some(problem) = facts.problem.clone() {
        for line in code_lines(code) {
            let added = ADD_ASSIGN
                .captures(line)
                .filter(|caps| caps[1] == *problem)
                .map(|caps| caps[2].to_string());
            if let Some(added) = added {
                if COMPARISON.is_match(&added) {
                    facts.constraints.push(added);
                } else if facts.objective.is_none() {
                    facts.objective = Some(added);
                }
                continue;
            }
            if let Some(caps) = SET_OBJECTIVE.captures(line).filter(|caps| caps[1] == *problem) {
                facts.objective.get_or_insert_with(|| caps[2].trim().to_string());
            }
            if let Some(caps) = ADD_CONSTRAINT.captures(line).filter(|caps| caps[1] == *problem) {
                facts.constraints.push(caps[2].trim().to_string());
            }
        }
        if facts.objective_sense.is_none() {
            let maximizes = code_lines(code).any(|line| line.contains("LpMaximize"));
            facts.objective_sense = Some(if maximizes { "maximize" } else { "minimize" }.to_string());
        }
    }
    for line in code_lines(code) {
        if let Some(caps) = PULP_SOLVE.captures(line) {
            facts.solver.get_or_insert_with(|| caps[1].to_string());
        } else if let Some(caps) = GET_SOLVER.captures(line) {
            facts.solver.get_or_insert_with(|| caps[1].to_string());
        } else if line.contains(".solve(") {
            facts.solver.get_or_insert_with(|| "default".to_string());
        }
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYOMO: &str = "\
import pyomo.environ as pyo
from pyomo.opt import SolverFactory, TerminationCondition

model = pyo.ConcreteModel()
model.I = pyo.Set(initialize=['a', 'b'])
model.T = pyo.RangeSet(3)
model.cost = pyo.Param(model.I, initialize={'a': 1, 'b': 2})
model.x = pyo.Var(model.I, domain=pyo.NonNegativeReals)
# model.y = pyo.Var()
model.obj = pyo.Objective(rule=lambda m: sum(m.x[i] for i in m.I))
model.cap = pyo.Constraint(model.I, rule=lambda m, i: m.x[i] <= 4)
model.extra = pyo.ConstraintList()
results = pyo.SolverFactory('glpk').solve(model)
";

    #[test]
    fn reads_pyomo_declarations() {
        let StructuralFacts::ConstraintBased(facts) = analyze(PYOMO, Framework::ConstraintBased) else {
            panic!("wrong facts type");
        };
        assert_eq!(
            facts.imports,
            vec!["pyomo.environ as pyo", "pyomo.opt.SolverFactory", "pyomo.opt.TerminationCondition"]
        );
        assert_eq!(facts.model_type, Some(ModelType::Concrete));
        assert_eq!(facts.sets, vec!["I", "T"]);
        assert_eq!(facts.parameters, vec!["cost"]);
        assert_eq!(facts.variables, vec!["x"]);
        assert_eq!(facts.objective.as_deref(), Some("obj"));
        assert_eq!(facts.constraints, vec!["cap", "extra"]);
        assert_eq!(facts.solver.as_deref(), Some("glpk"));
        assert_eq!(facts.raw_code, PYOMO);
    }

    #[test]
    fn absent_model_marker_stays_absent() {
        let StructuralFacts::ConstraintBased(facts) = analyze("x = 1", Framework::ConstraintBased) else {
            panic!("wrong facts type");
        };
        assert_eq!(facts.model_type, None);
        assert!(facts.imports.is_empty());
    }

    const PULP: &str = "\
from pulp import *
prob = LpProblem('diet', LpMaximize)
x = LpVariable('x', lowBound=0)
y = LpVariable('y', 0, None, LpInteger)
z = LpVariable.dicts('z', range(3), lowBound=0)
prob += 3 * x + 2 * y, 'profit'
prob += x + y <= 4, 'cap'
prob += x - y >= -2
prob.solve(PULP_CBC_CMD(msg=False))
model = prob
";

    #[test]
    fn reads_pulp_declarations() {
        let StructuralFacts::LinearExpression(facts) = analyze(PULP, Framework::LinearExpression) else {
            panic!("wrong facts type");
        };
        assert_eq!(facts.imports, vec!["pulp.*"]);
        assert_eq!(facts.problem.as_deref(), Some("prob"));
        assert_eq!(facts.objective_sense.as_deref(), Some("maximize"));
        assert_eq!(facts.variables, vec!["x", "y", "z"]);
        assert_eq!(facts.objective.as_deref(), Some("3 * x + 2 * y, 'profit'"));
        assert_eq!(facts.constraints, vec!["x + y <= 4, 'cap'", "x - y >= -2"]);
        assert_eq!(facts.solver.as_deref(), Some("PULP_CBC_CMD"));
    }

    #[test]
    fn pulp_sense_defaults_to_minimize_and_bare_solve_is_a_solver() {
        let code = "import pulp as pl\nm = pl.LpProblem('m')\nm.solve()\n";
        let StructuralFacts::LinearExpression(facts) = analyze(code, Framework::LinearExpression) else {
            panic!("wrong facts type");
        };
        assert_eq!(facts.imports, vec!["pulp as pl"]);
        assert_eq!(facts.objective_sense.as_deref(), Some("minimize"));
        assert_eq!(facts.solver.as_deref(), Some("default"));
    }

    #[test]
    fn named_frameworks() {
        let facts = analyze_named("import pulp", "linear").unwrap();
        assert_eq!(facts.framework(), Framework::LinearExpression);
        let err = analyze_named("import cvxpy", "cvxpy").unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FRAMEWORK");
    }

    #[test]
    fn facts_serialize_with_a_framework_tag() {
        let facts = analyze("import pulp", Framework::LinearExpression);
        let json = serde_json::to_value(&facts).unwrap();
        assert_eq!(json["framework"], "linear-expression");
        assert_eq!(json["imports"][0], "pulp");
    }
}
