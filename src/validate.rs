//! Static checks on analyzed fragments.
use serde::Serialize;
use tracing::{debug, warn};

use crate::analyze::{ConstraintFacts, LinearFacts, StructuralFacts};
use crate::error::BridgeError;
use crate::framework::Framework;
use crate::script::parse;

/// The outcome of [validate]: valid exactly when there are no issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    is_valid: bool,
    issues: Vec<String>,
}

impl Verdict {
    pub fn from_issues(issues: Vec<String>) -> Self {
        Verdict {
            is_valid: issues.is_empty(),
            issues,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// One human readable entry per violated rule, in rule order
    pub fn issues(&self) -> &[String] {
        &self.issues
    }
}

/// Check `facts` against the rules of `framework`. Every violated rule adds one issue;
/// checking does not stop at the first.
pub fn validate(facts: &StructuralFacts, framework: Framework) -> Verdict {
    let issues = match (facts, framework) {
        (StructuralFacts::ConstraintBased(facts), Framework::ConstraintBased) => constraint_issues(facts),
        (StructuralFacts::LinearExpression(facts), Framework::LinearExpression) => linear_issues(facts),
        (facts, framework) => vec![format!(
            "facts were produced for {} but {framework} was requested",
            facts.framework()
        )],
    };
    let verdict = Verdict::from_issues(issues);
    debug!(%framework, valid = verdict.is_valid(), issues = verdict.issues().len(), "validated fragment");
    verdict
}

/// [validate] for a framework given by name
pub fn validate_named(facts: &StructuralFacts, framework: &str) -> Result<Verdict, BridgeError> {
    Ok(validate(facts, framework.parse()?))
}

fn imports_library(imports: &[String], library: &str) -> bool {
    imports.iter().any(|import| import.to_lowercase().contains(library))
}

fn constraint_issues(facts: &ConstraintFacts) -> Vec<String> {
    let mut issues = Vec::new();
    if !imports_library(&facts.imports, "pyomo") {
        issues.push("Missing Pyomo import".to_string());
    }
    if facts.model_type.is_none() {
        issues.push("No model declared (expected ConcreteModel() or AbstractModel())".to_string());
    }
    if facts.variables.is_empty() {
        issues.push("No variables declared".to_string());
    }
    if facts.objective.is_none() {
        issues.push("No objective defined".to_string());
    }
    if facts.solver.is_none() {
        issues.push("No solver configured (expected SolverFactory(...))".to_string());
    }
    issues
}

fn linear_issues(facts: &LinearFacts) -> Vec<String> {
    let mut issues = Vec::new();
    if !imports_library(&facts.imports, "pulp") {
        issues.push("Missing PuLP import".to_string());
    }
    if facts.problem.is_none() {
        issues.push("No problem declared (expected LpProblem(...))".to_string());
    }
    if facts.variables.is_empty() {
        issues.push("No variables declared".to_string());
    }
    if facts.objective.is_none() {
        issues.push("No objective defined".to_string());
    }
    if facts.solver.is_none() {
        issues.push("No solver configured (expected a .solve(...) call)".to_string());
    }
    issues
}

/// Whether `code` parses. Nothing is evaluated. The message names the offending line.
pub fn is_executable(code: &str) -> (bool, Option<String>) {
    match parse(code) {
        Ok(_) => (true, None),
        Err(err) => {
            let message = err.to_string();
            warn!(error = %message, "code failed executability check");
            (false, Some(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze;

    #[test]
    fn complete_pyomo_model_is_valid() {
        let code = "import pyomo.environ as pyo\nmodel = pyo.ConcreteModel()\nmodel.x = pyo.Var()\n\
                    model.o = pyo.Objective(expr=model.x)\npyo.SolverFactory('highs').solve(model)\n";
        let verdict = validate(&analyze(code, Framework::ConstraintBased), Framework::ConstraintBased);
        assert!(verdict.is_valid(), "{:?}", verdict.issues());
    }

    #[test]
    fn every_violated_rule_is_reported() {
        let verdict = validate(&analyze("x = 1", Framework::ConstraintBased), Framework::ConstraintBased);
        assert!(!verdict.is_valid());
        assert_eq!(verdict.issues().len(), 5);
        assert_eq!(verdict.issues()[0], "Missing Pyomo import");

        let verdict = validate(&analyze("import pulp", Framework::LinearExpression), Framework::LinearExpression);
        assert_eq!(verdict.issues().len(), 4);
        assert!(verdict.issues()[0].starts_with("No problem declared"));
    }

    #[test]
    fn mismatched_facts_give_one_issue() {
        let facts = analyze("import pulp", Framework::LinearExpression);
        let verdict = validate(&facts, Framework::ConstraintBased);
        assert_eq!(
            verdict.issues(),
            ["facts were produced for pulp but pyomo was requested"]
        );
    }

    #[test]
    fn validity_follows_issues() {
        assert!(Verdict::from_issues(vec![]).is_valid());
        assert!(!Verdict::from_issues(vec!["x".to_string()]).is_valid());
    }

    #[test]
    fn named_validation_rejects_unknown_frameworks() {
        let facts = analyze("", Framework::LinearExpression);
        assert!(validate_named(&facts, "pulp").is_ok());
        assert!(matches!(
            validate_named(&facts, "jump"),
            Err(BridgeError::UnsupportedFrameworkKind(_))
        ));
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        assert_eq!(is_executable("x = 1\n"), (true, None));
        let (ok, message) = is_executable("x = 1\ny = (2 +\n");
        assert!(!ok);
        let message = message.unwrap();
        assert!(message.starts_with("SyntaxError"), "{message}");
        assert!(message.contains("line"), "{message}");
    }

    #[test]
    fn deeply_nested_expressions_are_not_executable() {
        let (ok, message) = is_executable(&format!("x = {}1\n", "-".repeat(200_000)));
        assert!(!ok);
        let message = message.unwrap();
        assert!(message.starts_with("SyntaxError"), "{message}");
        assert!(message.contains("too deeply nested"), "{message}");
    }
}
