//! The uniform solution record every solve call ends in, whichever framework produced it.
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::framework::Framework;
use crate::model::{Category, Problem, Sense};
use crate::solvers::{BackendSolution, ResolutionError, Solution, SolutionStatus};
use crate::surface::{pulp, pyomo};

/// Outcome class of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    /// A proven optimum was found
    Optimal,
    /// A solution was found, optimality not proven
    Feasible,
    /// No assignment satisfies the constraints
    Infeasible,
    /// The objective can improve without limit
    Unbounded,
    /// The model was built but no solve took place
    NotSolved,
    /// Running the fragment or the solver failed
    Error,
}

impl SolveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SolveStatus::Optimal => "optimal",
            SolveStatus::Feasible => "feasible",
            SolveStatus::Infeasible => "infeasible",
            SolveStatus::Unbounded => "unbounded",
            SolveStatus::NotSolved => "not_solved",
            SolveStatus::Error => "error",
        }
    }

    /// Whether variable values are available
    pub fn has_solution(self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::Feasible)
    }
}

impl Display for SolveStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decision variable of a solved model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub value: Option<f64>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub category: Category,
}

/// One constraint of a solved model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRecord {
    pub sense: Sense,
    pub rhs: f64,
    pub expression: String,
}

/// Which solver ran, and what it said
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SolverMetadata {
    /// The backend that actually ran
    pub name: String,
    /// The name the caller asked for
    pub requested: String,
    /// Wall time of the final solve, in seconds
    pub solve_time: Option<f64>,
    /// The termination text the modeling library would report
    pub termination_condition: Option<String>,
}

/// The result of one solve call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionRecord {
    pub status: SolveStatus,
    pub objective_value: Option<f64>,
    pub variables: BTreeMap<String, VariableRecord>,
    pub constraints: BTreeMap<String, ConstraintRecord>,
    pub solver: SolverMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SolutionRecord {
    /// A record for a solve that failed before or while running the solver
    pub fn error(message: impl Into<String>, solver: SolverMetadata) -> Self {
        SolutionRecord {
            status: SolveStatus::Error,
            objective_value: None,
            variables: BTreeMap::new(),
            constraints: BTreeMap::new(),
            solver,
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == SolveStatus::Error
    }

    /// Pretty printed JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| format!("{{\"status\":\"error\",\"message\":\"{err}\"}}"))
    }
}

/// A problem together with what the backend made of it
#[derive(Debug, Clone)]
pub struct SolvedModel {
    pub(crate) framework: Framework,
    pub(crate) problem: Problem,
    pub(crate) outcome: Result<BackendSolution, ResolutionError>,
}

impl SolvedModel {
    pub fn new(
        framework: Framework,
        problem: Problem,
        outcome: Result<BackendSolution, ResolutionError>,
    ) -> Self {
        SolvedModel {
            framework,
            problem,
            outcome,
        }
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    /// The status class of the backend outcome
    pub fn status(&self) -> SolveStatus {
        match &self.outcome {
            Ok(solution) => match solution.status() {
                SolutionStatus::Optimal => SolveStatus::Optimal,
                SolutionStatus::Feasible => SolveStatus::Feasible,
            },
            Err(ResolutionError::Infeasible) => SolveStatus::Infeasible,
            Err(ResolutionError::Unbounded) => SolveStatus::Unbounded,
            Err(_) => SolveStatus::Error,
        }
    }
}

/// The termination text the modeling library of `framework` reports for `status`
pub fn termination_text(framework: Framework, status: SolveStatus) -> &'static str {
    match framework {
        Framework::LinearExpression => pulp::status_text(status),
        Framework::ConstraintBased => pyomo::termination_condition(status),
    }
}

/// Build the record of a solved model. Calling it twice on the same input gives equal records.
pub fn normalize(solved: &SolvedModel, metadata: &SolverMetadata) -> SolutionRecord {
    let status = solved.status();
    let problem = &solved.problem;
    let solution = solved.outcome.as_ref().ok();

    let objective_value = solution.and_then(|s| problem.objective().and_then(|o| o.eval_with(s)));

    let variables = problem
        .variables()
        .iter()
        .map(|(var, def)| {
            let record = VariableRecord {
                value: solution.and_then(|s| s.value(*var)),
                lower_bound: def.lower_bound(),
                upper_bound: def.upper_bound(),
                category: def.category,
            };
            (def.name.clone(), record)
        })
        .collect();

    let constraints = problem
        .constraints()
        .iter()
        .enumerate()
        .map(|(i, constraint)| {
            let record = ConstraintRecord {
                sense: constraint.sense(),
                rhs: constraint.rhs(),
                expression: problem.display(constraint).to_string(),
            };
            (problem.constraint_name(i), record)
        })
        .collect();

    let message = match &solved.outcome {
        Err(err @ (ResolutionError::Other(_) | ResolutionError::Str(_))) => Some(err.to_string()),
        _ => None,
    };

    SolutionRecord {
        status,
        objective_value,
        variables,
        constraints,
        solver: SolverMetadata {
            termination_condition: Some(termination_text(solved.framework, status).to_string()),
            ..metadata.clone()
        },
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{variable, Expression, ProblemVariables};
    use crate::solvers::ObjectiveDirection;
    use fnv::FnvHashMap;
    use float_eq::assert_float_eq;

    fn solved(outcome: impl FnOnce(&Problem) -> Result<BackendSolution, ResolutionError>) -> SolvedModel {
        let mut store = ProblemVariables::new();
        let x = store.add(variable().name("x").min(0));
        let y = store.add(variable().name("y").min(0).max(4).category(Category::Integer));
        let problem = Problem::new(
            "p",
            ObjectiveDirection::Maximisation,
            Some(x * 3. + y * 2.),
            vec![(x * 1. + y * 1.).leq(Expression::from(5.)).set_name("cap".to_string())],
            &store,
            vec![x, y],
        );
        let outcome = outcome(&problem);
        SolvedModel::new(Framework::LinearExpression, problem, outcome)
    }

    fn metadata() -> SolverMetadata {
        SolverMetadata {
            name: "microlp".to_string(),
            requested: "cbc".to_string(),
            ..SolverMetadata::default()
        }
    }

    #[test]
    fn optimal_records_carry_values_and_bounds() {
        let model = solved(|p| Ok(BackendSolution::from_columns(SolutionStatus::Optimal, p, vec![5., 0.])));
        let record = normalize(&model, &metadata());
        assert_eq!(record.status, SolveStatus::Optimal);
        assert_float_eq!(record.objective_value.unwrap(), 15., abs <= 1e-9);
        let y = &record.variables["y"];
        assert_eq!((y.lower_bound, y.upper_bound), (Some(0.), Some(4.)));
        assert_eq!(y.category, Category::Integer);
        assert_eq!(record.variables["x"].upper_bound, None);
        let cap = &record.constraints["cap"];
        assert_eq!(cap.sense, Sense::LessOrEqual);
        assert_float_eq!(cap.rhs, 5., abs <= 1e-12);
        assert_eq!(cap.expression, "x + y <= 5");
        assert_eq!(record.solver.termination_condition.as_deref(), Some("Optimal"));
        assert_eq!(record.solver.requested, "cbc");
    }

    #[test]
    fn infeasible_is_a_status_not_an_error() {
        let record = normalize(&solved(|_| Err(ResolutionError::Infeasible)), &metadata());
        assert_eq!(record.status, SolveStatus::Infeasible);
        assert_eq!(record.objective_value, None);
        assert_eq!(record.variables["x"].value, None);
        assert!(record.message.is_none());
    }

    #[test]
    fn backend_failures_become_error_records() {
        let record = normalize(&solved(|_| Err(ResolutionError::Str("crashed".to_string()))), &metadata());
        assert!(record.is_error());
        assert_eq!(record.message.as_deref(), Some("crashed"));
        assert_eq!(record.solver.termination_condition.as_deref(), Some("Undefined"));
    }

    #[test]
    fn normalizing_twice_gives_equal_records() {
        let model = solved(|p| {
            let values: FnvHashMap<_, _> = p.variables().iter().map(|(v, _)| (*v, 1.)).collect();
            Ok(BackendSolution {
                status: SolutionStatus::Feasible,
                values,
            })
        });
        assert_eq!(normalize(&model, &metadata()), normalize(&model, &metadata()));
    }

    #[test]
    fn serializes_status_in_snake_case() {
        let record = SolutionRecord::error("boom", metadata());
        let json: serde_json::Value = serde_json::from_str(&record.to_json()).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "boom");
        assert!(json["variables"].as_object().unwrap().is_empty());
        assert!(json["objective_value"].is_null());
    }
}
