//! Solver backends. Each backend translates a [Problem] into its own representation,
//! runs, and reports the values it found for every variable of the problem.
#[cfg(feature = "highs")]
pub mod highs;
#[cfg(feature = "lp-solvers")]
pub mod lp_solvers;
pub mod microlp;
pub mod registry;

use fnv::FnvHashMap as HashMap;
use thiserror::Error;

use crate::model::{Problem, Variable};

pub use registry::{BackendKind, ExternalSolver, ResolvedSolver, SolverRegistry, SolverSpec};

/// Whether to search for the variable values that give the highest
/// or the lowest value of the objective function.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ObjectiveDirection {
    /// Find the highest objective value
    Maximisation,
    /// Find the lowest objective value
    Minimisation,
}

/// Represents an error that occurred when solving a problem
#[derive(Debug, PartialEq, Clone, Error)]
pub enum ResolutionError {
    /// The problem is [unbounded](https://www.matem.unam.mx/~omar/math340/unbounded.html).
    /// It doesn't have a finite optimal values for its variables.
    /// The objective can be made infinitely large without violating any constraints.
    #[error("Unbounded")]
    Unbounded,
    ///  There exists no solution that satisfies all of the constraints
    #[error("Infeasible")]
    Infeasible,
    /// Another error occurred
    #[error("{0}")]
    Other(&'static str),
    /// An error string
    #[error("{0}")]
    Str(String),
}

/// How good the values returned by a backend are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolutionStatus {
    /// Proven optimal
    Optimal,
    /// Feasible, but the solver stopped early (time limit, gap limit)
    Feasible,
}

/// A problem solution
pub trait Solution {
    /// The value of a variable of the problem, if the solution assigns one
    fn value(&self, variable: Variable) -> Option<f64>;
}

impl Solution for HashMap<Variable, f64> {
    fn value(&self, variable: Variable) -> Option<f64> {
        self.get(&variable).copied()
    }
}

/// The values a backend found
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSolution {
    pub(crate) status: SolutionStatus,
    pub(crate) values: HashMap<Variable, f64>,
}

impl BackendSolution {
    /// Pair every variable of `problem`, in column order, with the value at the same position
    pub(crate) fn from_columns(
        status: SolutionStatus,
        problem: &Problem,
        columns: impl IntoIterator<Item = f64>,
    ) -> Self {
        let values = problem
            .variables()
            .iter()
            .map(|(var, _)| *var)
            .zip(columns)
            .collect();
        BackendSolution { status, values }
    }

    /// How the backend qualified the solution
    pub fn status(&self) -> SolutionStatus {
        self.status
    }
}

impl Solution for BackendSolution {
    fn value(&self, variable: Variable) -> Option<f64> {
        self.values.get(&variable).copied()
    }
}

/// A numerical solver that can be handed a [Problem].
pub trait SolverBackend {
    /// The name reported in solution records
    fn name(&self) -> &'static str;

    /// Find the solution for the problem
    fn solve(&self, problem: &Problem) -> Result<BackendSolution, ResolutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{variable, Expression, ProblemVariables};

    #[test]
    fn columns_are_matched_in_order() {
        let mut store = ProblemVariables::new();
        let a = store.add(variable().name("a"));
        let b = store.add(variable().name("b"));
        let problem = Problem::new(
            "p",
            ObjectiveDirection::Minimisation,
            Some(a * 1. + b * 1.),
            vec![(a * 1.).geq(Expression::from(1.))],
            &store,
            vec![a, b],
        );
        let solution = BackendSolution::from_columns(SolutionStatus::Optimal, &problem, vec![1., 0.]);
        assert_eq!(solution.value(a), Some(1.));
        assert_eq!(solution.value(b), Some(0.));
    }
}
