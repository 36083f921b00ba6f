//! A solver that uses [highs](https://docs.rs/highs), a parallel C++ solver.
//! Only compiled in with the `highs` feature.

use highs::HighsModelStatus;
use tracing::debug;

use crate::model::{Problem, Sense};
use crate::solvers::{
    BackendSolution, ObjectiveDirection, ResolutionError, SolutionStatus, SolverBackend,
};

/// The [highs](https://docs.rs/highs) solver
#[derive(Debug, Clone, Default)]
pub struct Highs {
    time_limit: Option<f64>,
    verbose: bool,
}

impl Highs {
    /// Stop the search after the given number of seconds
    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    /// Sets whether or not HiGHS should display verbose logging information to the console
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl SolverBackend for Highs {
    fn name(&self) -> &'static str {
        "highs"
    }

    fn solve(&self, to_solve: &Problem) -> Result<BackendSolution, ResolutionError> {
        let mut highs_problem = highs::RowProblem::default();
        let sense = match to_solve.direction() {
            ObjectiveDirection::Maximisation => highs::Sense::Maximise,
            ObjectiveDirection::Minimisation => highs::Sense::Minimise,
        };
        let columns: Vec<highs::Col> = to_solve
            .variables()
            .iter()
            .map(|(var, def)| {
                let col_factor = to_solve
                    .objective()
                    .map(|objective| objective.coefficient(*var))
                    .unwrap_or(0.);
                highs_problem.add_column_with_integrality(
                    col_factor,
                    def.min..def.max,
                    def.category.is_integer(),
                )
            })
            .collect();

        let positions = to_solve.columns();
        for constraint in to_solve.constraints() {
            let bound = constraint.rhs();
            let factors: Vec<(highs::Col, f64)> = constraint
                .expression()
                .terms()
                .into_iter()
                .map(|(variable, factor)| (columns[positions[&variable]], factor))
                .collect();
            match constraint.sense() {
                Sense::LessOrEqual => highs_problem.add_row(..=bound, factors),
                Sense::GreaterOrEqual => highs_problem.add_row(bound.., factors),
                Sense::Equal => highs_problem.add_row(bound..=bound, factors),
            }
        }

        let mut model = highs_problem.optimise(sense);
        if !self.verbose {
            model.set_option(&b"output_flag"[..], false);
        }
        if let Some(seconds) = self.time_limit {
            model.set_option(&b"time_limit"[..], seconds);
        }
        debug!(columns = columns.len() as u64, "running highs");

        let solved = model.solve();
        let status = match solved.status() {
            HighsModelStatus::NotSet => return Err(ResolutionError::Other("NotSet")),
            HighsModelStatus::LoadError => return Err(ResolutionError::Other("LoadError")),
            HighsModelStatus::ModelError => return Err(ResolutionError::Other("ModelError")),
            HighsModelStatus::PresolveError => {
                return Err(ResolutionError::Other("PresolveError"))
            }
            HighsModelStatus::SolveError => return Err(ResolutionError::Other("SolveError")),
            HighsModelStatus::PostsolveError => {
                return Err(ResolutionError::Other("PostsolveError"))
            }
            HighsModelStatus::ModelEmpty => return Err(ResolutionError::Other("ModelEmpty")),
            HighsModelStatus::Infeasible => return Err(ResolutionError::Infeasible),
            HighsModelStatus::Unbounded => return Err(ResolutionError::Unbounded),
            HighsModelStatus::UnboundedOrInfeasible => return Err(ResolutionError::Infeasible),
            HighsModelStatus::Optimal => SolutionStatus::Optimal,
            _stopped_early => SolutionStatus::Feasible,
        };
        let solution = solved.get_solution();
        Ok(BackendSolution::from_columns(
            status,
            to_solve,
            solution.columns().iter().copied(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{variable, Expression, ProblemVariables};
    use crate::solvers::Solution;
    use float_eq::assert_float_eq;

    #[test]
    fn solves_a_small_lp() {
        let mut vars = ProblemVariables::new();
        let x = vars.add(variable().name("x").clamp(0, 2));
        let y = vars.add(variable().name("y").clamp(1, 3));
        let problem = Problem::new(
            "small",
            ObjectiveDirection::Maximisation,
            Some(x * 1. + y * 1.),
            vec![(x * 2. + y * 1.).leq(Expression::from(4.))],
            &vars,
            vec![x, y],
        );
        let solution = Highs::default().solve(&problem).unwrap();
        assert_float_eq!(solution.value(x).unwrap(), 0.5, abs <= 1e-6);
        assert_float_eq!(solution.value(y).unwrap(), 3., abs <= 1e-6);
    }
}
