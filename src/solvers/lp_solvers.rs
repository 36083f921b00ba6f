//! This module allows solving problems with external solver binaries (cbc, glpk, gurobi, cplex).
//! Contrarily to other solver modules, this one doesn't require linking the program to any solver.
//! A solver binary will need to be present on the user's computer at runtime; the registry
//! probes for it before choosing this backend.

use std::cmp::Ordering;

use lp_solvers::lp_format::LpObjective;
use lp_solvers::problem::StrExpression;
use lp_solvers::solvers::{
    CbcSolver, Cplex, GlpkSolver, GurobiSolver, SolverTrait, Status, WithMaxSeconds,
};
use lp_solvers::util::UniqueNameGenerator;
use tracing::debug;

use crate::model::{Expression, Problem, Sense};
use crate::solvers::{
    BackendSolution, ObjectiveDirection, ResolutionError, SolutionStatus, SolverBackend,
};

/// An external solver, driven through an LP file
pub struct LpSolver<T: SolverTrait> {
    solver: T,
    name: &'static str,
}

impl<T: SolverTrait> LpSolver<T> {
    /// Wrap an `lp-solvers` solver under the name reported in solution records
    pub fn new(solver: T, name: &'static str) -> Self {
        LpSolver { solver, name }
    }
}

/// The cbc command line solver, with an optional time limit in seconds
pub fn cbc(time_limit: Option<f64>) -> LpSolver<CbcSolver> {
    let solver = match time_limit {
        Some(seconds) => CbcSolver::new().with_max_seconds(seconds.ceil() as u32),
        None => CbcSolver::new(),
    };
    LpSolver::new(solver, "cbc")
}

/// The glpsol command line solver
pub fn glpk() -> LpSolver<GlpkSolver> {
    LpSolver::new(GlpkSolver::new(), "glpk")
}

/// The gurobi_cl command line solver
pub fn gurobi() -> LpSolver<GurobiSolver> {
    LpSolver::new(GurobiSolver::new(), "gurobi")
}

/// The cplex command line solver
pub fn cplex() -> LpSolver<Cplex> {
    LpSolver::new(Cplex::default(), "cplex")
}

impl<T: SolverTrait> SolverBackend for LpSolver<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn solve(&self, problem: &Problem) -> Result<BackendSolution, ResolutionError> {
        let lp_problem = to_lp_problem(problem);
        debug!(
            solver = self.name,
            variables = lp_problem.variables.len() as u64,
            constraints = lp_problem.constraints.len() as u64,
            "running external solver"
        );
        let map = self.solver.run(&lp_problem).map_err(ResolutionError::Str)?;
        let status = match map.status {
            Status::Infeasible => return Err(ResolutionError::Infeasible),
            Status::Unbounded => return Err(ResolutionError::Unbounded),
            Status::NotSolved => return Err(ResolutionError::Other("unknown error: not solved")),
            Status::Optimal => SolutionStatus::Optimal,
            _ => SolutionStatus::Feasible,
        };
        let values: Vec<f64> = lp_problem
            .variables
            .iter()
            .map(|v| f64::from(*map.results.get(&v.name).unwrap_or(&0.)))
            .collect();
        Ok(BackendSolution::from_columns(status, problem, values))
    }
}

fn to_lp_problem(problem: &Problem) -> lp_solvers::problem::Problem {
    let sense = match problem.direction() {
        ObjectiveDirection::Maximisation => LpObjective::Maximize,
        ObjectiveDirection::Minimisation => LpObjective::Minimize,
    };
    let mut gen = UniqueNameGenerator::default();
    let variables: Vec<lp_solvers::problem::Variable> = problem
        .variables()
        .iter()
        .map(|(_, def)| lp_solvers::problem::Variable {
            name: gen.add_variable(&def.name).to_string(),
            is_integer: def.category.is_integer(),
            lower_bound: def.min,
            upper_bound: def.max,
        })
        .collect();
    let columns = problem.columns();
    let coefficients_str = |expr: &Expression| {
        StrExpression(
            expr.terms()
                .into_iter()
                .map(|(var, coeff)| format!("{:+} {}", coeff, variables[columns[&var]].name))
                .collect::<Vec<String>>()
                .join(" "),
        )
    };
    let objective = problem
        .objective()
        .map(coefficients_str)
        .unwrap_or_else(|| StrExpression(String::new()));
    let constraints = problem
        .constraints()
        .iter()
        .map(|c| lp_solvers::lp_format::Constraint {
            lhs: coefficients_str(c.expression()),
            operator: match c.sense() {
                Sense::LessOrEqual => Ordering::Less,
                Sense::GreaterOrEqual => Ordering::Greater,
                Sense::Equal => Ordering::Equal,
            },
            rhs: c.rhs(),
        })
        .collect();
    lp_solvers::problem::Problem {
        name: sanitize(problem.name()),
        sense,
        objective,
        variables,
        constraints,
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "autoopt_problem".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{variable, ProblemVariables};

    fn problem(objective: Expression, store: &ProblemVariables) -> Problem {
        let members: Vec<_> = store.iter_variables_with_def().map(|(v, _)| v).collect();
        Problem::new(
            "my problem",
            ObjectiveDirection::Minimisation,
            Some(objective),
            vec![],
            store,
            members,
        )
    }

    #[test]
    fn coefficient_formatting_pos_neg() {
        let mut store = ProblemVariables::new();
        let a = store.add(variable().name("a"));
        let b = store.add(variable().name("b"));
        let lp = to_lp_problem(&problem(a * 1. - b * 2., &store));
        assert_eq!(lp.objective.0, "+1 a -2 b");
        assert_eq!(lp.name, "my_problem");
    }

    #[test]
    fn external_solvers_report_their_names() {
        assert_eq!(cbc(Some(2.5)).name(), "cbc");
        assert_eq!(glpk().name(), "glpk");
        assert_eq!(gurobi().name(), "gurobi");
        assert_eq!(cplex().name(), "cplex");
    }

    #[test]
    fn constraint_senses_are_preserved() {
        let mut store = ProblemVariables::new();
        let a = store.add(variable().name("a"));
        let mut p = problem(a * 1., &store);
        p.constraints.push((a * 3.).geq(Expression::from(6.)));
        let lp = to_lp_problem(&p);
        assert_eq!(lp.constraints[0].operator, Ordering::Greater);
        assert_eq!(lp.constraints[0].rhs, 6.);
        assert_eq!(lp.constraints[0].lhs.0, "+3 a");
    }
}
