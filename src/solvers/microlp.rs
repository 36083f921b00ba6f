//! A solver that uses [microlp](https://docs.rs/microlp), a pure rust solver.
//! It is linked into the binary, so it is always available; it is the fallback
//! when the requested backend cannot be reached.

use microlp::Error;

use crate::model::{Category, Problem, Sense, VariableDefinition};
use crate::solvers::{
    BackendSolution, ObjectiveDirection, ResolutionError, SolutionStatus, SolverBackend,
};

/// Distance from an integer under which a value of an integer column is snapped to it
const INTEGRALITY_TOLERANCE: f64 = 1e-6;

/// The [microlp](https://docs.rs/microlp) solver
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroLp;

/// Integer bounds microlp can represent. An infinite bound saturates to the `i32` range,
/// a finite one outside of it gives `None`.
fn integer_bounds(def: &VariableDefinition) -> Option<(i32, i32)> {
    let bound = |value: f64, unbounded: i32| -> Option<i32> {
        if value.is_infinite() {
            Some(unbounded)
        } else if value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX) {
            Some(value as i32)
        } else {
            None
        }
    };
    Some((bound(def.min.ceil(), i32::MIN)?, bound(def.max.floor(), i32::MAX)?))
}

fn add_column(problem: &mut microlp::Problem, coeff: f64, def: &VariableDefinition) -> microlp::Variable {
    match def.category {
        Category::Binary if def.min <= 0. && def.max >= 1. => problem.add_binary_var(coeff),
        Category::Integer | Category::Binary => match integer_bounds(def) {
            Some(bounds) => problem.add_integer_var(coeff, bounds),
            // bounds too wide for microlp, solved as a relaxation
            None => problem.add_var(coeff, (def.min, def.max)),
        },
        Category::Continuous => problem.add_var(coeff, (def.min, def.max)),
    }
}

impl SolverBackend for MicroLp {
    fn name(&self) -> &'static str {
        "microlp"
    }

    fn solve(&self, to_solve: &Problem) -> Result<BackendSolution, ResolutionError> {
        let mut problem = microlp::Problem::new(match to_solve.direction() {
            ObjectiveDirection::Maximisation => microlp::OptimizationDirection::Maximize,
            ObjectiveDirection::Minimisation => microlp::OptimizationDirection::Minimize,
        });
        let variables: Vec<(microlp::Variable, bool)> = to_solve
            .variables()
            .iter()
            .map(|(var, def)| {
                let coeff = to_solve
                    .objective()
                    .map(|objective| objective.coefficient(*var))
                    .unwrap_or(0.);
                (add_column(&mut problem, coeff, def), def.category.is_integer())
            })
            .collect();

        let columns = to_solve.columns();
        for constraint in to_solve.constraints() {
            let op = match constraint.sense() {
                Sense::LessOrEqual => microlp::ComparisonOp::Le,
                Sense::GreaterOrEqual => microlp::ComparisonOp::Ge,
                Sense::Equal => microlp::ComparisonOp::Eq,
            };
            let mut linear_expr = microlp::LinearExpr::empty();
            for (var, coefficient) in constraint.expression().terms() {
                linear_expr.add(variables[columns[&var]].0, coefficient);
            }
            problem.add_constraint(linear_expr, op, constraint.rhs());
        }

        let solution = problem.solve()?;
        let values: Vec<f64> = variables
            .iter()
            .map(|&(column, integer)| {
                let value = solution[column];
                let rounded = value.round();
                if integer && (value - rounded).abs() < INTEGRALITY_TOLERANCE {
                    rounded
                } else {
                    value
                }
            })
            .collect();
        Ok(BackendSolution::from_columns(
            SolutionStatus::Optimal,
            to_solve,
            values,
        ))
    }
}

impl From<microlp::Error> for ResolutionError {
    fn from(microlp_error: Error) -> Self {
        match microlp_error {
            microlp::Error::Unbounded => Self::Unbounded,
            microlp::Error::Infeasible => Self::Infeasible,
            microlp::Error::InternalError(s) => Self::Str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{variable, Category, Expression, ProblemVariables};
    use crate::solvers::Solution;

    #[test]
    fn can_solve_easy() {
        let mut vars = ProblemVariables::new();
        let x = vars.add(variable().name("x").clamp(0, 2));
        let y = vars.add(variable().name("y").clamp(1, 3));
        let problem = Problem::new(
            "easy",
            ObjectiveDirection::Maximisation,
            Some(x * 1. + y * 1.),
            vec![(x * 2. + y * 1.).leq(Expression::from(4.))],
            &vars,
            vec![x, y],
        );
        let solution = MicroLp.solve(&problem).unwrap();
        assert_eq!((solution.value(x), solution.value(y)), (Some(0.5), Some(3.)));
    }

    #[test]
    fn reports_infeasibility() {
        let mut vars = ProblemVariables::new();
        let x = vars.add(variable().name("x").min(0));
        let problem = Problem::new(
            "infeasible",
            ObjectiveDirection::Minimisation,
            Some(x * 1.),
            vec![(x * 1.).leq(Expression::from(-1.))],
            &vars,
            vec![x],
        );
        assert_eq!(MicroLp.solve(&problem), Err(ResolutionError::Infeasible));
    }

    #[test]
    fn greater_or_equal_constraints() {
        let mut vars = ProblemVariables::new();
        let x = vars.add(variable().name("x").category(Category::Integer).clamp(0, 10));
        let problem = Problem::new(
            "geq",
            ObjectiveDirection::Minimisation,
            Some(x * 1.),
            vec![(x * 1.).geq(Expression::from(3.))],
            &vars,
            vec![x],
        );
        let solution = MicroLp.solve(&problem).unwrap();
        assert_eq!(solution.value(x), Some(3.));
    }

    #[test]
    fn integer_variables_with_a_fractional_relaxation() {
        let mut vars = ProblemVariables::new();
        let x = vars.add(variable().name("x").category(Category::Integer).clamp(0, 10));
        let problem = Problem::new(
            "round up",
            ObjectiveDirection::Minimisation,
            Some(x * 1.),
            vec![(x * 3.).geq(Expression::from(4.))],
            &vars,
            vec![x],
        );
        let solution = MicroLp.solve(&problem).unwrap();
        assert_eq!(solution.value(x), Some(2.));
    }

    #[test]
    fn two_integers_sharing_a_constraint() {
        let mut vars = ProblemVariables::new();
        let x = vars.add(variable().name("x").category(Category::Integer).min(0));
        let y = vars.add(variable().name("y").category(Category::Integer).min(0));
        let problem = Problem::new(
            "pair",
            ObjectiveDirection::Maximisation,
            Some(x * 1. + y * 1.),
            vec![(x * 2. + y * 2.).leq(Expression::from(3.))],
            &vars,
            vec![x, y],
        );
        let solution = MicroLp.solve(&problem).unwrap();
        let (x, y) = (solution.value(x).unwrap(), solution.value(y).unwrap());
        assert_eq!(x + y, 1.);
        assert_eq!(x.fract(), 0.);
        assert_eq!(y.fract(), 0.);
    }

    #[test]
    fn binary_knapsack() {
        let weights = [5., 4., 6., 3.];
        let values = [10., 40., 30., 50.];
        let mut vars = ProblemVariables::new();
        let items: Vec<_> = (0..weights.len())
            .map(|i| vars.add(variable().name(format!("take_{i}")).category(Category::Binary).clamp(0, 1)))
            .collect();
        let value: Expression = items.iter().zip(values).map(|(&item, v)| item * v).sum();
        let weight: Expression = items.iter().zip(weights).map(|(&item, w)| item * w).sum();
        let problem = Problem::new(
            "knapsack",
            ObjectiveDirection::Maximisation,
            Some(value),
            vec![weight.leq(Expression::from(10.))],
            &vars,
            items.clone(),
        );
        let solution = MicroLp.solve(&problem).unwrap();
        let taken: Vec<f64> = items.iter().map(|&item| solution.value(item).unwrap()).collect();
        // items 1 and 3 weigh 7 and are worth 90
        assert_eq!(taken, vec![0., 1., 0., 1.]);
    }

    #[test]
    fn integer_bounds_saturate_or_relax() {
        let def = |min: f64, max: f64| VariableDefinition {
            name: "n".to_string(),
            min,
            max,
            category: Category::Integer,
        };
        assert_eq!(integer_bounds(&def(0.5, 7.2)), Some((1, 7)));
        assert_eq!(integer_bounds(&def(0., f64::INFINITY)), Some((0, i32::MAX)));
        assert_eq!(integer_bounds(&def(f64::NEG_INFINITY, 3.)), Some((i32::MIN, 3)));
        assert_eq!(integer_bounds(&def(-1e12, 0.)), None);
    }
}
