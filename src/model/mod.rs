//! The linear model that executed fragments build: variables, affine expressions,
//! constraints and the problem handed to a solver backend.
pub mod constraint;
pub mod expression;
pub mod problem;
pub mod variable;

pub use constraint::{Constraint, Sense};
pub use expression::{Expression, LinearExpression};
pub use problem::Problem;
pub use variable::{variable, Category, FormatWithVars, ProblemVariables, Variable, VariableDefinition};
