//! A [Variable] is the base element used to create an [Expression].
//! The goal of the solver is to find optimal values for all variables in a problem.
//!
//! Each variable has a [VariableDefinition] that sets its name, bounds and category.
use std::fmt::{Debug, Formatter};
use std::ops::{Div, Mul, Neg};

use serde::{Deserialize, Serialize};

use crate::model::expression::{Expression, LinearExpression};

/// A decision variable created by an executed model fragment.
///
/// ## Warning
/// `v1 == v2` is true only if the two variables represent the same object,
/// not if they have the same definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable {
    /// A variable is nothing more than an index into the `variables` field of a ProblemVariables.
    /// All the actual information about the variable (name, category, bounds, ...) is stored there.
    index: usize,
}

impl Variable {
    /// No one should use this method outside of [ProblemVariables]
    fn at(index: usize) -> Self {
        Self { index }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

/// An element that can be displayed if you give a variable display function
pub trait FormatWithVars {
    /// Write the element to the formatter. See [std::fmt::Display]
    fn format_with<FUN>(&self, f: &mut Formatter<'_>, variable_format: FUN) -> std::fmt::Result
    where
        FUN: FnMut(&mut Formatter<'_>, Variable) -> std::fmt::Result;

    /// Write the elements, naming the variables v0, v1, ... vn
    fn format_debug(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.format_with(f, |f, var| write!(f, "v{}", var.index()))
    }
}

/// Renders anything implementing [FormatWithVars] with the real variable names
pub struct Named<'a, T> {
    pub(crate) item: &'a T,
    pub(crate) variables: &'a ProblemVariables,
}

impl<T: FormatWithVars> std::fmt::Display for Named<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.item.format_with(f, |f, var| {
            write!(f, "{}", self.variables.name(var).unwrap_or("?"))
        })
    }
}

/// The domain of a variable, as reported in the solution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    /// A real-valued variable
    Continuous,
    /// An integer-valued variable
    Integer,
    /// An integer variable restricted to 0 and 1
    Binary,
}

impl Category {
    /// Whether the solver must enforce integrality
    pub fn is_integer(self) -> bool {
        !matches!(self, Category::Continuous)
    }
}

/// Defines the properties of a variable, such as its lower and upper bounds.
#[derive(Clone, PartialEq, Debug)]
pub struct VariableDefinition {
    pub(crate) name: String,
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) category: Category,
}

impl VariableDefinition {
    /// Creates an unbounded continuous linear variable
    pub fn new() -> Self {
        VariableDefinition {
            name: String::new(),
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            category: Category::Continuous,
        }
    }

    /// Set the name of the variable
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the lower bound of the variable
    pub fn min<N: Into<f64>>(mut self, min: N) -> Self {
        self.min = min.into();
        self
    }

    /// Set the higher bound of the variable
    pub fn max<N: Into<f64>>(mut self, max: N) -> Self {
        self.max = max.into();
        self
    }

    /// Set both the lower and higher bounds of the variable
    pub fn clamp<N1: Into<f64>, N2: Into<f64>>(self, min: N1, max: N2) -> Self {
        self.min(min).max(max)
    }

    /// Set the category. Binary variables get their bounds clamped to `[0, 1]`.
    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        if category == Category::Binary {
            self.min = self.min.max(0.);
            self.max = self.max.min(1.);
        }
        self
    }

    /// Lower bound, `None` when unbounded below
    pub fn lower_bound(&self) -> Option<f64> {
        Some(self.min).filter(|b| b.is_finite())
    }

    /// Upper bound, `None` when unbounded above
    pub fn upper_bound(&self) -> Option<f64> {
        Some(self.max).filter(|b| b.is_finite())
    }
}

/// Creates an unbounded continuous linear variable
impl Default for VariableDefinition {
    fn default() -> Self {
        VariableDefinition::new()
    }
}

/// Returns an anonymous unbounded continuous variable definition
pub fn variable() -> VariableDefinition {
    VariableDefinition::default()
}

/// All the variables created while a fragment runs, whatever object owns them.
#[derive(Default, Clone, Debug)]
pub struct ProblemVariables {
    variables: Vec<VariableDefinition>,
}

impl ProblemVariables {
    /// Create an empty list of variables
    pub fn new() -> Self {
        ProblemVariables { variables: vec![] }
    }

    /// Add a variable with the given definition
    pub fn add(&mut self, var_def: VariableDefinition) -> Variable {
        let index = self.variables.len();
        self.variables.push(var_def);
        Variable::at(index)
    }

    /// The definition of a variable
    pub fn definition(&self, var: Variable) -> Option<&VariableDefinition> {
        self.variables.get(var.index())
    }

    pub(crate) fn definition_mut(&mut self, var: Variable) -> Option<&mut VariableDefinition> {
        self.variables.get_mut(var.index())
    }

    /// The name of a variable
    pub fn name(&self, var: Variable) -> Option<&str> {
        self.definition(var).map(|def| def.name.as_str())
    }

    /// Iterates over the couples of variables with their properties
    pub fn iter_variables_with_def(&self) -> impl Iterator<Item = (Variable, &VariableDefinition)> {
        self.variables
            .iter()
            .enumerate()
            .map(|(i, def)| (Variable::at(i), def))
    }

    /// The number of variables
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Returns true when no variables have been added
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl<N: Into<f64>> Mul<N> for Variable {
    type Output = Expression;

    fn mul(self, rhs: N) -> Self::Output {
        let mut expr = Expression::default();
        expr.add_linear_term(self, rhs.into());
        expr
    }
}

impl Mul<Variable> for f64 {
    type Output = Expression;

    fn mul(self, rhs: Variable) -> Self::Output {
        rhs.mul(self)
    }
}

impl Div<f64> for Variable {
    type Output = Expression;
    fn div(self, rhs: f64) -> Self::Output {
        self * (1. / rhs)
    }
}

impl Neg for Variable {
    type Output = Expression;

    fn neg(self) -> Self::Output {
        -Expression::from(self)
    }
}

impl From<Variable> for Expression {
    fn from(var: Variable) -> Self {
        let mut linear = LinearExpression::default();
        linear.coefficients.insert(var, 1.);
        Expression {
            linear,
            constant: 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_category_clamps_bounds() {
        let def = variable().name("b").category(Category::Binary);
        assert_eq!((def.min, def.max), (0., 1.));
        assert_eq!(def.lower_bound(), Some(0.));
    }

    #[test]
    fn infinite_bounds_are_reported_as_absent() {
        let def = variable().min(0);
        assert_eq!(def.lower_bound(), Some(0.));
        assert_eq!(def.upper_bound(), None);
    }

    #[test]
    fn variables_are_distinct_even_with_equal_definitions() {
        let mut vars = ProblemVariables::new();
        let v1 = vars.add(variable().clamp(1, 8));
        let v2 = vars.add(variable().clamp(1, 8));
        assert_ne!(v1, v2);
        assert_eq!(vars.len(), 2);
    }
}
