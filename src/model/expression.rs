use std::fmt::{Debug, Formatter};
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

use fnv::FnvHashMap as HashMap;

use crate::model::constraint::{Constraint, Sense};
use crate::model::variable::{FormatWithVars, Variable};
use crate::solvers::Solution;

/// An linear expression without a constant component
#[derive(Clone, Default, PartialEq)]
pub struct LinearExpression {
    pub(crate) coefficients: HashMap<Variable, f64>,
}

impl LinearExpression {
    /// Coefficients sorted by variable creation order, zero terms dropped
    pub fn sorted_terms(&self) -> Vec<(Variable, f64)> {
        let mut terms: Vec<(Variable, f64)> = self
            .coefficients
            .iter()
            .filter(|(_, &c)| c != 0.)
            .map(|(&v, &c)| (v, c))
            .collect();
        terms.sort_by_key(|(v, _)| *v);
        terms
    }
}

impl FormatWithVars for LinearExpression {
    fn format_with<FUN>(&self, f: &mut Formatter<'_>, mut variable_format: FUN) -> std::fmt::Result
    where
        FUN: FnMut(&mut Formatter<'_>, Variable) -> std::fmt::Result,
    {
        let mut first = true;
        for (var, coeff) in self.sorted_terms() {
            let magnitude = if first {
                first = false;
                if coeff < 0. {
                    write!(f, "-")?;
                }
                coeff.abs()
            } else {
                write!(f, " {} ", if coeff < 0. { "-" } else { "+" })?;
                coeff.abs()
            };
            if (magnitude - 1.).abs() > f64::EPSILON {
                write!(f, "{}*", magnitude)?;
            }
            variable_format(f, var)?;
        }
        if first {
            write!(f, "0")?;
        }
        Ok(())
    }
}

impl Debug for LinearExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearExpression")
            .field("coefficients", &self.coefficients)
            .finish()
    }
}

/// Represents an affine expression, such as `2x + 3` or `x + y + z`
#[derive(Clone, Default, PartialEq)]
pub struct Expression {
    pub(crate) linear: LinearExpression,
    pub(crate) constant: f64,
}

impl Debug for Expression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.format_debug(f)
    }
}

impl FormatWithVars for Expression {
    fn format_with<FUN>(&self, f: &mut Formatter<'_>, variable_format: FUN) -> std::fmt::Result
    where
        FUN: FnMut(&mut Formatter<'_>, Variable) -> std::fmt::Result,
    {
        let has_terms = self.linear.coefficients.values().any(|&c| c != 0.);
        if has_terms {
            self.linear.format_with(f, variable_format)?;
            if self.constant > 0. {
                write!(f, " + {}", self.constant)?;
            } else if self.constant < 0. {
                write!(f, " - {}", -self.constant)?;
            }
            Ok(())
        } else {
            write!(f, "{}", self.constant)
        }
    }
}

impl Expression {
    /// Create an expression that has the value 0, but has memory allocated
    /// for `capacity` coefficients.
    pub fn with_capacity(capacity: usize) -> Self {
        Expression {
            linear: LinearExpression {
                coefficients: HashMap::with_capacity_and_hasher(capacity, Default::default()),
            },
            constant: 0.0,
        }
    }

    /// The constant part of the expression
    pub fn constant(&self) -> f64 {
        self.constant
    }

    /// True when no variable has a non-zero coefficient
    pub fn is_constant(&self) -> bool {
        self.linear.coefficients.values().all(|&c| c == 0.)
    }

    /// The coefficient of a variable, 0 if absent
    pub fn coefficient(&self, var: Variable) -> f64 {
        self.linear.coefficients.get(&var).copied().unwrap_or(0.)
    }

    /// The variables appearing with a non-zero coefficient
    pub fn variables(&self) -> impl Iterator<Item = Variable> + '_ {
        self.linear
            .coefficients
            .iter()
            .filter(|(_, &c)| c != 0.)
            .map(|(&v, _)| v)
    }

    /// The non-zero terms, sorted by variable
    pub fn terms(&self) -> Vec<(Variable, f64)> {
        self.linear.sorted_terms()
    }

    /// Creates a constraint `self <sense> rhs`
    pub fn compare(self, sense: Sense, rhs: Expression) -> Constraint {
        Constraint::new(self - rhs, sense)
    }

    /// Creates a constraint indicating that this expression
    /// is lesser than or equal to the right hand side
    pub fn leq(self, rhs: Expression) -> Constraint {
        self.compare(Sense::LessOrEqual, rhs)
    }

    /// Creates a constraint indicating that this expression
    /// is greater than or equal to the right hand side
    pub fn geq(self, rhs: Expression) -> Constraint {
        self.compare(Sense::GreaterOrEqual, rhs)
    }

    /// Creates a constraint indicating that this expression
    /// is equal to the right hand side
    pub fn equal(self, rhs: Expression) -> Constraint {
        self.compare(Sense::Equal, rhs)
    }

    /// Performs self = self + (a * b)
    #[inline]
    pub fn add_mul(&mut self, a: f64, b: &Expression) {
        for (&var, &value) in &b.linear.coefficients {
            *self.linear.coefficients.entry(var).or_default() += a * value
        }
        self.constant += a * b.constant;
    }

    /// Add a linear term to this expression
    pub fn add_linear_term(&mut self, var: Variable, coefficient: f64) {
        *self.linear.coefficients.entry(var).or_default() += coefficient;
    }

    /// Evaluate the expression. `None` when a variable has no value in the solution.
    pub fn eval_with<S: Solution + ?Sized>(&self, values: &S) -> Option<f64> {
        self.linear
            .coefficients
            .iter()
            .try_fold(self.constant, |acc, (&var, &coefficient)| {
                if coefficient == 0. {
                    Some(acc)
                } else {
                    values.value(var).map(|v| acc + coefficient * v)
                }
            })
    }
}

impl From<f64> for Expression {
    fn from(constant: f64) -> Self {
        Expression {
            linear: LinearExpression::default(),
            constant,
        }
    }
}

impl From<i32> for Expression {
    fn from(constant: i32) -> Self {
        Expression::from(f64::from(constant))
    }
}

impl AddAssign<&Expression> for Expression {
    fn add_assign(&mut self, rhs: &Expression) {
        self.add_mul(1., rhs)
    }
}

impl AddAssign<Expression> for Expression {
    fn add_assign(&mut self, rhs: Expression) {
        *self += &rhs
    }
}

impl SubAssign<&Expression> for Expression {
    fn sub_assign(&mut self, rhs: &Expression) {
        self.add_mul(-1., rhs)
    }
}

impl SubAssign<Expression> for Expression {
    fn sub_assign(&mut self, rhs: Expression) {
        *self -= &rhs
    }
}

impl MulAssign<f64> for Expression {
    fn mul_assign(&mut self, rhs: f64) {
        self.constant *= rhs;
        for value in self.linear.coefficients.values_mut() {
            *value *= rhs
        }
    }
}

impl Add for Expression {
    type Output = Expression;

    fn add(mut self, rhs: Expression) -> Self::Output {
        self += rhs;
        self
    }
}

impl Sub for Expression {
    type Output = Expression;

    fn sub(mut self, rhs: Expression) -> Self::Output {
        self -= rhs;
        self
    }
}

impl Mul<f64> for Expression {
    type Output = Expression;

    fn mul(mut self, rhs: f64) -> Self::Output {
        self *= rhs;
        self
    }
}

impl Div<f64> for Expression {
    type Output = Expression;

    fn div(self, rhs: f64) -> Self::Output {
        self * (1. / rhs)
    }
}

impl Neg for Expression {
    type Output = Expression;

    fn neg(self) -> Self::Output {
        self * -1.
    }
}

impl std::iter::Sum for Expression {
    fn sum<I: Iterator<Item = Expression>>(iter: I) -> Self {
        let mut res = Expression::default();
        for expr in iter {
            res += expr
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::variable::{variable, ProblemVariables};

    fn render(expr: &Expression) -> String {
        struct Show<'a>(&'a Expression);
        impl std::fmt::Display for Show<'_> {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                self.0.format_debug(f)
            }
        }
        Show(expr).to_string()
    }

    #[test]
    fn arithmetic_merges_terms() {
        let mut vars = ProblemVariables::new();
        let a = vars.add(variable());
        let b = vars.add(variable());
        let expr = a * 2. + (b * 3. - a * 2.) + Expression::from(4.);
        assert_eq!(expr.coefficient(a), 0.);
        assert_eq!(expr.coefficient(b), 3.);
        assert_eq!(expr.constant(), 4.);
        assert_eq!(expr.variables().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn format_is_sorted_and_signed() {
        let mut vars = ProblemVariables::new();
        let a = vars.add(variable());
        let b = vars.add(variable());
        assert_eq!(render(&(b * -7. + a * 5.)), "5*v0 - 7*v1");
        assert_eq!(render(&(a * 1. - Expression::from(2.))), "v0 - 2");
        assert_eq!(render(&Expression::default()), "0");
    }

    #[test]
    fn evaluation_needs_every_value() {
        let mut vars = ProblemVariables::new();
        let a = vars.add(variable());
        let b = vars.add(variable());
        let expr = a * 2. + b * 1. + Expression::from(1.);
        let mut values: HashMap<Variable, f64> = HashMap::default();
        values.insert(a, 3.);
        assert_eq!(expr.eval_with(&values), None);
        values.insert(b, 1.);
        assert_eq!(expr.eval_with(&values), Some(8.));
    }
}
