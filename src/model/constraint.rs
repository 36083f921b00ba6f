//! Constraints define the inequalities that must hold in the solution.
use core::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::model::expression::Expression;
use crate::model::variable::{FormatWithVars, Variable};

/// The comparison sense of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    /// `expression <= rhs`
    #[serde(rename = "≤")]
    LessOrEqual,
    /// `expression >= rhs`
    #[serde(rename = "≥")]
    GreaterOrEqual,
    /// `expression == rhs`
    #[serde(rename = "=")]
    Equal,
}

impl Sense {
    /// The ascii operator used when rendering an expression
    pub fn operator(self) -> &'static str {
        match self {
            Sense::LessOrEqual => "<=",
            Sense::GreaterOrEqual => ">=",
            Sense::Equal => "==",
        }
    }

    /// The mathematical symbol reported in solution records
    pub fn symbol(self) -> &'static str {
        match self {
            Sense::LessOrEqual => "≤",
            Sense::GreaterOrEqual => "≥",
            Sense::Equal => "=",
        }
    }
}

/// A constraint represents a single (in)equality that must hold in the solution.
#[derive(Clone, PartialEq)]
pub struct Constraint {
    /// The expression that is compared to zero
    pub(crate) expression: Expression,
    /// represents `expression <sense> 0`
    pub(crate) sense: Sense,
    /// Optional constraint name
    pub(crate) name: Option<String>,
}

impl Constraint {
    pub(crate) fn new(expression: Expression, sense: Sense) -> Constraint {
        Constraint {
            expression,
            sense,
            name: None,
        }
    }

    /// set the constraint name
    pub fn set_name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    /// The constraint name, if one was given
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The comparison sense
    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// The constant on the right hand side once every variable term is moved to the left
    pub fn rhs(&self) -> f64 {
        let rhs = -self.expression.constant;
        // avoid reporting -0
        if rhs == 0. {
            0.
        } else {
            rhs
        }
    }

    /// The variable part of the constraint
    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    /// True when the constraint holds for the given values, within `tolerance`
    pub fn is_satisfied_by(&self, lhs_value: f64, tolerance: f64) -> bool {
        let rhs = self.rhs();
        match self.sense {
            Sense::LessOrEqual => lhs_value <= rhs + tolerance,
            Sense::GreaterOrEqual => lhs_value >= rhs - tolerance,
            Sense::Equal => (lhs_value - rhs).abs() <= tolerance,
        }
    }
}

impl FormatWithVars for Constraint {
    fn format_with<FUN>(&self, f: &mut Formatter<'_>, variable_format: FUN) -> std::fmt::Result
    where
        FUN: FnMut(&mut Formatter<'_>, Variable) -> std::fmt::Result,
    {
        self.expression.linear.format_with(f, variable_format)?;
        write!(f, " {} {}", self.sense.operator(), self.rhs())
    }
}

impl Debug for Constraint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.format_debug(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::variable::{variable, ProblemVariables};

    #[test]
    fn test_geq_keeps_its_sense() {
        let mut vars = ProblemVariables::new();
        let v0 = vars.add(variable());
        let v1 = vars.add(variable());
        let c = (v0 * 1. + v1 * 1.).geq(Expression::from(3.));
        assert_eq!(format!("{:?}", c), "v0 + v1 >= 3");
        assert_eq!(c.sense().symbol(), "≥");
    }

    #[test]
    fn test_terms_on_both_sides() {
        let mut vars = ProblemVariables::new();
        let x1 = vars.add(variable());
        let x2 = vars.add(variable());
        let c = (x1 * 5. + Expression::from(2.)).leq(x2 * -7. + Expression::from(100.));
        assert_eq!(format!("{:?}", c), "5*v0 + 7*v1 <= 98");
        assert_eq!(c.rhs(), 98.);
        assert!(c.is_satisfied_by(98., 1e-9));
        assert!(!c.is_satisfied_by(99., 1e-9));
    }
}
