//! The closed set of modeling surfaces a fragment can be written against.
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// The two supported modeling styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    /// A model object holding sets, parameters, variables, an objective rule and
    /// constraint rules (the `pyomo` surface).
    ConstraintBased,
    /// A problem object to which linear expressions over variables are added
    /// (the `pulp` surface).
    LinearExpression,
}

impl Framework {
    /// Every supported framework
    pub const ALL: [Framework; 2] = [Framework::ConstraintBased, Framework::LinearExpression];

    /// The name of the modeling library the fragment is expected to import
    pub fn library(self) -> &'static str {
        match self {
            Framework::ConstraintBased => "pyomo",
            Framework::LinearExpression => "pulp",
        }
    }
}

impl Display for Framework {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.library())
    }
}

impl FromStr for Framework {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pyomo" | "constraint" | "constraint-based" | "constraint_based" => {
                Ok(Framework::ConstraintBased)
            }
            "pulp" | "linear" | "linear-expression" | "linear_expression" => {
                Ok(Framework::LinearExpression)
            }
            _ => Err(BridgeError::UnsupportedFrameworkKind(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_library_names_and_aliases() {
        assert_eq!("Pyomo".parse::<Framework>().unwrap(), Framework::ConstraintBased);
        assert_eq!("pulp".parse::<Framework>().unwrap(), Framework::LinearExpression);
        assert_eq!(
            "linear-expression".parse::<Framework>().unwrap(),
            Framework::LinearExpression
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = "cvxpy".parse::<Framework>().unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedFrameworkKind(ref name) if name == "cvxpy"));
    }
}
