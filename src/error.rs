//! Errors surfaced to callers of the pipeline.
//!
//! Configuration mistakes (an unknown framework or solver name) are returned as errors at the
//! point of misuse. Failures caused by generated content never reach the caller as errors: the
//! executor folds them into the `status` and `message` of a [SolutionRecord](crate::SolutionRecord).
use thiserror::Error;

use crate::config::ConfigError;
use crate::framework::Framework;
use crate::llm::GenerationError;

/// Everything that can go wrong in the pipeline.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The requested framework is outside the supported set.
    #[error("unsupported framework: {0} (expected one of: pyomo, pulp)")]
    UnsupportedFrameworkKind(String),
    /// The requested solver is not in the registry of the chosen framework.
    #[error("solver {name} is not supported for {framework}; choose from: {supported}")]
    UnsupportedSolver {
        /// The requested solver name
        name: String,
        /// The framework whose registry was consulted
        framework: Framework,
        /// Comma separated list of accepted names
        supported: String,
    },
    /// The executed fragment did not bind a `model` variable.
    #[error("model code did not create a 'model' variable")]
    MalformedModel,
    /// The fragment could not be parsed.
    #[error("syntax error: {0}")]
    SyntaxInvalid(String),
    /// Executing or solving the fragment failed.
    #[error("{0}")]
    SolveRuntimeFailure(String),
    /// The text-generation collaborator failed.
    #[error(transparent)]
    Generation(#[from] GenerationError),
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// A stable identifier for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::UnsupportedFrameworkKind(_) => "UNSUPPORTED_FRAMEWORK",
            BridgeError::UnsupportedSolver { .. } => "UNSUPPORTED_SOLVER",
            BridgeError::MalformedModel => "MALFORMED_MODEL",
            BridgeError::SyntaxInvalid(_) => "SYNTAX_INVALID",
            BridgeError::SolveRuntimeFailure(_) => "SOLVE_RUNTIME_FAILURE",
            BridgeError::Generation(_) => "GENERATION_FAILED",
            BridgeError::Config(_) => "CONFIG_INVALID",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_solver_lists_alternatives() {
        let err = BridgeError::UnsupportedSolver {
            name: "mosek".to_string(),
            framework: Framework::LinearExpression,
            supported: "cbc, glpk".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mosek"));
        assert!(msg.contains("pulp"));
        assert!(msg.contains("cbc, glpk"));
        assert_eq!(err.code(), "UNSUPPORTED_SOLVER");
    }

    #[test]
    fn malformed_model_message() {
        assert_eq!(
            BridgeError::MalformedModel.to_string(),
            "model code did not create a 'model' variable"
        );
    }
}
