//! Turn natural-language optimization problems into solved models.
//!
//! A text generator writes model code against one of two modeling surfaces (a pyomo-like
//! constraint-based one and a pulp-like linear-expression one). The code is extracted from
//! the reply, inspected statically, run in a capability-scoped interpreter, and the model it
//! builds is solved by a linear programming backend.
//!
//! ```rust
//! use autoopt::{Executor, Framework, SolveStatus, SolverRegistry};
//!
//! let registry = SolverRegistry::for_framework(Framework::LinearExpression);
//! let executor = Executor::new(Framework::LinearExpression, "microlp", &registry)?;
//! let record = executor.solve(
//!     "import pulp\n\
//!      model = pulp.LpProblem('demo', pulp.LpMaximize)\n\
//!      x = pulp.LpVariable('x', lowBound=0, upBound=4)\n\
//!      model += 3 * x\n\
//!      model.solve()\n",
//! );
//! assert_eq!(record.status, SolveStatus::Optimal);
//! assert!((record.objective_value.unwrap() - 12.).abs() < 1e-9);
//! # Ok::<_, autoopt::BridgeError>(())
//! ```
pub use analyze::{analyze, ConstraintFacts, LinearFacts, ModelType, StructuralFacts};
pub use config::{Config, ConfigError, GatePolicy};
pub use error::BridgeError;
pub use executor::Executor;
pub use extract::{extract_fragments, select_best_fragment};
pub use framework::Framework;
pub use llm::{build_prompt, GenerationError, PromptStyle, TextGenerator};
pub use normalize::{normalize, SolutionRecord, SolveStatus, SolverMetadata};
pub use pipeline::{Pipeline, RunReport};
pub use script::Limits;
pub use solvers::{ResolutionError, SolverRegistry};
pub use validate::{is_executable, validate, Verdict};

pub mod analyze;
pub mod config;
mod error;
pub mod executor;
pub mod extract;
mod framework;
pub mod llm;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod script;
pub mod solvers;
pub mod surface;
pub mod validate;
