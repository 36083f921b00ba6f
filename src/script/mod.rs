//! A small interpreter for the Python subset that generated model code is written in.
//!
//! Fragments are lexed and parsed into an [ast], then evaluated by a [Session]. The session
//! is the only thing a fragment can reach: there is no file, network or process access, the
//! importable modules are those of the chosen modeling surface plus `math`, and
//! [Limits] bound the work a fragment may do.
pub mod ast;
pub mod builtins;
pub mod error;
pub mod lexer;
pub mod ops;
pub mod parser;
pub mod session;
pub mod value;

pub use error::{ErrorKind, ScriptError};
pub use parser::parse;
pub use session::{Limits, Session};
pub use value::{Builtin, CallArgs, Dict, Module, Relation, ScriptObject, Value};
