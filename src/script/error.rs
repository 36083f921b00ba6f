use std::fmt::{Display, Formatter};

use thiserror::Error;

/// The class of a script failure, named after the exception a fragment would see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SyntaxError,
    IndentationError,
    NameError,
    TypeError,
    ValueError,
    AttributeError,
    KeyError,
    IndexError,
    ZeroDivisionError,
    ImportError,
    AssertionError,
    RuntimeError,
    /// Raised by `raise Exception(...)` in the fragment itself
    Exception,
    /// The step budget is exhausted. Scripts cannot catch it.
    StepLimitExceeded,
    /// Too many nested calls. Scripts cannot catch it.
    RecursionLimitExceeded,
    /// A collection grew past the configured ceiling. Scripts cannot catch it.
    MemoryLimitExceeded,
}

impl ErrorKind {
    /// Every kind a fragment can name in an `except` clause or construct with `raise`
    pub const CATCHABLE: [ErrorKind; 13] = [
        ErrorKind::SyntaxError,
        ErrorKind::IndentationError,
        ErrorKind::NameError,
        ErrorKind::TypeError,
        ErrorKind::ValueError,
        ErrorKind::AttributeError,
        ErrorKind::KeyError,
        ErrorKind::IndexError,
        ErrorKind::ZeroDivisionError,
        ErrorKind::ImportError,
        ErrorKind::AssertionError,
        ErrorKind::RuntimeError,
        ErrorKind::Exception,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::IndentationError => "IndentationError",
            ErrorKind::NameError => "NameError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::AttributeError => "AttributeError",
            ErrorKind::KeyError => "KeyError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::AssertionError => "AssertionError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Exception => "Exception",
            ErrorKind::StepLimitExceeded => "StepLimitExceeded",
            ErrorKind::RecursionLimitExceeded => "RecursionError",
            ErrorKind::MemoryLimitExceeded => "MemoryError",
        }
    }

    /// Resource ceilings are enforced by the host and escape every `try` block
    pub fn is_resource_limit(self) -> bool {
        matches!(
            self,
            ErrorKind::StepLimitExceeded
                | ErrorKind::RecursionLimitExceeded
                | ErrorKind::MemoryLimitExceeded
        )
    }

    /// Whether an `except <self>` clause handles an error of kind `raised`
    pub fn handles(self, raised: ErrorKind) -> bool {
        if raised.is_resource_limit() {
            return false;
        }
        self == ErrorKind::Exception
            || self == raised
            || (self == ErrorKind::SyntaxError && raised == ErrorKind::IndentationError)
    }

    pub fn from_name(name: &str) -> Option<ErrorKind> {
        ErrorKind::CATCHABLE.into_iter().find(|k| k.name() == name)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A failure while lexing, parsing or running a fragment
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}{}", at_line(.line))]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based line of the statement being executed, when known
    pub line: Option<u32>,
}

fn at_line(line: &Option<u32>) -> String {
    match line {
        Some(line) => format!(" (line {line})"),
        None => String::new(),
    }
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ScriptError {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn syntax(line: u32, message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::SyntaxError, message).at(line)
    }

    pub fn name(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::NameError, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::TypeError, message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::ValueError, message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::AttributeError, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::KeyError, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::IndexError, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::RuntimeError, message)
    }

    /// Attach a line number unless one is already known
    pub fn at(mut self, line: u32) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_line() {
        let err = ScriptError::name("name 'x' is not defined").at(3).at(7);
        assert_eq!(err.to_string(), "NameError: name 'x' is not defined (line 3)");
    }

    #[test]
    fn limits_cannot_be_caught() {
        assert!(ErrorKind::Exception.handles(ErrorKind::KeyError));
        assert!(!ErrorKind::Exception.handles(ErrorKind::StepLimitExceeded));
        assert!(!ErrorKind::ValueError.handles(ErrorKind::TypeError));
    }
}
