//! The modeling libraries a fragment is written against.
//!
//! A [Surface] decides which modules a fragment may import, which names are bound before it
//! runs, and how the object left in `model` turns into a [Problem] once the fragment is done.
//! The objects themselves live in [pulp] and [pyomo]; they only ever touch the [Session] they
//! were created in.
use std::rc::Rc;

use crate::framework::Framework;
use crate::model::{Expression, Problem};
use crate::script::{ops, Module, ScriptError, Session, Value};

pub mod pulp;
pub mod pyomo;

pub use pulp::PulpSurface;
pub use pyomo::PyomoSurface;

/// One modeling library, as seen from inside the interpreter
pub trait Surface {
    /// The framework this surface implements
    fn framework(&self) -> Framework;

    /// The module imported under `name`, if this surface provides it
    fn module(&self, name: &str) -> Option<Rc<Module>>;

    /// Names bound in the namespace before the fragment runs
    fn seed(&self) -> Vec<(&'static str, Value)>;

    /// Turn the value bound to `model` into a problem
    fn materialize(&self, session: &mut Session<'_>, model: &Value) -> Result<Problem, ScriptError>;
}

/// The surface implementing `framework`
pub fn surface_for(framework: Framework) -> Box<dyn Surface> {
    match framework {
        Framework::ConstraintBased => Box::new(PyomoSurface::new()),
        Framework::LinearExpression => Box::new(PulpSurface::new()),
    }
}

/// `value(x)` as both libraries define it: numbers pass through, expressions are evaluated
/// against the last solve and give `None` while any of their variables has no value.
pub(crate) fn evaluate(session: &Session<'_>, value: &Value) -> Value {
    match value {
        Value::None => Value::None,
        Value::Bool(_) | Value::Int(_) | Value::Float(_) => value.clone(),
        Value::Object(obj) => match obj.as_scalar(session) {
            Some(scalar) => scalar,
            None => match obj.as_linear(session) {
                Some(expression) => Value::from_f64(expression.eval_with(session.solution())),
                None => value.clone(),
            },
        },
        other => match ops::linear(session, other) {
            Some(expression) => Value::from_f64(expression.eval_with(session.solution())),
            None => other.clone(),
        },
    }
}

/// The linear form of `value`, or a `TypeError` naming what it was expected to be
pub(crate) fn expect_linear(
    session: &Session<'_>,
    value: &Value,
    what: &str,
) -> Result<Expression, ScriptError> {
    ops::linear(session, value).ok_or_else(|| {
        ScriptError::type_error(format!(
            "{what} must be a linear expression, not '{}'",
            value.type_name()
        ))
    })
}

/// An optional numeric bound: `None` stays unbounded
pub(crate) fn bound(session: &Session<'_>, value: Option<&Value>, what: &str) -> Result<Option<f64>, ScriptError> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(value) => ops::number(session, value).map(Some).ok_or_else(|| {
            ScriptError::type_error(format!(
                "{what} must be a number, not '{}'",
                value.type_name()
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse;
    use crate::solvers::microlp::MicroLp;

    #[test]
    fn every_framework_has_a_surface() {
        for framework in Framework::ALL {
            assert_eq!(surface_for(framework).framework(), framework);
        }
    }

    #[test]
    fn value_of_plain_numbers_and_unsolved_expressions() {
        let surface = PulpSurface::new();
        let backend = MicroLp;
        let mut session = Session::new(&surface, &backend, Default::default());
        session
            .run(&parse("x = LpVariable('x')\ne = 2 * x + 1\n").unwrap())
            .unwrap();
        let e = session.global("e").unwrap();
        assert!(matches!(evaluate(&session, &e), Value::None));
        assert!(matches!(evaluate(&session, &Value::Int(3)), Value::Int(3)));
    }
}
