//! Arithmetic and comparison between runtime values.
//!
//! Numbers follow the usual integer/float promotion. As soon as one operand is a model
//! variable or a linear expression the result is a linear [Expression]; products of two
//! non-constant expressions are rejected since every supported backend is linear.
use std::cmp::Ordering;
use std::rc::Rc;

use crate::model::{Expression, Sense};
use crate::script::ast::{BinOp, CmpOp};
use crate::script::error::{ErrorKind, ScriptError};
use crate::script::session::Session;
use crate::script::value::{Relation, Value};

enum Operand {
    Int(i64),
    Float(f64),
    Linear(Expression),
    Other,
}

fn operand(session: &Session<'_>, value: &Value) -> Operand {
    match value {
        Value::Bool(b) => Operand::Int(i64::from(*b)),
        Value::Int(n) => Operand::Int(*n),
        Value::Float(f) => Operand::Float(*f),
        Value::Expr(e) => Operand::Linear((**e).clone()),
        Value::Object(obj) => match obj.as_scalar(session) {
            Some(Value::Int(n)) => Operand::Int(n),
            Some(Value::Float(f)) => Operand::Float(f),
            Some(Value::Bool(b)) => Operand::Int(i64::from(b)),
            _ => obj.as_linear(session).map(Operand::Linear).unwrap_or(Operand::Other),
        },
        _ => Operand::Other,
    }
}

/// The linear form of a value, if it has one
pub fn linear(session: &Session<'_>, value: &Value) -> Option<Expression> {
    match operand(session, value) {
        Operand::Int(n) => Some(Expression::from(n as f64)),
        Operand::Float(f) => Some(Expression::from(f)),
        Operand::Linear(e) => Some(e),
        Operand::Other => None,
    }
}

/// The numeric form of a value, if it is a plain or scalar-like number
pub fn number(session: &Session<'_>, value: &Value) -> Option<f64> {
    match operand(session, value) {
        Operand::Int(n) => Some(n as f64),
        Operand::Float(f) => Some(f),
        _ => None,
    }
}

fn unsupported(op: &str, left: &Value, right: &Value) -> ScriptError {
    ScriptError::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

fn zero_division(message: &str) -> ScriptError {
    ScriptError::new(ErrorKind::ZeroDivisionError, message)
}

pub fn binary(session: &Session<'_>, op: BinOp, left: &Value, right: &Value) -> Result<Value, ScriptError> {
    if let Some(value) = sequence_op(session, op, left, right)? {
        return Ok(value);
    }
    match (operand(session, left), operand(session, right)) {
        (Operand::Int(a), Operand::Int(b)) => int_op(op, a, b),
        (Operand::Int(a), Operand::Float(b)) => float_op(op, a as f64, b),
        (Operand::Float(a), Operand::Int(b)) => float_op(op, a, b as f64),
        (Operand::Float(a), Operand::Float(b)) => float_op(op, a, b),
        (Operand::Other, _) | (_, Operand::Other) => Err(unsupported(op.symbol(), left, right)),
        (l, r) => linear_op(op, to_expression(l), to_expression(r)),
    }
}

fn to_expression(operand: Operand) -> Expression {
    match operand {
        Operand::Int(n) => Expression::from(n as f64),
        Operand::Float(f) => Expression::from(f),
        Operand::Linear(e) => e,
        Operand::Other => Expression::default(),
    }
}

fn linear_op(op: BinOp, left: Expression, right: Expression) -> Result<Value, ScriptError> {
    let result = match op {
        BinOp::Add => left + right,
        BinOp::Sub => left - right,
        BinOp::Mul => {
            if right.is_constant() {
                left * right.constant()
            } else if left.is_constant() {
                right * left.constant()
            } else {
                return Err(ScriptError::type_error(
                    "product of two variable expressions is not linear",
                ));
            }
        }
        BinOp::Div => {
            if !right.is_constant() {
                return Err(ScriptError::type_error(
                    "division by a variable expression is not linear",
                ));
            }
            if right.constant() == 0. {
                return Err(zero_division("division by zero"));
            }
            left / right.constant()
        }
        BinOp::Pow if right.is_constant() && right.constant() == 1. => left,
        BinOp::Pow if right.is_constant() && right.constant() == 0. => Expression::from(1.),
        _ => {
            return Err(ScriptError::type_error(format!(
                "operator {} is not supported on linear expressions",
                op.symbol()
            )))
        }
    };
    Ok(Value::expr(result))
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, ScriptError> {
    let checked = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            Some(a.div_euclid(b) - i64::from(b < 0 && a.rem_euclid(b) != 0))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let r = a.rem_euclid(b);
            Some(if b < 0 && r != 0 { r + b } else { r })
        }
        BinOp::Pow => {
            if b < 0 {
                return float_op(op, a as f64, b as f64);
            }
            u32::try_from(b).ok().and_then(|e| a.checked_pow(e))
        }
    };
    match checked {
        Some(n) => Ok(Value::Int(n)),
        None => float_op(op, a as f64, b as f64),
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, ScriptError> {
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0. {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0. {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0. {
                return Err(zero_division("float modulo"));
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => {
            if a == 0. && b < 0. {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            a.powf(b)
        }
    }))
}

/// String, list and tuple concatenation and repetition, and `%` formatting
fn sequence_op(
    session: &Session<'_>,
    op: BinOp,
    left: &Value,
    right: &Value,
) -> Result<Option<Value>, ScriptError> {
    let repeat = |n: i64| usize::try_from(n).unwrap_or(0);
    Ok(Some(match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Value::str(format!("{a}{b}")),
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            session.check_size(s.len().saturating_mul(repeat(*n)))?;
            Value::str(s.repeat(repeat(*n)))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            session.check_size(items.len())?;
            Value::list(items)
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = (**a).clone();
            items.extend(b.iter().cloned());
            Value::tuple(items)
        }
        (BinOp::Mul, Value::List(items), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::List(items)) => {
            let items = items.borrow();
            session.check_size(items.len().saturating_mul(repeat(*n)))?;
            Value::list(items.iter().cloned().cycle().take(items.len() * repeat(*n)).collect())
        }
        (BinOp::Mod, Value::Str(format), args) => {
            Value::str(crate::script::builtins::percent_format(session, format, args)?)
        }
        _ => return Ok(None),
    }))
}

pub fn negate(session: &Session<'_>, value: &Value) -> Result<Value, ScriptError> {
    match operand(session, value) {
        Operand::Int(n) => Ok(n
            .checked_neg()
            .map(Value::Int)
            .unwrap_or(Value::Float(-(n as f64)))),
        Operand::Float(f) => Ok(Value::Float(-f)),
        Operand::Linear(e) => Ok(Value::expr(-e)),
        Operand::Other => Err(ScriptError::type_error(format!(
            "bad operand type for unary -: '{}'",
            value.type_name()
        ))),
    }
}

pub fn positive(session: &Session<'_>, value: &Value) -> Result<Value, ScriptError> {
    match operand(session, value) {
        Operand::Int(n) => Ok(Value::Int(n)),
        Operand::Float(f) => Ok(Value::Float(f)),
        Operand::Linear(e) => Ok(Value::expr(e)),
        Operand::Other => Err(ScriptError::type_error(format!(
            "bad operand type for unary +: '{}'",
            value.type_name()
        ))),
    }
}

fn is_symbolic(session: &Session<'_>, value: &Value) -> bool {
    matches!(operand(session, value), Operand::Linear(_))
}

/// One comparison of a chain. Comparisons involving variables build constraints.
pub fn compare(
    session: &mut Session<'_>,
    op: CmpOp,
    left: &Value,
    right: &Value,
) -> Result<Value, ScriptError> {
    let symbolic = is_symbolic(session, left) || is_symbolic(session, right);
    if symbolic && matches!(op, CmpOp::Eq | CmpOp::LtE | CmpOp::GtE | CmpOp::Lt | CmpOp::Gt) {
        let (Some(l), Some(r)) = (linear(session, left), linear(session, right)) else {
            return Err(unsupported(op.symbol(), left, right));
        };
        let sense = match op {
            CmpOp::Eq => Sense::Equal,
            CmpOp::LtE => Sense::LessOrEqual,
            CmpOp::GtE => Sense::GreaterOrEqual,
            _ => {
                return Err(ScriptError::type_error(
                    "strict inequalities are not supported in constraints, use <= or >=",
                ))
            }
        };
        // keep the variables on the left: `5 <= x` is stored as `x >= 5`
        let constraint = if l.is_constant() && !r.is_constant() {
            r.compare(mirror(sense), l)
        } else {
            l.compare(sense, r)
        };
        return Ok(Value::Relation(Rc::new(Relation::Single(constraint))));
    }
    Ok(Value::Bool(match op {
        CmpOp::Eq => equal(session, left, right),
        CmpOp::NotEq => !equal(session, left, right),
        CmpOp::Lt => order(session, left, right)? == Ordering::Less,
        CmpOp::LtE => order(session, left, right)? != Ordering::Greater,
        CmpOp::Gt => order(session, left, right)? == Ordering::Greater,
        CmpOp::GtE => order(session, left, right)? != Ordering::Less,
        CmpOp::In => session.contains(right, left)?,
        CmpOp::NotIn => !session.contains(right, left)?,
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
    }))
}

fn mirror(sense: Sense) -> Sense {
    match sense {
        Sense::LessOrEqual => Sense::GreaterOrEqual,
        Sense::GreaterOrEqual => Sense::LessOrEqual,
        Sense::Equal => Sense::Equal,
    }
}

/// Structural equality
pub fn equal(session: &Session<'_>, left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| equal(session, x, y))
        }
        (Value::Tuple(a), Value::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| equal(session, x, y))
        }
        (Value::Dict(a), Value::Dict(b)) | (Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len()
                && a.iter().all(|(k, v)| {
                    k.key()
                        .ok()
                        .and_then(|key| b.get(&key))
                        .is_some_and(|other| equal(session, v, other))
                })
        }
        (Value::Expr(a), Value::Expr(b)) => a == b,
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
        (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
        (
            Value::Range {
                start: a,
                stop: b,
                step: c,
            },
            Value::Range {
                start: x,
                stop: y,
                step: z,
            },
        ) => (a, b, c) == (x, y, z),
        _ => match (number(session, left), number(session, right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
        (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
        (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
        _ => false,
    }
}

/// Total order used by `<`, `sorted`, `min` and `max`
pub fn order(session: &Session<'_>, left: &Value, right: &Value) -> Result<Ordering, ScriptError> {
    if let (Some(a), Some(b)) = (number(session, left), number(session, right)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| ScriptError::value("cannot order NaN"));
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => sequence_order(session, a, b),
        (Value::List(a), Value::List(b)) => sequence_order(session, &a.borrow(), &b.borrow()),
        _ => Err(ScriptError::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn sequence_order(session: &Session<'_>, a: &[Value], b: &[Value]) -> Result<Ordering, ScriptError> {
    for (x, y) in a.iter().zip(b.iter()) {
        if !equal(session, x, y) {
            return order(session, x, y);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_integer_semantics() {
        assert!(matches!(int_op(BinOp::FloorDiv, -7, 2), Ok(Value::Int(-4))));
        assert!(matches!(int_op(BinOp::Mod, -7, 2), Ok(Value::Int(1))));
        assert!(matches!(int_op(BinOp::Mod, 7, -2), Ok(Value::Int(-1))));
        assert!(matches!(int_op(BinOp::Div, 7, 2), Ok(Value::Float(f)) if f == 3.5));
        assert!(matches!(int_op(BinOp::Pow, 2, 10), Ok(Value::Int(1024))));
        assert!(matches!(int_op(BinOp::Pow, 2, -1), Ok(Value::Float(f)) if f == 0.5));
        assert!(int_op(BinOp::Mod, 1, 0).is_err());
    }

    #[test]
    fn overflow_promotes_to_float() {
        assert!(matches!(int_op(BinOp::Mul, i64::MAX, 2), Ok(Value::Float(_))));
    }

    #[test]
    fn linear_products_must_have_a_constant_side() {
        let mut store = crate::model::ProblemVariables::new();
        let x = store.add(crate::model::variable().name("x"));
        let y = store.add(crate::model::variable().name("y"));
        assert!(linear_op(BinOp::Mul, Expression::from(x), Expression::from(3.)).is_ok());
        assert!(linear_op(BinOp::Mul, Expression::from(x), Expression::from(y)).is_err());
        assert!(linear_op(BinOp::Div, Expression::from(x), Expression::from(0.)).is_err());
    }
}
