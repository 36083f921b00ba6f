use std::any::Any;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::model::{Constraint, Expression};
use crate::script::ast::FunctionDef;
use crate::script::error::{ErrorKind, ScriptError};
use crate::script::session::Session;

/// A native function reachable from scripts
pub type BuiltinFn = fn(&mut Session<'_>, CallArgs) -> Result<Value, ScriptError>;

#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl Builtin {
    pub const fn new(name: &'static str, func: BuiltinFn) -> Self {
        Builtin { name, func }
    }
}

/// A runtime value
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    Set(Rc<RefCell<Dict>>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Function(Rc<Function>),
    Builtin(Builtin),
    /// `receiver.name`, dispatched when called
    Method(Rc<Value>, Rc<str>),
    Module(Rc<Module>),
    /// An exception class such as `ValueError`
    ExceptionType(ErrorKind),
    /// An exception instance
    Exception(Rc<ScriptError>),
    /// A linear expression over model variables
    Expr(Rc<Expression>),
    /// A relation between linear expressions
    Relation(Rc<Relation>),
    /// Anything provided by a modeling surface
    Object(Rc<dyn ScriptObject>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn expr(expression: Expression) -> Value {
        Value::Expr(Rc::new(expression))
    }

    pub fn object<T: ScriptObject>(object: T) -> Value {
        Value::Object(Rc::new(object))
    }

    pub fn from_f64(value: Option<f64>) -> Value {
        value.map(Value::Float).unwrap_or(Value::None)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range { .. } => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(_, _) => "method",
            Value::Module(_) => "module",
            Value::ExceptionType(_) => "type",
            Value::Exception(err) => err.kind.name(),
            Value::Expr(_) => "LinearExpression",
            Value::Relation(_) => "LinearConstraint",
            Value::Object(obj) => obj.type_name(),
        }
    }

    /// The object behind an `Object` value, if it has the concrete type `T`
    pub fn downcast<T: ScriptObject>(&self) -> Option<&T> {
        match self {
            Value::Object(obj) => obj.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Plain numbers, booleans included
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0. && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// The hash key of a value, for dictionaries and sets
    pub fn key(&self) -> Result<Key, ScriptError> {
        Ok(match self {
            Value::None => Key::None,
            Value::Bool(b) => Key::Int(i64::from(*b)),
            Value::Int(n) => Key::Int(*n),
            Value::Float(f) => {
                if f.fract() == 0. && f.abs() < 9.0e15 {
                    Key::Int(*f as i64)
                } else {
                    Key::Float(f.to_bits())
                }
            }
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(items.iter().map(Value::key).collect::<Result<_, _>>()?),
            Value::Range { start, stop, step } => Key::Tuple(vec![
                Key::Int(*start),
                Key::Int(*stop),
                Key::Int(*step),
            ]),
            Value::Object(obj) => Key::Identity(Rc::as_ptr(obj) as *const () as usize),
            Value::Function(f) => Key::Identity(Rc::as_ptr(f) as *const () as usize),
            Value::Module(m) => Key::Identity(Rc::as_ptr(m) as *const () as usize),
            Value::Builtin(b) => Key::Str(Rc::from(b.name)),
            Value::ExceptionType(kind) => Key::Str(Rc::from(kind.name())),
            other => {
                return Err(ScriptError::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items.borrow().iter()).finish(),
            Value::Tuple(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Expr(e) => write!(f, "{e:?}"),
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

/// Hashable projection of a value. Numbers that compare equal hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<Key>),
    Identity(usize),
}

/// An insertion ordered dictionary
#[derive(Clone, Default)]
pub struct Dict {
    entries: Vec<Option<(Value, Value)>>,
    index: FnvHashMap<Key, usize>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.index
            .get(key)
            .and_then(|&i| self.entries[i].as_ref())
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.index.contains_key(key)
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Result<(), ScriptError> {
        let hashed = key.key()?;
        self.insert_hashed(hashed, key, value);
        Ok(())
    }

    pub fn insert_hashed(&mut self, hashed: Key, key: Value, value: Value) {
        match self.index.get(&hashed) {
            Some(&i) => {
                if let Some(entry) = self.entries[i].as_mut() {
                    entry.1 = value;
                }
            }
            None => {
                self.index.insert(hashed, self.entries.len());
                self.entries.push(Some((key, value)));
            }
        }
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let i = self.index.remove(key)?;
        self.entries[i].take().map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().flatten().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn items(&self) -> Vec<Value> {
        self.iter()
            .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
            .collect()
    }
}

/// `a <= expr`, `expr == b`, or the ranged `lo <= expr <= hi`
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    Single(Constraint),
    Ranged { lower: Constraint, upper: Constraint },
}

impl Relation {
    pub fn constraints(&self) -> Vec<Constraint> {
        match self {
            Relation::Single(c) => vec![c.clone()],
            Relation::Ranged { lower, upper } => vec![lower.clone(), upper.clone()],
        }
    }
}

/// A user defined function or lambda, with the scope it closes over
pub struct Function {
    pub def: Rc<FunctionDef>,
    /// One entry per parameter; `None` when the parameter is required
    pub defaults: Vec<Option<Value>>,
    pub closure: Scope,
}

pub type Scope = Rc<RefCell<Frame>>;

/// Variables of one function activation, module or comprehension
#[derive(Default)]
pub struct Frame {
    pub vars: FnvHashMap<String, Value>,
    pub parent: Option<Scope>,
    pub globals: FnvHashSet<String>,
}

impl Frame {
    pub fn child_of(parent: &Scope) -> Scope {
        Rc::new(RefCell::new(Frame {
            parent: Some(parent.clone()),
            ..Frame::default()
        }))
    }
}

/// An importable module: a name and its attributes
pub struct Module {
    pub name: String,
    pub attrs: FnvHashMap<String, Value>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            attrs: FnvHashMap::default(),
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn function(self, builtin: Builtin) -> Self {
        let name = builtin.name;
        self.with(name, Value::Builtin(builtin))
    }
}

/// Arguments of a call, after `*` and `**` expansion
#[derive(Default, Clone)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>) -> Self {
        CallArgs {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// The argument at `pos`, or passed as `name=`
    pub fn get(&self, pos: usize, name: &str) -> Option<&Value> {
        self.positional.get(pos).or_else(|| self.keyword(name))
    }

    pub fn required(&self, pos: usize, name: &str, func: &str) -> Result<&Value, ScriptError> {
        self.get(pos, name).ok_or_else(|| {
            ScriptError::type_error(format!("{func}() missing required argument '{name}'"))
        })
    }

    pub fn at_most(&self, count: usize, func: &str) -> Result<(), ScriptError> {
        if self.positional.len() > count {
            return Err(ScriptError::type_error(format!(
                "{func}() takes at most {count} positional arguments ({} given)",
                self.positional.len()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Behavior of the objects a modeling surface hands to scripts.
/// Every hook has a default that reports the operation as unsupported.
pub trait ScriptObject: Any {
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Plain attributes. `Ok(None)` lets methods be looked up.
    fn get_attr(&self, _session: &mut Session<'_>, _name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(None)
    }

    fn set_attr(&self, _session: &mut Session<'_>, name: &str, _value: Value) -> Result<(), ScriptError> {
        Err(ScriptError::attribute(format!(
            "'{}' object attribute '{name}' is read-only",
            self.type_name()
        )))
    }

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    fn call_method(
        &self,
        _session: &mut Session<'_>,
        name: &str,
        _args: CallArgs,
    ) -> Result<Value, ScriptError> {
        Err(ScriptError::attribute(format!(
            "'{}' object has no attribute '{name}'",
            self.type_name()
        )))
    }

    fn call(&self, _session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
        Err(ScriptError::type_error(format!(
            "'{}' object is not callable",
            self.type_name()
        )))
    }

    fn get_item(&self, _session: &mut Session<'_>, _index: &Value) -> Result<Value, ScriptError> {
        Err(ScriptError::type_error(format!(
            "'{}' object is not subscriptable",
            self.type_name()
        )))
    }

    fn set_item(&self, _session: &mut Session<'_>, _index: &Value, _value: Value) -> Result<(), ScriptError> {
        Err(ScriptError::type_error(format!(
            "'{}' object does not support item assignment",
            self.type_name()
        )))
    }

    fn iterate(&self, _session: &mut Session<'_>) -> Result<Vec<Value>, ScriptError> {
        Err(ScriptError::type_error(format!(
            "'{}' object is not iterable",
            self.type_name()
        )))
    }

    fn len(&self) -> Option<usize> {
        None
    }

    /// The object as a linear expression, for variables and parameters
    fn as_linear(&self, _session: &Session<'_>) -> Option<Expression> {
        None
    }

    /// The object as a plain number, for scalar parameters
    fn as_scalar(&self, _session: &Session<'_>) -> Option<Value> {
        None
    }

    /// `self += value`; returns false when the object does not support it
    fn add_assign(&self, _session: &mut Session<'_>, _value: Value) -> Result<bool, ScriptError> {
        Ok(false)
    }

    fn display(&self, _session: &Session<'_>) -> String {
        format!("<{} object>", self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_keys_unify() {
        assert_eq!(Value::Int(1).key().unwrap(), Value::Float(1.).key().unwrap());
        assert_eq!(Value::Bool(true).key().unwrap(), Value::Int(1).key().unwrap());
        assert!(Value::list(vec![]).key().is_err());
    }

    #[test]
    fn dict_keeps_insertion_order() {
        let mut dict = Dict::new();
        dict.insert(Value::str("b"), Value::Int(1)).unwrap();
        dict.insert(Value::str("a"), Value::Int(2)).unwrap();
        dict.insert(Value::str("b"), Value::Int(3)).unwrap();
        let keys: Vec<String> = dict
            .keys()
            .iter()
            .map(|k| k.as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(dict.get(&Value::str("b").key().unwrap()).and_then(Value::as_i64), Some(3));
        assert_eq!(dict.remove(&Value::str("a").key().unwrap()).and_then(|v| v.as_i64()), Some(2));
        assert_eq!(dict.len(), 1);
    }
}
