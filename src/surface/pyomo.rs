//! The `pyomo` surface.
//!
//! A `ConcreteModel` is a bag of named components. Components are built when they are assigned
//! to the model: rules are called with the model (and the index, for indexed components) at
//! that moment, so later components can refer to earlier ones. Variables are named the way
//! pyomo names them: `x` for scalars, `x[i]` and `x[i,j]` for indexed components.
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::framework::Framework;
use crate::model::variable::Named;
use crate::model::{Category, Constraint, Expression, Problem, Variable, VariableDefinition};
use crate::normalize::SolveStatus;
use crate::script::ast::BinOp;
use crate::script::builtins::sum_values;
use crate::script::{ops, Builtin, CallArgs, Dict, Module, Relation, ScriptError, ScriptObject, Session, Value};
use crate::solvers::ObjectiveDirection;
use crate::surface::{bound, evaluate, expect_linear, Surface};

/// `pyo.minimize`
pub const MINIMIZE: i64 = 1;
/// `pyo.maximize`
pub const MAXIMIZE: i64 = -1;

const TERMINATION_CONDITIONS: [&str; 9] = [
    "optimal",
    "feasible",
    "infeasible",
    "unbounded",
    "infeasibleOrUnbounded",
    "maxTimeLimit",
    "maxIterations",
    "unknown",
    "error",
];

const SOLVER_STATUSES: [&str; 5] = ["ok", "warning", "error", "aborted", "unknown"];

/// `results.solver.termination_condition` for a status
pub fn termination_condition(status: SolveStatus) -> &'static str {
    match status {
        SolveStatus::Optimal => "optimal",
        SolveStatus::Feasible => "feasible",
        SolveStatus::Infeasible => "infeasible",
        SolveStatus::Unbounded => "unbounded",
        SolveStatus::NotSolved => "unknown",
        SolveStatus::Error => "error",
    }
}

/// `results.solver.status` for a status
pub fn solver_status(status: SolveStatus) -> &'static str {
    match status {
        SolveStatus::Optimal => "ok",
        SolveStatus::Feasible | SolveStatus::Infeasible | SolveStatus::Unbounded => "warning",
        SolveStatus::NotSolved => "unknown",
        SolveStatus::Error => "error",
    }
}

/// The surface handing out `pyomo` objects
pub struct PyomoSurface {
    root: Rc<Module>,
    environ: Rc<Module>,
    opt: Rc<Module>,
}

impl PyomoSurface {
    pub fn new() -> Self {
        let opt = Rc::new(opt_module());
        let environ = Rc::new(environ_module());
        let root = Rc::new(
            Module::new("pyomo")
                .with("environ", Value::Module(environ.clone()))
                .with("opt", Value::Module(opt.clone())),
        );
        PyomoSurface { root, environ, opt }
    }
}

impl Default for PyomoSurface {
    fn default() -> Self {
        PyomoSurface::new()
    }
}

impl Surface for PyomoSurface {
    fn framework(&self) -> Framework {
        Framework::ConstraintBased
    }

    fn module(&self, name: &str) -> Option<Rc<Module>> {
        match name {
            "pyomo" => Some(self.root.clone()),
            "pyomo.environ" => Some(self.environ.clone()),
            "pyomo.opt" => Some(self.opt.clone()),
            _ => None,
        }
    }

    fn seed(&self) -> Vec<(&'static str, Value)> {
        vec![("pyo", Value::Module(self.environ.clone()))]
    }

    fn materialize(&self, session: &mut Session<'_>, model: &Value) -> Result<Problem, ScriptError> {
        let model = model.downcast::<Model>().ok_or_else(|| {
            ScriptError::type_error(format!(
                "model must be a ConcreteModel, not '{}'",
                model.type_name()
            ))
        })?;
        model.problem(session)
    }
}

fn namespace(name: &str, entries: &[&str]) -> Value {
    let module = entries
        .iter()
        .fold(Module::new(name), |module, entry| module.with(entry, Value::str(entry)));
    Value::Module(Rc::new(module))
}

fn opt_module() -> Module {
    Module::new("pyomo.opt")
        .function(Builtin::new("SolverFactory", solver_factory))
        .with("TerminationCondition", namespace("TerminationCondition", &TERMINATION_CONDITIONS))
        .with("SolverStatus", namespace("SolverStatus", &SOLVER_STATUSES))
}

fn environ_module() -> Module {
    let mut module = Module::new("pyomo.environ")
        .with("ConcreteModel", Value::object(ComponentClass(Kind::ConcreteModel)))
        .with("AbstractModel", Value::object(ComponentClass(Kind::AbstractModel)))
        .with("Set", Value::object(ComponentClass(Kind::Set)))
        .with("RangeSet", Value::object(ComponentClass(Kind::RangeSet)))
        .with("Param", Value::object(ComponentClass(Kind::Param)))
        .with("Var", Value::object(ComponentClass(Kind::Var)))
        .with("Objective", Value::object(ComponentClass(Kind::Objective)))
        .with("Constraint", Value::object(ComponentClass(Kind::Constraint)))
        .with("ConstraintList", Value::object(ComponentClass(Kind::ConstraintList)))
        .with("Expression", Value::object(ComponentClass(Kind::Expression)))
        .with("Suffix", Value::object(ComponentClass(Kind::Suffix)))
        .with("minimize", Value::Int(MINIMIZE))
        .with("maximize", Value::Int(MAXIMIZE))
        .with("TerminationCondition", namespace("TerminationCondition", &TERMINATION_CONDITIONS))
        .with("SolverStatus", namespace("SolverStatus", &SOLVER_STATUSES))
        .function(Builtin::new("SolverFactory", solver_factory))
        .function(Builtin::new("value", value))
        .function(Builtin::new("quicksum", quicksum))
        .function(Builtin::new("summation", summation))
        .function(Builtin::new("sum_product", summation))
        .function(Builtin::new("inequality", inequality))
        .function(Builtin::new("check_optimal_termination", check_optimal_termination))
        .function(Builtin::new("assert_optimal_termination", assert_optimal_termination));
    for domain in DOMAINS {
        module = module.with(domain.name, Value::object(domain));
    }
    module
}

// -- Helpers -----------------------------------------------------

fn is_callable(value: &Value) -> bool {
    matches!(value, Value::Function(_) | Value::Builtin(_) | Value::Method(_, _))
}

/// The arguments a rule receives for `index`: the model, then the index unpacked
fn rule_args(model: &Value, index: &Value) -> CallArgs {
    let mut args = vec![model.clone()];
    match index {
        Value::None => {}
        Value::Tuple(parts) => args.extend(parts.iter().cloned()),
        other => args.push(other.clone()),
    }
    CallArgs::new(args)
}

/// `i` or `i,j`, as pyomo prints indices inside brackets
fn index_label(session: &Session<'_>, index: &Value) -> String {
    match index {
        Value::Tuple(parts) => parts
            .iter()
            .map(|p| session.display(p))
            .collect::<Vec<_>>()
            .join(","),
        other => session.display(other),
    }
}

/// Every index of the product of `sets`, with tuple members flattened
fn index_product(session: &mut Session<'_>, sets: &[Value]) -> Result<Vec<Value>, ScriptError> {
    let mut combos: Vec<Vec<Value>> = vec![Vec::new()];
    for set in sets {
        let members = session.iterate(set)?;
        session.check_size(combos.len().saturating_mul(members.len()))?;
        let mut next = Vec::with_capacity(combos.len() * members.len());
        for prefix in &combos {
            for member in &members {
                let mut combo = prefix.clone();
                match member {
                    Value::Tuple(parts) => combo.extend(parts.iter().cloned()),
                    other => combo.push(other.clone()),
                }
                next.push(combo);
            }
        }
        combos = next;
    }
    Ok(combos
        .into_iter()
        .map(|mut combo| {
            if combo.len() == 1 {
                combo.remove(0)
            } else {
                Value::tuple(combo)
            }
        })
        .collect())
}

fn not_constructed(kind: &str) -> ScriptError {
    ScriptError::runtime(format!(
        "{kind} has not been constructed; assign it to a model attribute first"
    ))
}

fn split_rule(args: &CallArgs) -> (Vec<Value>, Option<Value>) {
    let mut sets = args.positional.clone();
    let mut rule = args.keyword("rule").cloned();
    if rule.is_none() && sets.last().is_some_and(is_callable) {
        rule = sets.pop();
    }
    (sets, rule)
}

// -- Domains and markers -----------------------------------------

/// A predefined domain such as `NonNegativeReals`
#[derive(Clone, Copy)]
struct Domain {
    name: &'static str,
    lower: Option<f64>,
    upper: Option<f64>,
    category: Category,
}

const fn domain(name: &'static str, lower: Option<f64>, upper: Option<f64>, category: Category) -> Domain {
    Domain {
        name,
        lower,
        upper,
        category,
    }
}

const DOMAINS: [Domain; 15] = [
    domain("Reals", None, None, Category::Continuous),
    domain("NonNegativeReals", Some(0.), None, Category::Continuous),
    domain("NonPositiveReals", None, Some(0.), Category::Continuous),
    domain("PositiveReals", Some(0.), None, Category::Continuous),
    domain("NegativeReals", None, Some(0.), Category::Continuous),
    domain("Integers", None, None, Category::Integer),
    domain("NonNegativeIntegers", Some(0.), None, Category::Integer),
    domain("PositiveIntegers", Some(1.), None, Category::Integer),
    domain("NonPositiveIntegers", None, Some(0.), Category::Integer),
    domain("NegativeIntegers", None, Some(-1.), Category::Integer),
    domain("Binary", Some(0.), Some(1.), Category::Binary),
    domain("Boolean", Some(0.), Some(1.), Category::Binary),
    domain("UnitInterval", Some(0.), Some(1.), Category::Continuous),
    domain("PercentFraction", Some(0.), Some(1.), Category::Continuous),
    domain("Any", None, None, Category::Continuous),
];

impl ScriptObject for Domain {
    fn type_name(&self) -> &'static str {
        "GlobalSet"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok((name == "name").then(|| Value::str(self.name)))
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.to_string()
    }
}

/// `Constraint.Skip` and friends
struct Marker(&'static str);

impl ScriptObject for Marker {
    fn type_name(&self) -> &'static str {
        "Marker"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.0.to_string()
    }
}

// -- Classes -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    ConcreteModel,
    AbstractModel,
    Set,
    RangeSet,
    Param,
    Var,
    Objective,
    Constraint,
    ConstraintList,
    Expression,
    Suffix,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::ConcreteModel => "ConcreteModel",
            Kind::AbstractModel => "AbstractModel",
            Kind::Set => "Set",
            Kind::RangeSet => "RangeSet",
            Kind::Param => "Param",
            Kind::Var => "Var",
            Kind::Objective => "Objective",
            Kind::Constraint => "Constraint",
            Kind::ConstraintList => "ConstraintList",
            Kind::Expression => "Expression",
            Kind::Suffix => "Suffix",
        }
    }
}

/// A component class; calling it declares a component
struct ComponentClass(Kind);

impl ScriptObject for ComponentClass {
    fn type_name(&self) -> &'static str {
        "type"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(match (self.0, name) {
            (kind, "__name__") => Some(Value::str(kind.name())),
            (Kind::Constraint, "Skip") => Some(Value::object(Marker("Constraint.Skip"))),
            (Kind::Constraint, "Feasible") => Some(Value::object(Marker("Constraint.Feasible"))),
            (Kind::Constraint, "Infeasible") => Some(Value::object(Marker("Constraint.Infeasible"))),
            (Kind::Objective, "Skip") => Some(Value::object(Marker("Objective.Skip"))),
            (Kind::Suffix, "LOCAL") => Some(Value::Int(0)),
            (Kind::Suffix, "EXPORT") => Some(Value::Int(1)),
            (Kind::Suffix, "IMPORT") => Some(Value::Int(2)),
            (Kind::Suffix, "IMPORT_EXPORT") => Some(Value::Int(3)),
            _ => None,
        })
    }

    fn call(&self, session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
        match self.0 {
            Kind::ConcreteModel | Kind::AbstractModel => {
                let name = match args.get(0, "name") {
                    Some(name) => session.display(name),
                    None => "unknown".to_string(),
                };
                let is_abstract = self.0 == Kind::AbstractModel;
                let model: Rc<Model> = Rc::new_cyclic(|this| Model {
                    this: this.clone(),
                    name,
                    is_abstract,
                    attrs: RefCell::new(Vec::new()),
                });
                Ok(Value::Object(model))
            }
            Kind::Set => SetComponent::declare(session, "Set", args),
            Kind::RangeSet => SetComponent::range(session, args),
            Kind::Param => DataComponent::declare("Param", args),
            Kind::Expression => DataComponent::declare("Expression", args),
            Kind::Var => VarComponent::declare(args),
            Kind::Objective => ObjectiveComponent::declare(session, args),
            Kind::Constraint => ConstraintComponent::declare(args, false),
            Kind::ConstraintList => ConstraintComponent::declare(args, true),
            Kind::Suffix => Ok(Value::object(SuffixComponent)),
        }
    }

    fn display(&self, _session: &Session<'_>) -> String {
        format!("<class 'pyomo.environ.{}'>", self.0.name())
    }
}

// -- Models ------------------------------------------------------

/// Building a component once its name and model are known
trait Component {
    fn attach(&self, session: &mut Session<'_>, model: &Value, name: &str) -> Result<(), ScriptError>;
}

fn as_component(value: &Value) -> Option<&dyn Component> {
    if let Some(c) = value.downcast::<SetComponent>() {
        return Some(c);
    }
    if let Some(c) = value.downcast::<DataComponent>() {
        return Some(c);
    }
    if let Some(c) = value.downcast::<VarComponent>() {
        return Some(c);
    }
    if let Some(c) = value.downcast::<ObjectiveComponent>() {
        return Some(c);
    }
    if let Some(c) = value.downcast::<ConstraintComponent>() {
        return Some(c);
    }
    None
}

/// `ConcreteModel()`
pub struct Model {
    this: Weak<Model>,
    name: String,
    is_abstract: bool,
    attrs: RefCell<Vec<(String, Value)>>,
}

impl Model {
    fn handle(&self) -> Result<Value, ScriptError> {
        let this: Rc<Model> = self
            .this
            .upgrade()
            .ok_or_else(|| ScriptError::runtime("model is no longer alive"))?;
        Ok(Value::Object(this))
    }

    fn components(&self) -> Vec<(String, Value)> {
        self.attrs.borrow().clone()
    }

    /// The problem described by the model's variables, active objective and constraints
    pub fn problem(&self, session: &Session<'_>) -> Result<Problem, ScriptError> {
        let mut members: Vec<Variable> = Vec::new();
        let mut objectives: Vec<(Expression, bool)> = Vec::new();
        let mut constraints: Vec<Constraint> = Vec::new();
        for (_, value) in self.components() {
            if let Some(var) = value.downcast::<VarComponent>() {
                members.extend(var.variables());
            } else if let Some(objective) = value.downcast::<ObjectiveComponent>() {
                if objective.active.get() {
                    if let Some(expression) = objective.expression.borrow().clone() {
                        objectives.push((expression, objective.maximize));
                    }
                }
            } else if let Some(constraint) = value.downcast::<ConstraintComponent>() {
                for (name, relation) in constraint.named() {
                    match relation.as_ref() {
                        Relation::Single(c) => constraints.push(c.clone().set_name(name)),
                        Relation::Ranged { lower, upper } => {
                            constraints.push(lower.clone().set_name(format!("{name}_lower")));
                            constraints.push(upper.clone().set_name(format!("{name}_upper")));
                        }
                    }
                }
            }
        }
        if objectives.len() > 1 {
            return Err(ScriptError::value(format!(
                "model '{}' has {} active objectives, expected one",
                self.name,
                objectives.len()
            )));
        }
        let (objective, direction) = match objectives.pop() {
            Some((expression, true)) => (Some(expression), ObjectiveDirection::Maximisation),
            Some((expression, false)) => (Some(expression), ObjectiveDirection::Minimisation),
            None => (None, ObjectiveDirection::Minimisation),
        };
        Ok(Problem::new(
            self.name.clone(),
            direction,
            objective,
            constraints,
            session.variables(),
            members,
        ))
    }
}

impl ScriptObject for Model {
    fn type_name(&self) -> &'static str {
        if self.is_abstract {
            "AbstractModel"
        } else {
            "ConcreteModel"
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        let found = self
            .attrs
            .borrow()
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.clone());
        Ok(found.or_else(|| (name == "name").then(|| Value::str(&self.name))))
    }

    fn set_attr(&self, session: &mut Session<'_>, name: &str, value: Value) -> Result<(), ScriptError> {
        if let Some(component) = as_component(&value) {
            let model = self.handle()?;
            debug!(model = %self.name, component = name, kind = value.type_name(), "constructing component");
            component.attach(session, &model, name)?;
        }
        let mut attrs = self.attrs.borrow_mut();
        match attrs.iter_mut().find(|(attr, _)| attr == name) {
            Some(slot) => slot.1 = value,
            None => attrs.push((name.to_string(), value)),
        }
        Ok(())
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(
            name,
            "create_instance" | "pprint" | "display" | "del_component" | "component" | "write"
        )
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "create_instance" => self.handle(),
            "pprint" | "display" => {
                for (component, value) in self.components() {
                    let size = match &value {
                        Value::Object(obj) => obj.len().unwrap_or(1),
                        _ => 1,
                    };
                    session.push_output(format!("{component} : {} : Size={size}", value.type_name()));
                }
                Ok(Value::None)
            }
            "del_component" => {
                let target = args.required(0, "name", "del_component")?;
                let target = match target.as_str() {
                    Some(name) => name.to_string(),
                    None => session.display(target),
                };
                self.attrs.borrow_mut().retain(|(attr, _)| *attr != target);
                Ok(Value::None)
            }
            "component" => {
                let target = session.display(args.required(0, "name", "component")?);
                Ok(self.get_attr(session, &target)?.unwrap_or(Value::None))
            }
            "write" => {
                debug!("file output is not available to model code, ignored");
                Ok(Value::None)
            }
            _ => Err(ScriptError::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.type_name()
            ))),
        }
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.clone()
    }
}

// -- Sets --------------------------------------------------------

/// `Set` and `RangeSet`
struct SetComponent {
    kind: &'static str,
    name: RefCell<String>,
    members: RefCell<Dict>,
    rule: Option<Value>,
}

impl SetComponent {
    fn with_members(kind: &'static str, members: Vec<Value>, rule: Option<Value>) -> Result<Value, ScriptError> {
        let mut dict = Dict::new();
        for member in members {
            dict.insert(member, Value::None)?;
        }
        Ok(Value::object(SetComponent {
            kind,
            name: RefCell::new(String::new()),
            members: RefCell::new(dict),
            rule,
        }))
    }

    fn declare(session: &mut Session<'_>, kind: &'static str, args: CallArgs) -> Result<Value, ScriptError> {
        let init = args
            .keyword("initialize")
            .or_else(|| args.keyword("rule"))
            .or_else(|| args.positional.first())
            .cloned();
        match init {
            None | Some(Value::None) => Self::with_members(kind, Vec::new(), None),
            Some(rule) if is_callable(&rule) => Self::with_members(kind, Vec::new(), Some(rule)),
            Some(data) => {
                let members = session.iterate(&data)?;
                Self::with_members(kind, members, None)
            }
        }
    }

    fn range(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
        let numbers: Vec<f64> = args
            .positional
            .iter()
            .map(|v| {
                ops::number(session, v)
                    .ok_or_else(|| ScriptError::type_error("RangeSet bounds must be numbers"))
            })
            .collect::<Result<_, _>>()?;
        let (start, end, step) = match numbers.as_slice() {
            [end] => (1., *end, 1.),
            [start, end] => (*start, *end, 1.),
            [start, end, step] => (*start, *end, *step),
            _ => return Err(ScriptError::type_error("RangeSet() takes 1 to 3 arguments")),
        };
        if step == 0. {
            return Err(ScriptError::value("RangeSet step must be non-zero"));
        }
        let count = ((end - start) / step).floor() + 1.;
        let count = if count.is_finite() && count > 0. { count as usize } else { 0 };
        session.check_size(count)?;
        let integral = [start, end, step].iter().all(|v| v.fract() == 0.);
        let members = (0..count)
            .map(|i| {
                let v = start + i as f64 * step;
                if integral {
                    Value::Int(v as i64)
                } else {
                    Value::Float(v)
                }
            })
            .collect();
        Self::with_members("RangeSet", members, None)
    }

    fn items(&self) -> Vec<Value> {
        self.members.borrow().keys()
    }
}

impl Component for SetComponent {
    fn attach(&self, session: &mut Session<'_>, model: &Value, name: &str) -> Result<(), ScriptError> {
        *self.name.borrow_mut() = name.to_string();
        if let Some(rule) = &self.rule {
            let data = session.call(rule, CallArgs::new(vec![model.clone()]))?;
            let members = session.iterate(&data)?;
            let mut dict = self.members.borrow_mut();
            for member in members {
                dict.insert(member, Value::None)?;
            }
        }
        Ok(())
    }
}

impl ScriptObject for SetComponent {
    fn type_name(&self) -> &'static str {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok((name == "name").then(|| Value::str(&*self.name.borrow())))
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "first" | "last" | "data" | "add" | "at" | "ord" | "ordered_data")
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        let items = self.items();
        match name {
            "first" => items.first().cloned().ok_or_else(|| ScriptError::index("set is empty")),
            "last" => items.last().cloned().ok_or_else(|| ScriptError::index("set is empty")),
            "data" | "ordered_data" => Ok(Value::tuple(items)),
            "add" => {
                session.check_size(items.len() + args.positional.len())?;
                let mut members = self.members.borrow_mut();
                for member in args.positional {
                    members.insert(member, Value::None)?;
                }
                Ok(Value::None)
            }
            "at" => {
                let position = args.required(0, "index", "at")?.as_i64().unwrap_or(0);
                usize::try_from(position - 1)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| ScriptError::index(format!("{position} is not a valid position")))
            }
            "ord" => {
                let member = args.required(0, "item", "ord")?;
                let key = member.key()?;
                let position = items
                    .iter()
                    .position(|item| item.key().map(|k| k == key).unwrap_or(false))
                    .ok_or_else(|| ScriptError::value(format!("{} is not in the set", session.repr(member))))?;
                Ok(Value::Int(position as i64 + 1))
            }
            _ => Err(ScriptError::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.kind
            ))),
        }
    }

    fn iterate(&self, _session: &mut Session<'_>) -> Result<Vec<Value>, ScriptError> {
        Ok(self.items())
    }

    fn len(&self) -> Option<usize> {
        Some(self.members.borrow().len())
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.borrow().clone()
    }
}

// -- Params and named expressions -------------------------------

/// `Param` and `Expression`: a value per index, computed from `initialize` or a rule
struct DataComponent {
    kind: &'static str,
    name: RefCell<String>,
    sets: Vec<Value>,
    init: Option<Value>,
    default: Option<Value>,
    mutable: bool,
    values: RefCell<Dict>,
    scalar: RefCell<Option<Value>>,
    constructed: Cell<bool>,
}

impl DataComponent {
    fn declare(kind: &'static str, args: CallArgs) -> Result<Value, ScriptError> {
        let (sets, rule) = split_rule(&args);
        let init = rule
            .or_else(|| args.keyword("initialize").cloned())
            .or_else(|| args.keyword("expr").cloned());
        Ok(Value::object(DataComponent {
            kind,
            name: RefCell::new(String::new()),
            sets,
            init,
            default: args.keyword("default").cloned(),
            mutable: args.keyword("mutable").map(|m| matches!(m, Value::Bool(true))).unwrap_or(false),
            values: RefCell::new(Dict::new()),
            scalar: RefCell::new(None),
            constructed: Cell::new(false),
        }))
    }

    fn indexed(&self) -> bool {
        !self.sets.is_empty()
    }

    fn scalar_value(&self) -> Option<Value> {
        self.scalar.borrow().clone().or_else(|| self.default.clone())
    }

    fn lookup(&self, session: &Session<'_>, index: &Value) -> Result<Value, ScriptError> {
        let found = self.values.borrow().get(&index.key()?).cloned();
        found.or_else(|| self.default.clone()).ok_or_else(|| {
            ScriptError::key(format!(
                "Index '{}' is not valid for indexed component '{}'",
                index_label(session, index),
                self.name.borrow()
            ))
        })
    }
}

impl Component for DataComponent {
    fn attach(&self, session: &mut Session<'_>, model: &Value, name: &str) -> Result<(), ScriptError> {
        *self.name.borrow_mut() = name.to_string();
        if self.constructed.replace(true) {
            return Ok(());
        }
        if !self.indexed() {
            let value = match &self.init {
                Some(rule) if is_callable(rule) => Some(session.call(rule, rule_args(model, &Value::None))?),
                Some(Value::None) | None => None,
                Some(value) => Some(value.clone()),
            };
            *self.scalar.borrow_mut() = value;
            return Ok(());
        }
        match &self.init {
            None | Some(Value::None) => {}
            Some(Value::Dict(data)) => {
                let data = data.borrow().clone();
                let mut values = self.values.borrow_mut();
                for (index, value) in data.iter() {
                    values.insert(index.clone(), value.clone())?;
                }
            }
            Some(rule) if is_callable(rule) => {
                for index in index_product(session, &self.sets)? {
                    let value = session.call(rule, rule_args(model, &index))?;
                    self.values.borrow_mut().insert(index, value)?;
                }
            }
            Some(value) => {
                for index in index_product(session, &self.sets)? {
                    self.values.borrow_mut().insert(index, value.clone())?;
                }
            }
        }
        Ok(())
    }
}

impl ScriptObject for DataComponent {
    fn type_name(&self) -> &'static str {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(match name {
            "name" => Some(Value::str(&*self.name.borrow())),
            "value" if !self.indexed() => Some(evaluate(session, &self.scalar_value().unwrap_or(Value::None))),
            "expr" if !self.indexed() => Some(self.scalar_value().unwrap_or(Value::None)),
            _ => None,
        })
    }

    fn set_attr(&self, _session: &mut Session<'_>, name: &str, value: Value) -> Result<(), ScriptError> {
        if name == "value" && !self.indexed() && self.mutable {
            *self.scalar.borrow_mut() = Some(value);
            return Ok(());
        }
        Err(ScriptError::attribute(format!(
            "'{}' object attribute '{name}' is read-only; declare the parameter with mutable=True",
            self.kind
        )))
    }

    fn has_method(&self, name: &str) -> bool {
        self.indexed() && matches!(name, "keys" | "values" | "items")
    }

    fn call_method(&self, _session: &mut Session<'_>, name: &str, _args: CallArgs) -> Result<Value, ScriptError> {
        let values = self.values.borrow();
        match name {
            "keys" => Ok(Value::list(values.keys())),
            "values" => Ok(Value::list(values.values())),
            "items" => Ok(Value::list(values.items())),
            _ => Err(ScriptError::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.kind
            ))),
        }
    }

    fn call(&self, session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
        match self.scalar_value() {
            Some(value) if !self.indexed() => Ok(evaluate(session, &value)),
            _ => Err(ScriptError::type_error(format!(
                "indexed {} '{}' is not callable",
                self.kind,
                self.name.borrow()
            ))),
        }
    }

    fn get_item(&self, session: &mut Session<'_>, index: &Value) -> Result<Value, ScriptError> {
        if !self.indexed() {
            return match index {
                Value::None => self.scalar_value().ok_or_else(|| not_constructed(self.kind)),
                _ => Err(ScriptError::type_error(format!(
                    "scalar {} '{}' cannot be indexed",
                    self.kind,
                    self.name.borrow()
                ))),
            };
        }
        self.lookup(session, index)
    }

    fn set_item(&self, _session: &mut Session<'_>, index: &Value, value: Value) -> Result<(), ScriptError> {
        if !self.mutable {
            return Err(ScriptError::type_error(format!(
                "{} '{}' is immutable; declare it with mutable=True",
                self.kind,
                self.name.borrow()
            )));
        }
        self.values.borrow_mut().insert(index.clone(), value)
    }

    fn iterate(&self, _session: &mut Session<'_>) -> Result<Vec<Value>, ScriptError> {
        Ok(self.values.borrow().keys())
    }

    fn len(&self) -> Option<usize> {
        self.indexed().then(|| self.values.borrow().len())
    }

    fn as_linear(&self, session: &Session<'_>) -> Option<Expression> {
        if self.indexed() {
            return None;
        }
        self.scalar_value().and_then(|value| ops::linear(session, &value))
    }

    fn as_scalar(&self, session: &Session<'_>) -> Option<Value> {
        if self.indexed() || self.kind != "Param" {
            return None;
        }
        self.scalar_value()
            .filter(|value| ops::number(session, value).is_some())
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.borrow().clone()
    }
}

// -- Variables ---------------------------------------------------

/// `Var`
struct VarComponent {
    name: RefCell<String>,
    sets: Vec<Value>,
    domain: Domain,
    bounds: Option<Value>,
    entries: RefCell<Dict>,
    order: RefCell<Vec<Variable>>,
    scalar: Cell<Option<Variable>>,
}

impl VarComponent {
    fn declare(args: CallArgs) -> Result<Value, ScriptError> {
        let domain = match args.keyword("domain").or_else(|| args.keyword("within")) {
            None => DOMAINS[0],
            Some(value) => *value.downcast::<Domain>().ok_or_else(|| {
                ScriptError::type_error(format!(
                    "Var domain must be a set such as NonNegativeReals, not '{}'",
                    value.type_name()
                ))
            })?,
        };
        let bounds = args.keyword("bounds").filter(|b| !matches!(b, Value::None)).cloned();
        Ok(Value::object(VarComponent {
            name: RefCell::new(String::new()),
            sets: args.positional.clone(),
            domain,
            bounds,
            entries: RefCell::new(Dict::new()),
            order: RefCell::new(Vec::new()),
            scalar: Cell::new(None),
        }))
    }

    fn variables(&self) -> Vec<Variable> {
        self.order.borrow().clone()
    }

    fn create(&self, session: &mut Session<'_>, model: &Value, name: String, index: &Value) -> Result<Variable, ScriptError> {
        let (mut lower, mut upper) = (self.domain.lower, self.domain.upper);
        if let Some(bounds) = &self.bounds {
            let bounds = if is_callable(bounds) {
                session.call(bounds, rule_args(model, index))?
            } else {
                bounds.clone()
            };
            let parts = session.iterate(&bounds)?;
            let [lo, hi] = parts.as_slice() else {
                return Err(ScriptError::value(format!("bounds of {name} must be a (lower, upper) pair")));
            };
            if let Some(lo) = bound(session, Some(lo), "lower bound")? {
                lower = Some(lower.map_or(lo, |d| d.max(lo)));
            }
            if let Some(hi) = bound(session, Some(hi), "upper bound")? {
                upper = Some(upper.map_or(hi, |d| d.min(hi)));
            }
        }
        let mut definition = VariableDefinition::new().name(name);
        if let Some(lower) = lower {
            definition = definition.min(lower);
        }
        if let Some(upper) = upper {
            definition = definition.max(upper);
        }
        let var = session.add_variable(definition.category(self.domain.category))?;
        self.order.borrow_mut().push(var);
        Ok(var)
    }

    fn scalar_data(&self) -> Option<VarData> {
        self.scalar.get().map(|var| VarData { var })
    }
}

impl Component for VarComponent {
    fn attach(&self, session: &mut Session<'_>, model: &Value, name: &str) -> Result<(), ScriptError> {
        *self.name.borrow_mut() = name.to_string();
        if !self.order.borrow().is_empty() || self.scalar.get().is_some() {
            return Ok(());
        }
        if self.sets.is_empty() {
            let var = self.create(session, model, name.to_string(), &Value::None)?;
            self.scalar.set(Some(var));
            return Ok(());
        }
        for index in index_product(session, &self.sets)? {
            let label = format!("{name}[{}]", index_label(session, &index));
            let var = self.create(session, model, label, &index)?;
            self.entries
                .borrow_mut()
                .insert(index, Value::object(VarData { var }))?;
        }
        Ok(())
    }
}

impl ScriptObject for VarComponent {
    fn type_name(&self) -> &'static str {
        "Var"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        if name == "name" {
            return Ok(Some(Value::str(&*self.name.borrow())));
        }
        match self.scalar_data() {
            Some(data) => data.get_attr(session, name),
            None => Ok(None),
        }
    }

    fn set_attr(&self, session: &mut Session<'_>, name: &str, value: Value) -> Result<(), ScriptError> {
        match self.scalar_data() {
            Some(data) => data.set_attr(session, name, value),
            None => Err(ScriptError::attribute(format!(
                "'Var' object attribute '{name}' is read-only"
            ))),
        }
    }

    fn has_method(&self, name: &str) -> bool {
        match self.scalar.get() {
            Some(_) => VarData::METHODS.contains(&name),
            None => matches!(name, "keys" | "values" | "items" | "fix" | "unfix"),
        }
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        if let Some(data) = self.scalar_data() {
            return data.call_method(session, name, args);
        }
        let entries = self.entries.borrow().clone();
        match name {
            "keys" => Ok(Value::list(entries.keys())),
            "values" => Ok(Value::list(entries.values())),
            "items" => Ok(Value::list(entries.items())),
            "fix" | "unfix" => {
                for value in entries.values() {
                    if let Some(data) = value.downcast::<VarData>() {
                        data.call_method(session, name, args.clone())?;
                    }
                }
                Ok(Value::None)
            }
            _ => Err(ScriptError::attribute(format!("'Var' object has no attribute '{name}'"))),
        }
    }

    fn call(&self, session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
        match self.scalar.get() {
            Some(var) => Ok(Value::from_f64(session.value_of(var))),
            None => Err(ScriptError::type_error("an indexed Var is not callable")),
        }
    }

    fn get_item(&self, session: &mut Session<'_>, index: &Value) -> Result<Value, ScriptError> {
        if let (Some(var), Value::None) = (self.scalar.get(), index) {
            return Ok(Value::object(VarData { var }));
        }
        let found = self.entries.borrow().get(&index.key()?).cloned();
        found.ok_or_else(|| {
            ScriptError::key(format!(
                "Index '{}' is not valid for indexed component '{}'",
                index_label(session, index),
                self.name.borrow()
            ))
        })
    }

    fn iterate(&self, _session: &mut Session<'_>) -> Result<Vec<Value>, ScriptError> {
        Ok(self.entries.borrow().keys())
    }

    fn len(&self) -> Option<usize> {
        Some(match self.scalar.get() {
            Some(_) => 1,
            None => self.entries.borrow().len(),
        })
    }

    fn as_linear(&self, _session: &Session<'_>) -> Option<Expression> {
        self.scalar.get().map(Expression::from)
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.borrow().clone()
    }
}

/// One variable of a `Var` component
struct VarData {
    var: Variable,
}

impl VarData {
    const METHODS: [&'static str; 8] = [
        "fix", "unfix", "setlb", "setub", "is_integer", "is_binary", "is_continuous", "is_fixed",
    ];

    fn definition<'s>(&self, session: &'s Session<'_>) -> Option<&'s VariableDefinition> {
        session.variables().definition(self.var)
    }

    fn update(&self, session: &mut Session<'_>, f: impl FnOnce(&mut VariableDefinition)) {
        if let Some(definition) = session.variables_mut().definition_mut(self.var) {
            f(definition);
        }
    }
}

impl ScriptObject for VarData {
    fn type_name(&self) -> &'static str {
        "VarData"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        let Some(definition) = self.definition(session) else {
            return Ok(None);
        };
        Ok(match name {
            "name" => Some(Value::str(&definition.name)),
            "lb" => Some(Value::from_f64(definition.lower_bound())),
            "ub" => Some(Value::from_f64(definition.upper_bound())),
            "value" => Some(Value::from_f64(session.value_of(self.var))),
            "fixed" => Some(Value::Bool(definition.min == definition.max)),
            _ => None,
        })
    }

    fn set_attr(&self, session: &mut Session<'_>, name: &str, value: Value) -> Result<(), ScriptError> {
        match name {
            // initial values only seed the search, which the backends here do not use
            "value" => Ok(()),
            "lb" | "ub" => {
                let limit = bound(session, Some(&value), name)?;
                self.update(session, |d| match name {
                    "lb" => d.min = limit.unwrap_or(f64::NEG_INFINITY),
                    _ => d.max = limit.unwrap_or(f64::INFINITY),
                });
                Ok(())
            }
            _ => Err(ScriptError::attribute(format!(
                "'VarData' object attribute '{name}' is read-only"
            ))),
        }
    }

    fn has_method(&self, name: &str) -> bool {
        Self::METHODS.contains(&name)
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        let category = self
            .definition(session)
            .map(|d| d.category)
            .unwrap_or(Category::Continuous);
        match name {
            "fix" => {
                let at = match args.get(0, "value") {
                    Some(value) => bound(session, Some(value), "fixed value")?,
                    None => session.value_of(self.var),
                };
                let at = at.ok_or_else(|| ScriptError::value("fix() needs a value for an unsolved variable"))?;
                self.update(session, |d| {
                    d.min = at;
                    d.max = at;
                });
                Ok(Value::None)
            }
            // bounds are not remembered once fixed
            "unfix" => Ok(Value::None),
            "setlb" | "setub" => {
                let limit = bound(session, args.get(0, "val"), "bound")?;
                self.update(session, |d| {
                    if name == "setlb" {
                        d.min = limit.unwrap_or(f64::NEG_INFINITY);
                    } else {
                        d.max = limit.unwrap_or(f64::INFINITY);
                    }
                });
                Ok(Value::None)
            }
            "is_integer" => Ok(Value::Bool(category.is_integer())),
            "is_binary" => Ok(Value::Bool(category == Category::Binary)),
            "is_continuous" => Ok(Value::Bool(!category.is_integer())),
            "is_fixed" => Ok(Value::Bool(
                self.definition(session).map(|d| d.min == d.max).unwrap_or(false),
            )),
            _ => Err(ScriptError::attribute(format!(
                "'VarData' object has no attribute '{name}'"
            ))),
        }
    }

    fn call(&self, session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
        Ok(Value::from_f64(session.value_of(self.var)))
    }

    fn as_linear(&self, _session: &Session<'_>) -> Option<Expression> {
        Some(Expression::from(self.var))
    }

    fn display(&self, session: &Session<'_>) -> String {
        session.variables().name(self.var).unwrap_or("?").to_string()
    }
}

// -- Objectives --------------------------------------------------

/// `Objective`
struct ObjectiveComponent {
    name: RefCell<String>,
    rule: Option<Value>,
    maximize: bool,
    expression: RefCell<Option<Expression>>,
    active: Cell<bool>,
}

impl ObjectiveComponent {
    fn declare(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
        if args.positional.iter().any(|a| !is_callable(a)) {
            return Err(ScriptError::type_error("indexed objectives are not supported"));
        }
        let (_, rule) = split_rule(&args);
        let maximize = match args.keyword("sense") {
            None => false,
            Some(sense) => match (sense.as_i64(), sense.as_str()) {
                (Some(MAXIMIZE), _) | (_, Some("maximize")) => true,
                (Some(MINIMIZE), _) | (_, Some("minimize")) => false,
                _ => {
                    return Err(ScriptError::value(format!(
                        "objective sense must be minimize or maximize, not {}",
                        session.repr(sense)
                    )))
                }
            },
        };
        let expression = match args.keyword("expr") {
            Some(expr) => Some(expect_linear(session, expr, "objective")?),
            None => None,
        };
        Ok(Value::object(ObjectiveComponent {
            name: RefCell::new(String::new()),
            rule,
            maximize,
            expression: RefCell::new(expression),
            active: Cell::new(true),
        }))
    }
}

impl Component for ObjectiveComponent {
    fn attach(&self, session: &mut Session<'_>, model: &Value, name: &str) -> Result<(), ScriptError> {
        *self.name.borrow_mut() = name.to_string();
        let Some(rule) = &self.rule else {
            return Ok(());
        };
        if self.expression.borrow().is_some() {
            return Ok(());
        }
        let result = session.call(rule, rule_args(model, &Value::None))?;
        if result.downcast::<Marker>().is_some() {
            self.active.set(false);
            return Ok(());
        }
        let expression = expect_linear(session, &result, "objective rule result")?;
        *self.expression.borrow_mut() = Some(expression);
        Ok(())
    }
}

impl ScriptObject for ObjectiveComponent {
    fn type_name(&self) -> &'static str {
        "Objective"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(match name {
            "name" => Some(Value::str(&*self.name.borrow())),
            "expr" => Some(self.expression.borrow().clone().map(Value::expr).unwrap_or(Value::None)),
            "sense" => Some(Value::Int(if self.maximize { MAXIMIZE } else { MINIMIZE })),
            "active" => Some(Value::Bool(self.active.get())),
            _ => None,
        })
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "activate" | "deactivate" | "is_minimizing")
    }

    fn call_method(&self, _session: &mut Session<'_>, name: &str, _args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "activate" => self.active.set(true),
            "deactivate" => self.active.set(false),
            "is_minimizing" => return Ok(Value::Bool(!self.maximize)),
            _ => {
                return Err(ScriptError::attribute(format!(
                    "'Objective' object has no attribute '{name}'"
                )))
            }
        }
        Ok(Value::None)
    }

    fn call(&self, session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
        let expression = self.expression.borrow().clone();
        Ok(expression
            .map(|e| Value::from_f64(e.eval_with(session.solution())))
            .unwrap_or(Value::None))
    }

    fn as_linear(&self, _session: &Session<'_>) -> Option<Expression> {
        self.expression.borrow().clone()
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.borrow().clone()
    }
}

// -- Constraints -------------------------------------------------

/// `Constraint` and `ConstraintList`
struct ConstraintComponent {
    list: bool,
    name: RefCell<String>,
    sets: Vec<Value>,
    rule: Option<Value>,
    expr: Option<Value>,
    /// Index label and relation, in declaration order; scalar constraints have no label
    entries: RefCell<Vec<(Option<String>, Rc<Relation>)>>,
    lookup: RefCell<Dict>,
}

impl ConstraintComponent {
    fn declare(args: CallArgs, list: bool) -> Result<Value, ScriptError> {
        let (sets, rule) = split_rule(&args);
        if list && (!sets.is_empty() || rule.is_some()) {
            return Err(ScriptError::type_error("ConstraintList() takes no index sets or rule"));
        }
        Ok(Value::object(ConstraintComponent {
            list,
            name: RefCell::new(String::new()),
            sets,
            rule,
            expr: args.keyword("expr").cloned(),
            entries: RefCell::new(Vec::new()),
            lookup: RefCell::new(Dict::new()),
        }))
    }

    /// The relation a rule returned, or `None` when the rule skipped this index
    fn relation(&self, session: &mut Session<'_>, value: &Value, label: &str) -> Result<Option<Relation>, ScriptError> {
        match value {
            Value::Relation(relation) => Ok(Some((**relation).clone())),
            Value::Object(obj) => match obj.as_any().downcast_ref::<Marker>() {
                Some(Marker("Constraint.Infeasible")) => Err(ScriptError::value(format!(
                    "constraint '{label}' is always infeasible"
                ))),
                Some(_) => Ok(None),
                None => Err(ScriptError::value(format!(
                    "constraint '{label}' must be a relation, got '{}'",
                    obj.type_name()
                ))),
            },
            Value::Tuple(parts) => match parts.as_slice() {
                [body, rhs] => {
                    let body = expect_linear(session, body, "constraint body")?;
                    let rhs = expect_linear(session, rhs, "constraint bound")?;
                    Ok(Some(Relation::Single(body.equal(rhs))))
                }
                [lower, body, upper] => {
                    let lower = bound(session, Some(lower), "constraint lower bound")?;
                    let upper = bound(session, Some(upper), "constraint upper bound")?;
                    let body = expect_linear(session, body, "constraint body")?;
                    Ok(range_relation(lower, body, upper))
                }
                _ => Err(ScriptError::value(format!(
                    "constraint '{label}' tuple must have two or three entries"
                ))),
            },
            Value::Bool(b) => Err(ScriptError::value(format!(
                "constraint '{label}' does not have a proper value, found '{}'; use Constraint.Skip or Constraint.Feasible",
                if *b { "True" } else { "False" }
            ))),
            other => Err(ScriptError::value(format!(
                "constraint '{label}' must be a relation, got '{}'",
                other.type_name()
            ))),
        }
    }

    fn push(&self, session: &mut Session<'_>, index: Value, label: Option<String>, relation: Relation) -> Result<(), ScriptError> {
        let relation = Rc::new(relation);
        let position = {
            let mut entries = self.entries.borrow_mut();
            entries.push((label, relation));
            entries.len() - 1
        };
        session.check_size(position + 1)?;
        self.lookup.borrow_mut().insert(index, Value::Int(position as i64))
    }

    /// Every relation with its full name
    fn named(&self) -> Vec<(String, Rc<Relation>)> {
        let name = self.name.borrow();
        self.entries
            .borrow()
            .iter()
            .map(|(label, relation)| {
                let full = match label {
                    Some(label) => format!("{name}[{label}]"),
                    None => name.clone(),
                };
                (full, relation.clone())
            })
            .collect()
    }
}

fn range_relation(lower: Option<f64>, body: Expression, upper: Option<f64>) -> Option<Relation> {
    match (lower, upper) {
        (None, None) => None,
        (Some(lo), None) => Some(Relation::Single(body.geq(Expression::from(lo)))),
        (None, Some(hi)) => Some(Relation::Single(body.leq(Expression::from(hi)))),
        (Some(lo), Some(hi)) if lo == hi => Some(Relation::Single(body.equal(Expression::from(lo)))),
        (Some(lo), Some(hi)) => Some(Relation::Ranged {
            lower: body.clone().geq(Expression::from(lo)),
            upper: body.leq(Expression::from(hi)),
        }),
    }
}

impl Component for ConstraintComponent {
    fn attach(&self, session: &mut Session<'_>, model: &Value, name: &str) -> Result<(), ScriptError> {
        *self.name.borrow_mut() = name.to_string();
        if self.list || !self.entries.borrow().is_empty() {
            return Ok(());
        }
        if self.sets.is_empty() {
            let value = match (&self.rule, &self.expr) {
                (Some(rule), _) => session.call(rule, rule_args(model, &Value::None))?,
                (None, Some(expr)) => expr.clone(),
                (None, None) => return Ok(()),
            };
            if let Some(relation) = self.relation(session, &value, name)? {
                self.push(session, Value::None, None, relation)?;
            }
            return Ok(());
        }
        let Some(rule) = &self.rule else {
            return Err(ScriptError::type_error(format!(
                "indexed constraint '{name}' needs a rule"
            )));
        };
        for index in index_product(session, &self.sets)? {
            let label = index_label(session, &index);
            let value = session.call(rule, rule_args(model, &index))?;
            if let Some(relation) = self.relation(session, &value, &format!("{name}[{label}]"))? {
                self.push(session, index, Some(label), relation)?;
            }
        }
        Ok(())
    }
}

impl ScriptObject for ConstraintComponent {
    fn type_name(&self) -> &'static str {
        if self.list {
            "ConstraintList"
        } else {
            "Constraint"
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok((name == "name").then(|| Value::str(&*self.name.borrow())))
    }

    fn has_method(&self, name: &str) -> bool {
        match name {
            "add" => self.list,
            "keys" | "values" | "items" => true,
            _ => false,
        }
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "add" if self.list => {
                let value = args.required(0, "expr", "add")?.clone();
                let position = self.entries.borrow().len() + 1;
                let label = format!("{}[{position}]", self.name.borrow());
                if let Some(relation) = self.relation(session, &value, &label)? {
                    self.push(session, Value::Int(position as i64), Some(position.to_string()), relation)?;
                }
                Ok(Value::None)
            }
            "keys" => Ok(Value::list(self.lookup.borrow().keys())),
            "values" | "items" => {
                let keys = self.lookup.borrow().keys();
                let mut out = Vec::with_capacity(keys.len());
                for key in keys {
                    let data = self.get_item(session, &key)?;
                    out.push(if name == "items" {
                        Value::tuple(vec![key, data])
                    } else {
                        data
                    });
                }
                Ok(Value::list(out))
            }
            _ => Err(ScriptError::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.type_name()
            ))),
        }
    }

    fn get_item(&self, session: &mut Session<'_>, index: &Value) -> Result<Value, ScriptError> {
        let position = self.lookup.borrow().get(&index.key()?).and_then(Value::as_i64);
        let entry = position.and_then(|p| self.entries.borrow().get(p as usize).cloned());
        let Some((label, relation)) = entry else {
            return Err(ScriptError::key(format!(
                "Index '{}' is not valid for indexed component '{}'",
                index_label(session, index),
                self.name.borrow()
            )));
        };
        let name = match label {
            Some(label) => format!("{}[{label}]", self.name.borrow()),
            None => self.name.borrow().clone(),
        };
        Ok(Value::object(ConstraintData { name, relation }))
    }

    fn iterate(&self, _session: &mut Session<'_>) -> Result<Vec<Value>, ScriptError> {
        Ok(self.lookup.borrow().keys())
    }

    fn len(&self) -> Option<usize> {
        Some(self.entries.borrow().len())
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.borrow().clone()
    }
}

/// One constraint of a `Constraint` component
struct ConstraintData {
    name: String,
    relation: Rc<Relation>,
}

impl ConstraintData {
    fn body(&self) -> Expression {
        let constraint = match self.relation.as_ref() {
            Relation::Single(c) => c,
            Relation::Ranged { upper, .. } => upper,
        };
        let mut body = constraint.expression().clone();
        body.constant = 0.;
        body
    }

    fn limit(&self, upper: bool) -> Option<f64> {
        use crate::model::Sense;
        self.relation
            .constraints()
            .iter()
            .find(|c| match c.sense() {
                Sense::Equal => true,
                Sense::LessOrEqual => upper,
                Sense::GreaterOrEqual => !upper,
            })
            .map(Constraint::rhs)
    }
}

impl ScriptObject for ConstraintData {
    fn type_name(&self) -> &'static str {
        "ConstraintData"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(match name {
            "name" => Some(Value::str(&self.name)),
            "body" => Some(Value::expr(self.body())),
            "upper" => Some(Value::from_f64(self.limit(true))),
            "lower" => Some(Value::from_f64(self.limit(false))),
            "expr" => Some(Value::Relation(self.relation.clone())),
            _ => None,
        })
    }

    fn call(&self, session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
        Ok(Value::from_f64(self.body().eval_with(session.solution())))
    }

    fn display(&self, session: &Session<'_>) -> String {
        self.relation
            .constraints()
            .iter()
            .map(|c| {
                Named {
                    item: c,
                    variables: session.variables(),
                }
                .to_string()
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// `Suffix`. Duals and reduced costs are not reported, so lookups give `None`.
struct SuffixComponent;

impl ScriptObject for SuffixComponent {
    fn type_name(&self) -> &'static str {
        "Suffix"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_item(&self, _session: &mut Session<'_>, _index: &Value) -> Result<Value, ScriptError> {
        Ok(Value::None)
    }

    fn has_method(&self, name: &str) -> bool {
        name == "get"
    }

    fn call_method(&self, _session: &mut Session<'_>, _name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        Ok(args.get(1, "default").cloned().unwrap_or(Value::None))
    }
}

// -- Solving -----------------------------------------------------

fn solver_factory(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let name = match args.get(0, "name") {
        Some(name) => session.display(name),
        None => return Err(ScriptError::type_error("SolverFactory() missing required argument 'name'")),
    };
    Ok(Value::object(SolverObject {
        name,
        options: Value::dict(Dict::new()),
    }))
}

/// What `SolverFactory(name)` returns. The name is informational: the backend is chosen by
/// the caller of the pipeline.
struct SolverObject {
    name: String,
    options: Value,
}

impl ScriptObject for SolverObject {
    fn type_name(&self) -> &'static str {
        "SolverFactory"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(match name {
            "options" => Some(self.options.clone()),
            "name" => Some(Value::str(&self.name)),
            _ => None,
        })
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "solve" | "available" | "license_is_valid")
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "solve" => {
                let model = args.required(0, "model", "solve")?;
                let model = model.downcast::<Model>().ok_or_else(|| {
                    ScriptError::type_error(format!(
                        "solve() expects a model, not '{}'",
                        model.type_name()
                    ))
                })?;
                let problem = model.problem(session)?;
                let status = session.solve_problem(&problem)?;
                debug!(
                    requested = %self.name,
                    backend = session.backend_name(),
                    termination = termination_condition(status),
                    "SolverFactory.solve"
                );
                Ok(Value::object(Results { status }))
            }
            "available" | "license_is_valid" => Ok(Value::Bool(true)),
            _ => Err(ScriptError::attribute(format!(
                "'SolverFactory' object has no attribute '{name}'"
            ))),
        }
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.clone()
    }
}

/// The value returned by `solver.solve(model)`
struct Results {
    status: SolveStatus,
}

impl ScriptObject for Results {
    fn type_name(&self) -> &'static str {
        "SolverResults"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok((name == "solver").then(|| {
            let solver = Module::new("solver")
                .with("status", Value::str(solver_status(self.status)))
                .with("termination_condition", Value::str(termination_condition(self.status)));
            Value::Module(Rc::new(solver))
        }))
    }

    fn has_method(&self, name: &str) -> bool {
        name == "write"
    }

    fn call_method(&self, session: &mut Session<'_>, _name: &str, _args: CallArgs) -> Result<Value, ScriptError> {
        let text = self.display(session);
        for line in text.lines() {
            session.push_output(line.to_string());
        }
        Ok(Value::None)
    }

    fn display(&self, _session: &Session<'_>) -> String {
        format!(
            "Solver:\n- Status: {}\n  Termination condition: {}",
            solver_status(self.status),
            termination_condition(self.status)
        )
    }
}

fn results_status(value: &Value) -> Result<SolveStatus, ScriptError> {
    value
        .downcast::<Results>()
        .map(|r| r.status)
        .ok_or_else(|| ScriptError::type_error(format!("expected solver results, not '{}'", value.type_name())))
}

fn check_optimal_termination(_session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let status = results_status(args.required(0, "results", "check_optimal_termination")?)?;
    Ok(Value::Bool(status == SolveStatus::Optimal))
}

fn assert_optimal_termination(_session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let status = results_status(args.required(0, "results", "assert_optimal_termination")?)?;
    if status != SolveStatus::Optimal {
        return Err(ScriptError::runtime(format!(
            "Solver failed to return an optimal solution. Solver status: {}, Termination condition: {}",
            solver_status(status),
            termination_condition(status)
        )));
    }
    Ok(Value::None)
}

// -- Module functions --------------------------------------------

fn value(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let x = args.required(0, "obj", "value")?;
    Ok(evaluate(session, x))
}

fn quicksum(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let iterable = args.required(0, "args", "quicksum")?.clone();
    let start = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
    let items = session.iterate(&iterable)?;
    sum_values(session, items, start)
}

fn summation(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let first = args.required(0, "a", "summation")?.clone();
    let second = args.positional.get(1).cloned();
    let indices = match args.keyword("index") {
        Some(index) => {
            let index = index.clone();
            session.iterate(&index)?
        }
        None => session.iterate(&first)?,
    };
    let mut terms = Vec::with_capacity(indices.len());
    for index in indices {
        let a = session.get_item(&first, &index)?;
        let term = match &second {
            Some(second) => {
                let b = session.get_item(second, &index)?;
                ops::binary(session, BinOp::Mul, &a, &b)?
            }
            None => a,
        };
        terms.push(term);
    }
    sum_values(session, terms, Value::Int(0))
}

fn inequality(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let lower = bound(session, args.get(0, "lower"), "lower")?;
    let body = expect_linear(session, args.required(1, "body", "inequality")?, "inequality body")?;
    let upper = bound(session, args.get(2, "upper"), "upper")?;
    range_relation(lower, body, upper)
        .map(|relation| Value::Relation(Rc::new(relation)))
        .ok_or_else(|| ScriptError::value("inequality() needs a lower or an upper bound"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{parse, ErrorKind, Limits};
    use crate::solvers::microlp::MicroLp;
    use float_eq::assert_float_eq;

    fn run(src: &str) -> Result<(Vec<String>, Option<Problem>), ScriptError> {
        let surface = PyomoSurface::new();
        let backend = MicroLp;
        let mut session = Session::new(&surface, &backend, Limits::default());
        session.run(&parse(src)?)?;
        let problem = match session.global("model") {
            Some(model) => Some(surface.materialize(&mut session, &model)?),
            None => None,
        };
        Ok((session.output().to_vec(), problem))
    }

    const TRANSPORT: &str = "\
import pyomo.environ as pyo
model = pyo.ConcreteModel()
model.I = pyo.Set(initialize=['a', 'b'])
model.J = pyo.RangeSet(2)
model.cost = pyo.Param(model.I, model.J, initialize={('a', 1): 1, ('a', 2): 3, ('b', 1): 2, ('b', 2): 1})
model.supply = pyo.Param(model.I, initialize={'a': 5, 'b': 5})
model.x = pyo.Var(model.I, model.J, domain=pyo.NonNegativeReals)
model.obj = pyo.Objective(expr=sum(model.cost[i, j] * model.x[i, j] for i in model.I for j in model.J))
def demand_rule(m, j):
    return sum(m.x[i, j] for i in m.I) >= 4
model.demand = pyo.Constraint(model.J, rule=demand_rule)
model.cap = pyo.Constraint(model.I, rule=lambda m, i: sum(m.x[i, j] for j in m.J) <= m.supply[i])
results = pyo.SolverFactory('glpk').solve(model)
print(results.solver.termination_condition == pyo.TerminationCondition.optimal, pyo.value(model.obj))
";

    #[test]
    fn indexed_components_build_and_solve() {
        let (out, problem) = run(TRANSPORT).unwrap();
        assert_eq!(out.len(), 1);
        let (optimal, objective) = out[0].split_once(' ').unwrap();
        assert_eq!(optimal, "True");
        assert_float_eq!(objective.parse::<f64>().unwrap(), 8., abs <= 1e-6);
        let problem = problem.unwrap();
        let names: Vec<&str> = problem
            .variables()
            .iter()
            .map(|(_, def)| def.name.as_str())
            .collect();
        assert_eq!(names, vec!["x[a,1]", "x[a,2]", "x[b,1]", "x[b,2]"]);
        let constraints: Vec<String> = (0..problem.constraints().len())
            .map(|i| problem.constraint_name(i))
            .collect();
        assert_eq!(constraints, vec!["demand[1]", "demand[2]", "cap[a]", "cap[b]"]);
        assert_eq!(problem.direction(), ObjectiveDirection::Minimisation);
    }

    #[test]
    fn skipped_rules_and_constraint_lists() {
        let src = "\
from pyomo.environ import *
model = ConcreteModel()
model.x = Var([1, 2, 3], within=Binary)
model.pick = Constraint([1, 2, 3], rule=lambda m, i: Constraint.Skip if i == 2 else m.x[i] <= 1)
model.extra = ConstraintList()
model.extra.add(model.x[1] + model.x[2] >= 1)
model.extra.add(inequality(0, model.x[3], 1))
model.obj = Objective(rule=lambda m: summation(m.x), sense=maximize)
";
        let (_, problem) = run(src).unwrap();
        let problem = problem.unwrap();
        let constraints: Vec<String> = (0..problem.constraints().len())
            .map(|i| problem.constraint_name(i))
            .collect();
        assert_eq!(
            constraints,
            vec!["pick[1]", "pick[3]", "extra[1]", "extra[2]_lower", "extra[2]_upper"]
        );
        assert_eq!(problem.direction(), ObjectiveDirection::Maximisation);
        assert!(problem
            .variables()
            .iter()
            .all(|(_, def)| def.category == Category::Binary));
    }

    #[test]
    fn scalar_params_act_as_numbers() {
        let src = "\
import pyomo.environ as pyo
model = pyo.ConcreteModel()
model.cap = pyo.Param(initialize=10)
model.y = pyo.Var(bounds=(2, model.cap))
model.obj = pyo.Objective(expr=3 * model.y, sense=pyo.maximize)
pyo.SolverFactory('cbc').solve(model)
print(model.y.value, model.y.ub, pyo.value(model.cap) + 1, model.obj())
";
        let (out, _) = run(src).unwrap();
        assert_eq!(out, vec!["10.0 10.0 11 30.0"]);
    }

    #[test]
    fn boolean_rule_results_are_rejected() {
        let src = "\
import pyomo.environ as pyo
model = pyo.ConcreteModel()
model.x = pyo.Var()
model.c = pyo.Constraint(rule=lambda m: True)
";
        let err = run(src).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueError);
        assert!(err.message.contains("Constraint.Skip"));
    }

    #[test]
    fn missing_param_index_is_a_key_error() {
        let src = "\
import pyomo.environ as pyo
model = pyo.ConcreteModel()
model.p = pyo.Param(['a'], initialize={'a': 1})
v = model.p['b']
";
        let err = run(src).unwrap_err();
        assert_eq!(err.kind, ErrorKind::KeyError);
    }

    #[test]
    fn infeasible_results_report_warning() {
        let src = "\
import pyomo.environ as pyo
from pyomo.opt import SolverStatus, TerminationCondition
model = pyo.ConcreteModel()
model.x = pyo.Var(within=pyo.NonNegativeReals)
model.c = pyo.Constraint(expr=model.x <= -1)
model.obj = pyo.Objective(expr=model.x)
r = pyo.SolverFactory('highs').solve(model)
print(r.solver.status == SolverStatus.warning, r.solver.termination_condition)
print(pyo.check_optimal_termination(r))
";
        let (out, _) = run(src).unwrap();
        assert_eq!(out, vec!["True infeasible", "False"]);
    }

    #[test]
    fn termination_texts() {
        assert_eq!(termination_condition(SolveStatus::Optimal), "optimal");
        assert_eq!(termination_condition(SolveStatus::NotSolved), "unknown");
        assert_eq!(solver_status(SolveStatus::Error), "error");
    }
}
