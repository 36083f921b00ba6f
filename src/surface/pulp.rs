//! The `pulp` surface: a problem object that objectives and constraints are added to with `+=`.
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::framework::Framework;
use crate::model::variable::Named;
use crate::model::{Category, Constraint, Expression, Problem, Sense, Variable, VariableDefinition};
use crate::normalize::SolveStatus;
use crate::script::ast::BinOp;
use crate::script::builtins::sum_values;
use crate::script::{ops, Builtin, CallArgs, Dict, Module, Relation, ScriptError, ScriptObject, Session, Value};
use crate::solvers::ObjectiveDirection;
use crate::surface::{bound, evaluate, expect_linear, Surface};

/// `LpMinimize`
pub const LP_MINIMIZE: i64 = 1;
/// `LpMaximize`
pub const LP_MAXIMIZE: i64 = -1;

const STATUS_TEXT: [(i64, &str); 5] = [
    (0, "Not Solved"),
    (1, "Optimal"),
    (-1, "Infeasible"),
    (-2, "Unbounded"),
    (-3, "Undefined"),
];

const SOLVER_COMMANDS: [&str; 9] = [
    "PULP_CBC_CMD",
    "COIN_CMD",
    "GLPK_CMD",
    "GUROBI_CMD",
    "GUROBI",
    "CPLEX_CMD",
    "CPLEX_PY",
    "HiGHS_CMD",
    "HiGHS",
];

/// The numeric status pulp stores in `prob.status`
pub fn status_code(status: SolveStatus) -> i64 {
    match status {
        SolveStatus::Optimal | SolveStatus::Feasible => 1,
        SolveStatus::NotSolved => 0,
        SolveStatus::Infeasible => -1,
        SolveStatus::Unbounded => -2,
        SolveStatus::Error => -3,
    }
}

/// `LpStatus[code]`
pub fn status_text(status: SolveStatus) -> &'static str {
    let code = status_code(status);
    STATUS_TEXT
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| *text)
        .unwrap_or("Undefined")
}

/// pulp replaces these characters in every element name
fn lp_name(name: &str) -> String {
    name.chars()
        .map(|c| if "-+[] ->/".contains(c) { '_' } else { c })
        .collect()
}

fn category(value: Option<&Value>) -> Result<Category, ScriptError> {
    let Some(value) = value else {
        return Ok(Category::Continuous);
    };
    match value.as_str().map(str::to_ascii_lowercase).as_deref() {
        Some("continuous") => Ok(Category::Continuous),
        Some("integer") => Ok(Category::Integer),
        Some("binary") => Ok(Category::Binary),
        _ => Err(ScriptError::value(format!(
            "cat must be one of LpContinuous, LpInteger, LpBinary, not {value:?}"
        ))),
    }
}

fn category_name(category: Category) -> &'static str {
    match category {
        Category::Continuous => "Continuous",
        Category::Integer => "Integer",
        Category::Binary => "Binary",
    }
}

fn class_name(name: &str, wanted: &str) -> Option<Value> {
    (name == "__name__").then(|| Value::str(wanted))
}

/// The surface handing out `pulp` objects
pub struct PulpSurface {
    module: Rc<Module>,
}

impl PulpSurface {
    pub fn new() -> Self {
        PulpSurface {
            module: Rc::new(pulp_module()),
        }
    }
}

impl Default for PulpSurface {
    fn default() -> Self {
        PulpSurface::new()
    }
}

impl Surface for PulpSurface {
    fn framework(&self) -> Framework {
        Framework::LinearExpression
    }

    fn module(&self, name: &str) -> Option<Rc<Module>> {
        (name == "pulp").then(|| self.module.clone())
    }

    fn seed(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("pl", Value::Module(self.module.clone())),
            ("LpProblem", Value::object(LpProblemClass)),
            ("LpVariable", Value::object(LpVariableClass)),
            ("LpMaximize", Value::Int(LP_MAXIMIZE)),
            ("LpMinimize", Value::Int(LP_MINIMIZE)),
        ]
    }

    fn materialize(&self, session: &mut Session<'_>, model: &Value) -> Result<Problem, ScriptError> {
        let problem = model.downcast::<LpProblem>().ok_or_else(|| {
            ScriptError::type_error(format!(
                "model must be an LpProblem, not '{}'",
                model.type_name()
            ))
        })?;
        Ok(problem.problem(session))
    }
}

fn pulp_module() -> Module {
    let mut status = Dict::new();
    for (code, text) in STATUS_TEXT {
        status.insert_hashed(
            crate::script::value::Key::Int(code),
            Value::Int(code),
            Value::str(text),
        );
    }
    let mut module = Module::new("pulp")
        .with("LpProblem", Value::object(LpProblemClass))
        .with("LpVariable", Value::object(LpVariableClass))
        .with("LpConstraint", Value::object(LpConstraintClass))
        .with("LpMinimize", Value::Int(LP_MINIMIZE))
        .with("LpMaximize", Value::Int(LP_MAXIMIZE))
        .with("LpContinuous", Value::str("Continuous"))
        .with("LpInteger", Value::str("Integer"))
        .with("LpBinary", Value::str("Binary"))
        .with("LpConstraintLE", Value::Int(-1))
        .with("LpConstraintEQ", Value::Int(0))
        .with("LpConstraintGE", Value::Int(1))
        .with("LpStatusNotSolved", Value::Int(0))
        .with("LpStatusOptimal", Value::Int(1))
        .with("LpStatusInfeasible", Value::Int(-1))
        .with("LpStatusUnbounded", Value::Int(-2))
        .with("LpStatusUndefined", Value::Int(-3))
        .with("LpStatus", Value::dict(status))
        .function(Builtin::new("lpSum", lp_sum))
        .function(Builtin::new("lpDot", lp_dot))
        .function(Builtin::new("value", value))
        .function(Builtin::new("LpAffineExpression", affine_expression))
        .function(Builtin::new("getSolver", get_solver))
        .function(Builtin::new("listSolvers", list_solvers));
    for name in SOLVER_COMMANDS {
        module = module.with(name, Value::object(SolverClass { name }));
    }
    module
}

// -- Module functions --------------------------------------------

fn lp_sum(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let items = match args.required(0, "vector", "lpSum")? {
        single @ (Value::Expr(_) | Value::Int(_) | Value::Float(_)) => vec![single.clone()],
        Value::Object(obj) if obj.as_linear(session).is_some() => vec![Value::Object(obj.clone())],
        iterable => {
            let iterable = iterable.clone();
            session.iterate(&iterable)?
        }
    };
    let total = sum_values(session, items, Value::Int(0))?;
    expect_linear(session, &total, "lpSum() terms").map(Value::expr)
}

fn lp_dot(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let left = args.required(0, "v1", "lpDot")?.clone();
    let right = args.required(1, "v2", "lpDot")?.clone();
    let left = session.iterate(&left)?;
    let right = session.iterate(&right)?;
    let mut products = Vec::with_capacity(left.len());
    for (a, b) in left.iter().zip(&right) {
        products.push(ops::binary(session, BinOp::Mul, a, b)?);
    }
    let total = sum_values(session, products, Value::Int(0))?;
    expect_linear(session, &total, "lpDot() terms").map(Value::expr)
}

fn value(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let x = args.required(0, "x", "value")?;
    Ok(evaluate(session, x))
}

fn affine_expression(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let mut expression = Expression::from(bound(session, args.keyword("constant"), "constant")?.unwrap_or(0.));
    match args.get(0, "e") {
        None | Some(Value::None) => {}
        Some(Value::Dict(terms)) => {
            let terms = terms.borrow().items();
            for term in terms {
                add_term(session, &mut expression, &term)?;
            }
        }
        Some(e @ (Value::List(_) | Value::Tuple(_))) => {
            let e = e.clone();
            for term in session.iterate(&e)? {
                add_term(session, &mut expression, &term)?;
            }
        }
        Some(e) => expression += expect_linear(session, e, "LpAffineExpression()")?,
    }
    Ok(Value::expr(expression))
}

fn add_term(session: &mut Session<'_>, expression: &mut Expression, term: &Value) -> Result<(), ScriptError> {
    let parts = session.iterate(term)?;
    let [var, coefficient] = parts.as_slice() else {
        return Err(ScriptError::value("LpAffineExpression() terms are (variable, coefficient) pairs"));
    };
    let var = expect_linear(session, var, "LpAffineExpression() variable")?;
    let coefficient = bound(session, Some(coefficient), "coefficient")?.unwrap_or(0.);
    expression.add_mul(coefficient, &var);
    Ok(())
}

fn get_solver(session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
    let requested = session.display(args.required(0, "solver", "getSolver")?);
    let name = SOLVER_COMMANDS
        .iter()
        .find(|name| name.eq_ignore_ascii_case(&requested))
        .ok_or_else(|| ScriptError::value(format!("{requested} is not a valid solver name")))?;
    Ok(Value::object(SolverCommand { name: *name }))
}

fn list_solvers(_session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
    Ok(Value::list(SOLVER_COMMANDS.iter().map(Value::str).collect()))
}

// -- Variables ---------------------------------------------------

/// `LpVariable`, the class
struct LpVariableClass;

impl LpVariableClass {
    fn create(
        session: &mut Session<'_>,
        name: &str,
        low: Option<f64>,
        up: Option<f64>,
        cat: Category,
    ) -> Result<Value, ScriptError> {
        let mut definition = VariableDefinition::new().name(lp_name(name));
        if let Some(low) = low {
            definition = definition.min(low);
        }
        if let Some(up) = up {
            definition = definition.max(up);
        }
        let var = session.add_variable(definition.category(cat))?;
        Ok(Value::object(LpVariable { var }))
    }

    fn dicts(
        session: &mut Session<'_>,
        prefix: &str,
        dims: &[Vec<Value>],
        low: Option<f64>,
        up: Option<f64>,
        cat: Category,
    ) -> Result<Value, ScriptError> {
        let Some((first, rest)) = dims.split_first() else {
            return Ok(Value::dict(Dict::new()));
        };
        session.check_size(first.len())?;
        let mut dict = Dict::new();
        for index in first {
            let name = format!("{prefix}_{}", session.display(index));
            let item = if rest.is_empty() {
                Self::create(session, &name, low, up, cat)?
            } else {
                Self::dicts(session, &name, rest, low, up, cat)?
            };
            dict.insert(index.clone(), item)?;
        }
        Ok(Value::dict(dict))
    }
}

impl ScriptObject for LpVariableClass {
    fn type_name(&self) -> &'static str {
        "type"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(class_name(name, "LpVariable"))
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "dicts" | "dict")
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        if !self.has_method(name) {
            return Err(ScriptError::attribute(format!(
                "type object 'LpVariable' has no attribute '{name}'"
            )));
        }
        let prefix = session.display(args.required(0, "name", "dicts")?);
        let indices = args
            .get(1, "indices")
            .or_else(|| args.keyword("indexs"))
            .cloned()
            .ok_or_else(|| ScriptError::type_error("dicts() missing required argument 'indices'"))?;
        let low = bound(session, args.get(2, "lowBound"), "lowBound")?;
        let up = bound(session, args.get(3, "upBound"), "upBound")?;
        let cat = category(args.get(4, "cat"))?;
        let dims = match &indices {
            Value::Tuple(parts) if parts.len() > 1 => {
                let mut dims = Vec::with_capacity(parts.len());
                for part in parts.iter() {
                    dims.push(session.iterate(part)?);
                }
                dims
            }
            Value::Tuple(parts) if parts.len() == 1 => vec![session.iterate(&parts[0])?],
            other => vec![session.iterate(other)?],
        };
        Self::dicts(session, &prefix, &dims, low, up, cat)
    }

    fn call(&self, session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
        args.at_most(5, "LpVariable")?;
        let name = session.display(args.required(0, "name", "LpVariable")?);
        let low = bound(session, args.get(1, "lowBound"), "lowBound")?;
        let up = bound(session, args.get(2, "upBound"), "upBound")?;
        let cat = category(args.get(3, "cat"))?;
        Self::create(session, &name, low, up, cat)
    }

    fn display(&self, _session: &Session<'_>) -> String {
        "<class 'pulp.LpVariable'>".to_string()
    }
}

/// A decision variable
pub struct LpVariable {
    var: Variable,
}

impl LpVariable {
    pub fn variable(&self) -> Variable {
        self.var
    }

    fn set_bound(&self, session: &mut Session<'_>, lower: bool, value: Option<f64>) {
        if let Some(definition) = session.variables_mut().definition_mut(self.var) {
            if lower {
                definition.min = value.unwrap_or(f64::NEG_INFINITY);
            } else {
                definition.max = value.unwrap_or(f64::INFINITY);
            }
        }
    }
}

impl ScriptObject for LpVariable {
    fn type_name(&self) -> &'static str {
        "LpVariable"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        let Some(definition) = session.variables().definition(self.var) else {
            return Ok(None);
        };
        Ok(match name {
            "name" => Some(Value::str(&definition.name)),
            "lowBound" => Some(Value::from_f64(definition.lower_bound())),
            "upBound" => Some(Value::from_f64(definition.upper_bound())),
            "cat" => Some(Value::str(category_name(definition.category))),
            "varValue" => Some(Value::from_f64(session.value_of(self.var))),
            _ => None,
        })
    }

    fn set_attr(&self, session: &mut Session<'_>, name: &str, value: Value) -> Result<(), ScriptError> {
        match name {
            "lowBound" => {
                let low = bound(session, Some(&value), name)?;
                self.set_bound(session, true, low);
            }
            "upBound" => {
                let up = bound(session, Some(&value), name)?;
                self.set_bound(session, false, up);
            }
            "cat" => {
                let cat = category(Some(&value))?;
                if let Some(definition) = session.variables_mut().definition_mut(self.var) {
                    *definition = definition.clone().category(cat);
                }
            }
            _ => {
                return Err(ScriptError::attribute(format!(
                    "'LpVariable' object attribute '{name}' is read-only"
                )))
            }
        }
        Ok(())
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(
            name,
            "value" | "valueOrDefault" | "bounds" | "setInitialValue" | "isInteger" | "isBinary" | "getLb" | "getUb"
        )
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "value" => Ok(Value::from_f64(session.value_of(self.var))),
            "valueOrDefault" => {
                let fallback = session
                    .variables()
                    .definition(self.var)
                    .map(|d| if d.min.is_finite() { d.min } else { 0f64.min(d.max) })
                    .unwrap_or(0.);
                Ok(Value::Float(session.value_of(self.var).unwrap_or(fallback)))
            }
            "bounds" => {
                let low = bound(session, args.get(0, "low"), "low")?;
                let up = bound(session, args.get(1, "up"), "up")?;
                self.set_bound(session, true, low);
                self.set_bound(session, false, up);
                Ok(Value::None)
            }
            "setInitialValue" => Ok(Value::Bool(true)),
            "getLb" | "getUb" => self
                .get_attr(session, if name == "getLb" { "lowBound" } else { "upBound" })
                .map(|v| v.unwrap_or(Value::None)),
            "isInteger" | "isBinary" => {
                let category = session
                    .variables()
                    .definition(self.var)
                    .map(|d| d.category)
                    .unwrap_or(Category::Continuous);
                Ok(Value::Bool(if name == "isBinary" {
                    category == Category::Binary
                } else {
                    category.is_integer()
                }))
            }
            _ => Err(ScriptError::attribute(format!(
                "'LpVariable' object has no attribute '{name}'"
            ))),
        }
    }

    fn as_linear(&self, _session: &Session<'_>) -> Option<Expression> {
        Some(Expression::from(self.var))
    }

    fn display(&self, session: &Session<'_>) -> String {
        session.variables().name(self.var).unwrap_or("?").to_string()
    }
}

// -- Constraints -------------------------------------------------

fn sense_code(sense: Sense) -> i64 {
    match sense {
        Sense::LessOrEqual => -1,
        Sense::Equal => 0,
        Sense::GreaterOrEqual => 1,
    }
}

/// `LpConstraint(e, sense, name, rhs)`
struct LpConstraintClass;

impl ScriptObject for LpConstraintClass {
    fn type_name(&self) -> &'static str {
        "type"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(class_name(name, "LpConstraint"))
    }

    fn call(&self, session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
        let lhs = match args.get(0, "e") {
            Some(e) => expect_linear(session, e, "LpConstraint() expression")?,
            None => Expression::default(),
        };
        let sense = match args.get(1, "sense").and_then(Value::as_i64).unwrap_or(0) {
            -1 => Sense::LessOrEqual,
            0 => Sense::Equal,
            1 => Sense::GreaterOrEqual,
            other => return Err(ScriptError::value(format!("invalid constraint sense {other}"))),
        };
        let name = match args.get(2, "name") {
            None | Some(Value::None) => None,
            Some(name) => Some(lp_name(&session.display(name))),
        };
        let rhs = bound(session, args.get(3, "rhs"), "rhs")?.unwrap_or(0.);
        Ok(Value::object(LpConstraint {
            constraint: lhs.compare(sense, Expression::from(rhs)),
            name,
        }))
    }
}

/// A constraint held by a problem, as returned by `prob.constraints`
pub struct LpConstraint {
    constraint: Constraint,
    name: Option<String>,
}

impl ScriptObject for LpConstraint {
    fn type_name(&self) -> &'static str {
        "LpConstraint"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(match name {
            "name" => Some(self.name.as_deref().map(Value::str).unwrap_or(Value::None)),
            "constant" => Some(Value::Float(self.constraint.expression().constant())),
            "sense" => Some(Value::Int(sense_code(self.constraint.sense()))),
            "pi" => Some(Value::None),
            "slack" => {
                let lhs = self.constraint.expression().eval_with(session.solution());
                Some(Value::from_f64(lhs.map(|v| -v)))
            }
            _ => None,
        })
    }

    fn has_method(&self, name: &str) -> bool {
        name == "value"
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, _args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "value" => Ok(Value::from_f64(
                self.constraint.expression().eval_with(session.solution()),
            )),
            _ => Err(ScriptError::attribute(format!(
                "'LpConstraint' object has no attribute '{name}'"
            ))),
        }
    }

    fn display(&self, session: &Session<'_>) -> String {
        Named {
            item: &self.constraint,
            variables: session.variables(),
        }
        .to_string()
    }
}

// -- Problems ----------------------------------------------------

/// `LpProblem`, the class
struct LpProblemClass;

impl ScriptObject for LpProblemClass {
    fn type_name(&self) -> &'static str {
        "type"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(class_name(name, "LpProblem"))
    }

    fn call(&self, session: &mut Session<'_>, args: CallArgs) -> Result<Value, ScriptError> {
        args.at_most(2, "LpProblem")?;
        let name = match args.get(0, "name") {
            Some(name) => session.display(name).replace(' ', "_"),
            None => "NoName".to_string(),
        };
        let sense = match args.get(1, "sense") {
            None => LP_MINIMIZE,
            Some(sense) => match sense.as_i64() {
                Some(LP_MAXIMIZE) => LP_MAXIMIZE,
                Some(LP_MINIMIZE) => LP_MINIMIZE,
                _ => {
                    return Err(ScriptError::value(format!(
                        "sense must be LpMinimize or LpMaximize, not {}",
                        session.repr(sense)
                    )))
                }
            },
        };
        debug!(problem = %name, sense, "LpProblem created");
        Ok(Value::object(LpProblem {
            name: RefCell::new(name),
            sense: Cell::new(sense),
            objective: RefCell::new(None),
            constraints: RefCell::new(Vec::new()),
            status: Cell::new(0),
        }))
    }
}

/// A problem under construction
pub struct LpProblem {
    name: RefCell<String>,
    sense: Cell<i64>,
    objective: RefCell<Option<Expression>>,
    constraints: RefCell<Vec<(String, Constraint)>>,
    status: Cell<i64>,
}

impl LpProblem {
    fn unused_name(&self) -> String {
        let constraints = self.constraints.borrow();
        let mut n = constraints.len() + 1;
        loop {
            let name = format!("_C{n}");
            if !constraints.iter().any(|(existing, _)| *existing == name) {
                return name;
            }
            n += 1;
        }
    }

    fn push_constraint(&self, name: Option<String>, constraint: Constraint) -> Result<(), ScriptError> {
        let name = match name {
            Some(name) => lp_name(&name),
            None => self.unused_name(),
        };
        let mut constraints = self.constraints.borrow_mut();
        if constraints.iter().any(|(existing, _)| *existing == name) {
            return Err(ScriptError::runtime(format!("overlapping constraint names: {name}")));
        }
        constraints.push((name, constraint));
        Ok(())
    }

    fn add_relation(&self, relation: &Relation, name: Option<String>) -> Result<(), ScriptError> {
        match relation {
            Relation::Single(constraint) => self.push_constraint(name, constraint.clone()),
            Relation::Ranged { lower, upper } => {
                let lower_name = name.as_ref().map(|n| format!("{n}_lower"));
                let upper_name = name.map(|n| format!("{n}_upper"));
                self.push_constraint(lower_name, lower.clone())?;
                self.push_constraint(upper_name, upper.clone())
            }
        }
    }

    fn set_objective(&self, objective: Expression) {
        let mut current = self.objective.borrow_mut();
        if current.is_some() {
            warn!(problem = %self.name.borrow(), "overwriting previously set objective");
        }
        *current = Some(objective);
    }

    fn add(&self, session: &mut Session<'_>, value: &Value, name: Option<String>) -> Result<(), ScriptError> {
        match value {
            Value::Relation(relation) => self.add_relation(relation, name),
            Value::Object(obj) => match obj.as_any().downcast_ref::<LpConstraint>() {
                Some(constraint) => {
                    self.push_constraint(name.or_else(|| constraint.name.clone()), constraint.constraint.clone())
                }
                None => {
                    let objective = expect_linear(session, value, "objective")?;
                    self.set_objective(objective);
                    Ok(())
                }
            },
            Value::Bool(_) => Err(ScriptError::type_error(
                "a constraint compared two constants and has no variables",
            )),
            other => {
                let objective = expect_linear(session, other, "objective")?;
                self.set_objective(objective);
                Ok(())
            }
        }
    }

    /// Variables used by the objective or a constraint, ordered by name
    fn referenced(&self, session: &Session<'_>) -> Vec<Variable> {
        let mut vars: Vec<Variable> = self
            .objective
            .borrow()
            .iter()
            .flat_map(|o| o.variables().collect::<Vec<_>>())
            .chain(
                self.constraints
                    .borrow()
                    .iter()
                    .flat_map(|(_, c)| c.expression().variables().collect::<Vec<_>>()),
            )
            .collect();
        vars.sort();
        vars.dedup();
        let names = session.variables();
        vars.sort_by(|a, b| names.name(*a).cmp(&names.name(*b)));
        vars
    }

    /// The problem as it stands
    pub fn problem(&self, session: &Session<'_>) -> Problem {
        let direction = if self.sense.get() == LP_MAXIMIZE {
            ObjectiveDirection::Maximisation
        } else {
            ObjectiveDirection::Minimisation
        };
        let constraints = self
            .constraints
            .borrow()
            .iter()
            .map(|(name, c)| c.clone().set_name(name.clone()))
            .collect();
        Problem::new(
            self.name.borrow().clone(),
            direction,
            self.objective.borrow().clone(),
            constraints,
            session.variables(),
            self.referenced(session),
        )
    }

    fn constraints_dict(&self) -> Result<Value, ScriptError> {
        let mut dict = Dict::new();
        for (name, constraint) in self.constraints.borrow().iter() {
            dict.insert(
                Value::str(name),
                Value::object(LpConstraint {
                    constraint: constraint.clone(),
                    name: Some(name.clone()),
                }),
            )?;
        }
        Ok(Value::dict(dict))
    }
}

impl ScriptObject for LpProblem {
    fn type_name(&self) -> &'static str {
        "LpProblem"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(match name {
            "name" => Some(Value::str(&*self.name.borrow())),
            "sense" => Some(Value::Int(self.sense.get())),
            "status" => Some(Value::Int(self.status.get())),
            "objective" => Some(
                self.objective
                    .borrow()
                    .clone()
                    .map(Value::expr)
                    .unwrap_or(Value::None),
            ),
            "constraints" => Some(self.constraints_dict()?),
            _ => None,
        })
    }

    fn set_attr(&self, session: &mut Session<'_>, name: &str, value: Value) -> Result<(), ScriptError> {
        match name {
            "objective" => {
                let objective = expect_linear(session, &value, "objective")?;
                *self.objective.borrow_mut() = Some(objective);
            }
            "sense" => match value.as_i64() {
                Some(sense @ (LP_MAXIMIZE | LP_MINIMIZE)) => self.sense.set(sense),
                _ => return Err(ScriptError::value("sense must be LpMinimize or LpMaximize")),
            },
            "name" => *self.name.borrow_mut() = session.display(&value),
            _ => {
                return Err(ScriptError::attribute(format!(
                    "'LpProblem' object attribute '{name}' is read-only"
                )))
            }
        }
        Ok(())
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(
            name,
            "solve" | "variables" | "setObjective" | "addConstraint" | "numVariables" | "numConstraints"
                | "isMIP" | "writeLP" | "writeMPS"
        )
    }

    fn call_method(&self, session: &mut Session<'_>, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "solve" => {
                let problem = self.problem(session);
                let status = session.solve_problem(&problem)?;
                let code = status_code(status);
                debug!(problem = %problem.name(), status = status_text(status), "LpProblem.solve");
                self.status.set(code);
                Ok(Value::Int(code))
            }
            "variables" => {
                let vars = self.referenced(session);
                Ok(Value::list(
                    vars.into_iter()
                        .map(|var| Value::object(LpVariable { var }))
                        .collect(),
                ))
            }
            "setObjective" => {
                let objective = args.required(0, "obj", "setObjective")?;
                let objective = expect_linear(session, objective, "objective")?;
                *self.objective.borrow_mut() = Some(objective);
                Ok(Value::None)
            }
            "addConstraint" => {
                let constraint = args.required(0, "constraint", "addConstraint")?.clone();
                let name = match args.get(1, "name") {
                    None | Some(Value::None) => None,
                    Some(name) => Some(session.display(name)),
                };
                match &constraint {
                    Value::Relation(_) | Value::Object(_) => self.add(session, &constraint, name)?,
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "addConstraint() expects a constraint, not '{}'",
                            other.type_name()
                        )))
                    }
                }
                Ok(Value::None)
            }
            "numVariables" => Ok(Value::Int(self.referenced(session).len() as i64)),
            "numConstraints" => Ok(Value::Int(self.constraints.borrow().len() as i64)),
            "isMIP" => {
                let names = session.variables();
                Ok(Value::Bool(self.referenced(session).iter().any(|var| {
                    names
                        .definition(*var)
                        .map(|d| d.category.is_integer())
                        .unwrap_or(false)
                })))
            }
            "writeLP" | "writeMPS" => {
                debug!(method = name, "file output is not available to model code, ignored");
                Ok(Value::None)
            }
            _ => Err(ScriptError::attribute(format!(
                "'LpProblem' object has no attribute '{name}'"
            ))),
        }
    }

    fn add_assign(&self, session: &mut Session<'_>, value: Value) -> Result<bool, ScriptError> {
        match &value {
            Value::Tuple(items) if items.len() == 2 => {
                let name = match &items[1] {
                    Value::None => None,
                    name => Some(session.display(name)),
                };
                self.add(session, &items[0], name)?;
            }
            other => self.add(session, other, None)?,
        }
        Ok(true)
    }

    fn display(&self, session: &Session<'_>) -> String {
        let problem = self.problem(session);
        format!("{}:\n{}", problem.name(), problem.display(&problem))
    }
}

// -- Solvers -----------------------------------------------------

/// A solver command constructor such as `PULP_CBC_CMD`
struct SolverClass {
    name: &'static str,
}

impl ScriptObject for SolverClass {
    fn type_name(&self) -> &'static str {
        "type"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok(class_name(name, self.name))
    }

    fn call(&self, _session: &mut Session<'_>, _args: CallArgs) -> Result<Value, ScriptError> {
        Ok(Value::object(SolverCommand { name: self.name }))
    }
}

/// A configured solver. Its options are accepted and ignored: the backend is chosen by the
/// caller of the pipeline, not by the model code.
struct SolverCommand {
    name: &'static str,
}

impl ScriptObject for SolverCommand {
    fn type_name(&self) -> &'static str {
        "LpSolver"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, _session: &mut Session<'_>, name: &str) -> Result<Option<Value>, ScriptError> {
        Ok((name == "name").then(|| Value::str(self.name)))
    }

    fn has_method(&self, name: &str) -> bool {
        name == "available"
    }

    fn call_method(&self, _session: &mut Session<'_>, name: &str, _args: CallArgs) -> Result<Value, ScriptError> {
        match name {
            "available" => Ok(Value::Bool(true)),
            _ => Err(ScriptError::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.name
            ))),
        }
    }

    fn display(&self, _session: &Session<'_>) -> String {
        self.name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{parse, ErrorKind, Limits};
    use crate::solvers::microlp::MicroLp;
    use float_eq::assert_float_eq;

    fn session_output(src: &str) -> Vec<String> {
        let surface = PulpSurface::new();
        let backend = MicroLp;
        let mut session = Session::new(&surface, &backend, Limits::default());
        session.run(&parse(src).unwrap()).unwrap();
        session.output().to_vec()
    }

    const PRODUCTION: &str = "\
import pulp
model = pulp.LpProblem('production', pulp.LpMaximize)
x1 = pulp.LpVariable('x1', lowBound=0)
x2 = pulp.LpVariable('x2', lowBound=0)
model += 10 * x1 + 15 * x2, 'profit'
model += 5 * x1 + 7 * x2 <= 100, 'capacity'
status = model.solve(pulp.PULP_CBC_CMD(msg=0))
print(pulp.LpStatus[status], pulp.value(model.objective))
";

    #[test]
    fn solves_from_inside_the_fragment() {
        let out = session_output(PRODUCTION);
        assert_eq!(out.len(), 1);
        let (status, objective) = out[0].split_once(' ').unwrap();
        assert_eq!(status, "Optimal");
        assert_float_eq!(objective.parse::<f64>().unwrap(), 1500. / 7., abs <= 1e-6);
    }

    #[test]
    fn materializes_named_constraints_and_sorted_variables() {
        let surface = PulpSurface::new();
        let backend = MicroLp;
        let mut session = Session::new(&surface, &backend, Limits::default());
        let src = "\
prob = LpProblem('p', LpMinimize)
y = LpVariable('y', 0)
x = LpVariable.dicts('x', ['a', 'b'], 0, cat='Integer')
prob += x['a'] + x['b'] + y
prob += x['a'] + y >= 2
prob += (x['b'] >= 1, 'need b')
model = prob
";
        session.run(&parse(src).unwrap()).unwrap();
        let model = session.global("model").unwrap();
        let problem = surface.materialize(&mut session, &model).unwrap();
        let names: Vec<&str> = problem
            .variables()
            .iter()
            .map(|(_, def)| def.name.as_str())
            .collect();
        assert_eq!(names, vec!["x_a", "x_b", "y"]);
        assert_eq!(problem.constraint_name(0), "_C1");
        assert_eq!(problem.constraint_name(1), "need_b");
        assert_eq!(problem.direction(), ObjectiveDirection::Minimisation);
    }

    #[test]
    fn tuple_indices_are_named_like_pulp() {
        let out = session_output(
            "x = LpVariable.dicts('x', [(1, 2)], cat=pl.LpBinary)\nv = x[(1, 2)]\nprint(v.name, v.cat, v.upBound)\n",
        );
        assert_eq!(out, vec!["x_(1,_2) Binary 1.0"]);
    }

    #[test]
    fn nested_dicts_from_index_tuples() {
        let out = session_output(
            "x = LpVariable.dicts('route', (['A', 'B'], [1, 2]), lowBound=0)\nprint(x['B'][2].name, len(x))\n",
        );
        assert_eq!(out, vec!["route_B_2 2"]);
    }

    #[test]
    fn infeasible_problems_report_status() {
        let out = session_output(
            "p = LpProblem('bad')\nx = LpVariable('x', 0, 1)\np += x\np += x >= 2\nprint(pl.LpStatus[p.solve()])\n",
        );
        assert_eq!(out, vec!["Infeasible"]);
    }

    #[test]
    fn status_names_need_an_import() {
        let out = session_output(
            "from pulp import LpStatus\np = LpProblem('ok')\nx = LpVariable('x', 0, 1)\np += x\nprint(LpStatus[p.solve()])\n",
        );
        assert_eq!(out, vec!["Optimal"]);

        let surface = PulpSurface::new();
        let backend = MicroLp;
        let mut session = Session::new(&surface, &backend, Limits::default());
        let err = session.run(&parse("print(LpStatus[1])\n").unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NameError);
    }

    #[test]
    fn duplicate_constraint_names_are_rejected() {
        let surface = PulpSurface::new();
        let backend = MicroLp;
        let mut session = Session::new(&surface, &backend, Limits::default());
        let src = "p = LpProblem()\nx = LpVariable('x')\np += x <= 1, 'c'\np += x >= 0, 'c'\n";
        let err = session.run(&parse(src).unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RuntimeError);
        assert!(err.message.contains("overlapping"));
    }

    #[test]
    fn lp_sum_and_lp_dot_build_expressions() {
        let out = session_output(
            "x = [LpVariable(f'x{i}') for i in range(3)]\nprint(pl.lpSum(x))\nprint(pl.lpDot([1, 2, 3], x))\n",
        );
        assert_eq!(out, vec!["x0 + x1 + x2", "x0 + 2*x1 + 3*x2"]);
    }

    #[test]
    fn status_texts() {
        assert_eq!(status_text(SolveStatus::Optimal), "Optimal");
        assert_eq!(status_text(SolveStatus::Unbounded), "Unbounded");
        assert_eq!(status_text(SolveStatus::NotSolved), "Not Solved");
        assert_eq!(status_text(SolveStatus::Error), "Undefined");
    }
}
