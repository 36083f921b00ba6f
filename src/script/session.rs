//! The tree-walking evaluator.
//!
//! A [Session] owns everything a fragment can touch: its variables, the model variables it
//! created, the values of the last solve and the captured `print` output. Nothing outside the
//! session is reachable from a script: imports resolve only against the modeling surface and
//! `math`, and every statement, loop iteration and call is charged against a step budget.
use std::rc::Rc;

use fnv::FnvHashMap;
use tracing::debug;

use crate::framework::Framework;
use crate::model::variable::Named;
use crate::model::{Problem, ProblemVariables, Variable, VariableDefinition};
use crate::normalize::SolveStatus;
use crate::script::ast::{
    Arg, BinOp, BoolOp, CompKind, Constant, Expr, FPart, FunctionDef, Generator, Handler, Stmt,
    StmtKind, Target, UnaryOp,
};
use crate::script::builtins;
use crate::script::error::{ErrorKind, ScriptError};
use crate::script::ops;
use crate::script::value::{CallArgs, Dict, Frame, Function, Module, Relation, Scope, Value};
use crate::solvers::{ResolutionError, Solution, SolutionStatus, SolverBackend};
use crate::surface::Surface;

/// Ceilings enforced while a fragment runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Statements, loop iterations and calls a fragment may perform
    pub max_steps: u64,
    /// Nested function calls
    pub max_depth: usize,
    /// Elements in any single list, dict, set, string or range
    pub max_collection: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_steps: 1_000_000,
            max_depth: 32,
            max_collection: 1_000_000,
        }
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Interpreter state for one fragment
pub struct Session<'a> {
    globals: Scope,
    scope: Scope,
    variables: ProblemVariables,
    solution: FnvHashMap<Variable, f64>,
    backend: &'a dyn SolverBackend,
    surface: &'a dyn Surface,
    limits: Limits,
    modules: FnvHashMap<String, Rc<Module>>,
    current_exception: Option<ScriptError>,
    steps: u64,
    depth: usize,
    line: u32,
    output: Vec<String>,
}

impl<'a> Session<'a> {
    /// A fresh namespace seeded with `__name__` and the symbols the surface pre-binds
    pub fn new(surface: &'a dyn Surface, backend: &'a dyn SolverBackend, limits: Limits) -> Self {
        let globals = Scope::default();
        let mut session = Session {
            scope: globals.clone(),
            globals,
            variables: ProblemVariables::new(),
            solution: FnvHashMap::default(),
            backend,
            surface,
            limits,
            modules: FnvHashMap::default(),
            current_exception: None,
            steps: 0,
            depth: 0,
            line: 0,
            output: Vec::new(),
        };
        session.set_global("__name__", Value::str("__main__"));
        for (name, value) in surface.seed() {
            session.set_global(name, value);
        }
        session
    }

    pub fn framework(&self) -> Framework {
        self.surface.framework()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().vars.insert(name.to_string(), value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().vars.get(name).cloned()
    }

    /// Lines written by `print`
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub(crate) fn push_output(&mut self, line: String) {
        self.output.push(line);
    }

    /// Steps consumed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Line of the statement currently executing
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn variables(&self) -> &ProblemVariables {
        &self.variables
    }

    pub(crate) fn variables_mut(&mut self) -> &mut ProblemVariables {
        &mut self.variables
    }

    pub fn add_variable(&mut self, definition: VariableDefinition) -> Result<Variable, ScriptError> {
        self.check_size(self.variables.len() + 1)?;
        Ok(self.variables.add(definition))
    }

    /// The value of a variable in the last script level solve
    pub fn value_of(&self, var: Variable) -> Option<f64> {
        self.solution.get(&var).copied()
    }

    pub fn solution(&self) -> &FnvHashMap<Variable, f64> {
        &self.solution
    }

    /// Run the session backend on `problem`, keeping the values it reports
    pub fn solve_problem(&mut self, problem: &Problem) -> Result<SolveStatus, ScriptError> {
        debug!(
            backend = self.backend.name(),
            variables = problem.variables().len(),
            constraints = problem.constraints().len(),
            "solve requested by the fragment"
        );
        for (var, _) in problem.variables() {
            self.solution.remove(var);
        }
        match self.backend.solve(problem) {
            Ok(solution) => {
                for (var, _) in problem.variables() {
                    if let Some(value) = solution.value(*var) {
                        self.solution.insert(*var, value);
                    }
                }
                Ok(match solution.status() {
                    SolutionStatus::Optimal => SolveStatus::Optimal,
                    SolutionStatus::Feasible => SolveStatus::Feasible,
                })
            }
            Err(ResolutionError::Infeasible) => Ok(SolveStatus::Infeasible),
            Err(ResolutionError::Unbounded) => Ok(SolveStatus::Unbounded),
            Err(err) => Err(ScriptError::runtime(format!(
                "solver {} failed: {err}",
                self.backend.name()
            ))),
        }
    }

    /// Execute a parsed fragment at module level
    pub fn run(&mut self, program: &[Stmt]) -> Result<(), ScriptError> {
        match self.exec_block(program)? {
            Flow::Normal => Ok(()),
            Flow::Return(_) => Err(ScriptError::syntax(self.line, "'return' outside function")),
            Flow::Break | Flow::Continue => {
                Err(ScriptError::syntax(self.line, "'break' or 'continue' outside loop"))
            }
        }
    }

    fn tick(&mut self) -> Result<(), ScriptError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(ScriptError::new(
                ErrorKind::StepLimitExceeded,
                format!("execution exceeded {} steps", self.limits.max_steps),
            ));
        }
        Ok(())
    }

    pub fn check_size(&self, size: usize) -> Result<(), ScriptError> {
        if size > self.limits.max_collection {
            return Err(ScriptError::new(
                ErrorKind::MemoryLimitExceeded,
                format!("collection of {size} elements exceeds {}", self.limits.max_collection),
            ));
        }
        Ok(())
    }

    // -- Names ---------------------------------------------------

    pub fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        let mut frame = Some(self.scope.clone());
        while let Some(scope) = frame {
            let next = {
                let f = scope.borrow();
                if let Some(value) = f.vars.get(name) {
                    return Ok(value.clone());
                }
                f.parent.clone()
            };
            frame = next;
        }
        builtins::lookup(name).ok_or_else(|| ScriptError::name(format!("name '{name}' is not defined")))
    }

    fn set_var(&mut self, name: &str, value: Value) {
        let global = self.scope.borrow().globals.contains(name);
        let target = if global { self.globals.clone() } else { self.scope.clone() };
        target.borrow_mut().vars.insert(name.to_string(), value);
    }

    fn del_var(&mut self, name: &str) -> Result<(), ScriptError> {
        let global = self.scope.borrow().globals.contains(name);
        let target = if global { self.globals.clone() } else { self.scope.clone() };
        let removed = target.borrow_mut().vars.remove(name);
        removed
            .map(|_| ())
            .ok_or_else(|| ScriptError::name(format!("name '{name}' is not defined")))
    }

    fn import(&mut self, name: &str) -> Result<Rc<Module>, ScriptError> {
        if let Some(module) = self.modules.get(name) {
            return Ok(module.clone());
        }
        let module = if name == "math" {
            Some(builtins::math_module())
        } else {
            self.surface.module(name)
        };
        let module = module.ok_or_else(|| {
            ScriptError::new(ErrorKind::ImportError, format!("No module named '{name}'"))
        })?;
        debug!(module = name, "import");
        self.modules.insert(name.to_string(), module.clone());
        Ok(module)
    }

    // -- Statements ----------------------------------------------

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        self.line = stmt.line;
        self.tick()?;
        self.exec_kind(&stmt.kind).map_err(|err| err.at(stmt.line))
    }

    fn exec_kind(&mut self, kind: &StmtKind) -> Result<Flow, ScriptError> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AnnAssign { target, value } => {
                if let Some(value) = value {
                    let value = self.eval(value)?;
                    self.assign(target, value)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                let value = self.eval(value)?;
                self.aug_assign(target, *op, value)?;
            }
            StmtKind::If { test, body, orelse } => {
                let test = self.eval(test)?;
                return if self.truthy(&test) {
                    self.exec_block(body)
                } else {
                    self.exec_block(orelse)
                };
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter)?;
                for item in self.iterate(&iterable)? {
                    self.tick()?;
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { test, body, orelse } => loop {
                self.tick()?;
                let value = self.eval(test)?;
                if !self.truthy(&value) {
                    return self.exec_block(orelse);
                }
                match self.exec_block(body)? {
                    Flow::Break => return Ok(Flow::Normal),
                    Flow::Normal | Flow::Continue => {}
                    flow @ Flow::Return(_) => return Ok(flow),
                }
            },
            StmtKind::FunctionDef(def) => {
                let mut function = self.make_function(def)?;
                for decorator in def.decorators.iter().rev() {
                    let decorator = self.eval(decorator)?;
                    function = self.call(&decorator, CallArgs::new(vec![function]))?;
                }
                self.set_var(&def.name, function);
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    match &alias.asname {
                        Some(asname) => {
                            let module = self.import(&alias.name)?;
                            self.set_var(asname, Value::Module(module));
                        }
                        None => {
                            // `import a.b` binds `a`; the submodule must still exist
                            self.import(&alias.name)?;
                            let top = alias.name.split('.').next().unwrap_or(&alias.name);
                            let module = self.import(top)?;
                            self.set_var(top, Value::Module(module));
                        }
                    }
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let imported = self.import(module)?;
                if names.is_empty() {
                    let mut public: Vec<(&String, &Value)> = imported
                        .attrs
                        .iter()
                        .filter(|(name, _)| !name.starts_with('_'))
                        .collect();
                    public.sort_by(|a, b| a.0.cmp(b.0));
                    for (name, value) in public {
                        self.set_var(name, value.clone());
                    }
                }
                for alias in names {
                    let value = match imported.attrs.get(&alias.name) {
                        Some(value) => value.clone(),
                        None => Value::Module(
                            self.import(&format!("{module}.{}", alias.name)).map_err(|_| {
                                ScriptError::new(
                                    ErrorKind::ImportError,
                                    format!("cannot import name '{}' from '{module}'", alias.name),
                                )
                            })?,
                        ),
                    };
                    self.set_var(alias.asname.as_ref().unwrap_or(&alias.name), value);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                let result = match self.exec_block(body) {
                    Ok(Flow::Normal) => self.exec_block(orelse),
                    Ok(flow) => Ok(flow),
                    Err(err) if err.kind.is_resource_limit() => Err(err),
                    Err(err) => self.handle(err, handlers),
                };
                if !finalbody.is_empty() {
                    match self.exec_block(finalbody)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                return result;
            }
            StmtKind::Raise(value) => {
                let err = match value {
                    None => self.current_exception.clone().ok_or_else(|| {
                        ScriptError::runtime("No active exception to reraise")
                    })?,
                    Some(expr) => match self.eval(expr)? {
                        Value::ExceptionType(kind) => ScriptError::new(kind, ""),
                        Value::Exception(err) => ScriptError {
                            line: None,
                            ..(*err).clone()
                        },
                        other => {
                            return Err(ScriptError::type_error(format!(
                                "exceptions must derive from BaseException, not '{}'",
                                other.type_name()
                            )))
                        }
                    },
                };
                return Err(err);
            }
            StmtKind::Assert { test, msg } => {
                let value = self.eval(test)?;
                if !self.truthy(&value) {
                    let message = match msg {
                        Some(msg) => {
                            let msg = self.eval(msg)?;
                            self.display(&msg)
                        }
                        None => String::new(),
                    };
                    return Err(ScriptError::new(ErrorKind::AssertionError, message));
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
            StmtKind::Global(names) => {
                let mut frame = self.scope.borrow_mut();
                frame.globals.extend(names.iter().cloned());
            }
            StmtKind::With { items, body } => {
                for (expr, target) in items {
                    let value = self.eval(expr)?;
                    if let Some(target) = target {
                        self.assign(target, value)?;
                    }
                }
                return self.exec_block(body);
            }
        }
        Ok(Flow::Normal)
    }

    fn handle(&mut self, err: ScriptError, handlers: &[Handler]) -> Result<Flow, ScriptError> {
        for handler in handlers {
            let matches = match &handler.kind {
                None => true,
                Some(kind) => {
                    let kind = self.eval(kind)?;
                    self.exception_matches(&kind, err.kind)?
                }
            };
            if !matches {
                continue;
            }
            if let Some(name) = &handler.name {
                self.set_var(name, Value::Exception(Rc::new(err.clone())));
            }
            let previous = self.current_exception.replace(err);
            let result = self.exec_block(&handler.body);
            self.current_exception = previous;
            return result;
        }
        Err(err)
    }

    fn exception_matches(&self, kind: &Value, raised: ErrorKind) -> Result<bool, ScriptError> {
        match kind {
            Value::ExceptionType(kind) => Ok(kind.handles(raised)),
            Value::Tuple(kinds) => {
                for kind in kinds.iter() {
                    if self.exception_matches(kind, raised)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            other => Err(ScriptError::type_error(format!(
                "catching '{}' is not allowed, only exception classes",
                other.type_name()
            ))),
        }
    }

    fn make_function(&mut self, def: &Rc<FunctionDef>) -> Result<Value, ScriptError> {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            });
        }
        Ok(Value::Function(Rc::new(Function {
            def: def.clone(),
            defaults,
            closure: self.scope.clone(),
        })))
    }

    // -- Assignment ----------------------------------------------

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                self.set_var(name, value);
                Ok(())
            }
            Target::Attribute(object, name) => {
                let object = self.eval(object)?;
                self.set_attr(&object, name, value)
            }
            Target::Subscript(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                self.set_item(&object, &index, value)
            }
            Target::Tuple(targets) => self.unpack(targets, value),
            Target::Starred(_) => Err(ScriptError::syntax(
                self.line,
                "starred assignment target must be in a list or tuple",
            )),
        }
    }

    fn unpack(&mut self, targets: &[Target], value: Value) -> Result<(), ScriptError> {
        let items = self.iterate(&value)?;
        let starred = targets.iter().position(|t| matches!(t, Target::Starred(_)));
        match starred {
            None => {
                if items.len() != targets.len() {
                    return Err(ScriptError::value(format!(
                        "expected {} values to unpack, got {}",
                        targets.len(),
                        items.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
            }
            Some(star) => {
                let after = targets.len() - star - 1;
                if items.len() < targets.len() - 1 {
                    return Err(ScriptError::value(format!(
                        "expected at least {} values to unpack, got {}",
                        targets.len() - 1,
                        items.len()
                    )));
                }
                let middle_end = items.len() - after;
                for (target, item) in targets[..star].iter().zip(&items[..star]) {
                    self.assign(target, item.clone())?;
                }
                if let Target::Starred(inner) = &targets[star] {
                    self.assign(inner, Value::list(items[star..middle_end].to_vec()))?;
                }
                for (target, item) in targets[star + 1..].iter().zip(&items[middle_end..]) {
                    self.assign(target, item.clone())?;
                }
            }
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: Value) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name)?;
                if let Some(result) = self.aug_value(current, op, value)? {
                    self.set_var(name, result);
                }
            }
            Target::Attribute(object, name) => {
                let object = self.eval(object)?;
                let current = self.get_attr(&object, name)?;
                if let Some(result) = self.aug_value(current, op, value)? {
                    self.set_attr(&object, name, result)?;
                }
            }
            Target::Subscript(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                let current = self.get_item(&object, &index)?;
                if let Some(result) = self.aug_value(current, op, value)? {
                    self.set_item(&object, &index, result)?;
                }
            }
            _ => {
                return Err(ScriptError::syntax(
                    self.line,
                    "illegal expression for augmented assignment",
                ))
            }
        }
        Ok(())
    }

    /// The new value of an augmented assignment, or `None` when the target was updated in place
    fn aug_value(&mut self, current: Value, op: BinOp, value: Value) -> Result<Option<Value>, ScriptError> {
        if op == BinOp::Add {
            if let Value::Object(object) = &current {
                if object.clone().add_assign(self, value.clone())? {
                    return Ok(None);
                }
            }
            if let Value::List(items) = &current {
                let extra = self.iterate(&value)?;
                self.check_size(items.borrow().len() + extra.len())?;
                items.borrow_mut().extend(extra);
                return Ok(None);
            }
        }
        ops::binary(self, op, &current, &value).map(Some)
    }

    fn delete(&mut self, target: &Target) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => self.del_var(name),
            Target::Subscript(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                match &object {
                    Value::List(items) => {
                        let len = items.borrow().len();
                        let i = self.index_in(len, &index)?;
                        items.borrow_mut().remove(i);
                        Ok(())
                    }
                    Value::Dict(dict) => {
                        let key = index.key()?;
                        let removed = dict.borrow_mut().remove(&key);
                        removed
                            .map(|_| ())
                            .ok_or_else(|| ScriptError::key(self.repr(&index)))
                    }
                    other => Err(ScriptError::type_error(format!(
                        "'{}' object does not support item deletion",
                        other.type_name()
                    ))),
                }
            }
            Target::Tuple(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
                Ok(())
            }
            _ => Err(ScriptError::syntax(self.line, "cannot delete this target")),
        }
    }

    // -- Expressions ---------------------------------------------

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::Constant(constant) => Ok(match constant {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(n) => Value::Int(*n),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::str(s),
            }),
            Expr::JoinedStr(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FPart::Literal(text) => out.push_str(text),
                        FPart::Field {
                            expr,
                            conversion,
                            spec,
                        } => {
                            let value = self.eval(expr)?;
                            let value = match conversion {
                                Some('r') | Some('a') => Value::str(self.repr(&value)),
                                Some(_) => Value::str(self.display(&value)),
                                None => value,
                            };
                            let rendered = match spec {
                                Some(spec) => builtins::format_value(self, &value, spec)?,
                                None => self.display(&value),
                            };
                            out.push_str(&rendered);
                        }
                    }
                }
                self.check_size(out.len())?;
                Ok(Value::str(out))
            }
            Expr::Name(name) => self.lookup(name),
            Expr::Attribute(object, name) => {
                let object = self.eval(object)?;
                self.get_attr(&object, name)
            }
            Expr::Subscript(object, index) => {
                let object = self.eval(object)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let lower = self.eval_bound(lower.as_deref())?;
                    let upper = self.eval_bound(upper.as_deref())?;
                    let step = self.eval_bound(step.as_deref())?.unwrap_or(1);
                    return self.slice(&object, lower, upper, step);
                }
                let index = self.eval(index)?;
                self.get_item(&object, &index)
            }
            Expr::Slice { .. } => Err(ScriptError::syntax(self.line, "slice outside of a subscript")),
            Expr::Call { func, args } => {
                let func = self.eval(func)?;
                let args = self.eval_args(args)?;
                self.call(&func, args)
            }
            Expr::BinOp(left, op, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                ops::binary(self, *op, &left, &right)
            }
            Expr::UnaryOp(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => ops::negate(self, &value),
                    UnaryOp::Pos => ops::positive(self, &value),
                    UnaryOp::Not => Ok(Value::Bool(!self.truthy(&value))),
                }
            }
            Expr::BoolOp(op, values) => {
                let mut last = Value::None;
                for expr in values {
                    last = self.eval(expr)?;
                    let truthy = self.truthy(&last);
                    match op {
                        BoolOp::And if !truthy => return Ok(last),
                        BoolOp::Or if truthy => return Ok(last),
                        _ => {}
                    }
                }
                Ok(last)
            }
            Expr::Compare(left, chain) => self.compare_chain(left, chain),
            Expr::IfExp { test, body, orelse } => {
                let test = self.eval(test)?;
                if self.truthy(&test) {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Lambda(def) => self.make_function(def),
            Expr::List(items) => {
                let items = self.eval_items(items)?;
                Ok(Value::list(items))
            }
            Expr::Tuple(items) => {
                let items = self.eval_items(items)?;
                Ok(Value::tuple(items))
            }
            Expr::Set(items) => {
                let items = self.eval_items(items)?;
                let mut set = Dict::new();
                for item in items {
                    set.insert(item, Value::None)?;
                }
                Ok(Value::Set(Rc::new(std::cell::RefCell::new(set))))
            }
            Expr::Dict(pairs) => {
                let mut dict = Dict::new();
                for (key, value) in pairs {
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    dict.insert(key, value)?;
                }
                Ok(Value::dict(dict))
            }
            Expr::Starred(_) => Err(ScriptError::syntax(
                self.line,
                "can't use starred expression here",
            )),
            Expr::Comprehension {
                kind,
                element,
                key,
                generators,
            } => self.comprehension(*kind, element, key.as_deref(), generators),
        }
    }

    fn eval_bound(&mut self, expr: Option<&Expr>) -> Result<Option<i64>, ScriptError> {
        let Some(expr) = expr else {
            return Ok(None);
        };
        match self.eval(expr)? {
            Value::None => Ok(None),
            value => value.as_i64().map(Some).ok_or_else(|| {
                ScriptError::type_error("slice indices must be integers or None")
            }),
        }
    }

    fn eval_items(&mut self, items: &[Expr]) -> Result<Vec<Value>, ScriptError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let Expr::Starred(inner) = item {
                let value = self.eval(inner)?;
                out.extend(self.iterate(&value)?);
            } else {
                out.push(self.eval(item)?);
            }
        }
        self.check_size(out.len())?;
        Ok(out)
    }

    fn eval_args(&mut self, args: &[Arg]) -> Result<CallArgs, ScriptError> {
        let mut call = CallArgs::default();
        for arg in args {
            match arg {
                Arg::Positional(expr) => {
                    let value = self.eval(expr)?;
                    call.positional.push(value);
                }
                Arg::Star(expr) => {
                    let value = self.eval(expr)?;
                    let items = self.iterate(&value)?;
                    call.positional.extend(items);
                }
                Arg::Keyword(name, expr) => {
                    let value = self.eval(expr)?;
                    call.keywords.push((name.clone(), value));
                }
                Arg::DoubleStar(expr) => match self.eval(expr)? {
                    Value::Dict(dict) => {
                        for (key, value) in dict.borrow().iter() {
                            let Some(key) = key.as_str() else {
                                return Err(ScriptError::type_error("keywords must be strings"));
                            };
                            call.keywords.push((key.to_string(), value.clone()));
                        }
                    }
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            other.type_name()
                        )))
                    }
                },
            }
        }
        Ok(call)
    }

    fn compare_chain(&mut self, left: &Expr, chain: &[(crate::script::ast::CmpOp, Expr)]) -> Result<Value, ScriptError> {
        let mut current = self.eval(left)?;
        let mut relations: Vec<Rc<Relation>> = Vec::new();
        for (op, right) in chain {
            let right = self.eval(right)?;
            match ops::compare(self, *op, &current, &right)? {
                Value::Relation(relation) => relations.push(relation),
                other => {
                    if !self.truthy(&other) {
                        return Ok(Value::Bool(false));
                    }
                }
            }
            current = right;
        }
        match relations.len() {
            0 => Ok(Value::Bool(true)),
            1 => Ok(Value::Relation(relations.remove(0))),
            2 => match (relations[0].as_ref(), relations[1].as_ref()) {
                (Relation::Single(lower), Relation::Single(upper)) => {
                    Ok(Value::Relation(Rc::new(Relation::Ranged {
                        lower: lower.clone(),
                        upper: upper.clone(),
                    })))
                }
                _ => Err(ScriptError::type_error("nested ranged constraints are not supported")),
            },
            _ => Err(ScriptError::type_error(
                "a constraint chain may compare at most three expressions",
            )),
        }
    }

    fn comprehension(
        &mut self,
        kind: CompKind,
        element: &Expr,
        key: Option<&Expr>,
        generators: &[Generator],
    ) -> Result<Value, ScriptError> {
        let scope = Frame::child_of(&self.scope);
        let saved = std::mem::replace(&mut self.scope, scope);
        let mut out = Vec::new();
        let result = self.comprehend(generators, element, key, &mut out);
        self.scope = saved;
        result?;
        match kind {
            CompKind::List | CompKind::Generator => {
                Ok(Value::list(out.into_iter().map(|(_, v)| v).collect()))
            }
            CompKind::Set => {
                let mut set = Dict::new();
                for (_, value) in out {
                    set.insert(value, Value::None)?;
                }
                Ok(Value::Set(Rc::new(std::cell::RefCell::new(set))))
            }
            CompKind::Dict => {
                let mut dict = Dict::new();
                for (key, value) in out {
                    dict.insert(key.unwrap_or(Value::None), value)?;
                }
                Ok(Value::dict(dict))
            }
        }
    }

    fn comprehend(
        &mut self,
        generators: &[Generator],
        element: &Expr,
        key: Option<&Expr>,
        out: &mut Vec<(Option<Value>, Value)>,
    ) -> Result<(), ScriptError> {
        let Some((first, rest)) = generators.split_first() else {
            let key = match key {
                Some(key) => Some(self.eval(key)?),
                None => None,
            };
            let value = self.eval(element)?;
            out.push((key, value));
            return self.check_size(out.len());
        };
        let iterable = self.eval(&first.iter)?;
        'items: for item in self.iterate(&iterable)? {
            self.tick()?;
            self.assign(&first.target, item)?;
            for condition in &first.ifs {
                let keep = self.eval(condition)?;
                if !self.truthy(&keep) {
                    continue 'items;
                }
            }
            self.comprehend(rest, element, key, out)?;
        }
        Ok(())
    }

    // -- Calls ---------------------------------------------------

    /// Call any callable value
    pub fn call(&mut self, callee: &Value, args: CallArgs) -> Result<Value, ScriptError> {
        self.tick()?;
        match callee {
            Value::Function(function) => self.call_function(function, args),
            Value::Builtin(builtin) => (builtin.func)(self, args),
            Value::Method(receiver, name) => self.call_method(receiver, name, args),
            Value::ExceptionType(kind) => {
                let message = match args.positional.as_slice() {
                    [] => String::new(),
                    [single] => self.display(single),
                    many => self.repr(&Value::tuple(many.to_vec())),
                };
                Ok(Value::Exception(Rc::new(ScriptError::new(*kind, message))))
            }
            Value::Object(object) => object.clone().call(self, args),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_method(&mut self, receiver: &Value, name: &str, args: CallArgs) -> Result<Value, ScriptError> {
        match receiver {
            Value::Object(object) => object.clone().call_method(self, name, args),
            other => builtins::call_method(self, other, name, args),
        }
    }

    fn call_function(&mut self, function: &Rc<Function>, args: CallArgs) -> Result<Value, ScriptError> {
        if self.depth >= self.limits.max_depth {
            return Err(ScriptError::new(
                ErrorKind::RecursionLimitExceeded,
                "maximum recursion depth exceeded",
            ));
        }
        let def = &function.def;
        let frame = Frame::child_of(&function.closure);
        {
            let mut locals = frame.borrow_mut();
            let mut bound: Vec<Option<Value>> = vec![None; def.params.len()];
            let mut positional = args.positional.into_iter();
            for slot in bound.iter_mut() {
                match positional.next() {
                    Some(value) => *slot = Some(value),
                    None => break,
                }
            }
            let extra: Vec<Value> = positional.collect();
            match &def.vararg {
                Some(name) => {
                    locals.vars.insert(name.clone(), Value::tuple(extra));
                }
                None if !extra.is_empty() => {
                    return Err(ScriptError::type_error(format!(
                        "{}() takes {} positional arguments but {} were given",
                        def.name,
                        def.params.len(),
                        def.params.len() + extra.len()
                    )))
                }
                None => {}
            }
            let mut kwargs = Dict::new();
            for (name, value) in args.keywords {
                match def.params.iter().position(|p| p.name == name) {
                    Some(i) if bound[i].is_some() => {
                        return Err(ScriptError::type_error(format!(
                            "{}() got multiple values for argument '{name}'",
                            def.name
                        )))
                    }
                    Some(i) => bound[i] = Some(value),
                    None if def.kwarg.is_some() => kwargs.insert(Value::str(&name), value)?,
                    None => {
                        return Err(ScriptError::type_error(format!(
                            "{}() got an unexpected keyword argument '{name}'",
                            def.name
                        )))
                    }
                }
            }
            if let Some(name) = &def.kwarg {
                locals.vars.insert(name.clone(), Value::dict(kwargs));
            }
            for ((param, value), default) in def.params.iter().zip(bound).zip(&function.defaults) {
                let value = value.or_else(|| default.clone()).ok_or_else(|| {
                    ScriptError::type_error(format!(
                        "{}() missing required argument '{}'",
                        def.name, param.name
                    ))
                })?;
                locals.vars.insert(param.name.clone(), value);
            }
        }
        let saved = std::mem::replace(&mut self.scope, frame);
        let saved_line = self.line;
        self.depth += 1;
        let result = self.exec_block(&def.body);
        self.depth -= 1;
        self.scope = saved;
        self.line = saved_line;
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    // -- Attributes and items ------------------------------------

    pub fn get_attr(&mut self, object: &Value, name: &str) -> Result<Value, ScriptError> {
        match object {
            Value::Module(module) => module.attrs.get(name).cloned().ok_or_else(|| {
                ScriptError::attribute(format!(
                    "module '{}' has no attribute '{name}'",
                    module.name
                ))
            }),
            Value::Object(obj) => {
                if let Some(value) = obj.clone().get_attr(self, name)? {
                    return Ok(value);
                }
                if obj.has_method(name) {
                    return Ok(Value::Method(Rc::new(object.clone()), Rc::from(name)));
                }
                Err(ScriptError::attribute(format!(
                    "'{}' object has no attribute '{name}'",
                    obj.type_name()
                )))
            }
            Value::Exception(err) if name == "args" => {
                Ok(Value::tuple(vec![Value::str(&err.message)]))
            }
            Value::Function(function) if name == "__name__" => Ok(Value::str(&function.def.name)),
            Value::ExceptionType(kind) if name == "__name__" => Ok(Value::str(kind.name())),
            other if builtins::has_method(other, name) => {
                Ok(Value::Method(Rc::new(other.clone()), Rc::from(name)))
            }
            other => Err(ScriptError::attribute(format!(
                "'{}' object has no attribute '{name}'",
                other.type_name()
            ))),
        }
    }

    fn set_attr(&mut self, object: &Value, name: &str, value: Value) -> Result<(), ScriptError> {
        match object {
            Value::Object(obj) => obj.clone().set_attr(self, name, value),
            other => Err(ScriptError::attribute(format!(
                "'{}' object attribute '{name}' is read-only",
                other.type_name()
            ))),
        }
    }

    fn index_in(&self, len: usize, index: &Value) -> Result<usize, ScriptError> {
        let Some(i) = index.as_i64().filter(|_| !matches!(index, Value::Float(_))) else {
            return Err(ScriptError::type_error(format!(
                "indices must be integers, not {}",
                index.type_name()
            )));
        };
        let resolved = if i < 0 { i + len as i64 } else { i };
        if resolved < 0 || resolved >= len as i64 {
            return Err(ScriptError::index("index out of range"));
        }
        Ok(resolved as usize)
    }

    pub fn get_item(&mut self, object: &Value, index: &Value) -> Result<Value, ScriptError> {
        match object {
            Value::List(items) => {
                let items = items.borrow();
                let i = self.index_in(items.len(), index)?;
                Ok(items[i].clone())
            }
            Value::Tuple(items) => {
                let i = self.index_in(items.len(), index)?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = self.index_in(chars.len(), index)?;
                Ok(Value::str(chars[i].to_string()))
            }
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                let i = self.index_in(len, index)?;
                Ok(Value::Int(start + i as i64 * step))
            }
            Value::Dict(dict) => {
                let key = index.key()?;
                let found = dict.borrow().get(&key).cloned();
                found.ok_or_else(|| ScriptError::key(self.repr(index)))
            }
            Value::Object(obj) => obj.clone().get_item(self, index),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn set_item(&mut self, object: &Value, index: &Value, value: Value) -> Result<(), ScriptError> {
        match object {
            Value::List(items) => {
                let len = items.borrow().len();
                let i = self.index_in(len, index)?;
                items.borrow_mut()[i] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                let len = dict.borrow().len();
                self.check_size(len + 1)?;
                dict.borrow_mut().insert(index.clone(), value)
            }
            Value::Object(obj) => obj.clone().set_item(self, index, value),
            other => Err(ScriptError::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn slice(&mut self, object: &Value, lower: Option<i64>, upper: Option<i64>, step: i64) -> Result<Value, ScriptError> {
        if step == 0 {
            return Err(ScriptError::value("slice step cannot be zero"));
        }
        let pick = |len: usize| slice_indices(len, lower, upper, step);
        match object {
            Value::List(items) => {
                let items = items.borrow();
                Ok(Value::list(pick(items.len()).into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Tuple(items) => Ok(Value::tuple(
                pick(items.len()).into_iter().map(|i| items[i].clone()).collect(),
            )),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::str(pick(chars.len()).into_iter().map(|i| chars[i]).collect::<String>()))
            }
            Value::Range { .. } => {
                let items = self.iterate(object)?;
                Ok(Value::list(pick(items.len()).into_iter().map(|i| items[i].clone()).collect()))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not sliceable",
                other.type_name()
            ))),
        }
    }

    // -- Protocols -----------------------------------------------

    /// Every element of an iterable, materialized
    pub fn iterate(&mut self, value: &Value) -> Result<Vec<Value>, ScriptError> {
        let items = match value {
            Value::List(items) => items.borrow().clone(),
            Value::Tuple(items) => items.to_vec(),
            Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            Value::Dict(dict) | Value::Set(dict) => dict.borrow().keys(),
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                self.check_size(len)?;
                (0..len as i64).map(|i| Value::Int(start + i * step)).collect()
            }
            Value::Object(obj) => obj.clone().iterate(self)?,
            other => {
                return Err(ScriptError::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        };
        Ok(items)
    }

    pub(crate) fn contains(&mut self, container: &Value, item: &Value) -> Result<bool, ScriptError> {
        match container {
            Value::Str(s) => match item {
                Value::Str(needle) => Ok(s.contains(needle.as_ref())),
                other => Err(ScriptError::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::Dict(dict) | Value::Set(dict) => Ok(dict.borrow().contains(&item.key()?)),
            Value::Range { start, stop, step } => Ok(match item.as_i64() {
                Some(n) => {
                    let inside = if *step > 0 {
                        n >= *start && n < *stop
                    } else {
                        n <= *start && n > *stop
                    };
                    inside && (n - start) % step == 0
                }
                None => false,
            }),
            other => {
                let items = self.iterate(other)?;
                Ok(items.iter().any(|candidate| ops::equal(self, candidate, item)))
            }
        }
    }

    pub fn truthy(&self, value: &Value) -> bool {
        match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(dict) | Value::Set(dict) => !dict.borrow().is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            Value::Object(obj) => match obj.len() {
                Some(len) => len > 0,
                None => obj
                    .as_scalar(self)
                    .map(|scalar| self.truthy(&scalar))
                    .unwrap_or(true),
            },
            _ => true,
        }
    }

    /// `str(value)`
    pub fn display(&self, value: &Value) -> String {
        match value {
            Value::Str(s) => s.to_string(),
            Value::Exception(err) => err.message.clone(),
            Value::Object(obj) => obj.display(self),
            other => self.repr(other),
        }
    }

    /// `repr(value)`
    pub fn repr(&self, value: &Value) -> String {
        self.repr_nested(value, 0)
    }

    fn repr_nested(&self, value: &Value, depth: usize) -> String {
        if depth > 16 {
            return "...".to_string();
        }
        match value {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => builtins::float_repr(*f),
            Value::Str(s) => builtins::quote(s),
            Value::List(items) => format!("[{}]", self.repr_items(items.borrow().iter(), depth)),
            Value::Tuple(items) if items.len() == 1 => {
                format!("({},)", self.repr_items(items.iter(), depth))
            }
            Value::Tuple(items) => format!("({})", self.repr_items(items.iter(), depth)),
            Value::Dict(dict) => {
                let dict = dict.borrow();
                let entries: Vec<String> = dict
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            self.repr_nested(k, depth + 1),
                            self.repr_nested(v, depth + 1)
                        )
                    })
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Value::Set(set) if set.borrow().is_empty() => "set()".to_string(),
            Value::Set(set) => format!(
                "{{{}}}",
                self.repr_items(set.borrow().iter().map(|(k, _)| k), depth)
            ),
            Value::Range { start, stop, step: 1 } => format!("range({start}, {stop})"),
            Value::Range { start, stop, step } => format!("range({start}, {stop}, {step})"),
            Value::Function(function) => format!("<function {}>", function.def.name),
            Value::Builtin(builtin) => format!("<built-in function {}>", builtin.name),
            Value::Method(_, name) => format!("<bound method {name}>"),
            Value::Module(module) => format!("<module '{}'>", module.name),
            Value::ExceptionType(kind) => format!("<class '{}'>", kind.name()),
            Value::Exception(err) => format!("{}({})", err.kind.name(), builtins::quote(&err.message)),
            Value::Expr(expression) => Named {
                item: &**expression,
                variables: &self.variables,
            }
            .to_string(),
            Value::Relation(relation) => relation
                .constraints()
                .iter()
                .map(|c| {
                    Named {
                        item: c,
                        variables: &self.variables,
                    }
                    .to_string()
                })
                .collect::<Vec<_>>()
                .join(", "),
            Value::Object(obj) => obj.display(self),
        }
    }

    fn repr_items<'v>(&self, items: impl Iterator<Item = &'v Value>, depth: usize) -> String {
        items
            .map(|item| self.repr_nested(item, depth + 1))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // module level functions close over the globals frame that holds them
        self.globals.borrow_mut().vars.clear();
    }
}

pub(crate) fn range_len(start: i64, stop: i64, step: i64) -> usize {
    let span = if step > 0 {
        stop.saturating_sub(start)
    } else {
        start.saturating_sub(stop)
    };
    if span <= 0 || step == 0 {
        return 0;
    }
    let step = step.unsigned_abs();
    ((span as u64).div_ceil(step)) as usize
}

fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let resolve = |i: i64| if i < 0 { i + len } else { i };
    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map(|i| resolve(i).clamp(0, len)).unwrap_or(0);
        let stop = upper.map(|i| resolve(i).clamp(0, len)).unwrap_or(len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = lower.map(|i| resolve(i).clamp(-1, len - 1)).unwrap_or(len - 1);
        let stop = upper.map(|i| resolve(i).clamp(-1, len - 1)).unwrap_or(-1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse;
    use crate::solvers::microlp::MicroLp;
    use crate::surface::PulpSurface;

    fn run(src: &str) -> Result<Vec<String>, ScriptError> {
        let surface = PulpSurface::new();
        let backend = MicroLp;
        let mut session = Session::new(&surface, &backend, Limits::default());
        session.run(&parse(src)?)?;
        Ok(session.output().to_vec())
    }

    #[test]
    fn functions_closures_and_defaults() {
        let out = run(
            "def make(k=2):\n    def times(x):\n        return x * k\n    return times\nprint(make()(4), make(3)(4))\n",
        )
        .unwrap();
        assert_eq!(out, vec!["8 12"]);
    }

    #[test]
    fn comprehensions_and_unpacking() {
        let out = run(
            "pairs = [(i, i * i) for i in range(4) if i % 2 == 1]\na, *rest = [1, 2, 3]\nprint(pairs, a, rest)\nprint({k: v for k, v in pairs})\n",
        )
        .unwrap();
        assert_eq!(out, vec!["[(1, 1), (3, 9)] 1 [2, 3]", "{1: 1, 3: 9}"]);
    }

    #[test]
    fn exceptions_are_caught_by_kind() {
        let out = run(
            "try:\n    {}['x']\nexcept (ValueError, KeyError) as e:\n    print('caught', e)\nfinally:\n    print('done')\n",
        )
        .unwrap();
        assert_eq!(out, vec!["caught 'x'", "done"]);
    }

    #[test]
    fn errors_carry_the_statement_line() {
        let err = run("x = 1\ny = x + undefined\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NameError);
        assert_eq!(err.line, Some(2));
    }

    #[test]
    fn step_budget_cannot_be_caught() {
        let surface = PulpSurface::new();
        let backend = MicroLp;
        let limits = Limits {
            max_steps: 1_000,
            ..Limits::default()
        };
        let mut session = Session::new(&surface, &backend, limits);
        let program = parse("try:\n    while True:\n        pass\nexcept Exception:\n    pass\n").unwrap();
        let err = session.run(&program).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepLimitExceeded);
    }

    #[test]
    fn recursion_is_bounded() {
        let err = run("def f(n):\n    return f(n + 1)\nf(0)\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecursionLimitExceeded);
    }

    #[test]
    fn only_surface_modules_are_importable() {
        let err = run("import os\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ImportError);
        assert!(run("import math\nprint(math.sqrt(16))\n").is_ok());
    }

    #[test]
    fn slicing_follows_python() {
        let out = run("s = [0, 1, 2, 3, 4]\nprint(s[1:3], s[::-2], s[-2:], 'abc'[::-1])\n").unwrap();
        assert_eq!(out, vec!["[1, 2] [4, 2, 0] [3, 4] cba"]);
    }

    #[test]
    fn range_lengths() {
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -3), 4);
        assert_eq!(range_len(5, 5, 1), 0);
        assert_eq!(range_len(5, 0, 1), 0);
    }
}
