//! Tree-walking interpreter for validated snippets.
//!
//! One `Interpreter` runs one snippet on one thread. The caller keeps a
//! clone of the cancellation flag and raises it when it stops waiting; the
//! interpreter checks the flag before every statement and every loop
//! iteration and unwinds with an uncatchable `Cancelled` exception.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value as Json;

use super::ast::*;
use super::builtins::builtin_value;
use super::format::format_value;
use super::ops::{self, MAX_ITEMS, MAX_STR_BYTES};
use super::value::{
    type_error, value_error, DictMap, ExcKind, Exception, Function, FunctionBody, Key, SessionValue, SetItems, TypeKind, Value,
    ValueIter,
};

/// Deepest chain of nested user function calls.
pub const MAX_CALL_DEPTH: usize = 1000;
const CHECK_EVERY: usize = 1024;

pub type Exec<T> = Result<T, Exception>;

/// A function activation's variables, linked to the scope it was defined in.
#[derive(Debug, Default)]
pub struct Scope {
    pub vars: RefCell<HashMap<String, Value>>,
    pub parent: Option<Rc<Scope>>,
}

impl Scope {
    fn new(vars: HashMap<String, Value>, parent: Option<Rc<Scope>>) -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::new(vars),
            parent,
        })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.lookup(name))
    }

    fn owner(self: &Rc<Self>, name: &str) -> Option<Rc<Scope>> {
        if self.vars.borrow().contains_key(name) {
            return Some(self.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.owner(name))
    }
}

/// Where names resolve while a block runs. Module level has no scope and
/// reads and writes globals directly.
pub(super) struct Frame {
    scope: Option<Rc<Scope>>,
    globals: HashSet<String>,
    nonlocals: HashSet<String>,
}

impl Frame {
    fn module() -> Self {
        Self {
            scope: None,
            globals: HashSet::new(),
            nonlocals: HashSet::new(),
        }
    }

    fn local(scope: Rc<Scope>) -> Self {
        Self {
            scope: Some(scope),
            globals: HashSet::new(),
            nonlocals: HashSet::new(),
        }
    }

    fn comprehension(parent: &Frame) -> Self {
        Self::local(Scope::new(HashMap::new(), parent.scope.clone()))
    }
}

pub(super) enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interpreter {
    globals: HashMap<String, Value>,
    pub(super) output: String,
    pub(super) allowed_modules: Vec<String>,
    pub(super) modules: HashMap<String, Value>,
    pub(super) rng: StdRng,
    cancel: Arc<AtomicBool>,
    depth: usize,
    handling: Vec<Exception>,
}

impl Interpreter {
    pub fn new(allowed_modules: Vec<String>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            globals: HashMap::new(),
            output: String::new(),
            allowed_modules,
            modules: HashMap::new(),
            rng: StdRng::from_entropy(),
            cancel,
            depth: 0,
            handling: Vec::new(),
        }
    }

    /// Pre-populates module globals, as persistent sessions do.
    pub fn seed(&mut self, variables: &BTreeMap<String, SessionValue>) {
        for (name, value) in variables {
            if self.is_reserved(name) {
                continue;
            }
            self.globals.insert(name.clone(), value.to_value());
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Runs `program` and returns the value of its final statement when that
    /// statement is a bare expression.
    pub fn run(&mut self, program: &[Stmt]) -> Exec<Option<Value>> {
        let mut frame = Frame::module();
        let Some((last, rest)) = program.split_last() else {
            return Ok(None);
        };
        self.exec_block(rest, &mut frame)?;

        if let StmtKind::Expr(expr) = &last.kind {
            self.tick().map_err(|e| e.at_line(last.line))?;
            let value = self.eval(expr, &frame).map_err(|e| e.at_line(last.line))?;
            return Ok(Some(value));
        }
        self.exec_block(std::slice::from_ref(last), &mut frame)?;
        Ok(None)
    }

    /// Module globals that qualify as user variables.
    pub fn variables(&self) -> BTreeMap<String, Json> {
        self.user_globals().map(|(name, value)| (name.clone(), export(value))).collect()
    }

    /// Typed copies of the user variables for a persistent session. Values
    /// with no owned form (exceptions, iterators, compiled patterns) stay
    /// behind.
    pub fn session_values(&self) -> BTreeMap<String, SessionValue> {
        self.user_globals()
            .filter_map(|(name, value)| Some((name.clone(), value.to_session()?)))
            .collect()
    }

    fn user_globals(&self) -> impl Iterator<Item = (&String, &Value)> + '_ {
        self.globals
            .iter()
            .filter(|(name, value)| !self.is_reserved(name) && !value.is_code_object())
    }

    /// Private names plus anything that shadows a builtin, a builtin type,
    /// an exception class or an importable module.
    fn is_reserved(&self, name: &str) -> bool {
        name.starts_with('_') || builtin_value(name).is_some() || self.allowed_modules.iter().any(|m| m == name)
    }

    pub(super) fn tick(&self) -> Exec<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Exception::new(ExcKind::Cancelled, "Execution cancelled"));
        }
        Ok(())
    }

    /// Drains an iterator, honouring cancellation and the collection cap.
    pub(super) fn collect(&self, iter: ValueIter) -> Exec<Vec<Value>> {
        let (lower, _) = iter.size_hint();
        if lower > MAX_ITEMS {
            return Err(ops::memory_error());
        }
        let mut items = Vec::with_capacity(lower);
        for (i, item) in iter.enumerate() {
            if i % CHECK_EVERY == 0 {
                self.tick()?;
                if i > MAX_ITEMS {
                    return Err(ops::memory_error());
                }
            }
            items.push(item);
        }
        Ok(items)
    }

    pub(super) fn collect_value(&self, value: &Value) -> Exec<Vec<Value>> {
        self.collect(value.iter()?)
    }

    pub(super) fn write_output(&mut self, text: &str) -> Exec<()> {
        if self.output.len() + text.len() > MAX_STR_BYTES {
            return Err(Exception::new(ExcKind::MemoryError, "output limit exceeded"));
        }
        self.output.push_str(text);
        Ok(())
    }

    // ---- statements ----

    fn exec_block(&mut self, body: &[Stmt], frame: &mut Frame) -> Exec<Flow> {
        for stmt in body {
            self.tick().map_err(|e| e.at_line(stmt.line))?;
            match self.exec_stmt(stmt, frame).map_err(|e| e.at_line(stmt.line))? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, frame: &mut Frame) -> Exec<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, frame)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, frame)?;
                for target in targets {
                    self.assign(target, value.clone(), frame)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, frame)?,
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test, frame)?.truthy() { body } else { orelse };
                return self.exec_block(branch, frame);
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    self.tick()?;
                    if !self.eval(test, frame)?.truthy() {
                        return self.exec_block(orelse, frame);
                    }
                    match self.exec_block(body, frame)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter, frame)?;
                for item in iterable.iter()? {
                    self.tick()?;
                    self.assign(target, item, frame)?;
                    match self.exec_block(body, frame)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                return self.exec_block(orelse, frame);
            }
            StmtKind::FunctionDef { name, params, body } => {
                let function = self.make_function(name, params, FunctionBody::Block(body.clone()), frame)?;
                self.store(name, function, frame)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, frame)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Import(names) => {
                for alias in names {
                    let module = self.import_module(&alias.name)?;
                    match &alias.alias {
                        Some(alias) => self.store(alias, module, frame)?,
                        None => {
                            let root = alias.name.split('.').next().unwrap_or(&alias.name);
                            let root_module = self.import_module(root)?;
                            self.store(root, root_module, frame)?;
                        }
                    }
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let Value::Module(loaded) = self.import_module(module)? else {
                    return Err(Exception::new(ExcKind::ImportError, format!("No module named '{}'", module)));
                };
                for alias in names {
                    if alias.name == "*" {
                        for (name, value) in loaded.attrs.iter().filter(|(n, _)| !n.starts_with('_')) {
                            self.store(name, value.clone(), frame)?;
                        }
                        continue;
                    }
                    let value = loaded.attrs.get(&alias.name).cloned().ok_or_else(|| {
                        Exception::new(
                            ExcKind::ImportError,
                            format!("cannot import name '{}' from '{}'", alias.name, module),
                        )
                    })?;
                    self.store(alias.alias.as_ref().unwrap_or(&alias.name), value, frame)?;
                }
            }
            StmtKind::Global(names) => {
                frame.globals.extend(names.iter().cloned());
            }
            StmtKind::Nonlocal(names) => {
                let Some(scope) = &frame.scope else {
                    return Err(type_error("nonlocal declaration not allowed at module level"));
                };
                for name in names {
                    if scope.parent.as_ref().and_then(|p| p.owner(name)).is_none() {
                        return Err(Exception::new(
                            ExcKind::NameError,
                            format!("no binding for nonlocal '{}' found", name),
                        ));
                    }
                }
                frame.nonlocals.extend(names.iter().cloned());
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, frame)?;
                }
            }
            StmtKind::Assert { test, message } => {
                if !self.eval(test, frame)?.truthy() {
                    let message = match message {
                        Some(expr) => self.eval(expr, frame)?.to_str(),
                        None => String::new(),
                    };
                    return Err(Exception::new(ExcKind::AssertionError, message));
                }
            }
            StmtKind::Raise(None) => {
                return Err(self
                    .handling
                    .last()
                    .cloned()
                    .unwrap_or_else(|| Exception::new(ExcKind::RuntimeError, "No active exception to reraise")));
            }
            StmtKind::Raise(Some(expr)) => {
                let raised = self.eval(expr, frame)?;
                return Err(match raised {
                    Value::Exception(exc) => Exception::new(exc.kind, exc.message.clone()),
                    Value::Type(TypeKind::Exc(kind)) => Exception::new(kind, ""),
                    _ => type_error("exceptions must derive from BaseException"),
                });
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody, frame),
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
        frame: &mut Frame,
    ) -> Exec<Flow> {
        let outcome = match self.exec_block(body, frame) {
            Ok(Flow::Normal) => self.exec_block(orelse, frame),
            Ok(flow) => Ok(flow),
            Err(err) if err.kind == ExcKind::Cancelled => return Err(err),
            Err(err) => self.handle(err, handlers, frame),
        };
        if finalbody.is_empty() {
            return outcome;
        }
        match self.exec_block(finalbody, frame)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle(&mut self, err: Exception, handlers: &[ExceptHandler], frame: &mut Frame) -> Exec<Flow> {
        for handler in handlers {
            if let Some(kind) = &handler.kind {
                let kind = self.eval(kind, frame)?;
                if !exception_matches(&err, &kind)? {
                    continue;
                }
            }
            if let Some(name) = &handler.name {
                self.store(name, Value::Exception(Rc::new(err.clone())), frame)?;
            }
            self.handling.push(err);
            let result = self.exec_block(&handler.body, frame);
            self.handling.pop();
            if let Some(name) = &handler.name {
                self.forget(name, frame);
            }
            return result;
        }
        Err(err)
    }

    fn make_function(
        &mut self,
        name: &str,
        params: &Arc<Params>,
        body: FunctionBody,
        frame: &Frame,
    ) -> Exec<Value> {
        let evaluate = |this: &mut Self, list: &[Param]| -> Exec<Vec<Option<Value>>> {
            list.iter()
                .map(|p| p.default.as_ref().map(|d| this.eval(d, frame)).transpose())
                .collect()
        };
        let defaults = evaluate(self, &params.positional)?;
        let kw_defaults = evaluate(self, &params.keyword_only)?;
        Ok(Value::Function(Rc::new(Function {
            name: name.to_string(),
            params: params.clone(),
            body,
            defaults,
            kw_defaults,
            closure: frame.scope.clone(),
        })))
    }

    // ---- names ----

    fn lookup(&self, name: &str, frame: &Frame) -> Exec<Value> {
        if !frame.globals.contains(name) {
            if let Some(value) = frame.scope.as_ref().and_then(|scope| scope.lookup(name)) {
                return Ok(value);
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        builtin_value(name)
            .ok_or_else(|| Exception::new(ExcKind::NameError, format!("name '{}' is not defined", name)))
    }

    fn store(&mut self, name: &str, value: Value, frame: &Frame) -> Exec<()> {
        let scope = match &frame.scope {
            Some(scope) if !frame.globals.contains(name) => scope,
            _ => {
                self.globals.insert(name.to_string(), value);
                return Ok(());
            }
        };
        if frame.nonlocals.contains(name) {
            let owner = scope.parent.as_ref().and_then(|p| p.owner(name)).ok_or_else(|| {
                Exception::new(ExcKind::NameError, format!("no binding for nonlocal '{}' found", name))
            })?;
            owner.vars.borrow_mut().insert(name.to_string(), value);
        } else {
            scope.vars.borrow_mut().insert(name.to_string(), value);
        }
        Ok(())
    }

    fn forget(&mut self, name: &str, frame: &Frame) -> bool {
        match &frame.scope {
            Some(scope) if !frame.globals.contains(name) => scope.vars.borrow_mut().remove(name).is_some(),
            _ => self.globals.remove(name).is_some(),
        }
    }

    fn assign(&mut self, target: &Expr, value: Value, frame: &mut Frame) -> Exec<()> {
        match target {
            Expr::Name(name) => self.store(name, value, frame),
            Expr::Tuple(targets) | Expr::List(targets) => self.unpack(targets, value, frame),
            Expr::Subscript { value: container, index } => {
                let container = self.eval(container, frame)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.slice_bounds(lower, upper, step, frame)?;
                    let replacement = self.collect_value(&value)?;
                    return ops::set_slice(&container, lower, upper, step, replacement);
                }
                let index = self.eval(index, frame)?;
                ops::set_item(&container, &index, value)
            }
            Expr::Attribute { value: object, attr } => {
                let object = self.eval(object, frame)?;
                Err(Exception::new(
                    ExcKind::AttributeError,
                    format!("'{}' object attribute '{}' is read-only", object.type_name(), attr),
                ))
            }
            _ => Err(type_error("cannot assign to expression")),
        }
    }

    fn unpack(&mut self, targets: &[Expr], value: Value, frame: &mut Frame) -> Exec<()> {
        let items = self.collect_value(&value).map_err(|err| {
            if err.kind == ExcKind::TypeError {
                type_error(format!("cannot unpack non-iterable {} object", value.type_name()))
            } else {
                err
            }
        })?;
        let star = targets.iter().position(|t| matches!(t, Expr::Starred(_)));
        match star {
            None => {
                if items.len() != targets.len() {
                    return Err(if items.len() > targets.len() {
                        value_error(format!("too many values to unpack (expected {})", targets.len()))
                    } else {
                        value_error(format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        ))
                    });
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, frame)?;
                }
            }
            Some(position) => {
                let fixed = targets.len() - 1;
                if items.len() < fixed {
                    return Err(value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        fixed,
                        items.len()
                    )));
                }
                let mut items = items;
                let tail = items.split_off(items.len() - (targets.len() - position - 1));
                let middle = items.split_off(position);
                for (target, item) in targets[..position].iter().zip(items) {
                    self.assign(target, item, frame)?;
                }
                if let Expr::Starred(inner) = &targets[position] {
                    self.assign(inner, Value::list(middle), frame)?;
                }
                for (target, item) in targets[position + 1..].iter().zip(tail) {
                    self.assign(target, item, frame)?;
                }
            }
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr, frame: &mut Frame) -> Exec<()> {
        match target {
            Expr::Name(name) => {
                let current = self.lookup(name, frame)?;
                let operand = self.eval(value, frame)?;
                let updated = self.in_place(op, current, &operand)?;
                self.store(name, updated, frame)
            }
            Expr::Subscript { value: container, index } if !matches!(index.as_ref(), Expr::Slice { .. }) => {
                let container = self.eval(container, frame)?;
                let index = self.eval(index, frame)?;
                let current = ops::get_item(&container, &index)?;
                let operand = self.eval(value, frame)?;
                let updated = self.in_place(op, current, &operand)?;
                ops::set_item(&container, &index, updated)
            }
            _ => Err(type_error("illegal expression for augmented assignment")),
        }
    }

    /// `+=` on a list extends it in place; everything else rebinds.
    fn in_place(&mut self, op: BinOp, current: Value, operand: &Value) -> Exec<Value> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.collect_value(operand)?;
            if items.borrow().len() + extra.len() > MAX_ITEMS {
                return Err(ops::memory_error());
            }
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        ops::binary(op, &current, operand)
    }

    fn delete(&mut self, target: &Expr, frame: &mut Frame) -> Exec<()> {
        match target {
            Expr::Name(name) => {
                if self.forget(name, frame) {
                    Ok(())
                } else {
                    Err(Exception::new(ExcKind::NameError, format!("name '{}' is not defined", name)))
                }
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                targets.iter().try_for_each(|target| self.delete(target, frame))
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value, frame)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.slice_bounds(lower, upper, step, frame)?;
                    let indices = ops::slice_indices(ops::sequence_len(&container)?, lower, upper, step)?;
                    return ops::del_slice(&container, indices);
                }
                let index = self.eval(index, frame)?;
                ops::del_item(&container, &index)
            }
            _ => Err(type_error("cannot delete expression")),
        }
    }

    // ---- expressions ----

    pub(super) fn eval(&mut self, expr: &Expr, frame: &Frame) -> Exec<Value> {
        match expr {
            Expr::Constant(constant) => Ok(match constant {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
                Constant::BigInt(i) => Value::from_bigint(i.clone()),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::str(s),
            }),
            Expr::Name(name) => self.lookup(name, frame),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Field { expr, conversion, spec } => {
                            let value = self.eval(expr, frame)?;
                            let value = match conversion {
                                Some('r') | Some('a') => Value::str(value.repr()),
                                Some('s') => Value::str(value.to_str()),
                                _ => value,
                            };
                            out.push_str(&format_value(&value, spec)?);
                        }
                    }
                    if out.len() > MAX_STR_BYTES {
                        return Err(ops::memory_error());
                    }
                }
                Ok(Value::str(out))
            }
            Expr::List(items) => Ok(Value::list(self.eval_items(items, frame)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_items(items, frame)?)),
            Expr::Dict(pairs) => {
                let mut map = DictMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = Key::from_value(&self.eval(key, frame)?)?;
                    let value = self.eval(value, frame)?;
                    map.insert(key, value);
                }
                Ok(Value::dict(map))
            }
            Expr::Set(items) => {
                let mut set = SetItems::with_capacity(items.len());
                for item in self.eval_items(items, frame)? {
                    set.insert(Key::from_value(&item)?);
                }
                Ok(Value::set(set))
            }
            Expr::Attribute { value, attr } => {
                let object = self.eval(value, frame)?;
                self.get_attr(&object, attr)
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value, frame)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.slice_bounds(lower, upper, step, frame)?;
                    let indices = ops::slice_indices(ops::sequence_len(&container)?, lower, upper, step)?;
                    return ops::get_slice(&container, &indices);
                }
                let index = self.eval(index, frame)?;
                ops::get_item(&container, &index)
            }
            Expr::Slice { .. } => Err(type_error("slice outside of a subscript")),
            Expr::Call { func, args } => {
                let callee = self.eval(func, frame)?;
                let (positional, keywords) = self.eval_arguments(args, frame)?;
                self.call(&callee, positional, keywords)
            }
            Expr::BinOp { op, left, right } => {
                let left = self.eval(left, frame)?;
                let right = self.eval(right, frame)?;
                ops::binary(*op, &left, &right)
            }
            Expr::UnaryOp { op, operand } => {
                let operand = self.eval(operand, frame)?;
                ops::unary(*op, &operand)
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left, frame)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right, frame),
                }
            }
            Expr::Compare { left, comparisons } => {
                let mut current = self.eval(left, frame)?;
                for (op, right) in comparisons {
                    let right = self.eval(right, frame)?;
                    if !compare(*op, &current, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test, frame)?.truthy() {
                    self.eval(body, frame)
                } else {
                    self.eval(orelse, frame)
                }
            }
            Expr::ListComp { element, generators } => {
                let mut comp = Frame::comprehension(frame);
                let mut out = Vec::new();
                self.generate(generators, &mut comp, &mut |this: &mut Self, inner: &Frame| {
                    out.push(this.eval(element, inner)?);
                    if out.len() > MAX_ITEMS {
                        return Err(ops::memory_error());
                    }
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            Expr::SetComp { element, generators } => {
                let mut comp = Frame::comprehension(frame);
                let mut set = SetItems::new();
                self.generate(generators, &mut comp, &mut |this: &mut Self, inner: &Frame| {
                    set.insert(Key::from_value(&this.eval(element, inner)?)?);
                    if set.len() > MAX_ITEMS {
                        return Err(ops::memory_error());
                    }
                    Ok(())
                })?;
                Ok(Value::set(set))
            }
            Expr::DictComp { key, value, generators } => {
                let mut comp = Frame::comprehension(frame);
                let mut map = DictMap::new();
                self.generate(generators, &mut comp, &mut |this: &mut Self, inner: &Frame| {
                    let k = Key::from_value(&this.eval(key, inner)?)?;
                    let v = this.eval(value, inner)?;
                    map.insert(k, v);
                    if map.len() > MAX_ITEMS {
                        return Err(ops::memory_error());
                    }
                    Ok(())
                })?;
                Ok(Value::dict(map))
            }
            Expr::Lambda { params, body } => {
                self.make_function("<lambda>", params, FunctionBody::Lambda(body.clone()), frame)
            }
            Expr::Starred(_) => Err(type_error("can't use starred expression here")),
        }
    }

    fn eval_items(&mut self, items: &[Expr], frame: &Frame) -> Exec<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Expr::Starred(inner) => {
                    let value = self.eval(inner, frame)?;
                    out.extend(self.collect_value(&value)?);
                }
                other => out.push(self.eval(other, frame)?),
            }
        }
        Ok(out)
    }

    fn generate(
        &mut self,
        generators: &[Comprehension],
        frame: &mut Frame,
        emit: &mut dyn FnMut(&mut Self, &Frame) -> Exec<()>,
    ) -> Exec<()> {
        let Some((generator, rest)) = generators.split_first() else {
            return emit(self, frame);
        };
        let iterable = self.eval(&generator.iter, frame)?;
        'items: for item in iterable.iter()? {
            self.tick()?;
            self.assign(&generator.target, item, frame)?;
            for condition in &generator.conditions {
                if !self.eval(condition, frame)?.truthy() {
                    continue 'items;
                }
            }
            self.generate(rest, frame, emit)?;
        }
        Ok(())
    }

    fn slice_bounds(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
        frame: &Frame,
    ) -> Exec<(Option<i64>, Option<i64>, Option<i64>)> {
        let bound = |this: &mut Self, expr: &Option<Box<Expr>>| -> Exec<Option<i64>> {
            let Some(expr) = expr else { return Ok(None) };
            match this.eval(expr, frame)? {
                Value::None => Ok(None),
                value => value
                    .as_index()
                    .map(Some)
                    .ok_or_else(|| type_error("slice indices must be integers or None")),
            }
        };
        Ok((bound(self, lower)?, bound(self, upper)?, bound(self, step)?))
    }

    fn eval_arguments(
        &mut self,
        args: &[CallArg],
        frame: &Frame,
    ) -> Exec<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::with_capacity(args.len());
        let mut keywords = Vec::new();
        for arg in args {
            match arg {
                CallArg::Positional(expr) => positional.push(self.eval(expr, frame)?),
                CallArg::Star(expr) => {
                    let value = self.eval(expr, frame)?;
                    positional.extend(self.collect_value(&value)?);
                }
                CallArg::Keyword(name, expr) => keywords.push((name.clone(), self.eval(expr, frame)?)),
                CallArg::DoubleStar(expr) => match self.eval(expr, frame)? {
                    Value::Dict(map) => {
                        for (key, value) in map.borrow().iter() {
                            let Key::Str(name) = key else {
                                return Err(type_error("keywords must be strings"));
                            };
                            keywords.push((name.to_string(), value.clone()));
                        }
                    }
                    other => {
                        return Err(type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            other.type_name()
                        )))
                    }
                },
            }
        }
        Ok((positional, keywords))
    }

    // ---- calls ----

    pub(super) fn call(&mut self, callee: &Value, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Exec<Value> {
        match callee {
            Value::Function(function) => self.call_function(&function.clone(), args, kwargs),
            Value::Builtin(name) => self.call_builtin(name, args, kwargs),
            Value::Type(kind) => self.construct(*kind, args, kwargs),
            Value::Native(native) => self.call_native(*native, args, kwargs),
            Value::Method(method) => {
                let method = method.clone();
                self.call_method(&method.receiver, &method.name, args, kwargs)
            }
            other => Err(type_error(format!("'{}' object is not callable", other.type_name()))),
        }
    }

    fn call_function(&mut self, function: &Rc<Function>, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Exec<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Exception::new(
                ExcKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        let vars = bind_arguments(function, args, kwargs)?;
        let mut frame = Frame::local(Scope::new(vars, function.closure.clone()));

        self.depth += 1;
        let result = match &function.body {
            FunctionBody::Block(body) => self.exec_block(body, &mut frame).map(|flow| match flow {
                Flow::Return(value) => value,
                _ => Value::None,
            }),
            FunctionBody::Lambda(body) => self.eval(body, &frame),
        };
        self.depth -= 1;
        result
    }

    pub(super) fn get_attr(&mut self, object: &Value, attr: &str) -> Exec<Value> {
        if attr.starts_with('_') {
            return Err(no_attribute(object, attr));
        }
        if let Some(value) = self.native_attr(object, attr)? {
            return Ok(value);
        }
        if super::builtins::has_method(object, attr) {
            return Ok(Value::Method(Rc::new(super::value::BoundMethod {
                receiver: object.clone(),
                name: attr.to_string(),
            })));
        }
        Err(no_attribute(object, attr))
    }
}

pub(super) fn no_attribute(object: &Value, attr: &str) -> Exception {
    let message = match object {
        Value::Module(module) => format!("module '{}' has no attribute '{}'", module.name, attr),
        Value::Type(kind) => format!("type object '{}' has no attribute '{}'", kind.name(), attr),
        other => format!("'{}' object has no attribute '{}'", other.type_name(), attr),
    };
    Exception::new(ExcKind::AttributeError, message)
}

/// JSON form of a value, falling back to its `str()` text.
pub fn export(value: &Value) -> Json {
    value.to_json().unwrap_or_else(|| Json::String(value.to_str()))
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Exec<bool> {
    use std::cmp::Ordering as Cmp;
    Ok(match op {
        CmpOp::Eq => left.equals(right),
        CmpOp::NotEq => !left.equals(right),
        CmpOp::In => ops::contains(right, left)?,
        CmpOp::NotIn => !ops::contains(right, left)?,
        CmpOp::Is => left.is(right),
        CmpOp::IsNot => !left.is(right),
        CmpOp::Lt => left.compare(right, op.symbol())? == Some(Cmp::Less),
        CmpOp::LtE => matches!(left.compare(right, op.symbol())?, Some(Cmp::Less | Cmp::Equal)),
        CmpOp::Gt => left.compare(right, op.symbol())? == Some(Cmp::Greater),
        CmpOp::GtE => matches!(left.compare(right, op.symbol())?, Some(Cmp::Greater | Cmp::Equal)),
    })
}

fn exception_matches(err: &Exception, kind: &Value) -> Exec<bool> {
    match kind {
        Value::Type(TypeKind::Exc(kind)) => Ok(err.kind.is_a(*kind)),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if exception_matches(err, kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

fn join_names(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{}'", n)).collect();
    match quoted.as_slice() {
        [one] => one.clone(),
        [first, second] => format!("{} and {}", first, second),
        [init @ .., last] => format!("{}, and {}", init.join(", "), last),
        [] => String::new(),
    }
}

fn bind_arguments(
    function: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Exec<HashMap<String, Value>> {
    let params = &function.params;
    let name = &function.name;
    let mut vars = HashMap::new();

    let positional_count = params.positional.len();
    let given = args.len();
    let mut extra = Vec::new();
    for (i, arg) in args.into_iter().enumerate() {
        match params.positional.get(i) {
            Some(param) => {
                vars.insert(param.name.clone(), arg);
            }
            None => extra.push(arg),
        }
    }
    match &params.varargs {
        Some(varargs) => {
            vars.insert(varargs.clone(), Value::tuple(extra));
        }
        None if !extra.is_empty() => {
            let plural = if positional_count == 1 { "" } else { "s" };
            return Err(type_error(format!(
                "{}() takes {} positional argument{} but {} were given",
                name, positional_count, plural, given
            )));
        }
        None => {}
    }

    let mut extra_keywords = DictMap::new();
    for (keyword, value) in kwargs {
        let known = params
            .positional
            .iter()
            .chain(params.keyword_only.iter())
            .any(|p| p.name == keyword);
        if known {
            if vars.contains_key(&keyword) {
                return Err(type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    name, keyword
                )));
            }
            vars.insert(keyword, value);
        } else if params.varkw.is_some() {
            extra_keywords.insert(Key::Str(Rc::from(keyword.as_str())), value);
        } else {
            return Err(type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, keyword
            )));
        }
    }
    if let Some(varkw) = &params.varkw {
        vars.insert(varkw.clone(), Value::dict(extra_keywords));
    }

    for (group, defaults, label) in [
        (&params.positional, &function.defaults, "positional"),
        (&params.keyword_only, &function.kw_defaults, "keyword-only"),
    ] {
        let mut missing = Vec::new();
        for (param, default) in group.iter().zip(defaults) {
            if vars.contains_key(&param.name) {
                continue;
            }
            match default {
                Some(value) => {
                    vars.insert(param.name.clone(), value.clone());
                }
                None => missing.push(param.name.as_str()),
            }
        }
        if !missing.is_empty() {
            let plural = if missing.len() == 1 { "" } else { "s" };
            return Err(type_error(format!(
                "{}() missing {} required {} argument{}: {}",
                name,
                missing.len(),
                label,
                plural,
                join_names(&missing)
            )));
        }
    }
    Ok(vars)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::sandbox::parser::parse;

    pub(crate) struct Outcome {
        pub output: String,
        pub result: Exec<Option<Json>>,
        pub variables: BTreeMap<String, Json>,
    }

    /// Runs `source` on a thread with a large stack, as the executor does.
    pub(crate) fn run(source: &str) -> Outcome {
        let source = source.to_string();
        std::thread::Builder::new()
            .stack_size(256 * 1024 * 1024)
            .spawn(move || {
                let program = parse(&source).unwrap();
                let allowed = ["math", "json", "random", "re", "datetime", "os"]
                    .iter()
                    .map(|m| m.to_string())
                    .collect();
                let mut interp = Interpreter::new(allowed, Arc::new(AtomicBool::new(false)));
                let result = interp.run(&program).map(|v| v.map(|v| export(&v)));
                Outcome {
                    output: interp.output().to_string(),
                    result,
                    variables: interp.variables(),
                }
            })
            .unwrap()
            .join()
            .unwrap()
    }

    fn output(source: &str) -> String {
        let outcome = run(source);
        if let Err(err) = &outcome.result {
            panic!("{} failed: {}", source, err);
        }
        outcome.output
    }

    fn error(source: &str) -> Exception {
        run(source).result.unwrap_err()
    }

    #[test]
    fn test_assignment_and_print() {
        let outcome = run("x = 10\ny = 20\nresult = x + y\nprint(f\"Result: {result}\")\n");
        assert_eq!(outcome.output, "Result: 30\n");
        assert_eq!(outcome.variables["result"], serde_json::json!(30));
    }

    #[test]
    fn test_recursion_and_closures() {
        let out = output(
            "def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\n\ndef counter():\n    count = 0\n    def bump():\n        nonlocal count\n        count += 1\n        return count\n    return bump\n\nc = counter()\nc()\nprint(fib(15), c())\n",
        );
        assert_eq!(out, "610 2\n");
    }

    #[test]
    fn test_loops_with_else_and_unpacking() {
        let out = output(
            "pairs = [(1, 'a'), (2, 'b')]\nfor n, s in pairs:\n    if n == 3:\n        break\nelse:\n    print('done')\nfirst, *rest = [1, 2, 3]\nprint(first, rest)\nwhile False:\n    pass\nelse:\n    print('while else')\n",
        );
        assert_eq!(out, "done\n1 [2, 3]\nwhile else\n");
    }

    #[test]
    fn test_comprehensions_do_not_leak() {
        let outcome = run("squares = [i * i for i in range(5) if i % 2 == 0]\ninv = {v: k for k, v in {'a': 1}.items()}\n");
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.variables["squares"], serde_json::json!([0, 4, 16]));
        assert_eq!(outcome.variables["inv"], serde_json::json!({"1": "a"}));
        assert!(!outcome.variables.contains_key("i"));
    }

    #[test]
    fn test_try_except_finally() {
        let out = output(
            "try:\n    1 / 0\nexcept (KeyError, ZeroDivisionError) as e:\n    print('caught', e)\nfinally:\n    print('cleanup')\n\ndef f():\n    try:\n        return 1\n    finally:\n        print('finally runs')\n\nprint(f())\ntry:\n    raise ValueError('bad')\nexcept Exception as e:\n    print(repr(e))\n",
        );
        assert_eq!(out, "caught division by zero\ncleanup\nfinally runs\n1\nValueError('bad')\n");
    }

    #[test]
    fn test_uncaught_error_keeps_partial_output_and_line() {
        let outcome = run("print('before')\nx = [1, 2]\nx[5]\n");
        assert_eq!(outcome.output, "before\n");
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind, ExcKind::IndexError);
        assert_eq!(err.line, Some(3));
    }

    #[test]
    fn test_recursion_limit() {
        let err = error("def f(n):\n    return f(n + 1)\nf(0)\n");
        assert_eq!(err.kind, ExcKind::RecursionError);
    }

    #[test]
    fn test_final_expression_is_returned() {
        let outcome = run("x = 6\nx * 7\n");
        assert_eq!(outcome.result.unwrap(), Some(serde_json::json!(42)));
        assert!(run("x = 1").result.unwrap().is_none());
    }

    #[test]
    fn test_name_errors_and_argument_checks() {
        assert_eq!(error("print(missing)").message, "name 'missing' is not defined");
        let err = error("def f(a, b=2, *, c):\n    pass\nf()\n");
        assert_eq!(err.message, "f() missing 1 required positional argument: 'a'");
        let err = error("def f(a):\n    pass\nf(1, 2)\n");
        assert_eq!(err.message, "f() takes 1 positional argument but 2 were given");
        let err = error("def f(a):\n    pass\nf(b=1)\n");
        assert_eq!(err.message, "f() got an unexpected keyword argument 'b'");
    }

    #[test]
    fn test_functions_are_not_variables() {
        let outcome = run("import math\ndef f():\n    pass\n_hidden = 1\ng = lambda x: x\nvalue = math.pi\n");
        assert_eq!(outcome.variables.keys().collect::<Vec<_>>(), vec!["value"]);
    }

    #[test]
    fn test_cancelled_run_stops() {
        let cancel = Arc::new(AtomicBool::new(true));
        let program = parse("while True:\n    pass\n").unwrap();
        let mut interp = Interpreter::new(Vec::new(), cancel);
        let err = interp.run(&program).unwrap_err();
        assert_eq!(err.kind, ExcKind::Cancelled);
    }

    #[test]
    fn test_seeded_variables() {
        let source = "y = x * 2".to_string();
        let variables = std::thread::spawn(move || {
            let mut interp = Interpreter::new(Vec::new(), Arc::new(AtomicBool::new(false)));
            interp.seed(&BTreeMap::from([("x".to_string(), SessionValue::Int(42))]));
            interp.run(&parse(&source).unwrap()).unwrap();
            interp.variables()
        })
        .join()
        .unwrap();
        assert_eq!(variables["y"], serde_json::json!(84));
        assert_eq!(variables["x"], serde_json::json!(42));
    }

    #[test]
    fn test_session_values_keep_their_types() {
        let first = "d = {1: 'a', (2, 3): [4.5]}\ns = {1, 2}\nt = (1, 2)\nbig = 2 ** 70\nimport re\nm = re.match('a', 'a')\n";
        let second = "print(d[1], d[(2, 3)], type(t).__name__, 2 in s, big + 1)";
        let output = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(move || {
                let allowed = vec!["re".to_string()];
                let mut interp = Interpreter::new(allowed.clone(), Arc::new(AtomicBool::new(false)));
                interp.run(&parse(first).unwrap()).unwrap();
                let session = interp.session_values();
                assert!(!session.contains_key("m"));
                assert!(!session.contains_key("re"));

                let mut interp = Interpreter::new(allowed, Arc::new(AtomicBool::new(false)));
                interp.seed(&session);
                interp.run(&parse(second).unwrap()).unwrap();
                interp.output().to_string()
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(output, "a [4.5] tuple True 1180591620717411303425\n");
    }

    #[test]
    fn test_builtin_names_are_not_variables() {
        let outcome = run("len = 5\nprint = 3\nsum = 1\nValueError = 2\nmath = 2\nset = 0\nx = 1\n");
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.variables.keys().collect::<Vec<_>>(), vec!["x"]);

        let seeded = std::thread::spawn(|| {
            let mut interp = Interpreter::new(Vec::new(), Arc::new(AtomicBool::new(false)));
            interp.seed(&BTreeMap::from([("print".to_string(), SessionValue::Int(3))]));
            interp.run(&parse("print('hi')").unwrap()).map(|_| interp.output().to_string())
        })
        .join()
        .unwrap();
        assert_eq!(seeded.unwrap(), "hi\n");
    }

    #[test]
    fn test_deep_recursion_within_limit() {
        let out = output("def depth(n):\n    return 0 if n == 0 else 1 + depth(n - 1)\nprint(depth(900))\n");
        assert_eq!(out, "900\n");
    }
}
