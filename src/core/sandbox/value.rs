//! Runtime values of the sandbox interpreter.
//!
//! Values are reference counted with `Rc` and never leave the worker thread
//! that runs a snippet; anything handed back to the caller goes through
//! [`Value::to_json`] or, for persistent sessions, [`Value::to_session`].

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use regex::Regex;
use serde_json::Value as Json;

use super::ast::{Expr, Params, Stmt};
use super::format::float_repr;
use super::interp::Scope;

/// Nesting beyond this is rendered as `...` and has no JSON form.
const MAX_RENDER_DEPTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    KeyError,
    IndexError,
    ValueError,
    TypeError,
    NameError,
    AttributeError,
    ImportError,
    ModuleNotFoundError,
    RuntimeError,
    RecursionError,
    NotImplementedError,
    AssertionError,
    StopIteration,
    MemoryError,
    /// Raised when the caller gives up on a run; user code cannot catch it.
    Cancelled,
}

impl ExcKind {
    pub const CATCHABLE: &'static [ExcKind] = &[
        ExcKind::Exception,
        ExcKind::ArithmeticError,
        ExcKind::ZeroDivisionError,
        ExcKind::OverflowError,
        ExcKind::LookupError,
        ExcKind::KeyError,
        ExcKind::IndexError,
        ExcKind::ValueError,
        ExcKind::TypeError,
        ExcKind::NameError,
        ExcKind::AttributeError,
        ExcKind::ImportError,
        ExcKind::ModuleNotFoundError,
        ExcKind::RuntimeError,
        ExcKind::RecursionError,
        ExcKind::NotImplementedError,
        ExcKind::AssertionError,
        ExcKind::StopIteration,
        ExcKind::MemoryError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExcKind::Exception => "Exception",
            ExcKind::ArithmeticError => "ArithmeticError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::LookupError => "LookupError",
            ExcKind::KeyError => "KeyError",
            ExcKind::IndexError => "IndexError",
            ExcKind::ValueError => "ValueError",
            ExcKind::TypeError => "TypeError",
            ExcKind::NameError => "NameError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::ImportError => "ImportError",
            ExcKind::ModuleNotFoundError => "ModuleNotFoundError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::RecursionError => "RecursionError",
            ExcKind::NotImplementedError => "NotImplementedError",
            ExcKind::AssertionError => "AssertionError",
            ExcKind::StopIteration => "StopIteration",
            ExcKind::MemoryError => "MemoryError",
            ExcKind::Cancelled => "Cancelled",
        }
    }

    fn parent(&self) -> Option<ExcKind> {
        match self {
            ExcKind::Exception | ExcKind::Cancelled => None,
            ExcKind::ZeroDivisionError | ExcKind::OverflowError => Some(ExcKind::ArithmeticError),
            ExcKind::KeyError | ExcKind::IndexError => Some(ExcKind::LookupError),
            ExcKind::ModuleNotFoundError => Some(ExcKind::ImportError),
            ExcKind::RecursionError | ExcKind::NotImplementedError => Some(ExcKind::RuntimeError),
            _ => Some(ExcKind::Exception),
        }
    }

    /// Whether an `except <other>` clause catches this kind.
    pub fn is_a(&self, other: ExcKind) -> bool {
        let mut current = Some(*self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

/// A raised exception, also usable as a value (`except E as e`).
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub kind: ExcKind,
    pub message: String,
    /// Source line where it was raised, filled in as it propagates.
    pub line: Option<usize>,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

pub fn type_error(message: impl Into<String>) -> Exception {
    Exception::new(ExcKind::TypeError, message)
}

pub fn value_error(message: impl Into<String>) -> Exception {
    Exception::new(ExcKind::ValueError, message)
}

pub fn overflow() -> Exception {
    Exception::new(ExcKind::OverflowError, "integer overflow")
}

/// Hashable form of a value used as a dict key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    BigInt(Rc<BigInt>),
    Float(u64),
    Str(Rc<str>),
    Tuple(Rc<Vec<Key>>),
}

impl Key {
    pub fn from_value(value: &Value) -> Result<Key, Exception> {
        Ok(match value {
            Value::None => Key::None,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::BigInt(big) => Key::BigInt(big.clone()),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.0e15 {
                    Key::Int(*f as i64)
                } else {
                    Key::Float(if *f == 0.0 { 0.0f64.to_bits() } else { f.to_bits() })
                }
            }
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(Rc::new(
                items.iter().map(Key::from_value).collect::<Result<_, _>>()?,
            )),
            other => return Err(type_error(format!("unhashable type: '{}'", other.type_name()))),
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::BigInt(big) => Value::BigInt(big.clone()),
            Key::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Key::Str(s) => Value::Str(s.clone()),
            Key::Tuple(items) => Value::Tuple(Rc::new(items.iter().map(Key::to_value).collect())),
        }
    }
}

pub type DictMap = IndexMap<Key, Value>;
pub type SetItems = IndexSet<Key>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let len = if step > 0 && start < stop {
            (stop - start - 1) / step + 1
        } else if step < 0 && start > stop {
            (start - stop - 1) / (-step) + 1
        } else {
            0
        };
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        i64::try_from(self.start as i128 + index as i128 * self.step as i128).ok()
    }
}

/// `slice(start, stop, step)` with integer or absent bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

#[derive(Debug)]
pub enum FunctionBody {
    Block(Arc<Vec<Stmt>>),
    Lambda(Arc<Expr>),
}

pub struct Function {
    pub name: String,
    pub params: Arc<Params>,
    pub body: FunctionBody,
    /// Evaluated defaults, aligned with `params.positional`.
    pub defaults: Vec<Option<Value>>,
    /// Evaluated defaults, aligned with `params.keyword_only`.
    pub kw_defaults: Vec<Option<Value>>,
    pub closure: Option<Rc<Scope>>,
}

pub struct Module {
    pub name: String,
    pub attrs: IndexMap<String, Value>,
}

/// A function exported by one of the native modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFn {
    pub module: &'static str,
    pub name: &'static str,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

pub struct MatchData {
    pub text: Rc<str>,
    /// Byte spans per group, group 0 first.
    pub groups: Vec<Option<(usize, usize)>>,
    pub names: Vec<Option<String>>,
}

impl MatchData {
    pub fn char_index(&self, byte: usize) -> i64 {
        self.text[..byte].chars().count() as i64
    }

    pub fn group_text(&self, index: usize) -> Option<&str> {
        self.groups
            .get(index)
            .copied()
            .flatten()
            .map(|(start, end)| &self.text[start..end])
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n.as_deref() == Some(name))
    }
}

pub struct PatternData {
    pub source: String,
    pub flags: i64,
    pub regex: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Set,
    FrozenSet,
    Range,
    Slice,
    Iterator,
    Function,
    Builtin,
    Type,
    Module,
    Method,
    DateTime,
    Date,
    TimeDelta,
    Match,
    Pattern,
    Exc(ExcKind),
}

impl TypeKind {
    pub fn name(&self) -> &'static str {
        match self {
            TypeKind::NoneType => "NoneType",
            TypeKind::Bool => "bool",
            TypeKind::Int => "int",
            TypeKind::Float => "float",
            TypeKind::Str => "str",
            TypeKind::List => "list",
            TypeKind::Tuple => "tuple",
            TypeKind::Dict => "dict",
            TypeKind::Set => "set",
            TypeKind::FrozenSet => "frozenset",
            TypeKind::Range => "range",
            TypeKind::Slice => "slice",
            TypeKind::Iterator => "iterator",
            TypeKind::Function => "function",
            TypeKind::Builtin => "builtin_function_or_method",
            TypeKind::Type => "type",
            TypeKind::Module => "module",
            TypeKind::Method => "method",
            TypeKind::DateTime => "datetime",
            TypeKind::Date => "date",
            TypeKind::TimeDelta => "timedelta",
            TypeKind::Match => "Match",
            TypeKind::Pattern => "Pattern",
            TypeKind::Exc(kind) => kind.name(),
        }
    }

    /// `isinstance` relation between a value's own type and `other`.
    pub fn is_a(&self, other: TypeKind) -> bool {
        match (self, other) {
            (TypeKind::Bool, TypeKind::Int) => true,
            (TypeKind::DateTime, TypeKind::Date) => true,
            (TypeKind::Exc(kind), TypeKind::Exc(parent)) => kind.is_a(parent),
            (a, b) => *a == b,
        }
    }
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Integers outside the `i64` range. Never holds a value that fits `Int`.
    BigInt(Rc<BigInt>),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<DictMap>>),
    Set(Rc<RefCell<SetItems>>),
    FrozenSet(Rc<SetItems>),
    Range(Range),
    Slice(Slice),
    Iterator(Rc<RefCell<ValueIter>>),
    Function(Rc<Function>),
    Builtin(&'static str),
    Native(NativeFn),
    Method(Rc<BoundMethod>),
    Type(TypeKind),
    Module(Rc<Module>),
    Exception(Rc<Exception>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    TimeDelta(Duration),
    Match(Rc<MatchData>),
    Pattern(Rc<PatternData>),
}

/// Numeric view used by arithmetic and comparisons.
#[derive(Debug, Clone, Copy)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// Iteration over a value: a snapshot of its items, a lazy range, or an
/// iterator object that several loops may consume in turn.
pub enum ValueIter {
    Items(std::vec::IntoIter<Value>),
    Range { next: i64, remaining: usize, step: i64 },
    Shared(Rc<RefCell<ValueIter>>),
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Items(items) => items.next(),
            ValueIter::Range { next, remaining, step } => {
                if *remaining == 0 {
                    return None;
                }
                let current = *next;
                *remaining -= 1;
                *next = next.wrapping_add(*step);
                Some(Value::Int(current))
            }
            ValueIter::Shared(inner) => inner.borrow_mut().next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            ValueIter::Items(items) => items.size_hint(),
            ValueIter::Range { remaining, .. } => (*remaining, Some(*remaining)),
            ValueIter::Shared(inner) => inner.borrow().size_hint(),
        }
    }
}

impl Value {
    pub fn str(text: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(text.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(map: DictMap) -> Value {
        Value::Dict(Rc::new(RefCell::new(map)))
    }

    pub fn set(items: SetItems) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    /// Integer value, kept as `Int` whenever it fits.
    pub fn from_bigint(big: BigInt) -> Value {
        match big.to_i64() {
            Some(i) => Value::Int(i),
            None => Value::BigInt(Rc::new(big)),
        }
    }

    /// Arbitrary-precision view of an integer (bools included).
    pub fn as_bigint(&self) -> Option<BigInt> {
        match self {
            Value::Bool(b) => Some(BigInt::from(*b as i64)),
            Value::Int(i) => Some(BigInt::from(*i)),
            Value::BigInt(big) => Some(big.as_ref().clone()),
            _ => None,
        }
    }

    /// Float view of any number, big integers included.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::BigInt(big) => Some(big.to_f64().unwrap_or(f64::INFINITY)),
            other => other.as_num().map(Num::as_f64),
        }
    }

    /// Runs `f` over the members of a set or frozenset.
    pub fn with_set<R>(&self, f: impl FnOnce(&SetItems) -> R) -> Option<R> {
        match self {
            Value::Set(items) => Some(f(&items.borrow())),
            Value::FrozenSet(items) => Some(f(items)),
            _ => None,
        }
    }

    pub fn type_kind(&self) -> TypeKind {
        match self {
            Value::None => TypeKind::NoneType,
            Value::Bool(_) => TypeKind::Bool,
            Value::Int(_) | Value::BigInt(_) => TypeKind::Int,
            Value::Float(_) => TypeKind::Float,
            Value::Str(_) => TypeKind::Str,
            Value::List(_) => TypeKind::List,
            Value::Tuple(_) => TypeKind::Tuple,
            Value::Dict(_) => TypeKind::Dict,
            Value::Set(_) => TypeKind::Set,
            Value::FrozenSet(_) => TypeKind::FrozenSet,
            Value::Range(_) => TypeKind::Range,
            Value::Slice(_) => TypeKind::Slice,
            Value::Iterator(_) => TypeKind::Iterator,
            Value::Function(_) => TypeKind::Function,
            Value::Builtin(_) | Value::Native(_) => TypeKind::Builtin,
            Value::Method(_) => TypeKind::Method,
            Value::Type(_) => TypeKind::Type,
            Value::Module(_) => TypeKind::Module,
            Value::Exception(exc) => TypeKind::Exc(exc.kind),
            Value::DateTime(_) => TypeKind::DateTime,
            Value::Date(_) => TypeKind::Date,
            Value::TimeDelta(_) => TypeKind::TimeDelta,
            Value::Match(_) => TypeKind::Match,
            Value::Pattern(_) => TypeKind::Pattern,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_kind().name()
    }

    /// Functions, modules and other callables are never reported back as
    /// variables.
    pub fn is_code_object(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Builtin(_)
                | Value::Native(_)
                | Value::Method(_)
                | Value::Type(_)
                | Value::Module(_)
        )
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(map) => !map.borrow().is_empty(),
            Value::Set(items) => !items.borrow().is_empty(),
            Value::FrozenSet(items) => !items.is_empty(),
            Value::Range(range) => !range.is_empty(),
            Value::TimeDelta(delta) => *delta != Duration::zero(),
            _ => true,
        }
    }

    pub fn as_num(&self) -> Option<Num> {
        match self {
            Value::Bool(b) => Some(Num::Int(*b as i64)),
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    /// Integer view accepting bools, as `range`, indexing and friends do.
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn expect_int(&self, what: &str) -> Result<i64, Exception> {
        if let Value::BigInt(_) = self {
            return Err(Exception::new(
                ExcKind::OverflowError,
                "Python int too large to convert to C ssize_t",
            ));
        }
        self.as_index().ok_or_else(|| {
            type_error(format!(
                "{} must be an integer, not '{}'",
                what,
                self.type_name()
            ))
        })
    }

    pub fn expect_float(&self, what: &str) -> Result<f64, Exception> {
        if let Value::BigInt(big) = self {
            return big
                .to_f64()
                .filter(|f| f.is_finite())
                .ok_or_else(|| Exception::new(ExcKind::OverflowError, "int too large to convert to float"));
        }
        self.as_num()
            .map(Num::as_f64)
            .ok_or_else(|| type_error(format!("{} must be a real number, not '{}'", what, self.type_name())))
    }

    pub fn expect_str(&self, what: &str) -> Result<Rc<str>, Exception> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            other => Err(type_error(format!("{} must be str, not {}", what, other.type_name()))),
        }
    }

    pub fn len(&self) -> Option<usize> {
        Some(match self {
            Value::Str(s) => s.chars().count(),
            Value::List(items) => items.borrow().len(),
            Value::Tuple(items) => items.len(),
            Value::Dict(map) => map.borrow().len(),
            Value::Set(items) => items.borrow().len(),
            Value::FrozenSet(items) => items.len(),
            Value::Range(range) => range.len(),
            _ => return None,
        })
    }

    pub fn iter(&self) -> Result<ValueIter, Exception> {
        let items = match self {
            Value::Range(range) => {
                return Ok(ValueIter::Range {
                    next: range.start,
                    remaining: range.len(),
                    step: range.step,
                })
            }
            Value::List(items) => items.borrow().clone(),
            Value::Tuple(items) => items.as_ref().clone(),
            Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            Value::Dict(map) => map.borrow().keys().map(Key::to_value).collect(),
            Value::Set(_) | Value::FrozenSet(_) => self
                .with_set(|items| items.iter().map(Key::to_value).collect())
                .unwrap_or_default(),
            Value::Iterator(inner) => return Ok(ValueIter::Shared(inner.clone())),
            other => {
                return Err(type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        };
        Ok(ValueIter::Items(items.into_iter()))
    }

    pub fn equals(&self, other: &Value) -> bool {
        self.equals_at(other, 0)
    }

    fn equals_at(&self, other: &Value, depth: usize) -> bool {
        if depth > MAX_RENDER_DEPTH {
            return false;
        }
        if let Some(order) = big_order(self, other) {
            return order == Some(Ordering::Equal);
        }
        if let Some(order) = set_order(self, other) {
            return order == Some(Ordering::Equal);
        }
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return match (a, b) {
                (Num::Int(a), Num::Int(b)) => a == b,
                (a, b) => a.as_f64() == b.as_f64(),
            };
        }
        let seq_eq = |a: &[Value], b: &[Value]| {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals_at(y, depth + 1))
        };
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow()),
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.get(key).map_or(false, |other| value.equals_at(other, depth + 1))
                    })
            }
            (Value::Slice(a), Value::Slice(b)) => a == b,
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => {
                a.len() == b.len() && (a.is_empty() || (a.start == b.start && (a.len() == 1 || a.step == b.step)))
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::TimeDelta(a), Value::TimeDelta(b)) => a == b,
            (Value::Match(a), Value::Match(b)) => Rc::ptr_eq(a, b),
            (Value::Pattern(a), Value::Pattern(b)) => a.source == b.source && a.flags == b.flags,
            _ => false,
        }
    }

    /// Identity as seen by `is`.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || (a.len() <= 1 && a == b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::FrozenSet(a), Value::FrozenSet(b)) => Rc::ptr_eq(a, b),
            (Value::BigInt(a), Value::BigInt(b)) => Rc::ptr_eq(a, b),
            (Value::Float(_), Value::Float(_))
            | (Value::Range(_), Value::Range(_))
            | (Value::BigInt(_), _)
            | (Value::Set(_) | Value::FrozenSet(_), _) => false,
            (a, b) => !matches!(a, Value::Int(_) | Value::Bool(_)) && a.equals(b),
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`, `sorted`, `min` and `max`.
    /// `Ok(None)` means the operands are unordered (a NaN is involved).
    pub fn compare(&self, other: &Value, op: &str) -> Result<Option<Ordering>, Exception> {
        if let Some(order) = big_order(self, other) {
            return Ok(order);
        }
        if let Some(order) = set_order(self, other) {
            return Ok(order);
        }
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return Ok(match (a, b) {
                (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
                (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
            });
        }
        let sequences = |a: &[Value], b: &[Value]| -> Result<Option<Ordering>, Exception> {
            for (x, y) in a.iter().zip(b) {
                if !x.equals(y) {
                    return x.compare(y, op);
                }
            }
            Ok(Some(a.len().cmp(&b.len())))
        };
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => sequences(&a.borrow(), &b.borrow()),
            (Value::Tuple(a), Value::Tuple(b)) => sequences(a, b),
            (Value::DateTime(a), Value::DateTime(b)) => Ok(Some(a.cmp(b))),
            (Value::Date(a), Value::Date(b)) => Ok(Some(a.cmp(b))),
            (Value::TimeDelta(a), Value::TimeDelta(b)) => Ok(Some(a.cmp(b))),
            _ => Err(type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op,
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    pub fn repr(&self) -> String {
        self.render(true, &mut Vec::new())
    }

    /// `str()` of the value.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.render(false, &mut Vec::new()),
        }
    }

    fn render(&self, repr: bool, stack: &mut Vec<usize>) -> String {
        if stack.len() > MAX_RENDER_DEPTH {
            return "...".to_string();
        }
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(big) => big.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) if repr => str_repr(s),
            Value::Str(s) => s.to_string(),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const () as usize;
                if stack.contains(&id) {
                    return "[...]".to_string();
                }
                stack.push(id);
                let inner = render_items(&items.borrow(), stack);
                stack.pop();
                format!("[{}]", inner)
            }
            Value::Tuple(items) => {
                let inner = render_items(items, stack);
                if items.len() == 1 {
                    format!("({},)", inner)
                } else {
                    format!("({})", inner)
                }
            }
            Value::Dict(map) => {
                let id = Rc::as_ptr(map) as *const () as usize;
                if stack.contains(&id) {
                    return "{...}".to_string();
                }
                stack.push(id);
                let inner = map
                    .borrow()
                    .iter()
                    .map(|(key, value)| {
                        format!("{}: {}", key.to_value().render(true, stack), value.render(true, stack))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                stack.pop();
                format!("{{{}}}", inner)
            }
            Value::Set(_) | Value::FrozenSet(_) => {
                let inner = self
                    .with_set(|items| {
                        items
                            .iter()
                            .map(|key| key.to_value().render(true, stack))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                match (self, inner.is_empty()) {
                    (Value::Set(_), true) => "set()".to_string(),
                    (Value::Set(_), false) => format!("{{{}}}", inner),
                    (_, true) => "frozenset()".to_string(),
                    (_, false) => format!("frozenset({{{}}})", inner),
                }
            }
            Value::Slice(slice) => {
                let bound = |b: Option<i64>| b.map_or_else(|| "None".to_string(), |i| i.to_string());
                format!("slice({}, {}, {})", bound(slice.start), bound(slice.stop), bound(slice.step))
            }
            Value::Iterator(_) => "<iterator object>".to_string(),
            Value::Range(range) if range.step == 1 => format!("range({}, {})", range.start, range.stop),
            Value::Range(range) => format!("range({}, {}, {})", range.start, range.stop, range.step),
            Value::Function(function) => format!("<function {}>", function.name),
            Value::Builtin(name) => format!("<built-in function {}>", name),
            Value::Native(native) => format!("<built-in function {}>", native.name.rsplit('.').next().unwrap_or(native.name)),
            Value::Method(method) => format!(
                "<built-in method {} of {} object>",
                method.name,
                method.receiver.type_name()
            ),
            Value::Type(TypeKind::DateTime) => "<class 'datetime.datetime'>".to_string(),
            Value::Type(TypeKind::Date) => "<class 'datetime.date'>".to_string(),
            Value::Type(TypeKind::TimeDelta) => "<class 'datetime.timedelta'>".to_string(),
            Value::Type(kind) => format!("<class '{}'>", kind.name()),
            Value::Module(module) => format!("<module '{}'>", module.name),
            Value::Exception(exc) if repr => format!("{}({})", exc.kind.name(), str_repr(&exc.message)),
            Value::Exception(exc) => exc.message.clone(),
            Value::DateTime(dt) if repr => {
                let mut fields = vec![
                    dt.year().to_string(),
                    dt.month().to_string(),
                    dt.day().to_string(),
                    dt.hour().to_string(),
                    dt.minute().to_string(),
                ];
                let micros = dt.nanosecond() / 1000;
                if dt.second() != 0 || micros != 0 {
                    fields.push(dt.second().to_string());
                }
                if micros != 0 {
                    fields.push(micros.to_string());
                }
                format!("datetime.datetime({})", fields.join(", "))
            }
            Value::DateTime(dt) => {
                let micros = dt.nanosecond() / 1000;
                if micros == 0 {
                    dt.format("%Y-%m-%d %H:%M:%S").to_string()
                } else {
                    format!("{}.{:06}", dt.format("%Y-%m-%d %H:%M:%S"), micros)
                }
            }
            Value::Date(date) if repr => {
                format!("datetime.date({}, {}, {})", date.year(), date.month(), date.day())
            }
            Value::Date(date) => date.format("%Y-%m-%d").to_string(),
            Value::TimeDelta(delta) if repr => timedelta_repr(delta),
            Value::TimeDelta(delta) => timedelta_str(delta),
            Value::Match(data) => {
                let (start, end) = data.groups[0].unwrap_or((0, 0));
                format!(
                    "<re.Match object; span=({}, {}), match={}>",
                    data.char_index(start),
                    data.char_index(end),
                    str_repr(&data.text[start..end])
                )
            }
            Value::Pattern(pattern) => format!("re.compile({})", str_repr(&pattern.source)),
        }
    }

    /// JSON form of the value, or `None` when it has none.
    pub fn to_json(&self) -> Option<Json> {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> Option<Json> {
        if depth > MAX_RENDER_DEPTH {
            return None;
        }
        Some(match self {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => Json::Number(serde_json::Number::from_f64(*f)?),
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_at(depth + 1))
                    .collect::<Option<_>>()?,
            ),
            Value::Tuple(items) => {
                Json::Array(items.iter().map(|v| v.to_json_at(depth + 1)).collect::<Option<_>>()?)
            }
            Value::Dict(map) => {
                let mut object = serde_json::Map::new();
                for (key, value) in map.borrow().iter() {
                    let key = match key {
                        Key::Str(s) => s.to_string(),
                        Key::Int(i) => i.to_string(),
                        Key::BigInt(big) => big.to_string(),
                        Key::Bool(true) => "true".to_string(),
                        Key::Bool(false) => "false".to_string(),
                        Key::None => "null".to_string(),
                        Key::Float(bits) => {
                            let f = f64::from_bits(*bits);
                            if !f.is_finite() {
                                return None;
                            }
                            float_repr(f)
                        }
                        Key::Tuple(_) => return None,
                    };
                    object.insert(key, value.to_json_at(depth + 1)?);
                }
                Json::Object(object)
            }
            _ => return None,
        })
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Value::Int(i),
                (None, Some(u)) => Value::from_bigint(BigInt::from(u)),
                (None, None) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::str(s),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(object) => Value::dict(
                object
                    .iter()
                    .map(|(k, v)| (Key::Str(Rc::from(k.as_str())), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Numeric ordering when at least one side is a big integer.
fn big_order(a: &Value, b: &Value) -> Option<Option<Ordering>> {
    if !matches!(a, Value::BigInt(_)) && !matches!(b, Value::BigInt(_)) {
        return None;
    }
    if let (Some(x), Some(y)) = (a.as_bigint(), b.as_bigint()) {
        return Some(Some(x.cmp(&y)));
    }
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    Some(x.partial_cmp(&y))
}

/// Subset ordering between two sets: `Less` for a proper subset, `None`
/// when neither contains the other.
fn set_order(a: &Value, b: &Value) -> Option<Option<Ordering>> {
    a.with_set(|left| {
        b.with_set(|right| {
            let inside = left.iter().all(|key| right.contains(key));
            let covers = right.iter().all(|key| left.contains(key));
            match (inside, covers) {
                (true, true) => Some(Ordering::Equal),
                (true, false) => Some(Ordering::Less),
                (false, true) => Some(Ordering::Greater),
                (false, false) => None,
            }
        })
    })
    .flatten()
}

fn render_items(items: &[Value], stack: &mut Vec<usize>) -> String {
    items
        .iter()
        .map(|item| item.render(true, stack))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Owned copy of a data value. Persistent sessions keep these between runs
/// so the next run sees the same types it left behind: tuples stay tuples
/// and dict keys keep their type.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValue {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
    List(Vec<SessionValue>),
    Tuple(Vec<SessionValue>),
    Dict(Vec<(SessionValue, SessionValue)>),
    Set(Vec<SessionValue>),
    FrozenSet(Vec<SessionValue>),
    Range(Range),
    Slice(Slice),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    TimeDelta(Duration),
}

impl SessionValue {
    pub fn to_value(&self) -> Value {
        let keys = |items: &[SessionValue]| -> SetItems {
            items
                .iter()
                .filter_map(|item| Key::from_value(&item.to_value()).ok())
                .collect()
        };
        match self {
            SessionValue::None => Value::None,
            SessionValue::Bool(b) => Value::Bool(*b),
            SessionValue::Int(i) => Value::Int(*i),
            SessionValue::BigInt(big) => Value::from_bigint(big.clone()),
            SessionValue::Float(f) => Value::Float(*f),
            SessionValue::Str(s) => Value::str(s),
            SessionValue::List(items) => Value::list(items.iter().map(SessionValue::to_value).collect()),
            SessionValue::Tuple(items) => Value::tuple(items.iter().map(SessionValue::to_value).collect()),
            SessionValue::Dict(pairs) => Value::dict(
                pairs
                    .iter()
                    .filter_map(|(key, value)| {
                        Key::from_value(&key.to_value()).ok().map(|key| (key, value.to_value()))
                    })
                    .collect(),
            ),
            SessionValue::Set(items) => Value::set(keys(items)),
            SessionValue::FrozenSet(items) => Value::FrozenSet(Rc::new(keys(items))),
            SessionValue::Range(range) => Value::Range(*range),
            SessionValue::Slice(slice) => Value::Slice(*slice),
            SessionValue::DateTime(dt) => Value::DateTime(*dt),
            SessionValue::Date(date) => Value::Date(*date),
            SessionValue::TimeDelta(delta) => Value::TimeDelta(*delta),
        }
    }
}

impl Value {
    /// Session copy of the value, or `None` for code objects, exceptions,
    /// regex objects, iterators and structures nested too deeply.
    pub fn to_session(&self) -> Option<SessionValue> {
        self.to_session_at(0)
    }

    fn to_session_at(&self, depth: usize) -> Option<SessionValue> {
        if depth > MAX_RENDER_DEPTH {
            return None;
        }
        let many = |items: &[Value]| -> Option<Vec<SessionValue>> {
            items.iter().map(|item| item.to_session_at(depth + 1)).collect()
        };
        let members = |items: &SetItems| -> Option<Vec<SessionValue>> {
            items.iter().map(|key| key.to_value().to_session_at(depth + 1)).collect()
        };
        Some(match self {
            Value::None => SessionValue::None,
            Value::Bool(b) => SessionValue::Bool(*b),
            Value::Int(i) => SessionValue::Int(*i),
            Value::BigInt(big) => SessionValue::BigInt(big.as_ref().clone()),
            Value::Float(f) => SessionValue::Float(*f),
            Value::Str(s) => SessionValue::Str(s.to_string()),
            Value::List(items) => SessionValue::List(many(&items.borrow())?),
            Value::Tuple(items) => SessionValue::Tuple(many(items)?),
            Value::Dict(map) => SessionValue::Dict(
                map.borrow()
                    .iter()
                    .map(|(key, value)| {
                        Some((key.to_value().to_session_at(depth + 1)?, value.to_session_at(depth + 1)?))
                    })
                    .collect::<Option<_>>()?,
            ),
            Value::Set(items) => SessionValue::Set(members(&items.borrow())?),
            Value::FrozenSet(items) => SessionValue::FrozenSet(members(items)?),
            Value::Range(range) => SessionValue::Range(*range),
            Value::Slice(slice) => SessionValue::Slice(*slice),
            Value::DateTime(dt) => SessionValue::DateTime(*dt),
            Value::Date(date) => SessionValue::Date(*date),
            Value::TimeDelta(delta) => SessionValue::TimeDelta(*delta),
            _ => return None,
        })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn split_delta(delta: &Duration) -> (i64, i64, i64) {
    let micros = delta.num_microseconds().unwrap_or(i64::MAX);
    let days = micros.div_euclid(86_400_000_000);
    let rest = micros.rem_euclid(86_400_000_000);
    (days, rest / 1_000_000, rest % 1_000_000)
}

fn timedelta_str(delta: &Duration) -> String {
    let (days, seconds, micros) = split_delta(delta);
    let mut out = String::new();
    if days != 0 {
        let plural = if days.abs() == 1 { "" } else { "s" };
        out.push_str(&format!("{} day{}, ", days, plural));
    }
    out.push_str(&format!("{}:{:02}:{:02}", seconds / 3600, seconds % 3600 / 60, seconds % 60));
    if micros != 0 {
        out.push_str(&format!(".{:06}", micros));
    }
    out
}

fn timedelta_repr(delta: &Duration) -> String {
    let (days, seconds, micros) = split_delta(delta);
    let mut fields = Vec::new();
    if days != 0 {
        fields.push(format!("days={}", days));
    }
    if seconds != 0 {
        fields.push(format!("seconds={}", seconds));
    }
    if micros != 0 {
        fields.push(format!("microseconds={}", micros));
    }
    if fields.is_empty() {
        fields.push("0".to_string());
    }
    format!("datetime.timedelta({})", fields.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr_matches_python() {
        let list = Value::list(vec![
            Value::Int(1),
            Value::Float(2.0),
            Value::str("it's"),
            Value::None,
            Value::tuple(vec![Value::Bool(true)]),
        ]);
        assert_eq!(list.repr(), r#"[1, 2.0, "it's", None, (True,)]"#);
        assert_eq!(list.to_str(), list.repr());
        assert_eq!(Value::str("a\nb").repr(), "'a\\nb'");
        assert_eq!(Value::str("plain").to_str(), "plain");
    }

    #[test]
    fn test_self_referencing_list_renders() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(list.repr(), "[1, [...]]");
        assert!(list.to_json().is_none());
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_numeric_equality_and_keys() {
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(Value::Bool(true).equals(&Value::Int(1)));
        assert_eq!(Key::from_value(&Value::Float(2.0)).unwrap(), Key::Int(2));
        assert!(Key::from_value(&Value::list(vec![])).is_err());
    }

    #[test]
    fn test_compare_rejects_mixed_types() {
        let err = Value::Int(1).compare(&Value::str("a"), "<").unwrap_err();
        assert_eq!(err.message, "'<' not supported between instances of 'int' and 'str'");
        assert_eq!(
            Value::tuple(vec![Value::Int(1), Value::Int(2)])
                .compare(&Value::tuple(vec![Value::Int(1), Value::Int(3)]), "<")
                .unwrap(),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_json_conversion() {
        let mut map = DictMap::new();
        map.insert(Key::Int(1), Value::tuple(vec![Value::Int(1), Value::str("x")]));
        assert_eq!(Value::dict(map).to_json().unwrap(), serde_json::json!({"1": [1, "x"]}));
        assert!(Value::Float(f64::NAN).to_json().is_none());
        assert!(Value::Range(Range { start: 0, stop: 3, step: 1 }).to_json().is_none());

        let back = Value::from_json(&serde_json::json!({"a": [1, 2.5, null]}));
        assert_eq!(back.repr(), "{'a': [1, 2.5, None]}");
    }

    #[test]
    fn test_range_len_and_iteration() {
        let range = Range { start: 10, stop: 0, step: -3 };
        assert_eq!(range.len(), 4);
        let items: Vec<String> = Value::Range(range).iter().unwrap().map(|v| v.repr()).collect();
        assert_eq!(items, vec!["10", "7", "4", "1"]);
    }

    #[test]
    fn test_exception_hierarchy() {
        assert!(ExcKind::ZeroDivisionError.is_a(ExcKind::ArithmeticError));
        assert!(ExcKind::KeyError.is_a(ExcKind::Exception));
        assert!(!ExcKind::KeyError.is_a(ExcKind::IndexError));
        assert!(!ExcKind::Cancelled.is_a(ExcKind::Exception));
    }

    #[test]
    fn test_timedelta_rendering() {
        assert_eq!(Value::TimeDelta(Duration::seconds(93_784)).to_str(), "1 day, 2:03:04");
        assert_eq!(Value::TimeDelta(Duration::seconds(-1)).to_str(), "-1 day, 23:59:59");
    }
}
