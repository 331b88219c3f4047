//! The restricted builtin namespace and the methods of the core types.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, Zero};

use super::ast::BinOp;
use super::format::{format_value, str_format};
use super::interp::{Exec, Interpreter};
use super::ops::{self, MAX_ITEMS, MAX_STR_BYTES};
use super::value::{
    type_error, value_error, DictMap, ExcKind, Exception, Key, Num, Range, SetItems, Slice, TypeKind, Value,
};

/// Callable builtins visible to snippets. Types such as `int` and the
/// exception classes resolve separately in [`builtin_value`].
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs", "all", "any", "bin", "callable", "chr", "divmod", "enumerate", "filter", "format", "help", "hex",
    "input", "isinstance", "issubclass", "iter", "len", "map", "max", "min", "next", "oct", "ord", "pow",
    "print", "repr", "reversed", "round", "sorted", "sum", "zip",
];

/// Longest digit string `int()` converts in a base that is not a power of two.
const MAX_INT_DIGITS: usize = 4300;

const STR_METHODS: &[&str] = &[
    "capitalize", "center", "count", "endswith", "find", "format", "index", "isalnum", "isalpha", "isdigit",
    "islower", "isnumeric", "isspace", "isupper", "join", "ljust", "lower", "lstrip", "partition", "replace",
    "rfind", "rjust", "rsplit", "rstrip", "split", "splitlines", "startswith", "strip", "swapcase", "title",
    "upper", "zfill",
];
const LIST_METHODS: &[&str] = &[
    "append", "clear", "copy", "count", "extend", "index", "insert", "pop", "remove", "reverse", "sort",
];
const DICT_METHODS: &[&str] = &[
    "clear", "copy", "get", "items", "keys", "pop", "popitem", "setdefault", "update", "values",
];
const TUPLE_METHODS: &[&str] = &["count", "index"];
const SET_METHODS: &[&str] = &[
    "add", "clear", "copy", "difference", "difference_update", "discard", "intersection", "intersection_update",
    "isdisjoint", "issubset", "issuperset", "pop", "remove", "symmetric_difference", "symmetric_difference_update",
    "union", "update",
];
const FROZENSET_METHODS: &[&str] = &[
    "copy", "difference", "intersection", "isdisjoint", "issubset", "issuperset", "symmetric_difference", "union",
];

pub fn builtin_value(name: &str) -> Option<Value> {
    let kind = match name {
        "bool" => TypeKind::Bool,
        "int" => TypeKind::Int,
        "float" => TypeKind::Float,
        "str" => TypeKind::Str,
        "list" => TypeKind::List,
        "tuple" => TypeKind::Tuple,
        "dict" => TypeKind::Dict,
        "range" => TypeKind::Range,
        "set" => TypeKind::Set,
        "frozenset" => TypeKind::FrozenSet,
        "slice" => TypeKind::Slice,
        "type" => TypeKind::Type,
        _ => {
            if let Some(function) = BUILTIN_FUNCTIONS.iter().find(|f| **f == name) {
                return Some(Value::Builtin(*function));
            }
            let kind = ExcKind::CATCHABLE.iter().find(|k| k.name() == name)?;
            TypeKind::Exc(*kind)
        }
    };
    Some(Value::Type(kind))
}

pub(super) fn has_method(object: &Value, name: &str) -> bool {
    let table = match object {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Set(_) => SET_METHODS,
        Value::FrozenSet(_) => FROZENSET_METHODS,
        other => return super::modules::has_native_method(other, name),
    };
    table.contains(&name)
}

pub(super) fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Exec<()> {
    let given = args.len();
    if given >= min && given <= max {
        return Ok(());
    }
    let message = if min == max {
        match min {
            0 => format!("{}() takes no arguments ({} given)", name, given),
            1 => format!("{}() takes exactly one argument ({} given)", name, given),
            n => format!("{}() takes exactly {} arguments ({} given)", name, n, given),
        }
    } else if given < min {
        format!("{} expected at least {} arguments, got {}", name, min, given)
    } else {
        format!("{} expected at most {} arguments, got {}", name, max, given)
    };
    Err(type_error(message))
}

pub(super) fn take_kwarg(kwargs: &mut Vec<(String, Value)>, name: &str) -> Option<Value> {
    let position = kwargs.iter().position(|(k, _)| k == name)?;
    Some(kwargs.remove(position).1)
}

pub(super) fn no_kwargs(name: &str, kwargs: &[(String, Value)]) -> Exec<()> {
    match kwargs.first() {
        None => Ok(()),
        Some((key, _)) => Err(type_error(format!(
            "{}() got an unexpected keyword argument '{}'",
            name, key
        ))),
    }
}

fn radix(prefix: &str, value: &BigInt, base: u32) -> Value {
    let sign = if value.is_negative() { "-" } else { "" };
    Value::str(format!("{}{}{}", sign, prefix, value.magnitude().to_str_radix(base)))
}

/// Round half to even, the way Python's `round` does.
fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

pub(super) fn float_to_int(f: f64) -> Exec<i64> {
    if f.is_nan() {
        return Err(value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::new(
            ExcKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let truncated = f.trunc();
    if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(super::value::overflow());
    }
    Ok(truncated as i64)
}

/// `int(f)`: truncates toward zero, growing past 64 bits when needed.
pub(super) fn float_to_integer(f: f64) -> Exec<Value> {
    match float_to_int(f) {
        Ok(i) => Ok(Value::Int(i)),
        Err(err) if err.kind == ExcKind::OverflowError && f.is_finite() => BigInt::from_f64(f.trunc())
            .map(Value::from_bigint)
            .ok_or_else(super::value::overflow),
        Err(err) => Err(err),
    }
}

fn parse_int(text: &str, base: u32) -> Exec<Value> {
    let invalid = || value_error(format!("invalid literal for int() with base {}: {}", base, super::value::str_repr(text)));
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let mut base = base;
    let mut digits = digits;
    let lower = digits.to_ascii_lowercase();
    for (prefix, prefix_base) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if lower.starts_with(prefix) && (base == prefix_base || base == 0) {
            base = prefix_base;
            digits = &digits[2..];
        }
    }
    if base == 0 {
        base = 10;
    }
    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
        return Err(invalid());
    }
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    if !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }
    if !base.is_power_of_two() && cleaned.len() > MAX_INT_DIGITS {
        return Err(value_error(format!(
            "Exceeds the limit ({}) for integer string conversion: value has {} digits",
            MAX_INT_DIGITS,
            cleaned.len()
        )));
    }
    let magnitude = BigInt::parse_bytes(cleaned.as_bytes(), base).ok_or_else(invalid)?;
    Ok(Value::from_bigint(if negative { -magnitude } else { magnitude }))
}

fn parse_float(text: &str) -> Exec<f64> {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();
    let special = match lower.trim_start_matches(['+', '-']) {
        "inf" | "infinity" => Some(f64::INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    };
    if let Some(value) = special {
        return Ok(if lower.starts_with('-') { -value } else { value });
    }
    let cleaned: String = trimmed.chars().filter(|c| *c != '_').collect();
    let looks_numeric = !cleaned.is_empty()
        && cleaned
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    match cleaned.parse::<f64>() {
        Ok(value) if looks_numeric => Ok(value),
        _ => Err(value_error(format!(
            "could not convert string to float: {}",
            super::value::str_repr(text)
        ))),
    }
}

/// Character index of a byte offset in `text`.
fn char_pos(text: &str, byte: usize) -> i64 {
    text[..byte].chars().count() as i64
}

/// Byte range of a `[start:end]` character window, clamped like a slice.
fn char_window(text: &str, start: Option<&Value>, end: Option<&Value>) -> Exec<(usize, usize)> {
    let len = text.chars().count();
    let bound = |value: Option<&Value>, default: usize| -> Exec<usize> {
        match value {
            None | Some(Value::None) => Ok(default),
            Some(v) => {
                let i = v.expect_int("slice index")?;
                let i = if i < 0 { (i + len as i64).max(0) } else { i.min(len as i64) };
                Ok(i as usize)
            }
        }
    };
    let (start, end) = (bound(start, 0)?, bound(end, len)?);
    let byte = |chars: usize| text.char_indices().nth(chars).map_or(text.len(), |(b, _)| b);
    Ok((byte(start), byte(end.max(start))))
}

fn pad(text: &str, width: i64, fill: char, align: Ordering) -> String {
    let len = text.chars().count() as i64;
    if width <= len {
        return text.to_string();
    }
    let total = (width - len) as usize;
    let (left, right) = match align {
        Ordering::Less => (0, total),
        Ordering::Greater => (total, 0),
        Ordering::Equal => {
            let left = total / 2 + (total & width as usize & 1);
            (left, total - left)
        }
    };
    let fill = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    format!("{}{}{}", fill(left), text, fill(right))
}

fn fill_char(value: Option<&Value>) -> Exec<char> {
    match value {
        None => Ok(' '),
        Some(value) => {
            let s = value.expect_str("fill character")?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(c),
                _ => Err(type_error("The fill character must be exactly one character long")),
            }
        }
    }
}

fn split_whitespace(text: &str, maxsplit: i64) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if maxsplit >= 0 && parts.len() as i64 == maxsplit {
            parts.push(Value::str(rest));
            return parts;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        parts.push(Value::str(&rest[..end]));
        rest = rest[end..].trim_start();
    }
    parts
}

fn strip_chars<'a>(text: &'a str, chars: Option<&Value>, left: bool, right: bool) -> Exec<&'a str> {
    let set: Option<Vec<char>> = match chars {
        None | Some(Value::None) => None,
        Some(value) => Some(value.expect_str("strip arg")?.chars().collect()),
    };
    let matches = |c: char| match &set {
        None => c.is_whitespace(),
        Some(set) => set.contains(&c),
    };
    let mut out = text;
    if left {
        out = out.trim_start_matches(matches);
    }
    if right {
        out = out.trim_end_matches(matches);
    }
    Ok(out)
}

fn affix_matches(text: &str, affix: &Value, check: impl Fn(&str, &str) -> bool) -> Exec<bool> {
    match affix {
        Value::Str(s) => Ok(check(text, s)),
        Value::Tuple(options) => {
            for option in options.iter() {
                if check(text, &option.expect_str("tuple item")?) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(type_error(format!(
            "startswith first arg must be str or a tuple of str, not {}",
            other.type_name()
        ))),
    }
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_cased = false;
    for c in text.chars() {
        if previous_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        previous_cased = c.is_alphabetic();
    }
    out
}

fn index_arg(value: Option<&Value>, default: i64) -> Exec<i64> {
    match value {
        None => Ok(default),
        Some(v) => v.expect_int("index"),
    }
}

impl Interpreter {
    pub(super) fn call_builtin(
        &mut self,
        name: &'static str,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        match name {
            "print" => {
                let sep = match take_kwarg(&mut kwargs, "sep") {
                    None | Some(Value::None) => " ".to_string(),
                    Some(v) => v.expect_str("sep")?.to_string(),
                };
                let end = match take_kwarg(&mut kwargs, "end") {
                    None | Some(Value::None) => "\n".to_string(),
                    Some(v) => v.expect_str("end")?.to_string(),
                };
                take_kwarg(&mut kwargs, "flush");
                no_kwargs(name, &kwargs)?;
                let mut line = args.iter().map(Value::to_str).collect::<Vec<_>>().join(&sep);
                line.push_str(&end);
                self.write_output(&line)?;
                return Ok(Value::None);
            }
            "input" => {
                return Err(Exception::new(
                    ExcKind::RuntimeError,
                    "Input is not allowed in safe execution mode",
                ))
            }
            "sorted" => {
                arity(name, &args, 1, 1)?;
                let key = take_kwarg(&mut kwargs, "key");
                let reverse = take_kwarg(&mut kwargs, "reverse").map_or(false, |v| v.truthy());
                no_kwargs(name, &kwargs)?;
                let items = self.collect_value(&args[0])?;
                return Ok(Value::list(self.sort_values(items, key, reverse)?));
            }
            "max" | "min" => return self.extreme(name, args, kwargs),
            _ => {}
        }
        no_kwargs(name, &kwargs)?;

        match name {
            "abs" => {
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::TimeDelta(delta) => Ok(Value::TimeDelta(if *delta < chrono::Duration::zero() { -*delta } else { *delta })),
                    Value::BigInt(big) => Ok(Value::from_bigint(big.abs())),
                    value => match value.as_num() {
                        Some(Num::Int(i)) => Ok(i
                            .checked_abs()
                            .map(Value::Int)
                            .unwrap_or_else(|| Value::from_bigint(BigInt::from(i).abs()))),
                        Some(Num::Float(f)) => Ok(Value::Float(f.abs())),
                        None => Err(type_error(format!("bad operand type for abs(): '{}'", value.type_name()))),
                    },
                }
            }
            "all" | "any" => {
                arity(name, &args, 1, 1)?;
                let want = name == "any";
                for (i, item) in args[0].iter()?.enumerate() {
                    if i % 1024 == 0 {
                        self.tick()?;
                    }
                    if item.truthy() == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }
            "bin" | "hex" | "oct" => {
                arity(name, &args, 1, 1)?;
                let value = args[0].as_bigint().ok_or_else(|| {
                    type_error(format!("'{}' object cannot be interpreted as an integer", args[0].type_name()))
                })?;
                Ok(match name {
                    "bin" => radix("0b", &value, 2),
                    "hex" => radix("0x", &value, 16),
                    _ => radix("0o", &value, 8),
                })
            }
            "callable" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::Bool(args[0].is_code_object() && !matches!(args[0], Value::Module(_))))
            }
            "chr" => {
                arity(name, &args, 1, 1)?;
                let code = args[0].expect_int("chr() argument")?;
                u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| Value::str(c.to_string()))
                    .ok_or_else(|| value_error("chr() arg not in range(0x110000)"))
            }
            "divmod" => {
                arity(name, &args, 2, 2)?;
                let quotient = ops::binary(super::ast::BinOp::FloorDiv, &args[0], &args[1])?;
                let remainder = ops::binary(super::ast::BinOp::Mod, &args[0], &args[1])?;
                Ok(Value::tuple(vec![quotient, remainder]))
            }
            "enumerate" => {
                arity(name, &args, 1, 2)?;
                let start = index_arg(args.get(1), 0)?;
                let items = self.collect_value(&args[0])?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let index = start.checked_add(i as i64).ok_or_else(super::value::overflow)?;
                    out.push(Value::tuple(vec![Value::Int(index), item]));
                }
                Ok(Value::list(out))
            }
            "filter" => {
                arity(name, &args, 2, 2)?;
                let items = self.collect_value(&args[1])?;
                let mut out = Vec::new();
                for item in items {
                    self.tick()?;
                    let keep = match &args[0] {
                        Value::None => item.truthy(),
                        function => self.call(function, vec![item.clone()], Vec::new())?.truthy(),
                    };
                    if keep {
                        out.push(item);
                    }
                }
                Ok(Value::list(out))
            }
            "format" => {
                arity(name, &args, 1, 2)?;
                let spec = match args.get(1) {
                    Some(spec) => spec.expect_str("format spec")?.to_string(),
                    None => String::new(),
                };
                Ok(Value::str(format_value(&args[0], &spec)?))
            }
            "help" => {
                arity(name, &args, 0, 1)?;
                let text = match args.first() {
                    None => "Type help(object) for help about object.\n".to_string(),
                    Some(Value::Builtin(f)) => format!("Help on built-in function {}.\n", f),
                    Some(Value::Function(f)) => format!("Help on function {}.\n", f.name),
                    Some(Value::Module(m)) => format!("Help on module {}.\n", m.name),
                    Some(Value::Type(kind)) => format!("Help on class {}.\n", kind.name()),
                    Some(other) => format!("Help on {} object.\n", other.type_name()),
                };
                self.write_output(&text)?;
                Ok(Value::None)
            }
            "isinstance" => {
                arity(name, &args, 2, 2)?;
                Ok(Value::Bool(class_matches(args[0].type_kind(), &args[1], name)?))
            }
            "issubclass" => {
                arity(name, &args, 2, 2)?;
                let Value::Type(kind) = &args[0] else {
                    return Err(type_error("issubclass() arg 1 must be a class"));
                };
                Ok(Value::Bool(class_matches(*kind, &args[1], name)?))
            }
            "iter" => {
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Iterator(_) => Ok(args[0].clone()),
                    other => Ok(Value::Iterator(Rc::new(RefCell::new(other.iter()?)))),
                }
            }
            "next" => {
                arity(name, &args, 1, 2)?;
                let Value::Iterator(inner) = &args[0] else {
                    return Err(type_error(format!("'{}' object is not an iterator", args[0].type_name())));
                };
                let item = inner.borrow_mut().next();
                match (item, args.get(1)) {
                    (Some(item), _) => Ok(item),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) => Err(Exception::new(ExcKind::StopIteration, "")),
                }
            }
            "len" => {
                arity(name, &args, 1, 1)?;
                let len = args[0].len().ok_or_else(|| {
                    type_error(format!("object of type '{}' has no len()", args[0].type_name()))
                })?;
                Ok(Value::Int(len as i64))
            }
            "map" => {
                if args.len() < 2 {
                    return Err(type_error("map() must have at least two arguments."));
                }
                let mut columns = Vec::with_capacity(args.len() - 1);
                for iterable in &args[1..] {
                    columns.push(self.collect_value(iterable)?);
                }
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(rows);
                for row in 0..rows {
                    self.tick()?;
                    let call_args = columns.iter().map(|column| column[row].clone()).collect();
                    out.push(self.call(&args[0], call_args, Vec::new())?);
                }
                Ok(Value::list(out))
            }
            "ord" => {
                arity(name, &args, 1, 1)?;
                let text = args[0].expect_str("ord() argument")?;
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Value::Int(c as i64)),
                    _ => Err(type_error(format!(
                        "ord() expected a character, but string of length {} found",
                        text.chars().count()
                    ))),
                }
            }
            "pow" => {
                arity(name, &args, 2, 3)?;
                match args.get(2) {
                    None | Some(Value::None) => ops::binary(super::ast::BinOp::Pow, &args[0], &args[1]),
                    Some(modulus) => {
                        let [Some(base), Some(exp), Some(modulus)] = [&args[0], &args[1], modulus].map(Value::as_bigint)
                        else {
                            return Err(type_error("pow() 3rd argument not allowed unless all arguments are integers"));
                        };
                        if modulus.is_zero() {
                            return Err(value_error("pow() 3rd argument cannot be 0"));
                        }
                        if exp.is_negative() {
                            return Err(value_error("base is not invertible for the given modulus"));
                        }
                        Ok(Value::from_bigint(base.modpow(&exp, &modulus)))
                    }
                }
            }
            "repr" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::str(args[0].repr()))
            }
            "reversed" => {
                arity(name, &args, 1, 1)?;
                if matches!(args[0], Value::Dict(_)) {
                    return Err(type_error("'dict' object is not reversible"));
                }
                let mut items = self.collect_value(&args[0])?;
                items.reverse();
                Ok(Value::list(items))
            }
            "round" => {
                arity(name, &args, 1, 2)?;
                let digits = match args.get(1) {
                    None | Some(Value::None) => None,
                    Some(v) => Some(v.expect_int("ndigits")?),
                };
                round(&args[0], digits)
            }
            "sum" => {
                arity(name, &args, 1, 2)?;
                let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
                if matches!(total, Value::Str(_)) {
                    return Err(type_error("sum() can't sum strings [use ''.join(seq) instead]"));
                }
                for (i, item) in args[0].iter()?.enumerate() {
                    if i % 1024 == 0 {
                        self.tick()?;
                    }
                    total = ops::binary(super::ast::BinOp::Add, &total, &item)?;
                }
                Ok(total)
            }
            "zip" => {
                let mut columns = Vec::with_capacity(args.len());
                for iterable in &args {
                    columns.push(self.collect_value(iterable)?);
                }
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                Ok(Value::list(
                    (0..rows)
                        .map(|row| Value::tuple(columns.iter().map(|c| c[row].clone()).collect()))
                        .collect(),
                ))
            }
            other => Err(Exception::new(
                ExcKind::NameError,
                format!("name '{}' is not defined", other),
            )),
        }
    }

    /// Calls a type object: `int("3")`, `list(range(3))`, `ValueError("x")`.
    pub(super) fn construct(
        &mut self,
        kind: TypeKind,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        let name = kind.name();
        if let TypeKind::Exc(kind) = kind {
            no_kwargs(name, &kwargs)?;
            let message = match args.as_slice() {
                [] => String::new(),
                [single] => single.to_str(),
                many => Value::tuple(many.to_vec()).repr(),
            };
            return Ok(Value::Exception(Rc::new(Exception::new(kind, message))));
        }
        if matches!(kind, TypeKind::DateTime | TypeKind::Date | TypeKind::TimeDelta) {
            return self.construct_temporal(kind, args, kwargs);
        }
        if kind == TypeKind::Dict {
            arity(name, &args, 0, 1)?;
            let mut map = DictMap::new();
            if let Some(source) = args.first() {
                self.merge_into(&mut map, source)?;
            }
            for (key, value) in kwargs {
                map.insert(Key::Str(Rc::from(key.as_str())), value);
            }
            return Ok(Value::dict(map));
        }
        let base = if kind == TypeKind::Int { take_kwarg(&mut kwargs, "base") } else { None };
        no_kwargs(name, &kwargs)?;

        match kind {
            TypeKind::Bool => {
                arity(name, &args, 0, 1)?;
                Ok(Value::Bool(args.first().map_or(false, Value::truthy)))
            }
            TypeKind::Int => {
                arity(name, &args, 0, 2)?;
                let base = match base.as_ref().or(args.get(1)) {
                    Some(b) => Some(b.expect_int("base")?),
                    None => None,
                };
                if let Some(b) = base {
                    if b != 0 && !(2..=36).contains(&b) {
                        return Err(value_error("int() base must be >= 2 and <= 36, or 0"));
                    }
                }
                match (args.first(), base) {
                    (None, _) => Ok(Value::Int(0)),
                    (Some(Value::Str(s)), base) => parse_int(s, base.unwrap_or(10) as u32),
                    (Some(_), Some(_)) => Err(type_error("int() can't convert non-string with explicit base")),
                    (Some(Value::BigInt(big)), None) => Ok(Value::BigInt(big.clone())),
                    (Some(value), None) => match value.as_num() {
                        Some(Num::Int(i)) => Ok(Value::Int(i)),
                        Some(Num::Float(f)) => float_to_integer(f),
                        None => Err(type_error(format!(
                            "int() argument must be a string or a real number, not '{}'",
                            value.type_name()
                        ))),
                    },
                }
            }
            TypeKind::Float => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::Float(0.0)),
                    Some(Value::Str(s)) => Ok(Value::Float(parse_float(s)?)),
                    Some(big @ Value::BigInt(_)) => big.expect_float("float() argument").map(Value::Float),
                    Some(value) => value.as_num().map(|n| Value::Float(n.as_f64())).ok_or_else(|| {
                        type_error(format!(
                            "float() argument must be a string or a real number, not '{}'",
                            value.type_name()
                        ))
                    }),
                }
            }
            TypeKind::Str => {
                arity(name, &args, 0, 1)?;
                Ok(Value::str(args.first().map(Value::to_str).unwrap_or_default()))
            }
            TypeKind::List => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::list(Vec::new())),
                    Some(iterable) => Ok(Value::list(self.collect_value(iterable)?)),
                }
            }
            TypeKind::Tuple => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::tuple(Vec::new())),
                    Some(Value::Tuple(items)) => Ok(Value::Tuple(items.clone())),
                    Some(iterable) => Ok(Value::tuple(self.collect_value(iterable)?)),
                }
            }
            TypeKind::Range => {
                arity(name, &args, 1, 3)?;
                let ints = args
                    .iter()
                    .map(|a| {
                        a.as_index().ok_or_else(|| {
                            type_error(format!("'{}' object cannot be interpreted as an integer", a.type_name()))
                        })
                    })
                    .collect::<Exec<Vec<i64>>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => return Err(type_error("range expected at most 3 arguments")),
                };
                if step == 0 {
                    return Err(value_error("range() arg 3 must not be zero"));
                }
                Ok(Value::Range(Range { start, stop, step }))
            }
            TypeKind::Set | TypeKind::FrozenSet => {
                arity(name, &args, 0, 1)?;
                let items = match args.first() {
                    None => SetItems::new(),
                    Some(iterable) => self.key_set(iterable)?,
                };
                Ok(match kind {
                    TypeKind::Set => Value::set(items),
                    _ => Value::FrozenSet(Rc::new(items)),
                })
            }
            TypeKind::Slice => {
                arity(name, &args, 1, 3)?;
                let bound = |value: &Value| -> Exec<Option<i64>> {
                    match value {
                        Value::None => Ok(None),
                        other => other.as_index().map(Some).ok_or_else(|| {
                            type_error("slice indices must be integers or None or have an __index__ method")
                        }),
                    }
                };
                let (start, stop, step) = match args.as_slice() {
                    [stop] => (None, bound(stop)?, None),
                    [start, stop] => (bound(start)?, bound(stop)?, None),
                    [start, stop, step] => (bound(start)?, bound(stop)?, bound(step)?),
                    _ => return Err(type_error("slice expected at most 3 arguments")),
                };
                Ok(Value::Slice(Slice { start, stop, step }))
            }
            TypeKind::Type => {
                arity(name, &args, 1, 1)?;
                Ok(Value::Type(args[0].type_kind()))
            }
            other => Err(type_error(format!("cannot create '{}' instances", other.name()))),
        }
    }

    fn merge_into(&mut self, map: &mut DictMap, source: &Value) -> Exec<()> {
        if let Value::Dict(other) = source {
            let pairs: Vec<(Key, Value)> = other.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            map.extend(pairs);
            return Ok(());
        }
        for (i, pair) in self.collect_value(source)?.into_iter().enumerate() {
            let items = self.collect_value(&pair).map_err(|_| {
                type_error(format!(
                    "cannot convert dictionary update sequence element #{} to a sequence",
                    i
                ))
            })?;
            let [key, value]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
                value_error(format!(
                    "dictionary update sequence element #{} has length {}; 2 is required",
                    i,
                    items.len()
                ))
            })?;
            map.insert(Key::from_value(&key)?, value);
        }
        if map.len() > MAX_ITEMS {
            return Err(ops::memory_error());
        }
        Ok(())
    }

    /// Stable sort by natural order or by `key(item)`.
    pub(super) fn sort_values(&mut self, items: Vec<Value>, key: Option<Value>, reverse: bool) -> Exec<Vec<Value>> {
        let keys = match key {
            None | Some(Value::None) => items.clone(),
            Some(function) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in &items {
                    self.tick()?;
                    keys.push(self.call(&function, vec![item.clone()], Vec::new())?);
                }
                keys
            }
        };
        let mut order: Vec<usize> = (0..items.len()).collect();
        let mut failure = None;
        order.sort_by(|&a, &b| {
            let (a, b) = if reverse { (b, a) } else { (a, b) };
            match keys[a].compare(&keys[b], "<") {
                Ok(ordering) => ordering.unwrap_or(Ordering::Equal),
                Err(err) => {
                    failure.get_or_insert(err);
                    Ordering::Equal
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        let mut slots: Vec<Option<Value>> = items.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    fn extreme(&mut self, name: &'static str, args: Vec<Value>, mut kwargs: Vec<(String, Value)>) -> Exec<Value> {
        let key = take_kwarg(&mut kwargs, "key");
        let default = take_kwarg(&mut kwargs, "default");
        no_kwargs(name, &kwargs)?;
        let items = match args.as_slice() {
            [] => return Err(type_error(format!("{} expected at least 1 argument, got 0", name))),
            [iterable] => self.collect_value(iterable)?,
            _ => args,
        };
        let want = if name == "max" { Ordering::Greater } else { Ordering::Less };
        let mut best: Option<(Value, Value)> = None;
        for item in items {
            let score = match &key {
                None | Some(Value::None) => item.clone(),
                Some(function) => self.call(function, vec![item.clone()], Vec::new())?,
            };
            let replace = match &best {
                None => true,
                Some((best_score, _)) => score.compare(best_score, if name == "max" { ">" } else { "<" })? == Some(want),
            };
            if replace {
                best = Some((score, item));
            }
        }
        match (best, default) {
            (Some((_, item)), _) => Ok(item),
            (None, Some(default)) => Ok(default),
            (None, None) => Err(value_error(format!("{}() arg is an empty sequence", name))),
        }
    }

    pub(super) fn call_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        match receiver {
            Value::Str(text) => {
                if name == "format" {
                    return Ok(Value::str(str_format(text, &args, &kwargs)?));
                }
                no_kwargs(name, &kwargs)?;
                self.str_method(text, name, args)
            }
            Value::List(_) => self.list_method(receiver, name, args, kwargs),
            Value::Dict(_) => {
                no_kwargs(name, &kwargs)?;
                self.dict_method(receiver, name, args)
            }
            Value::Tuple(items) => {
                no_kwargs(name, &kwargs)?;
                sequence_method(items, name, &args)
            }
            Value::Set(_) | Value::FrozenSet(_) => {
                no_kwargs(name, &kwargs)?;
                self.set_method(receiver, name, args)
            }
            other => self.call_object_method(other, name, args, kwargs),
        }
    }

    fn str_method(&mut self, text: &Rc<str>, name: &str, args: Vec<Value>) -> Exec<Value> {
        let text: &str = text;
        let bool_check = |f: fn(char) -> bool| Ok(Value::Bool(!text.is_empty() && text.chars().all(f)));
        match name {
            "upper" => Ok(Value::str(text.to_uppercase())),
            "lower" => Ok(Value::str(text.to_lowercase())),
            "swapcase" => Ok(Value::str(
                text.chars()
                    .flat_map(|c| -> Vec<char> {
                        if c.is_uppercase() {
                            c.to_lowercase().collect()
                        } else {
                            c.to_uppercase().collect()
                        }
                    })
                    .collect::<String>(),
            )),
            "capitalize" => {
                let mut chars = text.chars();
                Ok(Value::str(match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
                    None => String::new(),
                }))
            }
            "title" => Ok(Value::str(title_case(text))),
            "strip" | "lstrip" | "rstrip" => {
                arity(name, &args, 0, 1)?;
                let stripped = strip_chars(text, args.first(), name != "rstrip", name != "lstrip")?;
                Ok(Value::str(stripped))
            }
            "split" | "rsplit" => {
                arity(name, &args, 0, 2)?;
                let maxsplit = index_arg(args.get(1), -1)?;
                let parts = match args.first() {
                    None | Some(Value::None) if name == "split" => split_whitespace(text, maxsplit),
                    None | Some(Value::None) => {
                        let reversed: String = text.chars().rev().collect();
                        let mut parts: Vec<Value> = split_whitespace(&reversed, maxsplit)
                            .into_iter()
                            .map(|p| Value::str(p.to_str().chars().rev().collect::<String>()))
                            .collect();
                        parts.reverse();
                        parts
                    }
                    Some(sep) => {
                        let sep = sep.expect_str("separator")?;
                        if sep.is_empty() {
                            return Err(value_error("empty separator"));
                        }
                        let limit = if maxsplit < 0 { usize::MAX } else { maxsplit as usize + 1 };
                        if name == "split" {
                            text.splitn(limit, &*sep).map(Value::str).collect()
                        } else {
                            let mut parts: Vec<Value> = text.rsplitn(limit, &*sep).map(Value::str).collect();
                            parts.reverse();
                            parts
                        }
                    }
                };
                Ok(Value::list(parts))
            }
            "splitlines" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::list(text.lines().map(Value::str).collect()))
            }
            "join" => {
                arity(name, &args, 1, 1)?;
                let mut out = String::new();
                for (i, item) in self.collect_value(&args[0])?.iter().enumerate() {
                    let Value::Str(part) = item else {
                        return Err(type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            item.type_name()
                        )));
                    };
                    if i > 0 {
                        out.push_str(text);
                    }
                    out.push_str(part);
                    if out.len() > MAX_STR_BYTES {
                        return Err(ops::memory_error());
                    }
                }
                Ok(Value::str(out))
            }
            "replace" => {
                arity(name, &args, 2, 3)?;
                let old = args[0].expect_str("replace() argument 1")?;
                let new = args[1].expect_str("replace() argument 2")?;
                let count = index_arg(args.get(2), -1)?;
                let growth = new.len().saturating_sub(old.len()).saturating_mul(text.len() + 1);
                if text.len().saturating_add(growth) > MAX_STR_BYTES {
                    return Err(ops::memory_error());
                }
                Ok(Value::str(if count < 0 {
                    text.replace(&*old, &new)
                } else {
                    text.replacen(&*old, &new, count as usize)
                }))
            }
            "startswith" | "endswith" => {
                arity(name, &args, 1, 3)?;
                let (start, end) = char_window(text, args.get(1), args.get(2))?;
                let window = &text[start..end];
                let result = if name == "startswith" {
                    affix_matches(window, &args[0], |t, a| t.starts_with(a))?
                } else {
                    affix_matches(window, &args[0], |t, a| t.ends_with(a))?
                };
                Ok(Value::Bool(result))
            }
            "find" | "rfind" | "index" | "count" => {
                arity(name, &args, 1, 3)?;
                let needle = args[0].expect_str("substring")?;
                let (start, end) = char_window(text, args.get(1), args.get(2))?;
                let window = &text[start..end];
                if name == "count" {
                    let count = if needle.is_empty() {
                        window.chars().count() + 1
                    } else {
                        window.matches(&*needle).count()
                    };
                    return Ok(Value::Int(count as i64));
                }
                let found = if name == "rfind" { window.rfind(&*needle) } else { window.find(&*needle) };
                match found {
                    Some(byte) => Ok(Value::Int(char_pos(text, start + byte))),
                    None if name == "index" => Err(value_error("substring not found")),
                    None => Ok(Value::Int(-1)),
                }
            }
            "partition" => {
                arity(name, &args, 1, 1)?;
                let sep = args[0].expect_str("separator")?;
                if sep.is_empty() {
                    return Err(value_error("empty separator"));
                }
                Ok(Value::tuple(match text.split_once(&*sep) {
                    Some((head, tail)) => vec![Value::str(head), Value::Str(sep.clone()), Value::str(tail)],
                    None => vec![Value::str(text), Value::str(""), Value::str("")],
                }))
            }
            "center" | "ljust" | "rjust" => {
                arity(name, &args, 1, 2)?;
                let width = args[0].expect_int("width")?;
                if width as usize > MAX_STR_BYTES {
                    return Err(ops::memory_error());
                }
                let fill = fill_char(args.get(1))?;
                let align = match name {
                    "ljust" => Ordering::Less,
                    "rjust" => Ordering::Greater,
                    _ => Ordering::Equal,
                };
                Ok(Value::str(pad(text, width, fill, align)))
            }
            "zfill" => {
                arity(name, &args, 1, 1)?;
                let width = args[0].expect_int("width")?;
                if width as usize > MAX_STR_BYTES {
                    return Err(ops::memory_error());
                }
                let (sign, digits) = match text.chars().next() {
                    Some(c @ ('+' | '-')) => (c.to_string(), &text[1..]),
                    _ => (String::new(), text),
                };
                let padded = pad(digits, width - sign.len() as i64, '0', Ordering::Greater);
                Ok(Value::str(format!("{}{}", sign, padded)))
            }
            "isdigit" | "isnumeric" => bool_check(|c| c.is_numeric()),
            "isalpha" => bool_check(char::is_alphabetic),
            "isalnum" => bool_check(char::is_alphanumeric),
            "isspace" => bool_check(char::is_whitespace),
            "isupper" | "islower" => {
                let cased: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                let upper = name == "isupper";
                Ok(Value::Bool(
                    !cased.is_empty()
                        && cased
                            .iter()
                            .filter(|c| c.is_lowercase() || c.is_uppercase())
                            .all(|c| if upper { c.is_uppercase() } else { c.is_lowercase() }),
                ))
            }
            _ => Err(super::interp::no_attribute(&Value::str(text), name)),
        }
    }

    fn list_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        let Value::List(items) = receiver else {
            return Err(super::interp::no_attribute(receiver, name));
        };
        if name == "sort" {
            arity(name, &args, 0, 0)?;
            let key = take_kwarg(&mut kwargs, "key");
            let reverse = take_kwarg(&mut kwargs, "reverse").map_or(false, |v| v.truthy());
            no_kwargs(name, &kwargs)?;
            let snapshot = items.borrow().clone();
            let sorted = self.sort_values(snapshot, key, reverse)?;
            *items.borrow_mut() = sorted;
            return Ok(Value::None);
        }
        no_kwargs(name, &kwargs)?;
        match name {
            "append" => {
                arity(name, &args, 1, 1)?;
                if items.borrow().len() >= MAX_ITEMS {
                    return Err(ops::memory_error());
                }
                items.borrow_mut().push(args[0].clone());
                Ok(Value::None)
            }
            "extend" => {
                arity(name, &args, 1, 1)?;
                let extra = self.collect_value(&args[0])?;
                if items.borrow().len() + extra.len() > MAX_ITEMS {
                    return Err(ops::memory_error());
                }
                items.borrow_mut().extend(extra);
                Ok(Value::None)
            }
            "insert" => {
                arity(name, &args, 2, 2)?;
                let len = items.borrow().len() as i64;
                let index = args[0].expect_int("index")?;
                let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
                items.borrow_mut().insert(index as usize, args[1].clone());
                Ok(Value::None)
            }
            "pop" => {
                arity(name, &args, 0, 1)?;
                let len = items.borrow().len() as i64;
                if len == 0 {
                    return Err(Exception::new(ExcKind::IndexError, "pop from empty list"));
                }
                let index = index_arg(args.first(), -1)?;
                let index = if index < 0 { index + len } else { index };
                if !(0..len).contains(&index) {
                    return Err(Exception::new(ExcKind::IndexError, "pop index out of range"));
                }
                Ok(items.borrow_mut().remove(index as usize))
            }
            "remove" => {
                arity(name, &args, 1, 1)?;
                let position = items.borrow().iter().position(|item| item.equals(&args[0]));
                match position {
                    Some(i) => {
                        items.borrow_mut().remove(i);
                        Ok(Value::None)
                    }
                    None => Err(value_error("list.remove(x): x not in list")),
                }
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                items.borrow_mut().clear();
                Ok(Value::None)
            }
            "reverse" => {
                arity(name, &args, 0, 0)?;
                items.borrow_mut().reverse();
                Ok(Value::None)
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::list(items.borrow().clone()))
            }
            "index" | "count" => {
                let snapshot = items.borrow().clone();
                sequence_method(&snapshot, name, &args)
            }
            _ => Err(super::interp::no_attribute(receiver, name)),
        }
    }

    fn dict_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> Exec<Value> {
        let Value::Dict(map) = receiver else {
            return Err(super::interp::no_attribute(receiver, name));
        };
        match name {
            "keys" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::list(map.borrow().keys().map(Key::to_value).collect()))
            }
            "values" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::list(map.borrow().values().cloned().collect()))
            }
            "items" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::list(
                    map.borrow()
                        .iter()
                        .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
                        .collect(),
                ))
            }
            "get" => {
                arity(name, &args, 1, 2)?;
                let key = Key::from_value(&args[0])?;
                let found = map.borrow().get(&key).cloned();
                Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            "pop" => {
                arity(name, &args, 1, 2)?;
                let key = Key::from_value(&args[0])?;
                let removed = map.borrow_mut().shift_remove(&key);
                match (removed, args.get(1)) {
                    (Some(value), _) => Ok(value),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) => Err(ops::key_error(&args[0])),
                }
            }
            "popitem" => {
                arity(name, &args, 0, 0)?;
                let last = map.borrow_mut().pop();
                last.map(|(k, v)| Value::tuple(vec![k.to_value(), v]))
                    .ok_or_else(|| Exception::new(ExcKind::KeyError, "'popitem(): dictionary is empty'"))
            }
            "setdefault" => {
                arity(name, &args, 1, 2)?;
                let key = Key::from_value(&args[0])?;
                let default = args.get(1).cloned().unwrap_or(Value::None);
                Ok(map.borrow_mut().entry(key).or_insert(default).clone())
            }
            "update" => {
                arity(name, &args, 0, 1)?;
                let mut merged = DictMap::new();
                if let Some(source) = args.first() {
                    self.merge_into(&mut merged, source)?;
                }
                map.borrow_mut().extend(merged);
                Ok(Value::None)
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                map.borrow_mut().clear();
                Ok(Value::None)
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::dict(map.borrow().clone()))
            }
            _ => Err(super::interp::no_attribute(receiver, name)),
        }
    }
}

impl Interpreter {
    /// Members of a set, or the hashed items of any other iterable.
    fn key_set(&mut self, value: &Value) -> Exec<SetItems> {
        if let Some(items) = value.with_set(SetItems::clone) {
            return Ok(items);
        }
        self.collect_value(value)?.iter().map(Key::from_value).collect()
    }

    fn set_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> Exec<Value> {
        let current = receiver.with_set(SetItems::clone).unwrap_or_default();
        let algebra = match name.trim_end_matches("_update") {
            "union" | "update" => Some(BinOp::BitOr),
            "intersection" => Some(BinOp::BitAnd),
            "difference" => Some(BinOp::Sub),
            "symmetric_difference" => Some(BinOp::BitXor),
            _ => None,
        };
        if let Some(op) = algebra {
            if op == BinOp::BitXor {
                arity(name, &args, 1, 1)?;
            }
            let mut result = current;
            for other in &args {
                result = ops::set_algebra(op, &result, &self.key_set(other)?);
                if result.len() > MAX_ITEMS {
                    return Err(ops::memory_error());
                }
            }
            return match receiver {
                Value::Set(items) if name.ends_with("update") => {
                    *items.borrow_mut() = result;
                    Ok(Value::None)
                }
                Value::FrozenSet(_) => Ok(Value::FrozenSet(Rc::new(result))),
                _ => Ok(Value::set(result)),
            };
        }
        match name {
            "copy" => {
                arity(name, &args, 0, 0)?;
                return Ok(match receiver {
                    Value::FrozenSet(_) => receiver.clone(),
                    _ => Value::set(current),
                });
            }
            "isdisjoint" | "issubset" | "issuperset" => {
                arity(name, &args, 1, 1)?;
                let other = self.key_set(&args[0])?;
                return Ok(Value::Bool(match name {
                    "isdisjoint" => current.is_disjoint(&other),
                    "issubset" => current.is_subset(&other),
                    _ => current.is_superset(&other),
                }));
            }
            _ => {}
        }

        let Value::Set(items) = receiver else {
            return Err(super::interp::no_attribute(receiver, name));
        };
        match name {
            "add" => {
                arity(name, &args, 1, 1)?;
                let key = Key::from_value(&args[0])?;
                let mut items = items.borrow_mut();
                if items.len() >= MAX_ITEMS {
                    return Err(ops::memory_error());
                }
                items.insert(key);
                Ok(Value::None)
            }
            "discard" | "remove" => {
                arity(name, &args, 1, 1)?;
                let removed = items.borrow_mut().shift_remove(&Key::from_value(&args[0])?);
                if !removed && name == "remove" {
                    return Err(Exception::new(ExcKind::KeyError, args[0].repr()));
                }
                Ok(Value::None)
            }
            "pop" => {
                arity(name, &args, 0, 0)?;
                items
                    .borrow_mut()
                    .shift_remove_index(0)
                    .map(|key| key.to_value())
                    .ok_or_else(|| Exception::new(ExcKind::KeyError, "'pop from an empty set'"))
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                items.borrow_mut().clear();
                Ok(Value::None)
            }
            _ => Err(super::interp::no_attribute(receiver, name)),
        }
    }
}

fn sequence_method(items: &[Value], name: &str, args: &[Value]) -> Exec<Value> {
    match name {
        "count" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Int(items.iter().filter(|item| item.equals(&args[0])).count() as i64))
        }
        "index" => {
            arity(name, args, 1, 3)?;
            let len = items.len() as i64;
            let clamp = |i: i64| {
                let i = if i < 0 { (i + len).max(0) } else { i.min(len) };
                i as usize
            };
            let start = clamp(index_arg(args.get(1), 0)?);
            let end = clamp(index_arg(args.get(2), len)?);
            (start..end.max(start))
                .find(|&i| items[i].equals(&args[0]))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| value_error(format!("{} is not in list", args[0].repr())))
        }
        _ => Err(type_error(format!("'tuple' object has no attribute '{}'", name))),
    }
}

/// `isinstance` and `issubclass`: is `kind` one of the classes named by `class`.
fn class_matches(kind: TypeKind, class: &Value, caller: &str) -> Exec<bool> {
    match class {
        Value::Type(parent) => Ok(kind.is_a(*parent)),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if class_matches(kind, class, caller)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(format!(
            "{}() arg 2 must be a type, a tuple of types, or a union",
            caller
        ))),
    }
}

/// Integer rounding to a negative number of digits, half to even.
fn round_integer(value: BigInt, digits: i64) -> Value {
    let places = digits.unsigned_abs();
    if places > value.magnitude().to_string().len() as u64 {
        return Value::Int(0);
    }
    let factor = num_traits::pow(BigInt::from(10), places as usize);
    let (mut quotient, remainder) = ops::big_div_mod(&value, &factor);
    let twice = &remainder * 2u32;
    let odd = (&quotient % 2u32) != BigInt::zero();
    if twice > factor || (twice == factor && odd) {
        quotient += 1u32;
    }
    Value::from_bigint(quotient * factor)
}

fn round(value: &Value, digits: Option<i64>) -> Exec<Value> {
    if let Some(int) = value.as_bigint() {
        return Ok(match digits {
            Some(d) if d < 0 => round_integer(int, d),
            _ => Value::from_bigint(int),
        });
    }
    match (value.as_num(), digits) {
        (Some(Num::Int(i)), _) => Ok(Value::Int(i)),
        (Some(Num::Float(f)), None) => float_to_integer(round_half_even(f)),
        (Some(Num::Float(f)), Some(d)) => {
            if !f.is_finite() || d > 300 {
                return Ok(Value::Float(f));
            }
            let d = d.max(-300) as i32;
            let factor = 10f64.powi(d);
            let scaled = f * factor;
            if !scaled.is_finite() {
                return Ok(Value::Float(f));
            }
            // Go through the shortest decimal form so 2.675 rounds like its repr.
            let rounded = format!("{:.*}", d.max(0) as usize, f);
            match rounded.parse::<f64>() {
                Ok(r) if d >= 0 => Ok(Value::Float(r)),
                _ => Ok(Value::Float(round_half_even(scaled) / factor)),
            }
        }
        (None, _) => Err(type_error(format!(
            "type {} doesn't define __round__ method",
            value.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::core::sandbox::interp::tests::run;
    use serde_json::json;

    fn output(source: &str) -> String {
        let outcome = run(source);
        if let Err(err) = &outcome.result {
            panic!("{} failed: {}", source, err);
        }
        outcome.output
    }

    #[test]
    fn test_numeric_builtins() {
        let out = output(
            "print(abs(-3), divmod(7, -2), pow(2, 10), pow(3, 4, 5), round(2.5), round(3.14159, 2))\nprint(bin(5), hex(-255), oct(8), int('ff', 16), int(' 42 '), float('1e3'), int(7.9))\n",
        );
        assert_eq!(out, "3 (-4, -1) 1024 1 2 3.14\n0b101 -0xff 0o10 255 42 1000.0 7\n");
    }

    #[test]
    fn test_sequence_builtins() {
        let out = output(
            "words = ['pear', 'fig', 'apple']\nprint(sorted(words), sorted(words, key=len, reverse=True))\nprint(max(words, key=len), min(3, 1, 2), max([], default=0))\nprint(list(enumerate('ab', 1)), list(zip([1, 2], 'xyz')), sum(range(5)))\nprint(list(map(lambda a, b: a * b, [1, 2], [3, 4])), list(filter(None, [0, 1, '', 'x'])))\n",
        );
        assert_eq!(
            out,
            "['apple', 'fig', 'pear'] ['apple', 'pear', 'fig']\napple 1 0\n[(1, 'a'), (2, 'b')] [(1, 'x'), (2, 'y')] 10\n[3, 8] [1, 'x']\n"
        );
    }

    #[test]
    fn test_string_methods() {
        let out = output(
            "s = '  Hello, World  '\nprint(s.strip().lower(), s.split(), 'a,b,,c'.split(','), '-'.join(['x', 'y']))\nprint('abc'.find('c'), 'hello'.replace('l', 'L', 1), 'ab'.center(6, '*'), '42'.zfill(5))\nprint('{} is {age}'.format('Ann', age=30), 'title case'.title(), 'x=1'.partition('='))\n",
        );
        assert_eq!(
            out,
            "hello, world ['Hello,', 'World'] ['a', 'b', '', 'c'] x-y\n2 heLlo **ab** 00042\nAnn is 30 Title Case ('x', '=', '1')\n"
        );
    }

    #[test]
    fn test_list_and_dict_methods() {
        let outcome = run(
            "items = [3, 1, 2]\nitems.append(4)\nitems.sort(reverse=True)\nlast = items.pop()\nconfig = {'a': 1}\nconfig.update({'b': 2})\nconfig.setdefault('c', 3)\nkeys = list(config.keys())\nmissing = config.get('z', 'none')\n",
        );
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.variables["items"], json!([4, 3, 2]));
        assert_eq!(outcome.variables["last"], json!(1));
        assert_eq!(outcome.variables["keys"], json!(["a", "b", "c"]));
        assert_eq!(outcome.variables["missing"], json!("none"));
    }

    #[test]
    fn test_integers_beyond_64_bits() {
        let out = output(
            "print(2 ** 100, int('123456789012345678901234567890') + 1, hex(2 ** 70), abs(-2 ** 64))\nprint(round(12345678901234567890123, -5), pow(2 ** 70, 3, 10 ** 9 + 7), int(1e20), float(2 ** 70))\nprint(round(25, -1), round(35, -1), round(-25, -1))\n",
        );
        assert_eq!(
            out,
            "1267650600228229401496703205376 123456789012345678901234567891 0x400000000000000000 18446744073709551616\n12345678901234567900000 431750151 100000000000000000000 1.1805916207174113e+21\n20 40 -20\n"
        );
        let err = run("int('1' * 5000)").result.unwrap_err();
        assert_eq!(err.kind, crate::core::sandbox::value::ExcKind::ValueError);
        assert!(run("int('1' * 5000, 16)").result.is_ok());
    }

    #[test]
    fn test_sets_and_frozensets() {
        let outcome = run(
            "s = {1, 2, 3}\ns.add(4)\ns.discard(10)\nevens = {x % 3 for x in range(10)}\nfrozen = frozenset([1, 2]) & {2, 3}\nprint(s, {1, 2} | {3}, evens, frozen, set(), {1, 2}.issubset([1, 2, 3]))\ns.difference_update([1, 2])\ntaken = s.pop()\nprint(s, taken, len({1, 1, 2}), 2 in {1, 2})\n",
        );
        if let Err(err) = &outcome.result {
            panic!("{}", err);
        }
        assert_eq!(
            outcome.output,
            "{1, 2, 3, 4} {1, 2, 3} {0, 1, 2} frozenset({2}) set() True\n{4} 3 2 True\n"
        );
        assert_eq!(outcome.variables["evens"], json!("{0, 1, 2}"));

        let err = run("s = {1}\ns.remove(5)").result.unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 5");
        let err = run("{[1]}").result.unwrap_err();
        assert_eq!(err.kind, crate::core::sandbox::value::ExcKind::TypeError);
        let err = run("f = frozenset()\nf.add(1)").result.unwrap_err();
        assert_eq!(err.kind, crate::core::sandbox::value::ExcKind::AttributeError);
    }

    #[test]
    fn test_iterators_slices_and_subclass_checks() {
        let out = output(
            "it = iter([1, 2])\nprint(next(it), next(it), next(it, 'done'))\ns = slice(1, None, 2)\nprint(s.start, s.stop, s.step, [0, 1, 2, 3, 4][s])\nprint(issubclass(bool, int), issubclass(KeyError, (ValueError, LookupError)), issubclass(str, int))\nrest = iter(range(5))\nnext(rest)\nprint(list(rest), list(rest))\n",
        );
        assert_eq!(out, "1 2 done\n1 None 2 [1, 3]\nTrue True False\n[1, 2, 3, 4] []\n");
        let err = run("next(iter([]))").result.unwrap_err();
        assert_eq!(err.kind, crate::core::sandbox::value::ExcKind::StopIteration);
        let err = run("next([1])").result.unwrap_err();
        assert_eq!(err.message, "'list' object is not an iterator");
    }

    #[test]
    fn test_input_is_refused() {
        let err = run("name = input('who? ')").result.unwrap_err();
        assert_eq!(err.to_string(), "RuntimeError: Input is not allowed in safe execution mode");
    }

    #[test]
    fn test_type_checks() {
        let out = output("print(isinstance(True, int), isinstance('x', (int, str)), type(1.5), callable(len))\n");
        assert_eq!(out, "True True <class 'float'> True\n");
        let err = run("len(5)").result.unwrap_err();
        assert_eq!(err.message, "object of type 'int' has no len()");
        let err = run("int('abc')").result.unwrap_err();
        assert_eq!(err.message, "invalid literal for int() with base 10: 'abc'");
    }
}
