//! Native modules importable from sandboxed code, and the import hook that
//! guards them.
//!
//! Only `math`, `json`, `random`, `re` and `datetime` exist natively. A name
//! on the configured allow-list without a native implementation fails the
//! way a missing module does.

use std::fmt::Write as _;
use std::rc::Rc;

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::One;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::{Captures, Regex};

use super::builtins::{arity, float_to_integer, no_kwargs, take_kwarg};
use super::format::float_repr;
use super::interp::{no_attribute, Exec, Interpreter};
use super::ops::{self, MAX_ITEMS, MAX_STR_BYTES};
use super::value::{
    str_repr, type_error, value_error, DictMap, ExcKind, Exception, Key, MatchData, Module, NativeFn, Num,
    PatternData, Range, TypeKind, Value,
};

const MATH_FUNCTIONS: &[&str] = &[
    "acos", "asin", "atan", "atan2", "ceil", "comb", "copysign", "cos", "degrees", "exp", "fabs", "factorial",
    "floor", "fmod", "fsum", "gcd", "hypot", "isclose", "isfinite", "isinf", "isnan", "lcm", "log", "log10",
    "log2", "perm", "pow", "prod", "radians", "sin", "sqrt", "tan", "trunc",
];
const JSON_FUNCTIONS: &[&str] = &["dumps", "loads"];
const RANDOM_FUNCTIONS: &[&str] = &[
    "choice", "gauss", "randint", "random", "randrange", "sample", "seed", "shuffle", "uniform",
];
const RE_FUNCTIONS: &[&str] = &[
    "compile", "escape", "findall", "finditer", "fullmatch", "match", "search", "split", "sub",
];

const RE_IGNORECASE: i64 = 2;
const RE_MULTILINE: i64 = 8;
const RE_DOTALL: i64 = 16;
const RE_VERBOSE: i64 = 64;
const RE_ASCII: i64 = 256;

const DATETIME_CLASS_METHODS: &[&str] = &["datetime.fromisoformat", "datetime.now", "datetime.strptime", "datetime.today"];
const DATE_CLASS_METHODS: &[&str] = &["date.fromisoformat", "date.today"];

const DATETIME_METHODS: &[&str] = &["date", "isoformat", "isoweekday", "replace", "strftime", "weekday"];
const DATE_METHODS: &[&str] = &["isoformat", "isoweekday", "replace", "strftime", "weekday"];
const TIMEDELTA_METHODS: &[&str] = &["total_seconds"];
const MATCH_METHODS: &[&str] = &["end", "group", "groupdict", "groups", "span", "start"];
const PATTERN_METHODS: &[&str] = &["findall", "finditer", "fullmatch", "match", "search", "split", "sub"];

fn functions(module: &'static str, names: &'static [&'static str]) -> impl Iterator<Item = (String, Value)> {
    names
        .iter()
        .map(move |name| (name.to_string(), Value::Native(NativeFn { module, name: *name })))
}

fn build_module(name: &str) -> Option<Value> {
    let (name, mut attrs): (&'static str, IndexMap<String, Value>) = match name {
        "math" => ("math", functions("math", MATH_FUNCTIONS).collect()),
        "json" => ("json", functions("json", JSON_FUNCTIONS).collect()),
        "random" => ("random", functions("random", RANDOM_FUNCTIONS).collect()),
        "re" => ("re", functions("re", RE_FUNCTIONS).collect()),
        "datetime" => ("datetime", IndexMap::new()),
        _ => return None,
    };
    match name {
        "math" => {
            attrs.insert("pi".into(), Value::Float(std::f64::consts::PI));
            attrs.insert("e".into(), Value::Float(std::f64::consts::E));
            attrs.insert("tau".into(), Value::Float(std::f64::consts::TAU));
            attrs.insert("inf".into(), Value::Float(f64::INFINITY));
            attrs.insert("nan".into(), Value::Float(f64::NAN));
        }
        "json" => {
            attrs.insert("JSONDecodeError".into(), Value::Type(TypeKind::Exc(ExcKind::ValueError)));
        }
        "re" => {
            for (flag, value) in [
                ("I", RE_IGNORECASE),
                ("IGNORECASE", RE_IGNORECASE),
                ("M", RE_MULTILINE),
                ("MULTILINE", RE_MULTILINE),
                ("S", RE_DOTALL),
                ("DOTALL", RE_DOTALL),
                ("X", RE_VERBOSE),
                ("VERBOSE", RE_VERBOSE),
                ("A", RE_ASCII),
                ("ASCII", RE_ASCII),
            ] {
                attrs.insert(flag.into(), Value::Int(value));
            }
            attrs.insert("error".into(), Value::Type(TypeKind::Exc(ExcKind::ValueError)));
        }
        "datetime" => {
            attrs.insert("datetime".into(), Value::Type(TypeKind::DateTime));
            attrs.insert("date".into(), Value::Type(TypeKind::Date));
            attrs.insert("timedelta".into(), Value::Type(TypeKind::TimeDelta));
            attrs.insert("MINYEAR".into(), Value::Int(1));
            attrs.insert("MAXYEAR".into(), Value::Int(9999));
        }
        _ => {}
    }
    Some(Value::Module(Rc::new(Module {
        name: name.to_string(),
        attrs,
    })))
}

pub(super) fn has_native_method(object: &Value, name: &str) -> bool {
    let table = match object {
        Value::DateTime(_) => DATETIME_METHODS,
        Value::Date(_) => DATE_METHODS,
        Value::TimeDelta(_) => TIMEDELTA_METHODS,
        Value::Match(_) => MATCH_METHODS,
        Value::Pattern(_) => PATTERN_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

fn domain_error() -> Exception {
    value_error("math domain error")
}

/// Applies a float function, mapping NaN and overflow the way `math` does.
fn checked_float(input: f64, result: f64) -> Exec<Value> {
    if result.is_nan() && !input.is_nan() {
        return Err(domain_error());
    }
    if result.is_infinite() && input.is_finite() {
        return Err(Exception::new(ExcKind::OverflowError, "math range error"));
    }
    Ok(Value::Float(result))
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i64
}

fn big_product(values: impl Iterator<Item = i64>) -> Exec<Value> {
    let mut total = BigInt::one();
    for value in values {
        total *= value;
        if total.bits() > ops::MAX_INT_BITS {
            return Err(ops::memory_error());
        }
    }
    Ok(Value::from_bigint(total))
}

fn to_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::Date(date) => Some(date.and_time(NaiveTime::MIN)),
        _ => None,
    }
}

fn strftime(dt: &NaiveDateTime, fmt: &str) -> Exec<String> {
    if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
        return Err(value_error(format!("Invalid format string: {}", str_repr(fmt))));
    }
    let mut out = String::new();
    write!(out, "{}", dt.format(fmt)).map_err(|_| value_error(format!("Invalid format string: {}", str_repr(fmt))))?;
    Ok(out)
}

fn isoformat(dt: &NaiveDateTime, sep: &str) -> String {
    let micros = dt.nanosecond() / 1000;
    let base = format!("{}{}{}", dt.format("%Y-%m-%d"), sep, dt.format("%H:%M:%S"));
    if micros == 0 {
        base
    } else {
        format!("{}.{:06}", base, micros)
    }
}

fn parse_isoformat(text: &str) -> Option<Value> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Value::DateTime(dt));
        }
    }
    None
}

/// Integer fields of a datetime constructor call, positional or keyword.
fn date_fields(
    type_name: &str,
    names: &[&str],
    required: usize,
    args: &[Value],
    mut kwargs: Vec<(String, Value)>,
    defaults: &[i64],
) -> Exec<Vec<i64>> {
    if args.len() > names.len() {
        return Err(type_error(format!(
            "function takes at most {} arguments ({} given)",
            names.len(),
            args.len()
        )));
    }
    let mut fields = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let value = match (args.get(i), take_kwarg(&mut kwargs, name)) {
            (Some(_), Some(_)) => {
                return Err(type_error(format!("argument for {}() given by name ('{}') and position", type_name, name)))
            }
            (Some(v), None) => v.expect_int(name)?,
            (None, Some(v)) => v.expect_int(name)?,
            (None, None) if i < required => {
                return Err(type_error(format!("{}() missing required argument '{}'", type_name, name)))
            }
            (None, None) => defaults[i],
        };
        fields.push(value);
    }
    no_kwargs(type_name, &kwargs)?;
    Ok(fields)
}

fn make_date(fields: &[i64]) -> Exec<NaiveDate> {
    if !(1..=9999).contains(&fields[0]) {
        return Err(value_error(format!("year {} is out of range", fields[0])));
    }
    if !(1..=12).contains(&fields[1]) {
        return Err(value_error("month must be in 1..12"));
    }
    let day = u32::try_from(fields[2]).unwrap_or(0);
    NaiveDate::from_ymd_opt(fields[0] as i32, fields[1] as u32, day)
        .ok_or_else(|| value_error("day is out of range for month"))
}

fn make_datetime(fields: &[i64]) -> Exec<NaiveDateTime> {
    let date = make_date(&fields[..3])?;
    let field = |i: usize, max: i64, what: &str| -> Exec<u32> {
        if (0..max).contains(&fields[i]) {
            Ok(fields[i] as u32)
        } else {
            Err(value_error(format!("{} must be in 0..{}", what, max - 1)))
        }
    };
    let time = NaiveTime::from_hms_micro_opt(
        field(3, 24, "hour")?,
        field(4, 60, "minute")?,
        field(5, 60, "second")?,
        field(6, 1_000_000, "microsecond")?,
    )
    .ok_or_else(|| value_error("invalid time"))?;
    Ok(date.and_time(time))
}

fn datetime_fields(dt: &NaiveDateTime) -> Vec<i64> {
    vec![
        dt.year() as i64,
        dt.month() as i64,
        dt.day() as i64,
        dt.hour() as i64,
        dt.minute() as i64,
        dt.second() as i64,
        (dt.nanosecond() / 1000) as i64,
    ]
}

const DATETIME_FIELDS: &[&str] = &["year", "month", "day", "hour", "minute", "second", "microsecond"];

/// Python `re` flags as an inline group for the `regex` crate.
fn inline_flags(flags: i64) -> String {
    let mut out = String::new();
    for (bit, letter) in [(RE_IGNORECASE, 'i'), (RE_MULTILINE, 'm'), (RE_DOTALL, 's'), (RE_VERBOSE, 'x')] {
        if flags & bit != 0 {
            out.push(letter);
        }
    }
    if out.is_empty() {
        out
    } else {
        format!("(?{})", out)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Anchor {
    Search,
    Start,
    Full,
}

fn build_regex(source: &str, flags: i64, anchor: Anchor) -> Exec<Regex> {
    let flags = inline_flags(flags);
    let pattern = match anchor {
        Anchor::Search => format!("{}{}", flags, source),
        Anchor::Start => format!(r"{}\A(?:{})", flags, source),
        Anchor::Full => format!(r"{}\A(?:{})\z", flags, source),
    };
    Regex::new(&pattern).map_err(|err| value_error(format!("invalid regular expression: {}", err)))
}

fn match_data(regex: &Regex, text: &Rc<str>, caps: &Captures<'_>) -> Value {
    Value::Match(Rc::new(MatchData {
        text: text.clone(),
        groups: (0..caps.len()).map(|i| caps.get(i).map(|m| (m.start(), m.end()))).collect(),
        names: regex.capture_names().map(|n| n.map(String::from)).collect(),
    }))
}

/// Turns a Python replacement template (`\1`, `\g<name>`) into `regex` syntax.
fn replacement_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{}}}", group));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let name: String = chars.by_ref().take_while(|c| *c != '>').collect();
                        out.push_str(&format!("${{{}}}", name));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

fn group_index(data: &MatchData, group: &Value) -> Exec<usize> {
    let index = match group {
        Value::Str(name) => data.group_index(name),
        other => other
            .as_index()
            .and_then(|i| usize::try_from(i).ok())
            .filter(|i| *i < data.groups.len()),
    };
    index.ok_or_else(|| Exception::new(ExcKind::IndexError, "no such group"))
}

fn group_value(data: &MatchData, index: usize, default: &Value) -> Value {
    data.group_text(index).map(Value::str).unwrap_or_else(|| default.clone())
}

/// `json.dumps` rendering with Python's separators and ASCII escaping.
fn dump_json(value: &Value, indent: Option<&str>, sort_keys: bool, level: usize, out: &mut String) -> Exec<()> {
    if level > 200 {
        return Err(value_error("Circular reference detected"));
    }
    if out.len() > MAX_STR_BYTES {
        return Err(ops::memory_error());
    }
    let newline = |out: &mut String, level: usize| {
        if let Some(indent) = indent {
            out.push('\n');
            for _ in 0..level {
                out.push_str(indent);
            }
        }
    };
    let item_sep = if indent.is_some() { "," } else { ", " };
    match value {
        Value::None => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::BigInt(big) => out.push_str(&big.to_string()),
        Value::Float(f) => out.push_str(&json_float(*f)),
        Value::Str(s) => json_string(s, out),
        Value::List(_) | Value::Tuple(_) => {
            let items = match value {
                Value::List(items) => items.borrow().clone(),
                Value::Tuple(items) => items.as_ref().clone(),
                _ => Vec::new(),
            };
            if items.is_empty() {
                out.push_str("[]");
                return Ok(());
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(item_sep);
                }
                newline(out, level + 1);
                dump_json(item, indent, sort_keys, level + 1, out)?;
            }
            newline(out, level);
            out.push(']');
        }
        Value::Dict(map) => {
            let mut entries = Vec::with_capacity(map.borrow().len());
            for (key, item) in map.borrow().iter() {
                let key = match key {
                    Key::Str(s) => s.to_string(),
                    Key::Int(i) => i.to_string(),
                    Key::BigInt(big) => big.to_string(),
                    Key::Bool(b) => (if *b { "true" } else { "false" }).to_string(),
                    Key::None => "null".to_string(),
                    Key::Float(bits) => json_float(f64::from_bits(*bits)),
                    Key::Tuple(_) => {
                        return Err(type_error("keys must be str, int, float, bool or None, not tuple"))
                    }
                };
                entries.push((key, item.clone()));
            }
            if sort_keys {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            if entries.is_empty() {
                out.push_str("{}");
                return Ok(());
            }
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(item_sep);
                }
                newline(out, level + 1);
                json_string(key, out);
                out.push_str(": ");
                dump_json(item, indent, sort_keys, level + 1, out)?;
            }
            newline(out, level);
            out.push('}');
        }
        other => {
            return Err(type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )))
        }
    }
    Ok(())
}

fn json_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        float_repr(f)
    }
}

fn json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || !c.is_ascii() => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

impl Interpreter {
    /// The import hook: allow-list first, then the native module table.
    pub(super) fn import_module(&mut self, name: &str) -> Exec<Value> {
        let root = name.split('.').next().unwrap_or(name);
        if !self.allowed_modules.iter().any(|m| m == name || m == root) {
            return Err(Exception::new(
                ExcKind::ImportError,
                format!("Module '{}' is not allowed in safe mode", name),
            ));
        }
        if let Some(module) = self.modules.get(name) {
            return Ok(module.clone());
        }
        let module = build_module(name).ok_or_else(|| {
            Exception::new(ExcKind::ModuleNotFoundError, format!("No module named '{}'", name))
        })?;
        self.modules.insert(name.to_string(), module.clone());
        Ok(module)
    }

    /// Attributes that are plain data rather than methods.
    pub(super) fn native_attr(&mut self, object: &Value, attr: &str) -> Exec<Option<Value>> {
        let int = |v: u32| Some(Value::Int(v as i64));
        Ok(match (object, attr) {
            (Value::Module(module), _) => module.attrs.get(attr).cloned(),
            (Value::Type(TypeKind::DateTime), _) => class_method(DATETIME_CLASS_METHODS, "datetime", attr),
            (Value::Type(TypeKind::Date), _) => class_method(DATE_CLASS_METHODS, "date", attr),
            (Value::DateTime(dt), "hour") => int(dt.hour()),
            (Value::DateTime(dt), "minute") => int(dt.minute()),
            (Value::DateTime(dt), "second") => int(dt.second()),
            (Value::DateTime(dt), "microsecond") => int(dt.nanosecond() / 1000),
            (Value::DateTime(dt), "year") => Some(Value::Int(dt.year() as i64)),
            (Value::DateTime(dt), "month") => int(dt.month()),
            (Value::DateTime(dt), "day") => int(dt.day()),
            (Value::Date(date), "year") => Some(Value::Int(date.year() as i64)),
            (Value::Date(date), "month") => int(date.month()),
            (Value::Date(date), "day") => int(date.day()),
            (Value::TimeDelta(delta), "days" | "seconds" | "microseconds") => {
                let micros = delta.num_microseconds().ok_or_else(super::value::overflow)?;
                let days = micros.div_euclid(86_400_000_000);
                let rest = micros.rem_euclid(86_400_000_000);
                Some(Value::Int(match attr {
                    "days" => days,
                    "seconds" => rest / 1_000_000,
                    _ => rest % 1_000_000,
                }))
            }
            (Value::Slice(slice), "start" | "stop" | "step") => {
                let bound = match attr {
                    "start" => slice.start,
                    "stop" => slice.stop,
                    _ => slice.step,
                };
                Some(bound.map_or(Value::None, Value::Int))
            }
            (Value::Exception(exc), "args") => Some(if exc.message.is_empty() {
                Value::tuple(Vec::new())
            } else {
                Value::tuple(vec![Value::str(&exc.message)])
            }),
            (Value::Match(data), "string") => Some(Value::Str(data.text.clone())),
            (Value::Pattern(pattern), "pattern") => Some(Value::str(&pattern.source)),
            (Value::Pattern(pattern), "flags") => Some(Value::Int(pattern.flags)),
            (Value::Pattern(pattern), "groups") => Some(Value::Int(pattern.regex.captures_len() as i64 - 1)),
            _ => None,
        })
    }

    pub(super) fn call_native(&mut self, native: NativeFn, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Exec<Value> {
        match native.module {
            "math" => self.call_math(native.name, args, kwargs),
            "json" => self.call_json(native.name, args, kwargs),
            "random" => {
                no_kwargs(native.name, &kwargs)?;
                self.call_random(native.name, args)
            }
            "re" => self.call_re(native.name, args, kwargs),
            "datetime" => self.call_datetime_class(native.name, args, kwargs),
            other => Err(Exception::new(ExcKind::ModuleNotFoundError, format!("No module named '{}'", other))),
        }
    }

    fn call_math(&mut self, name: &str, args: Vec<Value>, mut kwargs: Vec<(String, Value)>) -> Exec<Value> {
        if !matches!(name, "isclose" | "prod") {
            no_kwargs(name, &kwargs)?;
        }
        let float = |i: usize| args[i].expect_float(&format!("{}() argument", name));
        let unary = |f: fn(f64) -> f64| -> Exec<Value> {
            arity(name, &args, 1, 1)?;
            let x = float(0)?;
            checked_float(x, f(x))
        };
        match name {
            "sqrt" => unary(f64::sqrt),
            "exp" => unary(f64::exp),
            "sin" => unary(f64::sin),
            "cos" => unary(f64::cos),
            "tan" => unary(f64::tan),
            "asin" => unary(f64::asin),
            "acos" => unary(f64::acos),
            "atan" => unary(f64::atan),
            "fabs" => unary(f64::abs),
            "degrees" => unary(f64::to_degrees),
            "radians" => unary(f64::to_radians),
            "log10" | "log2" => {
                arity(name, &args, 1, 1)?;
                let x = float(0)?;
                if x <= 0.0 {
                    return Err(domain_error());
                }
                Ok(Value::Float(if name == "log10" { x.log10() } else { x.log2() }))
            }
            "log" => {
                arity(name, &args, 1, 2)?;
                let x = float(0)?;
                if x <= 0.0 {
                    return Err(domain_error());
                }
                match args.get(1) {
                    None => Ok(Value::Float(x.ln())),
                    Some(_) => {
                        let base = float(1)?;
                        if base <= 0.0 || base == 1.0 {
                            return Err(if base == 1.0 {
                                Exception::new(ExcKind::ZeroDivisionError, "float division by zero")
                            } else {
                                domain_error()
                            });
                        }
                        Ok(Value::Float(x.ln() / base.ln()))
                    }
                }
            }
            "pow" => {
                arity(name, &args, 2, 2)?;
                let (x, y) = (float(0)?, float(1)?);
                if x == 0.0 && y < 0.0 {
                    return Err(domain_error());
                }
                checked_float(x, x.powf(y))
            }
            "atan2" | "hypot" | "copysign" | "fmod" => {
                arity(name, &args, 2, 2)?;
                let (x, y) = (float(0)?, float(1)?);
                Ok(Value::Float(match name {
                    "atan2" => x.atan2(y),
                    "hypot" => x.hypot(y),
                    "copysign" => x.copysign(y),
                    _ => {
                        if y == 0.0 {
                            return Err(domain_error());
                        }
                        x % y
                    }
                }))
            }
            "floor" | "ceil" | "trunc" => {
                arity(name, &args, 1, 1)?;
                match args[0].as_num() {
                    _ if matches!(args[0], Value::BigInt(_)) => Ok(args[0].clone()),
                    Some(Num::Int(i)) => Ok(Value::Int(i)),
                    Some(Num::Float(f)) => float_to_integer(match name {
                        "floor" => f.floor(),
                        "ceil" => f.ceil(),
                        _ => f.trunc(),
                    }),
                    None => Err(type_error(format!("must be real number, not {}", args[0].type_name()))),
                }
            }
            "isfinite" | "isinf" | "isnan" => {
                arity(name, &args, 1, 1)?;
                let x = float(0)?;
                Ok(Value::Bool(match name {
                    "isfinite" => x.is_finite(),
                    "isinf" => x.is_infinite(),
                    _ => x.is_nan(),
                }))
            }
            "isclose" => {
                arity(name, &args, 2, 2)?;
                let rel_tol = match take_kwarg(&mut kwargs, "rel_tol") {
                    Some(v) => v.expect_float("rel_tol")?,
                    None => 1e-9,
                };
                let abs_tol = match take_kwarg(&mut kwargs, "abs_tol") {
                    Some(v) => v.expect_float("abs_tol")?,
                    None => 0.0,
                };
                no_kwargs(name, &kwargs)?;
                let (a, b) = (float(0)?, float(1)?);
                if a == b {
                    return Ok(Value::Bool(true));
                }
                let diff = (a - b).abs();
                Ok(Value::Bool(
                    diff <= (rel_tol * b.abs()).max(rel_tol * a.abs()) || diff <= abs_tol,
                ))
            }
            "factorial" => {
                arity(name, &args, 1, 1)?;
                let n = args[0].expect_int("factorial() argument")?;
                if n < 0 {
                    return Err(value_error("factorial() not defined for negative values"));
                }
                big_product(1..=n)
            }
            "comb" | "perm" => {
                arity(name, &args, 1, 2)?;
                let n = args[0].expect_int("n")?;
                let k = match args.get(1) {
                    None | Some(Value::None) if name == "perm" => n,
                    Some(v) => v.expect_int("k")?,
                    None => return Err(type_error("comb() missing required argument 'k'")),
                };
                if n < 0 || k < 0 {
                    return Err(value_error(format!("{} must be a non-negative integer", if n < 0 { "n" } else { "k" })));
                }
                if k > n {
                    return Ok(Value::Int(0));
                }
                if name == "perm" {
                    return big_product(n - k + 1..=n);
                }
                let k = k.min(n - k);
                let mut total = BigInt::one();
                for i in 0..k {
                    total *= n - i;
                    total /= i + 1;
                    if total.bits() > ops::MAX_INT_BITS {
                        return Err(ops::memory_error());
                    }
                }
                Ok(Value::from_bigint(total))
            }
            "gcd" | "lcm" => {
                let mut result = if name == "gcd" { 0 } else { 1 };
                for arg in &args {
                    let n = arg.expect_int(&format!("{}() argument", name))?;
                    result = if name == "gcd" {
                        gcd(result, n)
                    } else if result == 0 || n == 0 {
                        0
                    } else {
                        (result / gcd(result, n))
                            .checked_mul(n)
                            .map(i64::abs)
                            .ok_or_else(super::value::overflow)?
                    };
                }
                Ok(Value::Int(result))
            }
            "fsum" => {
                arity(name, &args, 1, 1)?;
                let mut total = 0.0;
                let mut compensation = 0.0;
                for item in self.collect_value(&args[0])? {
                    let y = item.expect_float("fsum() item")? - compensation;
                    let t = total + y;
                    compensation = (t - total) - y;
                    total = t;
                }
                Ok(Value::Float(total))
            }
            "prod" => {
                arity(name, &args, 1, 1)?;
                let mut total = take_kwarg(&mut kwargs, "start").unwrap_or(Value::Int(1));
                no_kwargs(name, &kwargs)?;
                for item in self.collect_value(&args[0])? {
                    total = ops::binary(super::ast::BinOp::Mul, &total, &item)?;
                }
                Ok(total)
            }
            other => Err(no_attribute(&Value::str("math"), other)),
        }
    }

    fn call_json(&mut self, name: &str, args: Vec<Value>, mut kwargs: Vec<(String, Value)>) -> Exec<Value> {
        match name {
            "dumps" => {
                arity(name, &args, 1, 1)?;
                let indent = match take_kwarg(&mut kwargs, "indent") {
                    None | Some(Value::None) => None,
                    Some(Value::Str(s)) => Some(s.to_string()),
                    Some(v) => Some(" ".repeat(v.expect_int("indent")?.clamp(0, 64) as usize)),
                };
                let sort_keys = take_kwarg(&mut kwargs, "sort_keys").map_or(false, |v| v.truthy());
                take_kwarg(&mut kwargs, "ensure_ascii");
                no_kwargs(name, &kwargs)?;
                let mut out = String::new();
                dump_json(&args[0], indent.as_deref(), sort_keys, 0, &mut out)?;
                Ok(Value::str(out))
            }
            "loads" => {
                arity(name, &args, 1, 1)?;
                no_kwargs(name, &kwargs)?;
                let text = args[0].expect_str("the JSON object")?;
                let json: serde_json::Value =
                    serde_json::from_str(&text).map_err(|err| value_error(err.to_string()))?;
                Ok(Value::from_json(&json))
            }
            other => Err(no_attribute(&Value::str("json"), other)),
        }
    }

    fn call_random(&mut self, name: &str, args: Vec<Value>) -> Exec<Value> {
        match name {
            "random" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::Float(self.rng.gen::<f64>()))
            }
            "uniform" => {
                arity(name, &args, 2, 2)?;
                let (a, b) = (args[0].expect_float("a")?, args[1].expect_float("b")?);
                Ok(Value::Float(a + (b - a) * self.rng.gen::<f64>()))
            }
            "gauss" => {
                arity(name, &args, 0, 2)?;
                let mu = args.first().map_or(Ok(0.0), |v| v.expect_float("mu"))?;
                let sigma = args.get(1).map_or(Ok(1.0), |v| v.expect_float("sigma"))?;
                let u1: f64 = 1.0 - self.rng.gen::<f64>();
                let u2: f64 = self.rng.gen::<f64>();
                let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                Ok(Value::Float(mu + sigma * z))
            }
            "randint" => {
                arity(name, &args, 2, 2)?;
                let (a, b) = (args[0].expect_int("a")?, args[1].expect_int("b")?);
                if a > b {
                    return Err(value_error(format!("empty range for randrange() ({}, {})", a, b + 1)));
                }
                Ok(Value::Int(self.rng.gen_range(a..=b)))
            }
            "randrange" => {
                arity(name, &args, 1, 3)?;
                let ints = args.iter().map(|a| a.expect_int("randrange() argument")).collect::<Exec<Vec<_>>>()?;
                let range = match ints.as_slice() {
                    [stop] => Range { start: 0, stop: *stop, step: 1 },
                    [start, stop] => Range { start: *start, stop: *stop, step: 1 },
                    [start, stop, step] => Range { start: *start, stop: *stop, step: *step },
                    _ => return Err(type_error("randrange expected at most 3 arguments")),
                };
                if range.step == 0 {
                    return Err(value_error("zero step for randrange()"));
                }
                if range.is_empty() {
                    return Err(value_error("empty range for randrange()"));
                }
                let index = self.rng.gen_range(0..range.len());
                range.get(index).map(Value::Int).ok_or_else(super::value::overflow)
            }
            "choice" => {
                arity(name, &args, 1, 1)?;
                let items = self.collect_value(&args[0])?;
                items
                    .choose(&mut self.rng)
                    .cloned()
                    .ok_or_else(|| Exception::new(ExcKind::IndexError, "Cannot choose from an empty sequence"))
            }
            "shuffle" => {
                arity(name, &args, 1, 1)?;
                let Value::List(items) = &args[0] else {
                    return Err(type_error(format!(
                        "'{}' object does not support item assignment",
                        args[0].type_name()
                    )));
                };
                items.borrow_mut().shuffle(&mut self.rng);
                Ok(Value::None)
            }
            "sample" => {
                arity(name, &args, 2, 2)?;
                let items = self.collect_value(&args[0])?;
                let k = args[1].expect_int("k")?;
                if k < 0 || k as usize > items.len() {
                    return Err(value_error("Sample larger than population or is negative"));
                }
                let picked = rand::seq::index::sample(&mut self.rng, items.len(), k as usize);
                Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            "seed" => {
                arity(name, &args, 0, 1)?;
                self.rng = match args.first() {
                    None | Some(Value::None) => rand::rngs::StdRng::from_entropy(),
                    Some(Value::Str(s)) => rand::rngs::StdRng::seed_from_u64(
                        s.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3)),
                    ),
                    Some(value) => match value.as_num() {
                        Some(Num::Int(i)) => rand::rngs::StdRng::seed_from_u64(i.unsigned_abs()),
                        Some(Num::Float(f)) => rand::rngs::StdRng::seed_from_u64(f.to_bits()),
                        None => {
                            return Err(type_error(format!(
                                "The only supported seed types are: None, int, float, str, not {}",
                                value.type_name()
                            )))
                        }
                    },
                };
                Ok(Value::None)
            }
            other => Err(no_attribute(&Value::str("random"), other)),
        }
    }

    fn call_re(&mut self, name: &str, mut args: Vec<Value>, mut kwargs: Vec<(String, Value)>) -> Exec<Value> {
        if name == "escape" {
            arity(name, &args, 1, 1)?;
            no_kwargs(name, &kwargs)?;
            return Ok(Value::str(regex::escape(&args[0].expect_str("pattern")?)));
        }
        if args.is_empty() {
            return Err(type_error(format!("{}() missing required argument 'pattern'", name)));
        }
        let pattern = args.remove(0);
        let flags_position = match name {
            "compile" => 0,
            "sub" => 3,
            "split" => 2,
            _ => 1,
        };
        let flags = match take_kwarg(&mut kwargs, "flags") {
            Some(v) => v.expect_int("flags")?,
            None if args.len() > flags_position => args.remove(flags_position).expect_int("flags")?,
            None => 0,
        };
        let compiled = match &pattern {
            Value::Pattern(compiled) => compiled.clone(),
            other => {
                let source = other.expect_str("first argument")?.to_string();
                let regex = build_regex(&source, flags, Anchor::Search)?;
                Rc::new(PatternData { source, flags, regex })
            }
        };
        if name == "compile" {
            arity(name, &args, 0, 0)?;
            no_kwargs(name, &kwargs)?;
            return Ok(Value::Pattern(compiled));
        }
        self.pattern_method(&compiled, name, args, kwargs)
    }

    fn pattern_method(
        &mut self,
        pattern: &Rc<PatternData>,
        name: &str,
        mut args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        match name {
            "search" | "match" | "fullmatch" => {
                arity(name, &args, 1, 1)?;
                no_kwargs(name, &kwargs)?;
                let text = args[0].expect_str("string")?;
                let anchor = match name {
                    "search" => Anchor::Search,
                    "match" => Anchor::Start,
                    _ => Anchor::Full,
                };
                let regex = if anchor == Anchor::Search {
                    pattern.regex.clone()
                } else {
                    build_regex(&pattern.source, pattern.flags, anchor)?
                };
                Ok(regex
                    .captures(&text)
                    .map_or(Value::None, |caps| match_data(&regex, &text, &caps)))
            }
            "findall" | "finditer" => {
                arity(name, &args, 1, 1)?;
                no_kwargs(name, &kwargs)?;
                let text = args[0].expect_str("string")?;
                let mut out = Vec::new();
                for caps in pattern.regex.captures_iter(&text) {
                    self.tick()?;
                    if out.len() >= MAX_ITEMS {
                        return Err(ops::memory_error());
                    }
                    let text_of = |i: usize| Value::str(caps.get(i).map_or("", |m| m.as_str()));
                    out.push(match (name, caps.len()) {
                        ("finditer", _) => match_data(&pattern.regex, &text, &caps),
                        (_, 1) => text_of(0),
                        (_, 2) => text_of(1),
                        (_, n) => Value::tuple((1..n).map(text_of).collect()),
                    });
                }
                Ok(Value::list(out))
            }
            "sub" => {
                if args.len() < 2 {
                    return Err(type_error("sub() missing required arguments 'repl' and 'string'"));
                }
                let count = match take_kwarg(&mut kwargs, "count") {
                    Some(v) => v.expect_int("count")?,
                    None if args.len() > 2 => args.remove(2).expect_int("count")?,
                    None => 0,
                };
                arity(name, &args, 2, 2)?;
                no_kwargs(name, &kwargs)?;
                let text = args[1].expect_str("string")?;
                let limit = usize::try_from(count).unwrap_or(0);
                match &args[0] {
                    Value::Str(template) => {
                        let template = replacement_template(template);
                        let replaced = pattern.regex.replacen(&text, limit, template.as_str());
                        if replaced.len() > MAX_STR_BYTES {
                            return Err(ops::memory_error());
                        }
                        Ok(Value::str(replaced))
                    }
                    function => {
                        let mut out = String::new();
                        let mut last = 0;
                        for (i, caps) in pattern.regex.captures_iter(&text).enumerate() {
                            if limit != 0 && i >= limit {
                                break;
                            }
                            self.tick()?;
                            let Some(whole) = caps.get(0) else { continue };
                            out.push_str(&text[last..whole.start()]);
                            let matched = match_data(&pattern.regex, &text, &caps);
                            let replacement = self.call(function, vec![matched], Vec::new())?;
                            out.push_str(&replacement.expect_str("replacement")?);
                            last = whole.end();
                            if out.len() > MAX_STR_BYTES {
                                return Err(ops::memory_error());
                            }
                        }
                        out.push_str(&text[last..]);
                        Ok(Value::str(out))
                    }
                }
            }
            "split" => {
                let maxsplit = match take_kwarg(&mut kwargs, "maxsplit") {
                    Some(v) => v.expect_int("maxsplit")?,
                    None if args.len() > 1 => args.remove(1).expect_int("maxsplit")?,
                    None => 0,
                };
                arity(name, &args, 1, 1)?;
                no_kwargs(name, &kwargs)?;
                let text = args[0].expect_str("string")?;
                let mut out = Vec::new();
                let mut last = 0;
                for (i, caps) in pattern.regex.captures_iter(&text).enumerate() {
                    if maxsplit > 0 && i as i64 >= maxsplit {
                        break;
                    }
                    self.tick()?;
                    let Some(whole) = caps.get(0) else { continue };
                    out.push(Value::str(&text[last..whole.start()]));
                    for group in 1..caps.len() {
                        out.push(caps.get(group).map_or(Value::None, |m| Value::str(m.as_str())));
                    }
                    last = whole.end();
                }
                out.push(Value::str(&text[last..]));
                Ok(Value::list(out))
            }
            other => Err(no_attribute(&Value::Pattern(pattern.clone()), other)),
        }
    }

    fn call_datetime_class(&mut self, name: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Exec<Value> {
        no_kwargs(name, &kwargs)?;
        match name {
            "datetime.now" | "datetime.today" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::DateTime(Local::now().naive_local()))
            }
            "date.today" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::Date(Local::now().date_naive()))
            }
            "datetime.strptime" => {
                arity(name, &args, 2, 2)?;
                let text = args[0].expect_str("strptime() argument 1")?;
                let fmt = args[1].expect_str("strptime() argument 2")?;
                NaiveDateTime::parse_from_str(&text, &fmt)
                    .or_else(|_| NaiveDate::parse_from_str(&text, &fmt).map(|d| d.and_time(NaiveTime::MIN)))
                    .map(Value::DateTime)
                    .map_err(|_| {
                        value_error(format!(
                            "time data {} does not match format {}",
                            str_repr(&text),
                            str_repr(&fmt)
                        ))
                    })
            }
            "datetime.fromisoformat" | "date.fromisoformat" => {
                arity(name, &args, 1, 1)?;
                let text = args[0].expect_str("fromisoformat: argument")?;
                let invalid = || value_error(format!("Invalid isoformat string: {}", str_repr(&text)));
                let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d").ok();
                if name == "date.fromisoformat" {
                    return date.map(Value::Date).ok_or_else(invalid);
                }
                date.map(|d| Value::DateTime(d.and_time(NaiveTime::MIN)))
                    .or_else(|| parse_isoformat(&text))
                    .ok_or_else(invalid)
            }
            other => Err(no_attribute(&Value::Type(TypeKind::DateTime), other)),
        }
    }

    /// `datetime(...)`, `date(...)` and `timedelta(...)`.
    pub(super) fn construct_temporal(
        &mut self,
        kind: TypeKind,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        match kind {
            TypeKind::DateTime => {
                let fields = date_fields("datetime", DATETIME_FIELDS, 3, &args, kwargs, &[0, 0, 0, 0, 0, 0, 0])?;
                Ok(Value::DateTime(make_datetime(&fields)?))
            }
            TypeKind::Date => {
                let fields = date_fields("date", &DATETIME_FIELDS[..3], 3, &args, kwargs, &[0, 0, 0])?;
                Ok(Value::Date(make_date(&fields)?))
            }
            _ => {
                const UNITS: &[(&str, f64)] = &[
                    ("days", 86_400_000_000.0),
                    ("seconds", 1_000_000.0),
                    ("microseconds", 1.0),
                    ("milliseconds", 1_000.0),
                    ("minutes", 60_000_000.0),
                    ("hours", 3_600_000_000.0),
                    ("weeks", 604_800_000_000.0),
                ];
                if args.len() > UNITS.len() {
                    return Err(type_error("timedelta takes at most 7 arguments"));
                }
                let mut micros = 0.0;
                for (i, (unit, factor)) in UNITS.iter().enumerate() {
                    let value = match (args.get(i), take_kwarg(&mut kwargs, unit)) {
                        (Some(v), None) => v.expect_float(unit)?,
                        (None, Some(v)) => v.expect_float(unit)?,
                        (Some(_), Some(_)) => {
                            return Err(type_error(format!("argument for timedelta() given by name ('{}') and position", unit)))
                        }
                        (None, None) => continue,
                    };
                    micros += value * factor;
                }
                no_kwargs("timedelta", &kwargs)?;
                let micros = micros.round();
                if !micros.is_finite() || micros.abs() > 999_999_999.0 * 86_400_000_000.0 {
                    return Err(Exception::new(ExcKind::OverflowError, "days out of range"));
                }
                Ok(Value::TimeDelta(Duration::microseconds(micros as i64)))
            }
        }
    }

    /// Methods of datetime, match and pattern objects.
    pub(super) fn call_object_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        match receiver {
            Value::Pattern(pattern) => return self.pattern_method(&pattern.clone(), name, args, kwargs),
            Value::DateTime(_) | Value::Date(_) if name == "replace" => {
                let current = to_datetime(receiver).map(|dt| datetime_fields(&dt)).unwrap_or_default();
                let names = if matches!(receiver, Value::Date(_)) { &DATETIME_FIELDS[..3] } else { DATETIME_FIELDS };
                let fields = date_fields("replace", names, 0, &args, kwargs, &current)?;
                return Ok(match receiver {
                    Value::Date(_) => Value::Date(make_date(&fields)?),
                    _ => Value::DateTime(make_datetime(&fields)?),
                });
            }
            _ => {}
        }
        no_kwargs(name, &kwargs)?;
        match (receiver, name) {
            (Value::DateTime(_) | Value::Date(_), "strftime") => {
                arity(name, &args, 1, 1)?;
                let fmt = args[0].expect_str("format")?;
                let dt = to_datetime(receiver).ok_or_else(|| no_attribute(receiver, name))?;
                Ok(Value::str(strftime(&dt, &fmt)?))
            }
            (Value::DateTime(dt), "isoformat") => {
                arity(name, &args, 0, 1)?;
                let sep = match args.first() {
                    Some(sep) => sep.expect_str("sep")?.to_string(),
                    None => "T".to_string(),
                };
                Ok(Value::str(isoformat(dt, &sep)))
            }
            (Value::Date(date), "isoformat") => {
                arity(name, &args, 0, 0)?;
                Ok(Value::str(date.format("%Y-%m-%d").to_string()))
            }
            (Value::DateTime(dt), "date") => {
                arity(name, &args, 0, 0)?;
                Ok(Value::Date(dt.date()))
            }
            (Value::DateTime(_) | Value::Date(_), "weekday" | "isoweekday") => {
                arity(name, &args, 0, 0)?;
                let dt = to_datetime(receiver).ok_or_else(|| no_attribute(receiver, name))?;
                let monday_based = dt.weekday().num_days_from_monday() as i64;
                Ok(Value::Int(if name == "weekday" { monday_based } else { monday_based + 1 }))
            }
            (Value::TimeDelta(delta), "total_seconds") => {
                arity(name, &args, 0, 0)?;
                let micros = delta.num_microseconds().ok_or_else(super::value::overflow)?;
                Ok(Value::Float(micros as f64 / 1_000_000.0))
            }
            (Value::Match(data), _) => match_method(data, name, &args),
            _ => Err(no_attribute(receiver, name)),
        }
    }
}

fn class_method(table: &'static [&'static str], class: &str, attr: &str) -> Option<Value> {
    table
        .iter()
        .find(|qualified| qualified.strip_prefix(class).and_then(|rest| rest.strip_prefix('.')) == Some(attr))
        .map(|qualified| Value::Native(NativeFn { module: "datetime", name: *qualified }))
}

fn match_method(data: &MatchData, name: &str, args: &[Value]) -> Exec<Value> {
    match name {
        "group" => match args {
            [] => Ok(group_value(data, 0, &Value::None)),
            [group] => Ok(group_value(data, group_index(data, group)?, &Value::None)),
            groups => Ok(Value::tuple(
                groups
                    .iter()
                    .map(|g| group_index(data, g).map(|i| group_value(data, i, &Value::None)))
                    .collect::<Exec<_>>()?,
            )),
        },
        "groups" => {
            arity(name, args, 0, 1)?;
            let default = args.first().cloned().unwrap_or(Value::None);
            Ok(Value::tuple((1..data.groups.len()).map(|i| group_value(data, i, &default)).collect()))
        }
        "groupdict" => {
            arity(name, args, 0, 1)?;
            let default = args.first().cloned().unwrap_or(Value::None);
            let mut map = DictMap::new();
            for (i, group_name) in data.names.iter().enumerate() {
                if let Some(group_name) = group_name {
                    map.insert(Key::Str(Rc::from(group_name.as_str())), group_value(data, i, &default));
                }
            }
            Ok(Value::dict(map))
        }
        "start" | "end" | "span" => {
            arity(name, args, 0, 1)?;
            let index = match args.first() {
                Some(group) => group_index(data, group)?,
                None => 0,
            };
            let (start, end) = match data.groups[index] {
                Some((start, end)) => (data.char_index(start), data.char_index(end)),
                None => (-1, -1),
            };
            Ok(match name {
                "start" => Value::Int(start),
                "end" => Value::Int(end),
                _ => Value::tuple(vec![Value::Int(start), Value::Int(end)]),
            })
        }
        other => Err(Exception::new(
            ExcKind::AttributeError,
            format!("'re.Match' object has no attribute '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::core::sandbox::interp::tests::run;
    use crate::core::sandbox::value::ExcKind;
    use serde_json::json;

    fn output(source: &str) -> String {
        let outcome = run(source);
        if let Err(err) = &outcome.result {
            panic!("{} failed: {}", source, err);
        }
        outcome.output
    }

    #[test]
    fn test_math_module() {
        let out = output(
            "import math\nprint(math.sqrt(16), math.floor(2.7), math.factorial(5), math.gcd(12, 18), round(math.pi, 4))\nfrom math import comb, isclose\nprint(comb(5, 2), isclose(0.1 + 0.2, 0.3))\n",
        );
        assert_eq!(out, "4.0 2 120 6 3.1416\n10 True\n");
        let out = output("import math\nprint(math.factorial(25), math.comb(100, 50), math.floor(1e20), math.perm(25) == math.factorial(25))\n");
        assert_eq!(
            out,
            "15511210043330985984000000 100891344545564193334812497256 100000000000000000000 True\n"
        );
        let err = run("import math\nmath.sqrt(-1)").result.unwrap_err();
        assert_eq!(err.to_string(), "ValueError: math domain error");
    }

    #[test]
    fn test_json_module() {
        let out = output(
            "import json\ndata = json.loads('{\"b\": [1, 2.5, null], \"a\": true}')\nprint(data['b'], data['a'])\nprint(json.dumps({'x': (1, 'é'), 'y': None}))\nprint(json.dumps([1, {'k': 2}], indent=2))\n",
        );
        assert_eq!(
            out,
            "[1, 2.5, None] True\n{\"x\": [1, \"\\u00e9\"], \"y\": null}\n[\n  1,\n  {\n    \"k\": 2\n  }\n]\n"
        );
        let err = run("import json\njson.dumps(len)").result.unwrap_err();
        assert_eq!(err.message, "Object of type builtin_function_or_method is not JSON serializable");
    }

    #[test]
    fn test_random_module_is_seedable() {
        let first = run("import random\nrandom.seed(7)\nvalues = [random.randint(1, 100) for _ in range(5)]\n");
        let second = run("import random\nrandom.seed(7)\nvalues = [random.randint(1, 100) for _ in range(5)]\n");
        assert_eq!(first.variables["values"], second.variables["values"]);
        let outcome = run("import random\nitems = [1, 2, 3]\nrandom.shuffle(items)\npick = random.choice(items)\n");
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.variables["items"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn test_re_module() {
        let out = output(
            "import re\nm = re.search(r'(?P<word>\\w+)@(\\w+)', 'mail bob@example now')\nprint(m.group(), m.group('word'), m.groups(), m.span())\nprint(re.findall(r'\\d+', 'a1b22c333'), re.sub(r'(\\w)(\\d)', r'\\2\\1', 'a1 b2'))\nprint(re.match('b', 'abc'), re.split(r'[,;]\\s*', 'x, y;z'), bool(re.fullmatch('[a-c]+', 'abc')))\n",
        );
        assert_eq!(
            out,
            "bob@example bob ('bob', 'example') (5, 16)\n['1', '22', '333'] 1a 2b\nNone ['x', 'y', 'z'] True\n"
        );
        let out = output("import re\np = re.compile('HELLO', re.I)\nprint(p.sub(lambda m: m.group().lower(), 'say Hello'))\n");
        assert_eq!(out, "say hello\n");
    }

    #[test]
    fn test_datetime_module() {
        let out = output(
            "from datetime import datetime, date, timedelta\nd = datetime(2024, 1, 31, 9, 5)\nlater = d + timedelta(days=1, hours=2)\nprint(later, later.strftime('%Y/%m/%d'), later.weekday())\nprint(date(2024, 3, 1) - date(2024, 2, 1), timedelta(hours=36).total_seconds())\nprint(datetime.strptime('2024-05-06', '%Y-%m-%d').isoformat())\n",
        );
        assert_eq!(
            out,
            "2024-02-01 11:05:00 2024/02/01 3\n29 days, 0:00:00 129600.0\n2024-05-06T00:00:00\n"
        );
        let err = run("import datetime\ndatetime.date(2023, 2, 30)").result.unwrap_err();
        assert_eq!(err.message, "day is out of range for month");
    }

    #[test]
    fn test_temporal_arguments_by_name_or_position() {
        let out = output(
            "from datetime import date, timedelta\nprint(date(year=2024, month=2, day=3), date(2024, 2, day=4))\nprint(timedelta(1, 30), timedelta(seconds=90))\n",
        );
        assert_eq!(out, "2024-02-03 2024-02-04\n1 day, 0:00:30 0:01:30\n");
        let err = run("import datetime\ndatetime.date(2024, year=2024)").result.unwrap_err();
        assert_eq!(err.kind, ExcKind::TypeError);
        assert!(err.message.contains("given by name ('year') and position"), "{}", err.message);
    }

    #[test]
    fn test_import_hook() {
        let err = run("import socket").result.unwrap_err();
        assert_eq!(err.kind, ExcKind::ImportError);
        assert_eq!(err.message, "Module 'socket' is not allowed in safe mode");
        let err = run("import os").result.unwrap_err();
        assert_eq!(err.kind, ExcKind::ModuleNotFoundError);
        let err = run("from math import nope").result.unwrap_err();
        assert_eq!(err.message, "cannot import name 'nope' from 'math'");
        let outcome = run("import math as m\nvalue = m.floor(3.5)\n");
        assert_eq!(outcome.variables["value"], json!(3));
    }
}
