//! Operators, indexing and slicing over sandbox values.

use std::rc::Rc;

use chrono::Duration;
use num_bigint::BigInt;
use num_traits::{Pow, Signed, ToPrimitive, Zero};

use super::ast::{BinOp, UnaryOp};
use super::format::percent_format;
use super::value::{overflow, type_error, value_error, ExcKind, Exception, Key, Num, SetItems, Value};

/// Largest list, tuple or dict a snippet may build.
pub const MAX_ITEMS: usize = 10_000_000;
/// Largest string a snippet may build.
pub const MAX_STR_BYTES: usize = 64 * 1024 * 1024;
/// Widest integer a snippet may build, in bits.
pub const MAX_INT_BITS: u64 = 1 << 22;

type OpResult = Result<Value, Exception>;

pub fn memory_error() -> Exception {
    Exception::new(ExcKind::MemoryError, "result too large")
}

fn zero_division(message: &str) -> Exception {
    Exception::new(ExcKind::ZeroDivisionError, message)
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> Exception {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

pub fn binary(op: BinOp, left: &Value, right: &Value) -> OpResult {
    if matches!(left, Value::BigInt(_)) || matches!(right, Value::BigInt(_)) {
        if let Some(result) = big_binary(op, left, right) {
            return result;
        }
    }
    if let (Some(a), Some(b)) = (left.as_num(), right.as_num()) {
        if matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::LShift | BinOp::RShift) {
            return bitwise(op, left, right);
        }
        return arithmetic(op, a, b);
    }

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            if a.len() + b.len() > MAX_STR_BYTES {
                return Err(memory_error());
            }
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Ok(Value::str(joined))
        }
        (BinOp::Add, Value::Str(_), other) => Err(type_error(format!(
            "can only concatenate str (not \"{}\") to str",
            other.type_name()
        ))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            check_items(items.len())?;
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::List(_), other) => Err(type_error(format!(
            "can only concatenate list (not \"{}\") to list",
            other.type_name()
        ))),
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            check_items(items.len())?;
            Ok(Value::tuple(items))
        }
        (BinOp::Mul, Value::Str(_) | Value::List(_) | Value::Tuple(_), count)
            if count.as_index().is_some() =>
        {
            repeat(left, count.as_index().unwrap_or(0))
        }
        (BinOp::Mul, count, Value::Str(_) | Value::List(_) | Value::Tuple(_))
            if count.as_index().is_some() =>
        {
            repeat(right, count.as_index().unwrap_or(0))
        }
        (BinOp::Mod, Value::Str(template), args) => Ok(Value::str(percent_format(template, args)?)),
        (
            BinOp::BitOr | BinOp::BitAnd | BinOp::Sub | BinOp::BitXor,
            Value::Set(_) | Value::FrozenSet(_),
            Value::Set(_) | Value::FrozenSet(_),
        ) => {
            let items = left
                .with_set(|a| right.with_set(|b| set_algebra(op, a, b)))
                .flatten()
                .unwrap_or_default();
            Ok(match left {
                Value::FrozenSet(_) => Value::FrozenSet(Rc::new(items)),
                _ => Value::set(items),
            })
        }
        _ => temporal(op, left, right),
    }
}

/// `|`, `&`, `-` and `^` over set members; insertion order follows `a`.
pub fn set_algebra(op: BinOp, a: &SetItems, b: &SetItems) -> SetItems {
    match op {
        BinOp::BitOr => a.union(b).cloned().collect(),
        BinOp::BitAnd => a.intersection(b).cloned().collect(),
        BinOp::Sub => a.difference(b).cloned().collect(),
        _ => a.symmetric_difference(b).cloned().collect(),
    }
}

/// Arithmetic with a big integer on either side. `None` when the other
/// operand is not a number, so sequence and temporal rules still apply.
fn big_binary(op: BinOp, left: &Value, right: &Value) -> Option<OpResult> {
    if let (Some(a), Some(b)) = (left.as_bigint(), right.as_bigint()) {
        return Some(big_integer(op, a, b));
    }
    if left.as_f64().is_none() || right.as_f64().is_none() {
        return None;
    }
    if matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::LShift | BinOp::RShift) {
        return Some(Err(unsupported(op, left, right)));
    }
    let floats = left
        .expect_float("operand")
        .and_then(|a| Ok((a, right.expect_float("operand")?)));
    Some(floats.and_then(|(a, b)| arithmetic(op, Num::Float(a), Num::Float(b))))
}

fn big_integer(op: BinOp, a: BigInt, b: BigInt) -> OpResult {
    let shift_count = |b: &BigInt| -> Result<u64, Exception> {
        if b.is_negative() {
            return Err(value_error("negative shift count"));
        }
        Ok(b.to_u64().unwrap_or(u64::MAX))
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => {
            if a.bits() + b.bits() > MAX_INT_BITS {
                return Err(memory_error());
            }
            a * b
        }
        BinOp::Div => {
            if b.is_zero() {
                return Err(zero_division("division by zero"));
            }
            return true_divide(&a, &b);
        }
        BinOp::FloorDiv | BinOp::Mod => {
            if b.is_zero() {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let (quotient, remainder) = big_div_mod(&a, &b);
            if matches!(op, BinOp::FloorDiv) {
                quotient
            } else {
                remainder
            }
        }
        BinOp::Pow => return big_pow(&a, &b),
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::LShift => {
            let count = shift_count(&b)?;
            if a.is_zero() {
                a
            } else if a.bits().saturating_add(count) > MAX_INT_BITS {
                return Err(memory_error());
            } else {
                a << count as usize
            }
        }
        BinOp::RShift => {
            let count = shift_count(&b)?;
            if count >= a.bits() {
                BigInt::from(if a.is_negative() { -1 } else { 0 })
            } else {
                a >> count as usize
            }
        }
    };
    Ok(Value::from_bigint(result))
}

/// Floor division and modulo with Python's sign rules.
pub(super) fn big_div_mod(a: &BigInt, b: &BigInt) -> (BigInt, BigInt) {
    let mut quotient = a / b;
    let mut remainder = a % b;
    if !remainder.is_zero() && remainder.is_negative() != b.is_negative() {
        quotient -= BigInt::from(1);
        remainder += b;
    }
    (quotient, remainder)
}

fn true_divide(a: &BigInt, b: &BigInt) -> OpResult {
    if let (Some(x), Some(y)) = (a.to_f64(), b.to_f64()) {
        if x.is_finite() && y.is_finite() {
            return Ok(Value::Float(x / y));
        }
    }
    // Scale both operands into float range; the ratio survives.
    let shift = a.bits().max(b.bits()).saturating_sub(1000) as usize;
    let x = (a >> shift).to_f64().unwrap_or(f64::INFINITY);
    let y = (b >> shift).to_f64().unwrap_or(f64::INFINITY);
    let result = x / y;
    if !result.is_finite() {
        return Err(Exception::new(
            ExcKind::OverflowError,
            "integer division result too large for a float",
        ));
    }
    Ok(Value::Float(result))
}

fn big_pow(base: &BigInt, exponent: &BigInt) -> OpResult {
    if exponent.is_negative() {
        if base.is_zero() {
            return Err(zero_division("0.0 cannot be raised to a negative power"));
        }
        let base = base.to_f64().unwrap_or(f64::INFINITY);
        return float_pow(base, exponent.to_f64().unwrap_or(f64::NEG_INFINITY));
    }
    if exponent.is_zero() {
        return Ok(Value::Int(1));
    }
    if base.is_zero() || *base == BigInt::from(1) {
        return Ok(Value::from_bigint(base.clone()));
    }
    if *base == BigInt::from(-1) {
        let even = (exponent % BigInt::from(2)).is_zero();
        return Ok(Value::Int(if even { 1 } else { -1 }));
    }
    let exponent = exponent
        .to_u32()
        .filter(|e| base.bits().saturating_mul(u64::from(*e)) <= MAX_INT_BITS)
        .ok_or_else(memory_error)?;
    Ok(Value::from_bigint(Pow::pow(base, exponent)))
}

fn check_items(len: usize) -> Result<(), Exception> {
    if len > MAX_ITEMS {
        Err(memory_error())
    } else {
        Ok(())
    }
}

fn repeat(sequence: &Value, count: i64) -> OpResult {
    let count = usize::try_from(count).unwrap_or(0);
    match sequence {
        Value::Str(s) => {
            if s.len().saturating_mul(count) > MAX_STR_BYTES {
                return Err(memory_error());
            }
            Ok(Value::str(s.repeat(count)))
        }
        Value::List(items) => {
            let items = items.borrow();
            check_items(items.len().saturating_mul(count))?;
            Ok(Value::list(repeat_items(&items, count)))
        }
        Value::Tuple(items) => {
            check_items(items.len().saturating_mul(count))?;
            Ok(Value::tuple(repeat_items(items, count)))
        }
        other => Err(type_error(format!("can't multiply sequence of type '{}'", other.type_name()))),
    }
}

fn repeat_items(items: &[Value], count: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend(items.iter().cloned());
    }
    out
}

fn arithmetic(op: BinOp, a: Num, b: Num) -> OpResult {
    if let (Num::Int(a), Num::Int(b)) = (a, b) {
        return integer(op, a, b);
    }
    let (a, b) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo by zero"));
            }
            float_mod(a, b)
        }
        BinOp::Pow => return float_pow(a, b),
        _ => return Err(unsupported(op, &Value::Float(a), &Value::Float(b))),
    };
    Ok(Value::Float(result))
}

fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else if r == 0.0 {
        0.0f64.copysign(b)
    } else {
        r
    }
}

fn float_pow(a: f64, b: f64) -> OpResult {
    if a == 0.0 && b < 0.0 {
        return Err(zero_division("0.0 cannot be raised to a negative power"));
    }
    if a < 0.0 && b.fract() != 0.0 {
        return Err(value_error("negative number cannot be raised to a fractional power"));
    }
    let result = a.powf(b);
    if result.is_infinite() && a.is_finite() && b.is_finite() {
        return Err(Exception::new(ExcKind::OverflowError, "Numerical result out of range"));
    }
    Ok(Value::Float(result))
}

fn integer(op: BinOp, a: i64, b: i64) -> OpResult {
    let result = match op {
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
            floor_div(a, b)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            Some(floor_mod(a, b))
        }
        BinOp::Pow => return integer_pow(a, b),
        _ => return Err(unsupported(op, &Value::Int(a), &Value::Int(b))),
    };
    match result {
        Some(value) => Ok(Value::Int(value)),
        None => big_integer(op, BigInt::from(a), BigInt::from(b)),
    }
}

pub fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

pub fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.checked_rem(b).unwrap_or(0);
    if r != 0 && ((r < 0) != (b < 0)) {
        r + b
    } else {
        r
    }
}

fn integer_pow(base: i64, exponent: i64) -> OpResult {
    if exponent < 0 {
        if base == 0 {
            return Err(zero_division("0.0 cannot be raised to a negative power"));
        }
        return Ok(Value::Float((base as f64).powf(exponent as f64)));
    }
    match u32::try_from(exponent).ok().and_then(|e| base.checked_pow(e)) {
        Some(value) => Ok(Value::Int(value)),
        None => big_pow(&BigInt::from(base), &BigInt::from(exponent)),
    }
}

fn bitwise(op: BinOp, left: &Value, right: &Value) -> OpResult {
    let (Some(a), Some(b)) = (left.as_index(), right.as_index()) else {
        return Err(unsupported(op, left, right));
    };
    let both_bool = matches!((left, right), (Value::Bool(_), Value::Bool(_)));
    let result = match op {
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::LShift => {
            if b < 0 {
                return Err(value_error("negative shift count"));
            }
            if a == 0 {
                0
            } else if b >= 63 || (a << b) >> b != a {
                return big_integer(op, BigInt::from(a), BigInt::from(b));
            } else {
                a << b
            }
        }
        BinOp::RShift => {
            if b < 0 {
                return Err(value_error("negative shift count"));
            }
            if b >= 64 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            }
        }
        _ => return Err(unsupported(op, left, right)),
    };
    if both_bool && matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor) {
        Ok(Value::Bool(result != 0))
    } else {
        Ok(Value::Int(result))
    }
}

fn micros(delta: &Duration) -> Result<i64, Exception> {
    delta.num_microseconds().ok_or_else(overflow)
}

fn temporal(op: BinOp, left: &Value, right: &Value) -> OpResult {
    let out_of_range = || Exception::new(ExcKind::OverflowError, "date value out of range");
    match (op, left, right) {
        (BinOp::Add, Value::DateTime(dt), Value::TimeDelta(d)) | (BinOp::Add, Value::TimeDelta(d), Value::DateTime(dt)) => {
            dt.checked_add_signed(*d).map(Value::DateTime).ok_or_else(out_of_range)
        }
        (BinOp::Add, Value::Date(date), Value::TimeDelta(d)) | (BinOp::Add, Value::TimeDelta(d), Value::Date(date)) => {
            date.checked_add_signed(Duration::days(d.num_days()))
                .map(Value::Date)
                .ok_or_else(out_of_range)
        }
        (BinOp::Add, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            a.checked_add(b).map(Value::TimeDelta).ok_or_else(overflow)
        }
        (BinOp::Sub, Value::DateTime(a), Value::DateTime(b)) => Ok(Value::TimeDelta(a.signed_duration_since(*b))),
        (BinOp::Sub, Value::Date(a), Value::Date(b)) => Ok(Value::TimeDelta(a.signed_duration_since(*b))),
        (BinOp::Sub, Value::DateTime(dt), Value::TimeDelta(d)) => {
            dt.checked_sub_signed(*d).map(Value::DateTime).ok_or_else(out_of_range)
        }
        (BinOp::Sub, Value::Date(date), Value::TimeDelta(d)) => date
            .checked_sub_signed(Duration::days(d.num_days()))
            .map(Value::Date)
            .ok_or_else(out_of_range),
        (BinOp::Sub, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            a.checked_sub(b).map(Value::TimeDelta).ok_or_else(overflow)
        }
        (BinOp::Mul, Value::TimeDelta(d), n) | (BinOp::Mul, n, Value::TimeDelta(d)) if n.as_num().is_some() => {
            let factor = n.as_num().map_or(0.0, Num::as_f64);
            let scaled = micros(d)? as f64 * factor;
            if !scaled.is_finite() || scaled.abs() > i64::MAX as f64 {
                return Err(overflow());
            }
            Ok(Value::TimeDelta(Duration::microseconds(scaled.round() as i64)))
        }
        (BinOp::Div, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            let divisor = micros(b)?;
            if divisor == 0 {
                return Err(zero_division("division by zero"));
            }
            Ok(Value::Float(micros(a)? as f64 / divisor as f64))
        }
        (BinOp::Div, Value::TimeDelta(d), n) if n.as_num().is_some() => {
            let divisor = n.as_num().map_or(0.0, Num::as_f64);
            if divisor == 0.0 {
                return Err(zero_division("division by zero"));
            }
            Ok(Value::TimeDelta(Duration::microseconds(
                (micros(d)? as f64 / divisor).round() as i64,
            )))
        }
        _ => Err(unsupported(op, left, right)),
    }
}

pub fn unary(op: UnaryOp, operand: &Value) -> OpResult {
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, Value::TimeDelta(d)) => Ok(Value::TimeDelta(-*d)),
        (UnaryOp::Neg, Value::BigInt(big)) => Ok(Value::from_bigint(-big.as_ref())),
        (UnaryOp::Pos, Value::BigInt(_)) => Ok(operand.clone()),
        (UnaryOp::Invert, Value::BigInt(big)) => Ok(Value::from_bigint(-big.as_ref() - BigInt::from(1))),
        (UnaryOp::Neg, value) if value.as_index().is_some() => {
            let i = value.as_index().unwrap_or(0);
            Ok(i.checked_neg().map_or_else(|| Value::from_bigint(-BigInt::from(i)), Value::Int))
        }
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, Value::TimeDelta(d)) => Ok(Value::TimeDelta(*d)),
        (UnaryOp::Pos, value) if value.as_index().is_some() => Ok(Value::Int(value.as_index().unwrap_or(0))),
        (UnaryOp::Invert, value) if value.as_index().is_some() => Ok(Value::Int(!value.as_index().unwrap_or(0))),
        (op, value) => {
            let symbol = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                UnaryOp::Invert => "~",
                UnaryOp::Not => "not",
            };
            Err(type_error(format!(
                "bad operand type for unary {}: '{}'",
                symbol,
                value.type_name()
            )))
        }
    }
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, Exception> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.equals(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.equals(item))),
        Value::Dict(map) => Ok(map.borrow().contains_key(&Key::from_value(item)?)),
        Value::Set(_) | Value::FrozenSet(_) => {
            let key = Key::from_value(item)?;
            Ok(container.with_set(|items| items.contains(&key)).unwrap_or(false))
        }
        Value::Range(range) => {
            let Some(n) = item.as_num() else { return Ok(false) };
            let n = match n {
                Num::Int(i) => i,
                Num::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e18 => f as i64,
                Num::Float(_) => return Ok(false),
            };
            let (start, stop, step) = (range.start as i128, range.stop as i128, range.step as i128);
            let n = n as i128;
            let inside = if step > 0 { start <= n && n < stop } else { stop < n && n <= start };
            Ok(inside && (n - start) % step == 0)
        }
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn normalize(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        Some(index as usize)
    } else {
        None
    }
}

fn index_of(index: &Value, container: &Value) -> Result<i64, Exception> {
    index.as_index().ok_or_else(|| {
        type_error(format!(
            "{} indices must be integers or slices, not {}",
            container.type_name(),
            index.type_name()
        ))
    })
}

fn index_error(what: &str) -> Exception {
    Exception::new(ExcKind::IndexError, format!("{} index out of range", what))
}

pub fn key_error(key: &Value) -> Exception {
    Exception::new(ExcKind::KeyError, key.repr())
}

pub fn get_item(container: &Value, index: &Value) -> OpResult {
    if let Value::Slice(slice) = index {
        let indices = slice_indices(sequence_len(container)?, slice.start, slice.stop, slice.step)?;
        return get_slice(container, &indices);
    }
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let i = index_of(index, container)?;
            normalize(i, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| index_error("list"))
        }
        Value::Tuple(items) => {
            let i = index_of(index, container)?;
            normalize(i, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| index_error("tuple"))
        }
        Value::Str(s) => {
            let i = index_of(index, container)?;
            let len = s.chars().count();
            normalize(i, len)
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(|| index_error("string"))
        }
        Value::Range(range) => {
            let i = index_of(index, container)?;
            normalize(i, range.len())
                .and_then(|i| range.get(i))
                .map(Value::Int)
                .ok_or_else(|| index_error("range object"))
        }
        Value::Dict(map) => map
            .borrow()
            .get(&Key::from_value(index)?)
            .cloned()
            .ok_or_else(|| key_error(index)),
        Value::Match(data) => {
            let group = match index {
                Value::Str(name) => data.group_index(name),
                other => other.as_index().and_then(|i| usize::try_from(i).ok()),
            };
            match group {
                Some(g) if g < data.groups.len() => Ok(data.group_text(g).map_or(Value::None, Value::str)),
                _ => Err(Exception::new(ExcKind::IndexError, "no such group")),
            }
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// Positions selected by a slice over a sequence of `len` items.
pub fn slice_indices(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, Exception> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let mut indices = Vec::new();
    if step > 0 {
        let clamp = |v: i64| if v < 0 { (v + len).max(0) } else { v.min(len) };
        let start = lower.map_or(0, clamp);
        let stop = upper.map_or(len, clamp);
        let mut i = start;
        while i < stop {
            indices.push(i as usize);
            i += step;
        }
    } else {
        let clamp = |v: i64| if v < 0 { (v + len).max(-1) } else { v.min(len - 1) };
        let start = lower.map_or(len - 1, clamp);
        let stop = upper.map_or(-1, clamp);
        let mut i = start;
        while i > stop {
            indices.push(i as usize);
            i += step;
        }
    }
    Ok(indices)
}

pub fn get_slice(container: &Value, indices: &[usize]) -> OpResult {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            Ok(Value::list(indices.iter().map(|&i| items[i].clone()).collect()))
        }
        Value::Tuple(items) => Ok(Value::tuple(indices.iter().map(|&i| items[i].clone()).collect())),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::str(indices.iter().map(|&i| chars[i]).collect::<String>()))
        }
        Value::Range(range) => Ok(Value::list(
            indices
                .iter()
                .filter_map(|&i| range.get(i))
                .map(Value::Int)
                .collect(),
        )),
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn sequence_len(container: &Value) -> Result<usize, Exception> {
    container.len().ok_or_else(|| {
        type_error(format!(
            "'{}' object is not subscriptable",
            container.type_name()
        ))
    })
}

fn immutable(container: &Value) -> Exception {
    type_error(format!(
        "'{}' object does not support item assignment",
        container.type_name()
    ))
}

pub fn set_item(container: &Value, index: &Value, value: Value) -> Result<(), Exception> {
    if let Value::Slice(slice) = index {
        let replacement = value.iter()?.collect();
        return set_slice(container, slice.start, slice.stop, slice.step, replacement);
    }
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = index_of(index, container)?;
            let i = normalize(i, items.len())
                .ok_or_else(|| Exception::new(ExcKind::IndexError, "list assignment index out of range"))?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(map) => {
            let key = Key::from_value(index)?;
            let mut map = map.borrow_mut();
            if !map.contains_key(&key) && map.len() >= MAX_ITEMS {
                return Err(memory_error());
            }
            map.insert(key, value);
            Ok(())
        }
        other => Err(immutable(other)),
    }
}

/// `items[lower:upper:step] = value` on a list.
pub fn set_slice(
    container: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
    replacement: Vec<Value>,
) -> Result<(), Exception> {
    let Value::List(items) = container else {
        return Err(immutable(container));
    };
    let len = items.borrow().len();
    if step.unwrap_or(1) == 1 {
        let indices = slice_indices(len, lower, upper, None)?;
        let start = match (indices.first(), lower) {
            (Some(&first), _) => first,
            (None, Some(l)) => {
                let l = if l < 0 { (l + len as i64).max(0) } else { l.min(len as i64) };
                l as usize
            }
            (None, None) => 0,
        };
        let end = start + indices.len();
        let mut items = items.borrow_mut();
        check_items(items.len() - indices.len() + replacement.len())?;
        items.splice(start..end, replacement);
        return Ok(());
    }

    let indices = slice_indices(len, lower, upper, step)?;
    if indices.len() != replacement.len() {
        return Err(value_error(format!(
            "attempt to assign sequence of size {} to extended slice of size {}",
            replacement.len(),
            indices.len()
        )));
    }
    let mut items = items.borrow_mut();
    for (i, value) in indices.into_iter().zip(replacement) {
        items[i] = value;
    }
    Ok(())
}

pub fn del_item(container: &Value, index: &Value) -> Result<(), Exception> {
    if let Value::Slice(slice) = index {
        let indices = slice_indices(sequence_len(container)?, slice.start, slice.stop, slice.step)?;
        return del_slice(container, indices);
    }
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = index_of(index, container)?;
            let i = normalize(i, items.len())
                .ok_or_else(|| Exception::new(ExcKind::IndexError, "list assignment index out of range"))?;
            items.remove(i);
            Ok(())
        }
        Value::Dict(map) => {
            let key = Key::from_value(index)?;
            map.borrow_mut()
                .shift_remove(&key)
                .map(|_| ())
                .ok_or_else(|| key_error(index))
        }
        other => Err(type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

pub fn del_slice(container: &Value, indices: Vec<usize>) -> Result<(), Exception> {
    let Value::List(items) = container else {
        return Err(type_error(format!(
            "'{}' object doesn't support item deletion",
            container.type_name()
        )));
    };
    let mut indices = indices;
    indices.sort_unstable_by(|a, b| b.cmp(a));
    let mut items = items.borrow_mut();
    for i in indices {
        items.remove(i);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sandbox::value::Range;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn test_integer_semantics() {
        assert_eq!(binary(BinOp::FloorDiv, &int(-7), &int(2)).unwrap().repr(), "-4");
        assert_eq!(binary(BinOp::Mod, &int(-7), &int(2)).unwrap().repr(), "1");
        assert_eq!(binary(BinOp::Div, &int(7), &int(2)).unwrap().repr(), "3.5");
        assert_eq!(binary(BinOp::Pow, &int(2), &int(-1)).unwrap().repr(), "0.5");
        assert_eq!(binary(BinOp::Add, &Value::Bool(true), &Value::Bool(true)).unwrap().repr(), "2");
        let err = binary(BinOp::Mod, &int(1), &int(0)).unwrap_err();
        assert_eq!(err.message, "integer division or modulo by zero");
    }

    #[test]
    fn test_integers_grow_past_64_bits() {
        let big = binary(BinOp::Mul, &int(i64::MAX), &int(2)).unwrap();
        assert_eq!(big.repr(), "18446744073709551614");
        assert_eq!(binary(BinOp::Pow, &int(2), &int(100)).unwrap().repr(), "1267650600228229401496703205376");
        assert_eq!(binary(BinOp::LShift, &int(1), &int(64)).unwrap().repr(), "18446744073709551616");
        assert_eq!(unary(UnaryOp::Neg, &int(i64::MIN)).unwrap().repr(), "9223372036854775808");

        // Results that fit again come back as plain ints.
        let back = binary(BinOp::FloorDiv, &big, &int(2)).unwrap();
        assert!(matches!(back, Value::Int(i64::MAX)));
        let below = binary(BinOp::Sub, &unary(UnaryOp::Neg, &big).unwrap(), &int(1)).unwrap();
        assert_eq!(binary(BinOp::Mod, &below, &int(7)).unwrap().repr(), "6");
        assert_eq!(binary(BinOp::Div, &big, &int(4)).unwrap().repr(), "4.611686018427388e+18");
        assert_eq!(big.compare(&Value::Float(1e30), "<").unwrap(), Some(std::cmp::Ordering::Less));

        let err = binary(BinOp::Pow, &int(10), &int(10_000_000)).unwrap_err();
        assert_eq!(err.kind, ExcKind::MemoryError);
    }

    #[test]
    fn test_set_operators() {
        let set = |items: &[i64]| Value::set(items.iter().map(|i| Key::Int(*i)).collect());
        let (a, b) = (set(&[1, 2, 3]), set(&[2, 3, 4]));
        assert_eq!(binary(BinOp::BitOr, &a, &b).unwrap().repr(), "{1, 2, 3, 4}");
        assert_eq!(binary(BinOp::BitAnd, &a, &b).unwrap().repr(), "{2, 3}");
        assert_eq!(binary(BinOp::Sub, &a, &b).unwrap().repr(), "{1}");
        assert_eq!(binary(BinOp::BitXor, &a, &b).unwrap().repr(), "{1, 4}");
        assert!(contains(&a, &int(2)).unwrap());
        assert!(contains(&a, &Value::list(vec![])).is_err());
    }

    #[test]
    fn test_float_modulo_follows_divisor_sign() {
        assert_eq!(binary(BinOp::Mod, &Value::Float(-1.5), &int(1)).unwrap().repr(), "0.5");
        assert_eq!(binary(BinOp::FloorDiv, &Value::Float(7.5), &int(2)).unwrap().repr(), "3.0");
    }

    #[test]
    fn test_sequence_operators() {
        assert_eq!(binary(BinOp::Mul, &Value::str("ab"), &int(3)).unwrap().repr(), "'ababab'");
        assert_eq!(binary(BinOp::Mul, &int(2), &Value::list(vec![int(0)])).unwrap().repr(), "[0, 0]");
        let err = binary(BinOp::Add, &Value::str("a"), &int(1)).unwrap_err();
        assert_eq!(err.message, "can only concatenate str (not \"int\") to str");
        let err = binary(BinOp::Mul, &Value::list(vec![int(0)]), &int(i64::MAX)).unwrap_err();
        assert_eq!(err.kind, ExcKind::MemoryError);
    }

    #[test]
    fn test_slices() {
        assert_eq!(slice_indices(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(5, Some(1), Some(100), Some(2)).unwrap(), vec![1, 3]);
        assert!(slice_indices(5, None, None, Some(0)).is_err());

        let list = Value::list((0..5).map(int).collect());
        set_slice(&list, Some(1), Some(3), None, vec![Value::str("x")]).unwrap();
        assert_eq!(list.repr(), "[0, 'x', 3, 4]");
    }

    #[test]
    fn test_indexing_errors() {
        let list = Value::list(vec![int(1)]);
        assert_eq!(get_item(&list, &int(-1)).unwrap().repr(), "1");
        assert_eq!(get_item(&list, &int(3)).unwrap_err().message, "list index out of range");
        let dict = Value::dict(Default::default());
        assert_eq!(get_item(&dict, &Value::str("k")).unwrap_err().message, "'k'");
        assert!(set_item(&Value::tuple(vec![]), &int(0), int(1)).is_err());
    }

    #[test]
    fn test_contains() {
        assert!(contains(&Value::str("hello"), &Value::str("ell")).unwrap());
        assert!(contains(&Value::Range(Range { start: 0, stop: 10, step: 3 }), &int(9)).unwrap());
        assert!(contains(&Value::str("x"), &int(1)).is_err());
    }
}
