//! Number rendering and the format mini-language used by f-strings,
//! `format()`, `str.format` and `%`.

use num_bigint::BigInt;
use num_traits::Signed;

use super::value::{str_repr, type_error, value_error, ExcKind, Exception, Key, Num, Value};

/// Shortest round-trip text of a float, with Python's exponent rules.
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = value.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        return exponent_form(&format!("{:e}", value));
    }
    let text = format!("{}", value);
    if text.contains('.') {
        text
    } else {
        format!("{}.0", text)
    }
}

/// Rewrites Rust's `1.5e-5` into `1.5e-05`.
fn exponent_form(text: &str) -> String {
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => text.to_string(),
    }
}

#[derive(Debug, Default, Clone)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Result<Spec, Exception> {
    let chars: Vec<char> = spec.chars().collect();
    let mut parsed = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = Some(chars[0]);
        parsed.align = Some(chars[1]);
        i = 2;
    } else if chars.first().map_or(false, |c| is_align(*c)) {
        parsed.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            parsed.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'#') {
        parsed.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        parsed.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).map_or(false, char::is_ascii_digit) {
        i += 1;
    }
    if i > start {
        parsed.width = digits(&chars[start..i])?;
    }
    if let Some(&c) = chars.get(i) {
        if c == ',' || c == '_' {
            parsed.grouping = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).map_or(false, char::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return Err(value_error("Format specifier missing precision"));
        }
        parsed.precision = Some(digits(&chars[start..i])?);
    }
    if let Some(&c) = chars.get(i) {
        parsed.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(value_error(format!("Invalid format specifier '{}'", spec)));
    }
    Ok(parsed)
}

fn digits(chars: &[char]) -> Result<usize, Exception> {
    chars
        .iter()
        .collect::<String>()
        .parse()
        .map_err(|_| value_error("Too many decimal digits in format string"))
}

/// `format(value, spec)`.
pub fn format_value(value: &Value, spec: &str) -> Result<String, Exception> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    let spec = parse_spec(spec)?;
    if let Value::BigInt(big) = value {
        return format_big(big, &spec, value);
    }

    let number = match value {
        Value::Bool(_) if spec.kind.is_none() || spec.kind == Some('s') => None,
        other => other.as_num(),
    };
    match number {
        Some(num) => format_number(num, &spec, value),
        None => {
            if let Some(kind) = spec.kind.filter(|k| *k != 's') {
                return Err(value_error(format!(
                    "Unknown format code '{}' for object of type '{}'",
                    kind,
                    value.type_name()
                )));
            }
            if spec.sign.is_some() {
                return Err(value_error("Sign not allowed in string format specifier"));
            }
            let mut text = value.to_str();
            if let Some(precision) = spec.precision {
                text = text.chars().take(precision).collect();
            }
            Ok(pad(&text, "", &spec, '<'))
        }
    }
}

fn format_number(num: Num, spec: &Spec, original: &Value) -> Result<String, Exception> {
    let negative = match num {
        Num::Int(i) => i < 0,
        Num::Float(f) => f.is_sign_negative() && !f.is_nan(),
    };
    let unknown = |kind: char| {
        value_error(format!(
            "Unknown format code '{}' for object of type '{}'",
            kind,
            original.type_name()
        ))
    };

    let body = match (spec.kind, num) {
        (None, Num::Int(i)) | (Some('d'), Num::Int(i)) | (Some('n'), Num::Int(i)) => {
            if spec.precision.is_some() {
                return Err(value_error("Precision not allowed in integer format specifier"));
            }
            group(&i.unsigned_abs().to_string(), spec.grouping)
        }
        (Some(kind @ ('x' | 'X' | 'o' | 'b')), Num::Int(i)) => {
            let magnitude = i.unsigned_abs();
            let (digits, prefix) = match kind {
                'x' => (format!("{:x}", magnitude), "0x"),
                'X' => (format!("{:X}", magnitude), "0X"),
                'o' => (format!("{:o}", magnitude), "0o"),
                _ => (format!("{:b}", magnitude), "0b"),
            };
            if spec.alternate {
                format!("{}{}", prefix, digits)
            } else {
                digits
            }
        }
        (Some('c'), Num::Int(i)) => u32::try_from(i)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .ok_or_else(|| Exception::new(ExcKind::OverflowError, "%c arg not in range(0x110000)"))?,
        (Some(kind @ ('d' | 'x' | 'X' | 'o' | 'b' | 'c')), Num::Float(_)) => return Err(unknown(kind)),
        (None, Num::Float(f)) => match spec.precision {
            None => float_repr(f.abs()),
            Some(precision) => {
                let text = general(f.abs(), precision, false, false);
                if text.contains(|c: char| !c.is_ascii_digit()) {
                    text
                } else {
                    format!("{}.0", text)
                }
            }
        },
        (Some(kind), num) => {
            let f = num.as_f64().abs();
            match kind {
                'f' | 'F' => fixed(f, spec.precision.unwrap_or(6), kind == 'F'),
                'e' | 'E' => scientific(f, spec.precision.unwrap_or(6), kind == 'E'),
                'g' | 'G' => general(f, spec.precision.unwrap_or(6), kind == 'G', spec.alternate),
                '%' => format!("{}%", fixed(f * 100.0, spec.precision.unwrap_or(6), false)),
                'n' => general(f, spec.precision.unwrap_or(6), false, false),
                other => return Err(unknown(other)),
            }
        }
    };

    let already_grouped = matches!(num, Num::Int(_)) && matches!(spec.kind, None | Some('d') | Some('n'));
    let body = if already_grouped { body } else { group_float(&body, spec.grouping) };

    let sign = if negative {
        "-"
    } else {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };
    Ok(pad(&body, sign, spec, '>'))
}

fn format_big(big: &BigInt, spec: &Spec, original: &Value) -> Result<String, Exception> {
    let magnitude = big.magnitude();
    let body = match spec.kind {
        None | Some('d') | Some('n') => {
            if spec.precision.is_some() {
                return Err(value_error("Precision not allowed in integer format specifier"));
            }
            group(&magnitude.to_string(), spec.grouping)
        }
        Some(kind @ ('x' | 'X' | 'o' | 'b')) => {
            let (digits, prefix) = match kind {
                'x' => (format!("{:x}", magnitude), "0x"),
                'X' => (format!("{:X}", magnitude), "0X"),
                'o' => (format!("{:o}", magnitude), "0o"),
                _ => (format!("{:b}", magnitude), "0b"),
            };
            if spec.alternate {
                format!("{}{}", prefix, digits)
            } else {
                digits
            }
        }
        Some(_) => return format_number(Num::Float(original.expect_float("value")?), spec, original),
    };
    let sign = if big.is_negative() {
        "-"
    } else {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };
    Ok(pad(&body, sign, spec, '>'))
}

fn fixed(value: f64, precision: usize, upper: bool) -> String {
    if value.is_nan() {
        return if upper { "NAN" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if upper { "INF" } else { "inf" }.to_string();
    }
    format!("{:.*}", precision, value)
}

fn scientific(value: f64, precision: usize, upper: bool) -> String {
    if !value.is_finite() {
        return fixed(value, precision, upper);
    }
    let text = exponent_form(&format!("{:.*e}", precision, value));
    if upper {
        text.to_uppercase()
    } else {
        text
    }
}

fn general(value: f64, precision: usize, upper: bool, keep_zeros: bool) -> String {
    if !value.is_finite() {
        return fixed(value, precision, upper);
    }
    let precision = precision.max(1);
    if value == 0.0 {
        return if keep_zeros && precision > 1 {
            format!("0.{}", "0".repeat(precision - 1))
        } else {
            "0".to_string()
        };
    }
    let exponent: i32 = format!("{:.*e}", precision - 1, value)
        .split_once('e')
        .and_then(|(_, exp)| exp.parse().ok())
        .unwrap_or(0);

    let text = if exponent >= -4 && exponent < precision as i32 {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let text = format!("{:.*}", decimals, value);
        if keep_zeros {
            text
        } else {
            strip_zeros(&text)
        }
    } else {
        let text = format!("{:.*e}", precision - 1, value);
        let (mantissa, exp) = text.split_once('e').unwrap_or((&text, "0"));
        let mantissa = if keep_zeros { mantissa.to_string() } else { strip_zeros(mantissa) };
        exponent_form(&format!("{}e{}", mantissa, exp))
    };
    if upper {
        text.to_uppercase()
    } else {
        text
    }
}

fn strip_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

fn group(digits: &str, separator: Option<char>) -> String {
    let Some(separator) = separator else {
        return digits.to_string();
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

fn group_float(text: &str, separator: Option<char>) -> String {
    if separator.is_none() {
        return text.to_string();
    }
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    format!("{}{}", group(&text[..split], separator), &text[split..])
}

fn pad(body: &str, sign: &str, spec: &Spec, default_align: char) -> String {
    let (fill, align) = match (spec.fill, spec.align) {
        (fill, Some(align)) => (fill.unwrap_or(' '), align),
        (_, None) if spec.zero => ('0', '='),
        _ => (' ', default_align),
    };
    let len = body.chars().count() + sign.chars().count();
    if len >= spec.width {
        return format!("{}{}", sign, body);
    }
    let padding = spec.width - len;
    let fill_str = |n: usize| fill.to_string().repeat(n);
    match align {
        '<' => format!("{}{}{}", sign, body, fill_str(padding)),
        '^' => format!(
            "{}{}{}{}",
            fill_str(padding / 2),
            sign,
            body,
            fill_str(padding - padding / 2)
        ),
        '=' => format!("{}{}{}", sign, fill_str(padding), body),
        _ => format!("{}{}{}", fill_str(padding), sign, body),
    }
}

/// `template % args`.
pub fn percent_format(template: &str, args: &Value) -> Result<String, Exception> {
    let (items, mapping) = match args {
        Value::Tuple(items) => (items.as_ref().clone(), None),
        Value::Dict(_) => (Vec::new(), Some(args.clone())),
        other => (vec![other.clone()], None),
    };
    let mut next = items.into_iter();
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if chars.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }

        let mut value = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..]
                .iter()
                .position(|c| *c == ')')
                .ok_or_else(|| value_error("incomplete format key"))?;
            let key: String = chars[i + 1..i + close].iter().collect();
            let Some(Value::Dict(map)) = &mapping else {
                return Err(type_error("format requires a mapping"));
            };
            let found = map.borrow().get(&Key::Str(key.as_str().into())).cloned();
            value = Some(found.ok_or_else(|| Exception::new(ExcKind::KeyError, str_repr(&key)))?);
            i += close + 1;
        }

        let mut spec = String::new();
        let mut left = false;
        while let Some(&flag) = chars.get(i) {
            match flag {
                '-' => left = true,
                '+' | ' ' => spec.push(flag),
                '#' => spec.push('#'),
                '0' => {
                    if !left {
                        spec.push('0');
                    }
                }
                _ => break,
            }
            i += 1;
        }
        if left {
            spec.insert(0, '<');
        }
        while let Some(&c) = chars.get(i).filter(|c| c.is_ascii_digit() || **c == '.') {
            spec.push(c);
            i += 1;
        }
        let conversion = *chars.get(i).ok_or_else(|| value_error("incomplete format"))?;
        i += 1;

        let value = match value {
            Some(value) => value,
            None => next
                .next()
                .ok_or_else(|| type_error("not enough arguments for format string"))?,
        };
        let rendered = match conversion {
            's' | 'r' | 'a' => {
                let text = if conversion == 's' { value.to_str() } else { value.repr() };
                let spec = if left { spec } else { format!(">{}", spec) };
                format_value(&Value::str(text), &spec)?
            }
            'd' | 'i' | 'u' if matches!(value, Value::BigInt(_)) => format_value(&value, &format!("{}d", spec))?,
            'd' | 'i' | 'u' => {
                let int = match value.as_num() {
                    Some(Num::Int(i)) => i,
                    Some(Num::Float(f)) => f.trunc() as i64,
                    None => {
                        return Err(type_error(format!(
                            "%{} format: a real number is required, not {}",
                            conversion,
                            value.type_name()
                        )))
                    }
                };
                format_value(&Value::Int(int), &format!("{}d", spec))?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let f = value.expect_float("format argument")?;
                format_value(&Value::Float(f), &format!("{}{}", spec, conversion))?
            }
            'x' | 'X' | 'o' => {
                let int = value.expect_int("format argument")?;
                format_value(&Value::Int(int), &format!("{}{}", spec, conversion))?
            }
            'c' => format_value(&value, &format!("{}c", spec))?,
            other => {
                return Err(value_error(format!(
                    "unsupported format character '{}'",
                    other
                )))
            }
        };
        out.push_str(&rendered);
    }

    if mapping.is_none() && next.next().is_some() {
        return Err(type_error("not all arguments converted during string formatting"));
    }
    Ok(out)
}

/// `template.format(*args, **kwargs)` for plain, numbered, named and
/// indexed fields.
pub fn str_format(template: &str, args: &[Value], kwargs: &[(String, Value)]) -> Result<String, Exception> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut auto_index = 0usize;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '}' => return Err(value_error("Single '}' encountered in format string")),
            '{' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .ok_or_else(|| value_error("Single '{' encountered in format string"))?;
                let field: String = chars[i + 1..i + close].iter().collect();
                i += close + 1;

                let (field, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let (field, conversion) = match field.split_once('!') {
                    Some((field, conversion)) => (field, conversion.chars().next()),
                    None => (field, None),
                };
                let (name, index) = match field.split_once('[') {
                    Some((name, rest)) => (name, Some(rest.trim_end_matches(']'))),
                    None => (field, None),
                };

                let mut value = if name.is_empty() {
                    let value = args
                        .get(auto_index)
                        .cloned()
                        .ok_or_else(|| Exception::new(ExcKind::IndexError, "Replacement index out of range for positional args tuple"))?;
                    auto_index += 1;
                    value
                } else if let Ok(position) = name.parse::<usize>() {
                    args.get(position).cloned().ok_or_else(|| {
                        Exception::new(
                            ExcKind::IndexError,
                            format!("Replacement index {} out of range for positional args tuple", position),
                        )
                    })?
                } else {
                    kwargs
                        .iter()
                        .find(|(key, _)| key == name)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| Exception::new(ExcKind::KeyError, str_repr(name)))?
                };

                if let Some(index) = index {
                    value = lookup_index(&value, index)?;
                }
                let value = match conversion {
                    Some('r') | Some('a') => Value::str(value.repr()),
                    Some('s') => Value::str(value.to_str()),
                    Some(other) => return Err(value_error(format!("Unknown conversion specifier {}", other))),
                    None => value,
                };
                out.push_str(&format_value(&value, spec)?);
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn lookup_index(value: &Value, index: &str) -> Result<Value, Exception> {
    match value {
        Value::Dict(map) => {
            let key = match index.parse::<i64>() {
                Ok(i) => Key::Int(i),
                Err(_) => Key::Str(index.into()),
            };
            map.borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| Exception::new(ExcKind::KeyError, str_repr(index)))
        }
        Value::List(_) | Value::Tuple(_) => {
            let position: usize = index
                .parse()
                .map_err(|_| type_error("list indices must be integers or slices, not str"))?;
            let item = match value {
                Value::List(items) => items.borrow().get(position).cloned(),
                Value::Tuple(items) => items.get(position).cloned(),
                _ => None,
            };
            item.ok_or_else(|| Exception::new(ExcKind::IndexError, "list index out of range"))
        }
        other => Err(type_error(format!("'{}' object is not subscriptable", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_repr() {
        assert_eq!(float_repr(2.0), "2.0");
        assert_eq!(float_repr(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(-0.0), "-0.0");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn test_format_specs() {
        let cases: &[(Value, &str, &str)] = &[
            (Value::Float(3.14159), ".2f", "3.14"),
            (Value::Int(42), ">5", "   42"),
            (Value::Int(42), "05d", "00042"),
            (Value::Int(-42), "06d", "-00042"),
            (Value::Int(1234567), ",", "1,234,567"),
            (Value::Float(1234.5), ",.2f", "1,234.50"),
            (Value::Float(0.256), ".1%", "25.6%"),
            (Value::Int(255), "#x", "0xff"),
            (Value::Int(5), "b", "101"),
            (Value::Float(12345.678), ".3e", "1.235e+04"),
            (Value::Float(0.0001234), "g", "0.0001234"),
            (Value::Float(123456789.0), "g", "1.23457e+08"),
            (Value::Int(7), "+d", "+7"),
            (Value::str("hi"), "^6", "  hi  "),
            (Value::str("hi"), "*<4", "hi**"),
            (Value::Float(2.5), "", "2.5"),
            (Value::Float(2.0), "10", "       2.0"),
        ];
        for (value, spec, expected) in cases {
            assert_eq!(format_value(value, spec).unwrap(), *expected, "spec {:?}", spec);
        }
    }

    #[test]
    fn test_format_rejects_bad_codes() {
        assert!(format_value(&Value::str("x"), "d").is_err());
        assert!(format_value(&Value::Float(1.5), "d").is_err());
    }

    #[test]
    fn test_percent_format() {
        let args = Value::tuple(vec![Value::str("x"), Value::Int(3), Value::Float(2.0 / 3.0)]);
        assert_eq!(percent_format("%s=%d (%.2f) 100%%", &args).unwrap(), "x=3 (0.67) 100%");
        assert_eq!(percent_format("%5s|%-5d|", &Value::tuple(vec![Value::str("ab"), Value::Int(1)])).unwrap(), "   ab|1    |");
        assert!(percent_format("%d %d", &Value::Int(1)).is_err());
    }

    #[test]
    fn test_str_format() {
        let args = [Value::str("a"), Value::Int(2)];
        let kwargs = [("name".to_string(), Value::str("Bo"))];
        assert_eq!(
            str_format("{} {} {0!r} {name:>4} {{x}} {1:.1f}", &args, &kwargs).unwrap(),
            "a 2 'a'   Bo {x} 2.0"
        );
    }
}
