use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Extracted parameters of one parsed utterance, in declaration order.
pub type IntentParams = IndexMap<String, ParamValue>;

/// Key under which the executor hands the original utterance to handlers.
pub const RAW_MESSAGE_KEY: &str = "_raw_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    #[serde(alias = "str")]
    String,
    Int,
    Float,
    Bool,
    Path,
    #[serde(alias = "coordinate-pair", alias = "coordinate_pair")]
    Coordinates,
}

impl ParamKind {
    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Bool => "bool",
            ParamKind::Path => "path",
            ParamKind::Coordinates => "coordinates",
        }
    }

    /// Converts captured text. Numeric failures keep the raw text as `Str`;
    /// `None` only when a coordinate pair cannot be found.
    pub fn convert(self, raw: &str) -> Option<ParamValue> {
        match self {
            ParamKind::String => Some(ParamValue::Str(raw.to_string())),
            ParamKind::Int => Some(
                raw.trim()
                    .parse::<i64>()
                    .map(ParamValue::Int)
                    .unwrap_or_else(|_| ParamValue::Str(raw.to_string())),
            ),
            ParamKind::Float => Some(
                raw.trim()
                    .parse::<f64>()
                    .map(ParamValue::Float)
                    .unwrap_or_else(|_| ParamValue::Str(raw.to_string())),
            ),
            ParamKind::Bool => {
                let truthy = matches!(
                    raw.to_lowercase().as_str(),
                    "true" | "yes" | "1" | "on" | "enable"
                );
                Some(ParamValue::Bool(truthy))
            }
            ParamKind::Path => Some(ParamValue::Path(PathBuf::from(raw))),
            ParamKind::Coordinates => {
                let mut numbers = digit_runs(raw).filter_map(|run| run.parse::<i64>().ok());
                match (numbers.next(), numbers.next()) {
                    (Some(x), Some(y)) => Some(ParamValue::Coordinates { x, y }),
                    _ => None,
                }
            }
        }
    }

    /// Brings an already typed value to this kind. Applying it twice gives
    /// the same result as applying it once.
    pub fn coerce(self, value: &ParamValue) -> Option<ParamValue> {
        match (self, value) {
            (ParamKind::String, ParamValue::Str(_))
            | (ParamKind::Int, ParamValue::Int(_))
            | (ParamKind::Float, ParamValue::Float(_))
            | (ParamKind::Bool, ParamValue::Bool(_))
            | (ParamKind::Path, ParamValue::Path(_))
            | (ParamKind::Coordinates, ParamValue::Coordinates { .. }) => Some(value.clone()),
            (ParamKind::Float, ParamValue::Int(i)) => Some(ParamValue::Float(*i as f64)),
            (ParamKind::String, other) => Some(ParamValue::Str(other.to_string())),
            (kind, other) => kind.convert(&other.to_string()),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maximal runs of ASCII digits, left to right.
fn digit_runs(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Path(PathBuf),
    Coordinates { x: i64, y: i64 },
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Str(_) => "string",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Bool(_) => "bool",
            ParamValue::Path(_) => "path",
            ParamValue::Coordinates { .. } => "coordinates",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            ParamValue::Path(p) => p.to_str(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<PathBuf> {
        match self {
            ParamValue::Path(p) => Some(p.clone()),
            ParamValue::Str(s) => Some(PathBuf::from(s)),
            _ => None,
        }
    }

    pub fn coordinates(&self) -> Option<(i64, i64)> {
        match self {
            ParamValue::Coordinates { x, y } => Some((*x, *y)),
            _ => None,
        }
    }

    /// Reads a default or schema value. JSON strings go through the same
    /// conversion as captured text.
    pub fn from_json(kind: ParamKind, json: &serde_json::Value) -> Option<ParamValue> {
        use serde_json::Value as Json;
        let typed = match json {
            Json::Null => return None,
            Json::Bool(b) => ParamValue::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Int(i),
                None => ParamValue::Float(n.as_f64()?),
            },
            Json::String(s) => return kind.convert(s),
            Json::Object(map) => {
                match (
                    map.get("x").and_then(Json::as_i64),
                    map.get("y").and_then(Json::as_i64),
                ) {
                    (Some(x), Some(y)) => ParamValue::Coordinates { x, y },
                    _ => ParamValue::Str(json.to_string()),
                }
            }
            Json::Array(items) => match items.as_slice() {
                [x, y] if x.is_i64() && y.is_i64() => ParamValue::Coordinates {
                    x: x.as_i64()?,
                    y: y.as_i64()?,
                },
                _ => ParamValue::Str(json.to_string()),
            },
        };
        kind.coerce(&typed)
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            ParamValue::Str(s) => Json::String(s.clone()),
            ParamValue::Int(i) => Json::from(*i),
            ParamValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(f.to_string())),
            ParamValue::Bool(b) => Json::Bool(*b),
            ParamValue::Path(p) => Json::String(p.to_string_lossy().into_owned()),
            ParamValue::Coordinates { x, y } => serde_json::json!({ "x": x, "y": y }),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Path(p) => write!(f, "{}", p.display()),
            ParamValue::Coordinates { x, y } => write!(f, "{},{}", x, y),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

/// Typed descriptor of one intent parameter.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
    pub default: Option<ParamValue>,
    pub validation_pattern: Option<Regex>,
}

impl ParameterSpec {
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            description: String::new(),
            default: None,
            validation_pattern: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Stores the default already coerced to this parameter's kind.
    pub fn with_default(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = self.kind.coerce(&value.into());
        self
    }

    pub fn with_validation(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.validation_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// True when there is no validation pattern or the stringified value
    /// matches it starting at the first character.
    pub fn accepts(&self, value: &ParamValue) -> bool {
        match &self.validation_pattern {
            None => true,
            Some(pattern) => {
                let text = value.to_string();
                pattern.find(&text).map_or(false, |m| m.start() == 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversion_falls_back_to_raw() {
        assert_eq!(ParamKind::Int.convert("42"), Some(ParamValue::Int(42)));
        assert_eq!(ParamKind::Float.convert("0.5"), Some(ParamValue::Float(0.5)));
        assert_eq!(
            ParamKind::Int.convert("twelve"),
            Some(ParamValue::Str("twelve".to_string()))
        );
        assert_eq!(
            ParamKind::Float.convert("fast"),
            Some(ParamValue::Str("fast".to_string()))
        );
    }

    #[test]
    fn test_bool_conversion() {
        for yes in ["true", "YES", "1", "On", "enable"] {
            assert_eq!(ParamKind::Bool.convert(yes), Some(ParamValue::Bool(true)), "{}", yes);
        }
        for no in ["false", "nope", "0", ""] {
            assert_eq!(ParamKind::Bool.convert(no), Some(ParamValue::Bool(false)), "{}", no);
        }
    }

    #[test]
    fn test_coordinate_conversion() {
        assert_eq!(
            ParamKind::Coordinates.convert("500,300"),
            Some(ParamValue::Coordinates { x: 500, y: 300 })
        );
        assert_eq!(
            ParamKind::Coordinates.convert("x:400 y:250 z:9"),
            Some(ParamValue::Coordinates { x: 400, y: 250 })
        );
        assert_eq!(ParamKind::Coordinates.convert("only 7"), None);
    }

    #[test]
    fn test_path_conversion_does_not_touch_filesystem() {
        assert_eq!(
            ParamKind::Path.convert("/definitely/not/here.txt"),
            Some(ParamValue::Path(PathBuf::from("/definitely/not/here.txt")))
        );
    }

    #[test]
    fn test_coerce_is_idempotent() {
        let samples = [
            (ParamKind::Int, ParamValue::Int(1)),
            (ParamKind::Int, ParamValue::Str("abc".into())),
            (ParamKind::Float, ParamValue::Int(2)),
            (ParamKind::Float, ParamValue::Float(0.01)),
            (ParamKind::Bool, ParamValue::Str("yes".into())),
            (ParamKind::Path, ParamValue::Str("desktop".into())),
            (ParamKind::String, ParamValue::Int(7)),
            (ParamKind::Coordinates, ParamValue::Coordinates { x: 1, y: 2 }),
        ];
        for (kind, value) in samples {
            let once = kind.coerce(&value);
            let twice = once.as_ref().and_then(|v| kind.coerce(v));
            assert_eq!(once, twice, "{} {:?}", kind, value);
        }
    }

    #[test]
    fn test_from_json_defaults() {
        let json = serde_json::json!(1);
        assert_eq!(ParamValue::from_json(ParamKind::Int, &json), Some(ParamValue::Int(1)));
        assert_eq!(
            ParamValue::from_json(ParamKind::Float, &json),
            Some(ParamValue::Float(1.0))
        );
        assert_eq!(
            ParamValue::from_json(ParamKind::Path, &serde_json::json!("desktop")),
            Some(ParamValue::Path(PathBuf::from("desktop")))
        );
        assert_eq!(
            ParamValue::from_json(ParamKind::Coordinates, &serde_json::json!({"x": 3, "y": 4})),
            Some(ParamValue::Coordinates { x: 3, y: 4 })
        );
        assert_eq!(ParamValue::from_json(ParamKind::String, &serde_json::Value::Null), None);
    }

    #[test]
    fn test_validation_pattern_anchors_at_start() {
        let spec = ParameterSpec::new("button", ParamKind::String)
            .with_validation("(left|right)")
            .unwrap();
        assert!(spec.accepts(&"left".into()));
        assert!(spec.accepts(&"right-ish".into()));
        assert!(!spec.accepts(&"upper left".into()));
    }
}
