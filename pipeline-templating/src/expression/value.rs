// Context Value Model
// Typed runtime values shared by expression literals, evaluation results and expanded documents

use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A runtime value produced by expression evaluation.
///
/// Containers are reference counted so that copying a value out of a context is
/// cheap and so that expression equality on containers can compare identity.
/// The derived `PartialEq` is structural; expression `==` goes through
/// [`ContextValue::loose_eq`] instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ContextValue {
    #[default]
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Arc<Vec<ContextValue>>),
    Dictionary(Arc<Dictionary>),
}

/// The tag of a [`ContextValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Dictionary,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Dictionary => "dictionary",
        };
        f.write_str(name)
    }
}

impl ContextValue {
    pub fn array(items: Vec<ContextValue>) -> Self {
        ContextValue::Array(Arc::new(items))
    }

    pub fn dictionary(dictionary: Dictionary) -> Self {
        ContextValue::Dictionary(Arc::new(dictionary))
    }

    pub fn string(value: impl Into<String>) -> Self {
        ContextValue::String(value.into())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ContextValue::Null => ValueKind::Null,
            ContextValue::Boolean(_) => ValueKind::Boolean,
            ContextValue::Number(_) => ValueKind::Number,
            ContextValue::String(_) => ValueKind::String,
            ContextValue::Array(_) => ValueKind::Array,
            ContextValue::Dictionary(_) => ValueKind::Dictionary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ContextValue::Null)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, ContextValue::Array(_) | ContextValue::Dictionary(_))
    }

    /// Containers are always truthy, regardless of their contents.
    pub fn is_truthy(&self) -> bool {
        match self {
            ContextValue::Null => false,
            ContextValue::Boolean(b) => *b,
            ContextValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ContextValue::String(s) => !s.is_empty(),
            ContextValue::Array(_) | ContextValue::Dictionary(_) => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ContextValue]> {
        match self {
            ContextValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            ContextValue::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    /// Numeric coercion: null is 0, booleans are 1/0, strings are parsed and
    /// containers are NaN.
    pub fn to_number(&self) -> f64 {
        match self {
            ContextValue::Null => 0.0,
            ContextValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            ContextValue::Number(n) => *n,
            ContextValue::String(s) => parse_number(s),
            ContextValue::Array(_) | ContextValue::Dictionary(_) => f64::NAN,
        }
    }

    /// String coercion used by string functions and format substitution.
    pub fn as_string(&self) -> String {
        match self {
            ContextValue::Null => String::new(),
            ContextValue::Boolean(b) => b.to_string(),
            ContextValue::Number(n) => format_number(*n),
            ContextValue::String(s) => s.clone(),
            ContextValue::Array(_) | ContextValue::Dictionary(_) => self.to_json(),
        }
    }

    /// Compact JSON text
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Indented JSON text
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Whether both values are the same container allocation
    pub fn same_container(&self, other: &ContextValue) -> bool {
        match (self, other) {
            (ContextValue::Array(a), ContextValue::Array(b)) => Arc::ptr_eq(a, b),
            (ContextValue::Dictionary(a), ContextValue::Dictionary(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Expression equality (`==`, `eq()`).
    ///
    /// Operands of different kinds are coerced towards numbers first. Strings
    /// compare case-insensitively, NaN never equals anything and containers are
    /// equal only to themselves.
    pub fn loose_eq(&self, other: &ContextValue) -> bool {
        let (left, right) = coerce_pair(self, other);
        match (&left, &right) {
            (ContextValue::Null, ContextValue::Null) => true,
            (ContextValue::Boolean(a), ContextValue::Boolean(b)) => a == b,
            (ContextValue::Number(a), ContextValue::Number(b)) => a == b,
            (ContextValue::String(a), ContextValue::String(b)) => {
                cmp_ignore_case(a, b) == Ordering::Equal
            }
            (ContextValue::Array(_), ContextValue::Array(_))
            | (ContextValue::Dictionary(_), ContextValue::Dictionary(_)) => {
                left.same_container(&right)
            }
            _ => false,
        }
    }

    /// Expression ordering (`<`, `lt()` and friends).
    ///
    /// Returns `None` when the operands are not ordinally comparable: containers,
    /// NaN, or kinds that remain different after coercion.
    pub fn loose_cmp(&self, other: &ContextValue) -> Option<Ordering> {
        let (left, right) = coerce_pair(self, other);
        match (&left, &right) {
            (ContextValue::Null, ContextValue::Null) => Some(Ordering::Equal),
            (ContextValue::Boolean(a), ContextValue::Boolean(b)) => Some(a.cmp(b)),
            (ContextValue::Number(a), ContextValue::Number(b)) => a.partial_cmp(b),
            (ContextValue::String(a), ContextValue::String(b)) => Some(cmp_ignore_case(a, b)),
            _ => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ContextValue::Null,
            serde_json::Value::Bool(b) => ContextValue::Boolean(*b),
            serde_json::Value::Number(n) => ContextValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => ContextValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                ContextValue::array(items.iter().map(ContextValue::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let mut dict = Dictionary::case_insensitive();
                for (key, value) in map {
                    dict.insert(key.clone(), ContextValue::from_json(value));
                }
                ContextValue::dictionary(dict)
            }
        }
    }

    pub fn from_yaml(value: &serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => ContextValue::Null,
            serde_yaml::Value::Bool(b) => ContextValue::Boolean(*b),
            serde_yaml::Value::Number(n) => ContextValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_yaml::Value::String(s) => ContextValue::String(s.clone()),
            serde_yaml::Value::Sequence(items) => {
                ContextValue::array(items.iter().map(ContextValue::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => {
                let mut dict = Dictionary::case_insensitive();
                for (key, value) in map {
                    dict.insert(yaml_key_to_string(key), ContextValue::from_yaml(value));
                }
                ContextValue::dictionary(dict)
            }
            serde_yaml::Value::Tagged(tagged) => ContextValue::from_yaml(&tagged.value),
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            ContextValue::Null => serde_yaml::Value::Null,
            ContextValue::Boolean(b) => serde_yaml::Value::Bool(*b),
            ContextValue::Number(n) => match integral(*n) {
                Some(i) => serde_yaml::Value::Number(i.into()),
                None => serde_yaml::Value::Number((*n).into()),
            },
            ContextValue::String(s) => serde_yaml::Value::String(s.clone()),
            ContextValue::Array(items) => {
                serde_yaml::Value::Sequence(items.iter().map(ContextValue::to_yaml).collect())
            }
            ContextValue::Dictionary(dict) => {
                let mut map = serde_yaml::Mapping::new();
                for (key, value) in dict.iter() {
                    map.insert(serde_yaml::Value::String(key.to_string()), value.to_yaml());
                }
                serde_yaml::Value::Mapping(map)
            }
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl Serialize for ContextValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ContextValue::Null => serializer.serialize_unit(),
            ContextValue::Boolean(b) => serializer.serialize_bool(*b),
            ContextValue::Number(n) => {
                if let Some(i) = integral(*n) {
                    serializer.serialize_i64(i)
                } else if n.is_finite() {
                    serializer.serialize_f64(*n)
                } else {
                    serializer.serialize_str(&format_number(*n))
                }
            }
            ContextValue::String(s) => serializer.serialize_str(s),
            ContextValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            ContextValue::Dictionary(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, value) in dict.iter() {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Boolean(b)
    }
}

impl From<f64> for ContextValue {
    fn from(n: f64) -> Self {
        ContextValue::Number(n)
    }
}

impl From<i64> for ContextValue {
    fn from(n: i64) -> Self {
        ContextValue::Number(n as f64)
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::String(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::String(s)
    }
}

impl From<Vec<ContextValue>> for ContextValue {
    fn from(items: Vec<ContextValue>) -> Self {
        ContextValue::array(items)
    }
}

impl From<Dictionary> for ContextValue {
    fn from(dict: Dictionary) -> Self {
        ContextValue::dictionary(dict)
    }
}

/// Insertion-ordered string-keyed mapping.
///
/// Keys are unique under case-sensitive comparison unless the dictionary was
/// created with [`Dictionary::case_insensitive`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    // normalized key -> (original key, value)
    entries: IndexMap<String, (String, ContextValue)>,
    case_insensitive: bool,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case_insensitive() -> Self {
        Self {
            entries: IndexMap::new(),
            case_insensitive: true,
        }
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    fn normalize(&self, key: &str) -> String {
        if self.case_insensitive {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }

    /// Insert a value, keeping the original position when the key already
    /// exists. Returns the replaced value.
    pub fn insert(&mut self, key: impl Into<String>, value: ContextValue) -> Option<ContextValue> {
        let key = key.into();
        let normalized = self.normalize(&key);
        match self.entries.get_mut(&normalized) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                self.entries.insert(normalized, (key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(&self.normalize(key)).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&self.normalize(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries
            .values()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(key, _)| key.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &ContextValue> {
        self.entries.values().map(|(_, value)| value)
    }
}

impl<K: Into<String>> FromIterator<(K, ContextValue)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (K, ContextValue)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}

/// Parse a number the way expressions coerce strings: surrounding whitespace
/// is ignored, an empty string is 0 and anything unparsable is NaN.
pub fn parse_number(input: &str) -> f64 {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    match trimmed {
        "NaN" => return f64::NAN,
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }

    let (negative, unsigned) = match trimmed.as_bytes()[0] {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let radix = if let Some(hex) = unsigned.strip_prefix("0x") {
        Some((hex, 16))
    } else {
        unsigned.strip_prefix("0o").map(|octal| (octal, 8))
    };
    if let Some((digits, radix)) = radix {
        return match u64::from_str_radix(digits, radix) {
            Ok(n) if negative => -(n as f64),
            Ok(n) => n as f64,
            Err(_) => f64::NAN,
        };
    }

    // Rust also accepts "inf" and "nan" spellings, so restrict the alphabet first
    let valid = !unsigned.is_empty()
        && unsigned
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        && unsigned.starts_with(|c: char| c.is_ascii_digit() || c == '.');
    if !valid {
        return f64::NAN;
    }

    match unsigned.parse::<f64>() {
        Ok(n) if negative => -n,
        Ok(n) => n,
        Err(_) => f64::NAN,
    }
}

/// Canonical text for a number: integers print without a fractional part and
/// the non-finite values use their expression spellings.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    match integral(n) {
        Some(i) => i.to_string(),
        None => n.to_string(),
    }
}

fn integral(n: f64) -> Option<i64> {
    // 2^53: beyond this f64 cannot represent every integer
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_EXACT {
        Some(n as i64)
    } else {
        None
    }
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

/// Bring two values to a common kind: booleans and null become numbers,
/// and a string facing a number is parsed.
fn coerce_pair(left: &ContextValue, right: &ContextValue) -> (ContextValue, ContextValue) {
    let mut left = left.clone();
    let mut right = right.clone();

    loop {
        let next = match (&left, &right) {
            _ if left.kind() == right.kind() => return (left, right),
            (ContextValue::Number(_), ContextValue::String(_)) => {
                (left.clone(), ContextValue::Number(right.to_number()))
            }
            (ContextValue::String(_), ContextValue::Number(_)) => {
                (ContextValue::Number(left.to_number()), right.clone())
            }
            (ContextValue::Boolean(_) | ContextValue::Null, _) => {
                (ContextValue::Number(left.to_number()), right.clone())
            }
            (_, ContextValue::Boolean(_) | ContextValue::Null) => {
                (left.clone(), ContextValue::Number(right.to_number()))
            }
            _ => return (left, right),
        };
        left = next.0;
        right = next.1;
    }
}

fn yaml_key_to_string(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, ContextValue)]) -> ContextValue {
        let mut dict = Dictionary::new();
        for (key, value) in entries {
            dict.insert(*key, value.clone());
        }
        ContextValue::dictionary(dict)
    }

    #[test]
    fn test_truthiness() {
        assert!(!ContextValue::Null.is_truthy());
        assert!(!ContextValue::Boolean(false).is_truthy());
        assert!(ContextValue::Boolean(true).is_truthy());
        assert!(!ContextValue::Number(0.0).is_truthy());
        assert!(!ContextValue::Number(f64::NAN).is_truthy());
        assert!(ContextValue::Number(-1.0).is_truthy());
        assert!(!ContextValue::from("").is_truthy());
        assert!(ContextValue::from("false").is_truthy());
        assert!(ContextValue::array(vec![]).is_truthy());
        assert!(ContextValue::dictionary(Dictionary::new()).is_truthy());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42"), 42.0);
        assert_eq!(parse_number(" -1.5e2 "), -150.0);
        assert_eq!(parse_number(".5"), 0.5);
        assert_eq!(parse_number(""), 0.0);
        assert_eq!(parse_number("0x1F"), 31.0);
        assert_eq!(parse_number("0o17"), 15.0);
        assert_eq!(parse_number("-Infinity"), f64::NEG_INFINITY);
        assert!(parse_number("NaN").is_nan());
        assert!(parse_number("inf").is_nan());
        assert!(parse_number("abc").is_nan());
        assert!(parse_number("1.2.3").is_nan());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(1.25), "1.25");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_loose_eq_coercion() {
        assert!(ContextValue::from(1.0).loose_eq(&ContextValue::from("1")));
        assert!(ContextValue::from(true).loose_eq(&ContextValue::from(1.0)));
        assert!(ContextValue::from(true).loose_eq(&ContextValue::from("1")));
        assert!(ContextValue::Null.loose_eq(&ContextValue::from(0.0)));
        assert!(ContextValue::from("Ready").loose_eq(&ContextValue::from("READY")));
        assert!(!ContextValue::from(true).loose_eq(&ContextValue::from("true")));
        assert!(!ContextValue::from(f64::NAN).loose_eq(&ContextValue::from(f64::NAN)));
    }

    #[test]
    fn test_container_equality_is_identity() {
        let a = ContextValue::array(vec![ContextValue::from(1.0)]);
        let b = ContextValue::array(vec![ContextValue::from(1.0)]);
        assert!(a.loose_eq(&a.clone()));
        assert!(!a.loose_eq(&b));
        // Structural equality is still available to Rust callers
        assert_eq!(a, b);
    }

    #[test]
    fn test_loose_cmp() {
        let two = ContextValue::from(2.0);
        assert_eq!(two.loose_cmp(&ContextValue::from("10")), Some(Ordering::Less));
        assert_eq!(
            ContextValue::from("abc").loose_cmp(&ContextValue::from("ABD")),
            Some(Ordering::Less)
        );
        assert_eq!(two.loose_cmp(&ContextValue::from(f64::NAN)), None);
        assert_eq!(two.loose_cmp(&ContextValue::array(vec![])), None);
    }

    #[test]
    fn test_dictionary_case_insensitive() {
        let mut dict = Dictionary::case_insensitive();
        dict.insert("Foo", ContextValue::from(1.0));
        assert_eq!(dict.insert("FOO", ContextValue::from(2.0)), Some(ContextValue::from(1.0)));
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("foo"), Some(&ContextValue::from(2.0)));
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["Foo"]);

        let mut sensitive = Dictionary::new();
        sensitive.insert("Foo", ContextValue::from(1.0));
        assert!(sensitive.get("foo").is_none());
    }

    #[test]
    fn test_dictionary_preserves_insertion_order() {
        let value = dict(&[
            ("zeta", ContextValue::from(1.0)),
            ("alpha", ContextValue::from(2.0)),
            ("mid", ContextValue::from(3.0)),
        ]);
        assert_eq!(value.to_json(), r#"{"zeta":1,"alpha":2,"mid":3}"#);
    }

    #[test]
    fn test_as_string() {
        assert_eq!(ContextValue::Null.as_string(), "");
        assert_eq!(ContextValue::from(3.0).as_string(), "3");
        assert_eq!(ContextValue::from(false).as_string(), "false");
        let array = ContextValue::array(vec![ContextValue::from("a"), ContextValue::Null]);
        assert_eq!(array.as_string(), r#"["a",null]"#);
    }

    #[test]
    fn test_yaml_conversion() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
name: build
count: 3
tags: [a, b]
"#,
        )
        .unwrap();

        let value = ContextValue::from_yaml(&yaml);
        let dict = value.as_dictionary().unwrap();
        assert!(dict.is_case_insensitive());
        assert_eq!(dict.get("NAME"), Some(&ContextValue::from("build")));
        assert_eq!(dict.get("count"), Some(&ContextValue::from(3.0)));
        assert_eq!(dict.get("tags").and_then(|t| t.as_array()).map(|t| t.len()), Some(2));

        let back = value.to_yaml();
        assert_eq!(back["count"], serde_yaml::Value::Number(3.into()));
    }

    #[test]
    fn test_json_conversion() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a":[1,true,null],"b":"x"}"#).unwrap();
        let value = ContextValue::from_json(&json);
        assert_eq!(value.to_json(), r#"{"a":[1,true,null],"b":"x"}"#);
    }
}
