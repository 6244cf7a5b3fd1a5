use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single cell value. Input rows parsed off the wire are always
/// [`Value::Str`]; row handlers and dimension lookups coerce to the other
/// variants as needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Mirrors `pyetlmr.getint`: parses a string value, falling back to
    /// `default` on a null or unparsable value rather than erroring.
    pub fn as_int_or(&self, default: i64) -> i64 {
        match self {
            Value::Int(n) => *n,
            Value::Str(s) => s.trim().parse().unwrap_or(default),
            Value::Float(f) => *f as i64,
            Value::Null => default,
            Value::Date(_) => default,
        }
    }

    pub fn as_float_or(&self, default: f64) -> f64 {
        match self {
            Value::Float(f) => *f,
            Value::Int(n) => *n as f64,
            Value::Str(s) => s.trim().parse().unwrap_or(default),
            Value::Null => default,
            Value::Date(_) => default,
        }
    }

    pub fn as_bool_or(&self, default: bool) -> bool {
        match self {
            Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "t" | "yes" | "y" => true,
                "0" | "false" | "f" | "no" | "n" => false,
                _ => default,
            },
            Value::Int(n) => *n != 0,
            Value::Null => default,
            _ => default,
        }
    }

    /// Exact extraction, used for surrogate-key attributes which are
    /// always stored as `Value::Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Mirrors `pyetlmr.ymdparser`: parses `YYYY-MM-DD`.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Str(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Str(s) => write!(f, "{s}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Date(d) => write!(f, "{d}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

/// A mapping of canonical attribute name to the name actually present on
/// the row. Ports `pyetlmr`'s bare dict used the same way: a lookup of
/// canonical name `n` reads `row[mapping.get(n, n)]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameMapping(BTreeMap<String, String>);

impl NameMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, canonical: impl Into<String>, source: impl Into<String>) {
        self.0.insert(canonical.into(), source.into());
    }

    /// Resolves the name actually present on a row for a canonical name.
    pub fn resolve<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.0.get(canonical).map(String::as_str).unwrap_or(canonical)
    }
}

impl From<BTreeMap<String, String>> for NameMapping {
    fn from(m: BTreeMap<String, String>) -> Self {
        NameMapping(m)
    }
}

/// A mutable attribute-name to value mapping, the unit of work flowing
/// through row handlers, dimensions and fact tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Looks a canonical attribute up through a name mapping, mirroring
    /// `pyetlmr.getvalue`.
    pub fn get_mapped(&self, canonical: &str, mapping: &NameMapping) -> Option<&Value> {
        self.get(mapping.resolve(canonical))
    }

    pub fn get_mapped_or<'a>(&'a self, canonical: &str, mapping: &NameMapping, default: &'a Value) -> &'a Value {
        self.get_mapped(canonical, mapping).unwrap_or(default)
    }

    /// Builds the business-key tuple used to address a dimension's shelved
    /// store, resolving each attribute through `mapping`.
    pub fn lookup_tuple(&self, lookupatts: &[String], mapping: &NameMapping) -> Vec<Value> {
        lookupatts
            .iter()
            .map(|att| self.get_mapped(att, mapping).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Mirrors `pyetlmr.project`: a new row containing only `atts`.
    /// `project(atts, project(atts, row)) == project(atts, row)`.
    pub fn project(&self, atts: &[String]) -> Row {
        let mut out = Row::new();
        for att in atts {
            if let Some(v) = self.0.get(att) {
                out.0.insert(att.clone(), v.clone());
            }
        }
        out
    }

    /// Mirrors `pyetlmr.rename`: renames keys per `mapping` (old -> new),
    /// passing through unmapped keys unchanged. Involutive under the
    /// inverted mapping.
    pub fn rename(&self, mapping: &NameMapping) -> Row {
        let inverse: BTreeMap<&str, &str> = mapping
            .0
            .iter()
            .map(|(canonical, source)| (source.as_str(), canonical.as_str()))
            .collect();
        let mut out = Row::new();
        for (k, v) in &self.0 {
            let new_key = inverse.get(k.as_str()).copied().unwrap_or(k.as_str());
            out.0.insert(new_key.to_string(), v.clone());
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Row {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Row(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_is_idempotent() {
        let mut row = Row::new();
        row.set("url", "http://example.org");
        row.set("size", 100i64);
        let atts = vec!["url".to_string()];
        let once = row.project(&atts);
        let twice = once.project(&atts);
        assert_eq!(once, twice);
    }

    #[test]
    fn rename_round_trips() {
        let mut row = Row::new();
        row.set("downloaddate", "2020-01-01");
        let mut mapping = NameMapping::new();
        mapping.insert("date", "downloaddate");
        let renamed = row.rename(&mapping);
        assert!(renamed.contains("date"));
        assert!(!renamed.contains("downloaddate"));
    }

    #[test]
    fn coerces_int_with_default() {
        let v = Value::Str("not a number".into());
        assert_eq!(v.as_int_or(-1), -1);
        let v = Value::Str("42".into());
        assert_eq!(v.as_int_or(-1), 42);
    }
}
