//! Parameter tables and parameter sets.
//!
//! Each adapter ships a [`ParamTable`] describing its tunable parameters
//! (type, default, constraints, title). A [`ParamSet`] is seeded from the
//! table's defaults and only accepts keys and values the table allows.
//! Tables are embedded TOML files, parsed once at first use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SortError};

/// Semantic type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Float,
    Int,
    Bool,
    Str,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamKind::Float => "float",
            ParamKind::Int => "int",
            ParamKind::Bool => "bool",
            ParamKind::Str => "str",
        };
        f.write_str(s)
    }
}

/// A parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Parse a command-line string according to `kind`.
    pub fn parse(kind: ParamKind, raw: &str) -> Option<ParamValue> {
        let raw = raw.trim();
        match kind {
            ParamKind::Float => raw.parse().ok().map(ParamValue::Float),
            ParamKind::Int => raw.parse().ok().map(ParamValue::Int),
            ParamKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(ParamValue::Bool(true)),
                "false" | "0" | "no" | "off" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            ParamKind::Str => Some(ParamValue::Str(raw.to_string())),
        }
    }

    /// Coerce into `kind`. Integers widen to floats; nothing else converts.
    fn coerce(self, kind: ParamKind) -> Option<ParamValue> {
        match (kind, self) {
            (ParamKind::Float, ParamValue::Float(v)) => Some(ParamValue::Float(v)),
            (ParamKind::Float, ParamValue::Int(v)) => Some(ParamValue::Float(v as f64)),
            (ParamKind::Int, v @ ParamValue::Int(_)) => Some(v),
            (ParamKind::Bool, v @ ParamValue::Bool(_)) => Some(v),
            (ParamKind::Str, v @ ParamValue::Str(_)) => Some(v),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "str",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Schema entry for a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    pub default: ParamValue,
    pub title: String,
    /// Inclusive lower bound for numeric parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Closed set of accepted values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<ParamValue>,
}

impl ParamSpec {
    /// Check `value` against this spec and return it coerced to the spec's kind.
    pub fn validate(&self, value: ParamValue) -> Result<ParamValue> {
        let found = value.kind_name();
        let value = value.coerce(self.kind).ok_or_else(|| {
            SortError::config(format!(
                "parameter {:?} expects {}, got {found}",
                self.name, self.kind
            ))
        })?;

        if let Some(n) = value.as_number() {
            if !n.is_finite() {
                return Err(SortError::config(format!(
                    "parameter {:?} must be finite, got {n}",
                    self.name
                )));
            }
            if let Some(min) = self.min.filter(|min| n < *min) {
                return Err(SortError::config(format!(
                    "parameter {:?} must be >= {min}, got {n}",
                    self.name
                )));
            }
            if let Some(max) = self.max.filter(|max| n > *max) {
                return Err(SortError::config(format!(
                    "parameter {:?} must be <= {max}, got {n}",
                    self.name
                )));
            }
        }

        if !self.choices.is_empty() {
            let allowed = self
                .choices
                .iter()
                .filter_map(|c| c.clone().coerce(self.kind))
                .any(|c| c == value);
            if !allowed {
                let options: Vec<String> = self.choices.iter().map(ToString::to_string).collect();
                return Err(SortError::config(format!(
                    "parameter {:?} must be one of [{}], got {value}",
                    self.name,
                    options.join(", ")
                )));
            }
        }

        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
struct TableFile {
    params: Vec<ParamSpec>,
}

/// The fixed parameter schema of one adapter, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTable {
    specs: Vec<ParamSpec>,
}

impl ParamTable {
    /// Build a table, checking names are unique and defaults pass validation.
    pub fn new(specs: Vec<ParamSpec>) -> Result<Self> {
        let mut checked = Vec::with_capacity(specs.len());
        for mut spec in specs {
            if checked.iter().any(|s: &ParamSpec| s.name == spec.name) {
                return Err(SortError::config(format!(
                    "duplicate parameter {:?} in table",
                    spec.name
                )));
            }
            spec.default = spec.validate(spec.default.clone())?;
            checked.push(spec);
        }
        Ok(Self { specs: checked })
    }

    /// Parse a table from its TOML form (`[[params]]` entries).
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: TableFile = toml::from_str(text)
            .map_err(|e| SortError::config(format!("invalid parameter table: {e}")))?;
        Self::new(file.params)
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Concrete parameter values for one run.
///
/// Keys always match the table exactly: the set starts from the defaults
/// and [`ParamSet::set`] rejects unknown names.
#[derive(Debug, Clone)]
pub struct ParamSet {
    table: Arc<ParamTable>,
    values: BTreeMap<String, ParamValue>,
}

impl PartialEq for ParamSet {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl ParamSet {
    /// A set holding every default from `table`.
    pub fn defaults(table: Arc<ParamTable>) -> Self {
        let values = table
            .specs()
            .iter()
            .map(|s| (s.name.clone(), s.default.clone()))
            .collect();
        Self { table, values }
    }

    /// Override one parameter after validating it against the table.
    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        let spec = self.table.spec(name).ok_or_else(|| {
            let known: Vec<&str> = self.table.names().collect();
            SortError::config(format!(
                "unknown parameter {name:?} (known: {})",
                known.join(", ")
            ))
        })?;
        let value = spec.validate(value.into())?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Override a parameter from its command-line string form.
    pub fn set_from_str(&mut self, name: &str, raw: &str) -> Result<()> {
        let kind = self
            .table
            .spec(name)
            .map(|s| s.kind)
            .ok_or_else(|| SortError::config(format!("unknown parameter {name:?}")))?;
        let value = ParamValue::parse(kind, raw).ok_or_else(|| {
            SortError::config(format!("cannot parse {raw:?} as {kind} for parameter {name:?}"))
        })?;
        self.set(name, value)
    }

    /// Apply several overrides, stopping at the first invalid one.
    pub fn update<I, K, V>(&mut self, overrides: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ParamValue>,
    {
        for (name, value) in overrides {
            self.set(name.as_ref(), value)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_number)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(ParamValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn table(&self) -> &ParamTable {
        &self.table
    }

    /// Values as a JSON object, for logs and the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.values).unwrap_or(serde_json::Value::Null)
    }
}
