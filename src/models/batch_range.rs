use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{MigrationError, Result};

/// A value of the batching column.
///
/// Batching columns are monotonic integers in almost every case; text columns
/// are accepted for tables keyed by a natural string identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderedKey {
    Int(i64),
    Text(String),
}

impl OrderedKey {
    /// Decode a key from its JSON representation (as stored in the ledger and job arguments).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Text(s) => Value::from(s.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for OrderedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for OrderedKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for OrderedKey {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for OrderedKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OrderedKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Data type class of a batching column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Text,
    /// Any other type, carrying the database type name
    Other(String),
}

impl ColumnKind {
    /// Map an `information_schema` data type name
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type {
            "smallint" | "integer" | "bigint" => Self::Integer,
            "text" | "character varying" | "character" => Self::Text,
            other => Self::Other(other.to_string()),
        }
    }

    /// Integer and string columns can bound batch ranges
    pub fn is_batchable(&self) -> bool {
        matches!(self, Self::Integer | Self::Text)
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Integer => "integer",
            Self::Text => "text",
            Self::Other(name) => name,
        }
    }
}

/// Inclusive slice `[lower_bound, upper_bound]` of a table's batching column.
///
/// A range is a coarse scan bound: it may contain rows that do not match the
/// predicate that produced it, so workers re-apply that predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRange {
    pub lower_bound: OrderedKey,
    pub upper_bound: OrderedKey,
}

impl BatchRange {
    pub fn new(lower_bound: impl Into<OrderedKey>, upper_bound: impl Into<OrderedKey>) -> Result<Self> {
        let lower_bound = lower_bound.into();
        let upper_bound = upper_bound.into();

        if lower_bound > upper_bound {
            return Err(MigrationError::InvalidArgument(format!(
                "batch range lower bound {lower_bound} exceeds upper bound {upper_bound}"
            )));
        }

        Ok(Self {
            lower_bound,
            upper_bound,
        })
    }

    pub fn contains(&self, key: &OrderedKey) -> bool {
        &self.lower_bound <= key && key <= &self.upper_bound
    }

    /// Bounds as the trailing pair of job arguments.
    pub fn to_arguments(&self) -> [Value; 2] {
        [self.lower_bound.to_json(), self.upper_bound.to_json()]
    }
}

impl fmt::Display for BatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower_bound, self.upper_bound)
    }
}
