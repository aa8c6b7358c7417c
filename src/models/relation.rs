use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A filter over a table, the source of batch ranges.
///
/// Predicates are ANDed. `Raw` fragments are passed to SQL stores verbatim and
/// are ignored by the in-memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub table_name: String,
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    Eq { column: String, value: Value },
    IsNull { column: String },
    IsNotNull { column: String },
    Raw(String),
}

impl Relation {
    /// Every row of `table_name`.
    pub fn table(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            predicates: Vec::new(),
        }
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Eq {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn where_null(mut self, column: impl Into<String>) -> Self {
        self.predicates.push(Predicate::IsNull {
            column: column.into(),
        });
        self
    }

    pub fn where_not_null(mut self, column: impl Into<String>) -> Self {
        self.predicates.push(Predicate::IsNotNull {
            column: column.into(),
        });
        self
    }

    pub fn where_raw(mut self, fragment: impl Into<String>) -> Self {
        self.predicates.push(Predicate::Raw(fragment.into()));
        self
    }

    /// Evaluate the structured predicates against a row.
    pub fn matches(&self, row: &serde_json::Map<String, Value>) -> bool {
        self.predicates.iter().all(|predicate| match predicate {
            Predicate::Eq { column, value } => row.get(column) == Some(value),
            Predicate::IsNull { column } => row.get(column).map_or(true, Value::is_null),
            Predicate::IsNotNull { column } => row.get(column).is_some_and(|v| !v.is_null()),
            Predicate::Raw(_) => true,
        })
    }
}
