use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::ddl::DdlOperation;
use super::{DdlExecutor, SchemaInspector};
use crate::batching::{BatchPage, BatchSource};
use crate::error::{MigrationError, Result};
use crate::models::{BatchRange, ColumnKind, OrderedKey, Relation};

#[derive(Debug, Default, Clone)]
struct TableState {
    columns: BTreeMap<String, ColumnKind>,
    rows: Vec<Map<String, Value>>,
    indexes: BTreeSet<String>,
    /// constraint name -> validated
    foreign_keys: BTreeMap<String, bool>,
}

/// Tables, rows and schema objects held in memory.
///
/// Every executed DDL statement is recorded so callers can assert whether a
/// migration mutated the schema.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<BTreeMap<String, TableState>>,
    ddl_log: Mutex<Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table_name: &str, columns: &[(&str, ColumnKind)]) {
        let state = TableState {
            columns: columns
                .iter()
                .map(|(name, kind)| (name.to_string(), kind.clone()))
                .collect(),
            ..TableState::default()
        };
        self.tables.write().insert(table_name.to_string(), state);
    }

    /// Insert a JSON object row. Non-object values are rejected.
    pub fn insert_row(&self, table_name: &str, row: Value) -> Result<()> {
        let Value::Object(row) = row else {
            return Err(MigrationError::InvalidArgument("rows must be JSON objects".to_string()));
        };
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| MigrationError::InvalidArgument(format!("unknown table {table_name}")))?;
        table.rows.push(row);
        Ok(())
    }

    /// Insert rows `{column: id}` for each id
    pub fn insert_ids(&self, table_name: &str, column_name: &str, ids: impl IntoIterator<Item = i64>) -> Result<()> {
        for id in ids {
            let mut row = Map::new();
            row.insert(column_name.to_string(), Value::from(id));
            self.insert_row(table_name, Value::Object(row))?;
        }
        Ok(())
    }

    /// Remove rows matching `predicate`, returning how many were removed
    pub fn delete_rows(&self, table_name: &str, predicate: impl Fn(&Map<String, Value>) -> bool) -> usize {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(table_name) else {
            return 0;
        };
        let before = table.rows.len();
        table.rows.retain(|row| !predicate(row));
        before - table.rows.len()
    }

    pub fn rows(&self, table_name: &str) -> Vec<Map<String, Value>> {
        self.tables
            .read()
            .get(table_name)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    /// Apply `update` to each row matching the relation's structured predicates
    pub fn update_rows(&self, relation: &Relation, mut update: impl FnMut(&mut Map<String, Value>)) -> usize {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(&relation.table_name) else {
            return 0;
        };
        let mut updated = 0;
        for row in table.rows.iter_mut().filter(|row| relation.matches(row)) {
            update(row);
            updated += 1;
        }
        updated
    }

    pub fn ddl_log(&self) -> Vec<String> {
        self.ddl_log.lock().clone()
    }

    pub fn foreign_key_validated(&self, table_name: &str, constraint_name: &str) -> Option<bool> {
        self.tables
            .read()
            .get(table_name)
            .and_then(|table| table.foreign_keys.get(constraint_name).copied())
    }

    /// Sorted batching-column values of rows matching the relation, after `after`
    fn matching_keys(&self, relation: &Relation, column_name: &str, after: Option<&OrderedKey>) -> Vec<OrderedKey> {
        let tables = self.tables.read();
        let Some(table) = tables.get(&relation.table_name) else {
            return Vec::new();
        };

        let mut keys: Vec<OrderedKey> = table
            .rows
            .iter()
            .filter(|row| relation.matches(row))
            .filter_map(|row| row.get(column_name).and_then(OrderedKey::from_json))
            .filter(|key| after.map_or(true, |after| key > after))
            .collect();
        keys.sort();
        keys
    }

    fn page(keys: &[OrderedKey]) -> Result<Option<BatchPage>> {
        match (keys.first(), keys.last()) {
            (Some(lower), Some(upper)) => Ok(Some(BatchPage {
                range: BatchRange::new(lower.clone(), upper.clone())?,
                rows: keys.len() as i64,
            })),
            _ => Ok(None),
        }
    }

    fn with_table<T>(&self, table_name: &str, f: impl FnOnce(&mut TableState) -> T) -> Result<T> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| MigrationError::InvalidArgument(format!("relation \"{table_name}\" does not exist")))?;
        Ok(f(table))
    }
}

#[async_trait]
impl BatchSource for InMemoryStore {
    async fn column_kind(&self, table_name: &str, column_name: &str) -> Result<Option<ColumnKind>> {
        Ok(self
            .tables
            .read()
            .get(table_name)
            .and_then(|table| table.columns.get(column_name).cloned()))
    }

    async fn next_range(
        &self,
        relation: &Relation,
        column_name: &str,
        after: Option<&OrderedKey>,
        batch_size: i64,
    ) -> Result<Option<BatchPage>> {
        let keys = self.matching_keys(relation, column_name, after);
        let take = usize::try_from(batch_size).unwrap_or(usize::MAX).min(keys.len());
        Self::page(&keys[..take])
    }

    async fn next_distinct_range(
        &self,
        relation: &Relation,
        column_name: &str,
        after: Option<&OrderedKey>,
        batch_size: i64,
    ) -> Result<Option<BatchPage>> {
        let mut keys = self.matching_keys(relation, column_name, after);
        keys.dedup();
        let take = usize::try_from(batch_size).unwrap_or(usize::MAX).min(keys.len());
        Self::page(&keys[..take])
    }
}

#[async_trait]
impl SchemaInspector for InMemoryStore {
    async fn table_exists(&self, table_name: &str) -> Result<bool> {
        Ok(self.tables.read().contains_key(table_name))
    }

    async fn column_exists(&self, table_name: &str, column_name: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .get(table_name)
            .is_some_and(|table| table.columns.contains_key(column_name)))
    }

    async fn index_exists(&self, table_name: &str, index_name: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .get(table_name)
            .is_some_and(|table| table.indexes.contains(index_name)))
    }

    async fn foreign_key_exists(&self, table_name: &str, constraint_name: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .get(table_name)
            .is_some_and(|table| table.foreign_keys.contains_key(constraint_name)))
    }
}

#[async_trait]
impl DdlExecutor for InMemoryStore {
    async fn execute_ddl(&self, operation: &DdlOperation) -> Result<()> {
        match operation {
            DdlOperation::CreateIndex {
                table_name,
                index_name,
                ..
            } => self.with_table(table_name, |table| {
                table.indexes.insert(index_name.clone());
            })?,
            DdlOperation::DropIndex {
                table_name,
                index_name,
            } => self.with_table(table_name, |table| {
                table.indexes.remove(index_name);
            })?,
            DdlOperation::AddColumn {
                table_name,
                column_name,
                sql_type,
                default,
                ..
            } => self.with_table(table_name, |table| {
                let kind = ColumnKind::from_data_type(sql_type);
                table.columns.insert(column_name.clone(), kind);
                let default = default.as_ref().map_or(Value::Null, |d| Value::String(d.clone()));
                for row in &mut table.rows {
                    row.entry(column_name.clone()).or_insert_with(|| default.clone());
                }
            })?,
            DdlOperation::RemoveColumn {
                table_name,
                column_name,
            } => self.with_table(table_name, |table| {
                table.columns.remove(column_name);
                for row in &mut table.rows {
                    row.remove(column_name);
                }
            })?,
            DdlOperation::AddForeignKey {
                table_name,
                constraint_name,
                ..
            } => self.with_table(table_name, |table| {
                table.foreign_keys.insert(constraint_name.clone(), false);
            })?,
            DdlOperation::ValidateForeignKey {
                table_name,
                constraint_name,
            } => {
                let found = self.with_table(table_name, |table| {
                    table
                        .foreign_keys
                        .get_mut(constraint_name)
                        .map(|validated| *validated = true)
                        .is_some()
                })?;
                if !found {
                    return Err(MigrationError::InvalidArgument(format!(
                        "constraint \"{constraint_name}\" of relation \"{table_name}\" does not exist"
                    )));
                }
            }
        }

        self.ddl_log.lock().push(operation.to_sql());
        Ok(())
    }
}
