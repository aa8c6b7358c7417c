//! Idempotent DDL operations.
//!
//! Each operation pairs an existence check with the statement, so re-running
//! a migration that already applied it is a no-op.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use super::DdlExecutor;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DdlOperation {
    CreateIndex {
        table_name: String,
        index_name: String,
        columns: Vec<String>,
        unique: bool,
        where_clause: Option<String>,
    },
    DropIndex {
        table_name: String,
        index_name: String,
    },
    AddColumn {
        table_name: String,
        column_name: String,
        sql_type: String,
        default: Option<String>,
        null: bool,
    },
    RemoveColumn {
        table_name: String,
        column_name: String,
    },
    /// Added `NOT VALID`; validate separately once written rows are known good
    AddForeignKey {
        table_name: String,
        constraint_name: String,
        column_name: String,
        referenced_table: String,
        referenced_column: String,
        on_delete: Option<String>,
    },
    ValidateForeignKey {
        table_name: String,
        constraint_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlOutcome {
    Applied,
    /// The schema already had the desired shape
    AlreadyApplied,
}

/// `index_<table>_on_<col1>_and_<col2>`
pub fn default_index_name(table_name: &str, columns: &[String]) -> String {
    format!("index_{}_on_{}", table_name, columns.join("_and_"))
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl DdlOperation {
    pub fn table_name(&self) -> &str {
        match self {
            Self::CreateIndex { table_name, .. }
            | Self::DropIndex { table_name, .. }
            | Self::AddColumn { table_name, .. }
            | Self::RemoveColumn { table_name, .. }
            | Self::AddForeignKey { table_name, .. }
            | Self::ValidateForeignKey { table_name, .. } => table_name,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateIndex { .. } => "add_concurrent_index",
            Self::DropIndex { .. } => "remove_concurrent_index",
            Self::AddColumn { .. } => "add_column",
            Self::RemoveColumn { .. } => "remove_column",
            Self::AddForeignKey { .. } => "add_concurrent_foreign_key",
            Self::ValidateForeignKey { .. } => "validate_foreign_key",
        }
    }

    /// `CONCURRENTLY` statements cannot run inside a transaction block
    pub fn requires_no_transaction(&self) -> bool {
        matches!(self, Self::CreateIndex { .. } | Self::DropIndex { .. })
    }

    /// Statements that take an ACCESS EXCLUSIVE (or SHARE ROW EXCLUSIVE) lock for an instant
    pub fn requires_lock_retries(&self) -> bool {
        matches!(
            self,
            Self::AddColumn { .. } | Self::RemoveColumn { .. } | Self::AddForeignKey { .. }
        )
    }

    pub fn to_sql(&self) -> String {
        match self {
            Self::CreateIndex {
                table_name,
                index_name,
                columns,
                unique,
                where_clause,
            } => {
                let columns = columns
                    .iter()
                    .map(|c| quote_identifier(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut sql = format!(
                    "CREATE {}INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_identifier(index_name),
                    quote_identifier(table_name),
                    columns
                );
                if let Some(predicate) = where_clause {
                    sql.push_str(" WHERE ");
                    sql.push_str(predicate);
                }
                sql
            }
            Self::DropIndex { index_name, .. } => {
                format!("DROP INDEX CONCURRENTLY IF EXISTS {}", quote_identifier(index_name))
            }
            Self::AddColumn {
                table_name,
                column_name,
                sql_type,
                default,
                null,
            } => {
                let mut sql = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    quote_identifier(table_name),
                    quote_identifier(column_name),
                    sql_type
                );
                if let Some(default) = default {
                    sql.push_str(" DEFAULT ");
                    sql.push_str(default);
                }
                if !null {
                    sql.push_str(" NOT NULL");
                }
                sql
            }
            Self::RemoveColumn {
                table_name,
                column_name,
            } => format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                quote_identifier(table_name),
                quote_identifier(column_name)
            ),
            Self::AddForeignKey {
                table_name,
                constraint_name,
                column_name,
                referenced_table,
                referenced_column,
                on_delete,
            } => {
                let mut sql = format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                    quote_identifier(table_name),
                    quote_identifier(constraint_name),
                    quote_identifier(column_name),
                    quote_identifier(referenced_table),
                    quote_identifier(referenced_column)
                );
                if let Some(action) = on_delete {
                    sql.push_str(" ON DELETE ");
                    sql.push_str(action);
                }
                sql.push_str(" NOT VALID");
                sql
            }
            Self::ValidateForeignKey {
                table_name,
                constraint_name,
            } => format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                quote_identifier(table_name),
                quote_identifier(constraint_name)
            ),
        }
    }
}

impl fmt::Display for DdlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// Check whether the schema already reflects `operation`, executing it only if not
pub async fn apply_idempotent(executor: &dyn DdlExecutor, operation: &DdlOperation) -> Result<DdlOutcome> {
    let already_applied = match operation {
        DdlOperation::CreateIndex {
            table_name,
            index_name,
            ..
        } => executor.index_exists(table_name, index_name).await?,
        DdlOperation::DropIndex {
            table_name,
            index_name,
        } => !executor.index_exists(table_name, index_name).await?,
        DdlOperation::AddColumn {
            table_name,
            column_name,
            ..
        } => executor.column_exists(table_name, column_name).await?,
        DdlOperation::RemoveColumn {
            table_name,
            column_name,
        } => !executor.column_exists(table_name, column_name).await?,
        DdlOperation::AddForeignKey {
            table_name,
            constraint_name,
            ..
        } => executor.foreign_key_exists(table_name, constraint_name).await?,
        // Validating an already valid constraint is a cheap no-op in the store itself.
        DdlOperation::ValidateForeignKey { .. } => false,
    };

    if already_applied {
        warn!(
            operation = operation.name(),
            table = operation.table_name(),
            "⏭️ Schema already matches, skipping"
        );
        return Ok(DdlOutcome::AlreadyApplied);
    }

    executor.execute_ddl(operation).await?;
    info!(operation = operation.name(), table = operation.table_name(), "🧱 DDL applied");
    Ok(DdlOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_sql() {
        let op = DdlOperation::CreateIndex {
            table_name: "users".into(),
            index_name: default_index_name("users", &["state".to_string(), "id".to_string()]),
            columns: vec!["state".into(), "id".into()],
            unique: false,
            where_clause: Some("deleted_at IS NULL".into()),
        };
        assert_eq!(
            op.to_sql(),
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"index_users_on_state_and_id\" ON \"users\" (\"state\", \"id\") WHERE deleted_at IS NULL"
        );
        assert!(op.requires_no_transaction());
        assert!(!op.requires_lock_retries());
    }

    #[test]
    fn test_foreign_key_is_added_not_valid() {
        let op = DdlOperation::AddForeignKey {
            table_name: "issues".into(),
            constraint_name: "fk_issues_project_id".into(),
            column_name: "project_id".into(),
            referenced_table: "projects".into(),
            referenced_column: "id".into(),
            on_delete: Some("CASCADE".into()),
        };
        assert!(op.to_sql().ends_with("ON DELETE CASCADE NOT VALID"));
        assert!(op.requires_lock_retries());
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
