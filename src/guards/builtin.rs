use async_trait::async_trait;
use std::sync::Arc;

use super::{GuardError, GuardResult, MigrationContext, MigrationGuard};
use crate::database::SchemaInspector;
use crate::ledger::LedgerStore;
use crate::models::NaturalKey;

/// Run only in (or never in) the listed environments
#[derive(Debug, Clone)]
pub struct EnvironmentGuard {
    environments: Vec<String>,
    exclude: bool,
}

impl EnvironmentGuard {
    pub fn only<I, S>(environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            environments: environments.into_iter().map(Into::into).collect(),
            exclude: false,
        }
    }

    pub fn except<I, S>(environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: true,
            ..Self::only(environments)
        }
    }
}

#[async_trait]
impl MigrationGuard for EnvironmentGuard {
    async fn check(&self, context: &MigrationContext, _schema: &dyn SchemaInspector) -> GuardResult<bool> {
        let listed = self.environments.iter().any(|env| env == &context.environment);
        Ok(listed != self.exclude)
    }

    fn description(&self) -> String {
        let verb = if self.exclude { "not in" } else { "only in" };
        format!("runs {verb} environments [{}]", self.environments.join(", "))
    }
}

/// Run only on one hosted deployment
#[derive(Debug, Clone)]
pub struct DeploymentGuard {
    instance: String,
}

impl DeploymentGuard {
    pub fn only(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }
}

#[async_trait]
impl MigrationGuard for DeploymentGuard {
    async fn check(&self, context: &MigrationContext, _schema: &dyn SchemaInspector) -> GuardResult<bool> {
        Ok(context.instance.as_deref() == Some(self.instance.as_str()))
    }

    fn description(&self) -> String {
        format!("runs only on deployment {}", self.instance)
    }
}

#[derive(Debug, Clone)]
pub struct FeatureFlagGuard {
    flag: String,
    expected: bool,
}

impl FeatureFlagGuard {
    pub fn enabled(flag: impl Into<String>) -> Self {
        Self {
            flag: flag.into(),
            expected: true,
        }
    }

    pub fn disabled(flag: impl Into<String>) -> Self {
        Self {
            flag: flag.into(),
            expected: false,
        }
    }
}

#[async_trait]
impl MigrationGuard for FeatureFlagGuard {
    async fn check(&self, context: &MigrationContext, _schema: &dyn SchemaInspector) -> GuardResult<bool> {
        Ok(context.feature_enabled(&self.flag) == self.expected)
    }

    fn description(&self) -> String {
        let state = if self.expected { "enabled" } else { "disabled" };
        format!("requires feature flag {} to be {state}", self.flag)
    }
}

/// Schema shape a migration requires before it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCondition {
    TableExists(String),
    TableAbsent(String),
    ColumnExists { table: String, column: String },
    ColumnAbsent { table: String, column: String },
    IndexExists { table: String, index: String },
    IndexAbsent { table: String, index: String },
    ForeignKeyExists { table: String, constraint: String },
    ForeignKeyAbsent { table: String, constraint: String },
}

#[derive(Debug, Clone)]
pub struct SchemaGuard {
    condition: SchemaCondition,
}

impl SchemaGuard {
    pub fn new(condition: SchemaCondition) -> Self {
        Self { condition }
    }

    pub fn column_exists(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(SchemaCondition::ColumnExists {
            table: table.into(),
            column: column.into(),
        })
    }

    pub fn column_absent(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(SchemaCondition::ColumnAbsent {
            table: table.into(),
            column: column.into(),
        })
    }

    pub fn table_exists(table: impl Into<String>) -> Self {
        Self::new(SchemaCondition::TableExists(table.into()))
    }

    pub fn index_absent(table: impl Into<String>, index: impl Into<String>) -> Self {
        Self::new(SchemaCondition::IndexAbsent {
            table: table.into(),
            index: index.into(),
        })
    }
}

#[async_trait]
impl MigrationGuard for SchemaGuard {
    async fn check(&self, _context: &MigrationContext, schema: &dyn SchemaInspector) -> GuardResult<bool> {
        let result = match &self.condition {
            SchemaCondition::TableExists(table) => schema.table_exists(table).await,
            SchemaCondition::TableAbsent(table) => schema.table_exists(table).await.map(|exists| !exists),
            SchemaCondition::ColumnExists { table, column } => schema.column_exists(table, column).await,
            SchemaCondition::ColumnAbsent { table, column } => {
                schema.column_exists(table, column).await.map(|exists| !exists)
            }
            SchemaCondition::IndexExists { table, index } => schema.index_exists(table, index).await,
            SchemaCondition::IndexAbsent { table, index } => {
                schema.index_exists(table, index).await.map(|exists| !exists)
            }
            SchemaCondition::ForeignKeyExists { table, constraint } => {
                schema.foreign_key_exists(table, constraint).await
            }
            SchemaCondition::ForeignKeyAbsent { table, constraint } => {
                schema.foreign_key_exists(table, constraint).await.map(|exists| !exists)
            }
        };

        result.map_err(|e| GuardError::Inspection {
            guard: self.description(),
            message: e.to_string(),
        })
    }

    fn description(&self) -> String {
        match &self.condition {
            SchemaCondition::TableExists(table) => format!("requires table {table}"),
            SchemaCondition::TableAbsent(table) => format!("requires table {table} to be absent"),
            SchemaCondition::ColumnExists { table, column } => format!("requires column {table}.{column}"),
            SchemaCondition::ColumnAbsent { table, column } => {
                format!("requires column {table}.{column} to be absent")
            }
            SchemaCondition::IndexExists { table, index } => format!("requires index {index} on {table}"),
            SchemaCondition::IndexAbsent { table, index } => {
                format!("requires index {index} on {table} to be absent")
            }
            SchemaCondition::ForeignKeyExists { table, constraint } => {
                format!("requires foreign key {constraint} on {table}")
            }
            SchemaCondition::ForeignKeyAbsent { table, constraint } => {
                format!("requires foreign key {constraint} on {table} to be absent")
            }
        }
    }
}

/// Skip when the backfill already has tracking rows
pub struct AlreadyScheduledGuard {
    ledger: Arc<dyn LedgerStore>,
    key: NaturalKey,
}

impl AlreadyScheduledGuard {
    pub fn new(ledger: Arc<dyn LedgerStore>, key: NaturalKey) -> Self {
        Self { ledger, key }
    }
}

#[async_trait]
impl MigrationGuard for AlreadyScheduledGuard {
    async fn check(&self, _context: &MigrationContext, _schema: &dyn SchemaInspector) -> GuardResult<bool> {
        let counts = self
            .ledger
            .status_counts(&self.key)
            .await
            .map_err(|e| GuardError::Ledger {
                guard: self.description(),
                message: e.to_string(),
            })?;
        Ok(counts.total() == 0)
    }

    fn description(&self) -> String {
        format!("skips when {} is already scheduled", self.key)
    }
}
