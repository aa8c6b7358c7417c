use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::DeploymentConfig;
use crate::error::{MigrationError, Result};

/// Deployment context passed explicitly into guards and helpers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationContext {
    pub environment: String,
    pub instance: Option<String>,
    pub feature_flags: HashMap<String, bool>,
    /// The migration is running inside a DDL transaction
    pub transaction_open: bool,
    /// Name of the migration currently running
    pub caller_id: Option<String>,
}

impl MigrationContext {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            instance: None,
            feature_flags: HashMap::new(),
            transaction_open: false,
            caller_id: None,
        }
    }

    pub fn from_deployment(deployment: &DeploymentConfig) -> Self {
        Self {
            environment: deployment.environment.clone(),
            instance: deployment.instance.clone(),
            feature_flags: deployment.feature_flags.clone(),
            transaction_open: false,
            caller_id: None,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_feature_flag(mut self, flag: impl Into<String>, enabled: bool) -> Self {
        self.feature_flags.insert(flag.into(), enabled);
        self
    }

    pub fn with_transaction_open(mut self, transaction_open: bool) -> Self {
        self.transaction_open = transaction_open;
        self
    }

    pub fn with_caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn feature_enabled(&self, flag: &str) -> bool {
        self.feature_flags.get(flag).copied().unwrap_or(false)
    }

    /// Scheduling and concurrent DDL must not run inside a transaction
    pub fn ensure_not_in_transaction(&self, operation: &str) -> Result<()> {
        if self.transaction_open {
            return Err(MigrationError::TransactionOpen {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_check_names_the_operation() {
        let context = MigrationContext::new("test").with_transaction_open(true);
        let err = context
            .ensure_not_in_transaction("queue_batched_background_migration")
            .unwrap_err();
        assert!(err.to_string().contains("queue_batched_background_migration"));
        assert!(MigrationContext::new("test").ensure_not_in_transaction("x").is_ok());
    }

    #[test]
    fn test_feature_flags_default_off() {
        let context = MigrationContext::new("production").with_feature_flag("bbm_enabled", true);
        assert!(context.feature_enabled("bbm_enabled"));
        assert!(!context.feature_enabled("unknown"));
    }
}
