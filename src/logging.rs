//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and to a JSON file
//! under `log/`, so a long migration run can be audited afterwards.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ConfigManager;
use crate::models::NaturalKey;

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call repeatedly; only the first call installs a subscriber, and an
/// already installed global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let log_level = get_log_level(&environment);

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(env_filter(&log_level));

        let log_dir = PathBuf::from("log");
        let (file_layer, guard, log_file) = match fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let log_filename = format!(
                    "{}.{}.{}.log",
                    environment,
                    process::id(),
                    Utc::now().format("%Y%m%d_%H%M%S")
                );
                let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
                let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
                let layer = fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(env_filter(&log_level));
                (Some(layer), Some(guard), Some(log_dir.join(log_filename)))
            }
            Err(_) => (None, None, None),
        };

        let subscriber = tracing_subscriber::registry().with(console_layer).with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_file = ?log_file,
            "🔧 STRUCTURED LOGGING: Initialized"
        );

        guard
    });
}

/// `RUST_LOG` wins over the environment default
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a scheduling decision (enqueue, requeue, delete, steal)
pub fn log_scheduling_operation(
    operation: &str,
    key: &NaturalKey,
    jobs: usize,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_class_name = %key.job_class_name,
        table_name = %key.table_name,
        column_name = %key.column_name,
        jobs = jobs,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 SCHEDULING_OPERATION"
    );
}

/// Log a change to tracking rows
pub fn log_ledger_operation(
    operation: &str,
    job_class_name: &str,
    job_id: Option<i64>,
    rows: u64,
    status: &str,
) {
    tracing::info!(
        operation = %operation,
        job_class_name = %job_class_name,
        job_id = job_id,
        rows = rows,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "📒 LEDGER_OPERATION"
    );
}

/// Log the outcome of guard evaluation for one migration
pub fn log_guard_decision(migration: &str, version: i64, run: bool, reason: Option<&str>) {
    tracing::info!(
        migration = %migration,
        version = version,
        run = run,
        reason = reason,
        timestamp = %Utc::now().to_rfc3339(),
        "🛡️ GUARD_DECISION"
    );
}

/// Log structured error information
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
