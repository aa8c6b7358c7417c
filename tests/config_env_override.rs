//! Environment variable overrides. Kept in its own binary since it mutates the process environment.

use std::fs;
use tempfile::TempDir;

use batched_migrations::config::{ConfigManager, DuplicatePolicy};

#[test]
fn test_environment_variables_override_files() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("environments")).unwrap();
    fs::write(
        dir.path().join("batched_migrations.yaml"),
        "scheduling:\n  default_batch_size: 2000\nqueue:\n  queue_name: from_file\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("environments/production.yaml"),
        "scheduling:\n  duplicate_policy: reject\n",
    )
    .unwrap();

    std::env::set_var("BBM__SCHEDULING__DEFAULT_BATCH_SIZE", "5000");
    std::env::set_var("BBM__QUEUE__QUEUE_NAME", "from_env");

    let manager =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "production").unwrap();

    std::env::remove_var("BBM__SCHEDULING__DEFAULT_BATCH_SIZE");
    std::env::remove_var("BBM__QUEUE__QUEUE_NAME");

    let config = manager.config();
    assert_eq!(config.scheduling.default_batch_size, 5_000);
    assert_eq!(config.queue.queue_name, "from_env");
    assert_eq!(config.scheduling.duplicate_policy, DuplicatePolicy::Reject);
    assert_eq!(config.deployment.environment, "production");
    assert_eq!(manager.environment(), "production");
}

#[test]
fn test_repository_config_directory_loads_for_every_environment() {
    let config_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
    for environment in ["development", "test", "production"] {
        let manager = ConfigManager::load_from_directory_with_env(Some(config_dir.clone()), environment).unwrap();
        assert_eq!(manager.config().deployment.environment, environment);
    }

    let test = ConfigManager::load_from_directory_with_env(Some(config_dir), "test").unwrap();
    assert_eq!(test.config().scheduling.minimum_interval_seconds, 0);
}
