#![allow(missing_docs)]

use std::io::Write;
use std::time::Duration;

use penumbra::storage::{CacheConfig, CacheOptions, ConfigError, GraphKernel};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

#[test]
fn file_values_override_defaults() -> TestResult {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        "chain_batch_size = 8\ndense_node_threshold = 20\nlock_timeout_ms = 250"
    )?;
    let config = CacheConfig::load(file.path())?;
    assert_eq!(config.chain_batch_size, Some(8));
    assert_eq!(config.map_shards, None);

    let options = config.into_options()?;
    let defaults = CacheOptions::default();
    assert_eq!(options.chain_batch_size, 8);
    assert_eq!(options.dense_node_threshold, 20);
    assert_eq!(options.lock_timeout, Duration::from_millis(250));
    assert_eq!(options.map_shards, defaults.map_shards);
    assert_eq!(options.cache_budget_bytes, defaults.cache_budget_bytes);

    let (kernel, _store) = GraphKernel::in_memory(options)?;
    assert_eq!(kernel.cache().loader().batch_size(), 8);
    Ok(())
}

#[test]
fn rendered_config_parses_back() -> TestResult {
    let config = CacheConfig {
        map_shards: Some(4),
        cache_budget_bytes: Some(1 << 20),
        ..CacheConfig::default()
    };
    let rendered = config.to_toml_string()?;
    assert_eq!(CacheConfig::from_toml_str(&rendered)?, config);
    Ok(())
}

#[test]
fn bad_configs_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        CacheConfig::load(&missing),
        Err(ConfigError::Read { .. })
    ));
    assert!(matches!(
        CacheConfig::from_toml_str("batch = 3"),
        Err(ConfigError::Parse(_))
    ));
    let zero = CacheConfig::from_toml_str("chain_batch_size = 0").expect("valid toml");
    assert!(matches!(zero.into_options(), Err(ConfigError::Invalid(_))));
    let tiny = CacheConfig::from_toml_str("dense_node_threshold = 1").expect("valid toml");
    assert!(matches!(tiny.into_options(), Err(ConfigError::Invalid(_))));
}
