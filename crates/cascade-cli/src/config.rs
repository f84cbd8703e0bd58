//! CLI configuration management.
//!
//! Layers, lowest precedence first: built-in defaults, a JSON config file
//! (the platform config dir, or `--config`), then `CASCADE_*` environment
//! variables, which `.env` may provide.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cascade_core::EngineConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Application-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings handed to every universe the CLI starts.
    pub engine: EngineConfig,

    /// Number of nodes the demo scenarios create.
    pub size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            size: 5,
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment variables.
    ///
    /// `explicit` replaces the platform config file and must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        // Load .env file if present (silently ignore if missing)
        let _ = dotenvy::dotenv();

        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_file_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Override fields from `CASCADE_*` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {key}: {value}"))
        }

        let engine = &mut self.engine;
        if let Some(v) = var("CASCADE_DEV_MODE") {
            engine.dev_mode = parse("CASCADE_DEV_MODE", v)?;
        }
        if let Some(v) = var("CASCADE_RUN_SEQUENTIAL") {
            engine.run_sequential = parse("CASCADE_RUN_SEQUENTIAL", v)?;
        }
        if let Some(v) = var("CASCADE_PARALLELISM") {
            engine.parallelism = parse::<usize>("CASCADE_PARALLELISM", v)?.max(1);
        }
        if let Some(v) = var("CASCADE_MAX_IN_QUEUE") {
            engine.max_in_queue = parse("CASCADE_MAX_IN_QUEUE", v)?;
        }
        if let Some(v) = var("CASCADE_MAX_NR_OF_CHANGES") {
            engine.max_nr_of_changes = parse("CASCADE_MAX_NR_OF_CHANGES", v)?;
        }
        if let Some(v) = var("CASCADE_MAX_NR_OF_HISTORY") {
            engine.max_nr_of_history = parse("CASCADE_MAX_NR_OF_HISTORY", v)?;
        }
        if let Some(v) = var("CASCADE_SIZE") {
            self.size = parse("CASCADE_SIZE", v)?;
        }
        Ok(())
    }

    /// Get the path to the config file.
    pub fn config_file_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "cascade", "cascade")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "size": 12, "engine": { "dev_mode": true, "max_nr_of_changes": 4 } }"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.size, 12);
        assert!(config.engine.dev_mode);
        assert_eq!(config.engine.max_nr_of_changes, 4);
        assert_eq!(config.engine.max_in_queue, EngineConfig::default().max_in_queue);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config {
            size: 12,
            ..Config::default()
        };
        let vars: HashMap<&str, &str> = [("CASCADE_SIZE", "3"), ("CASCADE_RUN_SEQUENTIAL", "true")].into();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.size, 3);
        assert!(config.engine.run_sequential);
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "CASCADE_PARALLELISM").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CASCADE_PARALLELISM"));
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.json"))).is_err());
    }
}
