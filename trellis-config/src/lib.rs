//! Layered configuration for Trellis applications.
//!
//! Sources are applied in order, later ones overriding earlier keys:
//! built-in defaults, a configuration file (JSON, TOML or `.env`), and finally
//! `TRELLIS_*` environment variables.
//!
//! ```
//! use trellis_config::{AppConfig, ConfigManager};
//!
//! let manager = ConfigManager::new();
//! manager.set("log_level", "debug").unwrap();
//! let config: AppConfig = manager.load_validated().unwrap();
//! assert_eq!(config.log_level, "debug");
//! ```

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::{ENV_PREFIX, EnvLoader};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat, coerce};
pub use validation::{ConfigValidator, Validate};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Key/value configuration store shared between clones
#[derive(Clone, Default)]
pub struct ConfigManager {
    values: Arc<RwLock<HashMap<String, Value>>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom environment prefix instead of [`ENV_PREFIX`]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            values: Arc::default(),
            env_prefix: Some(prefix.into()),
        }
    }

    fn env_loader(&self) -> EnvLoader {
        match &self.env_prefix {
            Some(prefix) => EnvLoader::new(prefix.clone()),
            None => EnvLoader::default(),
        }
    }

    /// Merge prefixed variables from the process environment
    pub fn load_env(&self) -> Result<()> {
        let loaded = self.env_loader().load();
        self.merge_strings(loaded);
        Ok(())
    }

    /// Merge prefixed variables from an explicit iterator
    pub fn load_env_from<I>(&self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let loaded = self.env_loader().load_from(vars);
        self.merge_strings(loaded);
    }

    /// Read a `.env` file into the process environment, then merge prefixed variables
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
            }
            None => {
                // A missing default .env file is not an error
                dotenvy::dotenv().ok();
            }
        }
        self.load_env()
    }

    /// Merge the top-level keys of a configuration file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = ConfigLoader::auto(path)?.load_file(path)?;
        if let Value::Object(map) = data {
            let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
            values.extend(map);
        }
        Ok(())
    }

    fn merge_strings(&self, loaded: HashMap<String, String>) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for (key, raw) in loaded {
            values.insert(key, coerce(&raw));
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json = serde_json::to_value(value)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), json);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let value = values
            .get(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::DeserializationError(format!("{}: {}", key, e)))
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.contains_key(key)
    }

    /// Deserialize every key into `T` and run its validation rules
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let object = {
            let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
            Value::Object(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        };

        let config: T = serde_json::from_value(object)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Log levels accepted by [`AppConfig::log_level`]
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Log formats accepted by [`AppConfig::log_format`]
pub const LOG_FORMATS: [&str; 4] = ["json", "plain", "pretty", "compact"];

/// Settings consumed by the application bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_format: String,
    /// Commit programmatic module changes after a successful reinit
    pub autocommit: bool,
    /// Warn about extension-like multi providers missing from `extensions`
    pub warn_unregistered_extensions: bool,
    /// Route prefix applied to the root module
    pub path_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            autocommit: true,
            warn_unregistered_extensions: true,
            path_prefix: String::new(),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `TRELLIS_*` environment variables
    pub fn from_env() -> Result<Self> {
        let manager = ConfigManager::new();
        manager.load_env()?;
        manager.load_validated()
    }

    /// Defaults overridden by a file, then by the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let manager = ConfigManager::new();
        manager.load_file(path)?;
        manager.load_env()?;
        manager.load_validated()
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        ConfigValidator::one_of(&self.log_level, &LOG_LEVELS, "log_level")?;
        ConfigValidator::one_of(&self.log_format, &LOG_FORMATS, "log_format")?;
        ConfigValidator::path_segment(&self.path_prefix, "path_prefix")?;
        Ok(())
    }
}
