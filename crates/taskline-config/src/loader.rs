//! Configuration loader with layered sources.

use crate::{AppConfig, BackoffKind};
use config::{Config, ConfigError, Environment, File};
use std::path::Path;
use std::sync::Arc;
use taskline_core::TasklineError;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Environment variable prefix for overrides (`TASKLINE_JOBS__WORKER__CONCURRENCY=4`).
pub const ENV_PREFIX: &str = "TASKLINE";

/// Configuration loader with runtime reload support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `TASKLINE_` prefix
    pub fn new(config_dir: impl Into<String>) -> Result<Self, TasklineError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, TasklineError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    pub async fn reload(&self) -> Result<(), TasklineError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &str) -> Result<AppConfig, TasklineError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("TASKLINE_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!(environment = %environment, config_dir = %config_dir, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_taskline_error)?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_taskline_error)?;

        Self::validate_config(&app_config)?;

        Ok(app_config)
    }

    /// Validates the configuration.
    pub fn validate_config(config: &AppConfig) -> Result<(), TasklineError> {
        if config.database.url.is_empty() {
            return Err(TasklineError::Configuration("Database URL is required".to_string()));
        }

        let worker = &config.jobs.worker;
        if worker.concurrency == 0 {
            return Err(TasklineError::Configuration(
                "jobs.worker.concurrency must be at least 1".to_string(),
            ));
        }
        if worker.lease_duration_ms == 0 {
            return Err(TasklineError::Configuration(
                "jobs.worker.lease_duration_ms must be positive".to_string(),
            ));
        }
        if worker.lease_renew_interval_ms >= worker.lease_duration_ms {
            warn!(
                renew_ms = worker.lease_renew_interval_ms,
                lease_ms = worker.lease_duration_ms,
                "Lease renew interval is not below lease duration; using half the lease"
            );
        }

        if config.jobs.queue.default_max_attempts == 0 {
            return Err(TasklineError::Configuration(
                "jobs.queue.default_max_attempts must be at least 1".to_string(),
            ));
        }

        let retry = &config.jobs.retry;
        if retry.strategy == BackoffKind::Exponential && retry.multiplier < 1.0 {
            return Err(TasklineError::Configuration(
                "jobs.retry.multiplier must be >= 1.0 for exponential backoff".to_string(),
            ));
        }

        Ok(())
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error_to_taskline_error(err: ConfigError) -> TasklineError {
    TasklineError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_load_defaults_from_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.jobs.worker.lease_duration_ms, 30_000);
        assert_eq!(config.jobs.queue.default_max_attempts, 1);
    }

    #[tokio::test]
    async fn test_local_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "default.toml",
            "[jobs.worker]\nconcurrency = 2\npoll_interval_ms = 250\n",
        );
        write(dir.path(), "local.toml", "[jobs.worker]\nconcurrency = 8\n");

        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.jobs.worker.concurrency, 8);
        assert_eq!(config.jobs.worker.poll_interval_ms, 250);
    }

    #[tokio::test]
    async fn test_env_override() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("TASKLINE_DATABASE__MAX_CONNECTIONS", "42");
        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        std::env::remove_var("TASKLINE_DATABASE__MAX_CONNECTIONS");

        let value: Option<u32> = loader.get_value("database.max_connections").await;
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "default.toml", "[jobs.queue]\nmax_stalled = 1\n");
        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        assert_eq!(loader.get().await.jobs.queue.max_stalled, 1);

        write(dir.path(), "default.toml", "[jobs.queue]\nmax_stalled = 5\n");
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.jobs.queue.max_stalled, 5);
    }

    #[tokio::test]
    async fn test_serialized_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let rendered = toml::to_string(&AppConfig::default()).unwrap();
        write(dir.path(), "default.toml", &rendered);

        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        let retry: Option<BackoffKind> = loader.get_value("jobs.retry.strategy").await;
        assert_eq!(retry, Some(BackoffKind::Exponential));
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.jobs.worker.concurrency = 0;
        assert!(ConfigLoader::validate_config(&config).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = AppConfig::default();
        config.jobs.queue.default_max_attempts = 0;
        assert!(ConfigLoader::validate_config(&config).is_err());
    }

    #[test]
    fn test_validation_rejects_shrinking_multiplier() {
        let mut config = AppConfig::default();
        config.jobs.retry.multiplier = 0.5;
        assert!(ConfigLoader::validate_config(&config).is_err());
    }
}
