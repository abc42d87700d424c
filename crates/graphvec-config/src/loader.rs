//! Configuration loader with layered sources.

use crate::AppConfig;
use config::{Config, ConfigError, Environment, File, Map};
use graphvec_core::GraphvecError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix for structured environment overrides (`GRAPHVEC__WORKER__MAX_RETRIES`).
pub const ENV_PREFIX: &str = "GRAPHVEC";

/// Flat environment variables recognised for compatibility with existing
/// deployments, mapped to their configuration key.
const FLAT_ALIASES: &[(&str, &str)] = &[
    ("MAX_RETRIES", "worker.max_retries"),
    ("RETRY_DELAY_MS", "worker.retry_delay_ms"),
    ("MAX_RETRY_DELAY_MS", "worker.max_retry_delay_ms"),
    ("BROKER_URL", "broker.url"),
    ("RABBITMQ_URL", "broker.url"),
    ("QUEUE_NAME", "broker.queue_name"),
    ("STORE_URL", "store.url"),
    ("DATABASE_URL", "store.url"),
    ("GENERATION_API_KEY", "generation.api_key"),
    ("OPENAI_API_KEY", "generation.api_key"),
    ("GENERATION_MODEL", "generation.model"),
];

/// Loads [`AppConfig`] from layered sources.
///
/// Sources in increasing precedence:
/// 1. `{config_dir}/default.toml`
/// 2. `{config_dir}/{GRAPHVEC_ENVIRONMENT}.toml`
/// 3. `{config_dir}/local.toml`
/// 4. Flat aliases such as `MAX_RETRIES` or `DATABASE_URL`
/// 5. Environment variables with the `GRAPHVEC__` prefix
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    env: Option<Map<String, String>>,
}

impl ConfigLoader {
    /// Creates a loader reading files from `config_dir` and the process environment.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            env: None,
        }
    }

    /// Creates a loader for the default location (`./config`).
    #[must_use]
    pub fn from_default_location() -> Self {
        Self::new("./config")
    }

    /// Replaces the process environment with the given variables.
    #[must_use]
    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Loads and validates the configuration.
    pub fn load(&self) -> Result<AppConfig, GraphvecError> {
        let config = self.load_unvalidated()?;

        config.validate().map_err(|errors| {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            GraphvecError::configuration(joined)
        })?;

        Ok(config)
    }

    /// Loads the configuration without validating it.
    pub fn load_unvalidated(&self) -> Result<AppConfig, GraphvecError> {
        if self.env.is_none() {
            if let Err(e) = dotenvy::dotenv() {
                debug!("No .env file found or error loading it: {}", e);
            }
        }

        let environment = self
            .var("GRAPHVEC_ENVIRONMENT")
            .unwrap_or_else(|| "development".to_string());

        info!(environment = %environment, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = self.config_dir.join(format!("{name}.toml"));
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        for (var, key) in FLAT_ALIASES {
            if self.var(&prefixed_name(key)).is_some() {
                continue;
            }
            if let Some(value) = self.var(var) {
                debug!(variable = var, key = key, "Applying flat environment override");
                builder = builder.set_override(*key, value).map_err(config_error)?;
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(self.env.clone()),
        );

        builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(config_error)
    }

    fn var(&self, name: &str) -> Option<String> {
        match &self.env {
            Some(env) => env.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
        .filter(|value| !value.is_empty())
    }
}

fn prefixed_name(key: &str) -> String {
    format!("{ENV_PREFIX}__{}", key.replace('.', "__").to_uppercase())
}

fn config_error(err: ConfigError) -> GraphvecError {
    GraphvecError::configuration(err.to_string())
}
