//! Logging initialisation.
//!
//! Builds a `tracing-subscriber` registry with an `EnvFilter` and either the
//! human-readable or the JSON formatting layer.

use crate::{GraphvecError, GraphvecResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit one JSON object per line instead of pretty text.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info,graphvec=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::filter`].
pub fn init_logging(config: &LoggingConfig) -> GraphvecResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| GraphvecError::configuration(format!("Invalid log filter: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| GraphvecError::internal(format!("Failed to install subscriber: {e}")))
}
