//! Configuration validation.

use crate::{AppConfig, BrokerConfig, CircuitBreakerSettings, GenerationConfig, StoreConfig, WorkerSettings};
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// A required credential or URL is missing.
    MissingRequired { name: String },
    /// URL format or scheme is invalid.
    InvalidUrl { url_type: String, message: String },
    /// A value that must be positive is zero.
    NonPositive { name: String },
    /// The backoff cap is below the base delay.
    RetryDelayCapBelowBase { base_ms: u64, cap_ms: u64 },
    /// The backoff multiplier would shrink delays.
    InvalidMultiplier { value: f64 },
    /// Expected vector dimension is zero.
    InvalidDimension,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRequired { name } => write!(f, "Missing required setting: {name}"),
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {url_type} URL: {message}")
            }
            Self::NonPositive { name } => write!(f, "Setting '{name}' must be greater than zero"),
            Self::RetryDelayCapBelowBase { base_ms, cap_ms } => write!(
                f,
                "max_retry_delay_ms ({cap_ms}) cannot be lower than retry_delay_ms ({base_ms})"
            ),
            Self::InvalidMultiplier { value } => {
                write!(f, "Invalid retry multiplier: {value} (must be >= 1.0)")
            }
            Self::InvalidDimension => write!(f, "Generation dimension must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

impl AppConfig {
    /// Validates this configuration. See [`ConfigValidator::validate`].
    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        ConfigValidator::validate(self)
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_worker(&config.worker, &mut errors);
        Self::validate_broker(&config.broker, &mut errors);
        Self::validate_store(&config.store, &mut errors);
        Self::validate_generation(&config.generation, &mut errors);
        Self::validate_circuit_breaker(&config.circuit_breaker, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_worker(config: &WorkerSettings, errors: &mut Vec<ConfigValidationError>) {
        if config.prefetch == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "worker.prefetch".to_string(),
            });
        }
        if config.retry_delay_ms == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "worker.retry_delay_ms".to_string(),
            });
        }
        if config.max_retry_delay_ms < config.retry_delay_ms {
            errors.push(ConfigValidationError::RetryDelayCapBelowBase {
                base_ms: config.retry_delay_ms,
                cap_ms: config.max_retry_delay_ms,
            });
        }
        if config.retry_multiplier < 1.0 || config.retry_multiplier.is_nan() {
            errors.push(ConfigValidationError::InvalidMultiplier {
                value: config.retry_multiplier,
            });
        }
        if config.job_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "worker.job_timeout_secs".to_string(),
            });
        }
        if config.drain_poll_interval_ms == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "worker.drain_poll_interval_ms".to_string(),
            });
        }
        if config.initial_connect_attempts == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "worker.initial_connect_attempts".to_string(),
            });
        }
        if let Some(dlq) = &config.dead_letter_queue {
            if dlq.trim().is_empty() {
                errors.push(ConfigValidationError::MissingRequired {
                    name: "worker.dead_letter_queue".to_string(),
                });
            }
        }
    }

    fn validate_broker(config: &BrokerConfig, errors: &mut Vec<ConfigValidationError>) {
        match Url::parse(&config.url) {
            Ok(url) if matches!(url.scheme(), "amqp" | "amqps") => {}
            Ok(url) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "broker".to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            }),
            Err(e) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "broker".to_string(),
                message: e.to_string(),
            }),
        }
        if config.queue_name.trim().is_empty() {
            errors.push(ConfigValidationError::MissingRequired {
                name: "broker.queue_name".to_string(),
            });
        }
    }

    fn validate_store(config: &StoreConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.url.trim().is_empty() {
            errors.push(ConfigValidationError::MissingRequired {
                name: "store.url".to_string(),
            });
        } else if let Err(e) = Url::parse(&config.url) {
            errors.push(ConfigValidationError::InvalidUrl {
                url_type: "store".to_string(),
                message: e.to_string(),
            });
        }
        if config.max_connections == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "store.max_connections".to_string(),
            });
        }
    }

    fn validate_generation(config: &GenerationConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.api_key.as_deref().map_or(true, |key| key.trim().is_empty()) {
            errors.push(ConfigValidationError::MissingRequired {
                name: "generation.api_key".to_string(),
            });
        }
        if let Err(e) = Url::parse(&config.base_url) {
            errors.push(ConfigValidationError::InvalidUrl {
                url_type: "generation".to_string(),
                message: e.to_string(),
            });
        }
        if config.dimension == 0 {
            errors.push(ConfigValidationError::InvalidDimension);
        }
    }

    fn validate_circuit_breaker(config: &CircuitBreakerSettings, errors: &mut Vec<ConfigValidationError>) {
        if config.failure_threshold == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "circuit_breaker.failure_threshold".to_string(),
            });
        }
        if config.half_open_success_threshold == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "circuit_breaker.half_open_success_threshold".to_string(),
            });
        }
        if config.half_open_max_calls == 0 {
            errors.push(ConfigValidationError::NonPositive {
                name: "circuit_breaker.half_open_max_calls".to_string(),
            });
        }
    }
}
