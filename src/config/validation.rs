//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClientConfig → Result<(), Vec<ValidationError>>

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ClientConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut check = |ok: bool, field: &'static str, message: &str| {
        if !ok {
            errors.push(ValidationError {
                field,
                message: message.to_string(),
            });
        }
    };

    let client = &config.client;
    check(client.request_timeout_ms > 0, "client.request_timeout_ms", "must be greater than 0");
    check(client.connect_timeout_ms > 0, "client.connect_timeout_ms", "must be greater than 0");
    check(client.max_response_bytes > 0, "client.max_response_bytes", "must be greater than 0");

    let breaker = &config.circuit_breaker;
    check(breaker.failure_threshold > 0, "circuit_breaker.failure_threshold", "must be greater than 0");
    check(
        breaker.call_timeout_ms != Some(0),
        "circuit_breaker.call_timeout_ms",
        "must be greater than 0 when set",
    );

    let observability = &config.observability;
    check(
        LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()),
        "observability.log_level",
        "must be one of trace, debug, info, warn, error",
    );
    if observability.metrics_enabled {
        check(
            observability.metrics_address.parse::<SocketAddr>().is_ok(),
            "observability.metrics_address",
            "must be a socket address such as 0.0.0.0:9090",
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ClientConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_all_errors() {
        let mut config = ClientConfig::default();
        config.client.request_timeout_ms = 0;
        config.circuit_breaker.failure_threshold = 0;
        config.observability.log_level = "loud".to_string();
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "nowhere".to_string();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "client.request_timeout_ms",
                "circuit_breaker.failure_threshold",
                "observability.log_level",
                "observability.metrics_address",
            ]
        );
    }
}
