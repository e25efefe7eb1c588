//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, URLs and value ranges
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: LiveSyncConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::schema::LiveSyncConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroConnections,

    #[error("listener.max_connections {0} exceeds the limit of {max}", max = Semaphore::MAX_PERMITS)]
    TooManyConnections(usize),

    #[error("socket.endpoint {0:?} must start with '/'")]
    Endpoint(String),

    #[error("socket.path_timeout_secs must be greater than zero")]
    ZeroPathTimeout,

    #[error("client.url {0:?} must be a ws:// or wss:// URL")]
    ClientUrl(String),

    #[error("observability.log_level {0:?} is not a known level")]
    LogLevel(String),

    #[error("observability.metrics_address {0:?} is not a socket address")]
    MetricsAddress(String),
}

/// Check every field, collecting all problems.
pub fn validate_config(config: &LiveSyncConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroConnections);
    } else if config.listener.max_connections > Semaphore::MAX_PERMITS {
        errors.push(ValidationError::TooManyConnections(
            config.listener.max_connections,
        ));
    }

    if !config.socket.endpoint.starts_with('/') {
        errors.push(ValidationError::Endpoint(config.socket.endpoint.clone()));
    }
    if config.socket.path_timeout_secs == 0 {
        errors.push(ValidationError::ZeroPathTimeout);
    }

    match Url::parse(&config.client.url) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
        _ => errors.push(ValidationError::ClientUrl(config.client.url.clone())),
    }

    let level = config.observability.log_level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::LogLevel(
            config.observability.log_level.clone(),
        ));
    }
    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
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
    fn test_defaults_are_valid() {
        assert_eq!(validate_config(&LiveSyncConfig::default()), Ok(()));
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = LiveSyncConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.listener.max_connections = 0;
        config.socket.endpoint = "ws".into();
        config.client.url = "http://localhost/ws".into();
        config.observability.log_level = "loud".into();
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "bad".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 6);
        assert!(errors.contains(&ValidationError::ZeroConnections));
        assert!(errors.contains(&ValidationError::Endpoint("ws".into())));
    }

    #[test]
    fn test_connection_limit_bounded_by_semaphore() {
        let mut config = LiveSyncConfig::default();
        config.listener.max_connections = Semaphore::MAX_PERMITS;
        assert!(validate_config(&config).is_ok());

        config.listener.max_connections = Semaphore::MAX_PERMITS + 1;
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::TooManyConnections(
                Semaphore::MAX_PERMITS + 1
            )])
        );
    }

    #[test]
    fn test_metrics_address_ignored_when_disabled() {
        let mut config = LiveSyncConfig::default();
        config.observability.metrics_address = "bad".into();
        assert!(validate_config(&config).is_ok());
    }
}
