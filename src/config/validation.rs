//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses and value ranges
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: FastwireConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::FastwireConfig;

/// Smallest buffer that can hold a realistic message head.
pub const MIN_BUFFER_SIZE: usize = 256;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

fn check_buffer(errors: &mut Vec<ValidationError>, field: &'static str, size: usize) {
    if size != 0 && size < MIN_BUFFER_SIZE {
        errors.push(ValidationError::new(
            field,
            format!("must be 0 (default) or at least {MIN_BUFFER_SIZE} bytes, got {size}"),
        ));
    }
}

/// Checks a configuration, collecting every problem found.
pub fn validate_config(config: &FastwireConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    check_buffer(&mut errors, "server.read_buffer_size", config.server.read_buffer_size);
    check_buffer(&mut errors, "server.write_buffer_size", config.server.write_buffer_size);
    check_buffer(&mut errors, "client.read_buffer_size", config.client.read_buffer_size);
    check_buffer(&mut errors, "client.write_buffer_size", config.client.write_buffer_size);

    if config.server.name.is_empty() {
        errors.push(ValidationError::new("server.name", "must not be empty"));
    }
    if http::HeaderValue::from_str(&config.server.name).is_err() {
        errors.push(ValidationError::new("server.name", "must be a valid header value"));
    }
    if http::HeaderValue::from_str(&config.client.name).is_err() {
        errors.push(ValidationError::new("client.name", "must be a valid header value"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
