//! Configuration validation.
//!
//! Serde handles syntax; this checks value ranges and cross-field rules.
//! Every problem is reported, not just the first.

use std::fmt;

use url::Url;

use crate::config::schema::{SyncConfig, TriggerKind};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
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

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &SyncConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if Url::parse(&config.api.base_url).is_err() {
        errors.push(ValidationError::new("api.base_url", "must be an absolute URL"));
    }
    if config.api.page_size == 0 {
        errors.push(ValidationError::new("api.page_size", "must be > 0"));
    }
    if !config.api.detail_path.contains("{id}") {
        errors.push(ValidationError::new("api.detail_path", "must contain an {id} placeholder"));
    }
    if config.api.connect_timeout_secs == 0 || config.api.read_timeout_secs == 0 {
        errors.push(ValidationError::new("api", "timeouts must be > 0"));
    }

    if config.rate_limit.max_requests == 0 {
        errors.push(ValidationError::new("rate_limit.max_requests", "must be > 0"));
    }
    if config.rate_limit.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be > 0"));
    }

    if config.circuit_breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be > 0"));
    }
    if config.circuit_breaker.success_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.success_threshold", "must be > 0"));
    }

    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be >= 1"));
    }
    if config.retries.base_delay_ms > config.retries.max_delay_ms {
        errors.push(ValidationError::new("retries.base_delay_ms", "must not exceed max_delay_ms"));
    }

    if config.sync.batch_size == 0 {
        errors.push(ValidationError::new("sync.batch_size", "must be > 0"));
    }
    if config.sync.lookback_days < 0 || config.sync.fetch_past_days < 0 || config.sync.fetch_future_days < 0 {
        errors.push(ValidationError::new("sync", "day windows must not be negative"));
    }
    if config.sync.lookback_days > config.sync.fetch_past_days {
        errors.push(ValidationError::new(
            "sync.lookback_days",
            "must not exceed fetch_past_days",
        ));
    }

    if config.store.backup_retention_days < 0 {
        errors.push(ValidationError::new("store.backup_retention_days", "must not be negative"));
    }

    if config.worker.trigger == TriggerKind::Http && Url::parse(&config.worker.public_url).is_err() {
        errors.push(ValidationError::new(
            "worker.public_url",
            "must be an absolute URL when trigger = \"http\"",
        ));
    }
    if config.worker.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("worker.sweep_interval_secs", "must be > 0"));
    }
    if config.worker.request_timeout_secs == 0 {
        errors.push(ValidationError::new("worker.request_timeout_secs", "must be > 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
