//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the sync
//! engine. All types derive Serde traits for deserialization from TOML.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Upstream API connection settings.
    pub api: ApiConfig,

    /// Rolling-window limit applied to every outbound call.
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker protecting the upstream API.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry configuration for transient upstream failures.
    pub retries: RetryConfig,

    /// Change detection and batching.
    pub sync: SyncSettings,

    /// Persistent store and backups.
    pub store: StoreConfig,

    /// Pre-flight sanity thresholds.
    pub sanity: SanityConfig,

    /// Batch worker process.
    pub worker: WorkerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Upstream API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, e.g. "https://api.example.org/v3".
    pub base_url: String,

    /// API key credential, sent as the `api_key` query parameter.
    pub api_key: String,

    /// Path of the paginated record listing.
    pub records_path: String,

    /// Path of the record detail endpoint; `{id}` is replaced by the natural key.
    pub detail_path: String,

    /// Page size requested; a shorter page ends pagination.
    pub page_size: usize,

    pub connect_timeout_secs: u64,

    pub read_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: String::new(),
            records_path: "/records".to_string(),
            detail_path: "/records/{id}".to_string(),
            page_size: 250,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum calls in any trailing window.
    pub max_requests: usize,

    /// Window length in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 5000,
            window_secs: 3600,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probation.
    pub recovery_timeout_secs: u64,

    /// Consecutive successes in probation that close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 2,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// Change detection and batching settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Incremental mode keeps records modified within this many days.
    pub lookback_days: i64,

    /// Incremental fetch window reaches this far into the past...
    pub fetch_past_days: i64,

    /// ...and this far into the future, so far-off records edited today are seen.
    pub fetch_future_days: i64,

    /// Work items per batch.
    pub batch_size: usize,

    /// Plans with more work items than this are executed through the batch chain.
    /// Full-mode plans are always batched.
    pub batch_threshold: usize,

    /// Drive the batch chain to completion in-process instead of returning
    /// as soon as the first batch is dispatched.
    pub wait_for_batches: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            fetch_past_days: 30,
            fetch_future_days: 180,
            batch_size: 50,
            batch_threshold: 200,
            wait_for_batches: true,
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database shared by every process. Empty keeps the store in memory.
    pub path: String,

    /// How long a write waits on another process holding the database lock.
    pub busy_timeout_ms: u64,

    /// Directory that receives whole-store backups.
    pub backup_dir: String,

    /// Backups older than this are pruned after a successful run.
    pub backup_retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "data/record-sync.db".to_string(),
            busy_timeout_ms: 5000,
            backup_dir: "data/backups".to_string(),
            backup_retention_days: 14,
        }
    }
}

/// Pre-flight sanity thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SanityConfig {
    /// Minimum records the store must hold before a mutating run.
    pub min_records: usize,

    /// A run finishing less than this many seconds ago blocks a new run.
    pub min_run_interval_secs: u64,

    /// Referential-integrity violations tolerated before aborting.
    pub max_integrity_violations: usize,
}

impl Default for SanityConfig {
    fn default() -> Self {
        Self {
            min_records: 0,
            min_run_interval_secs: 300,
            max_integrity_violations: 0,
        }
    }
}

/// How the executor signals the next batch.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Durable work queue in the store, drained by the worker.
    #[default]
    Queue,
    /// Fire-and-forget POST to the worker's batch endpoint.
    Http,
}

/// Batch worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bind address of the worker HTTP surface.
    pub bind_address: String,

    /// URL other invocations use to reach this worker.
    pub public_url: String,

    /// Bearer token required on worker endpoints, if set.
    pub auth_token: Option<String>,

    /// Upper bound on any single worker request, including `POST /runs`.
    pub request_timeout_secs: u64,

    pub trigger: TriggerKind,

    /// Timeout of the fire-and-forget trigger call.
    pub trigger_timeout_ms: u64,

    /// Liveness sweep interval.
    pub sweep_interval_secs: u64,

    /// Batches running longer than this are considered stalled.
    pub stale_batch_secs: u64,

    /// Durable queue polling interval.
    pub queue_poll_interval_ms: u64,

    /// Queue deliveries attempted per batch before giving up to the sweep.
    pub max_trigger_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8090".to_string(),
            public_url: "http://127.0.0.1:8090".to_string(),
            auth_token: None,
            request_timeout_secs: 900,
            trigger: TriggerKind::Queue,
            trigger_timeout_ms: 1500,
            sweep_interval_secs: 60,
            stale_batch_secs: 900,
            queue_poll_interval_ms: 500,
            max_trigger_attempts: 3,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the pretty format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
