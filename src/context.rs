//! Explicit run context.
//!
//! Everything a component needs is reached through [`SyncContext`]; there is
//! no process-wide mutable state. Cloning is cheap (all `Arc`s).

use std::sync::Arc;
use std::time::Duration;

use crate::api::{ApiClient, RecordSource};
use crate::batch::trigger::{BatchTrigger, HttpTrigger, QueueTrigger};
use crate::clock::{Clock, SystemClock};
use crate::config::{SyncConfig, TriggerKind};
use crate::error::{SyncError, SyncResult};
use crate::notify::{Notifier, TracingNotifier};
use crate::store::{SqliteStore, Store};
use crate::validation::{StoreValidator, Validator};

#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<SyncConfig>,
    pub store: Arc<dyn Store>,
    pub source: Arc<dyn RecordSource>,
    pub notifier: Arc<dyn Notifier>,
    pub validator: Arc<dyn Validator>,
    pub trigger: Arc<dyn BatchTrigger>,
    pub clock: Arc<dyn Clock>,
}

impl SyncContext {
    /// Wire the production components described by `config`.
    pub fn from_config(config: SyncConfig) -> SyncResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_or_memory(
            &config.store.path,
            Duration::from_millis(config.store.busy_timeout_ms),
        )?);
        let source: Arc<dyn RecordSource> = Arc::new(ApiClient::new(&config, Some(store.clone()), clock.clone())?);
        let trigger = build_trigger(&config, store.clone(), clock.clone())?;

        tracing::info!(
            store = %config.store.path,
            api = %config.api.base_url,
            trigger = trigger.kind(),
            "Sync context initialized"
        );

        Ok(Self {
            validator: Arc::new(StoreValidator::new(clock.clone())),
            notifier: Arc::new(TracingNotifier),
            config: Arc::new(config),
            store,
            source,
            trigger,
            clock,
        })
    }

    /// Context over caller-supplied store and source, with the default
    /// notifier, validator and queue trigger.
    pub fn new(config: SyncConfig, store: Arc<dyn Store>, source: Arc<dyn RecordSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: Arc::new(config),
            trigger: Arc::new(QueueTrigger::new(store.clone(), clock.clone())),
            validator: Arc::new(StoreValidator::new(clock.clone())),
            notifier: Arc::new(TracingNotifier),
            store,
            source,
            clock,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn BatchTrigger>) -> Self {
        self.trigger = trigger;
        self
    }
}

fn build_trigger(config: &SyncConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> SyncResult<Arc<dyn BatchTrigger>> {
    Ok(match config.worker.trigger {
        TriggerKind::Queue => Arc::new(QueueTrigger::new(store, clock)),
        TriggerKind::Http => Arc::new(
            HttpTrigger::new(
                config.worker.public_url.clone(),
                Duration::from_millis(config.worker.trigger_timeout_ms),
                config.worker.auth_token.clone(),
            )
            .map_err(|e| SyncError::Trigger(e.to_string()))?,
        ),
    })
}
