//! Batch payload types.

use serde::{Deserialize, Serialize};

use crate::api::UpstreamRecord;
use crate::store::{RecordFields, RecordId};

/// One planned mutation, as carried in a batch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    /// No persisted record shares the natural key.
    Add { record: UpstreamRecord },
    /// A tracked field differs from the persisted record.
    Update {
        record_id: RecordId,
        record: UpstreamRecord,
        /// Tracked fields as they were when the change was planned.
        original: RecordFields,
    },
}

impl WorkItem {
    pub fn record(&self) -> &UpstreamRecord {
        match self {
            WorkItem::Add { record } | WorkItem::Update { record, .. } => record,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.record().external_id
    }

    pub fn is_addition(&self) -> bool {
        matches!(self, WorkItem::Add { .. })
    }
}
