//! Batch-scoped mutation tracking and rollback.
//!
//! A checkpoint lists exactly the rows one unit of work touched: ids of
//! inserted records, pre-images of updated records and ids of inserted
//! dependent rows. Rolling it back never touches rows outside that list.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{DependentKind, RecordId, Store, StoreResult, StoredRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Equal to the owning batch id for batched work.
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub added_records: Vec<RecordId>,
    /// Rows as they were before the first update in this checkpoint.
    pub updated_records: Vec<StoredRecord>,
    pub added_dependents: Vec<(DependentKind, i64)>,
}

impl Checkpoint {
    pub fn new(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            added_records: Vec::new(),
            updated_records: Vec::new(),
            added_dependents: Vec::new(),
        }
    }

    pub fn track_addition(&mut self, id: RecordId) {
        self.added_records.push(id);
    }

    /// Keep the earliest pre-image per record.
    pub fn track_update(&mut self, pre_image: StoredRecord) {
        if !self.updated_records.iter().any(|r| r.id == pre_image.id) {
            self.updated_records.push(pre_image);
        }
    }

    pub fn track_dependent(&mut self, kind: DependentKind, id: i64) {
        self.added_dependents.push((kind, id));
    }

    pub fn is_empty(&self) -> bool {
        self.added_records.is_empty() && self.updated_records.is_empty() && self.added_dependents.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub records_removed: usize,
    pub records_restored: usize,
    pub dependents_removed: usize,
}

/// Undo everything tracked in `checkpoint`.
///
/// Dependents go first, then updates are restored, then additions are
/// deleted. Rows already gone are skipped.
pub fn rollback_checkpoint(store: &dyn Store, checkpoint: &Checkpoint) -> StoreResult<RollbackSummary> {
    let mut summary = RollbackSummary::default();

    for (kind, id) in checkpoint.added_dependents.iter().rev() {
        if store.delete_dependent(*kind, *id)? {
            summary.dependents_removed += 1;
        }
    }

    let added: HashSet<RecordId> = checkpoint.added_records.iter().copied().collect();
    for pre_image in &checkpoint.updated_records {
        // An update to a row this checkpoint also inserted is undone by the delete.
        if added.contains(&pre_image.id) {
            continue;
        }
        store.update_record(pre_image)?;
        summary.records_restored += 1;
    }

    for id in checkpoint.added_records.iter().rev() {
        if store.delete_record(*id)? {
            summary.records_removed += 1;
        }
    }

    tracing::info!(
        checkpoint_id = %checkpoint.id,
        records_removed = summary.records_removed,
        records_restored = summary.records_restored,
        dependents_removed = summary.dependents_removed,
        "Rolled back checkpoint"
    );
    Ok(summary)
}
