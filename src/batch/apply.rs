//! Applying work items to the store.
//!
//! Shared by direct runs and batch execution. Every mutation is recorded in
//! the caller's checkpoint, which is saved after each item so an interrupted
//! batch can still be rolled back.

use chrono::{DateTime, Utc};

use crate::api::UpstreamRecord;
use crate::batch::checkpoint::Checkpoint;
use crate::batch::planner::parse_record;
use crate::batch::types::WorkItem;
use crate::store::{BatchResult, DependentKind, RecordId, Store, StoreError};

/// Apply `items` in order. Per-item failures are collected, never raised.
pub fn apply_items(
    store: &dyn Store,
    items: &[WorkItem],
    checkpoint: &mut Checkpoint,
    now: DateTime<Utc>,
) -> BatchResult {
    let mut result = BatchResult::default();

    for item in items {
        let outcome = match item {
            WorkItem::Add { record } => apply_addition(store, record, checkpoint, now),
            WorkItem::Update { record_id, record, .. } => apply_update(store, *record_id, record, checkpoint, now),
        };

        match outcome {
            Ok(applied) => {
                if item.is_addition() {
                    result.added += 1;
                } else {
                    result.updated += 1;
                }
                result.dependents_added += applied;
            }
            Err(message) => {
                tracing::warn!(external_id = %item.external_id(), error = %message, "Failed to apply item");
                result.errors.push(format!("{}: {}", item.external_id(), message));
            }
        }

        if let Err(e) = store.save_checkpoint(checkpoint) {
            result.errors.push(format!("failed to save checkpoint: {e}"));
        }
    }

    result
}

/// Returns the number of dependent rows written.
fn apply_addition(
    store: &dyn Store,
    record: &UpstreamRecord,
    checkpoint: &mut Checkpoint,
    now: DateTime<Utc>,
) -> Result<usize, String> {
    let new_record = parse_record(record).map_err(|issues| issues.join("; "))?;
    let stored = store.insert_record(new_record, now).map_err(|e| match e {
        StoreError::DuplicateKey(key) => format!("duplicate key {key}"),
        other => other.to_string(),
    })?;
    checkpoint.track_addition(stored.id);

    write_dependents(store, stored.id, record, checkpoint)
}

fn apply_update(
    store: &dyn Store,
    record_id: RecordId,
    record: &UpstreamRecord,
    checkpoint: &mut Checkpoint,
    now: DateTime<Utc>,
) -> Result<usize, String> {
    let parsed = parse_record(record).map_err(|issues| issues.join("; "))?;
    let existing = store
        .get_record(record_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("record {record_id} no longer exists"))?;

    let mut updated = existing.clone();
    updated.fields = parsed.fields;
    updated.chamber = parsed.chamber;
    updated.congress = parsed.congress;
    updated.committee_codes = parsed.committee_codes;
    updated.last_modified = parsed.last_modified.or(existing.last_modified);
    updated.updated_at = now;

    checkpoint.track_update(existing);
    store.update_record(&updated).map_err(|e| e.to_string())?;

    write_dependents(store, record_id, record, checkpoint)
}

/// Insert witnesses and documents not already attached to the record.
fn write_dependents(
    store: &dyn Store,
    record_id: RecordId,
    record: &UpstreamRecord,
    checkpoint: &mut Checkpoint,
) -> Result<usize, String> {
    let mut written = 0;

    let known_witnesses = store.list_witnesses(record_id).map_err(|e| e.to_string())?;
    for witness in &record.witnesses {
        let name = witness.name.trim();
        if known_witnesses.iter().any(|w| w.name == name) {
            continue;
        }
        let row = store
            .insert_witness(record_id, name, witness.organization.as_deref())
            .map_err(|e| e.to_string())?;
        checkpoint.track_dependent(DependentKind::Witness, row.id);
        written += 1;
    }

    let known_documents = store.list_documents(record_id).map_err(|e| e.to_string())?;
    for document in &record.documents {
        let title = document.title.trim();
        if known_documents.iter().any(|d| d.title == title && d.url == document.url) {
            continue;
        }
        let row = store
            .insert_document(record_id, title, document.url.as_deref(), document.kind.as_deref())
            .map_err(|e| e.to_string())?;
        checkpoint.track_dependent(DependentKind::Document, row.id);
        written += 1;
    }

    Ok(written)
}
