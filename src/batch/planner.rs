//! Batch division and pre-flight validation.

use std::collections::HashSet;

use uuid::Uuid;

use crate::api::UpstreamRecord;
use crate::batch::types::WorkItem;
use crate::store::{Batch, BatchStatus, Chamber, NewRecord, RecordFields, RecordStatus, TaskId};
use crate::sync::planner::{parse_date, parse_timestamp};

/// Contiguous, order-preserving chunks of at most `size` items.
///
/// Every chunk except possibly the last has exactly `size` items; empty
/// input yields no chunks. A `size` of zero is treated as one.
pub fn divide_into_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Pending batch rows for a task, numbered from 1.
pub fn plan_batches(task_id: TaskId, items: Vec<WorkItem>, size: usize) -> Vec<Batch> {
    divide_into_batches(items, size)
        .into_iter()
        .enumerate()
        .map(|(index, payload)| Batch {
            id: Uuid::new_v4(),
            task_id,
            batch_number: index as u32 + 1,
            status: BatchStatus::Pending,
            payload,
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        })
        .collect()
}

/// Check a batch before anything is applied.
///
/// Rejects duplicate natural keys within the batch and any item with missing
/// or malformed fields. Returns every issue found.
pub fn validate_batch(items: &[WorkItem]) -> (bool, Vec<String>) {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for (index, item) in items.iter().enumerate() {
        let key = item.external_id().trim();
        if !key.is_empty() && !seen.insert(key.to_string()) {
            issues.push(format!("duplicate key {key}"));
        }
        if let Err(item_issues) = parse_record(item.record()) {
            let label = if key.is_empty() { format!("item {}", index + 1) } else { key.to_string() };
            issues.extend(item_issues.into_iter().map(|issue| format!("{label}: {issue}")));
        }
    }

    (issues.is_empty(), issues)
}

/// Convert a wire record into a typed row, collecting every field problem.
pub fn parse_record(record: &UpstreamRecord) -> Result<NewRecord, Vec<String>> {
    let mut issues = Vec::new();

    let external_id = record.external_id.trim().to_string();
    if external_id.is_empty() {
        issues.push("missing required field external_id".to_string());
    }

    let title = match non_blank(&record.title) {
        Some(title) => title.to_string(),
        None => {
            issues.push("missing required field title".to_string());
            String::new()
        }
    };

    let date = match non_blank(&record.date) {
        Some(raw) => match parse_date(raw) {
            Some(date) => Some(date),
            None => {
                issues.push(format!("malformed date '{raw}'"));
                None
            }
        },
        None => {
            issues.push("missing required field date".to_string());
            None
        }
    };

    let status = match non_blank(&record.status) {
        Some(raw) => match raw.parse::<RecordStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                issues.push(e);
                None
            }
        },
        None => {
            issues.push("missing required field status".to_string());
            None
        }
    };

    let chamber = match non_blank(&record.chamber) {
        Some(raw) => match raw.parse::<Chamber>() {
            Ok(chamber) => Some(chamber),
            Err(e) => {
                issues.push(e);
                None
            }
        },
        None => {
            issues.push("missing required field chamber".to_string());
            None
        }
    };

    let congress = match non_blank(&record.congress) {
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                issues.push(format!("malformed congress '{raw}'"));
                None
            }
        },
        None => {
            issues.push("missing required field congress".to_string());
            None
        }
    };

    for witness in &record.witnesses {
        if witness.name.trim().is_empty() {
            issues.push("witness with blank name".to_string());
        }
    }
    for document in &record.documents {
        if document.title.trim().is_empty() {
            issues.push("document with blank title".to_string());
        }
    }

    match (date, status, chamber, congress) {
        (Some(date), Some(status), Some(chamber), Some(congress)) if issues.is_empty() => Ok(NewRecord {
            external_id,
            chamber,
            congress,
            fields: RecordFields {
                title,
                date,
                status,
                location: non_blank(&record.location).map(str::to_string),
            },
            committee_codes: normalized_codes(&record.committee_codes),
            last_modified: record.last_modified.as_deref().and_then(parse_timestamp),
        }),
        _ => Err(issues),
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn normalized_codes(codes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = codes
        .iter()
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
