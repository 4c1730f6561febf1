//! Change detection.
//!
//! Incremental runs fetch a wide date window and keep records whose own
//! last-modified timestamp falls inside the lookback, so far-future records
//! edited today are still seen. Full runs list everything. Each candidate
//! is matched against the store by natural key and classified.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use crate::api::{ApiError, FetchWindow, RecordSource, UpstreamRecord};
use crate::batch::types::WorkItem;
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::error::SyncResult;
use crate::store::{RecordFields, RecordStatus, Store, StoredRecord, SyncMode};

#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub mode: SyncMode,
    pub additions: Vec<WorkItem>,
    pub updates: Vec<WorkItem>,
    /// Candidates compared against the store.
    pub checked: usize,
    pub unchanged: usize,
    /// Candidates dropped before classification, with the reason.
    pub skipped: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.additions.len() + self.updates.len()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            mode: self.mode,
            checked: self.checked,
            would_add: self.additions.len(),
            would_update: self.updates.len(),
            unchanged: self.unchanged,
            skipped: self.skipped.len(),
        }
    }

    /// Additions first, then updates.
    pub fn into_work_items(self) -> Vec<WorkItem> {
        let mut items = self.additions;
        items.extend(self.updates);
        items
    }
}

/// Would-be counts reported by dry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub mode: SyncMode,
    pub checked: usize,
    pub would_add: usize,
    pub would_update: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

pub struct SyncPlanner {
    store: Arc<dyn Store>,
    source: Arc<dyn RecordSource>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl SyncPlanner {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn RecordSource>, clock: Arc<dyn Clock>, settings: SyncSettings) -> Self {
        Self {
            store,
            source,
            clock,
            settings,
        }
    }

    pub async fn plan(&self, mode: SyncMode) -> SyncResult<SyncPlan> {
        let now = self.clock.now();
        let window = fetch_window(mode, now, &self.settings);
        let listed = self.source.fetch_window(&window).await?;
        let listed_count = listed.len();

        let candidates: Vec<UpstreamRecord> = match mode {
            SyncMode::Full => listed,
            SyncMode::Incremental => {
                let cutoff = now - Duration::days(self.settings.lookback_days);
                listed
                    .into_iter()
                    .filter(|record| is_recently_modified(record, cutoff))
                    .collect()
            }
        };
        tracing::info!(%mode, listed = listed_count, candidates = candidates.len(), "Fetched candidates");

        let mut plan = SyncPlan {
            mode,
            additions: Vec::new(),
            updates: Vec::new(),
            checked: 0,
            unchanged: 0,
            skipped: Vec::new(),
        };

        for listed in candidates {
            let candidate = match self.with_detail(listed).await? {
                Ok(candidate) => candidate,
                Err(reason) => {
                    plan.skipped.push(reason);
                    continue;
                }
            };

            plan.checked += 1;
            let existing = if candidate.external_id.trim().is_empty() {
                None
            } else {
                self.store.find_record_by_external_id(candidate.external_id.trim())?
            };
            match classify(candidate, existing.as_ref()) {
                Some(item @ WorkItem::Add { .. }) => plan.additions.push(item),
                Some(item @ WorkItem::Update { .. }) => plan.updates.push(item),
                None => plan.unchanged += 1,
            }
        }

        tracing::info!(
            %mode,
            checked = plan.checked,
            additions = plan.additions.len(),
            updates = plan.updates.len(),
            unchanged = plan.unchanged,
            skipped = plan.skipped.len(),
            "Sync plan ready"
        );
        Ok(plan)
    }

    /// Merge detail into a listed record. An open circuit aborts the plan;
    /// any other failure skips the record with a reason.
    async fn with_detail(&self, listed: UpstreamRecord) -> SyncResult<Result<UpstreamRecord, String>> {
        if listed.external_id.trim().is_empty() {
            return Ok(Ok(listed));
        }
        match self.source.fetch_detail(listed.external_id.trim()).await {
            Ok(detail) => Ok(Ok(merge_detail(listed, detail))),
            Err(e @ ApiError::CircuitOpen { .. }) => Err(e.into()),
            Err(e) => {
                tracing::warn!(external_id = %listed.external_id, error = %e, "Detail fetch failed, skipping record");
                Ok(Err(format!("{}: {}", listed.external_id, e)))
            }
        }
    }
}

/// The window requested from the list endpoint.
pub fn fetch_window(mode: SyncMode, now: DateTime<Utc>, settings: &SyncSettings) -> FetchWindow {
    match mode {
        SyncMode::Full => FetchWindow::unbounded(),
        SyncMode::Incremental => {
            let today = now.date_naive();
            FetchWindow::between(
                today - Duration::days(settings.fetch_past_days),
                today + Duration::days(settings.fetch_future_days),
            )
        }
    }
}

/// Missing or unparsable timestamps count as recent.
pub fn is_recently_modified(record: &UpstreamRecord, cutoff: DateTime<Utc>) -> bool {
    match record.last_modified.as_deref().map(parse_timestamp) {
        Some(Some(modified)) => modified >= cutoff,
        Some(None) | None => true,
    }
}

/// Classify one candidate against the persisted record sharing its natural key.
///
/// Only title, date, status and location are compared; other fields may be
/// missing or malformed without producing an update. A tracked field that
/// is missing or cannot be parsed counts as changed so batch validation
/// reports it.
pub fn classify(candidate: UpstreamRecord, existing: Option<&StoredRecord>) -> Option<WorkItem> {
    let Some(existing) = existing else {
        return Some(WorkItem::Add { record: candidate });
    };

    tracked_fields_changed(&candidate, &existing.fields).then(|| WorkItem::Update {
        record_id: existing.id,
        record: candidate,
        original: existing.fields.clone(),
    })
}

fn tracked_fields_changed(candidate: &UpstreamRecord, stored: &RecordFields) -> bool {
    let title = trimmed(&candidate.title);
    let date = trimmed(&candidate.date).and_then(parse_date);
    let status = trimmed(&candidate.status).and_then(|raw| raw.parse::<RecordStatus>().ok());
    let location = trimmed(&candidate.location);

    title != Some(stored.title.as_str())
        || date != Some(stored.date)
        || status != Some(stored.status)
        || location != stored.location.as_deref()
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Detail fields win; list fields fill the gaps.
fn merge_detail(listed: UpstreamRecord, detail: UpstreamRecord) -> UpstreamRecord {
    UpstreamRecord {
        external_id: listed.external_id,
        title: detail.title.or(listed.title),
        date: detail.date.or(listed.date),
        status: detail.status.or(listed.status),
        location: detail.location.or(listed.location),
        chamber: detail.chamber.or(listed.chamber),
        congress: detail.congress.or(listed.congress),
        committee_codes: if detail.committee_codes.is_empty() {
            listed.committee_codes
        } else {
            detail.committee_codes
        },
        last_modified: detail.last_modified.or(listed.last_modified),
        witnesses: detail.witnesses,
        documents: detail.documents,
    }
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` and
/// `YYYY-MM-DD`. Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Chamber;
    use chrono::TimeZone;

    fn upstream(title: &str) -> UpstreamRecord {
        UpstreamRecord {
            external_id: "H-7".into(),
            title: Some(title.into()),
            date: Some("2024-05-20".into()),
            status: Some("scheduled".into()),
            location: Some("2167 RHOB".into()),
            chamber: Some("house".into()),
            congress: Some("118".into()),
            ..Default::default()
        }
    }

    fn stored() -> StoredRecord {
        let now = Utc::now();
        StoredRecord {
            id: 7,
            external_id: "H-7".into(),
            chamber: Chamber::House,
            congress: 118,
            fields: RecordFields {
                title: "Water Resources".into(),
                date: NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
                status: RecordStatus::Scheduled,
                location: Some("2167 RHOB".into()),
            },
            committee_codes: Vec::new(),
            last_modified: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_classify_addition_update_and_unchanged() {
        assert!(matches!(classify(upstream("Water Resources"), None), Some(WorkItem::Add { .. })));
        assert_eq!(classify(upstream("Water Resources"), Some(&stored())), None);

        match classify(upstream("Water Resources Development"), Some(&stored())) {
            Some(WorkItem::Update { record_id, original, .. }) => {
                assert_eq!(record_id, 7);
                assert_eq!(original, stored().fields);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_untracked_field_change_is_ignored() {
        let mut candidate = upstream("Water Resources");
        candidate.committee_codes = vec!["HSPW".into()];
        assert_eq!(classify(candidate, Some(&stored())), None);
    }

    #[test]
    fn test_missing_untracked_fields_do_not_produce_update() {
        let mut candidate = upstream("Water Resources");
        candidate.congress = None;
        candidate.chamber = Some("both".into());
        assert_eq!(classify(candidate, Some(&stored())), None);

        let mut padded = upstream("  Water Resources ");
        padded.status = Some("Scheduled".into());
        assert_eq!(classify(padded, Some(&stored())), None);
    }

    #[test]
    fn test_unparsable_candidate_counts_as_changed() {
        let mut candidate = upstream("Water Resources");
        candidate.date = Some("soon".into());
        assert!(matches!(classify(candidate, Some(&stored())), Some(WorkItem::Update { .. })));

        let mut candidate = upstream("Water Resources");
        candidate.location = None;
        assert!(matches!(classify(candidate, Some(&stored())), Some(WorkItem::Update { .. })));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T07:30:00-05:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 12:30:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-01"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("last tuesday"), None);
    }

    #[test]
    fn test_recently_modified_defaults_to_included() {
        let cutoff = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut record = upstream("x");
        assert!(is_recently_modified(&record, cutoff));
        record.last_modified = Some("garbage".into());
        assert!(is_recently_modified(&record, cutoff));
        record.last_modified = Some("2024-02-28T00:00:00Z".into());
        assert!(!is_recently_modified(&record, cutoff));
        record.last_modified = Some("2024-03-02".into());
        assert!(is_recently_modified(&record, cutoff));
    }

    #[test]
    fn test_incremental_window_is_wide() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 8, 0, 0).unwrap();
        let settings = SyncSettings::default();
        let window = fetch_window(SyncMode::Incremental, now, &settings);
        assert_eq!(window.from, NaiveDate::from_ymd_opt(2024, 5, 16));
        assert_eq!(window.to, NaiveDate::from_ymd_opt(2024, 12, 12));
        assert_eq!(fetch_window(SyncMode::Full, now, &settings), FetchWindow::unbounded());
    }
}
