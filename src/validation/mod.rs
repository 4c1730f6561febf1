//! Post-update validation collaborator.
//!
//! Issues are hard failures that cause a whole-run rollback. Warnings are
//! logged and reported but the run still succeeds.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::{RecordStatus, Store};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub warnings: Vec<String>,
    pub issues: Vec<String>,
}

impl ValidationOutcome {
    pub fn from_findings(warnings: Vec<String>, issues: Vec<String>) -> Self {
        Self {
            passed: issues.is_empty(),
            warnings,
            issues,
        }
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, store: &dyn Store) -> ValidationOutcome;
}

/// Default checks over the persisted records.
pub struct StoreValidator {
    clock: Arc<dyn Clock>,
    /// Scheduled records dated further back than this are reported.
    stale_scheduled_days: i64,
}

impl StoreValidator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            stale_scheduled_days: 30,
        }
    }

    pub fn with_stale_scheduled_days(mut self, days: i64) -> Self {
        self.stale_scheduled_days = days;
        self
    }
}

impl Validator for StoreValidator {
    fn validate(&self, store: &dyn Store) -> ValidationOutcome {
        let mut warnings = Vec::new();
        let mut issues = Vec::new();

        match store.integrity_report() {
            Ok(report) => issues.extend(report.describe()),
            Err(e) => issues.push(format!("integrity scan failed: {e}")),
        }

        let records = match store.list_records() {
            Ok(records) => records,
            Err(e) => {
                issues.push(format!("could not read records: {e}"));
                return ValidationOutcome::from_findings(warnings, issues);
            }
        };

        let stale_before = (self.clock.now() - ChronoDuration::days(self.stale_scheduled_days)).date_naive();
        let mut missing_location = 0usize;
        for record in &records {
            if record.fields.location.is_none() {
                missing_location += 1;
            }
            if record.fields.status == RecordStatus::Scheduled && record.fields.date < stale_before {
                warnings.push(format!(
                    "{} is still scheduled for {}",
                    record.external_id, record.fields.date
                ));
            }
        }
        if missing_location > 0 {
            warnings.push(format!("{missing_location} records have no location"));
        }

        let outcome = ValidationOutcome::from_findings(warnings, issues);
        tracing::debug!(
            records = records.len(),
            warnings = outcome.warnings.len(),
            issues = outcome.issues.len(),
            "Validation complete"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{Chamber, NewRecord, RecordFields, SqliteStore};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn record(key: &str, date: NaiveDate, location: Option<&str>) -> NewRecord {
        NewRecord {
            external_id: key.into(),
            chamber: Chamber::House,
            congress: 118,
            fields: RecordFields {
                title: "Hearing".into(),
                date,
                status: RecordStatus::Scheduled,
                location: location.map(str::to_string),
            },
            committee_codes: Vec::new(),
            last_modified: None,
        }
    }

    #[test]
    fn test_warnings_do_not_fail_validation() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let store = SqliteStore::in_memory().unwrap();
        let old = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        store.insert_record(record("H-1", old, None), clock.now()).unwrap();

        let outcome = StoreValidator::new(Arc::new(clock)).validate(&store);
        assert!(outcome.passed);
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.issues.is_empty());
    }

    #[test]
    fn test_orphans_are_issues() {
        let clock = ManualClock::default();
        let store = SqliteStore::in_memory().unwrap();
        let today = clock.now().date_naive();
        let row = store.insert_record(record("H-1", today, Some("Room 1")), clock.now()).unwrap();
        store.insert_witness(row.id, "Someone", None).unwrap();
        store.delete_record(row.id).unwrap();

        let outcome = StoreValidator::new(Arc::new(clock)).validate(&store);
        assert!(!outcome.passed);
        assert_eq!(outcome.issues.len(), 1);
    }
}
