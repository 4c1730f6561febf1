//! Pre-flight checks run before a mutating run touches anything.

use chrono::{DateTime, Utc};

use crate::clock::elapsed_between;
use crate::config::SanityConfig;
use crate::store::{Store, TaskStatus, SCHEMA_VERSION};

/// Every failing check, in order. Empty means the run may proceed.
///
/// `force` skips only the recent-run check, which looks at successful runs.
pub fn run_sanity_checks(store: &dyn Store, config: &SanityConfig, now: DateTime<Utc>, force: bool) -> Vec<String> {
    let mut failures = Vec::new();

    let version = store.schema_version();
    if version != SCHEMA_VERSION {
        failures.push(format!(
            "store schema version {version} does not match expected {SCHEMA_VERSION}"
        ));
    }

    match store.count_records() {
        Ok(count) if count < config.min_records => {
            failures.push(format!("store holds {count} records, minimum is {}", config.min_records));
        }
        Ok(_) => {}
        Err(e) => failures.push(format!("store is unreadable: {e}")),
    }

    match store.integrity_report() {
        Ok(report) if report.violation_count() > config.max_integrity_violations => {
            failures.push(format!(
                "{} integrity violations exceed the limit of {}",
                report.violation_count(),
                config.max_integrity_violations
            ));
            failures.extend(report.describe().into_iter().take(10));
        }
        Ok(_) => {}
        Err(e) => failures.push(format!("integrity scan failed: {e}")),
    }

    match store.list_tasks(Some(TaskStatus::Running)) {
        Ok(tasks) => {
            for task in tasks {
                failures.push(format!("task {} is still running", task.id));
            }
        }
        Err(e) => failures.push(format!("could not list tasks: {e}")),
    }

    if !force {
        match store.list_run_metrics() {
            Ok(runs) => {
                let last_success = runs
                    .iter()
                    .filter(|run| run.success)
                    .filter_map(|run| run.end_time)
                    .max();
                if let Some(finished) = last_success {
                    let since = elapsed_between(finished, now);
                    if since.as_secs() < config.min_run_interval_secs {
                        failures.push(format!(
                            "last successful run finished {}s ago, minimum interval is {}s",
                            since.as_secs(),
                            config.min_run_interval_secs
                        ));
                    }
                }
            }
            Err(e) => failures.push(format!("could not read run log: {e}")),
        }
    }

    failures
}
