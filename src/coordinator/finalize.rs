//! Run completion: associations, validation, rollback, metrics row.
//!
//! Direct runs call this right after applying; batched runs call it from
//! whichever executor finalizes the task. Either way each run appends
//! exactly one row to the run log.

use serde_json::json;

use crate::context::SyncContext;
use crate::coordinator::backup::{Backup, BackupManager};
use crate::coordinator::metrics::UpdateMetrics;
use crate::error::{SyncError, SyncResult};
use crate::notify::Severity;
use crate::observability::metrics;
use crate::store::Store;

pub struct RunFinalizer {
    ctx: SyncContext,
    backups: BackupManager,
}

impl RunFinalizer {
    pub fn new(ctx: SyncContext) -> Self {
        let backups = BackupManager::new(&ctx.config.store.backup_dir, ctx.clock.clone());
        Self { ctx, backups }
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Derive associations, validate, and record the run.
    ///
    /// Hard validation issues restore `backup` and return
    /// [`SyncError::Validation`]. Any other error while finalizing restores
    /// the backup too before propagating. The run row is written in every
    /// case.
    pub async fn complete(&self, mut run: UpdateMetrics, backup: Option<&Backup>) -> SyncResult<UpdateMetrics> {
        match update_associations(self.ctx.store.as_ref()) {
            Ok(changed) => run.associations_updated = changed,
            Err(e) => {
                let err = SyncError::from(e);
                self.fail(run, backup, &err).await;
                return Err(err);
            }
        }

        let validation = self.ctx.validator.validate(self.ctx.store.as_ref());
        if !validation.warnings.is_empty() {
            tracing::warn!(run_id = %run.run_id, warnings = ?validation.warnings, "Validation reported warnings");
            self.ctx
                .notifier
                .send(
                    "Sync validation warnings",
                    &validation.warnings.join("\n"),
                    Severity::Warning,
                    json!({ "run_id": run.run_id, "mode": run.mode }),
                )
                .await;
        }

        if !validation.passed {
            let issues = validation.issues.clone();
            run.validation = Some(validation);
            run.errors.extend(issues.iter().cloned());
            let err = SyncError::Validation(issues);
            self.fail(run, backup, &err).await;
            return Err(err);
        }

        run.validation = Some(validation);
        let success = run.errors.is_empty();
        run.finish(success, self.ctx.clock.now());
        self.record(&run);

        match self.backups.prune_older_than(self.ctx.config.store.backup_retention_days) {
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Backup pruning failed"),
        }

        tracing::info!(
            run_id = %run.run_id,
            mode = %run.mode,
            success,
            added = run.records_added,
            updated = run.records_updated,
            dependents = run.dependents_added,
            associations = run.associations_updated,
            errors = run.errors.len(),
            "Run complete"
        );
        if !success {
            self.ctx
                .notifier
                .send(
                    "Sync completed with errors",
                    &run.errors.join("\n"),
                    Severity::Error,
                    json!({ "run_id": run.run_id, "mode": run.mode, "task_id": run.task_id }),
                )
                .await;
        }
        Ok(run)
    }

    /// Record a failed run, restoring `backup` first unless the error was
    /// raised before anything was mutated.
    pub async fn fail(&self, mut run: UpdateMetrics, backup: Option<&Backup>, error: &SyncError) -> UpdateMetrics {
        if !error.is_pre_mutation() {
            match backup {
                Some(backup) => match self.backups.restore(self.ctx.store.as_ref(), backup) {
                    Ok(()) => {
                        run.rolled_back = true;
                        self.ctx
                            .notifier
                            .send(
                                "Sync rolled back",
                                &format!("Store restored from backup {} after: {error}", backup.id),
                                Severity::Critical,
                                json!({ "run_id": run.run_id, "backup_id": backup.id }),
                            )
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(run_id = %run.run_id, error = %e, "Rollback from backup failed");
                        run.errors.push(format!("rollback failed: {e}"));
                    }
                },
                None => tracing::warn!(run_id = %run.run_id, "No backup available, cannot roll back"),
            }
        }

        let message = error.to_string();
        if !run.errors.contains(&message) {
            run.errors.push(message.clone());
        }
        run.finish(false, self.ctx.clock.now());
        self.record(&run);

        tracing::error!(run_id = %run.run_id, mode = %run.mode, rolled_back = run.rolled_back, error = %message, "Run failed");
        self.ctx
            .notifier
            .send(
                "Sync failed",
                &message,
                Severity::Error,
                json!({ "run_id": run.run_id, "mode": run.mode, "rolled_back": run.rolled_back }),
            )
            .await;
        run
    }

    fn record(&self, run: &UpdateMetrics) {
        if let Err(e) = self.ctx.store.append_run_metrics(run) {
            tracing::error!(run_id = %run.run_id, error = %e, "Failed to write run metrics row");
        }
        metrics::record_run(run.mode, run.success, run);
    }
}

/// Rebuild record-to-committee associations from the records' committee
/// codes. Returns how many records' associations changed.
pub fn update_associations(store: &dyn Store) -> Result<usize, crate::store::StoreError> {
    let mut changed = 0;
    for record in store.list_records()? {
        if store.replace_associations(record.id, &record.committee_codes)? {
            changed += 1;
        }
    }
    Ok(changed)
}
