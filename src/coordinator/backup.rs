//! Whole-store backups.
//!
//! A backup is a JSON file holding the domain tables of the store. It
//! exists only to undo a whole run; per-batch undo uses checkpoints.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::store::{Store, StoreSnapshot};

/// Reference to a backup file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    id: String,
    created_at: DateTime<Utc>,
    snapshot: StoreSnapshot,
}

pub struct BackupManager {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self { dir: dir.into(), clock }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the store into a new file.
    pub fn create(&self, store: &dyn Store) -> SyncResult<Backup> {
        let created_at = self.clock.now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let snapshot = store.export_snapshot()?;
        let records = snapshot.records.len();

        fs::create_dir_all(&self.dir).map_err(|e| backup_error("create backup dir", &self.dir, e))?;
        let location = self.dir.join(format!("backup-{id}.json"));
        let tmp = location.with_extension("json.tmp");
        let file = BackupFile {
            id: id.clone(),
            created_at,
            snapshot,
        };
        {
            let handle = File::create(&tmp).map_err(|e| backup_error("create", &tmp, e))?;
            let mut writer = BufWriter::new(handle);
            serde_json::to_writer(&mut writer, &file).map_err(|e| backup_error("write", &tmp, e))?;
            writer.flush().map_err(|e| backup_error("flush", &tmp, e))?;
        }
        fs::rename(&tmp, &location).map_err(|e| backup_error("rename", &location, e))?;

        tracing::info!(backup_id = %id, path = %location.display(), records, "Backup created");
        Ok(Backup {
            id,
            location,
            created_at,
        })
    }

    /// Replace the store's domain tables with the backup's contents.
    pub fn restore(&self, store: &dyn Store, backup: &Backup) -> SyncResult<()> {
        let file = read_backup(&backup.location)?;
        let records = file.snapshot.records.len();
        store.import_snapshot(file.snapshot)?;
        tracing::warn!(backup_id = %backup.id, records, "Store restored from backup");
        Ok(())
    }

    /// Backups in the directory, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> SyncResult<Vec<Backup>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backup_error("read", &self.dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_backup = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("backup-"));
            if !is_backup {
                continue;
            }
            match read_backup(&path) {
                Ok(file) => backups.push(Backup {
                    id: file.id,
                    location: path,
                    created_at: file.created_at,
                }),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable backup"),
            }
        }
        backups.sort_by_key(|b| b.created_at);
        Ok(backups)
    }

    /// Delete backups older than `days`. Returns how many were removed.
    pub fn prune_older_than(&self, days: i64) -> SyncResult<usize> {
        let cutoff = self.clock.now() - ChronoDuration::days(days);
        let mut removed = 0;
        for backup in self.list()?.into_iter().filter(|b| b.created_at < cutoff) {
            match fs::remove_file(&backup.location) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(backup_id = %backup.id, error = %e, "Failed to prune backup"),
            }
        }
        if removed > 0 {
            tracing::info!(removed, retention_days = days, "Pruned old backups");
        }
        Ok(removed)
    }
}

fn read_backup(path: &Path) -> SyncResult<BackupFile> {
    let handle = File::open(path).map_err(|e| backup_error("open", path, e))?;
    serde_json::from_reader(BufReader::new(handle)).map_err(|e| backup_error("parse", path, e))
}

fn backup_error(action: &str, path: &Path, err: impl std::fmt::Display) -> SyncError {
    SyncError::Backup(format!("failed to {action} {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{Chamber, NewRecord, RecordFields, RecordStatus, SqliteStore};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn record(key: &str) -> NewRecord {
        NewRecord {
            external_id: key.into(),
            chamber: Chamber::Joint,
            congress: 118,
            fields: RecordFields {
                title: "Economic outlook".into(),
                date: NaiveDate::from_ymd_opt(2024, 7, 9).unwrap(),
                status: RecordStatus::Scheduled,
                location: None,
            },
            committee_codes: vec!["JSEC".into()],
            last_modified: None,
        }
    }

    #[test]
    fn test_create_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let manager = BackupManager::new(dir.path(), Arc::new(clock.clone()));
        let store = SqliteStore::in_memory().unwrap();
        store.insert_record(record("J-1"), clock.now()).unwrap();

        let backup = manager.create(&store).unwrap();
        store.insert_record(record("J-2"), clock.now()).unwrap();
        manager.restore(&store, &backup).unwrap();

        assert_eq!(store.count_records().unwrap(), 1);
        assert_eq!(manager.list().unwrap(), vec![backup]);
    }

    #[test]
    fn test_prune_respects_retention() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let manager = BackupManager::new(dir.path(), Arc::new(clock.clone()));
        let store = SqliteStore::in_memory().unwrap();

        manager.create(&store).unwrap();
        clock.advance(Duration::from_secs(10 * 86_400));
        let recent = manager.create(&store).unwrap();
        clock.advance(Duration::from_secs(5 * 86_400));

        assert_eq!(manager.prune_older_than(14).unwrap(), 1);
        assert_eq!(manager.list().unwrap(), vec![recent]);
    }

    #[test]
    fn test_restore_missing_file_is_backup_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path(), Arc::new(ManualClock::default()));
        let missing = Backup {
            id: "gone".into(),
            location: dir.path().join("backup-gone.json"),
            created_at: Utc::now(),
        };
        let err = manager.restore(&SqliteStore::in_memory().unwrap(), &missing).unwrap_err();
        assert!(matches!(err, SyncError::Backup(_)));
    }

    #[test]
    fn test_list_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("nope"), Arc::new(ManualClock::default()));
        assert!(manager.list().unwrap().is_empty());
    }
}
