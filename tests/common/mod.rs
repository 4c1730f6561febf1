//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use record_sync::api::{ApiError, FetchWindow, RecordSource, UpstreamRecord};
use record_sync::clock::{Clock, ManualClock};
use record_sync::config::SyncConfig;
use record_sync::notify::MemoryNotifier;
use record_sync::batch::Checkpoint;
use record_sync::coordinator::UpdateMetrics;
use record_sync::store::*;
use record_sync::SyncContext;

/// Start a programmable mock backend on an ephemeral port.
///
/// `f` receives the request target (path and query) and returns the status
/// code and body to send back.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let target = read_request_target(&mut socket).await;
                        let (status, body) = f(target).await;
                        let status_text = match status {
                            200 => "200 OK",
                            400 => "400 Bad Request",
                            404 => "404 Not Found",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Read the request head and return the target of the request line.
async fn read_request_target(socket: &mut tokio::net::TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head)
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string()
}

/// A valid upstream record dated well in the future.
pub fn upstream(external_id: &str, title: &str) -> UpstreamRecord {
    UpstreamRecord {
        external_id: external_id.to_string(),
        title: Some(title.to_string()),
        date: Some("2030-03-14".to_string()),
        status: Some("scheduled".to_string()),
        location: Some("2123 Rayburn".to_string()),
        chamber: Some("house".to_string()),
        congress: Some("121".to_string()),
        committee_codes: vec!["HSIF".to_string()],
        last_modified: Some("2030-03-09T09:00:00Z".to_string()),
        ..Default::default()
    }
}

pub fn upstream_many(count: usize) -> Vec<UpstreamRecord> {
    (1..=count)
        .map(|n| upstream(&format!("EV-{n:04}"), &format!("Hearing {n}")))
        .collect()
}

/// In-memory record source. Lists every record regardless of window.
#[derive(Default)]
pub struct FakeSource {
    records: Mutex<Vec<UpstreamRecord>>,
    fail_listing: Mutex<Option<u16>>,
    requests: AtomicU64,
}

impl FakeSource {
    pub fn new(records: Vec<UpstreamRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    pub fn set_records(&self, records: Vec<UpstreamRecord>) {
        *self.records.lock().unwrap() = records;
    }

    /// Make the list endpoint answer with `status` until cleared.
    pub fn fail_listing(&self, status: Option<u16>) {
        *self.fail_listing.lock().unwrap() = status;
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    async fn fetch_window(&self, _window: &FetchWindow) -> Result<Vec<UpstreamRecord>, ApiError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.fail_listing.lock().unwrap() {
            return Err(ApiError::Status {
                status,
                body: "listing unavailable".to_string(),
            });
        }
        Ok(self.records.lock().unwrap().clone())
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<UpstreamRecord, ApiError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.external_id == external_id)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                body: format!("{external_id} not found"),
            })
    }

    fn requests_made(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

/// A wired context over in-memory components.
pub struct Harness {
    pub ctx: SyncContext,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SqliteStore>,
    pub source: Arc<FakeSource>,
    pub notifier: Arc<MemoryNotifier>,
    pub backup_dir: TempDir,
}

impl Harness {
    pub fn new(records: Vec<UpstreamRecord>) -> Self {
        Self::with_config(records, |_| {})
    }

    pub fn with_config(records: Vec<UpstreamRecord>, tweak: impl FnOnce(&mut SyncConfig)) -> Self {
        let backup_dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::default();
        config.store.path = String::new();
        config.store.backup_dir = backup_dir.path().to_string_lossy().into_owned();
        tweak(&mut config);

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 3, 10, 12, 0, 0).unwrap()));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = Arc::new(FakeSource::new(records));
        let notifier = Arc::new(MemoryNotifier::new());

        let ctx = SyncContext::new(
            config,
            store.clone() as Arc<dyn Store>,
            source.clone() as Arc<dyn RecordSource>,
            clock.clone() as Arc<dyn Clock>,
        )
        .with_notifier(notifier.clone());

        Self {
            ctx,
            clock,
            store,
            source,
            notifier,
            backup_dir,
        }
    }
}

impl Harness {
    /// A context over the same store, wrapped so batch resolution can be
    /// interfered with.
    pub fn with_faults(&self) -> (SyncContext, Arc<FaultyStore>) {
        let faulty = Arc::new(FaultyStore::new(self.store.clone()));
        let ctx = SyncContext::new(
            (*self.ctx.config).clone(),
            faulty.clone() as Arc<dyn Store>,
            self.source.clone() as Arc<dyn RecordSource>,
            self.clock.clone() as Arc<dyn Clock>,
        )
        .with_notifier(self.notifier.clone());
        (ctx, faulty)
    }
}

/// What the next `resolve_batch` call does instead of resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveFault {
    None,
    /// Fail with a storage error.
    Fail,
    /// Requeue the batch first, as the liveness sweep does for a stalled batch.
    Requeue,
}

/// Store wrapper that injects one fault into batch resolution.
pub struct FaultyStore {
    inner: Arc<SqliteStore>,
    fault: Mutex<ResolveFault>,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fault: Mutex::new(ResolveFault::None),
        }
    }

    pub fn inject(&self, fault: ResolveFault) {
        *self.fault.lock().unwrap() = fault;
    }
}

impl Store for FaultyStore {
    fn schema_version(&self) -> u32 {
        self.inner.schema_version()
    }
    fn find_record_by_external_id(&self, external_id: &str) -> StoreResult<Option<StoredRecord>> {
        self.inner.find_record_by_external_id(external_id)
    }
    fn get_record(&self, id: RecordId) -> StoreResult<Option<StoredRecord>> {
        self.inner.get_record(id)
    }
    fn insert_record(&self, record: NewRecord, now: DateTime<Utc>) -> StoreResult<StoredRecord> {
        self.inner.insert_record(record, now)
    }
    fn update_record(&self, record: &StoredRecord) -> StoreResult<()> {
        self.inner.update_record(record)
    }
    fn delete_record(&self, id: RecordId) -> StoreResult<bool> {
        self.inner.delete_record(id)
    }
    fn count_records(&self) -> StoreResult<usize> {
        self.inner.count_records()
    }
    fn list_records(&self) -> StoreResult<Vec<StoredRecord>> {
        self.inner.list_records()
    }
    fn insert_witness(&self, record_id: RecordId, name: &str, organization: Option<&str>) -> StoreResult<Witness> {
        self.inner.insert_witness(record_id, name, organization)
    }
    fn insert_document(
        &self,
        record_id: RecordId,
        title: &str,
        url: Option<&str>,
        kind: Option<&str>,
    ) -> StoreResult<Document> {
        self.inner.insert_document(record_id, title, url, kind)
    }
    fn delete_dependent(&self, kind: DependentKind, id: i64) -> StoreResult<bool> {
        self.inner.delete_dependent(kind, id)
    }
    fn list_witnesses(&self, record_id: RecordId) -> StoreResult<Vec<Witness>> {
        self.inner.list_witnesses(record_id)
    }
    fn list_documents(&self, record_id: RecordId) -> StoreResult<Vec<Document>> {
        self.inner.list_documents(record_id)
    }
    fn replace_associations(&self, record_id: RecordId, committee_codes: &[String]) -> StoreResult<bool> {
        self.inner.replace_associations(record_id, committee_codes)
    }
    fn list_associations(&self) -> StoreResult<Vec<Association>> {
        self.inner.list_associations()
    }
    fn create_task(&self, task: &SyncTask) -> StoreResult<()> {
        self.inner.create_task(task)
    }
    fn get_task(&self, id: TaskId) -> StoreResult<Option<SyncTask>> {
        self.inner.get_task(id)
    }
    fn update_task(&self, task: &SyncTask) -> StoreResult<()> {
        self.inner.update_task(task)
    }
    fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<SyncTask>> {
        self.inner.list_tasks(status)
    }
    fn record_batch_counts(&self, id: TaskId, counts: BatchCounts) -> StoreResult<bool> {
        self.inner.record_batch_counts(id, counts)
    }
    fn finalize_task(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: TaskResult,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.finalize_task(id, status, result, at)
    }
    fn create_batches(&self, batches: &[Batch]) -> StoreResult<()> {
        self.inner.create_batches(batches)
    }
    fn get_batch(&self, id: BatchId) -> StoreResult<Option<Batch>> {
        self.inner.get_batch(id)
    }
    fn list_batches(&self, task_id: TaskId) -> StoreResult<Vec<Batch>> {
        self.inner.list_batches(task_id)
    }
    fn claim_batch(&self, id: BatchId, at: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.claim_batch(id, at)
    }
    fn requeue_batch(&self, id: BatchId) -> StoreResult<bool> {
        self.inner.requeue_batch(id)
    }
    fn resolve_batch(&self, batch: &Batch, claimed_at: DateTime<Utc>) -> StoreResult<bool> {
        let fault = std::mem::replace(&mut *self.fault.lock().unwrap(), ResolveFault::None);
        match fault {
            ResolveFault::None => {}
            ResolveFault::Fail => {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk I/O error",
                )))
            }
            ResolveFault::Requeue => {
                self.inner.requeue_batch(batch.id)?;
            }
        }
        self.inner.resolve_batch(batch, claimed_at)
    }
    fn batch_counts(&self, task_id: TaskId) -> StoreResult<BatchCounts> {
        self.inner.batch_counts(task_id)
    }
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        self.inner.save_checkpoint(checkpoint)
    }
    fn load_checkpoint(&self, id: uuid::Uuid) -> StoreResult<Option<Checkpoint>> {
        self.inner.load_checkpoint(id)
    }
    fn delete_checkpoint(&self, id: uuid::Uuid) -> StoreResult<()> {
        self.inner.delete_checkpoint(id)
    }
    fn append_run_metrics(&self, metrics: &UpdateMetrics) -> StoreResult<()> {
        self.inner.append_run_metrics(metrics)
    }
    fn last_run_metrics(&self) -> StoreResult<Option<UpdateMetrics>> {
        self.inner.last_run_metrics()
    }
    fn list_run_metrics(&self) -> StoreResult<Vec<UpdateMetrics>> {
        self.inner.list_run_metrics()
    }
    fn enqueue_trigger(&self, trigger: QueuedTrigger) -> StoreResult<()> {
        self.inner.enqueue_trigger(trigger)
    }
    fn dequeue_trigger(&self) -> StoreResult<Option<QueuedTrigger>> {
        self.inner.dequeue_trigger()
    }
    fn queue_len(&self) -> StoreResult<usize> {
        self.inner.queue_len()
    }
    fn save_resilience_state(&self, name: &str, state: &ResilienceState) -> StoreResult<()> {
        self.inner.save_resilience_state(name, state)
    }
    fn load_resilience_state(&self, name: &str) -> StoreResult<Option<ResilienceState>> {
        self.inner.load_resilience_state(name)
    }
    fn export_snapshot(&self) -> StoreResult<StoreSnapshot> {
        self.inner.export_snapshot()
    }
    fn import_snapshot(&self, snapshot: StoreSnapshot) -> StoreResult<()> {
        self.inner.import_snapshot(snapshot)
    }
    fn integrity_report(&self) -> StoreResult<IntegrityReport> {
        self.inner.integrity_report()
    }
}
