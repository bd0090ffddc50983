//! In-process backend, queue and object store
//!
//! Used by `tessera --local` for dry runs and by the test suites. The queue
//! honours leases and visibility timeouts on the tokio clock, so paused-time
//! tests see redelivery exactly as they would against a hosted queue.

use crate::backend::Backend;
use crate::config::JobConfig;
use crate::connector::ResourceConnector;
use crate::credentials::CredentialManager;
use crate::error::{IngestError, Result};
use crate::keys::{encode_chunk_key, encode_tile_key, ProjectIds, TaskMessage};
use crate::queue::WorkQueue;
use crate::storage::{ObjectStore, UploadRequest};
use crate::types::{
    Credentials, IngestJob, IngestType, JobId, JobSession, JobStatus, QueueHandles, TileCoord,
    WorkItem,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Tiles grouped under one chunk key in tile ingests
const TILES_PER_CHUNK: u64 = 16;
const QUEUE_SCHEME: &str = "memory://";
pub const MEMORY_BUCKET: &str = "memory-tiles";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Message {
    id: String,
    body: String,
    receives: u32,
    visible_at: Option<Instant>,
    receipt: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    messages: BTreeMap<u64, Message>,
    deleted: u64,
}

/// Lease-based queue held in memory
#[derive(Debug, Default)]
pub struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    delete_calls: AtomicU64,
    dequeue_faults: AtomicU32,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, body: impl Into<String>) -> String {
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = format!("{}-{}", self.name, seq);
        state.messages.insert(
            seq,
            Message {
                id: id.clone(),
                body: body.into(),
                receives: 0,
                visible_at: None,
                receipt: None,
            },
        );
        id
    }

    /// Drop every message, leased or not. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut state = lock(&self.state);
        let purged = state.messages.len();
        state.messages.clear();
        purged
    }

    /// Messages still held, including leased ones
    pub fn len(&self) -> usize {
        lock(&self.state).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        lock(&self.state)
            .messages
            .values()
            .filter(|m| m.visible_at.is_some_and(|at| at > now))
            .count()
    }

    /// Successful deletes
    pub fn delete_count(&self) -> u64 {
        lock(&self.state).deleted
    }

    /// Every delete call, including ones with stale receipts
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Make the next `times` dequeues fail transiently
    pub fn fail_dequeues(&self, times: u32) {
        self.dequeue_faults.store(times, Ordering::SeqCst);
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn dequeue(&self, max_items: u32, visibility_timeout: Duration) -> Result<Vec<WorkItem>> {
        if Self::take_fault(&self.dequeue_faults) {
            return Err(IngestError::queue(format!("{} unavailable", self.name)));
        }

        let now = Instant::now();
        let lease_deadline = Utc::now()
            + chrono::Duration::from_std(visibility_timeout).unwrap_or_else(|_| chrono::Duration::hours(12));
        let mut state = lock(&self.state);
        let mut leased = Vec::new();
        for message in state.messages.values_mut() {
            if leased.len() >= max_items as usize {
                break;
            }
            if message.visible_at.is_some_and(|at| at > now) {
                continue;
            }
            message.receives += 1;
            message.visible_at = Some(now + visibility_timeout);
            let receipt = format!("{}-{}", message.id, message.receives);
            message.receipt = Some(receipt.clone());
            leased.push(WorkItem {
                message_id: message.id.clone(),
                receipt_handle: receipt,
                body: message.body.clone(),
                lease_deadline,
            });
        }
        Ok(leased)
    }

    async fn delete(&self, item: &WorkItem) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        let seq = state
            .messages
            .iter()
            .find(|(_, m)| m.receipt.as_deref() == Some(item.receipt_handle.as_str()))
            .map(|(seq, _)| *seq);
        match seq {
            Some(seq) => {
                state.messages.remove(&seq);
                state.deleted += 1;
            },
            None => debug!(message_id = %item.message_id, "Stale receipt, nothing deleted"),
        }
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<u64> {
        let now = Instant::now();
        let visible = lock(&self.state)
            .messages
            .values()
            .filter(|m| m.visible_at.map_or(true, |at| at <= now))
            .count();
        Ok(visible as u64)
    }
}

/// Fault injected into the next object writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Authorization,
    Permanent,
}

impl FailureKind {
    fn into_error(self, key: &str) -> IngestError {
        match self {
            FailureKind::Transient => IngestError::transient(format!("injected failure writing {key}")),
            FailureKind::Authorization => {
                IngestError::authorization(format!("injected auth failure writing {key}"))
            },
            FailureKind::Permanent => IngestError::permanent(format!("injected rejection of {key}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    faults: Mutex<VecDeque<FailureKind>>,
    revoked: Mutex<HashSet<String>>,
    puts: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, kind: FailureKind, times: usize) {
        let mut faults = lock(&self.faults);
        faults.extend(std::iter::repeat(kind).take(times));
    }

    /// Reject writes signed with `access_key` from now on
    pub fn revoke(&self, access_key: impl Into<String>) {
        lock(&self.revoked).insert(access_key.into());
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Successful writes, counting overwrites
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    async fn put_signed(&self, access_key: Option<&str>, request: UploadRequest) -> Result<()> {
        if let Some(kind) = lock(&self.faults).pop_front() {
            return Err(kind.into_error(&request.key));
        }
        if let Some(access_key) = access_key {
            if lock(&self.revoked).contains(access_key) {
                return Err(IngestError::authorization(format!(
                    "access key {access_key} has been revoked"
                )));
            }
        }
        lock(&self.objects).insert(
            request.key,
            StoredObject {
                body: request.body,
                metadata: request.metadata,
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, request: UploadRequest) -> Result<()> {
        self.put_signed(None, request).await
    }
}

/// Store view that signs writes with the job's current credentials
struct SignedStore {
    store: Arc<MemoryObjectStore>,
    credentials: Arc<CredentialManager>,
}

#[async_trait]
impl ObjectStore for SignedStore {
    async fn put_object(&self, request: UploadRequest) -> Result<()> {
        let snapshot = self.credentials.current();
        self.store
            .put_signed(Some(&snapshot.credentials.access_key), request)
            .await
    }
}

#[derive(Debug)]
struct MemoryJob {
    job: IngestJob,
    project: ProjectIds,
    queue: Arc<MemoryQueue>,
    object_keys: Vec<String>,
    purged: usize,
}

/// Backend that keeps jobs in a map and counts uploads from its store
#[derive(Debug)]
pub struct MemoryBackend {
    jobs: Mutex<HashMap<JobId, MemoryJob>>,
    store: Arc<MemoryObjectStore>,
    next_id: AtomicU64,
    credential_issues: AtomicU64,
    credential_faults: AtomicU32,
    credential_delay: Mutex<Duration>,
    cancel_calls: AtomicU64,
    complete_calls: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            store: Arc::new(MemoryObjectStore::new()),
            next_id: AtomicU64::new(1),
            credential_issues: AtomicU64::new(0),
            credential_faults: AtomicU32::new(0),
            credential_delay: Mutex::new(Duration::ZERO),
            cancel_calls: AtomicU64::new(0),
            complete_calls: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> Arc<MemoryObjectStore> {
        self.store.clone()
    }

    pub fn job_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn queue(&self, job_id: &JobId) -> Option<Arc<MemoryQueue>> {
        lock(&self.jobs).get(job_id).map(|j| j.queue.clone())
    }

    pub fn status_of(&self, job_id: &JobId) -> Option<JobStatus> {
        lock(&self.jobs).get(job_id).map(|j| j.job.status)
    }

    pub fn project(&self, job_id: &JobId) -> Option<ProjectIds> {
        lock(&self.jobs).get(job_id).map(|j| j.project)
    }

    /// Items removed from the queue by cancellation
    pub fn purged(&self, job_id: &JobId) -> usize {
        lock(&self.jobs).get(job_id).map(|j| j.purged).unwrap_or(0)
    }

    pub fn credential_issues(&self) -> u64 {
        self.credential_issues.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u64 {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> u64 {
        self.complete_calls.load(Ordering::SeqCst)
    }

    /// Delay every credential issue by `delay`
    pub fn set_credential_delay(&self, delay: Duration) {
        *lock(&self.credential_delay) = delay;
    }

    /// Make the next `times` credential requests fail transiently
    pub fn fail_credentials(&self, times: u32) {
        self.credential_faults.store(times, Ordering::SeqCst);
    }

    /// Write every expected object directly, as though another client uploaded them
    pub fn mark_all_uploaded(&self, job_id: &JobId) {
        let keys = lock(&self.jobs)
            .get(job_id)
            .map(|j| j.object_keys.clone())
            .unwrap_or_default();
        let mut objects = lock(&self.store.objects);
        for key in keys {
            objects.entry(key).or_insert_with(|| StoredObject {
                body: Vec::new(),
                metadata: HashMap::new(),
            });
        }
    }

    fn issue_credentials(&self, job_id: &JobId) -> Credentials {
        let n = self.credential_issues.fetch_add(1, Ordering::SeqCst) + 1;
        Credentials {
            access_key: format!("MEMKEY-{job_id}-{n}"),
            secret_key: format!("memsecret-{n}"),
            session_token: Some(format!("memtoken-{n}")),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        }
    }

    fn session(&self, job: &MemoryJob, credentials: Credentials) -> JobSession {
        let upload = format!("{QUEUE_SCHEME}{}/upload", job.job.id);
        JobSession {
            job: job.job.clone(),
            queues: QueueHandles {
                upload: upload.clone(),
                ingest: None,
                tile_index: None,
            },
            bucket: MEMORY_BUCKET.to_string(),
            credentials,
            parameters: serde_json::json!({
                "job_id": job.job.id.as_str(),
                "collection_id": job.project.collection,
                "experiment_id": job.project.experiment,
                "channel_id": job.project.channel,
                "upload_queue": upload,
            }),
        }
    }

    fn with_job<T>(&self, job_id: &JobId, f: impl FnOnce(&mut MemoryJob) -> Result<T>) -> Result<T> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| IngestError::JobNotFound(job_id.clone()))?;
        f(job)
    }
}

fn task_for(ingest_type: IngestType, project: &ProjectIds, coord: &TileCoord) -> TaskMessage {
    match ingest_type {
        IngestType::Tile => {
            let chunk = TileCoord {
                z: coord.z / TILES_PER_CHUNK,
                ..*coord
            };
            TaskMessage {
                tile_key: Some(encode_tile_key(project, coord)),
                chunk_key: encode_chunk_key(TILES_PER_CHUNK, project, &chunk),
            }
        },
        IngestType::Volumetric => TaskMessage {
            tile_key: None,
            chunk_key: encode_chunk_key(1, project, coord),
        },
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_job(&self, config: &JobConfig) -> Result<JobSession> {
        config.validate()?;
        let spec = &config.ingest_job;
        let unit_size = spec.unit_size()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = JobId::from(n);
        let project = ProjectIds {
            collection: n,
            experiment: n * 10,
            channel: n * 100,
        };

        let queue = Arc::new(MemoryQueue::new(format!("upload-{id}")));
        let mut object_keys = Vec::new();
        for coord in spec.extent.units(unit_size, spec.resolution) {
            let task = task_for(spec.ingest_type, &project, &coord);
            object_keys.push(task.object_key(spec.ingest_type)?.to_string());
            queue.push(task.to_body()?);
        }

        let job = IngestJob {
            id: id.clone(),
            status: JobStatus::Uploading,
            ingest_type: spec.ingest_type,
            resolution: spec.resolution,
            extent: spec.extent,
            unit_size,
            target: config.database.clone(),
            expected_units: object_keys.len() as u64,
        };
        info!(job_id = %id, units = job.expected_units, "Memory job created");

        let record = MemoryJob {
            job,
            project,
            queue,
            object_keys,
            purged: 0,
        };
        let session = self.session(&record, self.issue_credentials(&id));
        lock(&self.jobs).insert(id, record);
        Ok(session)
    }

    async fn join_job(&self, job_id: &JobId) -> Result<JobSession> {
        let credentials = self.issue_credentials(job_id);
        self.with_job(job_id, |job| Ok(self.session(job, credentials)))
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.with_job(job_id, |job| match job.job.status {
            JobStatus::Cancelled => Ok(()),
            status @ (JobStatus::Complete | JobStatus::Failed) => Err(IngestError::JobAlreadyComplete {
                job_id: job_id.clone(),
                status,
            }),
            _ => {
                job.job.status = JobStatus::Cancelled;
                job.purged = job.queue.purge();
                Ok(())
            },
        })
    }

    async fn complete_job(&self, job_id: &JobId) -> Result<()> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.with_job(job_id, |job| {
            if job.job.status == JobStatus::Complete {
                return Ok(());
            }
            let remaining = job.queue.len();
            if remaining > 0 {
                return Err(IngestError::PrematureCompletion {
                    job_id: job_id.clone(),
                    reason: format!("{remaining} messages remain in the upload queue"),
                });
            }
            job.job.status = JobStatus::Complete;
            Ok(())
        })
    }

    async fn get_credentials(&self, job_id: &JobId) -> Result<Credentials> {
        let delay = *lock(&self.credential_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if MemoryQueue::take_fault(&self.credential_faults) {
            return Err(IngestError::backend("credential service unavailable"));
        }
        self.with_job(job_id, |_| Ok(()))?;
        Ok(self.issue_credentials(job_id))
    }

    async fn get_uploaded_count(&self, job_id: &JobId) -> Result<u64> {
        let keys = self.with_job(job_id, |job| Ok(job.object_keys.clone()))?;
        Ok(keys.iter().filter(|k| self.store.contains(k)).count() as u64)
    }

    async fn get_expected_count(&self, job_id: &JobId) -> Result<u64> {
        self.with_job(job_id, |job| Ok(job.job.expected_units))
    }
}

/// Resolves `memory://{job}/upload` handles against a [`MemoryBackend`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ResourceConnector for MemoryConnector {
    async fn connect_queue(
        &self,
        handle: &str,
        _credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn WorkQueue>> {
        let job_id = handle
            .strip_prefix(QUEUE_SCHEME)
            .and_then(|rest| rest.strip_suffix("/upload"))
            .ok_or_else(|| IngestError::configuration(format!("not a memory queue handle: {handle}")))?;
        let queue = self
            .backend
            .queue(&JobId::from(job_id))
            .ok_or_else(|| IngestError::JobNotFound(JobId::from(job_id)))?;
        Ok(queue)
    }

    async fn connect_store(
        &self,
        bucket: &str,
        credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn ObjectStore>> {
        if bucket != MEMORY_BUCKET {
            return Err(IngestError::configuration(format!("unknown bucket {bucket}")));
        }
        Ok(Arc::new(SignedStore {
            store: self.backend.store(),
            credentials,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::tests::tile_config_json;
    use crate::keys::decode_tile_key;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_lease_hides_then_redelivers() {
        let queue = MemoryQueue::new("q");
        queue.push("a");
        queue.push("b");

        let first = queue.dequeue(1, LEASE).await.unwrap();
        assert_eq!(first[0].body, "a");
        assert_eq!(queue.approximate_depth().await.unwrap(), 1);
        assert_eq!(queue.in_flight(), 1);

        tokio::time::advance(LEASE + Duration::from_secs(1)).await;
        let again = queue.dequeue(10, LEASE).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_receipt_delete_is_noop() {
        let queue = MemoryQueue::new("q");
        queue.push("a");
        let first = queue.dequeue(1, LEASE).await.unwrap().remove(0);
        tokio::time::advance(LEASE * 2).await;
        let second = queue.dequeue(1, LEASE).await.unwrap().remove(0);

        queue.delete(&first).await.unwrap();
        assert_eq!(queue.len(), 1);
        queue.delete(&second).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.delete_count(), 1);
        assert_eq!(queue.delete_calls(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_fault_is_transient() {
        let queue = MemoryQueue::new("q");
        queue.fail_dequeues(1);
        assert!(queue.dequeue(1, LEASE).await.unwrap_err().is_transient());
        assert!(queue.dequeue(1, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_enqueues_every_unit() {
        let backend = MemoryBackend::new();
        let config = JobConfig::from_json(&tile_config_json()).unwrap();
        let session = backend.create_job(&config).await.unwrap();
        let queue = backend.queue(&session.job.id).unwrap();
        assert_eq!(queue.len(), 512);
        assert_eq!(session.job.expected_units, 512);

        let item = queue.dequeue(1, LEASE).await.unwrap().remove(0);
        let task = TaskMessage::parse(&item.body).unwrap();
        let decoded = decode_tile_key(task.tile_key.as_deref().unwrap()).unwrap();
        assert_eq!(decoded.project, backend.project(&session.job.id).unwrap());
        assert_eq!((decoded.coord.x, decoded.coord.y, decoded.coord.z), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_uploaded_count_tracks_store() {
        let backend = MemoryBackend::new();
        let config = JobConfig::from_json(&tile_config_json()).unwrap();
        let id = backend.create_job(&config).await.unwrap().job.id;
        assert_eq!(backend.get_uploaded_count(&id).await.unwrap(), 0);
        backend.mark_all_uploaded(&id);
        assert_eq!(backend.get_uploaded_count(&id).await.unwrap(), 512);
        assert_eq!(backend.get_expected_count(&id).await.unwrap(), 512);
    }

    #[tokio::test]
    async fn test_complete_refused_while_leased_items_remain() {
        let backend = MemoryBackend::new();
        let config = JobConfig::from_json(&tile_config_json()).unwrap();
        let id = backend.create_job(&config).await.unwrap().job.id;
        let queue = backend.queue(&id).unwrap();
        let leased = queue.dequeue(10, LEASE).await.unwrap();
        assert_eq!(leased.len(), 10);
        queue.delete(&leased[0]).await.unwrap();
        // Depth ignores leased items, completion does not
        let drained = {
            let mut drained = 0;
            while !queue.dequeue(10, LEASE).await.unwrap().is_empty() {
                drained += 1;
            }
            drained
        };
        assert!(drained > 0);
        assert_eq!(queue.approximate_depth().await.unwrap(), 0);
        assert!(matches!(
            backend.complete_job(&id).await,
            Err(IngestError::PrematureCompletion { .. })
        ));
    }

    #[tokio::test]
    async fn test_signed_store_rejects_revoked_key() {
        let backend = Arc::new(MemoryBackend::new());
        let config = JobConfig::from_json(&tile_config_json()).unwrap();
        let session = backend.create_job(&config).await.unwrap();
        let credentials = Arc::new(CredentialManager::new(
            session.job.id.clone(),
            backend.clone(),
            session.credentials.clone(),
            crate::retry::RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 2),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        ));
        let connector = MemoryConnector::new(backend.clone());
        let store = connector
            .connect_store(&session.bucket, credentials.clone())
            .await
            .unwrap();

        backend.store().revoke(session.credentials.access_key.clone());
        let request = UploadRequest {
            key: "k".into(),
            body: vec![1],
            metadata: HashMap::new(),
        };
        let err = store.put_object(request.clone()).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Authorization);

        credentials.refresh(0).await.unwrap();
        store.put_object(request).await.unwrap();
        assert!(backend.store().contains("k"));
    }

    #[tokio::test]
    async fn test_connector_rejects_foreign_handles() {
        let connector = MemoryConnector::new(Arc::new(MemoryBackend::new()));
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let credentials = Arc::new(CredentialManager::new(
            JobId::from("1"),
            backend,
            Credentials {
                access_key: "a".into(),
                secret_key: "s".into(),
                session_token: None,
                expires_at: None,
            },
            crate::retry::RetryPolicy::default(),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        ));
        assert!(connector
            .connect_queue("https://sqs.example/q", credentials.clone())
            .await
            .is_err());
        assert!(matches!(
            connector.connect_queue("memory://77/upload", credentials).await,
            Err(IngestError::JobNotFound(_))
        ));
    }
}
