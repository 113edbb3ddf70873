//! In-memory storage adapter with fault injection

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use sd_core::{
    AccessTokenCache, ChecksumEngine, Chunk, ChunkAck, ChunkPolicy, DatasetPatch, DatasetRef,
    DigestAlgorithm, Error, Locator, MetadataService, ObjectRef, Provider, RemoteObjectInfo,
    Result, RetryBuilder, RetryConfig, SessionContext, StaticCredentials, StorageAdapter,
    StorageConnector, StorageTier, TransferOrchestrator, UploadHandle,
};

#[derive(Debug, Default)]
pub struct CallCounts {
    pub connect: AtomicUsize,
    pub begin: AtomicUsize,
    pub put: AtomicUsize,
    pub complete: AtomicUsize,
    pub abort: AtomicUsize,
    pub head: AtomicUsize,
    pub get: AtomicUsize,
}

impl CallCounts {
    pub fn total_adapter_calls(&self) -> usize {
        [
            &self.begin,
            &self.put,
            &self.complete,
            &self.abort,
            &self.head,
            &self.get,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    digest: String,
    tier: Option<String>,
    part_size: Option<u64>,
}

#[derive(Default)]
pub struct Faults {
    /// Remaining transient failures per chunk index
    pub put_failures: Mutex<HashMap<usize, u32>>,
    /// Remaining auth failures for any put
    pub put_auth_failures: AtomicUsize,
    /// Chunk puts sleep longer the lower their index
    pub reverse_completion: bool,
    pub corrupt_commit_digest: bool,
    /// Commit reports half the object size with a matching digest
    pub short_commit: bool,
    /// Delay the first chunk of object 0 by this long
    pub stall_first_chunk: Option<Duration>,
    pub fail_abort: bool,
    /// Cancel this token once the given number of puts succeeded
    pub cancel_after_puts: Option<(usize, CancellationToken)>,
}

/// How far chunk dispatch ran ahead while the first chunk was stalled
#[derive(Debug, Default)]
pub struct StallStats {
    first_done: AtomicBool,
    /// Highest chunk index started before the first chunk completed
    pub max_started: AtomicUsize,
}

impl StallStats {
    pub fn reset(&self) {
        self.first_done.store(false, Ordering::SeqCst);
        self.max_started.store(0, Ordering::SeqCst);
    }

    async fn observe(&self, index: usize, stall: Option<Duration>) {
        let Some(delay) = stall else {
            return;
        };
        if index == 0 {
            tokio::time::sleep(delay).await;
            self.first_done.store(true, Ordering::SeqCst);
        } else if !self.first_done.load(Ordering::SeqCst) {
            self.max_started.fetch_max(index, Ordering::SeqCst);
        }
    }
}

/// Adapter that keeps objects in memory
pub struct MemoryAdapter {
    pub policy: ChunkPolicy,
    pub algorithm: DigestAlgorithm,
    pub download_chunk: u64,
    pub record_part_size: bool,
    pub faults: Faults,
    pub calls: CallCounts,
    pub stall: StallStats,
    pub tokens: Mutex<Option<Arc<AccessTokenCache>>>,
    /// Token value the adapter accepts; any token when `None`
    pub accepted_token: Option<String>,
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, BTreeMap<usize, Bytes>>>,
    next_session: AtomicUsize,
}

impl MemoryAdapter {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            policy: ChunkPolicy::unrestricted(),
            algorithm,
            download_chunk: 16,
            record_part_size: true,
            faults: Faults::default(),
            calls: CallCounts::default(),
            stall: StallStats::default(),
            tokens: Mutex::new(None),
            accepted_token: None,
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_session: AtomicUsize::new(0),
        }
    }

    pub fn with_policy(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn object_data(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    /// Overwrite stored content without touching the recorded digest
    pub fn tamper(&self, key: &str, data: &[u8]) {
        if let Some(object) = self.objects.lock().unwrap().get_mut(key) {
            object.data = Bytes::copy_from_slice(data);
        }
    }

    fn digest_of(&self, parts: &[Bytes]) -> String {
        let mut engine = ChecksumEngine::new(self.algorithm);
        for (i, part) in parts.iter().enumerate() {
            engine.update(i, part).unwrap();
        }
        engine.digest()
    }

    async fn check_token(&self) -> Result<()> {
        let Some(accepted) = &self.accepted_token else {
            return Ok(());
        };
        let tokens = self.tokens.lock().unwrap().clone();
        let Some(tokens) = tokens else {
            return Err(Error::Auth("no token cache".to_string()));
        };
        let token = tokens.get().await?;
        if &token.value != accepted {
            return Err(Error::Auth(format!("token '{}' rejected", token.value)));
        }
        Ok(())
    }
}

fn tier_name(tier: StorageTier) -> &'static str {
    match tier {
        StorageTier::Hot => "HOT",
        StorageTier::Cool => "COOL",
        StorageTier::Cold => "COLD",
        StorageTier::Archive => "ARCHIVE",
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn chunk_policy(&self) -> ChunkPolicy {
        self.policy
    }

    fn digest_algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    fn download_chunk_size(&self) -> u64 {
        self.download_chunk
    }

    async fn begin_upload(
        &self,
        object: ObjectRef,
        object_size: u64,
        part_size: u64,
        tier: Option<StorageTier>,
    ) -> Result<UploadHandle> {
        self.calls.begin.fetch_add(1, Ordering::SeqCst);
        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.uploads
            .lock()
            .unwrap()
            .insert(id.clone(), BTreeMap::new());
        Ok(UploadHandle::new(object, object_size, part_size, tier, id))
    }

    async fn put_chunk(&self, handle: &UploadHandle, chunk: &Chunk, data: Bytes) -> Result<ChunkAck> {
        self.calls.put.fetch_add(1, Ordering::SeqCst);
        self.stall
            .observe(chunk.index, self.faults.stall_first_chunk)
            .await;

        if self
            .faults
            .put_auth_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Auth("token expired".to_string()));
        }
        self.check_token().await?;

        {
            let mut failures = self.faults.put_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&chunk.index)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(Error::Transient(format!("503 on chunk {}", chunk.index)));
            }
        }

        if self.faults.reverse_completion {
            let delay = 5 * (8usize.saturating_sub(chunk.part)) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        {
            let mut uploads = self.uploads.lock().unwrap();
            let parts = uploads
                .get_mut(&handle.session_id)
                .ok_or_else(|| Error::NotFound(handle.session_id.clone()))?;
            parts.insert(chunk.part, data.clone());
        }
        handle.record_part(chunk.part, format!("part-{}", chunk.part));

        let done = self.calls.put.load(Ordering::SeqCst);
        if let Some((after, token)) = &self.faults.cancel_after_puts
            && done >= *after
        {
            token.cancel();
        }

        Ok(ChunkAck {
            bytes_accepted: data.len() as u64,
            remote_digest: None,
        })
    }

    async fn complete_upload(&self, handle: &UploadHandle, _digest: &str) -> Result<RemoteObjectInfo> {
        self.calls.complete.fetch_add(1, Ordering::SeqCst);
        let parts = self
            .uploads
            .lock()
            .unwrap()
            .remove(&handle.session_id)
            .ok_or_else(|| Error::NotFound(handle.session_id.clone()))?;
        let parts: Vec<Bytes> = parts.into_values().collect();

        let mut data = Vec::new();
        for part in &parts {
            data.extend_from_slice(part);
        }
        let digest = if self.faults.corrupt_commit_digest {
            "bogus".to_string()
        } else {
            self.digest_of(&parts)
        };

        let stored = StoredObject {
            data: Bytes::from(data),
            digest: digest.clone(),
            tier: handle.tier.map(|t| tier_name(t).to_string()),
            part_size: self.record_part_size.then_some(handle.part_size),
        };
        let committed = if self.faults.short_commit {
            stored.data.len() as u64 / 2
        } else {
            stored.data.len() as u64
        };
        let info = RemoteObjectInfo {
            size: committed,
            digest: Some(digest),
            tier: stored.tier.clone(),
            part_size: stored.part_size,
        };
        self.objects
            .lock()
            .unwrap()
            .insert(handle.object.key(), stored);
        Ok(info)
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()> {
        self.calls.abort.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_abort {
            return Err(Error::Transient("abort failed".to_string()));
        }
        self.uploads.lock().unwrap().remove(&handle.session_id);
        self.objects.lock().unwrap().remove(&handle.object.key());
        Ok(())
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<Option<RemoteObjectInfo>> {
        self.calls.head.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&object.key())
            .map(|o| RemoteObjectInfo {
                size: o.data.len() as u64,
                digest: Some(o.digest.clone()),
                tier: o.tier.clone(),
                part_size: o.part_size,
            }))
    }

    async fn get_chunk(&self, object: &ObjectRef, range: Range<u64>) -> Result<Bytes> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        if object.index == 0 {
            let index = (range.start / self.download_chunk.max(1)) as usize;
            self.stall
                .observe(index, self.faults.stall_first_chunk)
                .await;
        }
        let data = self
            .object_data(&object.key())
            .ok_or_else(|| Error::NotFound(object.key()))?;
        Ok(data.slice(range.start as usize..range.end as usize))
    }
}

/// Hands the same adapter to every session
pub struct MemoryConnector {
    pub adapter: Arc<MemoryAdapter>,
}

impl StorageConnector for MemoryConnector {
    fn connect(&self, ctx: &SessionContext) -> Result<Arc<dyn StorageAdapter>> {
        self.adapter.calls.connect.fetch_add(1, Ordering::SeqCst);
        *self.adapter.tokens.lock().unwrap() = Some(ctx.tokens.clone());
        Ok(self.adapter.clone())
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryBuilder::new()
        .max_attempts(max_attempts)
        .backoff_base_ms(1)
        .backoff_factor_ms(1)
        .build()
}

pub fn orchestrator(adapter: Arc<MemoryAdapter>) -> TransferOrchestrator {
    TransferOrchestrator::new(
        Provider::Google,
        Arc::new(MemoryConnector { adapter }),
        Arc::new(StaticCredentials::new("token")),
    )
    .with_retry(fast_retry(3))
}

pub fn dataset() -> DatasetRef {
    DatasetRef::new("tenant", "subproject", Locator::new("bucket", "datasets/abc"))
}

/// Deterministic, non-repeating test content
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn write_source(dir: &Path, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let path = dir.join(format!("source-{len}.bin"));
    let data = content(len);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

/// Metadata service that records what it was asked to do
#[derive(Default)]
pub struct RecordingMetadata {
    pub patches: Mutex<Vec<DatasetPatch>>,
    pub deletes: AtomicUsize,
    pub fail_delete: bool,
}

#[async_trait]
impl MetadataService for RecordingMetadata {
    async fn dataset_patch(&self, _dataset: &DatasetRef, patch: &DatasetPatch) -> Result<()> {
        self.patches.lock().unwrap().push(patch.clone());
        Ok(())
    }

    async fn dataset_delete(&self, _dataset: &DatasetRef) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete {
            return Err(Error::Transient("metadata service unavailable".to_string()));
        }
        Ok(())
    }
}
