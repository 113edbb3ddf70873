//! Upload and download sessions
//!
//! The [`TransferOrchestrator`] drives one session per call: it plans chunks,
//! fans chunk operations out to a bounded set of concurrent workers, feeds the
//! checksum engines in chunk order, commits and verifies each object, and
//! aborts every opened object when the session fails.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::adapter::{ChunkAck, SessionContext, StorageAdapter, StorageConnector, UploadHandle};
use crate::checksum::{ChecksumEngine, ReorderBuffer};
use crate::chunk::{Chunk, ChunkPlan, ChunkPlanner, ChunkState, MIB, ObjectPlan};
use crate::error::{Direction, Error, TransferError};
use crate::fileio;
use crate::locator::{DatasetRef, ObjectRef};
use crate::progress::{NoProgress, ProgressReporter};
use crate::provider::{Provider, StorageTier};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::token::{AccessTokenCache, CredentialSource, DEFAULT_TOKEN_TTL, TokenScope};

/// Upload chunk size used when none is requested
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * MIB;

/// Concurrent chunk operations used when none is requested
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Chunks buffered per unit of concurrency, in flight or awaiting their predecessors
pub const WINDOW_PER_WORKER: usize = 2;

/// Number of chunks of one object that may be held in memory at once
pub fn chunk_window(concurrency: usize) -> usize {
    concurrency.max(1).saturating_mul(WINDOW_PER_WORKER)
}

/// Per-call transfer options
#[derive(Clone)]
pub struct TransferOptions {
    /// Upload chunk size in bytes; for downloads, overrides the adapter default
    pub chunk_size: Option<u64>,
    pub tier: Option<StorageTier>,
    pub max_concurrency: usize,
    /// Number of objects the dataset is known to have (downloads)
    pub expected_objects: Option<usize>,
    pub progress: Arc<dyn ProgressReporter>,
    pub cancel: CancellationToken,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            tier: None,
            max_concurrency: DEFAULT_CONCURRENCY,
            expected_objects: None,
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    pub fn with_chunk_size_mib(self, mib: u64) -> Self {
        self.with_chunk_size(mib.saturating_mul(MIB))
    }

    pub fn with_tier(mut self, tier: Option<StorageTier>) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_expected_objects(mut self, n: Option<usize>) -> Self {
        self.expected_objects = n;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("chunk_size", &self.chunk_size)
            .field("tier", &self.tier)
            .field("max_concurrency", &self.max_concurrency)
            .field("expected_objects", &self.expected_objects)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Outcome of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub object_count: usize,
    pub size: u64,
    /// Dataset-level digest over every chunk in index order
    pub checksum: String,
    pub object_digests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_tier: Option<StorageTier>,
}

/// Error plus the position in the session where it happened
#[derive(Debug)]
struct Failure {
    error: Error,
    object_index: Option<usize>,
    chunk_index: Option<usize>,
}

impl Failure {
    fn at_object(error: Error, object_index: usize) -> Self {
        Self {
            error,
            object_index: Some(object_index),
            chunk_index: None,
        }
    }

    fn at_chunk(error: Error, chunk: &Chunk) -> Self {
        Self {
            error,
            object_index: Some(chunk.object_index),
            chunk_index: Some(chunk.index),
        }
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            error,
            object_index: None,
            chunk_index: None,
        }
    }
}

/// Chunk lifecycle bookkeeping for one object
struct ChunkLedger {
    first_index: usize,
    states: Mutex<Vec<ChunkState>>,
}

impl ChunkLedger {
    fn new(object: &ObjectPlan) -> Self {
        Self {
            first_index: object.chunks.first().map(|c| c.index).unwrap_or_default(),
            states: Mutex::new(vec![ChunkState::Pending; object.chunks.len()]),
        }
    }

    fn set(&self, chunk: &Chunk, state: ChunkState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = states.get_mut(chunk.index - self.first_index) {
            tracing::trace!(chunk = chunk.index, from = ?*slot, to = ?state, "Chunk state change");
            *slot = state;
        }
    }

    fn count(&self, state: ChunkState) -> usize {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.iter().filter(|s| **s == state).count()
    }
}

/// Bounds how far dispatch may run ahead of the in-order checksum feed
///
/// Permits are taken in chunk order before a chunk is read or fetched and are
/// released once the chunk has been applied, so the lowest pending chunk always
/// holds one.
struct ChunkWindow {
    permits: Arc<Semaphore>,
}

impl ChunkWindow {
    fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    async fn enter<'a>(&self, chunk: &'a Chunk) -> Result<(&'a Chunk, OwnedSemaphorePermit), (&'a Chunk, Error)> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map(|permit| (chunk, permit))
            .map_err(|_| (chunk, Error::General("chunk window closed".to_string())))
    }
}

/// Adapter and retry policy bound to one session
struct Session {
    adapter: Arc<dyn StorageAdapter>,
    retry: RetryPolicy,
}

/// Drives chunked uploads and downloads against one provider
pub struct TransferOrchestrator {
    provider: Provider,
    connector: Arc<dyn StorageConnector>,
    credentials: Arc<dyn CredentialSource>,
    retry: RetryConfig,
    token_ttl: Duration,
}

impl TransferOrchestrator {
    pub fn new(
        provider: Provider,
        connector: Arc<dyn StorageConnector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            provider,
            connector,
            credentials,
            retry: RetryConfig::default(),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn open_session(&self, dataset: &DatasetRef, direction: Direction) -> Result<Session, Failure> {
        let scope = TokenScope::new(
            dataset.tenant.clone(),
            dataset.subproject.clone(),
            direction == Direction::Download,
        );
        let tokens = Arc::new(AccessTokenCache::with_ttl(
            self.credentials.clone(),
            scope,
            self.token_ttl,
        ));
        let ctx = SessionContext {
            provider: self.provider,
            direction,
            locator: dataset.locator.clone(),
            tokens: tokens.clone(),
        };
        let adapter = self.connector.connect(&ctx)?;

        Ok(Session {
            adapter,
            retry: RetryPolicy::new(self.retry.clone()).with_token_cache(tokens),
        })
    }

    fn fail(&self, direction: Direction, failure: Failure, cleanup: Vec<Error>) -> TransferError {
        let mut err = TransferError::new(self.provider, direction, failure.error).at_chunk(failure.chunk_index);
        if let Some(object_index) = failure.object_index {
            err = err.at_object(object_index);
        }
        err.cleanup = cleanup;
        err
    }

    /// Upload `local_path` as the content of `dataset`
    pub async fn upload(
        &self,
        dataset: &DatasetRef,
        local_path: &Path,
        options: &TransferOptions,
    ) -> Result<TransferResult, TransferError> {
        let direction = Direction::Upload;
        let started = Instant::now();

        let (file, size) = fileio::open_source(local_path)
            .await
            .map_err(|e| self.fail(direction, e.into(), Vec::new()))?;
        if size == 0 {
            let error = Error::EmptyFile(local_path.display().to_string());
            return Err(self.fail(direction, error.into(), Vec::new()));
        }

        let session = self
            .open_session(dataset, direction)
            .map_err(|f| self.fail(direction, f, Vec::new()))?;
        let planner = ChunkPlanner::new(session.adapter.chunk_policy());
        let plan = planner
            .plan(size, options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE))
            .map_err(|e| self.fail(direction, e.into(), Vec::new()))?;

        tracing::info!(
            provider = %self.provider,
            dataset = %dataset.locator,
            bytes = size,
            objects = plan.object_count(),
            chunks = plan.chunk_count(),
            "Starting upload"
        );
        options
            .progress
            .on_start(direction, size, plan.object_count());

        let mut handles = Vec::with_capacity(plan.object_count());
        let outcome = self
            .upload_objects(&session, dataset, &file, &plan, options, &mut handles)
            .await;

        match outcome {
            Ok(result) => {
                options.progress.on_finish(true);
                log_throughput(direction, result.size, started.elapsed());
                Ok(result)
            }
            Err(failure) => {
                options.progress.on_finish(false);
                let cleanup = abort_all(session.adapter.as_ref(), &handles).await;
                Err(self.fail(direction, failure, cleanup))
            }
        }
    }

    async fn upload_objects(
        &self,
        session: &Session,
        dataset: &DatasetRef,
        file: &Arc<File>,
        plan: &ChunkPlan,
        options: &TransferOptions,
        handles: &mut Vec<UploadHandle>,
    ) -> Result<TransferResult, Failure> {
        let adapter = session.adapter.as_ref();
        let concurrency = adapter
            .chunk_policy()
            .upload_concurrency(options.max_concurrency);
        let mut dataset_engine = ChecksumEngine::new(adapter.digest_algorithm());
        let mut object_digests = Vec::with_capacity(plan.object_count());

        for object in &plan.objects {
            if options.cancel.is_cancelled() {
                return Err(Failure::at_object(Error::Cancelled, object.index));
            }

            let object_ref = ObjectRef::new(dataset.locator.clone(), object.index);
            let handle = session
                .retry
                .execute(None, || {
                    adapter.begin_upload(object_ref.clone(), object.size, object.chunk_size, options.tier)
                })
                .await
                .map_err(|e| Failure::at_object(e, object.index))?;
            handles.push(handle);
            let Some(handle) = handles.last() else {
                return Err(Failure::at_object(
                    Error::General("upload handle missing".to_string()),
                    object.index,
                ));
            };

            let engine = upload_chunks(
                session,
                handle,
                object,
                file,
                options,
                concurrency,
                &mut dataset_engine,
            )
            .await?;

            let local_digest = engine.digest();
            let remote = session
                .retry
                .execute(None, || adapter.commit(handle, &local_digest))
                .await
                .map_err(|e| Failure::at_object(e, object.index))?;

            if remote.size != object.size {
                return Err(Failure::at_object(
                    Error::SizeMismatch {
                        object_index: object.index,
                        expected: object.size,
                        actual: remote.size,
                    },
                    object.index,
                ));
            }

            match remote.digest.as_deref() {
                Some(remote_digest) if engine.verify(remote_digest) => handle.mark_verified(),
                Some(remote_digest) => {
                    return Err(Failure::at_object(
                        Error::ChecksumMismatch {
                            object_index: object.index,
                            expected: local_digest,
                            actual: remote_digest.to_string(),
                        },
                        object.index,
                    ));
                }
                None => tracing::warn!(
                    object = %handle.object.key(),
                    "Provider reported no digest, object integrity not verified"
                ),
            }

            options.progress.on_object_complete(object.index);
            object_digests.push(local_digest);
        }

        Ok(TransferResult {
            object_count: plan.object_count(),
            size: plan.total_size,
            checksum: dataset_engine.digest(),
            object_digests,
            storage_tier: options.tier,
        })
    }

    /// Download the content of `dataset` into `local_path`
    ///
    /// On a digest mismatch the written file is left in place.
    pub async fn download(
        &self,
        dataset: &DatasetRef,
        local_path: &Path,
        options: &TransferOptions,
    ) -> Result<TransferResult, TransferError> {
        let direction = Direction::Download;
        let started = Instant::now();

        let outcome = self
            .download_objects(dataset, local_path, options)
            .await;

        match outcome {
            Ok(result) => {
                options.progress.on_finish(true);
                log_throughput(direction, result.size, started.elapsed());
                Ok(result)
            }
            Err(failure) => {
                options.progress.on_finish(false);
                Err(self.fail(direction, failure, Vec::new()))
            }
        }
    }

    async fn download_objects(
        &self,
        dataset: &DatasetRef,
        local_path: &Path,
        options: &TransferOptions,
    ) -> Result<TransferResult, Failure> {
        if options.chunk_size == Some(0) {
            return Err(Error::InvalidChunkSize {
                requested: 0,
                reason: "download chunks must hold at least one byte".to_string(),
            }
            .into());
        }

        let session = self.open_session(dataset, Direction::Download)?;
        let adapter = session.adapter.as_ref();
        let algorithm = adapter.digest_algorithm();

        let info = session
            .retry
            .execute(None, || {
                adapter.begin_download(&dataset.locator, options.expected_objects)
            })
            .await?;

        let default_chunk = options
            .chunk_size
            .unwrap_or_else(|| adapter.download_chunk_size());
        // Boundary-sensitive digests can only be reproduced with the upload's part size
        let plan = ChunkPlan::from_objects(info.objects.iter().map(|o| {
            let chunk_size = match o.part_size {
                Some(part) if algorithm.is_boundary_sensitive() && part > 0 => part,
                _ => default_chunk,
            };
            (o.size, chunk_size)
        }));

        tracing::info!(
            provider = %self.provider,
            dataset = %dataset.locator,
            bytes = plan.total_size,
            objects = plan.object_count(),
            chunks = plan.chunk_count(),
            "Starting download"
        );
        options
            .progress
            .on_start(Direction::Download, plan.total_size, plan.object_count());

        let file = fileio::create_sized(local_path, plan.total_size).await?;
        let mut dataset_engine = ChecksumEngine::new(algorithm);
        let mut object_digests = Vec::with_capacity(plan.object_count());

        for (object, remote) in plan.objects.iter().zip(&info.objects) {
            if options.cancel.is_cancelled() {
                return Err(Failure::at_object(Error::Cancelled, object.index));
            }

            let object_ref = ObjectRef::new(dataset.locator.clone(), object.index);
            let engine = download_chunks(
                &session,
                &object_ref,
                object,
                &file,
                options,
                &mut dataset_engine,
            )
            .await?;
            let local_digest = engine.digest();

            let remote_digest = session
                .retry
                .execute(None, || adapter.get_object_digest(&object_ref))
                .await
                .map_err(|e| Failure::at_object(e, object.index))?;
            let comparable = !algorithm.is_boundary_sensitive() || remote.part_size.is_some();

            match remote_digest {
                Some(remote_digest) if !comparable => tracing::warn!(
                    object = %object_ref.key(),
                    remote = %remote_digest,
                    "Upload part size unknown, object digest cannot be reproduced"
                ),
                Some(remote_digest) if engine.verify(&remote_digest) => {
                    tracing::debug!(object = %object_ref.key(), "Object digest verified");
                }
                Some(remote_digest) => {
                    return Err(Failure::at_object(
                        Error::ChecksumMismatch {
                            object_index: object.index,
                            expected: remote_digest,
                            actual: local_digest,
                        },
                        object.index,
                    ));
                }
                None => tracing::warn!(
                    object = %object_ref.key(),
                    "Provider reported no digest, object integrity not verified"
                ),
            }

            options.progress.on_object_complete(object.index);
            object_digests.push(local_digest);
        }

        fileio::sync(file).await?;

        Ok(TransferResult {
            object_count: plan.object_count(),
            size: plan.total_size,
            checksum: dataset_engine.digest(),
            object_digests,
            storage_tier: info
                .objects
                .first()
                .and_then(|o| o.tier.as_deref())
                .and_then(StorageTier::from_native),
        })
    }
}

/// Send the chunks of one object and return its checksum engine
async fn upload_chunks(
    session: &Session,
    handle: &UploadHandle,
    object: &ObjectPlan,
    file: &Arc<File>,
    options: &TransferOptions,
    concurrency: usize,
    dataset_engine: &mut ChecksumEngine,
) -> Result<ChecksumEngine, Failure> {
    let adapter = session.adapter.as_ref();
    let retry = &session.retry;
    let ledger = ChunkLedger::new(object);
    let ledger = &ledger;
    let mut object_engine = ChecksumEngine::new(adapter.digest_algorithm());
    let mut reorder: ReorderBuffer<(Bytes, OwnedSemaphorePermit)> =
        ReorderBuffer::new(ledger.first_index);
    let window = ChunkWindow::new(chunk_window(concurrency));
    let window = &window;
    let cancel = options.cancel.clone();

    let acks = stream::iter(object.chunks.iter())
        .take_while(move |_| futures::future::ready(!cancel.is_cancelled()))
        .then(|chunk| window.enter(chunk))
        .map(|entered| async move {
            let (chunk, permit) = entered?;
            let data = fileio::read_at(file.clone(), chunk.range.start, chunk.len() as usize)
                .await
                .map_err(|e| (chunk, e))?;
            ledger.set(chunk, ChunkState::Sent);
            let ack: ChunkAck = retry
                .execute(Some(chunk.index), || {
                    adapter.put_chunk(handle, chunk, data.clone())
                })
                .await
                .map_err(|e| (chunk, e))?;
            Ok::<_, (&Chunk, Error)>((chunk, data, ack, permit))
        })
        .buffer_unordered(concurrency);
    let mut acks = std::pin::pin!(acks);

    while let Some(outcome) = acks.next().await {
        let (chunk, data, ack, permit) = match outcome {
            Ok(done) => done,
            Err((chunk, error)) => {
                ledger.set(chunk, ChunkState::Failed);
                return Err(Failure::at_chunk(error, chunk));
            }
        };

        if ack.bytes_accepted != chunk.len() {
            ledger.set(chunk, ChunkState::Failed);
            let error = Error::Provider(format!(
                "provider accepted {} of {} bytes",
                ack.bytes_accepted,
                chunk.len()
            ));
            return Err(Failure::at_chunk(error, chunk));
        }
        ledger.set(chunk, ChunkState::Acked);
        options.progress.on_bytes(chunk.len());

        for (index, (data, _permit)) in reorder.push(chunk.index, (data, permit)) {
            object_engine.update(index - ledger.first_index, &data)?;
            dataset_engine.update(index, &data)?;
        }
    }

    if options.cancel.is_cancelled() {
        return Err(Failure::at_object(Error::Cancelled, object.index));
    }
    finish_object(object, ledger, &reorder, object_engine)
}

/// Fetch the chunks of one object into the local file
async fn download_chunks(
    session: &Session,
    object_ref: &ObjectRef,
    object: &ObjectPlan,
    file: &Arc<File>,
    options: &TransferOptions,
    dataset_engine: &mut ChecksumEngine,
) -> Result<ChecksumEngine, Failure> {
    let adapter = session.adapter.as_ref();
    let retry = &session.retry;
    let ledger = ChunkLedger::new(object);
    let ledger = &ledger;
    let mut object_engine = ChecksumEngine::new(adapter.digest_algorithm());
    let concurrency = options.max_concurrency.max(1);
    let mut reorder: ReorderBuffer<(Bytes, OwnedSemaphorePermit)> =
        ReorderBuffer::new(ledger.first_index);
    let window = ChunkWindow::new(chunk_window(concurrency));
    let window = &window;
    let cancel = options.cancel.clone();

    let fetched = stream::iter(object.chunks.iter())
        .take_while(move |_| futures::future::ready(!cancel.is_cancelled()))
        .then(|chunk| window.enter(chunk))
        .map(|entered| async move {
            let (chunk, permit) = entered?;
            ledger.set(chunk, ChunkState::Sent);
            let data = retry
                .execute(Some(chunk.index), || {
                    adapter.get_chunk(object_ref, chunk.object_range())
                })
                .await
                .map_err(|e| (chunk, e))?;
            if data.len() as u64 != chunk.len() {
                let error = Error::Provider(format!(
                    "received {} bytes for a {}-byte range",
                    data.len(),
                    chunk.len()
                ));
                return Err((chunk, error));
            }
            fileio::write_at(file.clone(), chunk.range.start, data.clone())
                .await
                .map_err(|e| (chunk, e))?;
            Ok::<_, (&Chunk, Error)>((chunk, data, permit))
        })
        .buffer_unordered(concurrency);
    let mut fetched = std::pin::pin!(fetched);

    while let Some(outcome) = fetched.next().await {
        let (chunk, data, permit) = match outcome {
            Ok(done) => done,
            Err((chunk, error)) => {
                ledger.set(chunk, ChunkState::Failed);
                return Err(Failure::at_chunk(error, chunk));
            }
        };
        ledger.set(chunk, ChunkState::Acked);
        options.progress.on_bytes(chunk.len());

        for (index, (data, _permit)) in reorder.push(chunk.index, (data, permit)) {
            object_engine.update(index - ledger.first_index, &data)?;
            dataset_engine.update(index, &data)?;
        }
    }

    if options.cancel.is_cancelled() {
        return Err(Failure::at_object(Error::Cancelled, object.index));
    }
    finish_object(object, ledger, &reorder, object_engine)
}

fn finish_object<T>(
    object: &ObjectPlan,
    ledger: &ChunkLedger,
    reorder: &ReorderBuffer<T>,
    engine: ChecksumEngine,
) -> Result<ChecksumEngine, Failure> {
    let acked = ledger.count(ChunkState::Acked);
    if acked != object.chunks.len() || !reorder.is_drained() || engine.chunks_applied() != acked {
        return Err(Failure::at_object(
            Error::General(format!(
                "object {} finished with {acked} of {} chunks applied",
                object.index,
                object.chunks.len()
            )),
            object.index,
        ));
    }
    Ok(engine)
}

/// Abort every opened object once; failures are collected, never raised
async fn abort_all(adapter: &dyn StorageAdapter, handles: &[UploadHandle]) -> Vec<Error> {
    let mut cleanup = Vec::new();
    for handle in handles {
        if let Err(e) = adapter.abort(handle).await {
            tracing::warn!(
                object = %handle.object.key(),
                error = %e,
                "Failed to abort partial upload"
            );
            cleanup.push(Error::PartialObjectCleanup {
                object_index: handle.object.index,
                source: Box::new(e),
            });
        }
    }
    cleanup
}

fn log_throughput(direction: Direction, bytes: u64, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        bytes as f64 / MIB as f64 / secs
    } else {
        0.0
    };
    tracing::info!(
        direction = %direction,
        bytes = bytes,
        elapsed_ms = elapsed.as_millis() as u64,
        rate = %format!("{rate:.2} MB/s"),
        "Transfer complete"
    );
}
