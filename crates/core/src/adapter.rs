//! Storage adapter abstraction
//!
//! One [`StorageAdapter`] implementation exists per provider wire protocol. The
//! orchestrator only talks to adapters through this trait; adapters never see
//! chunk planning, retries or digest accumulation.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use crate::checksum::DigestAlgorithm;
use crate::chunk::{Chunk, ChunkPolicy};
use crate::error::{Direction, Error, Result};
use crate::locator::{Locator, ObjectRef};
use crate::provider::{Provider, StorageTier};
use crate::token::AccessTokenCache;

/// Upper bound on objects probed when the object count is unknown
pub const MAX_PROBED_OBJECTS: usize = 10_000;

/// Provider acknowledgement of one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkAck {
    pub bytes_accepted: u64,
    /// Per-chunk digest echoed by the provider, when it returns one
    pub remote_digest: Option<String>,
}

/// Attributes of a committed remote object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteObjectInfo {
    pub size: u64,
    /// Provider-reported digest in the adapter's [`DigestAlgorithm`] encoding
    pub digest: Option<String>,
    /// Provider-native storage class name
    pub tier: Option<String>,
    /// Chunk size the object was uploaded with, if recorded
    pub part_size: Option<u64>,
}

/// Remote layout of a dataset about to be downloaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadInfo {
    pub objects: Vec<RemoteObjectInfo>,
}

impl DownloadInfo {
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn total_size(&self) -> u64 {
        self.objects.iter().map(|o| o.size).sum()
    }
}

/// Lifecycle of a remote object within an upload session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectState {
    Init,
    SessionOpen,
    CommitPending,
    Verified,
    Aborted,
}

#[derive(Debug)]
struct HandleState {
    object: ObjectState,
    parts: BTreeMap<usize, String>,
    committed: Option<RemoteObjectInfo>,
}

/// Provider-side state of one object being uploaded
///
/// `session_id` holds whatever the provider uses to address the upload: an S3
/// upload id, a GCS resumable session URI or an Azure blob URL.
#[derive(Debug)]
pub struct UploadHandle {
    pub object: ObjectRef,
    pub object_size: u64,
    pub part_size: u64,
    pub tier: Option<StorageTier>,
    pub session_id: String,
    state: Mutex<HandleState>,
}

impl UploadHandle {
    pub fn new(
        object: ObjectRef,
        object_size: u64,
        part_size: u64,
        tier: Option<StorageTier>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            object,
            object_size,
            part_size,
            tier,
            session_id: session_id.into(),
            state: Mutex::new(HandleState {
                object: ObjectState::SessionOpen,
                parts: BTreeMap::new(),
                committed: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ObjectState {
        self.lock().object.clone()
    }

    fn transition(&self, next: ObjectState) {
        let mut state = self.lock();
        tracing::debug!(
            object = %self.object.key(),
            from = ?state.object,
            to = ?next,
            "Object state change"
        );
        state.object = next;
    }

    /// Remember the provider tag (ETag, block id) of an accepted part
    pub fn record_part(&self, part: usize, tag: impl Into<String>) {
        self.lock().parts.insert(part, tag.into());
    }

    /// Accepted parts in part order
    pub fn parts(&self) -> Vec<(usize, String)> {
        self.lock()
            .parts
            .iter()
            .map(|(part, tag)| (*part, tag.clone()))
            .collect()
    }

    pub fn committed(&self) -> Option<RemoteObjectInfo> {
        self.lock().committed.clone()
    }

    fn set_committed(&self, info: RemoteObjectInfo) {
        self.lock().committed = Some(info);
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().object == ObjectState::Aborted
    }

    /// The committed object matched the local digest
    pub fn mark_verified(&self) {
        self.transition(ObjectState::Verified);
    }
}

/// Per-provider wire protocol
///
/// `commit` and `abort` are provided on top of `complete_upload` and
/// `abort_upload`; they make both operations idempotent per handle.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn chunk_policy(&self) -> ChunkPolicy;

    fn digest_algorithm(&self) -> DigestAlgorithm;

    /// Chunk size used for downloads when nothing better is known
    fn download_chunk_size(&self) -> u64;

    async fn begin_upload(
        &self,
        object: ObjectRef,
        object_size: u64,
        part_size: u64,
        tier: Option<StorageTier>,
    ) -> Result<UploadHandle>;

    async fn put_chunk(&self, handle: &UploadHandle, chunk: &Chunk, data: Bytes) -> Result<ChunkAck>;

    /// Finalize the object from its accepted parts
    async fn complete_upload(&self, handle: &UploadHandle, digest: &str) -> Result<RemoteObjectInfo>;

    /// Discard the object and any accepted parts
    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()>;

    /// Attributes of one object, `None` when it does not exist
    async fn head_object(&self, object: &ObjectRef) -> Result<Option<RemoteObjectInfo>>;

    async fn get_chunk(&self, object: &ObjectRef, range: Range<u64>) -> Result<Bytes>;

    /// Commit an upload; a second commit returns the first result
    async fn commit(&self, handle: &UploadHandle, digest: &str) -> Result<RemoteObjectInfo> {
        if let Some(info) = handle.committed() {
            return Ok(info);
        }
        if handle.is_aborted() {
            return Err(Error::SessionClosed(format!(
                "{} was aborted",
                handle.object.key()
            )));
        }

        handle.transition(ObjectState::CommitPending);
        let info = self.complete_upload(handle, digest).await?;
        handle.set_committed(info.clone());
        Ok(info)
    }

    /// Release every provider-side resource of the upload; no-op when repeated
    async fn abort(&self, handle: &UploadHandle) -> Result<()> {
        if handle.is_aborted() {
            return Ok(());
        }
        let result = self.abort_upload(handle).await;
        handle.transition(ObjectState::Aborted);
        result
    }

    /// Discover the objects of a dataset
    ///
    /// With `expected_objects` every listed object must exist. Without it,
    /// objects `0, 1, ...` are probed until one is missing.
    async fn begin_download(
        &self,
        locator: &Locator,
        expected_objects: Option<usize>,
    ) -> Result<DownloadInfo> {
        let mut objects = Vec::new();
        let limit = expected_objects.unwrap_or(MAX_PROBED_OBJECTS);

        for index in 0..limit {
            let object = ObjectRef::new(locator.clone(), index);
            match self.head_object(&object).await? {
                Some(info) => objects.push(info),
                None if expected_objects.is_some() => {
                    return Err(Error::NotFound(format!("object {}", object.key())));
                }
                None => break,
            }
        }

        if objects.is_empty() {
            return Err(Error::NotFound(format!("no objects under {locator}")));
        }
        Ok(DownloadInfo { objects })
    }

    /// Digest the provider reports for an object, if any
    async fn get_object_digest(&self, object: &ObjectRef) -> Result<Option<String>> {
        Ok(self.head_object(object).await?.and_then(|info| info.digest))
    }
}

/// Everything an adapter needs to talk to its provider for one session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub provider: Provider,
    pub direction: Direction,
    pub locator: Locator,
    pub tokens: Arc<AccessTokenCache>,
}

/// Creates session-scoped adapters
pub trait StorageConnector: Send + Sync {
    fn connect(&self, ctx: &SessionContext) -> Result<Arc<dyn StorageAdapter>>;
}
