//! sd-core: Chunked transfer engine for seismic datasets
//!
//! This crate provides the provider-independent parts of dataset transfers:
//! - Chunk planning under per-provider limits
//! - Ordered checksum accumulation
//! - Retry with a per-chunk and per-session budget
//! - Scoped access tokens with single-flight refresh
//! - The `StorageAdapter` trait and the upload/download orchestrator
//!
//! It does not depend on any cloud SDK; adapters live in `sd-storage`.

pub mod adapter;
pub mod checksum;
pub mod chunk;
pub mod dataset;
pub mod error;
mod fileio;
pub mod locator;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod token;
pub mod transfer;

pub use adapter::{
    ChunkAck, DownloadInfo, ObjectState, RemoteObjectInfo, SessionContext, StorageAdapter,
    StorageConnector, UploadHandle,
};
pub use checksum::{ChecksumEngine, DigestAlgorithm, HashStrategy, ReorderBuffer};
pub use chunk::{Chunk, ChunkPlan, ChunkPlanner, ChunkPolicy, ChunkState, GIB, KIB, MIB, TIB};
pub use dataset::{
    DatasetPatch, DatasetRecord, FileMetadata, MetadataService, download_dataset, upload_dataset,
};
pub use error::{Direction, Error, Result, RetryScope, TransferError};
pub use locator::{DatasetRef, Locator, ObjectRef};
pub use progress::{NoProgress, ProgressCounter, ProgressReporter};
pub use provider::{Provider, StorageTier};
pub use retry::{RetryBuilder, RetryConfig, RetryPolicy, is_retryable_error};
pub use token::{AccessToken, AccessTokenCache, CredentialSource, StaticCredentials, TokenScope};
pub use transfer::{TransferOptions, TransferOrchestrator, TransferResult};
