//! sd-storage: Cloud storage adapters for seismic dataset transfers
//!
//! Implements `sd_core::StorageAdapter` for:
//! - Amazon S3, IBM Cloud Object Storage and MinIO (via aws-sdk-s3)
//! - Azure Blob Storage (block blobs over REST)
//! - Google Cloud Storage (resumable uploads over the JSON API)
//!
//! [`AdapterRegistry`] picks the adapter for a session's provider.

pub mod azure;
pub mod gcs;
mod rest;
pub mod registry;
pub mod s3;
pub mod settings;

pub use azure::AzureAdapter;
pub use gcs::GcsAdapter;
pub use registry::AdapterRegistry;
pub use s3::S3Adapter;
pub use settings::{S3Endpoint, StorageSettings};
