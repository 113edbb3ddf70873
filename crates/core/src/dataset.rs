//! Dataset-level transfers
//!
//! Glue between the transfer engine and the external metadata service: after an
//! upload the dataset record is patched with the file metadata, after a failed
//! upload the record is deleted, and downloads honour the recorded object count.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Direction, Error, Result, TransferError};
use crate::locator::DatasetRef;
use crate::provider::StorageTier;
use crate::transfer::{TransferOptions, TransferOrchestrator, TransferResult};

/// Only generic (opaque byte) datasets can be copied
pub const GENERIC_DATASET_TYPE: &str = "GENERIC";

/// `filemetadata` block of a dataset record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    pub nobjects: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<StorageTier>,
}

impl FileMetadata {
    pub fn from_result(result: &TransferResult) -> Self {
        Self {
            kind: GENERIC_DATASET_TYPE.to_string(),
            size: result.size,
            nobjects: result.object_count,
            checksum: Some(result.checksum.clone()),
            tier: result.storage_tier,
        }
    }
}

/// Body of the dataset patch sent after a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetPatch {
    pub filemetadata: FileMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

/// Dataset record as returned by the metadata service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetRecord {
    #[serde(default)]
    pub filemetadata: Option<FileMetadata>,
    #[serde(default)]
    pub seismicmeta: Option<serde_json::Value>,
}

impl DatasetRecord {
    /// Check the record describes a dataset this engine can download
    pub fn downloadable_metadata(&self, dataset: &DatasetRef) -> Result<&FileMetadata> {
        let meta = self.filemetadata.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "Corrupted dataset {}, filemetadata not found",
                dataset.locator
            ))
        })?;
        if meta.kind != GENERIC_DATASET_TYPE {
            return Err(Error::Config(format!(
                "Dataset is of type {}, only {GENERIC_DATASET_TYPE} datasets are supported",
                meta.kind
            )));
        }
        Ok(meta)
    }
}

/// Dataset record operations of the external metadata service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn dataset_patch(&self, dataset: &DatasetRef, patch: &DatasetPatch) -> Result<()>;

    async fn dataset_delete(&self, dataset: &DatasetRef) -> Result<()>;
}

/// Path of the seismic-metadata companion written next to a downloaded file
pub fn seismicmeta_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_owned();
    name.push("_seismicmeta.json");
    PathBuf::from(name)
}

/// Upload a file into a registered dataset and record the result
///
/// On transfer failure the dataset record is deleted; a failing delete is only
/// logged so the transfer error is what the caller sees.
pub async fn upload_dataset(
    orchestrator: &TransferOrchestrator,
    metadata: &dyn MetadataService,
    dataset: &DatasetRef,
    local_path: &Path,
    options: &TransferOptions,
    readonly: Option<bool>,
) -> std::result::Result<TransferResult, TransferError> {
    let result = match orchestrator.upload(dataset, local_path, options).await {
        Ok(result) => result,
        Err(err) => {
            if let Err(e) = metadata.dataset_delete(dataset).await {
                tracing::warn!(
                    dataset = %dataset.locator,
                    error = %e,
                    "Failed to delete dataset record after failed upload"
                );
            }
            return Err(err);
        }
    };

    let patch = DatasetPatch {
        filemetadata: FileMetadata::from_result(&result),
        readonly,
    };
    metadata
        .dataset_patch(dataset, &patch)
        .await
        .map_err(|e| TransferError::new(orchestrator.provider(), Direction::Upload, e))?;

    Ok(result)
}

/// Download a dataset and write its seismic metadata, if any, next to the file
pub async fn download_dataset(
    orchestrator: &TransferOrchestrator,
    record: &DatasetRecord,
    dataset: &DatasetRef,
    local_path: &Path,
    options: &TransferOptions,
) -> std::result::Result<TransferResult, TransferError> {
    let fail = |e: Error| TransferError::new(orchestrator.provider(), Direction::Download, e);

    let meta = record.downloadable_metadata(dataset).map_err(fail)?;
    let options = options
        .clone()
        .with_expected_objects(Some(meta.nobjects).filter(|n| *n > 0));

    let result = orchestrator.download(dataset, local_path, &options).await?;

    if let Some(seismicmeta) = &record.seismicmeta {
        let path = seismicmeta_path(local_path);
        let body = serde_json::to_vec(seismicmeta)
            .map_err(|e| fail(Error::General(format!("invalid seismic metadata: {e}"))))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| fail(e.into()))?;
        tracing::debug!(path = %path.display(), "Wrote seismic metadata");
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::adapter::{SessionContext, StorageAdapter, StorageConnector};
    use crate::locator::Locator;
    use crate::provider::Provider;
    use crate::token::StaticCredentials;

    fn dataset() -> DatasetRef {
        DatasetRef::new("tenant", "sub", Locator::new("bucket", "prefix"))
    }

    #[test]
    fn test_patch_serialization() {
        let result = TransferResult {
            object_count: 1,
            size: 42,
            checksum: "abc".to_string(),
            object_digests: vec!["abc".to_string()],
            storage_tier: Some(StorageTier::Cool),
        };
        let patch = DatasetPatch {
            filemetadata: FileMetadata::from_result(&result),
            readonly: None,
        };

        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "filemetadata": {
                    "type": "GENERIC",
                    "size": 42,
                    "nobjects": 1,
                    "checksum": "abc",
                    "tier": "cool"
                }
            })
        );
    }

    #[test]
    fn test_record_validation() {
        let record: DatasetRecord = serde_json::from_value(serde_json::json!({
            "filemetadata": {"type": "GENERIC", "size": 1, "nobjects": 2}
        }))
        .unwrap();
        assert_eq!(record.downloadable_metadata(&dataset()).unwrap().nobjects, 2);

        let missing = DatasetRecord::default();
        assert!(matches!(
            missing.downloadable_metadata(&dataset()),
            Err(Error::Config(_))
        ));

        let other: DatasetRecord = serde_json::from_value(serde_json::json!({
            "filemetadata": {"type": "SEGY", "size": 1, "nobjects": 1}
        }))
        .unwrap();
        assert!(other.downloadable_metadata(&dataset()).is_err());
    }

    #[test]
    fn test_seismicmeta_path() {
        assert_eq!(
            seismicmeta_path(Path::new("/tmp/data.bin")),
            PathBuf::from("/tmp/data.bin_seismicmeta.json")
        );
    }

    /// Connector for sessions that must fail before reaching storage
    struct NoStorage;

    impl StorageConnector for NoStorage {
        fn connect(&self, _ctx: &SessionContext) -> Result<Arc<dyn StorageAdapter>> {
            Err(Error::Config("storage is not reachable here".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_upload_deletes_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();

        let mut metadata = MockMetadataService::new();
        metadata
            .expect_dataset_delete()
            .withf(|ds| ds.tenant == "tenant" && ds.locator.prefix == "prefix")
            .times(1)
            .returning(|_| Err(Error::Transient("503".to_string())));
        metadata.expect_dataset_patch().never();

        let orchestrator = TransferOrchestrator::new(
            Provider::Google,
            Arc::new(NoStorage),
            Arc::new(StaticCredentials::new("token")),
        );
        let err = upload_dataset(
            &orchestrator,
            &metadata,
            &dataset(),
            &source,
            &TransferOptions::new(),
            None,
        )
        .await
        .unwrap_err();

        // The failed delete is logged; the transfer error is what surfaces
        assert!(matches!(err.kind(), Error::EmptyFile(_)));
        assert_eq!(err.direction, Direction::Upload);
    }
}
