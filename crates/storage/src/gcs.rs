//! Google Cloud Storage adapter
//!
//! Uploads use one resumable session per object. Chunks of a session must be
//! sent in order, so the policy caps upload concurrency at one.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{RequestBuilder, StatusCode};
use sd_core::{
    AccessTokenCache, Chunk, ChunkAck, ChunkPolicy, DigestAlgorithm, Error, KIB, MIB, ObjectRef,
    Provider, RemoteObjectInfo, Result, SessionContext, StorageAdapter, StorageTier, TIB,
    UploadHandle,
};
use serde::Deserialize;

use crate::rest::{build_client, check, classify_status, map_request_error, range_header};
use crate::settings::StorageSettings;

const DOWNLOAD_CHUNK_SIZE: u64 = 20 * MIB;

const GCS_POLICY: ChunkPolicy = ChunkPolicy {
    min_chunk_size: 256 * KIB,
    max_chunk_size: 5 * TIB,
    granularity: 256 * KIB,
    max_chunks_per_object: u64::MAX,
    max_object_size: 5 * TIB,
    max_upload_concurrency: Some(1),
};

/// Resumable uploads answer intermediate chunks with 308
const RESUME_INCOMPLETE: u16 = 308;

/// Returned by a successful session cancel
const CLIENT_CLOSED_REQUEST: u16 = 499;

fn storage_class(tier: StorageTier) -> &'static str {
    match tier {
        StorageTier::Hot => "STANDARD",
        StorageTier::Cool => "NEARLINE",
        StorageTier::Cold => "COLDLINE",
        StorageTier::Archive => "ARCHIVE",
    }
}

/// Fields of the JSON object resource this adapter reads
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    /// Sizes are serialized as decimal strings
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    crc32c: Option<String>,
    #[serde(default)]
    storage_class: Option<String>,
}

impl ObjectResource {
    fn into_info(self) -> Result<RemoteObjectInfo> {
        let size = match self.size {
            Some(size) => size
                .parse()
                .map_err(|_| Error::Provider(format!("invalid object size '{size}'")))?,
            None => 0,
        };
        Ok(RemoteObjectInfo {
            size,
            digest: self.crc32c,
            tier: self.storage_class,
            part_size: None,
        })
    }
}

/// Last byte persisted by a resumable session, from its `Range: bytes=0-N` header
fn persisted_end(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(RANGE)?.to_str().ok()?;
    let (_, last) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    last.parse::<u64>().ok().map(|last| last + 1)
}

/// Adapter for the GCS JSON API
pub struct GcsAdapter {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<AccessTokenCache>,
}

impl GcsAdapter {
    pub fn new(settings: &StorageSettings, ctx: &SessionContext) -> Result<Self> {
        Ok(Self {
            http: build_client(settings)?,
            endpoint: settings.gcs_endpoint.trim_end_matches('/').to_string(),
            tokens: ctx.tokens.clone(),
        })
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.tokens.get().await?;
        Ok(request.header(AUTHORIZATION, format!("Bearer {}", token.value)))
    }

    fn object_url(&self, object: &ObjectRef) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            object.locator.bucket,
            urlencoding::encode(&object.key())
        )
    }

    async fn object_resource(&self, object: &ObjectRef) -> Result<Option<ObjectResource>> {
        let request = self
            .http
            .get(self.object_url(object))
            .query(&[("fields", "size,crc32c,storageClass")]);
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(map_request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "get object metadata").await?;
        let resource = response
            .json::<ObjectResource>()
            .await
            .map_err(|e| Error::Provider(format!("invalid object metadata: {e}")))?;
        Ok(Some(resource))
    }

    /// Ask a session how far it got after an ambiguous failure
    async fn persisted_bytes(&self, handle: &UploadHandle) -> Result<Option<u64>> {
        let request = self
            .http
            .put(&handle.session_id)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{}", handle.object_size));
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(map_request_error)?;

        match response.status().as_u16() {
            200 | 201 => Ok(Some(handle.object_size)),
            RESUME_INCOMPLETE => Ok(Some(persisted_end(&response).unwrap_or(0))),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl StorageAdapter for GcsAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn chunk_policy(&self) -> ChunkPolicy {
        GCS_POLICY
    }

    fn digest_algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::Crc32c
    }

    fn download_chunk_size(&self) -> u64 {
        DOWNLOAD_CHUNK_SIZE
    }

    async fn begin_upload(
        &self,
        object: ObjectRef,
        object_size: u64,
        part_size: u64,
        tier: Option<StorageTier>,
    ) -> Result<UploadHandle> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint, object.locator.bucket
        );
        let mut body = serde_json::Map::new();
        if let Some(tier) = tier {
            body.insert("storageClass".to_string(), storage_class(tier).into());
        }

        let request = self
            .http
            .post(url)
            .query(&[("uploadType", "resumable"), ("name", object.key().as_str())])
            .header("X-Upload-Content-Length", object_size)
            .json(&body);
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check(response, "start resumable upload").await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Provider("resumable upload returned no session URI".into()))?
            .to_string();

        tracing::debug!(key = %object.key(), "Resumable session opened");
        Ok(UploadHandle::new(object, object_size, part_size, tier, location))
    }

    async fn put_chunk(&self, handle: &UploadHandle, chunk: &Chunk, data: Bytes) -> Result<ChunkAck> {
        let range = chunk.object_range();
        let len = data.len() as u64;
        let request = self
            .http
            .put(&handle.session_id)
            .header(
                CONTENT_RANGE,
                format!(
                    "bytes {}-{}/{}",
                    range.start,
                    range.end.saturating_sub(1),
                    handle.object_size
                ),
            )
            .body(data);
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        let accepted = match status.as_u16() {
            200 | 201 => true,
            RESUME_INCOMPLETE => persisted_end(&response).is_some_and(|end| end >= range.end),
            s if s >= 500 => {
                // The chunk may have landed before the error; ask the session
                tracing::warn!(status = s, part = chunk.part, "Chunk upload failed, checking session");
                self.persisted_bytes(handle)
                    .await?
                    .is_some_and(|end| end >= range.end)
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, "upload chunk", &body));
            }
        };

        if !accepted {
            return Err(Error::Transient(format!(
                "chunk {} of {} not persisted (HTTP {status})",
                chunk.part,
                handle.object.key()
            )));
        }
        handle.record_part(chunk.part, range.end.to_string());

        Ok(ChunkAck {
            bytes_accepted: len,
            remote_digest: None,
        })
    }

    async fn complete_upload(&self, handle: &UploadHandle, _digest: &str) -> Result<RemoteObjectInfo> {
        // The last chunk finalizes the session; read back what was stored
        let resource = self.object_resource(&handle.object).await?.ok_or_else(|| {
            Error::Provider(format!(
                "{} missing after its final chunk",
                handle.object.key()
            ))
        })?;
        resource.into_info()
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()> {
        let request = if handle.committed().is_some() {
            self.http.delete(self.object_url(&handle.object))
        } else {
            self.http.delete(&handle.session_id)
        };
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(map_request_error)?;

        match response.status().as_u16() {
            200 | 204 | CLIENT_CLOSED_REQUEST | 404 | 410 => Ok(()),
            _ => check(response, "abort upload").await.map(|_| ()),
        }
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<Option<RemoteObjectInfo>> {
        self.object_resource(object)
            .await?
            .map(ObjectResource::into_info)
            .transpose()
    }

    async fn get_chunk(&self, object: &ObjectRef, range: Range<u64>) -> Result<Bytes> {
        let request = self
            .http
            .get(self.object_url(object))
            .query(&[("alt", "media")])
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(RANGE, range_header(&range));
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check(response, "download object").await?;

        response.bytes().await.map_err(map_request_error)
    }
}
