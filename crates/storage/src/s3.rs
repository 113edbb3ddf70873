//! S3-family adapter (AWS, IBM Cloud Object Storage, MinIO)
//!
//! Every object is written as a multipart upload, so the committed ETag is
//! always the multipart form `hex(md5(part md5s))-N`. The part size is stored
//! as object metadata so downloads can reproduce the part boundaries.

use std::ops::Range;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::identity::IdentityCache;
use aws_config::retry::RetryConfig;
use aws_credential_types::Credentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{ProvideCredentials, future};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use bytes::Bytes;
use sd_core::checksum::md5_base64;
use sd_core::{
    AccessTokenCache, Chunk, ChunkAck, ChunkPolicy, DigestAlgorithm, Error, GIB, MIB, ObjectRef,
    Provider, RemoteObjectInfo, Result, SessionContext, StorageAdapter, StorageTier, TIB,
    UploadHandle,
};
use tokio::sync::OnceCell;

use crate::rest::range_header;
use crate::settings::{S3Endpoint, StorageSettings};

/// Object metadata key holding the part size used at upload
pub const PART_SIZE_METADATA: &str = "sd-part-size";

const DOWNLOAD_CHUNK_SIZE: u64 = 20 * MIB;

const S3_POLICY: ChunkPolicy = ChunkPolicy {
    min_chunk_size: 5 * MIB,
    max_chunk_size: 5 * GIB,
    granularity: 1,
    max_chunks_per_object: 10_000,
    max_object_size: 5 * TIB,
    max_upload_concurrency: None,
};

/// Split an `access_key:secret[:session_token]` storage token
pub(crate) fn parse_credentials(token: &str, expires_at: Option<SystemTime>) -> Result<Credentials> {
    let mut fields = token.splitn(3, ':');
    let access_key = fields.next().unwrap_or_default();
    let secret = fields.next().unwrap_or_default();
    let session = fields.next().filter(|s| !s.is_empty());

    if access_key.is_empty() || secret.is_empty() {
        return Err(Error::Auth(
            "S3 storage token must be access_key:secret[:session_token]".to_string(),
        ));
    }

    Ok(Credentials::new(
        access_key,
        secret,
        session.map(str::to_string),
        expires_at,
        "sd-storage-token",
    ))
}

/// SDK credential provider backed by the session token cache
#[derive(Debug)]
struct TokenCredentials {
    tokens: Arc<AccessTokenCache>,
}

impl ProvideCredentials for TokenCredentials {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(async move {
            let token = self
                .tokens
                .get()
                .await
                .map_err(CredentialsError::provider_error)?;
            parse_credentials(&token.value, Some(SystemTime::from(token.expires_at)))
                .map_err(CredentialsError::provider_error)
        })
    }
}

fn storage_class(tier: StorageTier) -> StorageClass {
    match tier {
        StorageTier::Hot => StorageClass::Standard,
        StorageTier::Cool => StorageClass::StandardIa,
        StorageTier::Cold => StorageClass::GlacierIr,
        StorageTier::Archive => StorageClass::DeepArchive,
    }
}

/// Format AWS SDK error into a detailed error message
fn format_sdk_error<E: ProvideErrorMetadata + std::fmt::Display>(error: &SdkError<E>) -> String {
    match error {
        SdkError::ServiceError(service_err) => {
            let err = service_err.err();
            let mut msg = format!("Service error: {err}");
            if let Some(code) = err.code() {
                msg.push_str(&format!(" (code: {code})"));
            }
            if let Some(request_id) = service_err.raw().headers().get("x-amz-request-id") {
                msg.push_str(&format!(" (request id: {request_id})"));
            }
            msg
        }
        SdkError::ConstructionFailure(err) => format!("Request construction failed: {err:?}"),
        SdkError::TimeoutError(_) => "Request timeout".to_string(),
        SdkError::DispatchFailure(err) => format!("Network dispatch error: {err:?}"),
        SdkError::ResponseError(err) => format!("Response error: {err:?}"),
        _ => error.to_string(),
    }
}

/// Map an SDK failure onto the error taxonomy
pub(crate) fn classify_sdk_error<E>(context: &str, error: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    // Credential provider failures arrive wrapped somewhere in the source chain
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&error);
    while let Some(err) = source {
        if let Some(inner) = err.downcast_ref::<Error>() {
            return if inner.is_transient() {
                Error::Transient(format!("{context}: {inner}"))
            } else {
                Error::Auth(format!("{context}: {inner}"))
            };
        }
        source = err.source();
    }

    let detail = format!("{context}: {}", format_sdk_error(&error));
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::Transient(detail)
        }
        SdkError::ServiceError(_) => {
            let status = error.raw_response().map(|r| r.status().as_u16());
            match status {
                Some(401 | 403) => Error::Auth(detail),
                Some(404) => Error::NotFound(detail),
                Some(408 | 429) => Error::Transient(detail),
                Some(s) if s >= 500 => Error::Transient(detail),
                _ if error.code() == Some("ExpiredToken") => Error::Auth(detail),
                _ => Error::Provider(detail),
            }
        }
        _ => Error::Provider(detail),
    }
}

/// Adapter for providers speaking the S3 multipart protocol
pub struct S3Adapter {
    provider: Provider,
    endpoint: S3Endpoint,
    tokens: Arc<AccessTokenCache>,
    client: OnceCell<Client>,
}

impl S3Adapter {
    pub fn new(settings: &StorageSettings, ctx: &SessionContext) -> Result<Self> {
        Ok(Self {
            provider: ctx.provider,
            endpoint: settings.s3_endpoint(ctx.provider)?,
            tokens: ctx.tokens.clone(),
            client: OnceCell::new(),
        })
    }

    /// The SDK client, built on first use
    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let credentials = TokenCredentials {
                    tokens: self.tokens.clone(),
                };

                // Retries and token caching are handled by the transfer engine
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .identity_cache(IdentityCache::no_cache())
                    .retry_config(RetryConfig::disabled())
                    .region(aws_config::Region::new(self.endpoint.region.clone()));
                if let Some(url) = &self.endpoint.url {
                    loader = loader.endpoint_url(url);
                }
                let config = loader.load().await;

                let s3_config = aws_sdk_s3::config::Builder::from(&config)
                    .force_path_style(self.endpoint.force_path_style)
                    .build();

                Client::from_conf(s3_config)
            })
            .await
    }
}

#[async_trait]
impl StorageAdapter for S3Adapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn chunk_policy(&self) -> ChunkPolicy {
        S3_POLICY
    }

    fn digest_algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::MultipartEtag
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
        let mut request = self
            .client()
            .await
            .create_multipart_upload()
            .bucket(&object.locator.bucket)
            .key(object.key())
            .metadata(PART_SIZE_METADATA, part_size.to_string());
        if let Some(tier) = tier {
            request = request.storage_class(storage_class(tier));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_sdk_error("create multipart upload", e))?;
        let upload_id = response
            .upload_id()
            .ok_or_else(|| Error::Provider("create multipart upload returned no upload id".into()))?;

        tracing::debug!(key = %object.key(), upload_id, "Multipart upload created");
        Ok(UploadHandle::new(object, object_size, part_size, tier, upload_id))
    }

    async fn put_chunk(&self, handle: &UploadHandle, chunk: &Chunk, data: Bytes) -> Result<ChunkAck> {
        let bytes_accepted = data.len() as u64;
        let response = self
            .client()
            .await
            .upload_part()
            .bucket(&handle.object.locator.bucket)
            .key(handle.object.key())
            .upload_id(&handle.session_id)
            .part_number(chunk.part as i32 + 1)
            .content_md5(md5_base64(&data))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_sdk_error("upload part", e))?;

        let etag = response
            .e_tag()
            .map(|s| s.trim_matches('"').to_string())
            .ok_or_else(|| Error::Provider(format!("part {} returned no ETag", chunk.part)))?;
        handle.record_part(chunk.part, etag.clone());

        Ok(ChunkAck {
            bytes_accepted,
            remote_digest: Some(etag),
        })
    }

    async fn complete_upload(&self, handle: &UploadHandle, _digest: &str) -> Result<RemoteObjectInfo> {
        let parts = handle
            .parts()
            .into_iter()
            .map(|(part, etag)| {
                CompletedPart::builder()
                    .part_number(part as i32 + 1)
                    .e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let response = self
            .client()
            .await
            .complete_multipart_upload()
            .bucket(&handle.object.locator.bucket)
            .key(handle.object.key())
            .upload_id(&handle.session_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete multipart upload", e))?;

        Ok(RemoteObjectInfo {
            size: handle.object_size,
            digest: response.e_tag().map(|s| s.trim_matches('"').to_string()),
            tier: handle
                .tier
                .map(|tier| storage_class(tier).as_str().to_string()),
            part_size: Some(handle.part_size),
        })
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()> {
        let client = self.client().await;
        let bucket = &handle.object.locator.bucket;
        let key = handle.object.key();

        let result = if handle.committed().is_some() {
            client
                .delete_object()
                .bucket(bucket)
                .key(&key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("delete object", e))
        } else {
            client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(&key)
                .upload_id(&handle.session_id)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("abort multipart upload", e))
        };

        match result {
            Err(Error::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<Option<RemoteObjectInfo>> {
        let response = match self
            .client()
            .await
            .head_object()
            .bucket(&object.locator.bucket)
            .key(object.key())
            .send()
            .await
            .map_err(|e| classify_sdk_error("head object", e))
        {
            Ok(response) => response,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let part_size = response
            .metadata()
            .and_then(|m| m.get(PART_SIZE_METADATA))
            .and_then(|v| v.parse().ok());
        // S3 omits the header for STANDARD objects
        let tier = response
            .storage_class()
            .map(|sc| sc.as_str().to_string())
            .or_else(|| Some(StorageClass::Standard.as_str().to_string()));

        Ok(Some(RemoteObjectInfo {
            size: response.content_length().unwrap_or_default().max(0) as u64,
            digest: response.e_tag().map(|s| s.trim_matches('"').to_string()),
            tier,
            part_size,
        }))
    }

    async fn get_chunk(&self, object: &ObjectRef, range: Range<u64>) -> Result<Bytes> {
        let response = self
            .client()
            .await
            .get_object()
            .bucket(&object.locator.bucket)
            .key(object.key())
            .range(range_header(&range))
            .send()
            .await
            .map_err(|e| classify_sdk_error("get object", e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Transient(format!("get object body: {e}")))?
            .into_bytes();

        Ok(data)
    }
}
