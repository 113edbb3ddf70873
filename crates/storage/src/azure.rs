//! Azure Blob Storage adapter
//!
//! The storage token is a container SAS URL; blob URLs are derived from it on
//! every request so a refreshed token takes effect immediately. Objects are
//! block blobs: blocks are staged in any order and committed as one block list.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use reqwest::{RequestBuilder, StatusCode};
use sd_core::checksum::md5_base64;
use sd_core::{
    AccessTokenCache, Chunk, ChunkAck, ChunkPolicy, DigestAlgorithm, Error, MIB, ObjectRef,
    Provider, RemoteObjectInfo, Result, SessionContext, StorageAdapter, StorageTier,
    UploadHandle,
};
use url::Url;

use crate::rest::{build_client, check, map_request_error, range_header};
use crate::settings::StorageSettings;

const DOWNLOAD_CHUNK_SIZE: u64 = 64 * MIB;
const MAX_BLOCK_SIZE: u64 = 4000 * MIB;
const MAX_BLOCKS: u64 = 50_000;

const AZURE_POLICY: ChunkPolicy = ChunkPolicy {
    min_chunk_size: 1,
    max_chunk_size: MAX_BLOCK_SIZE,
    granularity: 1,
    max_chunks_per_object: MAX_BLOCKS,
    max_object_size: MAX_BLOCK_SIZE * MAX_BLOCKS,
    max_upload_concurrency: None,
};

fn access_tier(tier: StorageTier) -> &'static str {
    match tier {
        StorageTier::Hot => "Hot",
        StorageTier::Cool => "Cool",
        StorageTier::Cold => "Cold",
        StorageTier::Archive => "Archive",
    }
}

/// Block ids must have equal length within a blob
pub(crate) fn block_id(part: usize) -> String {
    B64.encode(format!("{part:08}"))
}

pub(crate) fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Blob URL for `key` under a container SAS URL, keeping the SAS query
pub(crate) fn blob_url(sas_url: &str, key: &str) -> Result<Url> {
    let mut url = Url::parse(sas_url)
        .map_err(|e| Error::Auth(format!("storage token is not a SAS URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| Error::Auth("storage token is not a SAS URL".to_string()))?
        .pop_if_empty()
        .extend(key.split('/'));
    Ok(url)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Adapter for Azure block blobs
pub struct AzureAdapter {
    http: reqwest::Client,
    api_version: String,
    tokens: Arc<AccessTokenCache>,
}

impl AzureAdapter {
    pub fn new(settings: &StorageSettings, ctx: &SessionContext) -> Result<Self> {
        Ok(Self {
            http: build_client(settings)?,
            api_version: settings.azure_api_version.clone(),
            tokens: ctx.tokens.clone(),
        })
    }

    async fn url(&self, object: &ObjectRef) -> Result<Url> {
        let token = self.tokens.get().await?;
        blob_url(&token.value, &object.key())
    }

    fn versioned(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("x-ms-version", &self.api_version)
    }

    async fn properties(&self, object: &ObjectRef) -> Result<Option<RemoteObjectInfo>> {
        let url = self.url(object).await?;
        let response = self
            .versioned(self.http.head(url))
            .send()
            .await
            .map_err(map_request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "get blob properties").await?;

        let headers = response.headers();
        let size = header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        Ok(Some(RemoteObjectInfo {
            size,
            digest: header_str(headers, "content-md5").map(str::to_string),
            tier: header_str(headers, "x-ms-access-tier").map(str::to_string),
            part_size: None,
        }))
    }
}

#[async_trait]
impl StorageAdapter for AzureAdapter {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn chunk_policy(&self) -> ChunkPolicy {
        AZURE_POLICY
    }

    fn digest_algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::Md5
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
        // Block blobs need no session; staging the first block creates it
        let key = object.key();
        Ok(UploadHandle::new(object, object_size, part_size, tier, key))
    }

    async fn put_chunk(&self, handle: &UploadHandle, chunk: &Chunk, data: Bytes) -> Result<ChunkAck> {
        let id = block_id(chunk.part);
        let mut url = self.url(&handle.object).await?;
        url.query_pairs_mut()
            .append_pair("comp", "block")
            .append_pair("blockid", &id);

        let len = data.len() as u64;
        let request = self
            .http
            .put(url)
            .header("Content-MD5", md5_base64(&data))
            .body(data);
        let response = self
            .versioned(request)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check(response, "put block").await?;

        handle.record_part(chunk.part, id);
        Ok(ChunkAck {
            bytes_accepted: len,
            remote_digest: header_str(response.headers(), "content-md5").map(str::to_string),
        })
    }

    async fn complete_upload(&self, handle: &UploadHandle, digest: &str) -> Result<RemoteObjectInfo> {
        let ids: Vec<String> = handle.parts().into_iter().map(|(_, id)| id).collect();
        let mut url = self.url(&handle.object).await?;
        url.query_pairs_mut().append_pair("comp", "blocklist");

        let mut request = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/xml")
            .header("x-ms-blob-content-md5", digest)
            .body(block_list_xml(&ids));
        if let Some(tier) = handle.tier {
            request = request.header("x-ms-access-tier", access_tier(tier));
        }
        let response = self
            .versioned(request)
            .send()
            .await
            .map_err(map_request_error)?;
        check(response, "put block list").await?;

        // Content-MD5 is stored as sent; the committed length is what the service measured
        self.properties(&handle.object).await?.ok_or_else(|| {
            Error::Provider(format!("{} missing after commit", handle.object.key()))
        })
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()> {
        // Uncommitted blocks expire on their own; there is no blob to delete yet
        let url = self.url(&handle.object).await?;
        let response = self
            .versioned(self.http.delete(url))
            .send()
            .await
            .map_err(map_request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, "delete blob").await.map(|_| ())
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<Option<RemoteObjectInfo>> {
        self.properties(object).await
    }

    async fn get_chunk(&self, object: &ObjectRef, range: Range<u64>) -> Result<Bytes> {
        let url = self.url(object).await?;
        let request = self.http.get(url).header("x-ms-range", range_header(&range));
        let response = self
            .versioned(request)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check(response, "get blob").await?;

        response.bytes().await.map_err(map_request_error)
    }
}
