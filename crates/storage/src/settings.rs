//! Provider endpoint settings
//!
//! Everything an adapter needs besides the per-session token: regions, custom
//! endpoints for S3-compatible stores and HTTP timeouts.

use std::time::Duration;

use sd_core::{Error, Provider, Result};
use serde::Deserialize;

const DEFAULT_AWS_REGION: &str = "us-east-1";
const DEFAULT_GCS_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_AZURE_API_VERSION: &str = "2021-08-06";

/// Endpoint configuration shared by all adapters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub aws_region: String,
    /// IBM Cloud Object Storage endpoint (`COS_URL`)
    pub ibm_endpoint: Option<String>,
    pub ibm_region: Option<String>,
    /// MinIO endpoint for on-premise deployments (`MINIO_ENDPOINT`)
    pub minio_endpoint: Option<String>,
    pub gcs_endpoint: String,
    pub azure_api_version: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            aws_region: DEFAULT_AWS_REGION.to_string(),
            ibm_endpoint: None,
            ibm_region: None,
            minio_endpoint: None,
            gcs_endpoint: DEFAULT_GCS_ENDPOINT.to_string(),
            azure_api_version: DEFAULT_AZURE_API_VERSION.to_string(),
            connect_timeout_secs: 30,
            request_timeout_secs: 600,
        }
    }
}

impl StorageSettings {
    /// Read settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            aws_region: get("AWS_REGION")
                .or_else(|| get("AWS_DEFAULT_REGION"))
                .unwrap_or(defaults.aws_region),
            ibm_endpoint: get("COS_URL"),
            ibm_region: get("COS_REGION"),
            minio_endpoint: get("MINIO_ENDPOINT"),
            gcs_endpoint: get("SDUTIL_GCS_ENDPOINT").unwrap_or(defaults.gcs_endpoint),
            azure_api_version: get("SDUTIL_AZURE_API_VERSION")
                .unwrap_or(defaults.azure_api_version),
            connect_timeout_secs: get("SDUTIL_CONNECT_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_secs),
            request_timeout_secs: get("SDUTIL_REQUEST_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_timeout_secs),
        }
    }

    pub fn with_gcs_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.gcs_endpoint = endpoint.into();
        self
    }

    pub fn with_ibm(mut self, endpoint: impl Into<String>, region: Option<String>) -> Self {
        self.ibm_endpoint = Some(endpoint.into());
        self.ibm_region = region;
        self
    }

    pub fn with_minio_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.minio_endpoint = Some(endpoint.into());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Endpoint, region and addressing style for an S3-family provider
    pub fn s3_endpoint(&self, provider: Provider) -> Result<S3Endpoint> {
        match provider {
            Provider::Aws => Ok(S3Endpoint {
                url: None,
                region: self.aws_region.clone(),
                force_path_style: false,
            }),
            Provider::Ibm => {
                let url = self.ibm_endpoint.clone().ok_or_else(|| {
                    Error::Config("COS_URL must be set for IBM storage".to_string())
                })?;
                Ok(S3Endpoint {
                    url: Some(url),
                    region: self
                        .ibm_region
                        .clone()
                        .unwrap_or_else(|| self.aws_region.clone()),
                    force_path_style: true,
                })
            }
            Provider::Anthos => {
                let url = self.minio_endpoint.clone().ok_or_else(|| {
                    Error::Config("MINIO_ENDPOINT must be set for anthos storage".to_string())
                })?;
                Ok(S3Endpoint {
                    url: Some(url),
                    region: self.aws_region.clone(),
                    force_path_style: true,
                })
            }
            Provider::Azure | Provider::Google => Err(Error::Config(format!(
                "{provider} does not use the S3 protocol"
            ))),
        }
    }
}

/// Where an S3-family client connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Endpoint {
    /// Custom endpoint; `None` uses the AWS default for the region
    pub url: Option<String>,
    pub region: String,
    pub force_path_style: bool,
}
