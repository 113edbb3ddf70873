//! Cloud providers and storage tiers

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Cloud object-storage back end hosting a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Amazon S3
    Aws,
    /// Azure Blob Storage
    Azure,
    /// Google Cloud Storage
    Google,
    /// IBM Cloud Object Storage (S3-compatible, custom endpoint)
    Ibm,
    /// S3-compatible on-premise store (MinIO)
    Anthos,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Aws,
        Provider::Azure,
        Provider::Google,
        Provider::Ibm,
        Provider::Anthos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Google => "google",
            Provider::Ibm => "ibm",
            Provider::Anthos => "anthos",
        }
    }

    /// Whether the provider speaks the S3 multipart protocol
    pub fn is_s3_family(&self) -> bool {
        matches!(self, Provider::Aws | Provider::Ibm | Provider::Anthos)
    }

    /// Storage classes a subproject may be created with
    pub fn storage_classes(&self) -> &'static [&'static str] {
        match self {
            Provider::Google => &["REGIONAL", "MULTI_REGIONAL", "NEARLINE", "COLDLINE"],
            Provider::Azure => &["HOT", "COOL", "COLD", "ARCHIVE"],
            Provider::Aws | Provider::Ibm | Provider::Anthos => &["REGIONAL"],
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            "google" | "gcp" | "gcs" => Ok(Provider::Google),
            "ibm" => Ok(Provider::Ibm),
            "anthos" => Ok(Provider::Anthos),
            _ => Err(Error::Config(format!(
                "No known storage provider associated with '{s}'"
            ))),
        }
    }
}

/// Storage tier requested for uploaded objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Cool,
    Cold,
    Archive,
}

impl StorageTier {
    /// Map a provider-native storage class name onto a tier
    pub fn from_native(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "HOT" | "STANDARD" | "REGIONAL" | "MULTI_REGIONAL" => Some(StorageTier::Hot),
            "COOL" | "STANDARD_IA" | "ONEZONE_IA" | "NEARLINE" => Some(StorageTier::Cool),
            "COLD" | "GLACIER_IR" | "GLACIER" | "COLDLINE" => Some(StorageTier::Cold),
            "ARCHIVE" | "DEEP_ARCHIVE" => Some(StorageTier::Archive),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Hot => write!(f, "hot"),
            StorageTier::Cool => write!(f, "cool"),
            StorageTier::Cold => write!(f, "cold"),
            StorageTier::Archive => write!(f, "archive"),
        }
    }
}

impl std::str::FromStr for StorageTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hot" => Ok(StorageTier::Hot),
            "cool" => Ok(StorageTier::Cool),
            "cold" => Ok(StorageTier::Cold),
            "archive" => Ok(StorageTier::Archive),
            _ => Err(format!("Invalid storage tier: {s}")),
        }
    }
}
