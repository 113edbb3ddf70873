//! Dataset locators
//!
//! The metadata service hands out a provider-specific location string for each
//! dataset. It is normalized here into a `(bucket, prefix)` pair; the dataset's
//! objects live at `<prefix>/0`, `<prefix>/1`, ...

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::Provider;

/// Separator AWS uses between bucket and prefix in the location string
const AWS_SEPARATOR: &str = "$$";

/// Normalized (bucket/container, object-key prefix) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub bucket: String,
    pub prefix: String,
}

impl Locator {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Parse a provider-encoded location string
    ///
    /// AWS uses `bucket$$prefix`; every other provider uses `bucket/prefix`.
    pub fn parse(provider: Provider, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let split = match provider {
            Provider::Aws => raw.split_once(AWS_SEPARATOR),
            _ => raw.split_once('/'),
        };

        let (bucket, prefix) =
            split.ok_or_else(|| Error::InvalidLocator(format!("'{raw}' has no object prefix")))?;

        if bucket.is_empty() {
            return Err(Error::InvalidLocator(format!("'{raw}' has no bucket")));
        }
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return Err(Error::InvalidLocator(format!("'{raw}' has no object prefix")));
        }

        Ok(Self::new(bucket, prefix))
    }

    /// Key of the object holding part `object_index` of the dataset
    pub fn object_key(&self, object_index: usize) -> String {
        format!("{}/{object_index}", self.prefix)
    }

    /// Provider encoding of this locator, inverse of [`Locator::parse`]
    pub fn encode(&self, provider: Provider) -> String {
        match provider {
            Provider::Aws => format!("{}{AWS_SEPARATOR}{}", self.bucket, self.prefix),
            _ => format!("{}/{}", self.bucket, self.prefix),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.prefix)
    }
}

/// A dataset as seen by the transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub tenant: String,
    pub subproject: String,
    pub locator: Locator,
}

impl DatasetRef {
    pub fn new(tenant: impl Into<String>, subproject: impl Into<String>, locator: Locator) -> Self {
        Self {
            tenant: tenant.into(),
            subproject: subproject.into(),
            locator,
        }
    }
}

/// One remote object of a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub locator: Locator,
    pub index: usize,
}

impl ObjectRef {
    pub fn new(locator: Locator, index: usize) -> Self {
        Self { locator, index }
    }

    pub fn key(&self) -> String {
        self.locator.object_key(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aws_locator() {
        let loc = Locator::parse(Provider::Aws, "my-bucket$$tenant/subproject/ds").unwrap();
        assert_eq!(loc.bucket, "my-bucket");
        assert_eq!(loc.prefix, "tenant/subproject/ds");
        assert_eq!(loc.object_key(2), "tenant/subproject/ds/2");
    }

    #[test]
    fn test_parse_slash_locator() {
        let loc = Locator::parse(Provider::Google, "bucket-a/ab12cd/").unwrap();
        assert_eq!(loc.bucket, "bucket-a");
        assert_eq!(loc.prefix, "ab12cd");
        assert_eq!(loc.object_key(0), "ab12cd/0");
    }

    #[test]
    fn test_parse_locator_errors() {
        assert!(Locator::parse(Provider::Azure, "container").is_err());
        assert!(Locator::parse(Provider::Azure, "/prefix").is_err());
        assert!(Locator::parse(Provider::Azure, "container/").is_err());
        // AWS requires its own separator
        assert!(Locator::parse(Provider::Aws, "bucket/prefix").is_err());
    }

    #[test]
    fn test_encode_inverse_of_parse() {
        for provider in Provider::ALL {
            let loc = Locator::new("b", "p/q");
            let encoded = loc.encode(provider);
            assert_eq!(Locator::parse(provider, &encoded).unwrap(), loc);
        }
    }
}
