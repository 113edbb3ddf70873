//! Provider to adapter dispatch

use std::sync::Arc;

use sd_core::{Provider, Result, SessionContext, StorageAdapter, StorageConnector};

use crate::azure::AzureAdapter;
use crate::gcs::GcsAdapter;
use crate::s3::S3Adapter;
use crate::settings::StorageSettings;

/// Connector that builds the adapter matching the session's provider
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    settings: StorageSettings,
}

impl AdapterRegistry {
    pub fn new(settings: StorageSettings) -> Self {
        Self { settings }
    }

    /// Registry configured from the process environment
    pub fn from_env() -> Self {
        Self::new(StorageSettings::from_env())
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Whether a session for `provider` can be opened with these settings
    pub fn supports(&self, provider: Provider) -> bool {
        !provider.is_s3_family() || self.settings.s3_endpoint(provider).is_ok()
    }
}

impl StorageConnector for AdapterRegistry {
    fn connect(&self, ctx: &SessionContext) -> Result<Arc<dyn StorageAdapter>> {
        tracing::debug!(provider = %ctx.provider, direction = %ctx.direction, "Connecting storage adapter");

        let adapter: Arc<dyn StorageAdapter> = match ctx.provider {
            Provider::Aws | Provider::Ibm | Provider::Anthos => {
                Arc::new(S3Adapter::new(&self.settings, ctx)?)
            }
            Provider::Azure => Arc::new(AzureAdapter::new(&self.settings, ctx)?),
            Provider::Google => Arc::new(GcsAdapter::new(&self.settings, ctx)?),
        };
        Ok(adapter)
    }
}
