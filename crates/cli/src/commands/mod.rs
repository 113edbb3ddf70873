//! Command definitions and shared transfer plumbing

use std::path::Path;
use std::sync::Arc;

use clap::{Args, Subcommand};
use sd_core::{
    DatasetRef, Error, Locator, Provider, RetryBuilder, StaticCredentials, TransferError,
    TransferOptions, TransferOrchestrator, TransferResult,
};
use sd_storage::AdapterRegistry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};
use crate::progress::BarProgress;

pub mod download;
pub mod upload;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a local file into a dataset
    Upload(upload::UploadArgs),

    /// Download a dataset into a local file
    Download(download::DownloadArgs),
}

/// Execute a command
pub async fn execute(command: Commands, output_config: OutputConfig) -> ExitCode {
    match command {
        Commands::Upload(args) => upload::execute(args, output_config).await,
        Commands::Download(args) => download::execute(args, output_config).await,
    }
}

/// Where a dataset lives and how to reach it
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Cloud provider hosting the dataset (aws, azure, google, ibm, anthos)
    #[arg(long, env = "SDUTIL_PROVIDER")]
    pub provider: Provider,

    /// Dataset location as registered (bucket/prefix, or bucket$$prefix on aws)
    #[arg(long)]
    pub location: String,

    /// Tenant owning the dataset
    #[arg(long, env = "SDUTIL_TENANT")]
    pub tenant: String,

    /// Subproject owning the dataset
    #[arg(long)]
    pub subproject: String,

    /// Storage access token (SAS URL, OAuth token or access_key:secret[:session_token])
    #[arg(long, env = "SDUTIL_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,

    /// Number of chunks transferred in parallel
    #[arg(short = 'P', long, default_value_t = sd_core::transfer::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Attempts per chunk before giving up
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,
}

impl StorageArgs {
    pub fn dataset(&self) -> Result<DatasetRef, Error> {
        let locator = Locator::parse(self.provider, &self.location)?;
        Ok(DatasetRef::new(&self.tenant, &self.subproject, locator))
    }

    pub fn orchestrator(&self) -> TransferOrchestrator {
        TransferOrchestrator::new(
            self.provider,
            Arc::new(AdapterRegistry::from_env()),
            Arc::new(StaticCredentials::new(&self.access_token)),
        )
        .with_retry(RetryBuilder::new().max_attempts(self.max_attempts).build())
    }

    /// Transfer options with progress and Ctrl-C wiring
    pub fn options(&self, output_config: &OutputConfig) -> TransferOptions {
        let mut options = TransferOptions::new()
            .with_max_concurrency(self.concurrency)
            .with_cancel(cancel_on_ctrl_c());
        if output_config.show_progress() {
            options = options.with_progress(Arc::new(BarProgress::new()));
        }
        options
    }
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling transfer");
            cancel.cancel();
        }
    });
    token
}

/// JSON and human summary of a finished transfer
#[derive(Debug, Serialize)]
pub struct TransferSummary {
    pub provider: Provider,
    pub dataset: String,
    pub local_path: String,
    pub size_bytes: u64,
    pub size_human: String,
    #[serde(flatten)]
    pub result: TransferResult,
}

impl TransferSummary {
    pub fn new(provider: Provider, dataset: &DatasetRef, local_path: &Path, result: TransferResult) -> Self {
        Self {
            provider,
            dataset: dataset.locator.encode(provider),
            local_path: local_path.display().to_string(),
            size_bytes: result.size,
            size_human: humansize::format_size(result.size, humansize::BINARY),
            result,
        }
    }

    pub fn print_fields(&self, formatter: &Formatter) {
        formatter.field("Dataset", &formatter.style_name(&self.dataset));
        formatter.field("Local", &formatter.style_name(&self.local_path));
        formatter.field("Size", &formatter.style_size(&self.size_human));
        formatter.field("Objects", &self.result.object_count.to_string());
        formatter.field("Checksum", &self.result.checksum);
        if let Some(tier) = self.result.storage_tier {
            formatter.field("Tier", &tier.to_string());
        }
    }
}

#[derive(Debug, Serialize)]
struct FailureOutput<'a> {
    error: String,
    kind: &'static str,
    provider: Provider,
    direction: sd_core::Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    object_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    cleanup: &'a [String],
}

/// Print a transfer failure and pick the exit code
pub fn report_failure(formatter: &Formatter, error: &TransferError) -> ExitCode {
    let cleanup: Vec<String> = error.cleanup.iter().map(ToString::to_string).collect();
    let output = FailureOutput {
        error: error.kind().to_string(),
        kind: error.kind().kind_name(),
        provider: error.provider,
        direction: error.direction,
        object_index: error.object_index,
        chunk_index: error.chunk_index,
        cleanup: &cleanup,
    };

    formatter.error_json(&output, &error.to_string());
    for failure in &cleanup {
        formatter.warning(&format!("Remote cleanup incomplete: {failure}"));
    }

    ExitCode::from_error(error.kind())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_core::Direction;

    fn args(provider: Provider, location: &str) -> StorageArgs {
        StorageArgs {
            provider,
            location: location.to_string(),
            tenant: "opendes".to_string(),
            subproject: "seismic".to_string(),
            access_token: "token".to_string(),
            concurrency: 4,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_dataset_from_location() {
        let dataset = args(Provider::Aws, "bucket$$data/set").dataset().unwrap();
        assert_eq!(dataset.locator.bucket, "bucket");
        assert_eq!(dataset.locator.prefix, "data/set");
        assert_eq!(dataset.tenant, "opendes");

        let dataset = args(Provider::Google, "bucket/abc").dataset().unwrap();
        assert_eq!(dataset.locator.prefix, "abc");
    }

    #[test]
    fn test_invalid_location() {
        assert!(args(Provider::Google, "").dataset().is_err());
    }

    #[test]
    fn test_report_failure_exit_code() {
        let formatter = Formatter::new(OutputConfig {
            quiet: true,
            ..Default::default()
        });
        let error = TransferError::new(
            Provider::Azure,
            Direction::Upload,
            Error::Auth("expired".to_string()),
        );
        assert_eq!(report_failure(&formatter, &error), ExitCode::AuthError);
    }

    #[test]
    fn test_summary_serialization() {
        let dataset = args(Provider::Aws, "bucket$$prefix").dataset().unwrap();
        let result = TransferResult {
            object_count: 2,
            size: 2048,
            checksum: "abc-2".to_string(),
            object_digests: vec!["a-1".to_string(), "b-1".to_string()],
            storage_tier: None,
        };
        let summary = TransferSummary::new(Provider::Aws, &dataset, Path::new("/tmp/x"), result);
        let json = serde_json::to_value(&summary).unwrap();

        assert_eq!(json["dataset"], "bucket$$prefix");
        assert_eq!(json["size_human"], "2 KiB");
        assert_eq!(json["object_count"], 2);
        assert!(json.get("storage_tier").is_none());
    }
}
