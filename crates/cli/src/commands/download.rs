//! download command - Copy a dataset into a local file
//!
//! With `--record` the dataset record exported from the metadata service is
//! used: its object count bounds the download and its seismic metadata is
//! written next to the file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use sd_core::{DatasetRecord, download_dataset};

use super::{StorageArgs, TransferSummary, report_failure};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Download a dataset into a local file
#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Local file to write
    pub target: PathBuf,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Chunk size in MiB (defaults to the provider's download chunk size)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: Option<u64>,

    /// Number of objects in the dataset, if known
    #[arg(long)]
    pub objects: Option<usize>,

    /// Dataset record (JSON) as returned by the metadata service
    #[arg(long, conflicts_with = "objects")]
    pub record: Option<PathBuf>,
}

async fn read_record(path: &Path) -> anyhow::Result<DatasetRecord> {
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read dataset record {}", path.display()))?;
    serde_json::from_slice(&body)
        .with_context(|| format!("Invalid dataset record {}", path.display()))
}

/// Execute the download command
pub async fn execute(args: DownloadArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config.clone());

    let dataset = match args.storage.dataset() {
        Ok(d) => d,
        Err(e) => {
            formatter.error(&e.to_string());
            return ExitCode::UsageError;
        }
    };

    let mut options = args
        .storage
        .options(&output_config)
        .with_expected_objects(args.objects);
    if let Some(mib) = args.chunk_size {
        options = options.with_chunk_size_mib(mib);
    }
    let orchestrator = args.storage.orchestrator();

    let outcome = match &args.record {
        Some(path) => {
            let record = match read_record(path).await {
                Ok(r) => r,
                Err(e) => {
                    formatter.error(&format!("{e:#}"));
                    return ExitCode::UsageError;
                }
            };
            download_dataset(&orchestrator, &record, &dataset, &args.target, &options).await
        }
        None => orchestrator.download(&dataset, &args.target, &options).await,
    };

    match outcome {
        Ok(result) => {
            let summary =
                TransferSummary::new(args.storage.provider, &dataset, &args.target, result);
            if formatter.is_json() {
                formatter.json(&summary);
            } else {
                formatter.success(&format!(
                    "Downloaded {} to {}",
                    formatter.style_name(&summary.dataset),
                    formatter.style_name(&summary.local_path)
                ));
                summary.print_fields(&formatter);
            }
            ExitCode::Success
        }
        Err(e) => report_failure(&formatter, &e),
    }
}
