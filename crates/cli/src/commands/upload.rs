//! upload command - Copy a local file into a dataset
//!
//! The file is split into chunks, uploaded into one or more remote objects and
//! verified against the provider's digest. The printed file metadata is what
//! the metadata service stores for the dataset.

use std::path::PathBuf;

use clap::Args;
use sd_core::{FileMetadata, StorageTier};
use serde::Serialize;

use super::{StorageArgs, TransferSummary, report_failure};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Upload a local file into a dataset
#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Local file to upload
    pub source: PathBuf,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Chunk size in MiB
    #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: u64,

    /// Storage tier of the uploaded objects (hot, cool, cold, archive)
    #[arg(long)]
    pub tier: Option<StorageTier>,
}

#[derive(Debug, Serialize)]
struct UploadOutput {
    #[serde(flatten)]
    summary: TransferSummary,
    filemetadata: FileMetadata,
}

/// Execute the upload command
pub async fn execute(args: UploadArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config.clone());

    let dataset = match args.storage.dataset() {
        Ok(d) => d,
        Err(e) => {
            formatter.error(&e.to_string());
            return ExitCode::UsageError;
        }
    };

    let options = args
        .storage
        .options(&output_config)
        .with_chunk_size_mib(args.chunk_size)
        .with_tier(args.tier);
    let orchestrator = args.storage.orchestrator();

    match orchestrator.upload(&dataset, &args.source, &options).await {
        Ok(result) => {
            let filemetadata = FileMetadata::from_result(&result);
            let summary =
                TransferSummary::new(args.storage.provider, &dataset, &args.source, result);

            if formatter.is_json() {
                formatter.json(&UploadOutput {
                    summary,
                    filemetadata,
                });
            } else {
                formatter.success(&format!(
                    "Uploaded {} to {}",
                    formatter.style_name(&summary.local_path),
                    formatter.style_name(&summary.dataset)
                ));
                summary.print_fields(&formatter);
            }
            ExitCode::Success
        }
        Err(e) => report_failure(&formatter, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: UploadArgs,
    }

    #[test]
    fn test_parse_upload_args() {
        let cli = TestCli::parse_from([
            "sdutil",
            "data.segy",
            "--provider",
            "azure",
            "--location",
            "container/dataset",
            "--tenant",
            "t",
            "--subproject",
            "s",
            "--access-token",
            "https://acct.blob.core.windows.net/container?sig=x",
            "--tier",
            "cool",
        ]);

        assert_eq!(cli.args.chunk_size, 32);
        assert_eq!(cli.args.tier, Some(StorageTier::Cool));
        assert_eq!(cli.args.storage.provider, sd_core::Provider::Azure);
        assert_eq!(cli.args.storage.concurrency, 4);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let parsed = TestCli::try_parse_from([
            "sdutil",
            "data.segy",
            "--provider",
            "google",
            "--location",
            "b/p",
            "--tenant",
            "t",
            "--subproject",
            "s",
            "--access-token",
            "tok",
            "--tier",
            "frozen",
        ]);
        assert!(parsed.is_err());

        let zero_chunk = TestCli::try_parse_from([
            "sdutil",
            "data.segy",
            "--provider",
            "google",
            "--location",
            "b/p",
            "--tenant",
            "t",
            "--subproject",
            "s",
            "--access-token",
            "tok",
            "--chunk-size",
            "0",
        ]);
        assert!(zero_chunk.is_err());
    }

    #[tokio::test]
    async fn test_empty_source_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();

        let cli = TestCli::parse_from([
            "sdutil",
            source.to_str().unwrap(),
            "--provider",
            "google",
            "--location",
            "bucket/prefix",
            "--tenant",
            "t",
            "--subproject",
            "s",
            "--access-token",
            "tok",
        ]);
        let output = OutputConfig {
            quiet: true,
            ..Default::default()
        };

        assert_eq!(execute(cli.args, output).await, ExitCode::UsageError);
    }
}
