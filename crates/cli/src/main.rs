//! sdutil - seismic dataset transfer client
//!
//! Moves datasets between local files and cloud object storage (AWS S3,
//! Azure Blob, Google Cloud Storage, IBM COS, MinIO).

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_code;
mod output;
mod progress;

use commands::Commands;
use exit_code::ExitCode;
use output::OutputConfig;

#[derive(Parser, Debug)]
#[command(name = "sdutil", version, about, long_about = None)]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let output_config = OutputConfig {
        json: cli.json,
        quiet: cli.quiet,
        no_color: cli.no_color,
    };

    let code: ExitCode = commands::execute(cli.command, output_config).await;
    std::process::exit(code.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "sdutil",
            "download",
            "out.bin",
            "--provider",
            "gcs",
            "--location",
            "bucket/prefix",
            "--tenant",
            "t",
            "--subproject",
            "s",
            "--access-token",
            "tok",
            "--json",
            "--objects",
            "3",
        ]);
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Download(ref args) if args.objects == Some(3)
        ));
    }
}
