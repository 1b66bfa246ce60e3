//! Ingot Ingest - control-file transfer tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ingot_common::logging::{init_logging, LogConfig};
use ingot_ingest::config::{parse_date_bound, IngestConfig};
use ingot_ingest::remote::{FtpRemoteClient, RemoteClient, RetryingRemote};
use ingot_ingest::transfer::{ControlFileTransferJob, TransferMode, TransferState};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ingot-ingest")]
#[command(author, version, about = "Move ready data files between remote staging folders")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Move ready pairs from incoming to processing (older duplicates to skipped)
    Transfer(RunArgs),

    /// Move processed pairs from processing to archived
    Archive(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// List what would move without touching the server
    #[arg(long)]
    dry_run: bool,

    /// Only files stamped at or after this instant (overrides INGOT_DATE_FROM)
    #[arg(long, value_name = "DATE")]
    from: Option<String>,

    /// Only files stamped at or before this instant (overrides INGOT_DATE_TO)
    #[arg(long, value_name = "DATE")]
    to: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig::from_env()?.verbose(cli.verbose);
    let _guard = init_logging(&log_config)?;

    let (mode, args) = match cli.command {
        Command::Transfer(args) => (TransferMode::Intake, args),
        Command::Archive(args) => (TransferMode::Archive, args),
    };

    match execute(mode, &args).await {
        Ok(code) => Ok(ExitCode::from(code)),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            Err(e)
        },
    }
}

async fn execute(mode: TransferMode, args: &RunArgs) -> Result<u8> {
    let mut config = IngestConfig::from_env().context("Failed to load configuration")?;
    if let Some(ref from) = args.from {
        config.date_from = Some(parse_date_bound("--from", from, false)?);
    }
    if let Some(ref to) = args.to {
        config.date_to = Some(parse_date_bound("--to", to, true)?);
    }
    config.validate()?;

    let transfer_config = config.transfer_config()?;
    let remote: Arc<dyn RemoteClient> = Arc::new(
        RetryingRemote::new(FtpRemoteClient::new(config.ftp.clone()), config.retry_policy())
            .with_timeout(config.timeout()),
    );
    let job = ControlFileTransferJob::new(remote, transfer_config);

    info!(
        mode = %mode,
        host = %config.ftp.address(),
        subdir = %config.subdir,
        "Starting {}",
        mode
    );

    if args.dry_run {
        let plan = job.plan(mode).await.context("Failed to list source folder")?;
        for planned in &plan {
            let destination = match planned.state {
                TransferState::Pending => "unpaired, would fail",
                _ => planned.to_dir.as_str(),
            };
            info!(ok_file = %planned.ok_path(), state = ?planned.state, destination, "Would move");
        }
        info!(planned = plan.len(), "Dry run complete, nothing moved");
        return Ok(0);
    }

    let stats = job.run(mode).await;
    Ok(stats.exit_code())
}
