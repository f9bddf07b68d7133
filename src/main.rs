mod cli;
mod error;

use crate::cli::{Cli, Command};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use cumulus_backup::state::RUN_LOG;
use cumulus_backup::{Backup, RunLog, RunOptions, Verifier};
use cumulus_codec::BlockCodec;
use cumulus_config::Config;
use cumulus_storage::backend::Registry;
use exn::ResultExt;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status when some backup roots failed and were rolled back.
const PARTIAL: u8 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = cumulus_config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let service = Registry::default()
        .open(&config.service.backend, &config.service.options)
        .or_raise(|| ErrorKind::Storage)?;
    tracing::info!(backend = service.name(), remote_path = %config.service.remote_path, "Storage opened");

    let mut log = RunLog::new();
    match cli.command {
        Command::Backup { force, skip_prebackup } => {
            let result = Backup::new(&config, service).run(RunOptions { force, skip_prebackup }, &mut log).await;
            save_transcript(&config, &log).await;
            let report = result.or_raise(|| ErrorKind::Backup)?;
            println!(
                "Backup {} complete: {} parts, {} bytes uploaded, {} incrementals kept.",
                report.backup_id, report.parts_sent, report.bytes_sent, report.incrementals
            );
            if report.limit_reached {
                println!("Warning: the upload data limit was reached, so this backup is incomplete.");
            }
            if report.roots_failed > 0 {
                println!("Warning: {} backup paths failed and were rolled back.", report.roots_failed);
                return Ok(ExitCode::from(PARTIAL));
            }
        },
        Command::Verify => {
            let codec = BlockCodec::new(
                config.keys().or_raise(|| ErrorKind::Config)?,
                config.geometry().or_raise(|| ErrorKind::Config)?,
            );
            let scratch = config.state_file("scratch");
            tokio::fs::create_dir_all(&scratch).await.or_raise(|| ErrorKind::Verify)?;
            let verifier = Verifier::open(service, &config.service.remote_path, codec, scratch)
                .await
                .or_raise(|| ErrorKind::Verify)?;
            let report = verifier.run(&mut log).await.or_raise(|| ErrorKind::Verify)?;
            for line in log.lines() {
                println!("{line}");
            }
            println!("Verified {} of {} snapshots.", report.snapshots.len(), report.incrementals);
        },
    }
    Ok(ExitCode::SUCCESS)
}

/// Keep the transcript of the last run next to the catalog.
async fn save_transcript(config: &Config, log: &RunLog) {
    let path = config.state_file(RUN_LOG);
    if let Err(err) = log.write_to(&path).await {
        tracing::warn!(path = %path.display(), "Unable to save run transcript: {err}");
    }
    for notification in &config.notifications {
        let lines = log.filtered(notification.filter.as_deref()).count();
        tracing::debug!(recipients = ?notification.recipients, lines, "Transcript ready for notification");
    }
}
