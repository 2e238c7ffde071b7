use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Args;
use serde::Serialize;

use crate::args::BaseArgs;
use crate::auth::{CredentialManager, CredentialStore};
use crate::config::Settings;
use crate::http::{HttpPlatform, PlatformApi};
use crate::jobs::{scan_pending, PendingJob};
use crate::pipeline::{Pipeline, RunSummary, StopReason};
use crate::ui::{offer_to_open, print_command_status, CommandStatus, Progress};
use crate::utils::{format_usize_commas, pluralize};

#[derive(Debug, Clone, Args)]
pub struct UploadArgs {
    /// Directory holding `*.meta` job descriptors and their payload files
    #[arg(value_name = "PENDING_DIR")]
    pub pending_dir: PathBuf,

    /// Platform application client id (or via FITMIGRATE_CLIENT_ID)
    #[arg(value_name = "CLIENT_ID", env = "FITMIGRATE_CLIENT_ID")]
    pub client_id: String,

    /// Platform application client secret (or via FITMIGRATE_CLIENT_SECRET)
    #[arg(
        value_name = "CLIENT_SECRET",
        env = "FITMIGRATE_CLIENT_SECRET",
        hide_env_values = true
    )]
    pub client_secret: String,

    /// One-time authorization code. Only needed when no credential is saved.
    #[arg(
        value_name = "CODE",
        env = "FITMIGRATE_AUTHORIZATION_CODE",
        hide_env_values = true
    )]
    pub code: Option<String>,

    /// Report what would be uploaded without calling the platform
    #[arg(long)]
    pub dry_run: bool,

    /// Number of concurrent upload workers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}

pub async fn run(base: BaseArgs, args: UploadArgs) -> Result<()> {
    if !args.pending_dir.is_dir() {
        bail!("No such directory: {}", args.pending_dir.display());
    }
    let settings = Settings::resolve(&base)?.with_workers(args.workers)?;

    if args.dry_run {
        return dry_run(&base, &args, &settings);
    }

    let api: Arc<dyn PlatformApi> = Arc::new(HttpPlatform::new(
        &settings.api_url,
        &settings.authorize_url,
        &args.client_id,
        &args.client_secret,
    ));
    let credentials = CredentialManager::new(
        Arc::clone(&api),
        CredentialStore::for_pending_dir(&args.pending_dir),
        args.code.clone(),
    );
    let pipeline = Pipeline::scan(api, credentials, &args.pending_dir, settings.pipeline_options())?;

    let total = pipeline.jobs().len();
    if !base.json {
        println!(
            "Uploading {} {} from {} with {} {}",
            format_usize_commas(total),
            pluralize(total, "activity", Some("activities")),
            args.pending_dir.display(),
            settings.workers,
            pluralize(settings.workers, "worker", None)
        );
    }

    let state = pipeline.state();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            state.stop(StopReason::Interrupted);
        }
    });
    let progress = if base.json {
        Progress::hidden()
    } else {
        Progress::new(total as u64, "Uploading")
    };
    let summary = pipeline.run(progress).await;
    interrupt.abort();
    let summary = summary?;

    report(&base, &summary)?;
    match summary.stop_reason {
        None => Ok(()),
        Some(StopReason::Fatal {
            message,
            reauthorize_url,
        }) => {
            if let Some(url) = reauthorize_url {
                eprintln!("Obtain a new authorization code at:\n  {url}");
                offer_to_open(&url);
            }
            bail!("upload stopped: {message}")
        }
        Some(reason @ StopReason::QuotaExhausted { .. }) => {
            bail!("upload {reason}; re-run later to continue")
        }
        Some(StopReason::Interrupted) => bail!("upload interrupted; re-run to continue"),
    }
}

#[derive(Debug, Serialize)]
struct SummaryOutput<'a> {
    total: usize,
    uploaded: usize,
    skipped: usize,
    elapsed_secs: u64,
    completed: bool,
    stop_reason: Option<String>,
    summary: &'a str,
}

fn report(base: &BaseArgs, summary: &RunSummary) -> Result<()> {
    let line = summary.summary_line();
    if base.json {
        let output = SummaryOutput {
            total: summary.total,
            uploaded: summary.uploaded,
            skipped: summary.skipped,
            elapsed_secs: summary.elapsed.as_secs(),
            completed: summary.is_complete(),
            stop_reason: summary.stop_reason.as_ref().map(ToString::to_string),
            summary: &line,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }
    let status = if summary.is_complete() {
        CommandStatus::Success
    } else {
        CommandStatus::Error
    };
    print_command_status(status, &line);
    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct DryRunReport {
    pending: Vec<String>,
    skipped: Vec<SkippedJob>,
    credential: &'static str,
    estimated_windows: u64,
}

#[derive(Debug, Serialize)]
struct SkippedJob {
    job: String,
    reason: String,
}

fn inspect(job: &PendingJob) -> Result<(), String> {
    let descriptor = job.load().map_err(|err| err.to_string())?;
    let payload = job.payload_path(&descriptor);
    if !payload.is_file() {
        return Err(format!("payload {} not found", payload.display()));
    }
    Ok(())
}

fn dry_run(base: &BaseArgs, args: &UploadArgs, settings: &Settings) -> Result<()> {
    let mut report = DryRunReport::default();
    for job in scan_pending(&args.pending_dir)? {
        match inspect(&job) {
            Ok(()) => report.pending.push(job.label()),
            Err(reason) => report.skipped.push(SkippedJob {
                job: job.label(),
                reason,
            }),
        }
    }

    let store = CredentialStore::for_pending_dir(&args.pending_dir);
    report.credential = match store.load()? {
        Some(credential) if credential.is_expired_at(Utc::now()) => "expired",
        Some(_) => "valid",
        None if args.code.is_some() => "missing (will exchange code)",
        None => "missing",
    };
    let quota = u64::from(settings.throttle.quota_per_window.max(1));
    report.estimated_windows = (report.pending.len() as u64).div_ceil(quota);

    if base.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for job in &report.pending {
        println!("   - would upload {job}");
    }
    for skipped in &report.skipped {
        println!("   - would skip {}: {}", skipped.job, skipped.reason);
    }
    print_command_status(
        CommandStatus::Success,
        &format!(
            "{} to upload, {} to skip, credential {}, about {} quota {}",
            format_usize_commas(report.pending.len()),
            format_usize_commas(report.skipped.len()),
            report.credential,
            report.estimated_windows,
            pluralize(report.estimated_windows as usize, "window", None)
        ),
    );
    Ok(())
}
