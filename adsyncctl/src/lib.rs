use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adsync_core::ads::content_hash;
use adsync_core::browser::{SimulatedMarketplace, SiteMap};
use adsync_core::reconcile::{DownloadOutcome, OperationRecord};
use adsync_core::{
    load_config, AdFilter, AdLoader, AdSelector, AdsyncConfig, DownloadReport, DownloadSelector,
    OperationOutcome, PlanMode, Reconciler, RunOptions, RunReport,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] adsync_core::ConfigError),
    #[error("ad error: {0}")]
    Ad(#[from] adsync_core::ads::AdError),
    #[error("reconcile error: {0}")]
    Reconcile(#[from] adsync_core::ReconcileError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0}")]
    RunFailed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Keeps marketplace listings in line with local ad files", long_about = None)]
pub struct Cli {
    /// Path to adsync.toml
    #[arg(long, global = true, default_value = "adsync.toml", env = "ADSYNC_CONFIG")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish new and changed ads, republish stale ones
    Publish(PassArgs),
    /// Update listings that already exist
    Update(PassArgs),
    /// Delete the listings of the selected ads
    Delete(PassArgs),
    /// Copy live listings into ad files
    Download(DownloadArgs),
    /// Check the config and every ad file without touching the site
    Verify,
    /// Print version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct PassArgs {
    /// all, due, new, or a comma separated list of ids
    #[arg(long, default_value = "due")]
    pub ads: String,
    /// Only consider ads carrying this tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Same as --ads=all
    #[arg(long, default_value_t = false)]
    pub force: bool,
    /// Keep the old listing when republishing
    #[arg(long, default_value_t = false)]
    pub keep_old: bool,
    /// Plan only, change nothing
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Drive an in-memory marketplace instead of Chromium
    #[arg(long, default_value_t = false)]
    pub simulate: bool,
    /// Cancel the pass after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// all, new, or a comma separated list of listing ids
    #[arg(long, default_value = "new")]
    pub ads: DownloadSelector,
    /// Drive an in-memory marketplace instead of Chromium
    #[arg(long, default_value_t = false)]
    pub simulate: bool,
    /// Cancel the download after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl PassArgs {
    fn selector(&self) -> AdSelector {
        if self.force {
            AdSelector::All
        } else {
            AdSelector::parse_lenient(&self.ads)
        }
    }

    fn options(&self, mode: PlanMode) -> RunOptions {
        let mut options = RunOptions::new(
            mode,
            AdFilter::new(self.selector()).with_tags(self.tags.clone()),
        );
        options.dry_run = self.dry_run;
        options.keep_old = self.keep_old;
        options
    }
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Publish(args) => pass(&cli, PlanMode::Reconcile, args),
        Commands::Update(args) => pass(&cli, PlanMode::UpdateOnly, args),
        Commands::Delete(args) => pass(&cli, PlanMode::DeleteSelected, args),
        Commands::Download(args) => download(&cli, args),
        Commands::Verify => {
            let report = verify(&cli)?;
            render(&report, cli.format)?;
            if !report.errors.is_empty() {
                return Err(AppError::RunFailed(format!(
                    "{} ad file(s) are invalid",
                    report.errors.len()
                )));
            }
            Ok(())
        }
        Commands::Version => render(&VersionInfo::current(), cli.format),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    // A second init from tests is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn pass(cli: &Cli, mode: PlanMode, args: &PassArgs) -> Result<()> {
    let config = load_config(&cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(execute_pass(config, mode, args))?;
    render(&report, cli.format)?;
    if report.exit_ok() {
        Ok(())
    } else {
        Err(AppError::RunFailed(failure_summary(&report)))
    }
}

fn build_reconciler(
    config: &AdsyncConfig,
    simulate: bool,
    cancel: &CancellationToken,
) -> Result<Reconciler> {
    let mut builder = Reconciler::builder(config.clone()).cancel(cancel.clone());
    if simulate {
        let market = SimulatedMarketplace::new(
            SiteMap::from_config(config),
            config.login.username.clone(),
            config.login.password.clone(),
        );
        builder = builder.factory(Arc::new(market)).with_persistence(false);
    }
    Ok(builder.build()?)
}

/// Cancels the token on Ctrl-C or once `timeout` seconds have passed.
struct CancelWatch {
    signal: JoinHandle<()>,
    deadline: Option<JoinHandle<()>>,
}

impl CancelWatch {
    fn spawn(cancel: &CancellationToken, timeout: Option<u64>) -> Self {
        let signal_cancel = cancel.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling the pass");
                signal_cancel.cancel();
            }
        });
        let deadline = timeout.map(|seconds| {
            let deadline_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                warn!(timeout_seconds = seconds, "pass timed out, cancelling");
                deadline_cancel.cancel();
            })
        });
        Self { signal, deadline }
    }

    fn stop(self) {
        self.signal.abort();
        if let Some(deadline) = self.deadline {
            deadline.abort();
        }
    }
}

/// Runs one reconciliation pass; Ctrl-C and `--timeout` cancel it.
pub async fn execute_pass(
    config: AdsyncConfig,
    mode: PlanMode,
    args: &PassArgs,
) -> Result<RunReport> {
    let catalog = AdLoader::from_config(&config)?.load()?;
    let cancel = CancellationToken::new();
    let reconciler = build_reconciler(&config, args.simulate, &cancel)?;
    let watch = CancelWatch::spawn(&cancel, args.timeout);
    let outcome = reconciler.run_pass(&catalog, &args.options(mode)).await;
    watch.stop();
    reconciler.shutdown().await;
    let report = outcome?;
    info!(run_id = %report.run_id, ok = report.exit_ok(), "pass finished");
    Ok(report)
}

fn download(cli: &Cli, args: &DownloadArgs) -> Result<()> {
    let config = load_config(&cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(execute_download(config, args))?;
    render(&report, cli.format)?;
    if report.exit_ok() {
        Ok(())
    } else if let Some(reason) = &report.aborted {
        Err(AppError::RunFailed(format!(
            "download aborted ({}): {}",
            reason.category, reason.message
        )))
    } else {
        Err(AppError::RunFailed("some listings could not be downloaded".into()))
    }
}

/// Copies live listings into ad files below `[download] dir`.
pub async fn execute_download(config: AdsyncConfig, args: &DownloadArgs) -> Result<DownloadReport> {
    let catalog = AdLoader::from_config(&config)?.load()?;
    let cancel = CancellationToken::new();
    let reconciler = build_reconciler(&config, args.simulate, &cancel)?;
    let watch = CancelWatch::spawn(&cancel, args.timeout);
    let outcome = reconciler.download(&catalog, &args.ads).await;
    watch.stop();
    reconciler.shutdown().await;
    let report = outcome?;
    info!(saved = report.saved(), ok = report.exit_ok(), "download finished");
    Ok(report)
}

fn failure_summary(report: &RunReport) -> String {
    if let Some(reason) = &report.aborted {
        return format!("pass aborted ({}): {}", reason.category, reason.message);
    }
    let counts = report.counts();
    let mut message = format!(
        "{} operation(s) failed, {} blocked",
        counts.failed, counts.blocked
    );
    if !report.validation_errors.is_empty() {
        let _ = write!(
            message,
            ", {} ad file(s) invalid",
            report.validation_errors.len()
        );
    }
    message
}

fn verify(cli: &Cli) -> Result<VerifyReport> {
    let config = load_config(&cli.config)?;
    let loader = AdLoader::from_config(&config)?;
    let catalog = loader.load()?;
    let ads = catalog
        .ads
        .iter()
        .map(|ad| VerifiedAd {
            local_id: ad.local_id.clone(),
            title: ad.title.clone(),
            active: ad.active,
            remote_id: ad.remote_id.clone(),
            changed: ad.content_hash.as_deref() != Some(content_hash(ad).as_str()),
        })
        .collect();
    Ok(VerifyReport {
        config: cli.config.clone(),
        ads_root: loader.root().to_path_buf(),
        ads,
        errors: catalog.errors.iter().map(ToString::to_string).collect(),
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run {} ({}{})",
            self.run_id,
            self.mode.as_str(),
            if self.dry_run { ", dry run" } else { "" }
        );
        for error in &self.validation_errors {
            let _ = writeln!(out, "invalid: {error}");
        }
        for ambiguous in &self.ambiguous {
            let _ = writeln!(
                out,
                "ambiguous: {} \"{}\" matches listings {}",
                ambiguous.local_id,
                ambiguous.title,
                ambiguous.candidates.join(", ")
            );
        }

        if self.dry_run || self.records.is_empty() {
            let _ = writeln!(out, "planned {} operation(s)", self.planned.len());
            for op in &self.planned {
                let _ = writeln!(
                    out,
                    "  #{:<3} {:<7} {:<20} {:<10} {}",
                    op.seq,
                    op.kind.as_str(),
                    op.local_id.as_deref().unwrap_or("-"),
                    op.remote_id.as_deref().unwrap_or("-"),
                    op.reason.as_str()
                );
            }
        } else {
            for record in &self.records {
                let _ = writeln!(out, "{}", record_line(record));
            }
            let counts = self.counts();
            let _ = writeln!(
                out,
                "{} succeeded, {} partial, {} failed, {} blocked, {} skipped, {} not attempted in {} ms",
                counts.succeeded,
                counts.partial,
                counts.failed,
                counts.blocked,
                counts.skipped,
                counts.not_attempted,
                self.duration_ms
            );
        }

        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "aborted: {}: {}", reason.category, reason.message);
        } else if self.has_warnings() {
            let _ = writeln!(out, "finished with warnings");
        }
        out.trim_end().to_string()
    }
}

impl DisplayFallback for DownloadReport {
    fn display(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "download ({})", self.selector);
        for record in &self.records {
            let status = match &record.outcome {
                DownloadOutcome::Saved {
                    path,
                    content_hash: Some(_),
                } => format!("saved {}", path.display()),
                DownloadOutcome::Saved {
                    path,
                    content_hash: None,
                } => format!("saved {} (needs editing before publishing)", path.display()),
                DownloadOutcome::Extracted => "read, not saved".to_string(),
                DownloadOutcome::NotFound => "not found".to_string(),
                DownloadOutcome::Failed { category, message } => {
                    format!("failed [{category}]: {message}")
                }
            };
            let _ = writeln!(
                out,
                "  {:<10} {:<30} {}",
                record.remote_id,
                record.title.as_deref().unwrap_or("-"),
                status
            );
        }
        let _ = writeln!(
            out,
            "{} of {} listing(s) saved",
            self.saved(),
            self.records.len()
        );
        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "aborted: {}: {}", reason.category, reason.message);
        }
        out.trim_end().to_string()
    }
}

fn record_line(record: &OperationRecord) -> String {
    let op = &record.operation;
    let status = match &record.outcome {
        OperationOutcome::Succeeded { remote_id } => {
            format!("ok {}", remote_id.as_deref().unwrap_or(""))
        }
        OperationOutcome::PartialSuccess { detail, .. } => format!("partial: {detail}"),
        OperationOutcome::Failed {
            category,
            message,
            attempts,
        } => format!("failed after {attempts} attempt(s) [{category}]: {message}"),
        OperationOutcome::Blocked { category, message } => {
            format!("blocked [{category}]: {message}")
        }
        OperationOutcome::Skipped => format!("skipped ({})", op.reason.as_str()),
        OperationOutcome::NotAttempted { reason } => match reason {
            Some(reason) => format!("not attempted: {reason}"),
            None => "not attempted".to_string(),
        },
    };
    format!(
        "  #{:<3} {:<7} {:<20} {}",
        op.seq,
        op.kind.as_str(),
        op.local_id.as_deref().or(op.remote_id.as_deref()).unwrap_or("-"),
        status.trim_end()
    )
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    config: PathBuf,
    ads_root: PathBuf,
    ads: Vec<VerifiedAd>,
    errors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct VerifiedAd {
    local_id: String,
    title: String,
    active: bool,
    remote_id: Option<String>,
    /// Content differs from what was last published.
    changed: bool,
}

impl DisplayFallback for VerifyReport {
    fn display(&self) -> String {
        let mut out = format!(
            "config: {}\nads: {} valid, {} invalid under {}\n",
            self.config.display(),
            self.ads.len(),
            self.errors.len(),
            self.ads_root.display()
        );
        for ad in &self.ads {
            let state = match (&ad.remote_id, ad.active, ad.changed) {
                (_, false, _) => "inactive".to_string(),
                (None, true, _) => "unpublished".to_string(),
                (Some(id), true, true) => format!("{id}, changed"),
                (Some(id), true, false) => id.clone(),
            };
            let _ = writeln!(out, "  {:<20} {:<40} {}", ad.local_id, ad.title, state);
        }
        for error in &self.errors {
            let _ = writeln!(out, "invalid: {error}");
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Serialize)]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

impl VersionInfo {
    fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl DisplayFallback for VersionInfo {
    fn display(&self) -> String {
        format!("{} {}", self.name, self.version)
    }
}
