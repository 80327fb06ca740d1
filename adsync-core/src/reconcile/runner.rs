use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ads::{content_hash, AdCatalog, AdError, AdFilter, AdLoader, AdStateWriter, PublishedState};
use crate::browser::{
    metrics_snapshot, record_metrics, AutomationTelemetry, BrowserMetrics, ChromiumDriverFactory,
    DriverFactory, FailureCategory, PageSteps, RetryContext, RetryPolicy, SharedMetrics, SiteMap,
};
use crate::config::AdsyncConfig;
use crate::remote::{
    DownloadSelector, DownloadedAd, ListingExtractor, RemoteSnapshot, RemoteStateReader,
};
use crate::session::{ConsoleOperatorGate, OperatorGate, SessionContext, SessionLease, SessionPool};

use super::error::ReconcileResult;
use super::executor::{ChallengeHandling, OperationExecutor};
use super::ledger::OperationLedger;
use super::models::{Operation, OperationKind, OperationOutcome, OperationRecord, PlanMode};
use super::planner::{PlanInput, PlannerSettings, ReconcilePlanner};
use super::report::{AbortReason, DownloadOutcome, DownloadRecord, DownloadReport, RunReport};

/// What a single pass should do.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: PlanMode,
    pub filter: AdFilter,
    pub dry_run: bool,
    pub keep_old: bool,
}

impl RunOptions {
    pub fn new(mode: PlanMode, filter: AdFilter) -> Self {
        Self {
            mode,
            filter,
            dry_run: false,
            keep_old: false,
        }
    }
}

pub struct ReconcilerBuilder {
    config: AdsyncConfig,
    factory: Option<Arc<dyn DriverFactory>>,
    operator: Option<Arc<dyn OperatorGate>>,
    cancel: Option<CancellationToken>,
    persistence: bool,
}

impl ReconcilerBuilder {
    pub fn new(config: AdsyncConfig) -> Self {
        Self {
            config,
            factory: None,
            operator: None,
            cancel: None,
            persistence: true,
        }
    }

    /// Defaults to Chromium as configured under `[chromium]`.
    pub fn factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Defaults to prompting on the console.
    pub fn operator(mut self, operator: Arc<dyn OperatorGate>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Without persistence nothing is written to disk.
    pub fn with_persistence(mut self, value: bool) -> Self {
        self.persistence = value;
        self
    }

    pub fn build(self) -> ReconcileResult<Reconciler> {
        let config = self.config;
        let site = Arc::new(SiteMap::from_config(&config));
        let factory: Arc<dyn DriverFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(ChromiumDriverFactory::from_config(&config)?),
        };
        let operator: Arc<dyn OperatorGate> = match self.operator {
            Some(operator) => operator,
            None => Arc::new(ConsoleOperatorGate),
        };
        let cancel = self.cancel.unwrap_or_default();
        let metrics: SharedMetrics = Arc::new(Mutex::new(BrowserMetrics::default()));
        let observability = &config.observability;

        let telemetry = if self.persistence {
            Some(Arc::new(AutomationTelemetry::new(
                config.resolve_path(&observability.failure_log),
                config.resolve_path(&observability.metrics_db),
            )?))
        } else {
            None
        };
        let ledger = if self.persistence {
            let ledger = OperationLedger::new(config.resolve_path(&observability.ledger_db))?;
            ledger.initialize()?;
            Some(Arc::new(ledger))
        } else {
            None
        };

        let pool = SessionPool::new(SessionContext {
            factory,
            site: Arc::clone(&site),
            login: config.login.clone(),
            config: config.session.clone(),
            operator: Arc::clone(&operator),
            metrics: Arc::clone(&metrics),
            cancel: cancel.clone(),
        });
        let executor = OperationExecutor::new(
            Arc::clone(&site),
            RemoteStateReader::new(config.reconcile.max_pages),
            self.persistence,
            ledger.clone(),
            ChallengeHandling {
                policy: config.session.challenge_policy,
                operator,
                timeout: Duration::from_secs(config.session.manual_intervention_timeout_seconds),
            },
            Arc::clone(&metrics),
            cancel.clone(),
        );

        Ok(Reconciler {
            retry: RetryPolicy::new(&config.retry),
            retry_ctx: RetryContext {
                telemetry,
                metrics: Arc::clone(&metrics),
                cancel: cancel.clone(),
            },
            reader: RemoteStateReader::new(config.reconcile.max_pages),
            extractor: ListingExtractor::new(&config.ads),
            persistence: self.persistence,
            config,
            site,
            pool,
            executor,
            ledger,
            metrics,
            cancel,
        })
    }
}

/// Runs reconciliation passes: read remote state, plan, execute phase by phase.
pub struct Reconciler {
    config: AdsyncConfig,
    site: Arc<SiteMap>,
    pool: SessionPool,
    executor: OperationExecutor,
    reader: RemoteStateReader,
    extractor: ListingExtractor,
    persistence: bool,
    retry: RetryPolicy,
    retry_ctx: RetryContext,
    ledger: Option<Arc<OperationLedger>>,
    metrics: SharedMetrics,
    cancel: CancellationToken,
}

/// Stops the remaining operations once the pass cannot succeed any more.
struct AbortState {
    reason: Mutex<Option<AbortReason>>,
    ui_timeouts: AtomicUsize,
    threshold: usize,
}

impl AbortState {
    fn new(threshold: usize) -> Self {
        Self {
            reason: Mutex::new(None),
            ui_timeouts: AtomicUsize::new(0),
            threshold,
        }
    }

    fn is_aborted(&self) -> bool {
        self.reason.lock().map(|guard| guard.is_some()).unwrap_or(true)
    }

    fn abort(&self, category: FailureCategory, message: String) {
        if let Ok(mut guard) = self.reason.lock() {
            if guard.is_none() {
                warn!(target: "reconcile.runner", category = %category, reason = %message, "aborting pass");
                *guard = Some(AbortReason { category, message });
            }
        }
    }

    fn observe(&self, record: &OperationRecord) {
        match &record.outcome {
            OperationOutcome::Blocked { category, message } => {
                self.abort(*category, message.clone());
            }
            OperationOutcome::Failed {
                category: FailureCategory::UiTimeout,
                message,
                ..
            } => {
                let seen = self.ui_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                if self.threshold > 0 && seen >= self.threshold {
                    self.abort(
                        FailureCategory::UiTimeout,
                        format!("{seen} operations timed out waiting for the page, last: {message}"),
                    );
                }
            }
            _ => {}
        }
    }

    fn into_reason(self) -> Option<AbortReason> {
        self.reason.into_inner().ok().flatten()
    }
}

impl Reconciler {
    pub fn builder(config: AdsyncConfig) -> ReconcilerBuilder {
        ReconcilerBuilder::new(config)
    }

    pub fn config(&self) -> &AdsyncConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn ledger(&self) -> Option<&OperationLedger> {
        self.ledger.as_deref()
    }

    /// One reconciliation pass over the ads `options` selects.
    pub async fn run_pass(
        &self,
        catalog: &AdCatalog,
        options: &RunOptions,
    ) -> ReconcileResult<RunReport> {
        let started = Instant::now();
        record_metrics(&self.metrics, |m| *m = BrowserMetrics::default());
        let mut report = RunReport::new(Uuid::new_v4().to_string(), options.mode, options.dry_run);
        report.validation_errors = catalog.errors.iter().map(ToString::to_string).collect();
        let ads = catalog.select(&options.filter);
        info!(
            target: "reconcile.runner",
            run_id = %report.run_id,
            mode = options.mode.as_str(),
            selector = %options.filter.selector,
            selected = ads.len(),
            invalid = report.validation_errors.len(),
            dry_run = options.dry_run,
            "starting reconciliation pass"
        );

        let snapshot = match self.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                report.aborted = Some(reason);
                return Ok(self.finish(report, started));
            }
        };
        let ledger_ids = match &self.ledger {
            Some(ledger) => ledger.live_remote_ids()?,
            None => HashSet::new(),
        };

        let planner = ReconcilePlanner::new(PlannerSettings::new(
            &self.config.reconcile,
            self.config.publishing.replace_order,
            options.keep_old,
        ));
        let plan = planner.plan(PlanInput {
            mode: options.mode,
            selector: &options.filter.selector,
            ads: &ads,
            claimed: catalog.known_remote_ids(),
            ledger_ids,
            snapshot: &snapshot,
            now: Utc::now(),
        });
        report.ambiguous = plan.ambiguous.clone();
        report.planned = plan.operations.iter().map(Operation::summary).collect();
        info!(
            target: "reconcile.runner",
            run_id = %report.run_id,
            create = plan.count(OperationKind::Create),
            update = plan.count(OperationKind::Update),
            delete = plan.count(OperationKind::Delete),
            skip = plan.count(OperationKind::Skip),
            ambiguous = plan.ambiguous.len(),
            "plan ready"
        );
        if options.dry_run {
            return Ok(self.finish(report, started));
        }

        let abort = AbortState::new(self.config.reconcile.ui_timeout_abort_threshold);
        let mut records = Vec::with_capacity(report.planned.len());
        // Old listing id -> whether the first half of its republication landed.
        let mut replacements: HashMap<String, bool> = HashMap::new();
        for (kind, operations) in plan.into_phases() {
            if kind == OperationKind::Skip {
                records.extend(operations.into_iter().map(|op| {
                    OperationRecord::new(op.summary(), OperationOutcome::Skipped, 0)
                }));
                continue;
            }
            let (operations, held): (Vec<_>, Vec<_>) = operations.into_iter().partition(|op| {
                op.replacement_of()
                    .and_then(|old| replacements.get(old))
                    .copied()
                    .unwrap_or(true)
            });
            for operation in held {
                let old = operation.replacement_of().unwrap_or_default().to_string();
                warn!(
                    target: "reconcile.runner",
                    operation = %operation.label(),
                    replaced = %old,
                    "other half of the replacement did not go through, holding back"
                );
                records.push(OperationRecord::new(
                    operation.summary(),
                    OperationOutcome::NotAttempted {
                        reason: Some(format!("replacement of listing {old} did not go through")),
                    },
                    0,
                ));
            }
            info!(target: "reconcile.runner", phase = %kind, operations = operations.len(), "phase started");
            let abort = &abort;
            let phase: Vec<OperationRecord> = stream::iter(operations)
                .map(|operation| self.run_operation(operation, abort))
                .buffer_unordered(self.pool.concurrency())
                .collect()
                .await;
            for record in &phase {
                if let Some(old) = record.operation.replacement_of() {
                    replacements.insert(old.to_string(), record.outcome.landed());
                }
            }
            records.extend(phase);
        }
        records.sort_by_key(|record| record.operation.seq);
        report.records = records;
        report.aborted = abort.into_reason();
        if report.aborted.is_none() && self.cancel.is_cancelled() {
            report.aborted = Some(AbortReason {
                category: FailureCategory::Cancelled,
                message: "pass cancelled".into(),
            });
        }
        Ok(self.finish(report, started))
    }

    /// Copies live listings into ad files below `[download] dir`, one file
    /// per listing, each already carrying its listing id and content hash.
    pub async fn download(
        &self,
        catalog: &AdCatalog,
        selector: &DownloadSelector,
    ) -> ReconcileResult<DownloadReport> {
        let mut report = DownloadReport::new(selector.to_string());
        let snapshot = match self.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                report.aborted = Some(reason);
                return Ok(report);
            }
        };
        let dir = self.config.resolve_path(&self.config.download.dir);
        let claimed = catalog.known_remote_ids();
        let targets: Vec<(String, Option<String>)> = match selector {
            DownloadSelector::Ids(ids) => ids
                .iter()
                .map(|id| (id.clone(), snapshot.get(id).map(|ad| ad.title.clone())))
                .collect(),
            DownloadSelector::All | DownloadSelector::New => snapshot
                .ads()
                .iter()
                .filter(|ad| {
                    *selector == DownloadSelector::All
                        || (!claimed.contains(&ad.remote_id)
                            && !downloaded_path(&dir, &ad.remote_id).exists())
                })
                .map(|ad| (ad.remote_id.clone(), Some(ad.title.clone())))
                .collect(),
        };
        info!(
            target: "reconcile.runner",
            selector = %selector,
            listings = targets.len(),
            dir = %dir.display(),
            "starting download"
        );
        let lease = match self.pool.checkout().await {
            Ok(lease) => lease,
            Err(err) => {
                report.aborted = Some(AbortReason {
                    category: FailureCategory::Cancelled,
                    message: err.to_string(),
                });
                return Ok(report);
            }
        };
        let loader = AdLoader::new(&dir, &self.config.ads)?;
        for (remote_id, title) in targets {
            if self.cancel.is_cancelled() {
                report.aborted = Some(AbortReason {
                    category: FailureCategory::Cancelled,
                    message: "download cancelled".into(),
                });
                break;
            }
            let outcome = self.download_listing(&lease, &loader, &dir, &remote_id).await;
            if let DownloadOutcome::Failed { category, message } = &outcome {
                if category.blocks_run() {
                    report.aborted = Some(AbortReason {
                        category: *category,
                        message: message.clone(),
                    });
                }
            }
            report.records.push(DownloadRecord {
                remote_id,
                title,
                outcome,
            });
            if report.aborted.is_some() {
                break;
            }
        }
        info!(
            target: "reconcile.runner",
            saved = report.saved(),
            listings = report.records.len(),
            "download finished"
        );
        Ok(report)
    }

    async fn download_listing(
        &self,
        lease: &SessionLease,
        loader: &AdLoader,
        dir: &Path,
        remote_id: &str,
    ) -> DownloadOutcome {
        let this = self;
        let extracted = self
            .retry
            .run("download listing", &self.retry_ctx, Some(lease), move |_| async move {
                let session = lease.session().await?;
                let steps = PageSteps::new(session.driver(), &this.site, &this.cancel)
                    .with_metrics(&this.metrics);
                this.extractor.extract(&steps, remote_id).await
            })
            .await;
        let ad = match extracted {
            Ok(outcome) => match outcome.result {
                Some(ad) => ad,
                None => {
                    warn!(target: "reconcile.runner", remote_id, "listing not shown by the site");
                    return DownloadOutcome::NotFound;
                }
            },
            Err(exhausted) => {
                warn!(target: "reconcile.runner", remote_id, error = %exhausted, "could not download listing");
                return DownloadOutcome::Failed {
                    category: exhausted.category,
                    message: exhausted.error.to_string(),
                };
            }
        };
        if !self.persistence {
            return DownloadOutcome::Extracted;
        }
        let path = downloaded_path(dir, remote_id);
        match save_downloaded(loader, &path, &ad) {
            Ok(content_hash) => {
                info!(target: "reconcile.runner", remote_id, path = %path.display(), "listing downloaded");
                DownloadOutcome::Saved { path, content_hash }
            }
            Err(err) => {
                warn!(target: "reconcile.runner", remote_id, error = %err, "could not write downloaded ad");
                DownloadOutcome::Failed {
                    category: FailureCategory::Unexpected,
                    message: err.to_string(),
                }
            }
        }
    }

    async fn read_snapshot(&self) -> Result<RemoteSnapshot, AbortReason> {
        let lease = self.pool.checkout().await.map_err(|err| AbortReason {
            category: FailureCategory::Cancelled,
            message: err.to_string(),
        })?;
        let (lease, this) = (&lease, self);
        let outcome = self
            .retry
            .run("read remote state", &self.retry_ctx, Some(lease), move |_| async move {
                let session = lease.session().await?;
                let steps = PageSteps::new(session.driver(), &this.site, &this.cancel)
                    .with_metrics(&this.metrics);
                this.reader.read(&steps).await
            })
            .await;
        match outcome {
            Ok(outcome) => {
                info!(target: "reconcile.runner", listings = outcome.result.len(), "remote state read");
                Ok(outcome.result)
            }
            Err(exhausted) => {
                warn!(target: "reconcile.runner", error = %exhausted, "could not read remote state");
                Err(AbortReason {
                    category: exhausted.category,
                    message: exhausted.error.to_string(),
                })
            }
        }
    }

    async fn run_operation(&self, operation: Operation, abort: &AbortState) -> OperationRecord {
        let not_attempted = |operation: &Operation| {
            OperationRecord::new(operation.summary(), OperationOutcome::NotAttempted { reason: None }, 0)
        };
        if abort.is_aborted() || self.cancel.is_cancelled() {
            return not_attempted(&operation);
        }
        let lease = match self.pool.checkout().await {
            Ok(lease) => lease,
            Err(_) => return not_attempted(&operation),
        };
        // Re-check: the pass may have been aborted while this one waited for a lease.
        if abort.is_aborted() {
            return not_attempted(&operation);
        }
        let record = self
            .executor
            .execute(operation, &lease, &self.retry, &self.retry_ctx)
            .await;
        drop(lease);
        abort.observe(&record);
        record
    }

    fn finish(&self, mut report: RunReport, started: Instant) -> RunReport {
        report.duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        report.metrics = metrics_snapshot(&self.metrics);
        let counts = report.counts();
        info!(
            target: "reconcile.runner",
            run_id = %report.run_id,
            succeeded = counts.succeeded,
            partial = counts.partial,
            failed = counts.failed,
            blocked = counts.blocked,
            skipped = counts.skipped,
            not_attempted = counts.not_attempted,
            duration_ms = report.duration_ms,
            "pass finished"
        );
        if report.dry_run {
            return report;
        }
        if let Some(telemetry) = self.retry_ctx.telemetry.as_deref() {
            if let Err(err) = telemetry.record_run(&report.to_run_context()) {
                warn!(target: "reconcile.runner", error = %err, "failed to record run telemetry");
            }
        }
        if let Some(ledger) = self.ledger.as_deref() {
            for record in &report.records {
                if let Err(err) = ledger.record_execution(&report.run_id, record) {
                    warn!(target: "reconcile.runner", error = %err, "failed to record operation in ledger");
                    break;
                }
            }
        }
        report
    }

    /// Closes every browser context of the pool.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

fn downloaded_path(dir: &Path, remote_id: &str) -> PathBuf {
    dir.join(format!("ad_{remote_id}.yaml"))
}

/// Writes the ad file, then records id and hash the way a publish would.
/// A file that does not validate keeps its id but no hash.
fn save_downloaded(loader: &AdLoader, path: &Path, ad: &DownloadedAd) -> Result<Option<String>, AdError> {
    let value = ad.to_yaml().map_err(|source| AdError::Serialize {
        source,
        path: path.to_path_buf(),
    })?;
    let writer = AdStateWriter;
    writer.write_downloaded(path, &value)?;
    let hash = match loader.load_file(path) {
        Ok(loaded) => Some(content_hash(&loaded)),
        Err(err) => {
            warn!(target: "reconcile.runner", path = %path.display(), error = %err, "downloaded ad needs editing before it can be published");
            None
        }
    };
    writer.record_published(
        path,
        &PublishedState {
            remote_id: &ad.remote_id,
            content_hash: hash.as_deref(),
            at: Utc::now(),
            new_listing: false,
        },
    )?;
    Ok(hash)
}
