use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ads::models::{packages_of_size, shipping_package};
use crate::ads::{
    content_hash, Ad, AdStateWriter, AdType, PriceType, PublishedState, ShippingType,
};
use crate::browser::{
    record_metrics, BrowserError, BrowserResult, ErrorCategorizer, FailureCategory, PageSteps,
    RetryContext, RetryPolicy, SharedMetrics, SiteMap, WaitCondition, WaitOutcome,
};
use crate::config::ChallengePolicy;
use crate::remote::RemoteStateReader;
use crate::session::{OperatorGate, SessionLease};

use super::ledger::OperationLedger;
use super::models::{Operation, OperationKind, OperationOutcome, OperationRecord};

/// How the executor reacts to a challenge on the publish form.
#[derive(Clone)]
pub struct ChallengeHandling {
    pub policy: ChallengePolicy,
    pub operator: Arc<dyn OperatorGate>,
    pub timeout: Duration,
}

/// Resume point carried across retries of one operation.
#[derive(Debug, Default)]
struct Checkpoint {
    /// Set once the site confirmed a new listing; retries only verify.
    created: Option<String>,
    missing_images: usize,
    completed_steps: Vec<String>,
}

impl Checkpoint {
    fn step(&mut self, name: &str) {
        if !self.completed_steps.iter().any(|step| step == name) {
            self.completed_steps.push(name.to_string());
        }
    }
}

/// A verified remote change.
struct Verified {
    remote_id: String,
    missing_images: usize,
}

/// Runs single operations against a leased session and records the result.
pub struct OperationExecutor {
    site: Arc<SiteMap>,
    reader: RemoteStateReader,
    writer: Option<AdStateWriter>,
    ledger: Option<Arc<OperationLedger>>,
    challenge: ChallengeHandling,
    metrics: SharedMetrics,
    cancel: CancellationToken,
}

impl OperationExecutor {
    pub fn new(
        site: Arc<SiteMap>,
        reader: RemoteStateReader,
        write_back: bool,
        ledger: Option<Arc<OperationLedger>>,
        challenge: ChallengeHandling,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            site,
            reader,
            writer: write_back.then_some(AdStateWriter),
            ledger,
            challenge,
            metrics,
            cancel,
        }
    }

    /// Consumes `operation`, retrying per `policy`, and persists bookkeeping
    /// once the change was verified on the site.
    pub async fn execute(
        &self,
        operation: Operation,
        lease: &SessionLease,
        policy: &RetryPolicy,
        retry: &RetryContext,
    ) -> OperationRecord {
        let planned = operation.summary();
        if operation.kind == OperationKind::Skip {
            return OperationRecord::new(planned, OperationOutcome::Skipped, 0);
        }

        let label = operation.label();
        let checkpoint = Mutex::new(Checkpoint::default());
        let (op, progress) = (&operation, &checkpoint);
        info!(operation = %label, reason = %operation.reason, "executing");
        let result = policy
            .run(&label, retry, Some(lease), move |attempt| {
                self.attempt(op, lease, progress, attempt)
            })
            .await;

        match result {
            Ok(outcome) => {
                let attempts = outcome.attempts;
                let verified = outcome.result;
                let steps = checkpoint
                    .lock()
                    .map(|guard| guard.completed_steps.clone())
                    .unwrap_or_default();
                let result = self.persist(&operation, &verified, steps);
                let mut record = OperationRecord::new(planned, result, attempts);
                record.operation.remote_id = Some(verified.remote_id);
                info!(operation = %label, outcome = record.outcome.as_str(), attempts, "finished");
                record
            }
            Err(exhausted) => {
                let message = exhausted.error.to_string();
                let outcome = if exhausted.category.blocks_run() {
                    OperationOutcome::Blocked {
                        category: exhausted.category,
                        message,
                    }
                } else {
                    OperationOutcome::Failed {
                        category: exhausted.category,
                        message,
                        attempts: exhausted.attempts,
                    }
                };
                OperationRecord::new(planned, outcome, exhausted.attempts)
            }
        }
    }

    async fn attempt(
        &self,
        operation: &Operation,
        lease: &SessionLease,
        checkpoint: &Mutex<Checkpoint>,
        attempt: usize,
    ) -> BrowserResult<Verified> {
        let session = lease.session().await?;
        let steps = PageSteps::new(session.driver(), &self.site, &self.cancel)
            .with_metrics(&self.metrics);
        debug!(operation = %operation.label(), attempt, generation = session.generation(), "attempt");
        match operation.kind {
            OperationKind::Create => {
                let ad = require_ad(operation)?;
                self.create(&steps, ad, checkpoint).await
            }
            OperationKind::Update => {
                let ad = require_ad(operation)?;
                let remote_id = require_remote(operation)?;
                self.update(&steps, ad, remote_id, checkpoint).await
            }
            OperationKind::Delete => {
                let remote_id = require_remote(operation)?;
                self.delete(&steps, remote_id).await
            }
            OperationKind::Skip => Err(BrowserError::Unexpected("skip has no browser steps".into())),
        }
    }

    async fn create(
        &self,
        steps: &PageSteps<'_>,
        ad: &Ad,
        checkpoint: &Mutex<Checkpoint>,
    ) -> BrowserResult<Verified> {
        let resumed = lock(checkpoint)?.created.clone();
        let remote_id = match resumed {
            Some(remote_id) => {
                debug!(ad = %ad.local_id, remote_id = %remote_id, "listing already submitted, verifying");
                remote_id
            }
            None => {
                let site = steps.site();
                steps.open(&site.post_url()).await?;
                if steps.optional(&site.selectors.ad_limit_marker).await?.is_some() {
                    return Err(BrowserError::Rejected(
                        "free ad limit reached for this account".into(),
                    ));
                }
                if let Some(category) = &ad.category {
                    steps.open(&site.category_url(category)).await?;
                    steps.click(&site.selectors.category_confirm).await?;
                }
                self.fill_form(steps, ad, true).await?;
                let missing = self.attach_images(steps, ad).await?;
                lock(checkpoint)?.missing_images = missing;
                lock(checkpoint)?.step("form_filled");
                let remote_id = self.submit(steps).await?;
                let mut guard = lock(checkpoint)?;
                guard.created = Some(remote_id.clone());
                guard.step("submitted");
                remote_id
            }
        };

        if self.reader.locate(steps, &remote_id).await?.is_none() {
            return Err(BrowserError::Timeout(format!(
                "new listing {remote_id} on the management view"
            )));
        }
        let mut guard = lock(checkpoint)?;
        guard.step("verified");
        Ok(Verified {
            remote_id,
            missing_images: guard.missing_images,
        })
    }

    async fn update(
        &self,
        steps: &PageSteps<'_>,
        ad: &Ad,
        remote_id: &str,
        checkpoint: &Mutex<Checkpoint>,
    ) -> BrowserResult<Verified> {
        let site = steps.site();
        steps.open(&site.edit_url(remote_id)).await?;
        self.fill_form(steps, ad, false).await?;
        self.clear_images(steps).await?;
        let missing = self.attach_images(steps, ad).await?;
        lock(checkpoint)?.step("form_filled");
        let confirmed = self.submit(steps).await?;
        if confirmed != remote_id {
            return Err(BrowserError::Unexpected(format!(
                "site confirmed listing {confirmed} while updating {remote_id}"
            )));
        }
        lock(checkpoint)?.step("submitted");

        match self.reader.locate(steps, remote_id).await? {
            Some(summary) if summary.title == ad.title.trim() => {}
            Some(summary) => {
                return Err(BrowserError::Timeout(format!(
                    "updated title of listing {remote_id} (still `{}`)",
                    summary.title
                )))
            }
            None => {
                return Err(BrowserError::Timeout(format!(
                    "listing {remote_id} on the management view"
                )))
            }
        }
        self.verify_saved_fields(steps, ad, remote_id).await?;
        lock(checkpoint)?.step("verified");
        Ok(Verified {
            remote_id: remote_id.to_string(),
            missing_images: missing,
        })
    }

    /// Selects exactly the wanted carrier packages of one size in the
    /// shipping dialog. Packages already checked on an edit form are kept.
    async fn choose_packages(&self, steps: &PageSteps<'_>, options: &[String]) -> BrowserResult<()> {
        let s = &steps.site().selectors;
        let wanted: Vec<(&str, &str)> = options
            .iter()
            .filter_map(|option| shipping_package(option))
            .collect();
        let Some((size, _)) = wanted.first().copied() else {
            return Ok(());
        };
        steps.click(&s.shipping_options_open).await?;
        steps.click(&s.shipping_size.replace("{size}", size)).await?;
        steps.click(&s.shipping_size_next).await?;
        for package in packages_of_size(size) {
            let option = steps
                .require(&s.shipping_package.replace("{package}", package))
                .await?;
            let checked = steps.attribute(&option, "checked").await?.is_some();
            let want = wanted.iter().any(|(_, own)| *own == package);
            if checked != want {
                steps.click_element(&option).await?;
            }
        }
        steps.click(&s.shipping_options_done).await
    }

    /// The management view only shows titles, so the edit form is re-read
    /// for the hashed fields a site can silently drop.
    async fn verify_saved_fields(
        &self,
        steps: &PageSteps<'_>,
        ad: &Ad,
        remote_id: &str,
    ) -> BrowserResult<()> {
        let s = &steps.site().selectors;
        steps.open(&steps.site().edit_url(remote_id)).await?;
        let field = steps.require(&s.description).await?;
        let saved = steps.text(&field).await?;
        if !saved.split_whitespace().eq(ad.description.split_whitespace()) {
            return Err(BrowserError::Timeout(format!(
                "updated description of listing {remote_id}"
            )));
        }
        if let Some(price) = ad.price.filter(|_| ad.price_type != PriceType::GiveAway) {
            let field = steps.require(&s.price).await?;
            let saved = steps.attribute(&field, "value").await?.unwrap_or_default();
            if saved.trim() != price.to_site_string() {
                return Err(BrowserError::Timeout(format!(
                    "updated price of listing {remote_id} (still `{}`)",
                    saved.trim()
                )));
            }
        }
        Ok(())
    }

    async fn delete(&self, steps: &PageSteps<'_>, remote_id: &str) -> BrowserResult<Verified> {
        let selectors = &steps.site().selectors;
        match self.reader.locate_row(steps, remote_id).await? {
            None => debug!(remote_id, "listing already absent"),
            Some((row, _)) => {
                let button = steps.within(&row, &selectors.delete_button).await?.ok_or_else(|| {
                    BrowserError::Timeout(format!("delete control of listing {remote_id}"))
                })?;
                steps.click_element(&button).await?;
                steps.click(&selectors.delete_confirm).await?;
                if self.reader.locate(steps, remote_id).await?.is_some() {
                    return Err(BrowserError::Timeout(format!(
                        "removal of listing {remote_id}"
                    )));
                }
            }
        }
        Ok(Verified {
            remote_id: remote_id.to_string(),
            missing_images: 0,
        })
    }

    async fn fill_form(&self, steps: &PageSteps<'_>, ad: &Ad, create: bool) -> BrowserResult<()> {
        let s = &steps.site().selectors;
        if create && ad.ad_type == AdType::Wanted {
            steps.click(&s.ad_type_wanted).await?;
        }
        steps.fill(&s.title, &ad.title).await?;
        steps.fill(&s.description, &ad.description).await?;
        if ad.price_type != PriceType::NotApplicable {
            steps.choose(&s.price_type, ad.price_type.as_str()).await?;
        }
        if let Some(price) = ad.price.filter(|_| ad.price_type != PriceType::GiveAway) {
            steps.fill(&s.price, &price.to_site_string()).await?;
        }
        if let Some(condition) = &ad.condition {
            steps.choose(&s.condition, condition.as_str()).await?;
        }
        match ad.shipping_type {
            ShippingType::Pickup => steps.click(&s.shipping_pickup).await?,
            ShippingType::Shipping => {
                steps.click(&s.shipping_enabled).await?;
                if !ad.shipping_options.is_empty() {
                    self.choose_packages(steps, &ad.shipping_options).await?;
                } else if let Some(costs) = &ad.shipping_costs {
                    steps.fill(&s.shipping_costs, &costs.to_site_string()).await?;
                }
                let buy_now = if ad.offers_buy_now() {
                    &s.buy_now_yes
                } else {
                    &s.buy_now_no
                };
                match steps.optional(buy_now).await? {
                    Some(radio) => steps.click_element(&radio).await?,
                    None if ad.offers_buy_now() => {
                        warn!(ad = %ad.local_id, "buy-now option not offered for this account")
                    }
                    None => {}
                }
            }
            ShippingType::NotApplicable => {}
        }
        for (name, value) in &ad.attributes {
            steps.choose(&format!("[name*='{name}']"), value).await?;
        }
        let contact = [
            (&s.contact_name, &ad.contact.name),
            (&s.contact_street, &ad.contact.street),
            (&s.contact_zipcode, &ad.contact.zipcode),
            (&s.contact_phone, &ad.contact.phone),
        ];
        for (selector, value) in contact {
            if let Some(value) = value {
                steps.fill(selector, value).await?;
            }
        }
        Ok(())
    }

    async fn clear_images(&self, steps: &PageSteps<'_>) -> BrowserResult<()> {
        let s = &steps.site().selectors;
        for preview in steps.all(&s.image_preview).await? {
            if let Some(remove) = steps.within(&preview, &s.image_remove).await? {
                steps.click_element(&remove).await?;
            }
        }
        Ok(())
    }

    /// Uploads every image; returns how many did not end up attached.
    async fn attach_images(&self, steps: &PageSteps<'_>, ad: &Ad) -> BrowserResult<usize> {
        let s = &steps.site().selectors;
        for image in &ad.images {
            let input = steps.require(&s.image_input).await?;
            match steps.upload(&input, image).await {
                Ok(()) => record_metrics(&self.metrics, |m| m.record_image_upload(true)),
                Err(err) => {
                    let category = ErrorCategorizer::categorize(&err);
                    if matches!(category, FailureCategory::Cancelled | FailureCategory::SessionLost) {
                        return Err(err);
                    }
                    record_metrics(&self.metrics, |m| m.record_image_upload(false));
                    warn!(ad = %ad.local_id, image = %image.display(), error = %err, "image upload failed");
                }
            }
        }
        let previews = steps.all(&s.image_preview).await?.len();
        let missing = ad.images.len().saturating_sub(previews);
        if missing > 0 {
            warn!(ad = %ad.local_id, expected = ad.images.len(), attached = previews, "images missing after upload");
        }
        Ok(missing)
    }

    /// Submits the form and returns the listing id from the confirmation page.
    async fn submit(&self, steps: &PageSteps<'_>) -> BrowserResult<String> {
        let site = steps.site();
        self.handle_publish_challenge(steps).await?;
        steps.click(&site.selectors.submit).await?;
        if let Some(error) = steps.optional(&site.selectors.form_error).await? {
            let message = steps.text(&error).await?;
            return Err(BrowserError::Rejected(if message.is_empty() {
                "site rejected the form".into()
            } else {
                message
            }));
        }
        let confirmation = WaitCondition::UrlContains(site.paths.confirmation_marker.clone());
        if let WaitOutcome::TimedOut = steps.wait(&confirmation, site.element_timeout).await? {
            steps.ensure_authenticated().await?;
            return Err(BrowserError::Timeout("publish confirmation page".into()));
        }
        let url = steps.current_url().await?;
        site.confirmed_remote_id(&url).ok_or_else(|| {
            BrowserError::Unexpected(format!("confirmation url without listing id: {url}"))
        })
    }

    async fn handle_publish_challenge(&self, steps: &PageSteps<'_>) -> BrowserResult<()> {
        let marker = &steps.site().selectors.publish_challenge_marker;
        if steps.optional(marker).await?.is_none() {
            return Ok(());
        }
        record_metrics(&self.metrics, |m| m.record_challenge());
        match self.challenge.policy {
            ChallengePolicy::Fail => Err(BrowserError::ManualIntervention(
                "challenge on the publish form and challenge_policy is fail".into(),
            )),
            ChallengePolicy::Pause => {
                let message = "Challenge on the publish form. Solve it in the browser window.";
                let waited = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(BrowserError::Cancelled),
                    waited = tokio::time::timeout(
                        self.challenge.timeout,
                        self.challenge.operator.await_operator(message),
                    ) => waited,
                };
                match waited {
                    Ok(result) => result,
                    Err(_) => Err(BrowserError::ManualIntervention(format!(
                        "publish challenge not resolved within {}s",
                        self.challenge.timeout.as_secs()
                    ))),
                }
            }
        }
    }

    fn persist(
        &self,
        operation: &Operation,
        verified: &Verified,
        mut completed_steps: Vec<String>,
    ) -> OperationOutcome {
        let remote_id = verified.remote_id.as_str();
        if let Err(message) = self.write_back(operation, verified, Utc::now()) {
            warn!(operation = %operation.label(), error = %message, "bookkeeping failed after verified change");
            return OperationOutcome::PartialSuccess {
                completed_steps,
                detail: format!("listing {remote_id} changed but local state was not saved: {message}"),
            };
        }
        completed_steps.push("persisted".into());
        if verified.missing_images > 0 {
            let expected = operation.ad.as_ref().map_or(0, |ad| ad.images.len());
            return OperationOutcome::PartialSuccess {
                completed_steps,
                detail: format!(
                    "{} of {expected} images attached to listing {remote_id}",
                    expected - verified.missing_images
                ),
            };
        }
        OperationOutcome::Succeeded {
            remote_id: Some(verified.remote_id.clone()),
        }
    }

    /// Writes the verified state back to the ad file and the ledger.
    fn write_back(
        &self,
        operation: &Operation,
        verified: &Verified,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let remote_id = verified.remote_id.as_str();
        match operation.kind {
            OperationKind::Create | OperationKind::Update => {
                let Some(ad) = &operation.ad else {
                    return Ok(());
                };
                let hash = (verified.missing_images == 0).then(|| content_hash(ad));
                if let Some(writer) = &self.writer {
                    let state = PublishedState {
                        remote_id,
                        content_hash: hash.as_deref(),
                        at: now,
                        new_listing: operation.kind == OperationKind::Create,
                    };
                    writer
                        .record_published(&ad.source, &state)
                        .map_err(|err| err.to_string())?;
                }
                if let Some(ledger) = &self.ledger {
                    ledger
                        .record_published(remote_id, &ad.local_id, hash.as_deref(), now)
                        .map_err(|err| err.to_string())?;
                }
            }
            OperationKind::Delete => {
                if let (Some(writer), Some(ad)) = (&self.writer, &operation.ad) {
                    writer
                        .clear_remote(&ad.source, remote_id)
                        .map_err(|err| err.to_string())?;
                }
                if let Some(ledger) = &self.ledger {
                    ledger
                        .mark_deleted(remote_id, now)
                        .map_err(|err| err.to_string())?;
                }
            }
            OperationKind::Skip => {}
        }
        Ok(())
    }
}

fn lock(checkpoint: &Mutex<Checkpoint>) -> BrowserResult<std::sync::MutexGuard<'_, Checkpoint>> {
    checkpoint
        .lock()
        .map_err(|_| BrowserError::Unexpected("operation checkpoint poisoned".into()))
}

fn require_ad(operation: &Operation) -> BrowserResult<&Ad> {
    operation
        .ad
        .as_ref()
        .ok_or_else(|| BrowserError::Unexpected(format!("{} has no ad", operation.label())))
}

fn require_remote(operation: &Operation) -> BrowserResult<&str> {
    operation
        .remote_id
        .as_deref()
        .ok_or_else(|| BrowserError::Unexpected(format!("{} has no remote id", operation.label())))
}
