use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use adsync_core::ads::{content_hash, Price, PriceType, ShippingType};
use adsync_core::browser::{FailureCategory, SimulatedMarketplace, SiteMap};
use adsync_core::config::{ChallengePolicy, ReplaceOrder};
use adsync_core::reconcile::{DownloadOutcome, OperationRecord, ReasonCode};
use adsync_core::{
    load_config, AdCatalog, AdFilter, AdLoader, AdSelector, AdsyncConfig, DownloadSelector,
    OperationKind,
    OperationOutcome, PlanMode, Reconciler, RunOptions, RunReport, UnattendedOperatorGate,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
[login]
username = "seller@example.com"
password = "secret"

[ads]
files = ["ads/**/*.yaml"]

[ads.defaults]
shipping_type = "PICKUP"

[ads.defaults.contact]
name = "Alex"
zipcode = "10115"

[retry]
max_attempts = 3
base_delay_ms = 10
multiplier = 2.0
max_delay_ms = 40
jitter_ms = 0

[session]
challenge_policy = "fail"

[reconcile]
ui_timeout_abort_threshold = 2
"#;

const SOFA: &str = "local_id: sofa
title: Graues Ecksofa mit Schlaffunktion
description: Gut erhalten, Nichtraucherhaushalt.
category: 80/88
price: 150
price_type: NEGOTIABLE
condition: ok
";

struct Harness {
    dir: TempDir,
    config: AdsyncConfig,
    market: SimulatedMarketplace,
}

impl Harness {
    fn new() -> Self {
        Self::with(|_| {})
    }

    fn with(adjust: impl FnOnce(&mut AdsyncConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("ads/images")).unwrap();
        let path = dir.path().join("adsync.toml");
        fs::write(&path, CONFIG).unwrap();
        let mut config = load_config(&path).unwrap();
        adjust(&mut config);
        let market = SimulatedMarketplace::new(
            SiteMap::from_config(&config),
            "seller@example.com",
            "secret",
        );
        Self {
            dir,
            config,
            market,
        }
    }

    fn ad_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("ads").join(name)
    }

    fn write_ad(&self, name: &str, body: &str) {
        fs::write(self.ad_path(name), body).unwrap();
    }

    fn append(&self, name: &str, line: &str) {
        let mut body = fs::read_to_string(self.ad_path(name)).unwrap();
        body.push_str(line);
        body.push('\n');
        fs::write(self.ad_path(name), body).unwrap();
    }

    fn write_image(&self, name: &str) {
        fs::write(self.dir.path().join("ads/images").join(name), [0xff, 0xd8, 0xff]).unwrap();
    }

    fn catalog(&self) -> AdCatalog {
        AdLoader::from_config(&self.config).unwrap().load().unwrap()
    }

    /// Records the current content hash so the ad counts as unchanged.
    fn mark_in_sync(&self, name: &str, local_id: &str) {
        let hash = content_hash(self.catalog().get(local_id).unwrap());
        self.append(name, &format!("content_hash: {hash}"));
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::builder(self.config.clone())
            .factory(Arc::new(self.market.clone()))
            .operator(Arc::new(UnattendedOperatorGate))
            .build()
            .unwrap()
    }
}

fn publish() -> RunOptions {
    RunOptions::new(PlanMode::Reconcile, AdFilter::new(AdSelector::Due))
}

fn record<'r>(report: &'r RunReport, local_id: &str, kind: OperationKind) -> &'r OperationRecord {
    report
        .records
        .iter()
        .find(|record| {
            record.operation.local_id.as_deref() == Some(local_id) && record.operation.kind == kind
        })
        .unwrap_or_else(|| panic!("no {kind} record for {local_id}: {:#?}", report.records))
}

#[tokio::test(start_paused = true)]
async fn second_pass_after_publishing_changes_nothing() {
    let h = Harness::new();
    h.write_ad("sofa.yaml", SOFA);
    let lamp_id = h.market.seed_listing("Stehlampe aus Messing", "active");
    h.write_ad(
        "lamp.yaml",
        &format!(
            "local_id: lamp\nid: {lamp_id}\ntitle: Stehlampe aus Messing\ndescription: Funktioniert einwandfrei.\nprice: 40\n"
        ),
    );
    h.mark_in_sync("lamp.yaml", "lamp");
    let reconciler = h.reconciler();

    let first = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(first.exit_ok(), "{first:#?}");
    assert!(matches!(
        record(&first, "sofa", OperationKind::Create).outcome,
        OperationOutcome::Succeeded { .. }
    ));
    assert_eq!(
        record(&first, "lamp", OperationKind::Skip).outcome,
        OperationOutcome::Skipped
    );

    let catalog = h.catalog();
    let sofa = catalog.get("sofa").unwrap();
    let sofa_id = sofa.remote_id.clone().unwrap();
    assert_eq!(sofa.content_hash.as_deref(), Some(content_hash(sofa).as_str()));
    assert!(sofa.created_on.is_some());
    let listing = h.market.listing(&sofa_id).unwrap();
    assert_eq!(listing.title, "Graues Ecksofa mit Schlaffunktion");
    assert_eq!(listing.category.as_deref(), Some("80/88"));
    assert_eq!(listing.price.as_deref(), Some("150"));

    let second = reconciler.run_pass(&catalog, &publish()).await.unwrap();
    assert!(second.exit_ok());
    assert_eq!(second.counts().skipped, 2);
    assert!(second
        .planned
        .iter()
        .all(|operation| operation.kind == OperationKind::Skip));
    assert_eq!(
        h.market.action_log(),
        vec!["login".to_string(), format!("create {sofa_id}")]
    );
    assert_eq!(h.market.login_count(), 1);

    let ledger = reconciler.ledger().unwrap();
    assert!(ledger.live_remote_ids().unwrap().contains(&sofa_id));
    let entries = ledger.operations_for_run(&first.run_id).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].outcome, "skipped");
    assert_eq!(entries[1].kind, "create");
}

#[tokio::test(start_paused = true)]
async fn missing_images_leave_the_ad_due_for_update() {
    let h = Harness::new();
    h.write_image("sofa-1.jpg");
    h.write_image("sofa-2.jpg");
    h.write_ad("sofa.yaml", &format!("{SOFA}images:\n  - images/sofa-*.jpg\n"));
    h.market.configure(|faults| faults.reject_image_uploads = true);
    let reconciler = h.reconciler();

    let first = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    match &record(&first, "sofa", OperationKind::Create).outcome {
        OperationOutcome::PartialSuccess {
            completed_steps,
            detail,
        } => {
            assert!(completed_steps.contains(&"verified".to_string()));
            assert!(detail.contains("0 of 2 images"), "{detail}");
        }
        other => panic!("expected partial success, got {other:?}"),
    }
    assert!(first.exit_ok());
    assert!(first.has_warnings());
    assert_eq!(first.metrics.image_upload_failures, 2);

    let catalog = h.catalog();
    let sofa = catalog.get("sofa").unwrap();
    let sofa_id = sofa.remote_id.clone().unwrap();
    assert!(sofa.content_hash.is_none());

    h.market.configure(|faults| faults.reject_image_uploads = false);
    let second = reconciler.run_pass(&catalog, &publish()).await.unwrap();
    let update = record(&second, "sofa", OperationKind::Update);
    assert_eq!(update.operation.reason, ReasonCode::HashUnknown);
    assert_eq!(update.operation.remote_id.as_deref(), Some(sofa_id.as_str()));
    assert!(matches!(update.outcome, OperationOutcome::Succeeded { .. }));

    assert_eq!(h.market.listings().len(), 1);
    assert_eq!(h.market.listing(&sofa_id).unwrap().images, 2);
    assert!(h.catalog().get("sofa").unwrap().content_hash.is_some());
}

#[tokio::test(start_paused = true)]
async fn expired_session_is_renewed_once_and_the_operation_succeeds() {
    let h = Harness::new();
    h.write_ad("sofa.yaml", SOFA);
    // Survives the management page read, expires on the post form.
    h.market
        .configure(|faults| faults.expire_sessions_after_navigations = Some(1));
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    let create = record(&report, "sofa", OperationKind::Create);
    assert!(matches!(create.outcome, OperationOutcome::Succeeded { .. }));
    assert_eq!(create.attempts, 2);
    assert_eq!(h.market.login_count(), 2);
    assert_eq!(report.metrics.session_recoveries, 1);
    assert_eq!(h.market.listings().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn login_challenge_under_fail_policy_blocks_the_pass() {
    let h = Harness::with(|config| config.session.challenge_policy = ChallengePolicy::Fail);
    h.write_ad("sofa.yaml", SOFA);
    h.market.configure(|faults| faults.challenge_on_login = true);
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    let aborted = report.aborted.clone().unwrap();
    assert_eq!(aborted.category, FailureCategory::AuthenticationBlocked);
    assert!(report.planned.is_empty());
    assert!(report.records.is_empty());
    assert!(!report.exit_ok());
    assert!(h.market.listings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_ui_timeouts_abort_the_remaining_operations() {
    let h = Harness::with(|config| config.retry.max_attempts = 2);
    let hidden = h.config.selectors.title.clone();
    for (name, title) in [
        ("a-chair.yaml", "Holzstuhl aus Buche"),
        ("b-desk.yaml", "Schreibtisch aus Eiche"),
        ("c-shelf.yaml", "Bücherregal, weiß lackiert"),
    ] {
        h.write_ad(name, &format!("title: {title}\ndescription: Gebraucht.\nprice: 20\n"));
    }
    h.market.configure(|faults| {
        faults.hidden_selectors.insert(hidden.clone());
    });
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    let outcomes: Vec<&OperationOutcome> =
        report.records.iter().map(|record| &record.outcome).collect();
    assert_eq!(outcomes.len(), 3);
    for failed in &outcomes[..2] {
        assert!(matches!(
            failed,
            OperationOutcome::Failed {
                category: FailureCategory::UiTimeout,
                attempts: 2,
                ..
            }
        ));
    }
    assert_eq!(outcomes[2], &OperationOutcome::NotAttempted { reason: None });
    assert_eq!(
        report.aborted.as_ref().map(|reason| reason.category),
        Some(FailureCategory::UiTimeout)
    );
    assert!(h.market.listings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn updates_run_before_creates() {
    let h = Harness::new();
    let lamp_id = h.market.seed_listing("Alte Stehlampe", "active");
    h.write_ad(
        "lamp.yaml",
        &format!(
            "local_id: lamp\nid: {lamp_id}\ntitle: Stehlampe aus Messing\ndescription: Funktioniert einwandfrei.\nprice: 40\n"
        ),
    );
    h.write_ad("sofa.yaml", SOFA);
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(report.exit_ok(), "{report:#?}");
    let kinds: Vec<OperationKind> = report.planned.iter().map(|op| op.kind).collect();
    assert_eq!(kinds, vec![OperationKind::Update, OperationKind::Create]);

    let sofa_id = h.catalog().get("sofa").unwrap().remote_id.clone().unwrap();
    assert_eq!(
        h.market.action_log(),
        vec![
            "login".to_string(),
            format!("update {lamp_id}"),
            format!("create {sofa_id}"),
        ]
    );
    assert_eq!(
        h.market.listing(&lamp_id).unwrap().title,
        "Stehlampe aus Messing"
    );
}

fn due_lamp(h: &Harness) -> String {
    let lamp_id = h.market.seed_listing("Stehlampe aus Messing", "active");
    h.write_ad(
        "lamp.yaml",
        &format!(
            "local_id: lamp\nid: {lamp_id}\ntitle: Stehlampe aus Messing\ndescription: Funktioniert einwandfrei.\nprice: 40\nrepublication_interval: 7\ncreated_on: 2024-01-01T00:00:00Z\nupdated_on: 2024-01-01T00:00:00Z\n"
        ),
    );
    h.mark_in_sync("lamp.yaml", "lamp");
    lamp_id
}

#[tokio::test(start_paused = true)]
async fn republication_creates_the_new_listing_before_deleting_the_old() {
    let h = Harness::new();
    let old_id = due_lamp(&h);
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(report.exit_ok(), "{report:#?}");
    let create = record(&report, "lamp", OperationKind::Create);
    assert_eq!(create.operation.reason, ReasonCode::Republication);
    assert_eq!(create.operation.replaces.as_deref(), Some(old_id.as_str()));

    let new_id = h.catalog().get("lamp").unwrap().remote_id.clone().unwrap();
    assert_ne!(new_id, old_id);
    assert_eq!(
        h.market.action_log(),
        vec![
            "login".to_string(),
            format!("create {new_id}"),
            format!("delete {old_id}"),
        ]
    );
    assert!(h.market.listing(&old_id).is_none());
    let live = reconciler.ledger().unwrap().live_remote_ids().unwrap();
    assert!(live.contains(&new_id));
}

#[tokio::test(start_paused = true)]
async fn republication_honours_delete_then_create() {
    let h = Harness::with(|config| {
        config.publishing.replace_order = ReplaceOrder::DeleteThenCreate;
    });
    let old_id = due_lamp(&h);
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(report.exit_ok(), "{report:#?}");
    let new_id = h.catalog().get("lamp").unwrap().remote_id.clone().unwrap();
    assert_eq!(
        h.market.action_log(),
        vec![
            "login".to_string(),
            format!("delete {old_id}"),
            format!("create {new_id}"),
        ]
    );
    assert_eq!(h.market.listings().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn ambiguous_titles_produce_no_operations() {
    let h = Harness::new();
    h.market.seed_listing("Stehlampe aus Messing", "active");
    h.market.seed_listing("Stehlampe aus Messing", "active");
    h.write_ad(
        "lamp.yaml",
        "local_id: lamp\ntitle: Stehlampe aus Messing\ndescription: Funktioniert einwandfrei.\nprice: 40\n",
    );
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(report.planned.is_empty());
    assert_eq!(report.ambiguous.len(), 1);
    assert_eq!(report.ambiguous[0].candidates.len(), 2);
    assert!(report.has_warnings());
    assert_eq!(h.market.action_log(), vec!["login".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn delete_finds_listings_on_later_pages() {
    let h = Harness::new();
    let market = h.market.clone().with_page_size(2);
    let lamp_id = market.seed_listing("Stehlampe aus Messing", "active");
    for title in ["Tisch", "Stuhl", "Regal", "Kommode"] {
        market.seed_listing(title, "active");
    }
    h.write_ad(
        "lamp.yaml",
        &format!(
            "local_id: lamp\nid: {lamp_id}\ntitle: Stehlampe aus Messing\ndescription: Funktioniert einwandfrei.\nprice: 40\n"
        ),
    );
    let reconciler = h.reconciler();

    let options = RunOptions::new(
        PlanMode::DeleteSelected,
        AdFilter::new(AdSelector::Ids(vec!["lamp".into()])),
    );
    let report = reconciler.run_pass(&h.catalog(), &options).await.unwrap();
    let delete = record(&report, "lamp", OperationKind::Delete);
    assert_eq!(delete.operation.reason, ReasonCode::DeleteRequested);
    assert!(matches!(delete.outcome, OperationOutcome::Succeeded { .. }));
    assert!(h.market.listing(&lamp_id).is_none());
    assert_eq!(h.market.listings().len(), 4);
    assert!(h.catalog().get("lamp").unwrap().remote_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn dry_run_plans_without_touching_the_site_and_reports_invalid_files() {
    let h = Harness::new();
    h.write_ad("sofa.yaml", SOFA);
    h.write_ad("broken.yaml", "title: Kurz\ndescription: x\n");
    let reconciler = h.reconciler();

    let mut options = publish();
    options.dry_run = true;
    let report = reconciler.run_pass(&h.catalog(), &options).await.unwrap();
    assert_eq!(report.planned.len(), 1);
    assert_eq!(report.planned[0].kind, OperationKind::Create);
    assert_eq!(report.planned[0].reason, ReasonCode::NotPublished);
    assert!(report.records.is_empty());
    assert_eq!(report.validation_errors.len(), 1);
    assert!(report.validation_errors[0].contains("broken.yaml"));
    assert!(!report.exit_ok());
    assert!(h.market.listings().is_empty());
    assert!(h.catalog().get("sofa").unwrap().remote_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_republication_keeps_the_old_listing() {
    let h = Harness::with(|config| config.retry.max_attempts = 2);
    let old_id = due_lamp(&h);
    let hidden = h.config.selectors.title.clone();
    h.market.configure(|faults| {
        faults.hidden_selectors.insert(hidden.clone());
    });
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(matches!(
        record(&report, "lamp", OperationKind::Create).outcome,
        OperationOutcome::Failed {
            category: FailureCategory::UiTimeout,
            ..
        }
    ));
    let delete = record(&report, "lamp", OperationKind::Delete);
    assert_eq!(delete.operation.reason, ReasonCode::ReplacedListing);
    match &delete.outcome {
        OperationOutcome::NotAttempted { reason: Some(reason) } => {
            assert!(reason.contains(&old_id), "{reason}");
        }
        other => panic!("expected the delete to be held back, got {other:?}"),
    }
    assert!(!report.exit_ok());
    assert!(h.market.listing(&old_id).is_some());
    assert_eq!(h.market.listings().len(), 1);
    assert_eq!(
        h.catalog().get("lamp").unwrap().remote_id.as_deref(),
        Some(old_id.as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn failed_delete_holds_back_the_republication_under_delete_then_create() {
    let h = Harness::with(|config| {
        config.retry.max_attempts = 2;
        config.publishing.replace_order = ReplaceOrder::DeleteThenCreate;
    });
    let old_id = due_lamp(&h);
    let hidden = h.config.selectors.delete_button.clone();
    h.market.configure(|faults| {
        faults.hidden_selectors.insert(hidden.clone());
    });
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(record(&report, "lamp", OperationKind::Delete).outcome.is_failure());
    assert!(matches!(
        record(&report, "lamp", OperationKind::Create).outcome,
        OperationOutcome::NotAttempted { reason: Some(_) }
    ));
    assert_eq!(h.market.listings().len(), 1);
    assert!(h.market.listing(&old_id).is_some());
}

#[tokio::test(start_paused = true)]
async fn listing_view_beyond_the_page_budget_aborts_instead_of_recreating() {
    let h = Harness::with(|config| config.reconcile.max_pages = 1);
    let market = h.market.clone().with_page_size(2);
    // Oldest listing, shown last on the management view.
    let lamp_id = market.seed_listing("Stehlampe aus Messing", "active");
    for title in ["Tisch", "Stuhl"] {
        market.seed_listing(title, "active");
    }
    h.write_ad(
        "lamp.yaml",
        &format!(
            "local_id: lamp\nid: {lamp_id}\ntitle: Stehlampe aus Messing\ndescription: Funktioniert einwandfrei.\nprice: 40\n"
        ),
    );
    h.mark_in_sync("lamp.yaml", "lamp");
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    let aborted = report.aborted.clone().unwrap();
    assert_eq!(aborted.category, FailureCategory::Validation);
    assert!(aborted.message.contains("max_pages"), "{}", aborted.message);
    assert!(report.records.is_empty());
    assert!(!report.exit_ok());
    assert_eq!(h.market.listings().len(), 3);
    assert_eq!(
        h.catalog().get("lamp").unwrap().remote_id.as_deref(),
        Some(lamp_id.as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn update_is_not_recorded_when_the_site_drops_the_description() {
    let h = Harness::with(|config| config.retry.max_attempts = 2);
    let lamp_id = h.market.seed_listing("Stehlampe aus Messing", "active");
    h.write_ad(
        "lamp.yaml",
        &format!(
            "local_id: lamp\nid: {lamp_id}\ntitle: Stehlampe aus Messing\ndescription: Funktioniert einwandfrei.\nprice: 40\n"
        ),
    );
    h.market.configure(|faults| faults.drop_description_edits = true);
    let reconciler = h.reconciler();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    let update = record(&report, "lamp", OperationKind::Update);
    match &update.outcome {
        OperationOutcome::Failed {
            category, message, ..
        } => {
            assert_eq!(*category, FailureCategory::UiTimeout);
            assert!(message.contains("description"), "{message}");
        }
        other => panic!("expected the update to fail verification, got {other:?}"),
    }
    assert!(!report.exit_ok());
    let listing = h.market.listing(&lamp_id).unwrap();
    assert_eq!(listing.price.as_deref(), Some("40"));
    assert!(listing.description.is_empty());
    let lamp = h.catalog();
    let lamp = lamp.get("lamp").unwrap();
    assert!(lamp.content_hash.is_none());
    assert!(lamp.updated_on.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_a_create_leaves_the_ad_file_without_an_id() {
    let h = Harness::new();
    h.write_ad("sofa.yaml", SOFA);
    let cancel = CancellationToken::new();
    h.market
        .configure(|faults| faults.cancel_after_submit = Some(cancel.clone()));
    let reconciler = Reconciler::builder(h.config.clone())
        .factory(Arc::new(h.market.clone()))
        .operator(Arc::new(UnattendedOperatorGate))
        .cancel(cancel.clone())
        .build()
        .unwrap();

    let report = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(matches!(
        record(&report, "sofa", OperationKind::Create).outcome,
        OperationOutcome::Failed {
            category: FailureCategory::Cancelled,
            ..
        } | OperationOutcome::NotAttempted { .. }
    ));
    assert_eq!(
        report.aborted.as_ref().map(|reason| reason.category),
        Some(FailureCategory::Cancelled)
    );
    assert!(!report.exit_ok());
    let body = fs::read_to_string(h.ad_path("sofa.yaml")).unwrap();
    assert!(!body.lines().any(|line| line.starts_with("id:")), "{body}");
    assert!(!body.contains("content_hash"));
    // The site did accept the form before the cancellation.
    assert_eq!(h.market.listings().len(), 1);

    h.market.configure(|faults| faults.cancel_after_submit = None);
    let next = h.reconciler().run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(next.exit_ok(), "{next:#?}");
    let update = record(&next, "sofa", OperationKind::Update);
    assert_eq!(update.operation.reason, ReasonCode::HashUnknown);
    assert_eq!(h.market.listings().len(), 1);
    assert!(h.catalog().get("sofa").unwrap().remote_id.is_some());
}

const SHIPPED_LAMP: &str = "local_id: lamp
title: Stehlampe aus Messing
description: Funktioniert einwandfrei.
price: 40
price_type: FIXED
shipping_type: SHIPPING
shipping_options:
  - Hermes_S
  - DHL_2
sell_directly: true
";

#[tokio::test(start_paused = true)]
async fn carrier_packages_are_picked_on_create_and_switched_on_update() {
    let h = Harness::new();
    h.write_ad("lamp.yaml", SHIPPED_LAMP);
    let reconciler = h.reconciler();

    let first = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(first.exit_ok(), "{first:#?}");
    let lamp_id = h.catalog().get("lamp").unwrap().remote_id.clone().unwrap();
    let listing = h.market.listing(&lamp_id).unwrap();
    assert_eq!(listing.shipping.as_deref(), Some("SHIPPING"));
    assert_eq!(listing.packages, vec!["Paket 2 kg".to_string(), "S-Paket".to_string()]);
    assert!(listing.sell_directly);

    let path = h.ad_path("lamp.yaml");
    let mut value: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    value["shipping_options"] = serde_yaml::to_value(vec!["Hermes_Päckchen"]).unwrap();
    value["sell_directly"] = serde_yaml::Value::Bool(false);
    fs::write(&path, serde_yaml::to_string(&value).unwrap()).unwrap();

    let second = reconciler.run_pass(&h.catalog(), &publish()).await.unwrap();
    assert!(second.exit_ok(), "{second:#?}");
    assert!(matches!(
        record(&second, "lamp", OperationKind::Update).outcome,
        OperationOutcome::Succeeded { .. }
    ));
    let listing = h.market.listing(&lamp_id).unwrap();
    assert_eq!(listing.packages, vec!["Päckchen".to_string()]);
    assert!(!listing.sell_directly);
}

#[tokio::test(start_paused = true)]
async fn downloaded_listings_become_ad_files_the_next_pass_leaves_alone() {
    let h = Harness::with(|config| {
        config.ads.files = vec!["ads/**/*.yaml".into(), "downloaded-ads/*.yaml".into()];
    });
    let sofa_id = h.market.seed_listing("Graues Ecksofa mit Schlaffunktion", "active");
    h.write_ad("sofa.yaml", &format!("{SOFA}id: {sofa_id}\n"));
    h.mark_in_sync("sofa.yaml", "sofa");
    let lamp_id = h.market.seed_listing_with("Stehlampe aus Messing", "active", |listing| {
        listing.description = "Funktioniert einwandfrei.".into();
        listing.price = Some("40".into());
        listing.price_type = Some("FIXED".into());
        listing.category = Some("80/88".into());
        listing.shipping = Some("SHIPPING".into());
        listing.shipping_costs = Some("5,49".into());
        listing.contact_name = Some("Alex".into());
        listing.contact_zipcode = Some("10115".into());
        listing.contact_street = Some("Invalidenstr. 1".into());
    });
    let reconciler = h.reconciler();

    let report = reconciler
        .download(&h.catalog(), &DownloadSelector::New)
        .await
        .unwrap();
    assert!(report.exit_ok(), "{report:#?}");
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].remote_id, lamp_id);
    let DownloadOutcome::Saved { path, content_hash: Some(_) } = &report.records[0].outcome else {
        panic!("expected a saved, valid ad: {report:#?}");
    };
    assert!(path.ends_with(format!("downloaded-ads/ad_{lamp_id}.yaml")));

    let catalog = h.catalog();
    assert!(catalog.errors.is_empty(), "{:?}", catalog.errors);
    let lamp = catalog.get(&format!("downloaded-ads/ad_{lamp_id}")).unwrap();
    assert_eq!(lamp.remote_id.as_deref(), Some(lamp_id.as_str()));
    assert_eq!(lamp.title, "Stehlampe aus Messing");
    assert_eq!(lamp.description, "Funktioniert einwandfrei.");
    assert_eq!(lamp.category.as_deref(), Some("80/88"));
    assert_eq!(lamp.price, Some(Price::from_minor(4_000)));
    assert_eq!(lamp.price_type, PriceType::Fixed);
    assert_eq!(lamp.shipping_type, ShippingType::Shipping);
    assert_eq!(lamp.shipping_costs, Some(Price::from_minor(549)));
    assert_eq!(lamp.contact.street.as_deref(), Some("Invalidenstr. 1"));
    assert_eq!(lamp.contact.zipcode.as_deref(), Some("10115"));
    assert_eq!(lamp.content_hash.as_deref(), Some(content_hash(lamp).as_str()));
    assert!(lamp.created_on.is_some());

    let pass = reconciler.run_pass(&catalog, &publish()).await.unwrap();
    assert!(pass.exit_ok(), "{pass:#?}");
    assert!(pass
        .planned
        .iter()
        .all(|operation| operation.kind == OperationKind::Skip));
    assert_eq!(h.market.listings().len(), 2);

    let again = reconciler.download(&catalog, &DownloadSelector::New).await.unwrap();
    assert!(again.records.is_empty());
}

#[tokio::test(start_paused = true)]
async fn downloading_an_id_the_site_does_not_show_fails_the_pass() {
    let h = Harness::new();
    let reconciler = h.reconciler();
    let report = reconciler
        .download(&h.catalog(), &DownloadSelector::Ids(vec!["2999999".into()]))
        .await
        .unwrap();
    assert_eq!(report.records[0].outcome, DownloadOutcome::NotFound);
    assert!(!report.exit_ok());
    assert!(!h.dir.path().join("downloaded-ads").exists());
}

