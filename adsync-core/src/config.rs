use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::ads::models::{AdType, Contact, PriceType, ShippingType};
use crate::error::{ConfigError, Result};

pub const USERNAME_ENV: &str = "ADSYNC_USERNAME";
pub const PASSWORD_ENV: &str = "ADSYNC_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AdsyncConfig {
    #[serde(default)]
    pub site: SiteSection,
    pub login: LoginSection,
    #[serde(default)]
    pub ads: AdsSection,
    #[serde(default)]
    pub selectors: SelectorSection,
    #[serde(default)]
    pub chromium: ChromiumSection,
    #[serde(default)]
    pub flags: FlagsSection,
    #[serde(default)]
    pub viewport: ViewportSection,
    #[serde(default)]
    pub human_simulation: HumanSimulationSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub publishing: PublishingSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
    /// Directory relative paths are resolved against; set by [`load_config`].
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl AdsyncConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Environment variables take precedence over the credentials in the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var(USERNAME_ENV) {
            if !username.trim().is_empty() {
                self.login.username = username;
            }
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                self.login.password = password;
            }
        }
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |message: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        };
        if self.login.username.trim().is_empty() {
            return Err(invalid("login.username must not be empty".into()));
        }
        if self.login.password.is_empty() {
            return Err(invalid("login.password must not be empty".into()));
        }
        if self.ads.files.is_empty() {
            return Err(invalid("ads.files must list at least one pattern".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be >= 1.0".into()));
        }
        if self.session.workers == 0 {
            return Err(invalid("session.workers must be at least 1".into()));
        }
        if url::Url::parse(&self.site.root_url).is_err() {
            return Err(invalid(format!(
                "site.root_url `{}` is not a valid URL",
                self.site.root_url
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteSection {
    pub root_url: String,
    pub login_path: String,
    pub post_path: String,
    pub edit_path: String,
    pub category_path: String,
    pub manage_path: String,
    /// Public listing page; the search redirects to the ad with this id.
    pub view_path: String,
    /// The search lands on an empty result page for unknown ids.
    pub view_missing_marker: String,
    pub confirmation_marker: String,
    pub login_page_marker: String,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            root_url: "https://www.kleinanzeigen.de".into(),
            login_path: "/m-einloggen.html?targetUrl=/".into(),
            post_path: "/p-anzeige-aufgeben-schritt2.html".into(),
            edit_path: "/p-anzeige-bearbeiten.html?adId={id}".into(),
            category_path: "/p-kategorie-aendern.html#?path={category}".into(),
            manage_path: "/m-meine-anzeigen.html".into(),
            view_path: "/s-suchanfrage.html?keywords={id}".into(),
            view_missing_marker: "k0".into(),
            confirmation_marker: "p-anzeige-aufgeben-bestaetigung.html?adId=".into(),
            login_page_marker: "m-einloggen".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginSection {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdsSection {
    pub files: Vec<String>,
    pub description_prefix: String,
    pub description_suffix: String,
    pub defaults: AdDefaults,
}

impl Default for AdsSection {
    fn default() -> Self {
        Self {
            files: vec!["ads/**/*.yaml".into(), "ads/**/*.yml".into()],
            description_prefix: String::new(),
            description_suffix: String::new(),
            defaults: AdDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdDefaults {
    pub active: bool,
    #[serde(rename = "type")]
    pub ad_type: AdType,
    pub price_type: PriceType,
    pub shipping_type: ShippingType,
    pub sell_directly: bool,
    pub contact: Contact,
    pub republication_interval: Option<u32>,
}

impl Default for AdDefaults {
    fn default() -> Self {
        Self {
            active: true,
            ad_type: AdType::Offer,
            price_type: PriceType::Negotiable,
            shipping_type: ShippingType::Shipping,
            sell_directly: false,
            contact: Contact::default(),
            republication_interval: None,
        }
    }
}

/// CSS selectors for the marketplace pages. Defaults track the live site.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub consent_accept: String,
    pub login_email: String,
    pub login_password: String,
    pub login_submit: String,
    pub logged_in_marker: String,
    pub invalid_credentials_marker: String,
    pub challenge_markers: Vec<String>,
    pub publish_challenge_marker: String,
    pub ad_limit_marker: String,
    pub ad_type_wanted: String,
    pub category_confirm: String,
    pub title: String,
    pub description: String,
    pub price_type: String,
    pub price: String,
    pub condition: String,
    pub shipping_pickup: String,
    pub shipping_enabled: String,
    pub shipping_costs: String,
    pub shipping_options_open: String,
    /// `{size}` is replaced by the package size.
    pub shipping_size: String,
    pub shipping_size_next: String,
    /// `{package}` is replaced by the carrier label.
    pub shipping_package: String,
    pub shipping_options_done: String,
    pub buy_now_yes: String,
    pub buy_now_no: String,
    pub contact_name: String,
    pub contact_street: String,
    pub contact_zipcode: String,
    pub contact_phone: String,
    pub image_input: String,
    pub image_preview: String,
    pub image_remove: String,
    pub submit: String,
    pub form_error: String,
    pub listing_item: String,
    pub listing_title: String,
    pub listing_id_attribute: String,
    pub listing_state_attribute: String,
    pub listing_updated_attribute: String,
    pub next_page: String,
    pub delete_button: String,
    pub delete_confirm: String,
    pub view_title: String,
    pub view_description: String,
    pub view_price: String,
    pub view_shipping: String,
    pub view_buy_now: String,
    pub view_breadcrumb_links: String,
    pub view_locality: String,
    pub view_street: String,
    pub view_contact_name: String,
    pub view_created: String,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            consent_accept: "#gdpr-banner-accept".into(),
            login_email: "#email".into(),
            login_password: "#password".into(),
            login_submit: "form#login-form button[type='submit']".into(),
            logged_in_marker: "#user-email".into(),
            invalid_credentials_marker: "#login-form .outcomebox-error".into(),
            challenge_markers: vec![
                "iframe[src*='captcha-delivery.com']".into(),
                "#login-device-verification".into(),
            ],
            publish_challenge_marker: "iframe[src^='https://www.google.com/recaptcha/api2/anchor?']"
                .into(),
            ad_limit_marker: "#postad-limit-reached".into(),
            ad_type_wanted: "#adType2".into(),
            category_confirm: "#postad-step1-sbmt button".into(),
            title: "#postad-title".into(),
            description: "#pstad-descrptn".into(),
            price_type: "select#priceType".into(),
            price: "input#pstad-price".into(),
            condition: "select[name*='condition_s']".into(),
            shipping_pickup: "#radio-pickup".into(),
            shipping_enabled: "#radio-shipping".into(),
            shipping_costs: "#postad-shipping-costs".into(),
            shipping_options_open: "button[aria-label*='Dialog mit Optionen öffnen']".into(),
            shipping_size: ".SingleSelectionItem--Main input[type=radio][data-testid='{size}']"
                .into(),
            shipping_size_next: "[class*='ModalDialog--Actions'] .Button-primary".into(),
            shipping_package: "[class*='CarrierOption--Main'][data-testid='{package}']".into(),
            shipping_options_done: "[class*='ModalDialog--Actions'] button[type='submit']".into(),
            buy_now_yes: "#radio-buy-now-yes".into(),
            buy_now_no: "#radio-buy-now-no".into(),
            contact_name: "#postad-contactname".into(),
            contact_street: "#pstad-street".into(),
            contact_zipcode: "#pstad-zip".into(),
            contact_phone: "#postad-phonenumber".into(),
            image_input: "input[type=file]".into(),
            image_preview: "ul#j-pictureupload-thumbnails li.ui-sortable-handle".into(),
            image_remove: "button.pictureupload-thumbnails-remove".into(),
            submit: "#pstad-submit".into(),
            form_error: ".formerror-message".into(),
            listing_item: "#my-manageitems-adlist li.cardbox".into(),
            listing_title: "h3 a".into(),
            listing_id_attribute: "data-adid".into(),
            listing_state_attribute: "data-state".into(),
            listing_updated_attribute: "data-updated".into(),
            next_page: ".Pagination button[aria-label='Nächste']:not([disabled])".into(),
            delete_button: "button.managead-listitem-action-delete".into(),
            delete_confirm: "#modal-bulk-delete-ad-sbmnt".into(),
            view_title: "#viewad-title".into(),
            view_description: "#viewad-description-text".into(),
            view_price: "#viewad-price".into(),
            view_shipping: ".boxedarticle--details--shipping".into(),
            view_buy_now: "#payment-buttons-sidebar".into(),
            view_breadcrumb_links: "#vap-brdcrmb a".into(),
            view_locality: "#viewad-locality".into(),
            view_street: "#street-address".into(),
            view_contact_name: "#viewad-contact .iconlist-text".into(),
            view_created: "#viewad-extra-info > div:nth-child(1) > span:nth-child(2)".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_data_dir: Option<String>,
    pub profile_ttl_hours: u64,
    pub request_timeout_seconds: u64,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: false,
            sandbox: true,
            disable_gpu: false,
            user_data_dir: None,
            profile_ttl_hours: 24,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub lang: Option<String>,
    pub extra_arguments: Vec<String>,
}

impl Default for FlagsSection {
    fn default() -> Self {
        Self {
            no_first_run: true,
            lang: Some("de-DE".into()),
            extra_arguments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewportSection {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Default for ViewportSection {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 900,
            device_scale_factor: 1.0,
        }
    }
}

/// Pacing for typed input and clicks on the real site.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HumanSimulationSection {
    pub enabled: bool,
    pub click_hesitation_ms: [u32; 2],
    pub typing_cadence_cpm: [u32; 2],
    pub typing_jitter_ms: [u32; 2],
    pub step_pause_ms: [u32; 2],
}

impl Default for HumanSimulationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            click_hesitation_ms: [120, 450],
            typing_cadence_cpm: [280, 420],
            typing_jitter_ms: [15, 45],
            step_pause_ms: [300, 900],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Shared,
    PerWorker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengePolicy {
    Pause,
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub mode: SessionMode,
    pub workers: usize,
    pub challenge_policy: ChallengePolicy,
    pub manual_intervention_timeout_seconds: u64,
    pub element_timeout_seconds: u64,
    pub login_timeout_seconds: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            mode: SessionMode::Shared,
            workers: 1,
            challenge_policy: ChallengePolicy::Pause,
            manual_intervention_timeout_seconds: 600,
            element_timeout_seconds: 15,
            login_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub delete_orphans: bool,
    pub republish: bool,
    pub ui_timeout_abort_threshold: usize,
    pub max_pages: usize,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            delete_orphans: false,
            republish: true,
            ui_timeout_abort_threshold: 3,
            max_pages: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    #[default]
    CreateThenDelete,
    DeleteThenCreate,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublishingSection {
    pub replace_order: ReplaceOrder,
}

/// Where `download` writes ad files for listings fetched from the site.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub dir: String,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            dir: "downloaded-ads".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub metrics_db: String,
    pub ledger_db: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            failure_log: ".adsync/failures.jsonl".into(),
            metrics_db: ".adsync/telemetry.sqlite".into(),
            ledger_db: ".adsync/ledger.sqlite".into(),
        }
    }
}

/// Loads `adsync.toml`, applies credential overrides and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AdsyncConfig> {
    let path = path.as_ref();
    let mut config: AdsyncConfig = load_toml(path)?;
    config.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.apply_env_overrides();
    config.validate(path)?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/adsync.toml");
        let config: AdsyncConfig = load_toml(&path).expect("fixture should parse");
        assert_eq!(config.login.username, "seller@example.com");
        assert_eq!(config.session.mode, SessionMode::Shared);
        assert_eq!(config.session.challenge_policy, ChallengePolicy::Pause);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.publishing.replace_order,
            ReplaceOrder::CreateThenDelete
        );
        assert_eq!(config.ads.files, vec!["ads/**/*.yaml".to_string()]);
        assert_eq!(config.selectors.title, "#postad-title");
        assert_eq!(config.download.dir, "downloaded-ads");
        assert!(config.validate(&path).is_ok());
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let path = Path::new("adsync.toml");
        let config: AdsyncConfig = toml::from_str("[login]\nusername = \"\"\n").unwrap();
        let err = config.validate(path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("login.username"));
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let mut config: AdsyncConfig =
            toml::from_str("[login]\nusername = \"a\"\npassword = \"b\"\n").unwrap();
        config.base_dir = PathBuf::from("/srv/adsync");
        assert_eq!(
            config.resolve_path(".adsync/ledger.sqlite"),
            PathBuf::from("/srv/adsync/.adsync/ledger.sqlite")
        );
        assert_eq!(config.resolve_path("/tmp/x"), PathBuf::from("/tmp/x"));
    }
}
