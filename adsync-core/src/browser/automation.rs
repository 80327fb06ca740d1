use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AdsyncConfig, ChromiumSection, FlagsSection, ViewportSection};

use super::driver::{BrowserDriver, DriverFactory, ElementHandle};
use super::error::{BrowserError, BrowserResult};
use super::human::InputPacer;
use super::profile::{BrowserProfile, ProfileManager};

/// Chromium launch settings taken from the config file.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub viewport: ViewportSection,
}

#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    settings: Arc<LaunchSettings>,
    profiles: ProfileManager,
}

impl BrowserLauncher {
    pub fn new(settings: LaunchSettings, profiles: ProfileManager) -> Self {
        Self {
            settings: Arc::new(settings),
            profiles,
        }
    }

    pub fn from_config(config: &AdsyncConfig) -> BrowserResult<Self> {
        let user_data_dir = config
            .chromium
            .user_data_dir
            .as_ref()
            .map(|dir| config.resolve_path(dir));
        let profiles = ProfileManager::from_config(&config.chromium, user_data_dir)?;
        Ok(Self::new(
            LaunchSettings {
                chromium: config.chromium.clone(),
                flags: config.flags.clone(),
                viewport: config.viewport.clone(),
            },
            profiles,
        ))
    }

    pub fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    pub fn profile_manager(&self) -> &ProfileManager {
        &self.profiles
    }

    pub async fn launch(&self, slot: usize) -> BrowserResult<BrowserAutomation> {
        let removed = self.profiles.cleanup_expired()?;
        if removed > 0 {
            debug!(removed, "removed expired browser profiles");
        }
        let profile = self.profiles.allocate(slot)?;
        let chromium_config = self.build_chromium_config(&profile)?;
        info!(
            profile = %profile.id(),
            persistent = self.profiles.is_persistent(),
            headless = self.settings.chromium.headless,
            "Launching Chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        profile.touch().await?;

        Ok(BrowserAutomation {
            browser,
            profile,
            handler_task: Some(handler_task),
        })
    }

    fn build_chromium_config(&self, profile: &BrowserProfile) -> BrowserResult<ChromiumConfig> {
        let LaunchSettings {
            chromium,
            flags,
            viewport,
        } = self.settings.as_ref();

        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile.path())
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(viewport.device_scale_factor),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            });

        if let Some(executable) = &chromium.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !chromium.headless {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if chromium.request_timeout_seconds > 0 {
            builder = builder.request_timeout(Duration::from_secs(chromium.request_timeout_seconds));
        }

        let mut args = vec![format!(
            "--window-size={},{}",
            viewport.width, viewport.height
        )];
        if chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(lang) = &flags.lang {
            args.push(format!("--lang={lang}"));
        }
        if flags.no_first_run {
            args.push("--no-first-run".into());
        }
        args.push("--password-store=basic".into());
        args.extend(flags.extra_arguments.iter().cloned());

        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

#[derive(Debug)]
pub struct BrowserAutomation {
    browser: Browser,
    profile: BrowserProfile,
    handler_task: Option<JoinHandle<()>>,
}

impl BrowserAutomation {
    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    pub async fn new_page(&self) -> BrowserResult<Page> {
        Ok(self.browser.new_page("about:blank").await?)
    }

    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!(profile = %self.profile.id(), "Shutting down Chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(
                    profile = %self.profile.id(),
                    "BrowserAutomation dropped without explicit shutdown"
                );
            }
        }
    }
}

const CLEAR_VALUE_JS: &str = "function() { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); }";

/// [`BrowserDriver`] over a single Chromium tab.
pub struct ChromiumDriver {
    automation: AsyncMutex<Option<BrowserAutomation>>,
    page: Page,
    elements: Mutex<HashMap<u64, Arc<Element>>>,
    next_handle: AtomicU64,
    pacer: InputPacer,
}

impl ChromiumDriver {
    pub async fn start(automation: BrowserAutomation, pacer: InputPacer) -> BrowserResult<Self> {
        let page = automation.new_page().await?;
        Ok(Self {
            automation: AsyncMutex::new(Some(automation)),
            page,
            elements: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            pacer,
        })
    }

    fn register(&self, selector: &str, element: Element) -> BrowserResult<ElementHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut elements = self
            .elements
            .lock()
            .map_err(|_| BrowserError::Unexpected("element registry poisoned".into()))?;
        elements.insert(id, Arc::new(element));
        Ok(ElementHandle {
            id,
            selector: selector.to_string(),
        })
    }

    fn element(&self, handle: &ElementHandle) -> BrowserResult<Arc<Element>> {
        let elements = self
            .elements
            .lock()
            .map_err(|_| BrowserError::Unexpected("element registry poisoned".into()))?;
        elements
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| BrowserError::StaleElement(handle.selector.clone()))
    }

    fn forget_elements(&self) {
        if let Ok(mut elements) = self.elements.lock() {
            elements.clear();
        }
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        self.forget_elements();
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page
            .goto(params)
            .await
            .map_err(|err| BrowserError::Network(format!("navigation to {url} failed: {err}")))?;
        self.page.wait_for_navigation().await?;
        self.pacer.step_pause().await;
        Ok(())
    }

    async fn find(&self, selector: &str) -> BrowserResult<Option<ElementHandle>> {
        let mut found = self.page.find_elements(selector).await.unwrap_or_default();
        if found.is_empty() {
            return Ok(None);
        }
        let element = found.swap_remove(0);
        self.register(selector, element).map(Some)
    }

    async fn find_all(&self, selector: &str) -> BrowserResult<Vec<ElementHandle>> {
        let found = self.page.find_elements(selector).await.unwrap_or_default();
        found
            .into_iter()
            .map(|element| self.register(selector, element))
            .collect()
    }

    async fn find_within(
        &self,
        parent: &ElementHandle,
        selector: &str,
    ) -> BrowserResult<Option<ElementHandle>> {
        let parent = self.element(parent)?;
        let mut found = parent.find_elements(selector).await.unwrap_or_default();
        if found.is_empty() {
            return Ok(None);
        }
        let element = found.swap_remove(0);
        self.register(selector, element).map(Some)
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> BrowserResult<()> {
        let target = self.element(element)?;
        self.pacer.hesitate().await;
        target.click().await?;
        target.call_js_fn(CLEAR_VALUE_JS, false).await?;
        self.pacer.type_text(&target, text).await
    }

    async fn select(&self, element: &ElementHandle, value: &str) -> BrowserResult<()> {
        let target = self.element(element)?;
        let literal = serde_json::to_string(value)
            .map_err(|err| BrowserError::Unexpected(format!("failed to encode value: {err}")))?;
        let function = format!(
            "function() {{ this.value = {literal}; this.dispatchEvent(new Event('change', {{ bubbles: true }})); }}"
        );
        self.pacer.hesitate().await;
        target.call_js_fn(function, false).await?;
        Ok(())
    }

    async fn click(&self, element: &ElementHandle) -> BrowserResult<()> {
        let target = self.element(element)?;
        self.pacer.hesitate().await;
        target.click().await?;
        Ok(())
    }

    async fn upload(&self, element: &ElementHandle, file: &Path) -> BrowserResult<()> {
        let target = self.element(element)?;
        let absolute = std::fs::canonicalize(file)?;
        let params = SetFileInputFilesParams::builder()
            .files(vec![absolute.to_string_lossy().into_owned()])
            .backend_node_id(target.backend_node_id)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn read_text(&self, element: &ElementHandle) -> BrowserResult<String> {
        let target = self.element(element)?;
        Ok(target.inner_text().await?.unwrap_or_default())
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        let target = self.element(element)?;
        Ok(target.attribute(name).await?)
    }

    async fn close(&self) -> BrowserResult<()> {
        self.forget_elements();
        if let Some(automation) = self.automation.lock().await.take() {
            automation.shutdown().await?;
        }
        Ok(())
    }
}

/// Launches one Chromium per opened session.
///
/// Slots cycle over `slots` so persistent profiles map onto a fixed set of
/// per-worker directories.
pub struct ChromiumDriverFactory {
    launcher: BrowserLauncher,
    pacer: InputPacer,
    slots: usize,
    next_slot: AtomicUsize,
}

impl ChromiumDriverFactory {
    pub fn new(launcher: BrowserLauncher, pacer: InputPacer, slots: usize) -> Self {
        Self {
            launcher,
            pacer,
            slots: slots.max(1),
            next_slot: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &AdsyncConfig) -> BrowserResult<Self> {
        let launcher = BrowserLauncher::from_config(config)?;
        let pacer = InputPacer::new(config.human_simulation.clone());
        Ok(Self::new(launcher, pacer, config.session.workers))
    }
}

#[async_trait]
impl DriverFactory for ChromiumDriverFactory {
    async fn open(&self) -> BrowserResult<Arc<dyn BrowserDriver>> {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots;
        let automation = self.launcher.launch(slot).await?;
        let driver = ChromiumDriver::start(automation, self.pacer.clone()).await?;
        Ok(Arc::new(driver))
    }
}
