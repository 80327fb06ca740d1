//! In-memory marketplace speaking the same selectors and URLs as the real site.
//!
//! Used by the test-suite and by `adsyncctl --simulate`. Faults (flaky network,
//! rejected uploads, login challenges, expiring sessions, missing elements)
//! are injected through [`FaultPlan`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::driver::{BrowserDriver, DriverFactory, ElementHandle, WaitCondition, WaitOutcome};
use super::error::{BrowserError, BrowserResult};
use super::site::SiteMap;
use crate::ads::models::packages_of_size;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulatedListing {
    pub id: String,
    pub title: String,
    pub description: String,
    pub price: Option<String>,
    pub price_type: Option<String>,
    pub category: Option<String>,
    /// `PICKUP` or `SHIPPING`.
    pub shipping: Option<String>,
    pub shipping_costs: Option<String>,
    pub packages: Vec<String>,
    pub sell_directly: bool,
    pub contact_name: Option<String>,
    pub contact_street: Option<String>,
    pub contact_zipcode: Option<String>,
    pub status: String,
    pub images: usize,
    /// Shown on the public page as `dd.mm.yyyy`.
    pub created: Option<String>,
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// The next N navigations fail with a network error.
    pub transient_navigation_failures: usize,
    pub reject_image_uploads: bool,
    pub challenge_on_login: bool,
    pub reject_credentials: bool,
    pub ad_limit_reached: bool,
    pub form_error: Option<String>,
    /// Selectors that never appear, as after a site redesign.
    pub hidden_selectors: HashSet<String>,
    /// Logs every browser out once this many further navigations happened.
    pub expire_sessions_after_navigations: Option<usize>,
    /// Edits are confirmed but the description keeps its old text.
    pub drop_description_edits: bool,
    /// Cancelled right after the site accepted a submitted form, as when
    /// the operator hits Ctrl-C while the confirmation page loads.
    pub cancel_after_submit: Option<CancellationToken>,
}

#[derive(Debug)]
struct MarketState {
    username: String,
    password: String,
    listings: BTreeMap<u64, SimulatedListing>,
    next_id: u64,
    page_size: usize,
    faults: FaultPlan,
    epoch: u64,
    challenge_solved: bool,
    log: Vec<String>,
    logins: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Page {
    Blank,
    Home,
    Login,
    PostForm,
    EditForm(u64),
    Category(String),
    Confirmation(u64),
    Manage,
    /// Public page of a listing, reachable without a session.
    View(u64),
    NotFound,
}

#[derive(Debug, Clone)]
struct Node {
    selector: String,
    listing: Option<u64>,
    /// Position among siblings: image previews, breadcrumb links.
    index: Option<usize>,
}

#[derive(Debug)]
struct Tab {
    url: String,
    page: Page,
    session_epoch: Option<u64>,
    consent_accepted: bool,
    awaiting_challenge: bool,
    invalid_login: bool,
    form: HashMap<String, String>,
    shipping_size: Option<String>,
    packages: BTreeSet<String>,
    images: usize,
    category: Option<String>,
    form_error: Option<String>,
    manage_page: usize,
    pending_delete: Option<u64>,
    handles: HashMap<u64, Node>,
    next_handle: u64,
    closed: bool,
}

impl Tab {
    fn new() -> Self {
        Self {
            url: "about:blank".into(),
            page: Page::Blank,
            session_epoch: None,
            consent_accepted: false,
            awaiting_challenge: false,
            invalid_login: false,
            form: HashMap::new(),
            shipping_size: None,
            packages: BTreeSet::new(),
            images: 0,
            category: None,
            form_error: None,
            manage_page: 0,
            pending_delete: None,
            handles: HashMap::new(),
            next_handle: 1,
            closed: false,
        }
    }

    fn reset_form(&mut self) {
        self.form.clear();
        self.shipping_size = None;
        self.packages.clear();
        self.images = 0;
        self.category = None;
        self.form_error = None;
    }

    fn register(&mut self, node: Node) -> ElementHandle {
        let id = self.next_handle;
        self.next_handle += 1;
        let handle = ElementHandle {
            id,
            selector: node.selector.clone(),
        };
        self.handles.insert(id, node);
        handle
    }

    fn node(&self, handle: &ElementHandle) -> BrowserResult<Node> {
        self.handles
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| BrowserError::StaleElement(handle.selector.clone()))
    }
}

/// Shared marketplace state; every driver opened from it sees the same listings.
#[derive(Clone)]
pub struct SimulatedMarketplace {
    site: Arc<SiteMap>,
    state: Arc<Mutex<MarketState>>,
}

impl SimulatedMarketplace {
    pub fn new(site: SiteMap, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            site: Arc::new(site),
            state: Arc::new(Mutex::new(MarketState {
                username: username.into(),
                password: password.into(),
                listings: BTreeMap::new(),
                next_id: 2_000_001,
                page_size: 25,
                faults: FaultPlan::default(),
                epoch: 0,
                challenge_solved: false,
                log: Vec::new(),
                logins: 0,
            })),
        }
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MarketState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds a listing as if it had been published by hand. Returns its id.
    pub fn seed_listing(&self, title: &str, status: &str) -> String {
        self.seed_listing_with(title, status, |_| {})
    }

    pub fn seed_listing_with(
        &self,
        title: &str,
        status: &str,
        details: impl FnOnce(&mut SimulatedListing),
    ) -> String {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let mut listing = SimulatedListing {
            id: id.to_string(),
            title: title.to_string(),
            status: status.to_string(),
            created: Some(Utc::now().format("%d.%m.%Y").to_string()),
            ..SimulatedListing::default()
        };
        details(&mut listing);
        state.listings.insert(id, listing);
        id.to_string()
    }

    pub fn listings(&self) -> Vec<SimulatedListing> {
        self.lock().listings.values().cloned().collect()
    }

    pub fn listing(&self, id: &str) -> Option<SimulatedListing> {
        let id: u64 = id.parse().ok()?;
        self.lock().listings.get(&id).cloned()
    }

    pub fn configure(&self, update: impl FnOnce(&mut FaultPlan)) {
        update(&mut self.lock().faults);
    }

    pub fn expire_sessions(&self) {
        self.lock().epoch += 1;
    }

    /// Plays the operator who solves a pending login challenge.
    pub fn solve_challenge(&self) {
        self.lock().challenge_solved = true;
    }

    /// Mutations in order: `login`, `create <id>`, `update <id>`, `delete <id>`.
    pub fn action_log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn login_count(&self) -> usize {
        self.lock().logins
    }

    pub fn driver(&self) -> SimulatedDriver {
        SimulatedDriver {
            site: Arc::clone(&self.site),
            market: Arc::clone(&self.state),
            tab: Mutex::new(Tab::new()),
        }
    }
}

#[async_trait]
impl DriverFactory for SimulatedMarketplace {
    async fn open(&self) -> BrowserResult<Arc<dyn BrowserDriver>> {
        Ok(Arc::new(self.driver()))
    }
}

/// One browser tab on the simulated site.
pub struct SimulatedDriver {
    site: Arc<SiteMap>,
    market: Arc<Mutex<MarketState>>,
    tab: Mutex<Tab>,
}

fn route_key(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

/// The text filled into the `{placeholder}` of `template`, when `selector` instantiates it.
fn template_value<'a>(template: &str, selector: &'a str) -> Option<&'a str> {
    let open = template.find('{')?;
    let close = open + template[open..].find('}')?;
    selector
        .strip_prefix(&template[..open])?
        .strip_suffix(&template[close + 1..])
}

fn size_of_package(package: &str) -> Option<&'static str> {
    ["Klein", "Mittel", "Groß"]
        .into_iter()
        .find(|size| packages_of_size(size).any(|own| own == package))
}

fn price_text(listing: &SimulatedListing) -> Option<String> {
    let price = listing.price.as_deref();
    match (listing.price_type.as_deref(), price) {
        (Some("GIVE_AWAY"), _) => Some("Zu verschenken".into()),
        (Some("NEGOTIABLE"), Some(price)) => Some(format!("{price} € VB")),
        (Some("NEGOTIABLE"), None) => Some("VB".into()),
        (_, Some(price)) => Some(format!("{price} €")),
        (_, None) => None,
    }
}

fn shipping_text(listing: &SimulatedListing) -> Option<String> {
    match (listing.shipping.as_deref(), listing.shipping_costs.as_deref()) {
        (Some("PICKUP"), _) => Some("Nur Abholung".into()),
        (Some("SHIPPING"), Some(costs)) => Some(format!("+ Versand ab {costs} €")),
        (Some("SHIPPING"), None) => Some("Versand möglich".into()),
        _ => None,
    }
}

fn query_value<'a>(url: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("{key}=");
    let start = url.find(&marker)? + marker.len();
    let tail = &url[start..];
    let end = tail.find(['&', '#']).unwrap_or(tail.len());
    Some(&tail[..end])
}

impl SimulatedDriver {
    /// Locks market then tab, always in that order.
    fn with_state<T>(&self, f: impl FnOnce(&mut MarketState, &mut Tab) -> BrowserResult<T>) -> BrowserResult<T> {
        let mut market = self
            .market
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut tab = self
            .tab
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if tab.closed {
            return Err(BrowserError::Unexpected("browser context closed".into()));
        }
        self.refresh(&mut market, &mut tab);
        f(&mut market, &mut tab)
    }

    fn logged_in(market: &MarketState, tab: &Tab) -> bool {
        tab.session_epoch == Some(market.epoch)
    }

    fn refresh(&self, market: &mut MarketState, tab: &mut Tab) {
        if tab.awaiting_challenge && market.challenge_solved {
            tab.awaiting_challenge = false;
            self.complete_login(market, tab);
        }
    }

    fn complete_login(&self, market: &mut MarketState, tab: &mut Tab) {
        tab.session_epoch = Some(market.epoch);
        tab.page = Page::Home;
        tab.url = self.site.root_url();
        tab.handles.clear();
        market.logins += 1;
        market.log.push("login".into());
    }

    fn path_of<'a>(&self, url: &'a str) -> &'a str {
        let root = self.site.paths.root_url.trim_end_matches('/');
        url.strip_prefix(root).unwrap_or(url)
    }

    fn route(&self, market: &mut MarketState, tab: &mut Tab, url: &str) {
        let paths = &self.site.paths;
        let path = self.path_of(url);
        let key = route_key(path);
        tab.url = url.to_string();
        tab.handles.clear();
        tab.form_error = None;

        if key == route_key(&paths.login_path) {
            tab.page = Page::Login;
            tab.invalid_login = false;
            tab.awaiting_challenge = false;
            tab.form.clear();
            return;
        }
        if key.is_empty() || key == "/" {
            tab.page = Page::Home;
            return;
        }
        if key == route_key(&paths.view_path) {
            let id = query_value(path, "keywords")
                .and_then(|id| id.parse::<u64>().ok())
                .filter(|id| market.listings.contains_key(id));
            match id {
                Some(id) => {
                    tab.page = Page::View(id);
                    tab.url = format!("{}/s-anzeige/{id}", paths.root_url.trim_end_matches('/'));
                }
                None => {
                    tab.page = Page::NotFound;
                    tab.url = format!(
                        "{}/s-{}/{}",
                        paths.root_url.trim_end_matches('/'),
                        query_value(path, "keywords").unwrap_or_default(),
                        paths.view_missing_marker
                    );
                }
            }
            return;
        }
        let protected = [
            route_key(&paths.post_path),
            route_key(&paths.edit_path),
            route_key(&paths.category_path),
            route_key(&paths.manage_path),
        ];
        if !protected.contains(&key) {
            tab.page = Page::NotFound;
            return;
        }
        if !Self::logged_in(market, tab) {
            tab.page = Page::Login;
            tab.url = self.site.login_url();
            tab.form.clear();
            return;
        }
        if key == route_key(&paths.post_path) {
            tab.page = Page::PostForm;
            tab.reset_form();
        } else if key == route_key(&paths.edit_path) {
            let listing = query_value(path, "adId")
                .and_then(|id| id.parse::<u64>().ok())
                .and_then(|id| market.listings.get(&id).map(|listing| (id, listing.clone())));
            match listing {
                Some((id, listing)) => {
                    tab.reset_form();
                    let s = &self.site.selectors;
                    tab.form.insert(s.title.clone(), listing.title);
                    tab.form.insert(s.description.clone(), listing.description);
                    if let Some(price) = listing.price {
                        tab.form.insert(s.price.clone(), price);
                    }
                    if listing.shipping.as_deref() == Some("SHIPPING") {
                        tab.form.insert("shipping".into(), s.shipping_enabled.clone());
                    }
                    if listing.sell_directly {
                        tab.form.insert("buy_now".into(), "yes".into());
                    }
                    for (selector, value) in [
                        (&s.price_type, &listing.price_type),
                        (&s.shipping_costs, &listing.shipping_costs),
                        (&s.contact_name, &listing.contact_name),
                        (&s.contact_street, &listing.contact_street),
                        (&s.contact_zipcode, &listing.contact_zipcode),
                    ] {
                        if let Some(value) = value {
                            tab.form.insert(selector.clone(), value.clone());
                        }
                    }
                    tab.shipping_size = listing
                        .packages
                        .first()
                        .and_then(|package| size_of_package(package))
                        .map(str::to_string);
                    tab.packages = listing.packages.iter().cloned().collect();
                    tab.images = listing.images;
                    tab.category = listing.category;
                    tab.page = Page::EditForm(id);
                }
                None => tab.page = Page::NotFound,
            }
        } else if key == route_key(&paths.category_path) {
            let category = query_value(path, "path").unwrap_or_default().to_string();
            tab.page = Page::Category(category);
        } else {
            tab.page = Page::Manage;
            tab.manage_page = 0;
            tab.pending_delete = None;
        }
    }

    fn manage_rows(market: &MarketState, tab: &Tab) -> (Vec<u64>, bool) {
        let ids: Vec<u64> = market.listings.keys().rev().copied().collect();
        let start = tab.manage_page * market.page_size;
        let rows = ids.iter().skip(start).take(market.page_size).copied().collect();
        let more = ids.len() > start + market.page_size;
        (rows, more)
    }

    fn is_form_field(&self, selector: &str) -> bool {
        let s = &self.site.selectors;
        if template_value(&s.shipping_size, selector)
            .is_some_and(|size| packages_of_size(size).next().is_some())
        {
            return true;
        }
        [
            &s.title,
            &s.description,
            &s.price_type,
            &s.price,
            &s.condition,
            &s.shipping_pickup,
            &s.shipping_enabled,
            &s.shipping_costs,
            &s.shipping_options_open,
            &s.shipping_size_next,
            &s.shipping_options_done,
            &s.buy_now_yes,
            &s.buy_now_no,
            &s.contact_name,
            &s.contact_street,
            &s.contact_zipcode,
            &s.contact_phone,
            &s.image_input,
            &s.submit,
        ]
        .iter()
        .any(|candidate| candidate.as_str() == selector)
            || selector.starts_with("[name*='")
    }

    fn nodes(&self, market: &MarketState, tab: &Tab, selector: &str) -> Vec<Node> {
        if market.faults.hidden_selectors.contains(selector) {
            return Vec::new();
        }
        let s = &self.site.selectors;
        let single = || {
            vec![Node {
                selector: selector.to_string(),
                listing: None,
                index: None,
            }]
        };
        if selector == s.logged_in_marker {
            let visible = Self::logged_in(market, tab)
                && !matches!(tab.page, Page::Login | Page::Blank);
            return if visible { single() } else { Vec::new() };
        }
        match &tab.page {
            Page::Login => {
                let present = (selector == s.consent_accept && !tab.consent_accepted)
                    || selector == s.login_email
                    || selector == s.login_password
                    || selector == s.login_submit
                    || (selector == s.invalid_credentials_marker && tab.invalid_login)
                    || (tab.awaiting_challenge
                        && s.challenge_markers.first().map(String::as_str) == Some(selector));
                if present {
                    single()
                } else {
                    Vec::new()
                }
            }
            Page::PostForm | Page::EditForm(_) => {
                let is_post = tab.page == Page::PostForm;
                if selector == s.image_preview {
                    return (0..tab.images)
                        .map(|index| Node {
                            selector: selector.to_string(),
                            listing: None,
                            index: Some(index),
                        })
                        .collect();
                }
                let package_offered = template_value(&s.shipping_package, selector).is_some_and(|package| {
                    tab.shipping_size
                        .as_deref()
                        .is_some_and(|size| packages_of_size(size).any(|own| own == package))
                });
                let present = self.is_form_field(selector)
                    || package_offered
                    || (is_post && selector == s.ad_type_wanted)
                    || (is_post && selector == s.ad_limit_marker && market.faults.ad_limit_reached)
                    || (selector == s.form_error && tab.form_error.is_some());
                if present {
                    single()
                } else {
                    Vec::new()
                }
            }
            Page::Category(_) if selector == s.category_confirm => single(),
            Page::View(id) => {
                let Some(listing) = market.listings.get(id) else {
                    return Vec::new();
                };
                let node = |index| Node {
                    selector: selector.to_string(),
                    listing: Some(*id),
                    index,
                };
                if selector == s.view_breadcrumb_links {
                    let crumbs = 1 + listing.category.as_deref().map_or(0, |c| c.split('/').count());
                    return (0..crumbs).map(|index| node(Some(index))).collect();
                }
                let present = selector == s.view_title
                    || selector == s.view_description
                    || (selector == s.view_price && price_text(listing).is_some())
                    || (selector == s.view_shipping && shipping_text(listing).is_some())
                    || (selector == s.view_buy_now && listing.sell_directly)
                    || (selector == s.view_locality && listing.contact_zipcode.is_some())
                    || (selector == s.view_street && listing.contact_street.is_some())
                    || (selector == s.view_contact_name && listing.contact_name.is_some())
                    || (selector == s.view_created && listing.created.is_some());
                if present {
                    vec![node(None)]
                } else {
                    Vec::new()
                }
            }
            Page::Manage => {
                if selector == s.listing_item {
                    let (rows, _) = Self::manage_rows(market, tab);
                    return rows
                        .into_iter()
                        .map(|id| Node {
                            selector: selector.to_string(),
                            listing: Some(id),
                            index: None,
                        })
                        .collect();
                }
                if selector == s.next_page && Self::manage_rows(market, tab).1 {
                    return single();
                }
                if selector == s.delete_confirm && tab.pending_delete.is_some() {
                    return single();
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Text of a node tied to a listing, on the manage view or the public page.
    fn listing_text(&self, listing: &SimulatedListing, selector: &str) -> String {
        let s = &self.site.selectors;
        let text = if selector == s.view_description {
            Some(listing.description.clone())
        } else if selector == s.view_price {
            price_text(listing)
        } else if selector == s.view_shipping {
            shipping_text(listing)
        } else if selector == s.view_buy_now {
            Some("Direkt kaufen".into())
        } else if selector == s.view_locality {
            listing
                .contact_zipcode
                .as_ref()
                .map(|zipcode| format!("{zipcode} Berlin - Mitte"))
        } else if selector == s.view_street {
            listing.contact_street.as_ref().map(|street| format!("{street},"))
        } else if selector == s.view_contact_name {
            listing.contact_name.clone()
        } else if selector == s.view_created {
            listing.created.clone()
        } else {
            Some(listing.title.clone())
        };
        text.unwrap_or_default()
    }

    fn submit_login(&self, market: &mut MarketState, tab: &mut Tab) {
        let s = &self.site.selectors;
        let email = tab.form.get(&s.login_email).cloned().unwrap_or_default();
        let password = tab.form.get(&s.login_password).cloned().unwrap_or_default();
        tab.handles.clear();
        if market.faults.reject_credentials || email != market.username || password != market.password {
            tab.invalid_login = true;
            return;
        }
        if market.faults.challenge_on_login && !market.challenge_solved {
            tab.awaiting_challenge = true;
            return;
        }
        self.complete_login(market, tab);
    }

    fn submit_form(&self, market: &mut MarketState, tab: &mut Tab) {
        if let Some(message) = market.faults.form_error.clone() {
            tab.form_error = Some(message);
            return;
        }
        let s = &self.site.selectors;
        let value = |selector: &str| tab.form.get(selector).cloned();
        let now = Utc::now();
        let shipping = match value("shipping") {
            Some(clicked) if clicked == s.shipping_enabled => Some("SHIPPING".to_string()),
            Some(clicked) if clicked == s.shipping_pickup => Some("PICKUP".to_string()),
            _ => None,
        };
        let shipping_costs = value(&s.shipping_costs).filter(|_| shipping.as_deref() == Some("SHIPPING"));
        let apply = |listing: &mut SimulatedListing| {
            listing.title = value(&s.title).unwrap_or_default();
            listing.price = value(&s.price);
            listing.price_type = value(&s.price_type);
            listing.shipping = shipping.clone();
            listing.shipping_costs = shipping_costs.clone();
            listing.packages = tab.packages.iter().cloned().collect();
            listing.sell_directly = value("buy_now").as_deref() == Some("yes");
            listing.contact_name = value(&s.contact_name);
            listing.contact_street = value(&s.contact_street);
            listing.contact_zipcode = value(&s.contact_zipcode);
            listing.images = tab.images;
            listing.updated = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
        };
        let id = match tab.page {
            Page::PostForm => {
                let id = market.next_id;
                market.next_id += 1;
                let mut listing = SimulatedListing {
                    id: id.to_string(),
                    description: value(&s.description).unwrap_or_default(),
                    category: tab.category.clone(),
                    status: "active".into(),
                    created: Some(now.format("%d.%m.%Y").to_string()),
                    ..SimulatedListing::default()
                };
                apply(&mut listing);
                market.listings.insert(id, listing);
                market.log.push(format!("create {id}"));
                id
            }
            Page::EditForm(id) => {
                let drop_description = market.faults.drop_description_edits;
                if let Some(listing) = market.listings.get_mut(&id) {
                    apply(listing);
                    if !drop_description {
                        listing.description = value(&s.description).unwrap_or_default();
                    }
                }
                market.log.push(format!("update {id}"));
                id
            }
            _ => return,
        };
        if let Some(cancel) = &market.faults.cancel_after_submit {
            cancel.cancel();
        }
        tab.handles.clear();
        tab.page = Page::Confirmation(id);
        tab.url = format!(
            "{}/{}{}",
            self.site.paths.root_url.trim_end_matches('/'),
            self.site.paths.confirmation_marker,
            id
        );
    }
}

#[async_trait]
impl BrowserDriver for SimulatedDriver {
    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        self.with_state(|market, tab| {
            if market.faults.transient_navigation_failures > 0 {
                market.faults.transient_navigation_failures -= 1;
                return Err(BrowserError::Network(format!(
                    "net::ERR_CONNECTION_RESET loading {url}"
                )));
            }
            if Self::logged_in(market, tab) {
                if let Some(remaining) = market.faults.expire_sessions_after_navigations {
                    if remaining == 0 {
                        market.epoch += 1;
                        market.faults.expire_sessions_after_navigations = None;
                    } else {
                        market.faults.expire_sessions_after_navigations = Some(remaining - 1);
                    }
                }
            }
            self.route(market, tab, url);
            Ok(())
        })
    }

    async fn find(&self, selector: &str) -> BrowserResult<Option<ElementHandle>> {
        self.with_state(|market, tab| {
            let node = self.nodes(market, tab, selector).into_iter().next();
            Ok(node.map(|node| tab.register(node)))
        })
    }

    async fn find_all(&self, selector: &str) -> BrowserResult<Vec<ElementHandle>> {
        self.with_state(|market, tab| {
            let nodes = self.nodes(market, tab, selector);
            Ok(nodes.into_iter().map(|node| tab.register(node)).collect())
        })
    }

    async fn find_within(
        &self,
        parent: &ElementHandle,
        selector: &str,
    ) -> BrowserResult<Option<ElementHandle>> {
        self.with_state(|market, tab| {
            let parent = tab.node(parent)?;
            if market.faults.hidden_selectors.contains(selector) {
                return Ok(None);
            }
            let s = &self.site.selectors;
            let child = if parent.listing.is_some()
                && (selector == s.listing_title || selector == s.delete_button)
            {
                Some(Node {
                    selector: selector.to_string(),
                    listing: parent.listing,
                    index: None,
                })
            } else if parent.index.is_some() && selector == s.image_remove {
                Some(Node {
                    selector: selector.to_string(),
                    listing: None,
                    index: parent.index,
                })
            } else {
                None
            };
            Ok(child.map(|node| tab.register(node)))
        })
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> BrowserResult<()> {
        self.with_state(|_, tab| {
            let node = tab.node(element)?;
            tab.form.insert(node.selector, text.to_string());
            Ok(())
        })
    }

    async fn select(&self, element: &ElementHandle, value: &str) -> BrowserResult<()> {
        self.fill(element, value).await
    }

    async fn click(&self, element: &ElementHandle) -> BrowserResult<()> {
        self.with_state(|market, tab| {
            let node = tab.node(element)?;
            let s = &self.site.selectors;
            let selector = node.selector.as_str();
            if selector == s.consent_accept {
                tab.consent_accepted = true;
            } else if selector == s.login_submit {
                self.submit_login(market, tab);
            } else if selector == s.ad_type_wanted {
                tab.form.insert("type".into(), "WANTED".into());
            } else if selector == s.shipping_pickup || selector == s.shipping_enabled {
                tab.form.insert("shipping".into(), selector.to_string());
            } else if selector == s.category_confirm {
                if let Page::Category(category) = tab.page.clone() {
                    tab.category = Some(category);
                    tab.page = Page::PostForm;
                    tab.url = self.site.post_url();
                    tab.handles.clear();
                }
            } else if selector == s.submit {
                self.submit_form(market, tab);
            } else if selector == s.next_page {
                tab.manage_page += 1;
                tab.handles.clear();
            } else if selector == s.delete_button {
                tab.pending_delete = node.listing;
            } else if selector == s.delete_confirm {
                if let Some(id) = tab.pending_delete.take() {
                    if market.listings.remove(&id).is_some() {
                        market.log.push(format!("delete {id}"));
                    }
                    tab.handles.clear();
                }
            } else if selector == s.image_remove {
                tab.images = tab.images.saturating_sub(1);
            } else if selector == s.buy_now_yes || selector == s.buy_now_no {
                let choice = if selector == s.buy_now_yes { "yes" } else { "no" };
                tab.form.insert("buy_now".into(), choice.into());
            } else if let Some(size) = template_value(&s.shipping_size, selector) {
                if tab.shipping_size.as_deref() != Some(size) {
                    tab.packages.clear();
                }
                tab.shipping_size = Some(size.to_string());
            } else if let Some(package) = template_value(&s.shipping_package, selector) {
                if !tab.packages.remove(package) {
                    tab.packages.insert(package.to_string());
                }
            }
            Ok(())
        })
    }

    async fn upload(&self, element: &ElementHandle, file: &Path) -> BrowserResult<()> {
        self.with_state(|market, tab| {
            let node = tab.node(element)?;
            if node.selector != self.site.selectors.image_input {
                return Err(BrowserError::Unexpected(format!(
                    "{} is not a file input",
                    node.selector
                )));
            }
            if market.faults.reject_image_uploads {
                return Err(BrowserError::Network(format!(
                    "upload of {} was rejected",
                    file.display()
                )));
            }
            tab.images += 1;
            Ok(())
        })
    }

    async fn current_url(&self) -> BrowserResult<String> {
        self.with_state(|_, tab| Ok(tab.url.clone()))
    }

    async fn read_text(&self, element: &ElementHandle) -> BrowserResult<String> {
        self.with_state(|market, tab| {
            let node = tab.node(element)?;
            let s = &self.site.selectors;
            if node.selector == s.logged_in_marker {
                return Ok(market.username.clone());
            }
            if node.selector == s.form_error {
                return Ok(tab.form_error.clone().unwrap_or_default());
            }
            if let Some(listing) = node.listing.and_then(|id| market.listings.get(&id)) {
                return Ok(self.listing_text(listing, &node.selector));
            }
            Ok(tab.form.get(&node.selector).cloned().unwrap_or_default())
        })
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        self.with_state(|market, tab| {
            let node = tab.node(element)?;
            let s = &self.site.selectors;
            let Some(listing) = node.listing.and_then(|id| market.listings.get(&id)) else {
                if name == "value" && self.is_form_field(&node.selector) {
                    return Ok(tab.form.get(&node.selector).cloned());
                }
                if name == "checked" {
                    if let Some(package) = template_value(&s.shipping_package, &node.selector) {
                        return Ok(tab.packages.contains(package).then(|| "checked".to_string()));
                    }
                }
                return Ok(None);
            };
            let value = if name == "href" && node.selector == s.view_breadcrumb_links {
                let segment = match node.index {
                    Some(0) | None => None,
                    Some(index) => listing
                        .category
                        .as_deref()
                        .and_then(|category| category.split('/').nth(index - 1)),
                };
                Some(match segment {
                    Some(segment) => format!("/s-kategorie/c{segment}"),
                    None => "/".to_string(),
                })
            } else if name == s.listing_id_attribute {
                Some(listing.id.clone())
            } else if name == s.listing_state_attribute {
                Some(listing.status.clone())
            } else if name == s.listing_updated_attribute {
                listing.updated.clone()
            } else {
                None
            };
            Ok(value)
        })
    }

    async fn close(&self) -> BrowserResult<()> {
        self.with_state(|_, tab| {
            tab.closed = true;
            Ok(())
        })
    }

    /// Page state never changes on its own, so one evaluation decides.
    async fn wait_for(
        &self,
        condition: &WaitCondition,
        _timeout: Duration,
    ) -> BrowserResult<WaitOutcome> {
        Ok(match self.evaluate(condition).await? {
            Some(index) => WaitOutcome::Ready { index },
            None => WaitOutcome::TimedOut,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SelectorSection, SessionSection, SiteSection};

    fn market() -> SimulatedMarketplace {
        let site = SiteMap::new(
            SiteSection::default(),
            SelectorSection::default(),
            &SessionSection::default(),
        );
        SimulatedMarketplace::new(site, "seller@example.com", "secret")
    }

    async fn login(driver: &SimulatedDriver, site: &SiteMap) {
        let s = &site.selectors;
        driver.navigate(&site.login_url()).await.unwrap();
        let email = driver.find(&s.login_email).await.unwrap().unwrap();
        driver.fill(&email, "seller@example.com").await.unwrap();
        let password = driver.find(&s.login_password).await.unwrap().unwrap();
        driver.fill(&password, "secret").await.unwrap();
        let submit = driver.find(&s.login_submit).await.unwrap().unwrap();
        driver.click(&submit).await.unwrap();
    }

    #[tokio::test]
    async fn protected_pages_redirect_to_login() {
        let market = market();
        let site = market.site.clone();
        let driver = market.driver();
        driver.navigate(&site.manage_url()).await.unwrap();
        assert!(site.is_login_page(&driver.current_url().await.unwrap()));

        login(&driver, &site).await;
        assert!(driver.find(&site.selectors.logged_in_marker).await.unwrap().is_some());
        driver.navigate(&site.manage_url()).await.unwrap();
        assert!(!site.is_login_page(&driver.current_url().await.unwrap()));
        assert_eq!(market.login_count(), 1);
    }

    #[tokio::test]
    async fn stale_handles_are_rejected_after_navigation() {
        let market = market();
        let site = market.site.clone();
        let driver = market.driver();
        driver.navigate(&site.login_url()).await.unwrap();
        let email = driver.find(&site.selectors.login_email).await.unwrap().unwrap();
        driver.navigate(&site.login_url()).await.unwrap();
        assert!(matches!(
            driver.fill(&email, "x").await,
            Err(BrowserError::StaleElement(_))
        ));
    }

    #[tokio::test]
    async fn listings_page_through_manage_view() {
        let market = market().with_page_size(2);
        for title in ["Lampe aus Messing", "Tisch aus Eiche", "Stuhl aus Buche"] {
            market.seed_listing(title, "active");
        }
        let site = market.site.clone();
        let driver = market.driver();
        login(&driver, &site).await;
        driver.navigate(&site.manage_url()).await.unwrap();
        let s = &site.selectors;
        assert_eq!(driver.find_all(&s.listing_item).await.unwrap().len(), 2);
        let next = driver.find(&s.next_page).await.unwrap().unwrap();
        driver.click(&next).await.unwrap();
        let rows = driver.find_all(&s.listing_item).await.unwrap();
        assert_eq!(rows.len(), 1);
        let title = driver.find_within(&rows[0], &s.listing_title).await.unwrap().unwrap();
        assert_eq!(driver.read_text(&title).await.unwrap(), "Lampe aus Messing");
        assert!(driver.find(&s.next_page).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn public_page_shows_a_listing_without_login() {
        let market = market();
        let id = market.seed_listing_with("Lampe aus Messing", "active", |listing| {
            listing.price = Some("40".into());
            listing.price_type = Some("NEGOTIABLE".into());
            listing.category = Some("80/88".into());
        });
        let site = market.site.clone();
        let s = &site.selectors;
        let driver = market.driver();
        driver.navigate(&site.view_url(&id)).await.unwrap();
        let price = driver.find(&s.view_price).await.unwrap().unwrap();
        assert_eq!(driver.read_text(&price).await.unwrap(), "40 € VB");
        let crumbs = driver.find_all(&s.view_breadcrumb_links).await.unwrap();
        assert_eq!(crumbs.len(), 3);
        assert_eq!(
            driver.read_attribute(&crumbs[2], "href").await.unwrap().as_deref(),
            Some("/s-kategorie/c88")
        );
        assert!(driver.find(&s.view_shipping).await.unwrap().is_none());

        driver.navigate(&site.view_url("1")).await.unwrap();
        assert!(driver.current_url().await.unwrap().ends_with("/k0"));
        assert!(driver.find(&s.view_title).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn package_choices_reset_when_the_size_changes() {
        let market = market();
        let site = market.site.clone();
        let s = &site.selectors;
        let driver = market.driver();
        login(&driver, &site).await;
        driver.navigate(&site.post_url()).await.unwrap();
        let package = s.shipping_package.replace("{package}", "S-Paket");
        assert!(driver.find(&package).await.unwrap().is_none());

        let small = driver.find(&s.shipping_size.replace("{size}", "Klein")).await.unwrap().unwrap();
        driver.click(&small).await.unwrap();
        let option = driver.find(&package).await.unwrap().unwrap();
        driver.click(&option).await.unwrap();
        assert!(driver.read_attribute(&option, "checked").await.unwrap().is_some());

        let medium = driver.find(&s.shipping_size.replace("{size}", "Mittel")).await.unwrap().unwrap();
        driver.click(&medium).await.unwrap();
        assert!(driver.find(&package).await.unwrap().is_none());
        let option = driver
            .find(&s.shipping_package.replace("{package}", "M-Paket"))
            .await
            .unwrap()
            .unwrap();
        assert!(driver.read_attribute(&option, "checked").await.unwrap().is_none());
    }
}

