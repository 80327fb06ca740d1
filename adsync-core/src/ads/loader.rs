use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::error::{AdError, AdResult};
use super::models::{
    parse_timestamp, scalar_to_string, shipping_package, Ad, AdFile, Condition, Price, PriceType,
    ShippingType,
};
use super::selector::AdFilter;
use crate::config::{AdsSection, AdsyncConfig};

pub const MIN_TITLE_CHARS: usize = 10;
pub const MAX_DESCRIPTION_CHARS: usize = 4000;
const IMAGE_EXTENSIONS: [&str; 4] = ["gif", "jpg", "jpeg", "png"];

/// Valid ads plus the per-file errors that kept other ads out.
#[derive(Debug, Default)]
pub struct AdCatalog {
    pub ads: Vec<Ad>,
    pub errors: Vec<AdError>,
}

impl AdCatalog {
    pub fn select(&self, filter: &AdFilter) -> Vec<Ad> {
        filter.apply(&self.ads)
    }

    /// Remote ids claimed by any ad file, selected or not.
    pub fn known_remote_ids(&self) -> HashSet<String> {
        self.ads
            .iter()
            .filter_map(|ad| ad.remote_id.clone())
            .collect()
    }

    pub fn get(&self, local_id: &str) -> Option<&Ad> {
        self.ads.iter().find(|ad| ad.local_id == local_id)
    }
}

/// Reads ad YAML files below a root directory.
#[derive(Debug, Clone)]
pub struct AdLoader {
    root: PathBuf,
    patterns: Vec<Pattern>,
    settings: AdsSection,
}

impl AdLoader {
    pub fn new<P: AsRef<Path>>(root: P, settings: &AdsSection) -> AdResult<Self> {
        let patterns = settings
            .files
            .iter()
            .map(|raw| {
                Pattern::new(raw).map_err(|source| AdError::Pattern {
                    pattern: raw.clone(),
                    source,
                })
            })
            .collect::<AdResult<Vec<_>>>()?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            patterns,
            settings: settings.clone(),
        })
    }

    pub fn from_config(config: &AdsyncConfig) -> AdResult<Self> {
        Self::new(&config.base_dir, &config.ads)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads every matching file. Only an unreadable root fails the whole load.
    pub fn load(&self) -> AdResult<AdCatalog> {
        let mut catalog = AdCatalog::default();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for path in self.discover()? {
            match self.load_file(&path) {
                Ok(ad) => {
                    if let Some(first) = seen.get(&ad.local_id) {
                        catalog.errors.push(AdError::DuplicateId {
                            local_id: ad.local_id.clone(),
                            first: first.clone(),
                            second: path.clone(),
                        });
                        continue;
                    }
                    seen.insert(ad.local_id.clone(), path.clone());
                    debug!(local_id = %ad.local_id, path = %path.display(), "loaded ad");
                    catalog.ads.push(ad);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping invalid ad");
                    catalog.errors.push(err);
                }
            }
        }
        Ok(catalog)
    }

    fn discover(&self) -> AdResult<Vec<PathBuf>> {
        std::fs::metadata(&self.root).map_err(|source| AdError::Io {
            source,
            path: self.root.clone(),
        })?;
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::default()
        };
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if self
                .patterns
                .iter()
                .any(|pattern| pattern.matches_path_with(relative, options))
            {
                files.push(entry.path().to_path_buf());
            }
        }
        Ok(files)
    }

    pub fn load_file(&self, path: &Path) -> AdResult<Ad> {
        let content = std::fs::read_to_string(path).map_err(|source| AdError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let file: AdFile = serde_yaml::from_str(&content).map_err(|source| AdError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
        self.validate(path, file)
    }

    fn validate(&self, path: &Path, file: AdFile) -> AdResult<Ad> {
        let invalid = |message: String| AdError::validation(path, message);
        let defaults = &self.settings.defaults;

        let title = file.title.as_deref().map(str::trim).unwrap_or_default();
        if title.is_empty() {
            return Err(invalid("title is required".into()));
        }
        if title.chars().count() < MIN_TITLE_CHARS {
            return Err(invalid(format!(
                "title must be at least {MIN_TITLE_CHARS} characters"
            )));
        }

        let body = file.description.as_deref().map(str::trim).unwrap_or_default();
        if body.is_empty() {
            return Err(invalid("description is required".into()));
        }
        let description = format!(
            "{}{}{}",
            self.settings.description_prefix, body, self.settings.description_suffix
        )
        .replace('@', "(at)");
        if description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(invalid(format!(
                "description exceeds {MAX_DESCRIPTION_CHARS} characters including prefix and suffix"
            )));
        }

        let price = parse_price(file.price.as_ref(), "price").map_err(invalid)?;
        let price_type = file.price_type.unwrap_or(defaults.price_type);
        match price_type {
            PriceType::Fixed if price.is_none() => {
                return Err(invalid("price is required when price_type is FIXED".into()))
            }
            PriceType::GiveAway if price.is_some() => {
                return Err(invalid(
                    "price must not be set when price_type is GIVE_AWAY".into(),
                ))
            }
            _ => {}
        }
        let shipping_costs =
            parse_price(file.shipping_costs.as_ref(), "shipping_costs").map_err(invalid)?;
        let shipping_type = file.shipping_type.unwrap_or(defaults.shipping_type);
        let shipping_options = shipping_options(&file.shipping_options, shipping_type).map_err(invalid)?;

        let condition = file
            .condition
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(str::parse::<Condition>)
            .transpose()
            .map_err(invalid)?;

        let contact = file.contact.merged_with(&defaults.contact);
        if contact.name.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            return Err(invalid("contact.name is required".into()));
        }

        let images = resolve_images(path, &file.images)?;

        let attributes = file
            .special_attributes
            .iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key.clone(), v)))
            .collect();

        let timestamp = |raw: &Option<String>, field: &str| {
            raw.as_deref().and_then(|value| {
                let parsed = parse_timestamp(value);
                if parsed.is_none() {
                    warn!(path = %path.display(), field, value, "ignoring unparseable timestamp");
                }
                parsed
            })
        };

        Ok(Ad {
            local_id: self.local_id_for(path, file.local_id.as_deref()),
            source: path.to_path_buf(),
            active: file.active.unwrap_or(defaults.active),
            remove: file.remove,
            ad_type: file.ad_type.unwrap_or(defaults.ad_type),
            title: title.to_string(),
            description,
            category: file
                .category
                .as_ref()
                .and_then(scalar_to_string)
                .filter(|value| !value.is_empty()),
            price,
            price_type,
            condition,
            shipping_type,
            shipping_costs,
            shipping_options,
            sell_directly: file.sell_directly.unwrap_or(defaults.sell_directly),
            images,
            contact,
            attributes,
            tags: file.tags,
            republication_interval: file
                .republication_interval
                .or(defaults.republication_interval),
            remote_id: file
                .id
                .as_ref()
                .and_then(scalar_to_string)
                .filter(|value| !value.is_empty()),
            content_hash: file.content_hash.filter(|value| !value.is_empty()),
            created_on: timestamp(&file.created_on, "created_on"),
            updated_on: timestamp(&file.updated_on, "updated_on"),
        })
    }

    fn local_id_for(&self, path: &Path, explicit: Option<&str>) -> String {
        if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let stem = relative.with_extension("");
        stem.components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Known carrier packages of a single size, deduplicated and sorted.
fn shipping_options(raw: &[String], shipping_type: ShippingType) -> Result<Vec<String>, String> {
    let mut options: Vec<String> = raw
        .iter()
        .map(|option| option.trim().to_string())
        .filter(|option| !option.is_empty())
        .collect();
    if options.is_empty() {
        return Ok(options);
    }
    if shipping_type != ShippingType::Shipping {
        return Err("shipping_options require shipping_type SHIPPING".into());
    }
    let mut size = None;
    for option in &options {
        let (own, _) = shipping_package(option)
            .ok_or_else(|| format!("unknown shipping option: {option}"))?;
        match size {
            Some(first) if first != own => {
                return Err(format!(
                    "shipping_options mix package sizes {first} and {own}"
                ))
            }
            _ => size = Some(own),
        }
    }
    options.sort();
    options.dedup();
    Ok(options)
}

fn parse_price(value: Option<&serde_yaml::Value>, field: &str) -> Result<Option<Price>, String> {
    let Some(value) = value else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let raw = scalar_to_string(value).ok_or_else(|| format!("{field} must be numeric"))?;
    if raw.is_empty() {
        return Ok(None);
    }
    Price::parse(&raw)
        .map(Some)
        .ok_or_else(|| format!("{field} must be numeric, got `{raw}`"))
}

/// Expands image patterns relative to the ad file, keeping first-seen order.
fn resolve_images(ad_path: &Path, patterns: &[String]) -> AdResult<Vec<PathBuf>> {
    let base = ad_path.parent().unwrap_or_else(|| Path::new("."));
    let mut resolved = Vec::new();
    let mut seen = HashSet::new();
    for raw in patterns {
        let full = base.join(raw);
        let pattern = full.to_string_lossy().into_owned();
        let entries = glob::glob(&pattern).map_err(|source| AdError::Pattern {
            pattern: raw.clone(),
            source,
        })?;
        let mut matched: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .collect();
        matched.sort();
        if matched.is_empty() {
            return Err(AdError::validation(
                ad_path,
                format!("image reference `{raw}` matched no files"),
            ));
        }
        for image in matched {
            let supported = image
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !supported {
                return Err(AdError::validation(
                    ad_path,
                    format!(
                        "unsupported image type {}; use gif, jpg, jpeg or png",
                        image.display()
                    ),
                ));
            }
            if seen.insert(image.clone()) {
                resolved.push(image);
            }
        }
    }
    Ok(resolved)
}
