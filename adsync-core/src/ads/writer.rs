use std::io::Write;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use super::error::{AdError, AdResult};

/// Bookkeeping written after a verified Create or Update.
#[derive(Debug, Clone)]
pub struct PublishedState<'a> {
    pub remote_id: &'a str,
    /// `None` removes a stale hash, which makes the next pass plan an Update.
    pub content_hash: Option<&'a str>,
    pub at: DateTime<Utc>,
    /// A fresh listing also resets `created_on`.
    pub new_listing: bool,
}

/// Rewrites the reconciliation keys of an ad file and leaves every other key alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdStateWriter;

impl AdStateWriter {
    pub fn record_published(&self, path: &Path, state: &PublishedState<'_>) -> AdResult<()> {
        let mut mapping = read_mapping(path)?;
        mapping.insert(key("id"), remote_id_value(state.remote_id));
        match state.content_hash {
            Some(hash) => {
                mapping.insert(key("content_hash"), Value::String(hash.to_string()));
            }
            None => {
                mapping.remove(key("content_hash"));
            }
        }
        let stamp = Value::String(state.at.to_rfc3339_opts(SecondsFormat::Secs, true));
        if state.new_listing || !mapping.contains_key(key("created_on")) {
            mapping.insert(key("created_on"), stamp.clone());
        }
        mapping.insert(key("updated_on"), stamp);
        write_mapping(path, &mapping)?;
        debug!(path = %path.display(), remote_id = state.remote_id, "recorded published state");
        Ok(())
    }

    /// Writes a fresh ad file from a downloaded listing, creating its directory.
    pub fn write_downloaded(&self, path: &Path, ad: &Value) -> AdResult<()> {
        let Value::Mapping(mapping) = ad else {
            return Err(AdError::validation(path, "downloaded ad is not a mapping"));
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| AdError::Write {
                source,
                path: path.to_path_buf(),
            })?;
        }
        write_mapping(path, mapping)?;
        debug!(path = %path.display(), "wrote downloaded ad");
        Ok(())
    }

    /// Clears `id` and `content_hash` when the file still points at `remote_id`.
    pub fn clear_remote(&self, path: &Path, remote_id: &str) -> AdResult<bool> {
        let mut mapping = read_mapping(path)?;
        let current = mapping
            .get(key("id"))
            .and_then(crate::ads::models::scalar_to_string);
        if current.as_deref() != Some(remote_id) {
            return Ok(false);
        }
        mapping.remove(key("id"));
        mapping.remove(key("content_hash"));
        write_mapping(path, &mapping)?;
        debug!(path = %path.display(), remote_id, "cleared remote state");
        Ok(true)
    }
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn remote_id_value(remote_id: &str) -> Value {
    match remote_id.parse::<u64>() {
        Ok(number) => Value::Number(number.into()),
        Err(_) => Value::String(remote_id.to_string()),
    }
}

fn read_mapping(path: &Path) -> AdResult<Mapping> {
    let content = std::fs::read_to_string(path).map_err(|source| AdError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let value: Value = serde_yaml::from_str(&content).map_err(|source| AdError::Parse {
        source,
        path: path.to_path_buf(),
    })?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(AdError::validation(path, "ad file is not a mapping")),
    }
}

/// Writes through a sibling temp file so a crash never leaves half a file behind.
fn write_mapping(path: &Path, mapping: &Mapping) -> AdResult<()> {
    let rendered = serde_yaml::to_string(mapping).map_err(|source| AdError::Serialize {
        source,
        path: path.to_path_buf(),
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write_err = |source| AdError::Write {
        source,
        path: path.to_path_buf(),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(rendered.as_bytes()).map_err(write_err)?;
    temp.flush().map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    const AD: &str = "title: Graues Ecksofa mit Schlaffunktion\ndescription: Gut erhalten\nprice: 150\nimages:\n  - img/*.jpg\n";

    #[test]
    fn records_and_clears_state_preserving_other_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sofa.yaml");
        fs::write(&path, AD).unwrap();
        let writer = AdStateWriter;
        let at = Utc::now();

        writer
            .record_published(
                &path,
                &PublishedState {
                    remote_id: "2874411",
                    content_hash: Some("feed"),
                    at,
                    new_listing: true,
                },
            )
            .unwrap();
        let value: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["id"].as_u64(), Some(2874411));
        assert_eq!(value["content_hash"].as_str(), Some("feed"));
        assert_eq!(value["price"].as_u64(), Some(150));
        assert_eq!(value["images"][0].as_str(), Some("img/*.jpg"));
        assert!(value["created_on"].is_string());

        assert!(!writer.clear_remote(&path, "999").unwrap());
        assert!(writer.clear_remote(&path, "2874411").unwrap());
        let value: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("content_hash").is_none());
        assert_eq!(value["title"].as_str(), Some("Graues Ecksofa mit Schlaffunktion"));
    }

    #[test]
    fn partial_publish_drops_stale_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sofa.yaml");
        fs::write(&path, format!("{AD}content_hash: old\ncreated_on: 2024-01-01T00:00:00Z\n")).unwrap();

        AdStateWriter
            .record_published(
                &path,
                &PublishedState {
                    remote_id: "abc-1",
                    content_hash: None,
                    at: Utc::now(),
                    new_listing: false,
                },
            )
            .unwrap();
        let value: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["id"].as_str(), Some("abc-1"));
        assert!(value.get("content_hash").is_none());
        assert_eq!(value["created_on"].as_str(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn downloaded_ads_land_in_a_new_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloaded-ads/ad_2000001.yaml");
        let ad: Value = serde_yaml::from_str(AD).unwrap();
        AdStateWriter.write_downloaded(&path, &ad).unwrap();
        let value: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["title"].as_str(), Some("Graues Ecksofa mit Schlaffunktion"));

        let err = AdStateWriter
            .write_downloaded(&path, &Value::String("kein Mapping".into()))
            .unwrap_err();
        assert!(matches!(err, AdError::Validation { .. }), "{err}");
    }
}

