use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::ChromiumSection;

use super::error::{BrowserError, BrowserResult};

/// A Chromium user-data directory.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    id: String,
    path: PathBuf,
    created_at: DateTime<Utc>,
}

impl BrowserProfile {
    fn create(path: PathBuf, id: String) -> BrowserResult<Self> {
        std::fs::create_dir_all(&path)
            .map_err(|err| BrowserError::Profile(format!("failed to create profile dir: {err}")))?;
        Ok(Self {
            id,
            path,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn touch(&self) -> BrowserResult<()> {
        if self.path.exists() {
            let marker = self.path.join(".last_used");
            let mut file = fs::File::create(&marker).await.map_err(|err| {
                BrowserError::Profile(format!("failed to write profile marker: {err}"))
            })?;
            file.write_all(Utc::now().to_rfc3339().as_bytes())
                .await
                .map_err(|err| {
                    BrowserError::Profile(format!("failed to update profile marker: {err}"))
                })?;
        }
        Ok(())
    }
}

/// Hands out profile directories.
///
/// Persistent profiles keep cookies between runs so a logged-in session
/// survives; one directory per worker slot. Ephemeral profiles get a fresh
/// directory per launch and are removed once older than the TTL.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    base_dir: PathBuf,
    ttl: Duration,
    persistent: bool,
}

impl ProfileManager {
    pub fn persistent<P: AsRef<Path>>(base_dir: P) -> BrowserResult<Self> {
        Self::new(base_dir.as_ref(), Duration::MAX, true)
    }

    pub fn ephemeral<P: AsRef<Path>>(base_dir: P, ttl: Duration) -> BrowserResult<Self> {
        Self::new(base_dir.as_ref(), ttl, false)
    }

    fn new(base_dir: &Path, ttl: Duration, persistent: bool) -> BrowserResult<Self> {
        std::fs::create_dir_all(base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to create profile base dir: {err}"))
        })?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            ttl,
            persistent,
        })
    }

    /// `user_data_dir` (already resolved) selects persistent profiles.
    pub fn from_config(config: &ChromiumSection, user_data_dir: Option<PathBuf>) -> BrowserResult<Self> {
        match user_data_dir {
            Some(dir) => Self::persistent(dir),
            None => Self::ephemeral(
                std::env::temp_dir().join("adsync-profiles"),
                Duration::from_secs(config.profile_ttl_hours.saturating_mul(3600)),
            ),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn allocate(&self, slot: usize) -> BrowserResult<BrowserProfile> {
        if self.persistent {
            let id = format!("worker-{slot}");
            BrowserProfile::create(self.base_dir.join(&id), id)
        } else {
            let id = Uuid::new_v4().to_string();
            BrowserProfile::create(self.base_dir.join(&id), id)
        }
    }

    /// Removes expired ephemeral profiles; returns how many were removed.
    pub fn cleanup_expired(&self) -> BrowserResult<usize> {
        if self.persistent {
            return Ok(0);
        }
        let now = SystemTime::now();
        let entries = std::fs::read_dir(&self.base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to list profile directory: {err}"))
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read profile metadata");
                    continue;
                }
            };
            if let Ok(modified) = metadata.modified() {
                if now.duration_since(modified).unwrap_or(Duration::ZERO) > self.ttl {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            tracing::warn!(path = %path.display(), error = %err, "failed to remove expired profile")
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}
