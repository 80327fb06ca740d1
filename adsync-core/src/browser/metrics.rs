use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Counters for one run; shared as `Arc<Mutex<BrowserMetrics>>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserMetrics {
    pub pages_opened: u64,
    pub interactions: u64,
    pub images_uploaded: u64,
    pub image_upload_failures: u64,
    pub logins: u64,
    pub session_recoveries: u64,
    pub challenges: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub listings_read: u64,
}

impl BrowserMetrics {
    pub fn record_page_open(&mut self) {
        self.pages_opened = self.pages_opened.saturating_add(1);
    }

    pub fn record_interaction(&mut self) {
        self.interactions = self.interactions.saturating_add(1);
    }

    pub fn record_image_upload(&mut self, success: bool) {
        if success {
            self.images_uploaded = self.images_uploaded.saturating_add(1);
        } else {
            self.image_upload_failures = self.image_upload_failures.saturating_add(1);
        }
    }

    pub fn record_login(&mut self) {
        self.logins = self.logins.saturating_add(1);
    }

    pub fn record_session_recovery(&mut self) {
        self.session_recoveries = self.session_recoveries.saturating_add(1);
    }

    pub fn record_challenge(&mut self) {
        self.challenges = self.challenges.saturating_add(1);
    }

    pub fn record_failed_attempt(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
    }

    pub fn record_retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    pub fn record_listings(&mut self, count: u64) {
        self.listings_read = self.listings_read.saturating_add(count);
    }

    pub fn image_success_rate(&self) -> f64 {
        let total = self.images_uploaded + self.image_upload_failures;
        if total == 0 {
            0.0
        } else {
            (self.images_uploaded as f64 / total as f64) * 100.0
        }
    }
}

pub type SharedMetrics = Arc<Mutex<BrowserMetrics>>;

/// Applies `update` unless the lock is poisoned; counters are best effort.
pub fn record(metrics: &SharedMetrics, update: impl FnOnce(&mut BrowserMetrics)) {
    if let Ok(mut guard) = metrics.lock() {
        update(&mut guard);
    }
}

pub fn snapshot(metrics: &SharedMetrics) -> BrowserMetrics {
    metrics
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default()
}
