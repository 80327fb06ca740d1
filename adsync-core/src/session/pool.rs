use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::browser::{BrowserError, BrowserResult, SessionRecovery};
use crate::config::SessionMode;

use super::manager::{Session, SessionContext, SessionManager};

/// The session managers of one run and the leases over them.
pub struct SessionPool {
    managers: Vec<Arc<SessionManager>>,
    free: Arc<Mutex<Vec<usize>>>,
    permits: Arc<Semaphore>,
}

impl SessionPool {
    pub fn new(ctx: SessionContext) -> Self {
        let count = match ctx.config.mode {
            SessionMode::Shared => 1,
            SessionMode::PerWorker => ctx.config.workers.max(1),
        };
        let managers = (0..count)
            .map(|slot| Arc::new(SessionManager::new(slot, ctx.clone())))
            .collect::<Vec<_>>();
        debug!(managers = count, mode = ?ctx.config.mode, "session pool ready");
        Self {
            free: Arc::new(Mutex::new((0..count).rev().collect())),
            permits: Arc::new(Semaphore::new(count)),
            managers,
        }
    }

    /// How many operations may run at once.
    pub fn concurrency(&self) -> usize {
        self.managers.len()
    }

    pub fn primary(&self) -> &Arc<SessionManager> {
        &self.managers[0]
    }

    /// Waits for an idle manager and leases it to the caller.
    pub async fn checkout(&self) -> BrowserResult<SessionLease> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BrowserError::Cancelled)?;
        let slot = self
            .free
            .lock()
            .map_err(|_| BrowserError::Unexpected("session pool poisoned".into()))?
            .pop()
            .ok_or_else(|| BrowserError::Unexpected("no idle session despite permit".into()))?;
        Ok(SessionLease {
            manager: Arc::clone(&self.managers[slot]),
            slot,
            observed: AtomicU64::new(0),
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }

    pub async fn shutdown(&self) {
        self.permits.close();
        for manager in &self.managers {
            if let Err(err) = manager.shutdown().await {
                warn!(slot = manager.slot(), error = %err, "failed to close browser session");
            }
        }
    }
}

/// Exclusive use of one session manager for the duration of one operation.
pub struct SessionLease {
    manager: Arc<SessionManager>,
    slot: usize,
    /// Generation of the session last handed to this lease's holder.
    observed: AtomicU64,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub async fn session(&self) -> BrowserResult<Session> {
        let session = self.manager.acquire().await?;
        self.observed.store(session.generation(), Ordering::SeqCst);
        Ok(session)
    }
}

/// Renews the session the failed attempt ran on. A newer generation means
/// another caller already logged in again.
#[async_trait]
impl SessionRecovery for SessionLease {
    async fn recover(&self) -> BrowserResult<()> {
        let stale = self.observed.load(Ordering::SeqCst);
        self.manager.reauthenticate(stale).await.map(|_| ())
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Ok(mut free) = self.free.lock() {
            free.push(self.slot);
        }
    }
}
