use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{
    BrowserDriver, BrowserResult, DriverFactory, PageSteps, SharedMetrics, SiteMap,
};
use crate::config::{LoginSection, SessionSection};

use super::login::LoginFlow;
use super::operator::OperatorGate;

/// Everything a session manager needs; shared by all managers of a pool.
#[derive(Clone)]
pub struct SessionContext {
    pub factory: Arc<dyn DriverFactory>,
    pub site: Arc<SiteMap>,
    pub login: LoginSection,
    pub config: SessionSection,
    pub operator: Arc<dyn OperatorGate>,
    pub metrics: SharedMetrics,
    pub cancel: CancellationToken,
}

/// One authenticated browser context, as handed out by [`SessionManager::acquire`].
#[derive(Clone)]
pub struct Session {
    slot: usize,
    generation: u64,
    driver: Arc<dyn BrowserDriver>,
}

impl Session {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Increments on every successful login of the owning manager.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn driver(&self) -> &dyn BrowserDriver {
        self.driver.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Default)]
struct ManagerState {
    driver: Option<Arc<dyn BrowserDriver>>,
    current: Option<Session>,
    generation: u64,
}

/// Owns at most one live session and replaces it when it expires.
pub struct SessionManager {
    slot: usize,
    ctx: SessionContext,
    state: AsyncMutex<ManagerState>,
}

impl SessionManager {
    pub fn new(slot: usize, ctx: SessionContext) -> Self {
        Self {
            slot,
            ctx,
            state: AsyncMutex::new(ManagerState::default()),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn site(&self) -> &SiteMap {
        &self.ctx.site
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.ctx.metrics
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.ctx.cancel
    }

    /// Returns the live session, logging in first when there is none or the
    /// current one has expired.
    pub async fn acquire(&self) -> BrowserResult<Session> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.current.clone() {
            match self.is_alive(&session).await {
                Ok(true) => return Ok(session),
                Ok(false) => debug!(slot = self.slot, "session expired"),
                Err(err) => debug!(slot = self.slot, error = %err, "session liveness check failed"),
            }
            state.current = None;
        }
        self.login(&mut state).await
    }

    /// Cheap liveness check: the tab is not on the login page and the
    /// authenticated marker is still present. Does not reload.
    pub async fn is_alive(&self, session: &Session) -> BrowserResult<bool> {
        let url = session.driver().current_url().await?;
        if self.ctx.site.is_login_page(&url) {
            return Ok(false);
        }
        Ok(session
            .driver()
            .find(&self.ctx.site.selectors.logged_in_marker)
            .await?
            .is_some())
    }

    /// Logs in again unless another caller already replaced generation `stale`.
    pub async fn reauthenticate(&self, stale: u64) -> BrowserResult<Session> {
        let mut state = self.state.lock().await;
        if state.generation != stale {
            if let Some(session) = state.current.clone() {
                debug!(slot = self.slot, stale, current = state.generation, "session already renewed");
                return Ok(session);
            }
        }
        warn!(slot = self.slot, generation = stale, "session lost, re-authenticating");
        state.current = None;
        self.login(&mut state).await
    }

    async fn login(&self, state: &mut ManagerState) -> BrowserResult<Session> {
        let driver = match &state.driver {
            Some(driver) => Arc::clone(driver),
            None => {
                let driver = self.ctx.factory.open().await?;
                state.driver = Some(Arc::clone(&driver));
                driver
            }
        };
        let steps = PageSteps::new(driver.as_ref(), &self.ctx.site, &self.ctx.cancel)
            .with_metrics(&self.ctx.metrics);
        LoginFlow::new(
            steps,
            &self.ctx.login,
            &self.ctx.config,
            self.ctx.operator.as_ref(),
            &self.ctx.metrics,
        )
        .run()
        .await?;

        state.generation += 1;
        let session = Session {
            slot: self.slot,
            generation: state.generation,
            driver,
        };
        state.current = Some(session.clone());
        info!(slot = self.slot, generation = state.generation, "session ready");
        Ok(session)
    }

    /// Closes the browser context; a later `acquire` opens a new one.
    pub async fn shutdown(&self) -> BrowserResult<()> {
        let mut state = self.state.lock().await;
        state.current = None;
        if let Some(driver) = state.driver.take() {
            driver.close().await?;
        }
        Ok(())
    }
}
