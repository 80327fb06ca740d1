use std::time::Duration;

use tracing::{debug, info, warn};

use crate::browser::{
    record_metrics, BrowserError, BrowserResult, PageSteps, SharedMetrics, WaitCondition,
    WaitOutcome,
};
use crate::config::{ChallengePolicy, LoginSection, SessionSection};

use super::operator::OperatorGate;

enum LoginResult {
    LoggedIn,
    InvalidCredentials,
    Challenge(String),
    Undecided,
}

/// Drives the login form of the marketplace on an existing tab.
pub struct LoginFlow<'a> {
    steps: PageSteps<'a>,
    credentials: &'a LoginSection,
    config: &'a SessionSection,
    operator: &'a dyn OperatorGate,
    metrics: &'a SharedMetrics,
}

impl<'a> LoginFlow<'a> {
    pub fn new(
        steps: PageSteps<'a>,
        credentials: &'a LoginSection,
        config: &'a SessionSection,
        operator: &'a dyn OperatorGate,
        metrics: &'a SharedMetrics,
    ) -> Self {
        Self {
            steps,
            credentials,
            config,
            operator,
            metrics,
        }
    }

    pub async fn run(&self) -> BrowserResult<()> {
        let site = self.steps.site();
        self.steps.open_public(&site.root_url()).await?;
        if self.logged_in_as_user().await? {
            info!(user = %self.credentials.username, "already logged in");
            return Ok(());
        }

        info!(user = %self.credentials.username, "logging in");
        self.steps.open_public(&site.login_url()).await?;
        if let Some(consent) = self.steps.optional(&site.selectors.consent_accept).await? {
            debug!("accepting consent banner");
            self.steps.click_element(&consent).await?;
        }

        self.submit_credentials().await?;
        let mut result = self.await_result().await?;
        if matches!(result, LoginResult::Undecided) {
            debug!("no login result yet, submitting credentials once more");
            self.submit_credentials().await?;
            result = self.await_result().await?;
        }

        match result {
            LoginResult::LoggedIn => {}
            LoginResult::InvalidCredentials => {
                return Err(BrowserError::AuthenticationBlocked(format!(
                    "login for {} rejected: invalid credentials",
                    self.credentials.username
                )))
            }
            LoginResult::Challenge(marker) => self.resolve_challenge(&marker).await?,
            LoginResult::Undecided => {
                return Err(BrowserError::Timeout(format!(
                    "login result for {}",
                    self.credentials.username
                )))
            }
        }

        record_metrics(self.metrics, |m| m.record_login());
        info!(user = %self.credentials.username, "login successful");
        Ok(())
    }

    async fn logged_in_as_user(&self) -> BrowserResult<bool> {
        let marker = &self.steps.site().selectors.logged_in_marker;
        match self.steps.optional(marker).await? {
            Some(element) => {
                let text = self.steps.text(&element).await?;
                Ok(text.contains(&self.credentials.username))
            }
            None => Ok(false),
        }
    }

    async fn submit_credentials(&self) -> BrowserResult<()> {
        let selectors = &self.steps.site().selectors;
        self.steps
            .fill(&selectors.login_email, &self.credentials.username)
            .await?;
        self.steps
            .fill(&selectors.login_password, &self.credentials.password)
            .await?;
        self.steps.click(&selectors.login_submit).await
    }

    async fn await_result(&self) -> BrowserResult<LoginResult> {
        let site = self.steps.site();
        let selectors = &site.selectors;
        let mut markers = vec![
            selectors.logged_in_marker.clone(),
            selectors.invalid_credentials_marker.clone(),
        ];
        markers.extend(selectors.challenge_markers.iter().cloned());
        let condition = WaitCondition::any_present(markers.iter().cloned());
        Ok(match self.steps.wait(&condition, site.login_timeout).await? {
            WaitOutcome::Ready { index: 0 } => LoginResult::LoggedIn,
            WaitOutcome::Ready { index: 1 } => LoginResult::InvalidCredentials,
            WaitOutcome::Ready { index } => LoginResult::Challenge(markers[index].clone()),
            WaitOutcome::TimedOut => LoginResult::Undecided,
        })
    }

    async fn resolve_challenge(&self, marker: &str) -> BrowserResult<()> {
        record_metrics(self.metrics, |m| m.record_challenge());
        match self.config.challenge_policy {
            ChallengePolicy::Fail => Err(BrowserError::AuthenticationBlocked(format!(
                "login challenge `{marker}` presented and challenge_policy is fail"
            ))),
            ChallengePolicy::Pause => {
                let budget = Duration::from_secs(self.config.manual_intervention_timeout_seconds);
                warn!(
                    marker,
                    timeout_s = budget.as_secs(),
                    "login challenge detected, waiting for operator"
                );
                let message = "Login challenge detected. Solve it in the browser window.";
                let waited = tokio::select! {
                    biased;
                    _ = self.steps.cancel().cancelled() => return Err(BrowserError::Cancelled),
                    waited = tokio::time::timeout(budget, self.operator.await_operator(message)) => waited,
                };
                match waited {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(BrowserError::ManualIntervention(format!(
                            "login challenge not resolved within {}s",
                            budget.as_secs()
                        )))
                    }
                }
                let logged_in = WaitCondition::present(&self.steps.site().selectors.logged_in_marker);
                match self
                    .steps
                    .wait(&logged_in, self.steps.site().login_timeout)
                    .await?
                {
                    WaitOutcome::Ready { .. } => Ok(()),
                    WaitOutcome::TimedOut => Err(BrowserError::ManualIntervention(
                        "login challenge still unresolved after operator confirmation".into(),
                    )),
                }
            }
        }
    }
}
