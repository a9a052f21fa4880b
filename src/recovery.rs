//! Credential recovery from live site traffic.
//!
//! The target site's own pages call the index API with a valid token in a
//! request header. [`RecoveryAgent::recover`] drives a browser session
//! through a fixed sequence of capture methods, watching outgoing index
//! traffic after each one, and returns the first token that passes the
//! shape check.
//!
//! Method order (most reliable first):
//!
//! 1. [`CaptureMethod::DeepLink`]: a URL known to trigger an index query.
//! 2. [`CaptureMethod::SearchInteraction`]: type a query into the site's
//!    search box and submit it.
//! 3. [`CaptureMethod::ScriptIntrospection`]: read the token from page
//!    globals with script expressions.
//! 4. [`CaptureMethod::AlternateLinks`]: further deep links.
//!
//! Each method gets a bounded wait window. When every method comes up
//! empty the [`RecoveryFailure`] says how many index calls were observed,
//! which separates "the site called the index but no usable token was
//! seen" from "the site never called the index at all".

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::credential::validate_token;
use crate::models::CredentialSet;
use crate::pacing::Interrupt;
use crate::traits::{CaptureDriver, CaptureSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMethod {
    DeepLink,
    SearchInteraction,
    ScriptIntrospection,
    AlternateLinks,
}

impl CaptureMethod {
    pub const ALL: [CaptureMethod; 4] = [
        CaptureMethod::DeepLink,
        CaptureMethod::SearchInteraction,
        CaptureMethod::ScriptIntrospection,
        CaptureMethod::AlternateLinks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::DeepLink => "deep_link",
            CaptureMethod::SearchInteraction => "search_interaction",
            CaptureMethod::ScriptIntrospection => "script_introspection",
            CaptureMethod::AlternateLinks => "alternate_links",
        }
    }
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub deep_link: Option<String>,
    /// Page to load before the search interaction.
    pub search_page: Option<String>,
    pub search_query: String,
    pub search_selectors: Vec<String>,
    pub script_expressions: Vec<String>,
    pub alternate_links: Vec<String>,
    /// Wait window per navigation for index traffic to appear.
    pub wait: Duration,
    pub poll_interval: Duration,
    pub min_token_length: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            deep_link: None,
            search_page: None,
            search_query: "furniture".to_string(),
            search_selectors: vec![
                r#"input[type="search"]"#.to_string(),
                r#"input[name="q"]"#.to_string(),
                "input.search-field".to_string(),
                "#search".to_string(),
                r#"[placeholder*="Search"]"#.to_string(),
                r#"[placeholder*="search"]"#.to_string(),
            ],
            script_expressions: vec![
                "window.algoliaConfig && window.algoliaConfig.apiKey".to_string(),
                "window.algoliaBundle && window.algoliaBundle.config && window.algoliaBundle.config.apiKey".to_string(),
                "window.algoliasearch && window.algoliasearch._config && window.algoliasearch._config.apiKey".to_string(),
            ],
            alternate_links: Vec::new(),
            wait: Duration::from_secs(3),
            poll_interval: Duration::from_millis(250),
            min_token_length: 20,
        }
    }
}

/// What one capture method did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodAttempt {
    pub method: CaptureMethod,
    /// Index API calls observed while this method ran.
    pub index_calls: usize,
    /// Why the method could not run or was cut short.
    pub error: Option<String>,
}

/// Every capture method was exhausted without a usable token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryFailure {
    pub attempts: Vec<MethodAttempt>,
    /// Set when the browser could not be started at all.
    pub launch_error: Option<String>,
    pub cancelled: bool,
}

impl RecoveryFailure {
    pub fn index_calls(&self) -> usize {
        self.attempts.iter().map(|a| a.index_calls).sum()
    }

    /// `true` when the site made index calls but none carried a usable token.
    pub fn saw_index_traffic(&self) -> bool {
        self.index_calls() > 0
    }
}

impl fmt::Display for RecoveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.launch_error {
            return write!(f, "credential recovery failed: browser unavailable: {}", err);
        }
        if self.cancelled {
            return write!(f, "credential recovery cancelled");
        }
        write!(f, "credential recovery failed after {} method(s)", self.attempts.len())?;
        for attempt in &self.attempts {
            write!(f, "; {}: {} index call(s)", attempt.method, attempt.index_calls)?;
            if let Some(err) = &attempt.error {
                write!(f, " ({})", err)?;
            }
        }
        if self.saw_index_traffic() {
            write!(
                f,
                "; the site called the index {} time(s) but no usable token was captured",
                self.index_calls()
            )
        } else {
            write!(f, "; the site never called the index API")
        }
    }
}

impl std::error::Error for RecoveryFailure {}

pub struct RecoveryAgent<'a> {
    driver: &'a dyn CaptureDriver,
    settings: &'a RecoverySettings,
}

impl<'a> RecoveryAgent<'a> {
    pub fn new(driver: &'a dyn CaptureDriver, settings: &'a RecoverySettings) -> Self {
        Self { driver, settings }
    }

    /// Try each capture method in order until one yields a token.
    pub async fn recover(&self, interrupt: &Interrupt) -> Result<CredentialSet, RecoveryFailure> {
        let mut failure = RecoveryFailure {
            attempts: Vec::new(),
            launch_error: None,
            cancelled: false,
        };

        let mut session = match self.driver.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "could not start capture browser");
                failure.launch_error = Some(format!("{:#}", e));
                return Err(failure);
            }
        };

        let mut found = None;
        for method in CaptureMethod::ALL {
            if interrupt.is_interrupted() {
                failure.cancelled = true;
                break;
            }

            let calls_before = session.traffic().index_calls;
            info!(%method, "trying credential capture method");
            let result = self.run_method(method, session.as_mut(), interrupt).await;
            let attempt = MethodAttempt {
                method,
                index_calls: session.traffic().index_calls.saturating_sub(calls_before),
                error: result.as_ref().err().cloned(),
            };
            debug!(%method, index_calls = attempt.index_calls, error = ?attempt.error, "capture method finished");
            failure.attempts.push(attempt);

            if let Ok(Some(token)) = result {
                found = Some(token);
                break;
            }
        }

        session.close().await;

        match found {
            Some(token) => {
                let credential = CredentialSet::auto_refreshed(token);
                info!(fingerprint = %credential.fingerprint(), "captured fresh credential");
                Ok(credential)
            }
            None => {
                warn!(
                    index_calls = failure.index_calls(),
                    methods = failure.attempts.len(),
                    "credential recovery exhausted every method"
                );
                Err(failure)
            }
        }
    }

    async fn run_method(
        &self,
        method: CaptureMethod,
        session: &mut dyn CaptureSession,
        interrupt: &Interrupt,
    ) -> Result<Option<String>, String> {
        match method {
            CaptureMethod::DeepLink => match &self.settings.deep_link {
                Some(url) => self.visit(session, url, interrupt).await,
                None => Err("no deep link configured".to_string()),
            },
            CaptureMethod::SearchInteraction => {
                if let Some(url) = &self.settings.search_page {
                    session.navigate(url).await.map_err(|e| format!("{:#}", e))?;
                }
                let submitted = session
                    .submit_search(&self.settings.search_selectors, &self.settings.search_query)
                    .await
                    .map_err(|e| format!("{:#}", e))?;
                if !submitted {
                    return Err("no search input found".to_string());
                }
                Ok(self.wait_for_token(session, interrupt).await)
            }
            CaptureMethod::ScriptIntrospection => {
                for expression in &self.settings.script_expressions {
                    match session.evaluate(expression).await {
                        Ok(Some(value)) if self.is_usable(&value) => return Ok(Some(value)),
                        Ok(_) => {}
                        Err(e) => debug!(%expression, error = %e, "script expression failed"),
                    }
                }
                Ok(self.first_usable(session))
            }
            CaptureMethod::AlternateLinks => {
                if self.settings.alternate_links.is_empty() {
                    return Err("no alternate links configured".to_string());
                }
                for url in &self.settings.alternate_links {
                    match self.visit(session, url, interrupt).await {
                        Ok(Some(token)) => return Ok(Some(token)),
                        Ok(None) => {}
                        Err(e) => debug!(%url, error = %e, "alternate link failed"),
                    }
                }
                Ok(None)
            }
        }
    }

    async fn visit(
        &self,
        session: &mut dyn CaptureSession,
        url: &str,
        interrupt: &Interrupt,
    ) -> Result<Option<String>, String> {
        session.navigate(url).await.map_err(|e| format!("{:#}", e))?;
        Ok(self.wait_for_token(session, interrupt).await)
    }

    /// Poll captured traffic until a usable token shows up or the wait
    /// window closes.
    async fn wait_for_token(
        &self,
        session: &mut dyn CaptureSession,
        interrupt: &Interrupt,
    ) -> Option<String> {
        let deadline = Instant::now() + self.settings.wait;
        loop {
            if let Some(token) = self.first_usable(session) {
                return Some(token);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let step = self.settings.poll_interval.min(deadline - now);
            if interrupt.sleep(step).await.is_err() {
                return None;
            }
        }
    }

    fn first_usable(&self, session: &dyn CaptureSession) -> Option<String> {
        session
            .traffic()
            .tokens
            .into_iter()
            .find(|t| self.is_usable(t))
    }

    fn is_usable(&self, token: &str) -> bool {
        validate_token(token, self.settings.min_token_length).is_ok()
    }
}
