//! Headless Chromium capture driver over the DevTools protocol.
//!
//! Each session launches its own browser, opens one page with the Network
//! domain enabled and spawns a listener over `Network.requestWillBeSent`.
//! Every request whose URL contains the configured index host is counted,
//! and its token header (matched case-insensitively) is recorded.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, EventRequestWillBeSent};
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::traits::{CaptureDriver, CaptureSession, TrafficSnapshot};

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// Substring identifying index API requests (e.g. `algolia.net`).
    pub index_host: String,
    /// Request header carrying the token.
    pub token_header: String,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub navigation_timeout: Duration,
}

pub struct ChromeCaptureDriver {
    settings: BrowserSettings,
}

impl ChromeCaptureDriver {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl CaptureDriver for ChromeCaptureDriver {
    async fn open(&self) -> Result<Box<dyn CaptureSession>> {
        let mut builder = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .request_timeout(self.settings.navigation_timeout);
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(ua) = &self.settings.user_agent {
            builder = builder.arg(format!("--user-agent={}", ua));
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("browser config error: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open capture page")?;
        page.execute(EnableParams::default())
            .await
            .context("Failed to enable network events")?;

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("Failed to subscribe to request events")?;

        let traffic = Arc::new(Mutex::new(TrafficSnapshot::default()));
        let sink = Arc::clone(&traffic);
        let index_host = self.settings.index_host.clone();
        let token_header = self.settings.token_header.clone();
        let listener_task = tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                if !event.request.url.contains(&index_host) {
                    continue;
                }
                let token = event
                    .request
                    .headers
                    .inner()
                    .as_object()
                    .and_then(|headers| {
                        headers
                            .iter()
                            .find(|(name, _)| name.eq_ignore_ascii_case(&token_header))
                            .and_then(|(_, value)| value.as_str())
                            .map(str::to_string)
                    });
                let mut snapshot = sink.lock().unwrap_or_else(|p| p.into_inner());
                snapshot.index_calls += 1;
                if let Some(token) = token {
                    snapshot.tokens.push(token);
                }
            }
        });

        Ok(Box::new(ChromeCaptureSession {
            browser,
            page,
            traffic,
            handler_task,
            listener_task,
            navigation_timeout: self.settings.navigation_timeout,
        }))
    }
}

pub struct ChromeCaptureSession {
    browser: Browser,
    page: Page,
    traffic: Arc<Mutex<TrafficSnapshot>>,
    handler_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
    navigation_timeout: Duration,
}

#[async_trait]
impl CaptureSession for ChromeCaptureSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        debug!(%url, "capture navigation");
        tokio::time::timeout(self.navigation_timeout, self.page.goto(url))
            .await
            .map_err(|_| anyhow!("navigation to {} timed out", url))?
            .with_context(|| format!("Failed to navigate to {}", url))?;
        Ok(())
    }

    async fn submit_search(&mut self, selectors: &[String], query: &str) -> Result<bool> {
        for selector in selectors {
            let Ok(input) = self.page.find_element(selector.as_str()).await else {
                continue;
            };
            if input.click().await.is_err() {
                continue;
            }
            input
                .type_str(query)
                .await
                .with_context(|| format!("Failed to type into {}", selector))?;
            input
                .press_key("Enter")
                .await
                .with_context(|| format!("Failed to submit {}", selector))?;
            debug!(%selector, "search submitted");
            return Ok(true);
        }
        Ok(false)
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Option<String>> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .context("Script evaluation failed")?;
        Ok(result.into_value::<Option<String>>().ok().flatten())
    }

    fn traffic(&self) -> TrafficSnapshot {
        self.traffic
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn close(self: Box<Self>) {
        let ChromeCaptureSession {
            mut browser,
            page,
            handler_task,
            listener_task,
            ..
        } = *self;

        listener_task.abort();
        if let Err(e) = page.close().await {
            debug!(error = %e, "capture page close error");
        }
        if let Err(e) = browser.close().await {
            warn!(error = %e, "browser close error");
        }
        let _ = browser.wait().await;
        handler_task.abort();
    }
}
