//! Page fetcher: one bounded index query with retries.
//!
//! Three outcomes per call:
//!
//! - success → hits, plus `has_more` when the page came back full;
//! - transient failure (timeout, 5xx, malformed body) → retried up to the
//!   attempt limit, then reported as lost (the caller treats it as "no
//!   more data" for this page);
//! - authentication failure → returned immediately as
//!   [`HarvestError::CredentialExpired`], never retried here.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::credential::CredentialStore;
use crate::error::{HarvestError, IndexError};
use crate::filter::QueryFilter;
use crate::pacing::{Interrupt, Pacer, RetryPolicy};
use crate::traits::{IndexQuery, IndexResponse, SearchIndex};

/// Knobs for the primary fetch path.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub pacer: Pacer,
}

/// Result of fetching one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Hits { hits: Vec<Value>, has_more: bool },
    /// Retries exhausted; data for this page is missing.
    Lost(String),
}

/// Result of a count probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Matches {
        total: u64,
        facets: HashMap<String, HashMap<String, u64>>,
    },
    Lost(String),
}

/// Executes single index queries for the planner.
pub struct PageFetcher<'a> {
    index: &'a dyn SearchIndex,
    credentials: &'a CredentialStore,
    settings: &'a FetchSettings,
    interrupt: &'a Interrupt,
}

impl<'a> PageFetcher<'a> {
    pub fn new(
        index: &'a dyn SearchIndex,
        credentials: &'a CredentialStore,
        settings: &'a FetchSettings,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            index,
            credentials,
            settings,
            interrupt,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.settings.page_size
    }

    /// Fetch page `page` (zero-based) of `filter`.
    pub async fn fetch_page(
        &self,
        filter: &QueryFilter,
        page: u32,
    ) -> Result<PageOutcome, HarvestError> {
        let query = IndexQuery::page(filter, page, self.settings.page_size);
        match self.execute(&query).await? {
            Ok(response) => {
                let has_more = response.hits.len() as u64 == u64::from(self.settings.page_size);
                Ok(PageOutcome::Hits {
                    hits: response.hits,
                    has_more,
                })
            }
            Err(reason) => Ok(PageOutcome::Lost(reason)),
        }
    }

    /// Ask how many items match `filter` without fetching any.
    pub async fn probe(&self, filter: &QueryFilter) -> Result<Probe, HarvestError> {
        self.probe_query(&IndexQuery::probe(filter)).await
    }

    /// Count probe that also returns value counts for `facet`.
    pub async fn probe_facet(
        &self,
        filter: &QueryFilter,
        facet: &str,
    ) -> Result<Probe, HarvestError> {
        self.probe_query(&IndexQuery::facet_probe(filter, facet)).await
    }

    async fn probe_query(&self, query: &IndexQuery) -> Result<Probe, HarvestError> {
        Ok(match self.execute(query).await? {
            Ok(response) => Probe::Matches {
                total: response.total_matches,
                facets: response.facets,
            },
            Err(reason) => Probe::Lost(reason),
        })
    }

    /// Run one query with retries. The inner `Err` carries the last
    /// transient failure once every attempt is spent.
    async fn execute(
        &self,
        query: &IndexQuery,
    ) -> Result<Result<IndexResponse, String>, HarvestError> {
        let attempts = self.settings.retry.attempts;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            self.interrupt.check()?;
            let token = self.credentials.token();

            match self.index.query(query, &token).await {
                Ok(response) => {
                    debug!(
                        index = self.index.name(),
                        filter = %query.filter.describe(),
                        page = query.page,
                        hits = response.hits.len(),
                        total = response.total_matches,
                        "index query ok"
                    );
                    // The response is already in hand; the next call's
                    // check stops the loop instead.
                    if self.interrupt.pace(&self.settings.pacer).await.is_err() {
                        debug!("interrupted while pacing, keeping received page");
                    }
                    return Ok(Ok(response));
                }
                Err(IndexError::Unauthorized { status, message }) => {
                    warn!(status, filter = %query.filter.describe(), "index rejected credential");
                    return Err(HarvestError::CredentialExpired(format!(
                        "HTTP {}: {}",
                        status,
                        truncate(&message, 200)
                    )));
                }
                Err(e) => {
                    warn!(
                        attempt,
                        attempts,
                        filter = %query.filter.describe(),
                        page = query.page,
                        error = %e,
                        "index query failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        self.interrupt.sleep(self.settings.retry.delay).await?;
                    }
                }
            }
        }

        Ok(Err(last_error))
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Index that replays a fixed list of outcomes, one per call.
    struct ScriptedIndex {
        script: Mutex<VecDeque<Result<IndexResponse, IndexError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedIndex {
        fn new(script: Vec<Result<IndexResponse, IndexError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SearchIndex for ScriptedIndex {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn query(&self, _query: &IndexQuery, _token: &str) -> Result<IndexResponse, IndexError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(IndexError::Transient("script exhausted".to_string())))
        }
    }

    fn settings() -> FetchSettings {
        FetchSettings {
            page_size: 2,
            retry: RetryPolicy::new(3, Duration::ZERO),
            pacer: Pacer::none(),
        }
    }

    fn response(total: u64, hits: usize) -> IndexResponse {
        IndexResponse {
            total_matches: total,
            hits: (0..hits).map(|i| json!({ "objectID": i })).collect(),
            facets: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let index = ScriptedIndex::new(vec![
            Err(IndexError::Transient("HTTP 503".to_string())),
            Err(IndexError::Malformed("truncated body".to_string())),
            Ok(response(5, 2)),
        ]);
        let credentials = CredentialStore::in_memory(None);
        let settings = settings();
        let interrupt = Interrupt::never();
        let fetcher = PageFetcher::new(&index, &credentials, &settings, &interrupt);

        let outcome = fetcher.fetch_page(&QueryFilter::new(), 0).await.unwrap();
        match outcome {
            PageOutcome::Hits { hits, has_more } => {
                assert_eq!(hits.len(), 2);
                assert!(has_more);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(index.calls(), 3);
    }

    #[tokio::test]
    async fn test_page_lost_after_attempts_exhausted() {
        let index = ScriptedIndex::new(Vec::new());
        let credentials = CredentialStore::in_memory(None);
        let settings = settings();
        let interrupt = Interrupt::never();
        let fetcher = PageFetcher::new(&index, &credentials, &settings, &interrupt);

        let outcome = fetcher.fetch_page(&QueryFilter::new(), 3).await.unwrap();
        assert!(matches!(outcome, PageOutcome::Lost(_)));
        assert_eq!(index.calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_never_retried() {
        let index = ScriptedIndex::new(vec![
            Err(IndexError::Unauthorized {
                status: 403,
                message: "Invalid API key".to_string(),
            }),
            Ok(response(5, 2)),
        ]);
        let credentials = CredentialStore::in_memory(None);
        let settings = settings();
        let interrupt = Interrupt::never();
        let fetcher = PageFetcher::new(&index, &credentials, &settings, &interrupt);

        let err = fetcher.probe(&QueryFilter::new()).await.unwrap_err();
        assert!(matches!(err, HarvestError::CredentialExpired(_)));
        assert_eq!(index.calls(), 1);
    }

    #[tokio::test]
    async fn test_short_page_has_no_more() {
        let index = ScriptedIndex::new(vec![Ok(response(3, 1))]);
        let credentials = CredentialStore::in_memory(None);
        let settings = settings();
        let interrupt = Interrupt::never();
        let fetcher = PageFetcher::new(&index, &credentials, &settings, &interrupt);

        let outcome = fetcher.fetch_page(&QueryFilter::new(), 1).await.unwrap();
        assert!(matches!(outcome, PageOutcome::Hits { has_more: false, .. }));
    }

    /// Index whose first answer arrives together with an interrupt.
    struct CancellingIndex {
        token: tokio_util::sync::CancellationToken,
    }

    #[async_trait]
    impl SearchIndex for CancellingIndex {
        fn name(&self) -> &str {
            "cancelling"
        }

        async fn query(&self, _query: &IndexQuery, _token: &str) -> Result<IndexResponse, IndexError> {
            self.token.cancel();
            Ok(response(4, 2))
        }
    }

    #[tokio::test]
    async fn test_page_received_before_interrupt_is_kept() {
        let token = tokio_util::sync::CancellationToken::new();
        let index = CancellingIndex { token: token.clone() };
        let credentials = CredentialStore::in_memory(None);
        let settings = FetchSettings {
            pacer: Pacer::from_millis(50, 100),
            ..settings()
        };
        let interrupt = Interrupt::new(token);
        let fetcher = PageFetcher::new(&index, &credentials, &settings, &interrupt);

        let outcome = fetcher.fetch_page(&QueryFilter::new(), 0).await.unwrap();
        assert!(matches!(outcome, PageOutcome::Hits { ref hits, .. } if hits.len() == 2));

        let err = fetcher.fetch_page(&QueryFilter::new(), 1).await.unwrap_err();
        assert!(matches!(err, HarvestError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let index = ScriptedIndex::new(vec![Ok(response(1, 1))]);
        let credentials = CredentialStore::in_memory(None);
        let settings = settings();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let interrupt = Interrupt::new(token);
        let fetcher = PageFetcher::new(&index, &credentials, &settings, &interrupt);

        let err = fetcher.probe(&QueryFilter::new()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Cancelled));
        assert_eq!(index.calls(), 0);
    }
}
