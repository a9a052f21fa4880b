//! Token-free fallback harvesting.
//!
//! Walks each entry point's public listing pages (`listing_url` with
//! `{page}` substituted, starting at 1) and extracts items from the HTML.
//! Slower and less detailed than the primary path, so the inter-page
//! delay is longer.
//!
//! A page run stops at the first of:
//! - a page with no items,
//! - a page that repeats the previous page's ids (sites that clamp
//!   out-of-range page numbers),
//! - no next-page marker,
//! - a page lost after retries,
//! - the page ceiling.

use tracing::{debug, info, warn};

use crate::dedup::DedupIndex;
use crate::error::{HarvestError, PageError};
use crate::models::{CatalogItem, EntryOutcome, EntryPoint, EntryStats, Strategy};
use crate::pacing::{Interrupt, Pacer, RetryPolicy};
use crate::traits::{ItemExtractor, PageSource};

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// Hard upper bound on pages per entry point.
    pub page_ceiling: u32,
    pub retry: RetryPolicy,
    /// Delay between successive pages.
    pub pacer: Pacer,
    /// Longer back-off after a blocked response.
    pub blocked_backoff: Pacer,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            page_ceiling: 100,
            retry: RetryPolicy::new(3, std::time::Duration::from_secs(3)),
            pacer: Pacer::from_millis(3000, 6000),
            blocked_backoff: Pacer::from_millis(5000, 10000),
        }
    }
}

pub struct FallbackHarvester<'a> {
    pages: &'a dyn PageSource,
    extractor: &'a dyn ItemExtractor,
    settings: &'a FallbackSettings,
    interrupt: &'a Interrupt,
}

impl<'a> FallbackHarvester<'a> {
    pub fn new(
        pages: &'a dyn PageSource,
        extractor: &'a dyn ItemExtractor,
        settings: &'a FallbackSettings,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            pages,
            extractor,
            settings,
            interrupt,
        }
    }

    /// Harvest one entry point's listing pages, appending new items to
    /// `items`.
    ///
    /// An entry point the primary strategy already harvested keeps its
    /// outcome: a failed crawl only adds nothing. Otherwise `stats.outcome`
    /// is set from the crawl. `stats.strategy` names fallback once it
    /// contributes items or decides the outcome. Only cancellation is
    /// returned as an error.
    pub async fn harvest_entry(
        &self,
        entry: &EntryPoint,
        dedup: &DedupIndex,
        stats: &mut EntryStats,
        items: &mut Vec<CatalogItem>,
    ) -> Result<(), HarvestError> {
        let already_harvested = stats.outcome == EntryOutcome::Harvested;

        let Some(template) = entry.listing_url.as_deref() else {
            if already_harvested {
                debug!(entry = %entry.name, "no listing URL, keeping primary results");
            } else {
                warn!(entry = %entry.name, "no listing URL configured, skipping fallback");
                stats.strategy = Some(Strategy::Fallback);
                stats.outcome = EntryOutcome::Failed("no listing URL configured".to_string());
            }
            return Ok(());
        };

        info!(entry = %entry.name, extractor = self.extractor.name(), "fallback harvesting");

        let mut harvested = 0u64;
        let mut previous_ids: Option<Vec<String>> = None;
        let mut first_failure = None;

        for page in 1..=self.settings.page_ceiling {
            let url = template.replace("{page}", &page.to_string());

            let body = match self.fetch_with_retry(&url).await? {
                Ok(body) => body,
                Err(reason) => {
                    warn!(entry = %entry.name, page, %url, %reason, "listing page lost");
                    if !already_harvested {
                        stats.lost_pages += 1;
                    }
                    if page == 1 {
                        first_failure = Some(reason);
                    }
                    break;
                }
            };

            let extracted = self.extractor.extract(&body, entry);
            stats.malformed += extracted.malformed;

            if extracted.items.is_empty() {
                debug!(entry = %entry.name, page, "no items on page, last page");
                break;
            }

            let ids: Vec<String> = extracted.items.iter().map(|i| i.id.clone()).collect();
            if previous_ids.as_ref() == Some(&ids) {
                debug!(entry = %entry.name, page, "page repeats previous page, stopping");
                break;
            }

            let mut fresh = 0u64;
            for item in extracted.items {
                match dedup.admit(item) {
                    Some(item) => {
                        items.push(item);
                        fresh += 1;
                    }
                    None => stats.duplicates += 1,
                }
            }
            stats.items += fresh;
            harvested += fresh;
            info!(entry = %entry.name, page, fresh, total = harvested, "listing page harvested");

            if !extracted.has_next {
                break;
            }
            if page == self.settings.page_ceiling {
                warn!(entry = %entry.name, ceiling = page, "fallback page ceiling reached");
                break;
            }

            previous_ids = Some(ids);
            self.interrupt.pace(&self.settings.pacer).await?;
        }

        if already_harvested {
            if harvested > 0 {
                stats.strategy = Some(Strategy::Fallback);
            }
            return Ok(());
        }
        stats.strategy = Some(Strategy::Fallback);
        stats.outcome = match first_failure {
            Some(reason) => EntryOutcome::Failed(reason),
            None => EntryOutcome::Harvested,
        };
        Ok(())
    }

    /// One page with retries. The inner `Err` is the reason the page was
    /// given up on.
    async fn fetch_with_retry(&self, url: &str) -> Result<Result<String, String>, HarvestError> {
        let attempts = self.settings.retry.attempts;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            self.interrupt.check()?;

            match self.pages.fetch(url).await {
                Ok(body) => return Ok(Ok(body)),
                Err(PageError::Unavailable(status)) => {
                    return Ok(Err(format!("HTTP {}", status)));
                }
                Err(e @ PageError::Blocked(_)) => {
                    warn!(attempt, attempts, %url, "blocked, backing off");
                    last_error = e.to_string();
                    if attempt < attempts {
                        self.interrupt.pace(&self.settings.blocked_backoff).await?;
                    }
                }
                Err(e) => {
                    warn!(attempt, attempts, %url, error = %e, "page fetch failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::traits::ExtractedPage;

    /// Each URL answers with its queued outcomes in order, then 404.
    #[derive(Default)]
    struct QueuedPages {
        queue: Mutex<HashMap<String, VecDeque<Result<String, PageError>>>>,
        fetched: Mutex<Vec<String>>,
    }

    impl QueuedPages {
        fn push(&self, url: &str, outcome: Result<String, PageError>) {
            self.queue
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(outcome);
        }
    }

    #[async_trait]
    impl PageSource for QueuedPages {
        async fn fetch(&self, url: &str) -> Result<String, PageError> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.queue
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Err(PageError::Unavailable(404)))
        }
    }

    /// Body format: comma-separated ids, `;next` when another page follows.
    struct CsvExtractor;

    impl ItemExtractor for CsvExtractor {
        fn name(&self) -> &str {
            "csv"
        }

        fn extract(&self, body: &str, entry: &EntryPoint) -> ExtractedPage {
            let (ids, has_next) = match body.strip_suffix(";next") {
                Some(ids) => (ids, true),
                None => (body, false),
            };
            let items = ids
                .split(',')
                .filter(|id| !id.is_empty())
                .map(|id| CatalogItem {
                    id: id.to_string(),
                    sku: None,
                    name: None,
                    url: format!("https://shop.example/{}.html", id),
                    price: None,
                    brand: entry.name.clone(),
                    in_stock: None,
                    captured_at: Utc::now(),
                })
                .collect();
            ExtractedPage {
                items,
                has_next,
                malformed: 0,
            }
        }
    }

    fn settings() -> FallbackSettings {
        FallbackSettings {
            page_ceiling: 5,
            retry: RetryPolicy::new(3, Duration::ZERO),
            pacer: Pacer::none(),
            blocked_backoff: Pacer::none(),
        }
    }

    fn entry() -> EntryPoint {
        EntryPoint::new("ACME").with_listing_url("https://shop.example/acme.html?p={page}")
    }

    fn url(page: u32) -> String {
        format!("https://shop.example/acme.html?p={}", page)
    }

    async fn harvest(pages: &QueuedPages, settings: &FallbackSettings) -> (EntryStats, Vec<CatalogItem>) {
        let interrupt = Interrupt::never();
        let harvester = FallbackHarvester::new(pages, &CsvExtractor, settings, &interrupt);
        let dedup = DedupIndex::new();
        let mut stats = EntryStats::new("ACME");
        let mut items = Vec::new();
        harvester
            .harvest_entry(&entry(), &dedup, &mut stats, &mut items)
            .await
            .unwrap();
        (stats, items)
    }

    #[tokio::test]
    async fn test_walks_pages_until_no_next() {
        let pages = QueuedPages::default();
        pages.push(&url(1), Ok("a,b;next".to_string()));
        pages.push(&url(2), Ok("c".to_string()));

        let (stats, items) = harvest(&pages, &settings()).await;
        assert_eq!(items.len(), 3);
        assert_eq!(stats.outcome, EntryOutcome::Harvested);
        assert_eq!(stats.strategy, Some(Strategy::Fallback));
        assert_eq!(pages.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_page_is_retried() {
        let pages = QueuedPages::default();
        pages.push(&url(1), Err(PageError::Blocked(403)));
        pages.push(&url(1), Err(PageError::Transient("connection reset".to_string())));
        pages.push(&url(1), Ok("a,b".to_string()));

        let (stats, items) = harvest(&pages, &settings()).await;
        assert_eq!(items.len(), 2);
        assert_eq!(stats.lost_pages, 0);
    }

    #[tokio::test]
    async fn test_missing_first_page_fails_entry() {
        let pages = QueuedPages::default();

        let (stats, items) = harvest(&pages, &settings()).await;
        assert!(items.is_empty());
        assert!(stats.is_failed());
        assert_eq!(stats.lost_pages, 1);
        // 404 is not retried.
        assert_eq!(pages.fetched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_later_page_keeps_earlier_items() {
        let pages = QueuedPages::default();
        pages.push(&url(1), Ok("a,b;next".to_string()));
        for _ in 0..3 {
            pages.push(&url(2), Err(PageError::Blocked(503)));
        }

        let (stats, items) = harvest(&pages, &settings()).await;
        assert_eq!(items.len(), 2);
        assert_eq!(stats.outcome, EntryOutcome::Harvested);
        assert_eq!(stats.lost_pages, 1);
    }

    #[tokio::test]
    async fn test_page_ceiling_bounds_the_walk() {
        let pages = QueuedPages::default();
        for page in 1..=10 {
            pages.push(&url(page), Ok(format!("p{};next", page)));
        }

        let (stats, items) = harvest(&pages, &settings()).await;
        assert_eq!(items.len(), 5);
        assert_eq!(stats.items, 5);
        assert_eq!(pages.fetched.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_entry_without_listing_url() {
        let pages = QueuedPages::default();
        let interrupt = Interrupt::never();
        let settings = settings();
        let harvester = FallbackHarvester::new(&pages, &CsvExtractor, &settings, &interrupt);
        let mut stats = EntryStats::new("ACME");

        harvester
            .harvest_entry(&EntryPoint::new("ACME"), &DedupIndex::new(), &mut stats, &mut Vec::new())
            .await
            .unwrap();
        assert!(stats.is_failed());
        assert!(pages.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_primary_harvested_entry_keeps_its_outcome() {
        let pages = QueuedPages::default();
        let interrupt = Interrupt::never();
        let settings = settings();
        let harvester = FallbackHarvester::new(&pages, &CsvExtractor, &settings, &interrupt);

        let harvested_by_primary = || {
            let mut stats = EntryStats::new("ACME");
            stats.items = 10;
            stats.outcome = EntryOutcome::Harvested;
            stats.strategy = Some(Strategy::Primary);
            stats
        };

        // No listing URL at all.
        let mut stats = harvested_by_primary();
        harvester
            .harvest_entry(&EntryPoint::new("ACME"), &DedupIndex::new(), &mut stats, &mut Vec::new())
            .await
            .unwrap();
        assert_eq!(stats.outcome, EntryOutcome::Harvested);
        assert_eq!(stats.strategy, Some(Strategy::Primary));

        // First listing page lost.
        let mut stats = harvested_by_primary();
        harvester
            .harvest_entry(&entry(), &DedupIndex::new(), &mut stats, &mut Vec::new())
            .await
            .unwrap();
        assert_eq!(stats.outcome, EntryOutcome::Harvested);
        assert_eq!(stats.strategy, Some(Strategy::Primary));
        assert_eq!(stats.lost_pages, 0);
        assert_eq!(stats.items, 10);
    }

    #[tokio::test]
    async fn test_fallback_contribution_is_attributed() {
        let pages = QueuedPages::default();
        pages.push(&url(1), Ok("a,b".to_string()));
        let interrupt = Interrupt::never();
        let settings = settings();
        let harvester = FallbackHarvester::new(&pages, &CsvExtractor, &settings, &interrupt);

        let mut stats = EntryStats::new("ACME");
        stats.outcome = EntryOutcome::Harvested;
        stats.strategy = Some(Strategy::Primary);
        let mut items = Vec::new();
        harvester
            .harvest_entry(&entry(), &DedupIndex::new(), &mut stats, &mut items)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(stats.outcome, EntryOutcome::Harvested);
        assert_eq!(stats.strategy, Some(Strategy::Fallback));
    }
}
