//! Extension seams for the harvesting engine.
//!
//! The engine talks to the outside world only through the traits in this
//! module, so each target site can plug in its own transport, extractor
//! and browser driver, and tests can substitute in-memory fakes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               Harvest Orchestrator            │
//! │  ┌──────────────┐ ┌──────────┐ ┌───────────┐ │
//! │  │ QueryPlanner │ │ Recovery │ │ Fallback  │ │
//! │  │  + Fetcher   │ │  Agent   │ │ Harvester │ │
//! │  └──────┬───────┘ └────┬─────┘ └─────┬─────┘ │
//! └─────────┼──────────────┼─────────────┼───────┘
//!           ▼              ▼             ▼
//!      SearchIndex    CaptureDriver  PageSource + ItemExtractor
//! ```
//!
//! Built-in implementations:
//!
//! | Trait | Implementation |
//! |-------|----------------|
//! | [`SearchIndex`] | [`crate::index_http::HttpSearchIndex`] |
//! | [`PageSource`] | [`crate::pages_http::HttpPageSource`] |
//! | [`ItemExtractor`] | [`crate::extract::SelectorExtractor`] |
//! | [`CaptureDriver`] | [`crate::browser::ChromeCaptureDriver`] |

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{IndexError, PageError};
use crate::filter::QueryFilter;
use crate::models::{CatalogItem, EntryPoint};

// ═══════════════════════════════════════════════════════════════════════
// Remote index
// ═══════════════════════════════════════════════════════════════════════

/// One bounded query against the remote index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub filter: QueryFilter,
    /// Zero-based page number.
    pub page: u32,
    /// Hits per page; `0` turns the query into a count probe.
    pub hits_per_page: u32,
    /// Facet attributes whose value counts should be returned.
    pub facets: Vec<String>,
}

impl IndexQuery {
    /// A zero-hit query that only asks for the match count.
    pub fn probe(filter: &QueryFilter) -> Self {
        Self {
            filter: filter.clone(),
            page: 0,
            hits_per_page: 0,
            facets: Vec::new(),
        }
    }

    /// A zero-hit query that also asks for value counts of `facet`.
    pub fn facet_probe(filter: &QueryFilter, facet: &str) -> Self {
        Self {
            facets: vec![facet.to_string()],
            ..Self::probe(filter)
        }
    }

    pub fn page(filter: &QueryFilter, page: u32, hits_per_page: u32) -> Self {
        Self {
            filter: filter.clone(),
            page,
            hits_per_page,
            facets: Vec::new(),
        }
    }
}

/// Response to an [`IndexQuery`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexResponse {
    /// Total items matching the filter, regardless of the ceiling.
    pub total_matches: u64,
    /// Raw hits for the requested page.
    pub hits: Vec<Value>,
    /// `facet attribute -> (value -> count)`.
    pub facets: HashMap<String, HashMap<String, u64>>,
}

/// The hosted search index being harvested.
///
/// Implementations perform exactly one network call per invocation and
/// classify its outcome; retries and pacing are the fetcher's job.
/// Authentication failure must be reported as
/// [`IndexError::Unauthorized`], never as an empty result.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Short label for logs (e.g. the index name).
    fn name(&self) -> &str;

    async fn query(&self, query: &IndexQuery, token: &str) -> Result<IndexResponse, IndexError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Fallback pages
// ═══════════════════════════════════════════════════════════════════════

/// Plain page transport for the token-free fallback strategy.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page body by URL. One network call, no retries.
    async fn fetch(&self, url: &str) -> Result<String, PageError>;
}

/// Items found on one listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedPage {
    pub items: Vec<CatalogItem>,
    /// Whether the page advertises a following page.
    pub has_next: bool,
    /// Item blocks that were present but could not be parsed.
    pub malformed: u64,
}

/// Site-specific conversion of a listing page into catalog items.
pub trait ItemExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, body: &str, entry: &EntryPoint) -> ExtractedPage;
}

// ═══════════════════════════════════════════════════════════════════════
// Credential capture
// ═══════════════════════════════════════════════════════════════════════

/// What a capture session has seen on the wire so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Requests observed to the index API origin.
    pub index_calls: usize,
    /// Token header values seen on those requests, in arrival order.
    pub tokens: Vec<String>,
}

/// Launches browser sessions that observe outgoing index-API traffic.
#[async_trait]
pub trait CaptureDriver: Send + Sync {
    async fn open(&self) -> Result<Box<dyn CaptureSession>>;
}

/// One live browser page with request interception enabled.
#[async_trait]
pub trait CaptureSession: Send {
    /// Load `url` and wait for the DOM to be ready.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Type `query` into the first visible element matching one of
    /// `selectors` and submit it. Returns `false` when none matched.
    async fn submit_search(&mut self, selectors: &[String], query: &str) -> Result<bool>;

    /// Evaluate a script expression in the page, returning a string
    /// result if it produced one.
    async fn evaluate(&mut self, expression: &str) -> Result<Option<String>>;

    fn traffic(&self) -> TrafficSnapshot;

    async fn close(self: Box<Self>);
}
