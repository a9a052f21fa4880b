//! # Catalog Harvest
//!
//! A resilient catalog-harvesting engine for storefronts backed by a hosted
//! search index.
//!
//! The hosted index never exposes more than a fixed number of items for
//! one query. Catalog Harvest probes each entry point's match count and
//! splits over-large filters into disjoint price (or facet) partitions
//! until every partition is enumerable. When the index rejects the access
//! token it captures a fresh one from the live site with a headless
//! browser, and when that fails it falls back to crawling listing pages.
//! Every item is emitted once, whichever partition or strategy found it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Orchestrator │──▶│ QueryPlanner │──▶│ PageFetcher │──▶ SearchIndex
//! │ (state       │   └──────┬───────┘   └─────────────┘
//! │  machine)    │          ▼
//! │              │   ┌──────────────┐
//! │              │──▶│  DedupIndex  │◀──┐
//! │              │   └──────────────┘   │
//! │              │──▶ RecoveryAgent ──▶ CaptureDriver (Chromium)
//! │              │──▶ FallbackHarvester ──▶ PageSource + ItemExtractor
//! └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest entries                         # list configured entry points
//! harvest probe ACME                      # match counts per price band
//! harvest run --output catalog.json       # full session
//! harvest credential recover              # capture a fresh token only
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Catalog items, credentials, entry points, reports |
//! | [`filter`] | Query filters, price ranges and range splitting |
//! | [`planner`] | Ceiling-aware partition planning |
//! | [`fetcher`] | Single index queries with retries |
//! | [`dedup`] | Session-wide id set |
//! | [`credential`] | Token slot with optional key file |
//! | [`recovery`] | Token capture from live site traffic |
//! | [`browser`] | Chromium capture driver |
//! | [`fallback`] | Listing-page crawling |
//! | [`extract`] | CSS-selector item extraction |
//! | [`orchestrator`] | Session state machine |
//! | [`traits`] | Extension seams |

pub mod browser;
pub mod config;
pub mod credential;
pub mod dedup;
pub mod entries;
pub mod error;
pub mod export;
pub mod extract;
pub mod fallback;
pub mod fetcher;
pub mod filter;
pub mod index_http;
pub mod models;
pub mod orchestrator;
pub mod pacing;
pub mod pages_http;
pub mod planner;
pub mod progress;
pub mod recovery;
pub mod traits;
