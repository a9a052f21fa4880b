//! Harvest orchestration.
//!
//! [`HarvestEngine::harvest`] runs one session as a small state machine:
//!
//! ```text
//!            credential expired (first time)
//!   Primary ─────────────────────────────────▶ Recovering
//!     │  ▲                                        │
//!     │  └──────── token captured (resume) ───────┘
//!     │                                           │ recovery failed
//!     │ credential expired (again) / short run    ▼
//!     └──────────────────────────────────────▶ Fallback ──▶ Done
//! ```
//!
//! - `Primary` plans and harvests each entry point in order. A rejected
//!   credential is global to the session; any other per-entry failure is
//!   recorded and the next entry point runs.
//! - `Recovering` runs the recovery agent at most once per session and
//!   resumes `Primary` at the entry point that failed.
//! - `Fallback` crawls listing pages for every entry point, merging into
//!   the same dedup index so nothing already collected is repeated.
//!
//! The engine never returns an error: the report's status, strategy and
//! per-entry stats say how complete the result is.

use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::browser::ChromeCaptureDriver;
use crate::config::Config;
use crate::credential::CredentialStore;
use crate::dedup::DedupIndex;
use crate::error::HarvestError;
use crate::extract::SelectorExtractor;
use crate::fallback::{FallbackHarvester, FallbackSettings};
use crate::fetcher::{FetchSettings, PageFetcher};
use crate::filter::QueryFilter;
use crate::index_http::HttpSearchIndex;
use crate::models::{
    CatalogItem, EntryOutcome, EntryPoint, EntryStats, HarvestReport, HarvestStatus, Strategy,
};
use crate::pacing::{Interrupt, Pacer};
use crate::pages_http::HttpPageSource;
use crate::planner::{BandCount, PlannerSettings, QueryPlanner};
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter};
use crate::recovery::{RecoveryAgent, RecoveryFailure, RecoverySettings};
use crate::traits::{CaptureDriver, ItemExtractor, PageSource, SearchIndex};

/// Which strategies a session may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyMode {
    /// Primary with recovery, then fallback.
    #[default]
    Auto,
    /// Primary with recovery only; never crawl pages.
    Primary,
    /// Skip the index entirely.
    Fallback,
}

impl FromStr for StrategyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(StrategyMode::Auto),
            "primary" => Ok(StrategyMode::Primary),
            "fallback" => Ok(StrategyMode::Fallback),
            other => Err(format!(
                "unknown strategy '{}' (expected auto, primary or fallback)",
                other
            )),
        }
    }
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fetch: FetchSettings,
    pub planner: PlannerSettings,
    pub fallback: FallbackSettings,
    pub recovery: RecoverySettings,
    /// Facet attribute an entry point's value constrains (e.g. `brand`).
    pub entry_attribute: String,
    /// Pause between entry points.
    pub entry_pause: Pacer,
    /// Primary results below this count are treated as a silently expired
    /// credential. `0` disables the check.
    pub min_expected_items: u64,
    pub recovery_enabled: bool,
    pub fallback_enabled: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fetch: FetchSettings {
                page_size: 1000,
                retry: Default::default(),
                pacer: Pacer::from_millis(500, 1500),
            },
            planner: PlannerSettings::default(),
            fallback: FallbackSettings::default(),
            recovery: RecoverySettings::default(),
            entry_attribute: "brand".to_string(),
            entry_pause: Pacer::from_millis(1000, 2000),
            min_expected_items: 0,
            recovery_enabled: true,
            fallback_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Primary { cursor: usize },
    Recovering { cursor: usize },
    Fallback,
    Done,
}

/// How a primary pass over the entry points ended.
enum PrimaryExit {
    Finished,
    CredentialExpired { cursor: usize, reason: String },
    Cancelled,
}

/// Mutable state of one session.
struct Session<'e> {
    id: String,
    entries: &'e [EntryPoint],
    dedup: DedupIndex,
    items: Vec<CatalogItem>,
    stats: Vec<EntryStats>,
    recovery_attempted: bool,
    strategy_used: Option<Strategy>,
    cancelled: bool,
}

impl Session<'_> {
    fn item_count(&self) -> u64 {
        self.items.len() as u64
    }
}

/// The harvesting engine: collaborators plus settings.
pub struct HarvestEngine {
    index: Arc<dyn SearchIndex>,
    pages: Arc<dyn PageSource>,
    extractor: Arc<dyn ItemExtractor>,
    capture: Option<Arc<dyn CaptureDriver>>,
    credentials: Arc<CredentialStore>,
    settings: EngineSettings,
}

impl HarvestEngine {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        pages: Arc<dyn PageSource>,
        extractor: Arc<dyn ItemExtractor>,
        credentials: Arc<CredentialStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            index,
            pages,
            extractor,
            capture: None,
            credentials,
            settings,
        }
    }

    /// Build the engine with the HTTP index, HTTP page source, selector
    /// extractor and (when recovery is enabled) a Chromium capture driver.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let credentials = CredentialStore::load(
            config.index.token.as_deref(),
            config.index.key_file.as_deref(),
        )?;
        let index = HttpSearchIndex::new(config.index_endpoint())?;
        let referer = config
            .index
            .site_origin
            .as_ref()
            .map(|origin| format!("{}/", origin.trim_end_matches('/')));
        let pages = HttpPageSource::new(
            &config.index.user_agent,
            referer,
            std::time::Duration::from_secs(config.index.timeout_secs),
        )?;
        let extractor = SelectorExtractor::new(&config.fallback.selectors)?;

        let engine = Self::new(
            Arc::new(index),
            Arc::new(pages),
            Arc::new(extractor),
            Arc::new(credentials),
            config.engine_settings(),
        );
        Ok(if config.recovery.enabled {
            engine.with_capture(Arc::new(ChromeCaptureDriver::new(config.browser_settings())))
        } else {
            engine
        })
    }

    /// Enable credential recovery through `driver`.
    pub fn with_capture(mut self, driver: Arc<dyn CaptureDriver>) -> Self {
        self.capture = Some(driver);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Root filter for an entry point.
    pub fn root_filter(&self, entry: &EntryPoint) -> QueryFilter {
        QueryFilter::new().with(&self.settings.entry_attribute, &entry.value)
    }

    /// Match counts for an entry point and its first-level price bands.
    pub async fn survey(
        &self,
        entry: &EntryPoint,
        interrupt: &Interrupt,
    ) -> Result<(Option<u64>, Vec<BandCount>), HarvestError> {
        let fetcher = PageFetcher::new(
            self.index.as_ref(),
            &self.credentials,
            &self.settings.fetch,
            interrupt,
        );
        let dedup = DedupIndex::new();
        let planner = QueryPlanner::new(&fetcher, &self.settings.planner, &dedup);
        planner.survey(&self.root_filter(entry)).await
    }

    /// Run a full harvest session over `entries`.
    pub async fn harvest(
        &self,
        entries: &[EntryPoint],
        mode: StrategyMode,
        interrupt: &Interrupt,
        progress: &dyn HarvestProgressReporter,
    ) -> HarvestReport {
        let started_at = Utc::now();
        let mut session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            entries,
            dedup: DedupIndex::new(),
            items: Vec::new(),
            stats: entries.iter().map(|e| EntryStats::new(&e.name)).collect(),
            recovery_attempted: false,
            strategy_used: None,
            cancelled: false,
        };
        info!(session = %session.id, entries = entries.len(), ?mode, "harvest session started");

        let mut state = match mode {
            StrategyMode::Fallback => State::Fallback,
            _ => State::Primary { cursor: 0 },
        };

        while state != State::Done {
            state = match state {
                State::Primary { cursor } => {
                    session.strategy_used = Some(Strategy::Primary);
                    let exit = self.run_primary(&mut session, cursor, interrupt, progress).await;
                    self.after_primary(&mut session, exit, mode, progress)
                }
                State::Recovering { cursor } => {
                    self.recover(&mut session, cursor, mode, interrupt, progress)
                        .await
                }
                State::Fallback => {
                    session.strategy_used = Some(Strategy::Fallback);
                    self.run_fallback(&mut session, interrupt, progress).await;
                    State::Done
                }
                State::Done => State::Done,
            };
        }

        let status = session_status(&session);
        info!(
            session = %session.id,
            items = session.items.len(),
            strategy = ?session.strategy_used,
            ?status,
            recovery_attempted = session.recovery_attempted,
            "harvest session finished"
        );

        HarvestReport {
            session_id: session.id,
            items: session.items,
            strategy_used: session.strategy_used,
            status,
            recovery_attempted: session.recovery_attempted,
            entries: session.stats,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Run the recovery agent alone and install the captured credential.
    pub async fn recover_credential(
        &self,
        interrupt: &Interrupt,
    ) -> anyhow::Result<Result<(), RecoveryFailure>> {
        let Some(driver) = &self.capture else {
            anyhow::bail!("no capture driver configured");
        };
        let agent = RecoveryAgent::new(driver.as_ref(), &self.settings.recovery);
        match agent.recover(interrupt).await {
            Ok(credential) => {
                self.credentials.replace(credential)?;
                Ok(Ok(()))
            }
            Err(failure) => Ok(Err(failure)),
        }
    }

    async fn run_primary(
        &self,
        session: &mut Session<'_>,
        cursor: usize,
        interrupt: &Interrupt,
        progress: &dyn HarvestProgressReporter,
    ) -> PrimaryExit {
        let fetcher = PageFetcher::new(
            self.index.as_ref(),
            &self.credentials,
            &self.settings.fetch,
            interrupt,
        );
        let planner = QueryPlanner::new(&fetcher, &self.settings.planner, &session.dedup);
        let entries = session.entries;
        let total = entries.len();

        for (i, entry) in entries.iter().enumerate().skip(cursor) {
            if interrupt.is_interrupted() {
                return PrimaryExit::Cancelled;
            }
            progress.report(HarvestProgressEvent::EntryStarted {
                strategy: Strategy::Primary,
                entry: entry.name.clone(),
                n: i + 1,
                total,
            });

            // Counters restart for a resumed or rerun entry point.
            let earlier = std::mem::replace(&mut session.stats[i], EntryStats::new(&entry.name));
            let stats = &mut session.stats[i];
            stats.strategy = Some(Strategy::Primary);
            let result = planner
                .plan_and_harvest(self.root_filter(entry), &entry.name, stats, &mut session.items)
                .await;
            stats.carry_over(&earlier);

            match result {
                Ok(()) => {
                    stats.outcome = EntryOutcome::Harvested;
                    info!(entry = %entry.name, items = stats.items, "entry point harvested");
                }
                Err(HarvestError::CredentialExpired(reason)) => {
                    return PrimaryExit::CredentialExpired { cursor: i, reason };
                }
                Err(HarvestError::Cancelled) => return PrimaryExit::Cancelled,
                Err(e) => {
                    error!(entry = %entry.name, error = %e, "entry point failed, skipping");
                    stats.outcome = EntryOutcome::Failed(e.to_string());
                }
            }

            let stats = &session.stats[i];
            progress.report(HarvestProgressEvent::EntryFinished {
                strategy: Strategy::Primary,
                entry: entry.name.clone(),
                items: stats.items,
                session_items: session.items.len() as u64,
                failed: stats.is_failed(),
            });

            if i + 1 < total && interrupt.pace(&self.settings.entry_pause).await.is_err() {
                return PrimaryExit::Cancelled;
            }
        }

        PrimaryExit::Finished
    }

    fn after_primary(
        &self,
        session: &mut Session<'_>,
        exit: PrimaryExit,
        mode: StrategyMode,
        progress: &dyn HarvestProgressReporter,
    ) -> State {
        match exit {
            PrimaryExit::Cancelled => {
                warn!("harvest cancelled during primary strategy");
                session.cancelled = true;
                State::Done
            }
            PrimaryExit::CredentialExpired { cursor, reason } => {
                warn!(
                    entry = %session.entries[cursor].name,
                    %reason,
                    "credential rejected by index"
                );
                if self.can_recover(session) {
                    progress.report(HarvestProgressEvent::Recovering { reason });
                    State::Recovering { cursor }
                } else {
                    self.fall_back(session, mode, progress, format!("credential rejected: {}", reason))
                }
            }
            PrimaryExit::Finished => {
                let min = self.settings.min_expected_items;
                if min == 0 || session.item_count() >= min {
                    return State::Done;
                }
                warn!(
                    items = session.item_count(),
                    min_expected = min,
                    "primary harvest is suspiciously short"
                );
                if self.can_recover(session) {
                    progress.report(HarvestProgressEvent::Recovering {
                        reason: format!("only {} items harvested", session.item_count()),
                    });
                    State::Recovering { cursor: 0 }
                } else {
                    self.fall_back(
                        session,
                        mode,
                        progress,
                        format!("only {} of {} expected items", session.item_count(), min),
                    )
                }
            }
        }
    }

    fn can_recover(&self, session: &Session<'_>) -> bool {
        self.settings.recovery_enabled && self.capture.is_some() && !session.recovery_attempted
    }

    fn fall_back(
        &self,
        session: &mut Session<'_>,
        mode: StrategyMode,
        progress: &dyn HarvestProgressReporter,
        reason: String,
    ) -> State {
        if mode == StrategyMode::Primary || !self.settings.fallback_enabled {
            warn!(%reason, "fallback disabled, ending session with primary results");
            mark_pending_failed(session, &reason);
            return State::Done;
        }
        info!(%reason, "switching to fallback strategy");
        progress.report(HarvestProgressEvent::FallingBack { reason });
        State::Fallback
    }

    async fn recover(
        &self,
        session: &mut Session<'_>,
        cursor: usize,
        mode: StrategyMode,
        interrupt: &Interrupt,
        progress: &dyn HarvestProgressReporter,
    ) -> State {
        session.recovery_attempted = true;
        let Some(driver) = &self.capture else {
            return self.fall_back(session, mode, progress, "no capture driver".to_string());
        };

        let agent = RecoveryAgent::new(driver.as_ref(), &self.settings.recovery);
        match agent.recover(interrupt).await {
            Ok(credential) => {
                if let Err(e) = self.credentials.replace(credential) {
                    warn!(error = %e, "could not persist recovered credential");
                }
                info!(
                    resume_at = %session.entries.get(cursor).map_or("", |e| e.name.as_str()),
                    "credential recovered, resuming primary strategy"
                );
                State::Primary { cursor }
            }
            Err(failure) if failure.cancelled || interrupt.is_interrupted() => {
                session.cancelled = true;
                State::Done
            }
            Err(failure) => {
                warn!(%failure, "credential recovery failed");
                self.fall_back(session, mode, progress, failure.to_string())
            }
        }
    }

    async fn run_fallback(
        &self,
        session: &mut Session<'_>,
        interrupt: &Interrupt,
        progress: &dyn HarvestProgressReporter,
    ) {
        let harvester = FallbackHarvester::new(
            self.pages.as_ref(),
            self.extractor.as_ref(),
            &self.settings.fallback,
            interrupt,
        );
        let entries = session.entries;
        let total = entries.len();

        for (i, entry) in entries.iter().enumerate() {
            if interrupt.is_interrupted() {
                session.cancelled = true;
                return;
            }
            progress.report(HarvestProgressEvent::EntryStarted {
                strategy: Strategy::Fallback,
                entry: entry.name.clone(),
                n: i + 1,
                total,
            });

            let stats = &mut session.stats[i];
            let result = harvester
                .harvest_entry(entry, &session.dedup, stats, &mut session.items)
                .await;

            progress.report(HarvestProgressEvent::EntryFinished {
                strategy: Strategy::Fallback,
                entry: entry.name.clone(),
                items: stats.items,
                session_items: session.items.len() as u64,
                failed: stats.is_failed(),
            });

            if result.is_err() {
                warn!("harvest cancelled during fallback strategy");
                session.cancelled = true;
                return;
            }
            if i + 1 < total && interrupt.pace(&self.settings.entry_pause).await.is_err() {
                session.cancelled = true;
                return;
            }
        }
    }
}

fn mark_pending_failed(session: &mut Session<'_>, reason: &str) {
    for stats in &mut session.stats {
        if stats.outcome == EntryOutcome::Pending {
            stats.outcome = EntryOutcome::Failed(reason.to_string());
        }
    }
}

fn session_status(session: &Session<'_>) -> HarvestStatus {
    if session.cancelled {
        return HarvestStatus::Cancelled;
    }
    let any_failed = session
        .stats
        .iter()
        .any(|s| s.is_failed() || s.outcome == EntryOutcome::Pending);
    if session.items.is_empty() && any_failed {
        return HarvestStatus::Failed;
    }
    let degraded = session
        .stats
        .iter()
        .any(|s| s.degraded_partitions > 0 || s.lost_pages > 0);
    if any_failed || degraded {
        HarvestStatus::Partial
    } else {
        HarvestStatus::Complete
    }
}
