//! Ceiling-aware query planning.
//!
//! The remote index exposes at most `pagination_ceiling` items for any one
//! filter. [`QueryPlanner::plan_and_harvest`] probes a filter's match
//! count and either paginates it directly or splits it into disjoint
//! children until each child is enumerable.
//!
//! # Algorithm
//!
//! ```text
//! probe(root) ─▶ push (root, depth 0)
//! loop pop (task, count):
//!   count == 0            → skip
//!   count <= ceiling      → paginate(task)
//!   depth >= max_depth    → paginate(task)   (coverage risk, logged)
//!   otherwise             → split task, probe each child, push children (depth + 1)
//! ```
//!
//! Splitting uses half-open price ranges `[lo, hi)` whose last band is
//! open-ended, or (for the first split only) the values of a categorical
//! facet. Partitioning is an explicit work stack so depth stays bounded
//! and stack usage constant.
//!
//! Items with no price are unreachable by range partitioning. They are
//! only surfaced when a filter is paginated without a range, which is why
//! max depth degrades to plain pagination instead of failing.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::dedup::DedupIndex;
use crate::error::HarvestError;
use crate::fetcher::{PageFetcher, PageOutcome, Probe};
use crate::filter::{PartitionTask, QueryFilter, SplitPolicy};
use crate::models::{CatalogItem, EntryStats};

/// Attribute used to split over-large filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionDimension {
    /// Half-open price ranges at every level.
    Price,
    /// Facet values for the first split, price ranges below that.
    Facet(String),
}

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    /// Maximum items any single filter exposes across all its pages.
    pub pagination_ceiling: u64,
    pub max_depth: u32,
    pub split: SplitPolicy,
    pub dimension: PartitionDimension,
    /// Dot path of the price inside a raw hit.
    pub price_attribute: String,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            pagination_ceiling: 1000,
            max_depth: 3,
            split: SplitPolicy::default(),
            dimension: PartitionDimension::Price,
            price_attribute: "price.USD.default".to_string(),
        }
    }
}

/// Match count for one first-level band, as reported by [`QueryPlanner::survey`].
#[derive(Debug, Clone, PartialEq)]
pub struct BandCount {
    pub filter: QueryFilter,
    /// `None` when the probe was lost.
    pub total: Option<u64>,
}

pub struct QueryPlanner<'a> {
    fetcher: &'a PageFetcher<'a>,
    settings: &'a PlannerSettings,
    dedup: &'a DedupIndex,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(
        fetcher: &'a PageFetcher<'a>,
        settings: &'a PlannerSettings,
        dedup: &'a DedupIndex,
    ) -> Self {
        Self {
            fetcher,
            settings,
            dedup,
        }
    }

    /// Harvest every item matching `root`, labelling items with `label`.
    ///
    /// Items not already in the session's dedup index are appended to
    /// `items` as they arrive, so whatever was collected survives an
    /// aborted pass. Credential expiry and cancellation abort the pass; a
    /// lost root probe is reported as [`HarvestError::ProbeFailed`];
    /// everything else degrades locally and is counted in `stats`.
    pub async fn plan_and_harvest(
        &self,
        root: QueryFilter,
        label: &str,
        stats: &mut EntryStats,
        items: &mut Vec<CatalogItem>,
    ) -> Result<(), HarvestError> {
        let root_total = match self.fetcher.probe(&root).await? {
            Probe::Matches { total, .. } => total,
            Probe::Lost(reason) => {
                return Err(HarvestError::ProbeFailed {
                    filter: root.describe(),
                    reason,
                })
            }
        };
        stats.partitions_probed += 1;
        info!(filter = %root.describe(), total = root_total, "planning entry point");

        let mut stack: Vec<(PartitionTask, u64)> = vec![(PartitionTask::root(root), root_total)];

        while let Some((task, total)) = stack.pop() {
            if total == 0 {
                continue;
            }

            if total <= self.settings.pagination_ceiling {
                self.paginate(&task.filter, label, stats, items).await?;
                continue;
            }

            if task.depth >= self.settings.max_depth {
                warn!(
                    filter = %task.filter.describe(),
                    total,
                    ceiling = self.settings.pagination_ceiling,
                    depth = task.depth,
                    "max partition depth reached, paginating anyway; items beyond the ceiling will be missed"
                );
                stats.degraded_partitions += 1;
                self.paginate(&task.filter, label, stats, items).await?;
                continue;
            }

            let children = self.children(&task, total).await?;
            debug_assert!(
                children.iter().enumerate().all(|(i, (a, _))| children[i + 1..]
                    .iter()
                    .all(|(b, _)| a.is_disjoint(b))),
                "sibling partitions overlap"
            );
            if children.len() == 1 && children[0].0 == task.filter {
                warn!(
                    filter = %task.filter.describe(),
                    total,
                    "filter cannot be narrowed further, paginating anyway"
                );
                stats.degraded_partitions += 1;
                self.paginate(&task.filter, label, stats, items).await?;
                continue;
            }

            info!(
                filter = %task.filter.describe(),
                total,
                depth = task.depth,
                parts = children.len(),
                "splitting over-ceiling filter"
            );

            let mut probed = Vec::with_capacity(children.len());
            for (child, known) in children {
                let count = match known {
                    Some(count) => count,
                    None => match self.fetcher.probe(&child).await? {
                        Probe::Matches { total, .. } => {
                            stats.partitions_probed += 1;
                            total
                        }
                        Probe::Lost(reason) => {
                            warn!(filter = %child.describe(), %reason, "partition probe lost, skipping");
                            stats.lost_pages += 1;
                            continue;
                        }
                    },
                };
                debug!(filter = %child.describe(), total = count, "partition probed");
                if count > 0 {
                    probed.push((task.child(child), count));
                }
            }

            // Reverse so partitions are harvested in ascending order.
            stack.extend(probed.into_iter().rev());
        }

        Ok(())
    }

    /// Probe the root filter and each first-level band without fetching
    /// any pages. Used by `harvest probe`.
    pub async fn survey(&self, root: &QueryFilter) -> Result<(Option<u64>, Vec<BandCount>), HarvestError> {
        let root_total = match self.fetcher.probe(root).await? {
            Probe::Matches { total, .. } => Some(total),
            Probe::Lost(_) => None,
        };

        let mut bands = Vec::new();
        for range in self.settings.split.initial_bands() {
            let filter = root.clone().with_range(range);
            let total = match self.fetcher.probe(&filter).await? {
                Probe::Matches { total, .. } => Some(total),
                Probe::Lost(_) => None,
            };
            bands.push(BandCount { filter, total });
        }
        Ok((root_total, bands))
    }

    /// Disjoint children of an over-ceiling task, with counts when the
    /// split already revealed them.
    async fn children(
        &self,
        task: &PartitionTask,
        total: u64,
    ) -> Result<Vec<(QueryFilter, Option<u64>)>, HarvestError> {
        if let Some(range) = task.filter.range() {
            return Ok(self
                .settings
                .split
                .split(range)
                .into_iter()
                .map(|r| (task.filter.clone().with_range(r), None))
                .collect());
        }

        if let PartitionDimension::Facet(attribute) = &self.settings.dimension {
            if task.filter.value_of(attribute).is_none() {
                if let Some(children) = self.facet_children(&task.filter, attribute, total).await? {
                    return Ok(children);
                }
            }
        }

        Ok(self
            .settings
            .split
            .initial_bands()
            .into_iter()
            .map(|r| (task.filter.clone().with_range(r), None))
            .collect())
    }

    async fn facet_children(
        &self,
        filter: &QueryFilter,
        attribute: &str,
        total: u64,
    ) -> Result<Option<Vec<(QueryFilter, Option<u64>)>>, HarvestError> {
        let facets = match self.fetcher.probe_facet(filter, attribute).await? {
            Probe::Matches { facets, .. } => facets,
            Probe::Lost(reason) => {
                warn!(%attribute, %reason, "facet probe lost, splitting by price instead");
                return Ok(None);
            }
        };

        let values: HashMap<String, u64> = facets.get(attribute).cloned().unwrap_or_default();
        if values.len() < 2 {
            debug!(%attribute, values = values.len(), "facet does not spread, splitting by price");
            return Ok(None);
        }

        let covered: u64 = values.values().sum();
        if covered < total {
            warn!(
                %attribute,
                total,
                covered,
                "items without a facet value are unreachable by facet partitioning"
            );
        }

        let mut values: Vec<(String, u64)> = values.into_iter().collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Some(
            values
                .into_iter()
                .map(|(value, count)| (filter.clone().with(attribute, value), Some(count)))
                .collect(),
        ))
    }

    /// Plain pagination of one enumerable filter.
    async fn paginate(
        &self,
        filter: &QueryFilter,
        label: &str,
        stats: &mut EntryStats,
        items: &mut Vec<CatalogItem>,
    ) -> Result<(), HarvestError> {
        let page_size = u64::from(self.fetcher.page_size().max(1));
        let max_pages = self.settings.pagination_ceiling.div_ceil(page_size).max(1);
        let mut page: u32 = 0;

        while u64::from(page) < max_pages {
            match self.fetcher.fetch_page(filter, page).await? {
                PageOutcome::Lost(reason) => {
                    warn!(filter = %filter.describe(), page, %reason, "page lost after retries");
                    stats.lost_pages += 1;
                    break;
                }
                PageOutcome::Hits { hits, has_more } => {
                    if hits.is_empty() {
                        break;
                    }
                    let mut fresh = 0u64;
                    for hit in &hits {
                        let Some(item) =
                            CatalogItem::from_hit(hit, &self.settings.price_attribute, label)
                        else {
                            stats.malformed += 1;
                            continue;
                        };
                        match self.dedup.admit(item) {
                            Some(item) => {
                                items.push(item);
                                fresh += 1;
                            }
                            None => stats.duplicates += 1,
                        }
                    }
                    stats.items += fresh;
                    debug!(filter = %filter.describe(), page, fresh, "page harvested");
                    if !has_more {
                        break;
                    }
                }
            }
            page += 1;
        }

        Ok(())
    }
}
