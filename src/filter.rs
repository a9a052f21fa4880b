//! Query filters and partitioning.
//!
//! A [`QueryFilter`] is a conjunction of equality constraints plus an
//! optional half-open price range `[lo, hi)`. The planner splits an
//! over-large filter into disjoint children using the functions here;
//! every split preserves two properties:
//!
//! - children are pairwise disjoint (no item can match two siblings), and
//! - the union of the children covers the parent's range exactly.
//!
//! The last band of any range split is open-ended (`hi = None`), so items
//! priced above every finite bound are still reachable.

use serde::{Deserialize, Serialize};

/// Half-open numeric range `[lo, hi)`. `hi = None` means `+inf`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub lo: f64,
    pub hi: Option<f64>,
}

impl PriceRange {
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi: Some(hi) }
    }

    pub fn open(lo: f64) -> Self {
        Self { lo, hi: None }
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lo && self.hi.map_or(true, |hi| price < hi)
    }

    pub fn overlaps(&self, other: &PriceRange) -> bool {
        let self_below_other = self.hi.is_some_and(|hi| hi <= other.lo);
        let other_below_self = other.hi.is_some_and(|hi| hi <= self.lo);
        !(self_below_other || other_below_self)
    }
}

impl std::fmt::Display for PriceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.hi {
            Some(hi) => write!(f, "[{}, {})", self.lo, hi),
            None => write!(f, "[{}, +inf)", self.lo),
        }
    }
}

/// Ordered set of `(dimension, value)` equality constraints plus an
/// optional price range. Constraints compose by conjunction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    equals: Vec<(String, String)>,
    range: Option<PriceRange>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality constraint. A repeated dimension replaces its value.
    pub fn with(mut self, dimension: impl Into<String>, value: impl Into<String>) -> Self {
        let dimension = dimension.into();
        let value = value.into();
        match self.equals.iter_mut().find(|(d, _)| *d == dimension) {
            Some(existing) => existing.1 = value,
            None => self.equals.push((dimension, value)),
        }
        self
    }

    pub fn with_range(mut self, range: PriceRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn equals(&self) -> &[(String, String)] {
        &self.equals
    }

    pub fn range(&self) -> Option<PriceRange> {
        self.range
    }

    pub fn value_of(&self, dimension: &str) -> Option<&str> {
        self.equals
            .iter()
            .find(|(d, _)| d == dimension)
            .map(|(_, v)| v.as_str())
    }

    /// Two filters are disjoint when they constrain a shared dimension to
    /// different values, or when both carry non-overlapping ranges.
    pub fn is_disjoint(&self, other: &QueryFilter) -> bool {
        let equality_conflict = self.equals.iter().any(|(dim, value)| {
            other
                .value_of(dim)
                .is_some_and(|other_value| other_value != value)
        });
        let range_conflict = match (self.range, other.range) {
            (Some(a), Some(b)) => !a.overlaps(&b),
            _ => false,
        };
        equality_conflict || range_conflict
    }

    /// Human-readable form used in logs: `brand=ACME + price∈[0, 200)`.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .equals
            .iter()
            .map(|(d, v)| format!("{}={}", d, v))
            .collect();
        if let Some(range) = self.range {
            parts.push(format!("price∈{}", range));
        }
        if parts.is_empty() {
            "<all>".to_string()
        } else {
            parts.join(" + ")
        }
    }
}

/// A filter awaiting planning, plus its depth in the partition tree.
///
/// Depth is 0 for an entry point's root filter and increases by one per
/// split; the planner never creates a task deeper than its max depth.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTask {
    pub filter: QueryFilter,
    pub depth: u32,
}

impl PartitionTask {
    pub fn root(filter: QueryFilter) -> Self {
        Self { filter, depth: 0 }
    }

    pub fn child(&self, filter: QueryFilter) -> Self {
        Self {
            filter,
            depth: self.depth + 1,
        }
    }
}

/// Parameters for range subdivision.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPolicy {
    /// Lower bounds of the first-level bands; the last band is open-ended.
    pub bands: Vec<f64>,
    /// Ranges no wider than this are split in half.
    pub binary_split_span: f64,
    /// Number of parts for wider (and open-ended) ranges.
    pub ways: usize,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            bands: vec![0.0, 200.0, 500.0, 1000.0, 2000.0],
            binary_split_span: 500.0,
            ways: 5,
        }
    }
}

impl SplitPolicy {
    /// First-level bands: `[b0, b1), [b1, b2), …, [bn, +inf)`.
    pub fn initial_bands(&self) -> Vec<PriceRange> {
        let mut ranges: Vec<PriceRange> = self
            .bands
            .windows(2)
            .map(|w| PriceRange::new(w[0], w[1]))
            .collect();
        if let Some(last) = self.bands.last() {
            ranges.push(PriceRange::open(*last));
        }
        ranges
    }

    /// Subdivide one range into disjoint, covering children.
    ///
    /// Closed ranges no wider than `binary_split_span` are halved; wider
    /// ones are cut into `ways` equal parts. An open-ended range `[lo, +inf)`
    /// becomes `ways - 1` finite parts of a doubling span followed by a new
    /// open tail. Returns the range unchanged when it cannot be narrowed.
    pub fn split(&self, range: PriceRange) -> Vec<PriceRange> {
        match range.hi {
            Some(hi) => {
                let width = hi - range.lo;
                if !(width > 0.0) {
                    return vec![range];
                }
                let parts = if width <= self.binary_split_span {
                    2
                } else {
                    self.ways.max(2)
                };
                let step = width / parts as f64;
                (0..parts)
                    .map(|i| {
                        let lo = range.lo + step * i as f64;
                        // Pin the last bound so float error cannot leave a gap.
                        let hi = if i + 1 == parts {
                            hi
                        } else {
                            range.lo + step * (i + 1) as f64
                        };
                        PriceRange::new(lo, hi)
                    })
                    .collect()
            }
            None => {
                let span = if range.lo > 0.0 {
                    range.lo
                } else {
                    self.binary_split_span.max(1.0)
                };
                let finite = self.ways.max(2) - 1;
                let mut ranges = Vec::with_capacity(finite + 1);
                let mut lo = range.lo;
                for i in 0..finite {
                    let hi = range.lo + span * f64::from(1u32 << i);
                    ranges.push(PriceRange::new(lo, hi));
                    lo = hi;
                }
                ranges.push(PriceRange::open(lo));
                ranges
            }
        }
    }
}
