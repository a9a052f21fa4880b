//! Core data models used throughout the harvester.
//!
//! These types represent the catalog items, credentials, entry points and
//! harvest results that flow between the planner, the fallback path and the
//! orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One catalog listing as captured from the remote site.
///
/// Identity is [`id`](CatalogItem::id): two items with the same id are the
/// same listing no matter which partition or strategy produced them.
/// Items are immutable once built; re-harvesting replaces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Opaque, source-assigned identifier.
    pub id: String,
    pub sku: Option<String>,
    pub name: Option<String>,
    /// Canonical listing URL.
    pub url: String,
    /// Decimal price kept as a string until a consumer parses it.
    pub price: Option<String>,
    /// Brand / group label (the entry point that produced the item).
    pub brand: String,
    pub in_stock: Option<bool>,
    pub captured_at: DateTime<Utc>,
}

impl CatalogItem {
    /// Build an item from one raw index hit.
    ///
    /// `price_path` is a dot-separated path into the hit (e.g.
    /// `price.USD.default`). Returns `None` when a required field
    /// (`objectID`, `url`) is missing, so the caller can skip the hit.
    pub fn from_hit(hit: &Value, price_path: &str, brand: &str) -> Option<Self> {
        let id = scalar_string(hit.get("objectID")?)?;
        let url = hit.get("url").and_then(Value::as_str)?.to_string();

        Some(Self {
            id,
            sku: hit.get("sku").and_then(scalar_string),
            name: hit.get("name").and_then(Value::as_str).map(str::to_string),
            url,
            price: lookup_path(hit, price_path).and_then(scalar_string),
            brand: brand.to_string(),
            in_stock: hit.get("in_stock").and_then(as_flag),
            captured_at: Utc::now(),
        })
    }

    /// Parsed numeric price, if present and well-formed.
    pub fn price_value(&self) -> Option<f64> {
        self.price.as_deref().and_then(|p| p.parse::<f64>().ok())
    }
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, key| current.get(key))
        .filter(|v| !v.is_null())
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// How the current access token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMethod {
    /// Supplied by an operator (config, env var or `harvest credential set`).
    Manual,
    /// Captured by the recovery agent from live site traffic.
    AutoRefreshed,
}

/// An access token plus its provenance.
///
/// No expiry is known in advance; a token is considered expired only once
/// the remote index rejects it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub method: AcquisitionMethod,
}

impl CredentialSet {
    pub fn manual(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            acquired_at: Utc::now(),
            method: AcquisitionMethod::Manual,
        }
    }

    pub fn auto_refreshed(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            acquired_at: Utc::now(),
            method: AcquisitionMethod::AutoRefreshed,
        }
    }

    /// Short SHA-256 fingerprint, safe to print in logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("token", &format_args!("<{}>", self.fingerprint()))
            .field("acquired_at", &self.acquired_at)
            .field("method", &self.method)
            .finish()
    }
}

/// An operator-specified top-level filter seeding one harvesting pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Display name, also used as the brand label on items.
    pub name: String,
    /// Equality value for the entry attribute (e.g. the brand facet value).
    pub value: String,
    /// Fallback listing URL template containing `{page}`.
    pub listing_url: Option<String>,
}

impl EntryPoint {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            value: name.clone(),
            name,
            listing_url: None,
        }
    }

    pub fn with_listing_url(mut self, template: impl Into<String>) -> Self {
        self.listing_url = Some(template.into());
        self
    }
}

/// Harvesting strategy that produced the final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Index-query harvesting through the query planner.
    Primary,
    /// Token-free page crawling.
    Fallback,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Primary => "primary",
            Strategy::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStatus {
    /// Every entry point completed under the reported strategy.
    Complete,
    /// Some entry points failed or were degraded; the result is usable.
    Partial,
    /// Aborted by cancellation or deadline; accumulated items are returned.
    Cancelled,
    /// Neither strategy produced a result.
    Failed,
}

/// Per-entry-point outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum EntryOutcome {
    Pending,
    Harvested,
    Failed(String),
}

/// Counters for one entry point across all strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStats {
    pub name: String,
    /// New (de-duplicated) items contributed.
    pub items: u64,
    /// Items dropped because their id was already seen.
    pub duplicates: u64,
    /// Count probes issued for partitions.
    pub partitions_probed: u64,
    /// Over-ceiling partitions paginated anyway at max depth.
    pub degraded_partitions: u64,
    /// Pages abandoned after exhausting retries.
    pub lost_pages: u64,
    /// Hits or page items skipped as structurally invalid.
    pub malformed: u64,
    pub outcome: EntryOutcome,
    /// Strategy that last touched this entry point.
    pub strategy: Option<Strategy>,
}

impl EntryStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: 0,
            duplicates: 0,
            partitions_probed: 0,
            degraded_partitions: 0,
            lost_pages: 0,
            malformed: 0,
            outcome: EntryOutcome::Pending,
            strategy: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, EntryOutcome::Failed(_))
    }

    /// Fold an earlier pass over the same entry point into the stats of a
    /// rerun. A rerun walks every partition again, so the earlier pass's
    /// items come back as duplicates and its partitions are probed twice.
    pub fn carry_over(&mut self, earlier: &EntryStats) {
        self.duplicates = self.duplicates.saturating_sub(earlier.items);
        self.items += earlier.items;
        self.partitions_probed = self.partitions_probed.max(earlier.partitions_probed);
        self.degraded_partitions = self.degraded_partitions.max(earlier.degraded_partitions);
        self.lost_pages = self.lost_pages.max(earlier.lost_pages);
        self.malformed = self.malformed.max(earlier.malformed);
    }
}

/// The result handed to downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestReport {
    pub session_id: String,
    pub items: Vec<CatalogItem>,
    /// Strategy that produced the final state, `None` when nothing ran.
    pub strategy_used: Option<Strategy>,
    pub status: HarvestStatus,
    /// Whether a credential recovery was attempted during the session.
    pub recovery_attempted: bool,
    pub entries: Vec<EntryStats>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl HarvestReport {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn entry(&self, name: &str) -> Option<&EntryStats> {
        self.entries.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_hit_reads_nested_price() {
        let hit = json!({
            "objectID": "4411",
            "sku": "AC-100",
            "name": "Bench",
            "url": "https://shop.example/bench.html",
            "price": { "USD": { "default": 129.5 } },
            "in_stock": 1
        });
        let item = CatalogItem::from_hit(&hit, "price.USD.default", "ACME").unwrap();
        assert_eq!(item.id, "4411");
        assert_eq!(item.sku.as_deref(), Some("AC-100"));
        assert_eq!(item.price.as_deref(), Some("129.5"));
        assert_eq!(item.price_value(), Some(129.5));
        assert_eq!(item.in_stock, Some(true));
        assert_eq!(item.brand, "ACME");
    }

    #[test]
    fn test_from_hit_numeric_object_id() {
        let hit = json!({ "objectID": 77, "url": "https://shop.example/x" });
        let item = CatalogItem::from_hit(&hit, "price", "B").unwrap();
        assert_eq!(item.id, "77");
        assert!(item.price.is_none());
    }

    #[test]
    fn test_carry_over_does_not_double_count_a_rerun() {
        let mut earlier = EntryStats::new("ACME");
        earlier.items = 40;
        earlier.duplicates = 2;
        earlier.partitions_probed = 3;
        earlier.lost_pages = 1;

        // The rerun sees the same 40 items again plus 5 new ones.
        let mut rerun = EntryStats::new("ACME");
        rerun.items = 5;
        rerun.duplicates = 42;
        rerun.partitions_probed = 3;
        rerun.carry_over(&earlier);

        assert_eq!(rerun.items, 45);
        assert_eq!(rerun.duplicates, 2);
        assert_eq!(rerun.partitions_probed, 3);
        assert_eq!(rerun.lost_pages, 1);
    }

    #[test]
    fn test_from_hit_missing_required_fields() {
        assert!(CatalogItem::from_hit(&json!({ "url": "x" }), "price", "B").is_none());
        assert!(CatalogItem::from_hit(&json!({ "objectID": "1" }), "price", "B").is_none());
        assert!(CatalogItem::from_hit(&json!({ "objectID": "", "url": "x" }), "price", "B").is_none());
    }

    #[test]
    fn test_fingerprint_hides_token() {
        let cred = CredentialSet::manual("super-secret-token-value-0123456789");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("super-secret"));
        assert_eq!(cred.fingerprint().len(), 12);
    }
}
