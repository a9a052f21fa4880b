use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::browser::BrowserSettings;
use crate::extract::SelectorConfig;
use crate::fallback::FallbackSettings;
use crate::fetcher::FetchSettings;
use crate::filter::SplitPolicy;
use crate::index_http::IndexEndpoint;
use crate::models::EntryPoint;
use crate::orchestrator::EngineSettings;
use crate::pacing::{Pacer, RetryPolicy};
use crate::planner::{PartitionDimension, PlannerSettings};
use crate::recovery::RecoverySettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Multi-query endpoint; derived from `application_id` when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub application_id: String,
    pub index_name: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub site_origin: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_price_attribute")]
    pub price_attribute: String,
    #[serde(default = "default_entry_attribute")]
    pub entry_attribute: String,
    #[serde(default = "default_numeric_filters")]
    pub numeric_filters: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36".to_string()
}
fn default_page_size() -> u32 {
    1000
}
fn default_price_attribute() -> String {
    "price.USD.default".to_string()
}
fn default_entry_attribute() -> String {
    "brand".to_string()
}
fn default_numeric_filters() -> Vec<String> {
    vec!["visibility_search=1".to_string()]
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlannerConfig {
    #[serde(default = "default_ceiling")]
    pub pagination_ceiling: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_price_bands")]
    pub price_bands: Vec<f64>,
    #[serde(default = "default_binary_split_span")]
    pub binary_split_span: f64,
    #[serde(default = "default_split_ways")]
    pub split_ways: usize,
    #[serde(default = "default_dimension")]
    pub dimension: String,
    #[serde(default)]
    pub facet_attribute: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            pagination_ceiling: default_ceiling(),
            max_depth: default_max_depth(),
            price_bands: default_price_bands(),
            binary_split_span: default_binary_split_span(),
            split_ways: default_split_ways(),
            dimension: default_dimension(),
            facet_attribute: None,
        }
    }
}

fn default_ceiling() -> u64 {
    1000
}
fn default_max_depth() -> u32 {
    3
}
fn default_price_bands() -> Vec<f64> {
    vec![0.0, 200.0, 500.0, 1000.0, 2000.0]
}
fn default_binary_split_span() -> f64 {
    500.0
}
fn default_split_ways() -> usize {
    5
}
fn default_dimension() -> String {
    "price".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PacingConfig {
    #[serde(default = "default_delay_min_ms")]
    pub delay_min_ms: u64,
    #[serde(default = "default_delay_max_ms")]
    pub delay_max_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_entry_pause_min_ms")]
    pub entry_pause_min_ms: u64,
    #[serde(default = "default_entry_pause_max_ms")]
    pub entry_pause_max_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            delay_min_ms: default_delay_min_ms(),
            delay_max_ms: default_delay_max_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            entry_pause_min_ms: default_entry_pause_min_ms(),
            entry_pause_max_ms: default_entry_pause_max_ms(),
        }
    }
}

fn default_delay_min_ms() -> u64 {
    500
}
fn default_delay_max_ms() -> u64 {
    1500
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_entry_pause_min_ms() -> u64 {
    1000
}
fn default_entry_pause_max_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub deep_link: Option<String>,
    #[serde(default)]
    pub search_page: Option<String>,
    #[serde(default = "default_search_query")]
    pub search_query: String,
    #[serde(default = "default_search_selectors")]
    pub search_selectors: Vec<String>,
    #[serde(default = "default_script_expressions")]
    pub script_expressions: Vec<String>,
    #[serde(default)]
    pub alternate_links: Vec<String>,
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
    #[serde(default = "default_index_host")]
    pub index_host: String,
    #[serde(default = "default_token_header")]
    pub token_header: String,
    #[serde(default = "default_min_token_length")]
    pub min_token_length: usize,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deep_link: None,
            search_page: None,
            search_query: default_search_query(),
            search_selectors: default_search_selectors(),
            script_expressions: default_script_expressions(),
            alternate_links: Vec::new(),
            wait_secs: default_wait_secs(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            index_host: default_index_host(),
            token_header: default_token_header(),
            min_token_length: default_min_token_length(),
            headless: true,
            user_agent: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_search_query() -> String {
    RecoverySettings::default().search_query
}
fn default_search_selectors() -> Vec<String> {
    RecoverySettings::default().search_selectors
}
fn default_script_expressions() -> Vec<String> {
    RecoverySettings::default().script_expressions
}
fn default_wait_secs() -> u64 {
    3
}
fn default_navigation_timeout_secs() -> u64 {
    40
}
fn default_index_host() -> String {
    "algolia.net".to_string()
}
fn default_token_header() -> String {
    "x-algolia-api-key".to_string()
}
fn default_min_token_length() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_page_ceiling")]
    pub page_ceiling: u32,
    #[serde(default = "default_fallback_delay_min_ms")]
    pub delay_min_ms: u64,
    #[serde(default = "default_fallback_delay_max_ms")]
    pub delay_max_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            page_ceiling: default_page_ceiling(),
            delay_min_ms: default_fallback_delay_min_ms(),
            delay_max_ms: default_fallback_delay_max_ms(),
            retry_attempts: default_retry_attempts(),
            selectors: SelectorConfig::default(),
        }
    }
}

fn default_page_ceiling() -> u32 {
    100
}
fn default_fallback_delay_min_ms() -> u64 {
    3000
}
fn default_fallback_delay_max_ms() -> u64 {
    6000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HarvestConfig {
    /// Primary results below this count trigger proactive recovery. `0` disables.
    #[serde(default)]
    pub min_expected_items: u64,
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EntryConfig {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub listing_url: Option<String>,
}

impl EntryConfig {
    pub fn to_entry_point(&self) -> EntryPoint {
        EntryPoint {
            name: self.name.clone(),
            value: self.value.clone().unwrap_or_else(|| self.name.clone()),
            listing_url: self.listing_url.clone(),
        }
    }
}

impl Config {
    pub fn entry_points(&self) -> Vec<EntryPoint> {
        self.entries.iter().map(EntryConfig::to_entry_point).collect()
    }

    pub fn index_endpoint(&self) -> IndexEndpoint {
        IndexEndpoint {
            url: self
                .index
                .endpoint
                .clone()
                .unwrap_or_else(|| IndexEndpoint::default_url(&self.index.application_id)),
            application_id: self.index.application_id.clone(),
            index_name: self.index.index_name.clone(),
            site_origin: self.index.site_origin.clone(),
            user_agent: self.index.user_agent.clone(),
            price_attribute: self.index.price_attribute.clone(),
            numeric_filters: self.index.numeric_filters.clone(),
            timeout: Duration::from_secs(self.index.timeout_secs),
        }
    }

    pub fn browser_settings(&self) -> BrowserSettings {
        BrowserSettings {
            index_host: self.recovery.index_host.clone(),
            token_header: self.recovery.token_header.clone(),
            headless: self.recovery.headless,
            user_agent: self.recovery.user_agent.clone(),
            navigation_timeout: Duration::from_secs(self.recovery.navigation_timeout_secs),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let pacing = &self.pacing;
        let planner = &self.planner;
        let dimension = match (planner.dimension.as_str(), &planner.facet_attribute) {
            ("facet", Some(attribute)) => PartitionDimension::Facet(attribute.clone()),
            _ => PartitionDimension::Price,
        };

        EngineSettings {
            fetch: FetchSettings {
                page_size: self.index.page_size,
                retry: RetryPolicy::new(
                    pacing.retry_attempts,
                    Duration::from_millis(pacing.retry_delay_ms),
                ),
                pacer: Pacer::from_millis(pacing.delay_min_ms, pacing.delay_max_ms),
            },
            planner: PlannerSettings {
                pagination_ceiling: planner.pagination_ceiling,
                max_depth: planner.max_depth,
                split: SplitPolicy {
                    bands: planner.price_bands.clone(),
                    binary_split_span: planner.binary_split_span,
                    ways: planner.split_ways,
                },
                dimension,
                price_attribute: self.index.price_attribute.clone(),
            },
            fallback: FallbackSettings {
                page_ceiling: self.fallback.page_ceiling,
                retry: RetryPolicy::new(
                    self.fallback.retry_attempts,
                    Duration::from_millis(pacing.retry_delay_ms),
                ),
                pacer: Pacer::from_millis(self.fallback.delay_min_ms, self.fallback.delay_max_ms),
                blocked_backoff: Pacer::from_millis(
                    self.fallback.delay_min_ms.saturating_mul(2),
                    self.fallback.delay_max_ms.saturating_mul(2),
                ),
            },
            recovery: RecoverySettings {
                deep_link: self.recovery.deep_link.clone(),
                search_page: self.recovery.search_page.clone(),
                search_query: self.recovery.search_query.clone(),
                search_selectors: self.recovery.search_selectors.clone(),
                script_expressions: self.recovery.script_expressions.clone(),
                alternate_links: self.recovery.alternate_links.clone(),
                wait: Duration::from_secs(self.recovery.wait_secs),
                poll_interval: Duration::from_millis(250),
                min_token_length: self.recovery.min_token_length,
            },
            entry_attribute: self.index.entry_attribute.clone(),
            entry_pause: Pacer::from_millis(pacing.entry_pause_min_ms, pacing.entry_pause_max_ms),
            min_expected_items: self.harvest.min_expected_items,
            recovery_enabled: self.recovery.enabled,
            fallback_enabled: self.fallback.enabled,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate index
    if config.index.application_id.trim().is_empty() {
        anyhow::bail!("index.application_id must not be empty");
    }
    if config.index.index_name.trim().is_empty() {
        anyhow::bail!("index.index_name must not be empty");
    }
    if config.index.page_size == 0 {
        anyhow::bail!("index.page_size must be > 0");
    }

    // Validate planner
    let planner = &config.planner;
    if planner.pagination_ceiling == 0 {
        anyhow::bail!("planner.pagination_ceiling must be > 0");
    }
    if planner.max_depth < 1 {
        anyhow::bail!("planner.max_depth must be >= 1");
    }
    if planner.price_bands.is_empty() {
        anyhow::bail!("planner.price_bands must not be empty");
    }
    if planner.price_bands.windows(2).any(|w| w[0] >= w[1]) {
        anyhow::bail!("planner.price_bands must be strictly increasing");
    }
    if planner.binary_split_span <= 0.0 {
        anyhow::bail!("planner.binary_split_span must be > 0");
    }
    if !(2..=16).contains(&planner.split_ways) {
        anyhow::bail!("planner.split_ways must be in [2, 16]");
    }
    match planner.dimension.as_str() {
        "price" => {}
        "facet" => {
            if planner.facet_attribute.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("planner.facet_attribute must be set when dimension is 'facet'");
            }
        }
        other => anyhow::bail!(
            "Unknown planner dimension: '{}'. Must be price or facet.",
            other
        ),
    }

    // Validate pacing
    let pacing = &config.pacing;
    if pacing.delay_min_ms > pacing.delay_max_ms {
        anyhow::bail!("pacing.delay_min_ms must be <= pacing.delay_max_ms");
    }
    if pacing.entry_pause_min_ms > pacing.entry_pause_max_ms {
        anyhow::bail!("pacing.entry_pause_min_ms must be <= pacing.entry_pause_max_ms");
    }
    if pacing.retry_attempts < 1 {
        anyhow::bail!("pacing.retry_attempts must be >= 1");
    }

    // Validate fallback
    if config.fallback.delay_min_ms > config.fallback.delay_max_ms {
        anyhow::bail!("fallback.delay_min_ms must be <= fallback.delay_max_ms");
    }
    if config.fallback.retry_attempts < 1 {
        anyhow::bail!("fallback.retry_attempts must be >= 1");
    }
    if config.fallback.page_ceiling == 0 {
        anyhow::bail!("fallback.page_ceiling must be > 0");
    }

    // Validate entries
    let mut names = HashSet::new();
    for entry in &config.entries {
        if entry.name.trim().is_empty() {
            anyhow::bail!("entries[].name must not be empty");
        }
        if !names.insert(entry.name.as_str()) {
            anyhow::bail!("Duplicate entry name: '{}'", entry.name);
        }
        if let Some(url) = &entry.listing_url {
            if !url.contains("{page}") {
                anyhow::bail!(
                    "entry '{}': listing_url must contain a {{page}} placeholder",
                    entry.name
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[index]
application_id = "APP123"
index_name = "catalog_products"

[[entries]]
name = "ACME"
listing_url = "https://shop.example.com/acme.html?p={page}"

[[entries]]
name = "Globex Home"
value = "Globex"
"#;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.index.page_size, 1000);
        assert_eq!(config.planner.pagination_ceiling, 1000);
        assert_eq!(config.planner.max_depth, 3);
        assert_eq!(config.pacing.retry_attempts, 3);
        assert_eq!(config.fallback.page_ceiling, 100);
        assert!(config.recovery.enabled);

        let entries = config.entry_points();
        assert_eq!(entries[0].value, "ACME");
        assert_eq!(entries[1].name, "Globex Home");
        assert_eq!(entries[1].value, "Globex");

        let endpoint = config.index_endpoint();
        assert_eq!(
            endpoint.url,
            "https://app123-dsn.algolia.net/1/indexes/*/queries"
        );

        let settings = config.engine_settings();
        assert_eq!(settings.planner.dimension, PartitionDimension::Price);
        assert_eq!(settings.entry_attribute, "brand");
    }

    #[test]
    fn test_facet_dimension() {
        let src = format!(
            "{}\n[planner]\ndimension = \"facet\"\nfacet_attribute = \"collection_style\"\n",
            MINIMAL
        );
        let config = parse(&src).unwrap();
        assert_eq!(
            config.engine_settings().planner.dimension,
            PartitionDimension::Facet("collection_style".to_string())
        );

        let missing = format!("{}\n[planner]\ndimension = \"facet\"\n", MINIMAL);
        assert!(parse(&missing).is_err());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            "[planner]\npagination_ceiling = 0\n",
            "[planner]\nprice_bands = [0, 500, 200]\n",
            "[planner]\nsplit_ways = 1\n",
            "[planner]\ndimension = \"color\"\n",
            "[pacing]\ndelay_min_ms = 2000\ndelay_max_ms = 1000\n",
            "[pacing]\nretry_attempts = 0\n",
            "[fallback]\npage_ceiling = 0\n",
        ];
        for case in cases {
            let src = format!("{}\n{}", MINIMAL, case);
            assert!(parse(&src).is_err(), "expected rejection for {:?}", case);
        }
    }

    #[test]
    fn test_rejects_bad_entries() {
        let dup = format!("{}\n[[entries]]\nname = \"ACME\"\n", MINIMAL);
        assert!(parse(&dup).is_err());

        let no_placeholder = format!(
            "{}\n[[entries]]\nname = \"Initech\"\nlisting_url = \"https://shop.example.com/initech\"\n",
            MINIMAL
        );
        assert!(parse(&no_placeholder).is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../config/harvest.example.toml")).unwrap();
        assert_eq!(config.entries.len(), 2);
        assert_eq!(config.planner.price_bands, vec![0.0, 200.0, 500.0, 1000.0, 2000.0]);
        assert_eq!(config.fallback.selectors.next.as_deref(), Some("li.pages-item-next a"));
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("harvest.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.entries.len(), 2);

        assert!(load_config(&tmp.path().join("missing.toml")).is_err());
    }
}
