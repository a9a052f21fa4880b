//! CSS-selector extraction of catalog items from listing pages.
//!
//! The default selectors match a common storefront product grid:
//!
//! | Field | Default selector | Notes |
//! |-------|------------------|-------|
//! | item block | `div.product-item-info` | one per product |
//! | id | `div[data-role=priceBox]` | value of `data-product-id` |
//! | link | `a.product-item-link` | `href`, resolved against the listing URL |
//! | price | `span.price` | normalised with [`parse_price`] |
//! | next page | `li.pages-item-next a` | optional |
//!
//! An item block without an id or a link is counted as malformed and
//! skipped; a missing price is not an error.

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::{CatalogItem, EntryPoint};
use crate::traits::{ExtractedPage, ItemExtractor};

/// Selector strings, as written in the `[fallback.selectors]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_item")]
    pub item: String,
    /// Element inside the item block carrying the id attribute. When unset,
    /// the attribute is read from the item block itself.
    #[serde(default = "default_id")]
    pub id: Option<String>,
    #[serde(default = "default_id_attribute")]
    pub id_attribute: String,
    #[serde(default = "default_link")]
    pub link: String,
    #[serde(default = "default_price")]
    pub price: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default = "default_next")]
    pub next: Option<String>,
}

fn default_item() -> String {
    "div.product-item-info".to_string()
}

fn default_id() -> Option<String> {
    Some("div[data-role=priceBox]".to_string())
}

fn default_id_attribute() -> String {
    "data-product-id".to_string()
}

fn default_link() -> String {
    "a.product-item-link".to_string()
}

fn default_price() -> String {
    "span.price".to_string()
}

fn default_next() -> Option<String> {
    Some("li.pages-item-next a".to_string())
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            item: default_item(),
            id: default_id(),
            id_attribute: default_id_attribute(),
            link: default_link(),
            price: default_price(),
            name: None,
            sku: None,
            next: default_next(),
        }
    }
}

/// [`ItemExtractor`] driven by a [`SelectorConfig`].
pub struct SelectorExtractor {
    item: Selector,
    id: Option<Selector>,
    id_attribute: String,
    link: Selector,
    price: Selector,
    name: Option<Selector>,
    sku: Option<Selector>,
    next: Option<Selector>,
}

impl SelectorExtractor {
    /// Compile the selectors, failing on the first invalid one.
    pub fn new(config: &SelectorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            item: compile(&config.item)?,
            id: config.id.as_deref().map(compile).transpose()?,
            id_attribute: config.id_attribute.clone(),
            link: compile(&config.link)?,
            price: compile(&config.price)?,
            name: config.name.as_deref().map(compile).transpose()?,
            sku: config.sku.as_deref().map(compile).transpose()?,
            next: config.next.as_deref().map(compile).transpose()?,
        })
    }

    fn item_id(&self, block: &ElementRef) -> Option<String> {
        let carrier = match &self.id {
            Some(selector) => block.select(selector).next()?,
            None => *block,
        };
        carrier
            .value()
            .attr(&self.id_attribute)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

fn compile(selector: &str) -> anyhow::Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow::anyhow!("invalid selector '{}': {:?}", selector, e))
}

fn text_of(block: &ElementRef, selector: &Selector) -> Option<String> {
    block
        .select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

impl ItemExtractor for SelectorExtractor {
    fn name(&self) -> &str {
        "selector"
    }

    fn extract(&self, body: &str, entry: &EntryPoint) -> ExtractedPage {
        let document = Html::parse_document(body);
        let base = entry
            .listing_url
            .as_deref()
            .and_then(|template| Url::parse(&template.replace("{page}", "1")).ok());

        let mut page = ExtractedPage::default();
        for block in document.select(&self.item) {
            let Some(id) = self.item_id(&block) else {
                page.malformed += 1;
                continue;
            };
            let Some(href) = block
                .select(&self.link)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::trim)
                .filter(|h| !h.is_empty())
            else {
                page.malformed += 1;
                continue;
            };
            let url = match &base {
                Some(base) => base
                    .join(href)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.to_string()),
                None => href.to_string(),
            };

            page.items.push(CatalogItem {
                id,
                sku: self.sku.as_ref().and_then(|s| text_of(&block, s)),
                name: self.name.as_ref().and_then(|s| text_of(&block, s)),
                url,
                price: text_of(&block, &self.price).and_then(|p| parse_price(&p)),
                brand: entry.name.clone(),
                in_stock: None,
                captured_at: Utc::now(),
            });
        }

        page.has_next = match &self.next {
            Some(next) => document.select(next).next().is_some(),
            None => !page.items.is_empty(),
        };
        page
    }
}

/// Normalise a displayed price to a plain decimal string.
///
/// Handles `$1,234.56`, `1.234,56`, `887,84` and `1,234`. A lone comma
/// is a decimal separator only when exactly two digits follow it.
pub fn parse_price(text: &str) -> Option<String> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ','))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalised = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if dot > comma => cleaned.replace(',', ""),
        (Some(_), Some(_)) => cleaned.replace('.', "").replace(',', "."),
        (Some(comma), None) => {
            let decimals = cleaned.len() - comma - 1;
            if decimals == 2 && cleaned.matches(',').count() == 1 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        _ => cleaned,
    };

    normalised.parse::<f64>().ok().map(|_| normalised)
}
