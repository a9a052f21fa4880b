//! HTTP client for the hosted search index.
//!
//! Speaks the multi-query endpoint (`POST /1/indexes/*/queries`) with a
//! single request per call:
//!
//! ```json
//! { "requests": [ { "indexName": "catalog", "params": "facetFilters=…&hitsPerPage=…" } ] }
//! ```
//!
//! and reads `results[0].nbHits`, `results[0].hits` and
//! `results[0].facets` from the response.
//!
//! Status classification:
//! - 200 → parsed response (malformed JSON → [`IndexError::Malformed`])
//! - 400 / 401 / 403, or any body carrying an auth signature → [`IndexError::Unauthorized`]
//! - 429, 5xx, timeouts, connection errors → [`IndexError::Transient`]
//! - other 4xx → [`IndexError::Malformed`] (the request itself is wrong)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{has_auth_signature, IndexError};
use crate::filter::QueryFilter;
use crate::traits::{IndexQuery, IndexResponse, SearchIndex};

/// Connection settings for [`HttpSearchIndex`].
#[derive(Debug, Clone)]
pub struct IndexEndpoint {
    /// Full URL of the multi-query endpoint.
    pub url: String,
    pub application_id: String,
    pub index_name: String,
    /// Sent as `origin` and `referer` (with trailing slash).
    pub site_origin: Option<String>,
    pub user_agent: String,
    /// Dot path of the numeric price attribute used in range filters.
    pub price_attribute: String,
    /// Filters prepended to every query (e.g. `visibility_search=1`).
    pub numeric_filters: Vec<String>,
    pub timeout: Duration,
}

impl IndexEndpoint {
    /// Default DSN endpoint for an application id.
    pub fn default_url(application_id: &str) -> String {
        format!(
            "https://{}-dsn.algolia.net/1/indexes/*/queries",
            application_id.to_lowercase()
        )
    }
}

pub struct HttpSearchIndex {
    client: reqwest::Client,
    endpoint: IndexEndpoint,
}

impl HttpSearchIndex {
    pub fn new(endpoint: IndexEndpoint) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()?;
        Ok(Self { client, endpoint })
    }

    fn headers(&self, token: &str) -> reqwest::header::HeaderMap {
        use reqwest::header::{HeaderMap, HeaderValue};

        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        put("accept", "*/*");
        put("x-algolia-api-key", token);
        put("x-algolia-application-id", &self.endpoint.application_id);
        put("user-agent", &self.endpoint.user_agent);
        if let Some(origin) = &self.endpoint.site_origin {
            let origin = origin.trim_end_matches('/');
            put("origin", origin);
            put("referer", &format!("{}/", origin));
        }
        headers
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    fn name(&self) -> &str {
        &self.endpoint.index_name
    }

    async fn query(&self, query: &IndexQuery, token: &str) -> Result<IndexResponse, IndexError> {
        let body = json!({
            "requests": [{
                "indexName": self.endpoint.index_name,
                "params": build_params(
                    query,
                    &self.endpoint.price_attribute,
                    &self.endpoint.numeric_filters,
                ),
            }]
        });

        let response = self
            .client
            .post(&self.endpoint.url)
            .headers(self.headers(token))
            .json(&body)
            .send()
            .await
            .map_err(|e| IndexError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| IndexError::Transient(e.to_string()))?;

        classify(status, &text)
    }
}

/// Map a raw status and body to a response or an error class.
pub fn classify(status: u16, body: &str) -> Result<IndexResponse, IndexError> {
    match status {
        200 => {
            let json: Value = serde_json::from_str(body)
                .map_err(|e| IndexError::Malformed(format!("invalid JSON: {}", e)))?;
            if json.get("results").is_none() && has_auth_signature(body) {
                return Err(IndexError::Unauthorized {
                    status,
                    message: snippet(body),
                });
            }
            parse_response(&json)
        }
        400 | 401 | 403 => Err(IndexError::Unauthorized {
            status,
            message: snippet(body),
        }),
        429 | 500..=599 => Err(IndexError::Transient(format!(
            "HTTP {}: {}",
            status,
            snippet(body)
        ))),
        _ if has_auth_signature(body) => Err(IndexError::Unauthorized {
            status,
            message: snippet(body),
        }),
        _ => Err(IndexError::Malformed(format!(
            "HTTP {}: {}",
            status,
            snippet(body)
        ))),
    }
}

fn parse_response(json: &Value) -> Result<IndexResponse, IndexError> {
    let result = json
        .get("results")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .ok_or_else(|| IndexError::Malformed("missing results[0]".to_string()))?;

    let total_matches = result
        .get("nbHits")
        .and_then(Value::as_u64)
        .ok_or_else(|| IndexError::Malformed("missing nbHits".to_string()))?;

    let hits = result
        .get("hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut facets = HashMap::new();
    if let Some(map) = result.get("facets").and_then(Value::as_object) {
        for (attribute, values) in map {
            let counts: HashMap<String, u64> = values
                .as_object()
                .map(|v| {
                    v.iter()
                        .filter_map(|(value, count)| count.as_u64().map(|c| (value.clone(), c)))
                        .collect()
                })
                .unwrap_or_default();
            facets.insert(attribute.clone(), counts);
        }
    }

    Ok(IndexResponse {
        total_matches,
        hits,
        facets,
    })
}

/// Encode a query as the index's `params` string.
///
/// Each equality constraint becomes its own `facetFilters` element so they
/// combine by AND; the price range becomes two `numericFilters` bounds.
pub fn build_params(query: &IndexQuery, price_attribute: &str, base_numeric: &[String]) -> String {
    let mut params = url::form_urlencoded::Serializer::new(String::new());

    let facet_filters = facet_filters(&query.filter);
    if !facet_filters.is_empty() {
        params.append_pair("facetFilters", &json!(facet_filters).to_string());
    }

    let numeric = numeric_filters(&query.filter, price_attribute, base_numeric);
    if !numeric.is_empty() {
        params.append_pair("numericFilters", &json!(numeric).to_string());
    }

    params.append_pair("hitsPerPage", &query.hits_per_page.to_string());
    params.append_pair("page", &query.page.to_string());

    if !query.facets.is_empty() {
        params.append_pair("facets", &json!(query.facets).to_string());
    }

    params.finish()
}

fn facet_filters(filter: &QueryFilter) -> Vec<String> {
    filter
        .equals()
        .iter()
        .map(|(dimension, value)| format!("{}:{}", dimension, value))
        .collect()
}

fn numeric_filters(filter: &QueryFilter, price_attribute: &str, base: &[String]) -> Vec<String> {
    let mut filters: Vec<String> = base.to_vec();
    if let Some(range) = filter.range() {
        filters.push(format!("{}>={}", price_attribute, range.lo));
        if let Some(hi) = range.hi {
            filters.push(format!("{}<{}", price_attribute, hi));
        }
    }
    filters
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PriceRange;

    fn decode(params: &str) -> HashMap<String, String> {
        url::form_urlencoded::parse(params.as_bytes())
            .into_owned()
            .collect()
    }

    #[test]
    fn test_params_for_ranged_page() {
        let filter = QueryFilter::new()
            .with("brand", "ACME")
            .with_range(PriceRange::new(200.0, 500.0));
        let query = IndexQuery::page(&filter, 2, 1000);
        let params = decode(&build_params(
            &query,
            "price.USD.default",
            &["visibility_search=1".to_string()],
        ));

        assert_eq!(params["facetFilters"], r#"["brand:ACME"]"#);
        assert_eq!(
            params["numericFilters"],
            r#"["visibility_search=1","price.USD.default>=200","price.USD.default<500"]"#
        );
        assert_eq!(params["hitsPerPage"], "1000");
        assert_eq!(params["page"], "2");
        assert!(!params.contains_key("facets"));
    }

    #[test]
    fn test_params_open_range_has_no_upper_bound() {
        let filter = QueryFilter::new().with_range(PriceRange::open(2000.0));
        let params = decode(&build_params(&IndexQuery::probe(&filter), "price", &[]));
        assert_eq!(params["numericFilters"], r#"["price>=2000"]"#);
        assert_eq!(params["hitsPerPage"], "0");
        assert!(!params.contains_key("facetFilters"));
    }

    #[test]
    fn test_params_facet_probe() {
        let filter = QueryFilter::new().with("brand", "ACME").with("style", "Modern");
        let params = decode(&build_params(
            &IndexQuery::facet_probe(&filter, "collection_style"),
            "price",
            &[],
        ));
        assert_eq!(params["facetFilters"], r#"["brand:ACME","style:Modern"]"#);
        assert_eq!(params["facets"], r#"["collection_style"]"#);
    }

    #[test]
    fn test_classify_success() {
        let body = r#"{"results":[{"nbHits":3500,"hits":[{"objectID":"1"}],
            "facets":{"collection_style":{"Modern":10,"Rustic":4}}}]}"#;
        let response = classify(200, body).unwrap();
        assert_eq!(response.total_matches, 3500);
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.facets["collection_style"]["Modern"], 10);
    }

    #[test]
    fn test_classify_auth_failures() {
        assert!(classify(403, "{}").unwrap_err().is_unauthorized());
        assert!(classify(400, r#"{"message":"Invalid API key"}"#)
            .unwrap_err()
            .is_unauthorized());
        assert!(classify(200, r#"{"message":"Invalid Application-ID or API key"}"#)
            .unwrap_err()
            .is_unauthorized());
        assert!(classify(404, r#"{"message":"unauthorized"}"#)
            .unwrap_err()
            .is_unauthorized());
    }

    #[test]
    fn test_classify_transient_and_malformed() {
        assert!(matches!(classify(503, "down"), Err(IndexError::Transient(_))));
        assert!(matches!(classify(429, ""), Err(IndexError::Transient(_))));
        assert!(matches!(classify(200, "<html>"), Err(IndexError::Malformed(_))));
        assert!(matches!(classify(200, r#"{"results":[]}"#), Err(IndexError::Malformed(_))));
        assert!(matches!(classify(404, "not found"), Err(IndexError::Malformed(_))));
    }

    #[test]
    fn test_default_url() {
        assert_eq!(
            IndexEndpoint::default_url("CTZ7LV7PJE"),
            "https://ctz7lv7pje-dsn.algolia.net/1/indexes/*/queries"
        );
    }
}
