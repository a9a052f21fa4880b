//! Plain HTTP page transport for the fallback harvester.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::PageError;
use crate::traits::PageSource;

/// Body markers of an interstitial bot challenge.
/// Only interstitial text counts: ordinary pages behind the same CDN also
/// load its challenge-platform script.
const CHALLENGE_MARKERS: &[&str] = &["Just a moment", "Checking your browser"];

/// Returns `true` when `body` is a bot-challenge interstitial rather than
/// the requested page.
pub fn is_challenge_page(body: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|m| body.contains(m))
}

pub struct HttpPageSource {
    client: reqwest::Client,
    referer: Option<String>,
}

impl HttpPageSource {
    pub fn new(user_agent: &str, referer: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, referer })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, url: &str) -> Result<String, PageError> {
        let mut request = self
            .client
            .get(url)
            .header("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("accept-language", "en-US,en;q=0.9");
        if let Some(referer) = &self.referer {
            request = request.header("referer", referer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PageError::Transient(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PageError::Transient(e.to_string()))?;

        classify_page(status, body)
    }
}

/// Map a raw page status and body to a body or an error class.
pub fn classify_page(status: u16, body: String) -> Result<String, PageError> {
    match status {
        200 if is_challenge_page(&body) => Err(PageError::Blocked(status)),
        200 => Ok(body),
        403 | 503 if is_challenge_page(&body) => Err(PageError::Blocked(status)),
        403 => Err(PageError::Blocked(status)),
        408 | 429 | 500..=599 => Err(PageError::Transient(format!("HTTP {}", status))),
        _ => Err(PageError::Unavailable(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_detection() {
        assert!(is_challenge_page("<title>Just a moment...</title>"));
        assert!(is_challenge_page("<p>Checking your browser before accessing</p>"));
        assert!(!is_challenge_page("<div class=\"product-item-info\"></div>"));
    }

    #[test]
    fn test_classify_page() {
        assert_eq!(classify_page(200, "ok".into()).unwrap(), "ok");
        assert!(matches!(
            classify_page(200, "Just a moment".into()),
            Err(PageError::Blocked(200))
        ));
        assert!(matches!(classify_page(403, String::new()), Err(PageError::Blocked(403))));
        assert!(matches!(
            classify_page(503, "Checking your browser".into()),
            Err(PageError::Blocked(503))
        ));
        assert!(matches!(classify_page(502, String::new()), Err(PageError::Transient(_))));
        assert!(matches!(classify_page(404, String::new()), Err(PageError::Unavailable(404))));
    }

    #[test]
    fn test_listing_page_with_cdn_script_is_not_a_challenge() {
        let body = concat!(
            "<div class=\"product-item-info\">Bench</div>",
            "<script src=\"/cdn-cgi/challenge-platform/scripts/jsd/main.js\"></script>",
            "<div id=\"cf-browser-verification-slot\"></div>"
        );
        assert!(!is_challenge_page(body));
        assert_eq!(classify_page(200, body.to_string()).unwrap(), body);
    }
}
