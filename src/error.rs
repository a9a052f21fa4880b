//! Error taxonomy for the harvesting engine.
//!
//! - [`IndexError`] classifies one raw call to the remote index.
//! - [`PageError`] classifies one raw fallback page fetch.
//! - [`HarvestError`] is the control-flow signal between the planner and
//!   the orchestrator. Transient failures never appear here: the fetcher
//!   absorbs them after its retries and reports the page as lost.

use thiserror::Error;

/// Outcome classes for a single index request.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The credential was rejected (4xx auth class or an auth payload
    /// signature). Never retried locally.
    #[error("index rejected credential (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// Timeout, connection failure, 429 or 5xx.
    #[error("transient index failure: {0}")]
    Transient(String),

    /// The response arrived but could not be understood.
    #[error("malformed index response: {0}")]
    Malformed(String),
}

impl IndexError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, IndexError::Unauthorized { .. })
    }
}

/// Outcome classes for a single fallback page request.
#[derive(Debug, Error)]
pub enum PageError {
    /// 403 or a bot-challenge body; retried after a longer back-off.
    #[error("page blocked (HTTP {0})")]
    Blocked(u16),

    #[error("transient page failure: {0}")]
    Transient(String),

    /// 404 and other statuses that retrying will not fix.
    #[error("page unavailable (HTTP {0})")]
    Unavailable(u16),
}

/// Signals that abort the current planning pass.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The access token is no longer accepted. Global to the session.
    #[error("credential expired: {0}")]
    CredentialExpired(String),

    /// The count probe for an entry point's root filter could not be
    /// obtained; the entry point is skipped.
    #[error("probe failed for {filter}: {reason}")]
    ProbeFailed { filter: String, reason: String },

    /// External cancellation or the session deadline fired.
    #[error("harvest cancelled")]
    Cancelled,
}

/// Auth-failure payload signatures, matched case-insensitively.
const AUTH_SIGNATURES: &[&str] = &[
    "forbidden",
    "unauthorized",
    "invalid api key",
    "invalid application-id or api key",
    "validuntil",
];

/// Returns `true` when a response body or error text looks like an
/// authentication failure.
pub fn has_auth_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    AUTH_SIGNATURES.iter().any(|sig| lower.contains(sig))
}
