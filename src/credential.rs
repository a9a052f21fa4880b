//! Credential store for the index access token.
//!
//! Holds the current [`CredentialSet`] for a session. Readers take a
//! snapshot with [`CredentialStore::current`]; the only writer in the
//! engine is the orchestrator after a successful recovery, and the
//! `harvest credential set` command for manual tokens.
//!
//! The store can be backed by a small JSON key file so a recovered token
//! survives into the next run:
//!
//! ```json
//! { "token": "…", "acquired_at": "2026-01-05T10:00:00Z", "method": "auto_refreshed" }
//! ```

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::models::CredentialSet;

/// Environment variable that overrides any configured token.
pub const TOKEN_ENV_VAR: &str = "HARVEST_INDEX_TOKEN";

/// Single read/replace slot for the current access token.
#[derive(Debug)]
pub struct CredentialStore {
    current: RwLock<Option<CredentialSet>>,
    key_file: Option<PathBuf>,
}

impl CredentialStore {
    /// In-memory store seeded with `credential`.
    pub fn in_memory(credential: Option<CredentialSet>) -> Self {
        Self {
            current: RwLock::new(credential),
            key_file: None,
        }
    }

    /// Resolve the starting credential.
    ///
    /// Precedence: `HARVEST_INDEX_TOKEN`, then the key file (if it exists),
    /// then the token from the config file. Writes go to `key_file` when
    /// one is configured.
    pub fn load(configured: Option<&str>, key_file: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var(TOKEN_ENV_VAR)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(|t| CredentialSet::manual(t.trim()));

        let from_file = match key_file {
            Some(path) if path.exists() => Some(read_key_file(path)?),
            _ => None,
        };

        let from_config = configured
            .filter(|t| !t.trim().is_empty())
            .map(|t| CredentialSet::manual(t.trim()));

        let credential = from_env.or(from_file).or(from_config);
        match &credential {
            Some(c) => debug!(fingerprint = %c.fingerprint(), method = ?c.method, "loaded credential"),
            None => debug!("no credential configured"),
        }

        Ok(Self {
            current: RwLock::new(credential),
            key_file: key_file.map(Path::to_path_buf),
        })
    }

    pub fn current(&self) -> Option<CredentialSet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The raw token, or an empty string when none is configured (which
    /// the index will reject, routing the session into recovery).
    pub fn token(&self) -> String {
        self.current().map(|c| c.token).unwrap_or_default()
    }

    /// Replace the current credential and persist it if a key file is set.
    ///
    /// The in-memory slot is updated even when persisting fails, so the
    /// running session keeps the fresh token.
    pub fn replace(&self, credential: CredentialSet) -> Result<()> {
        info!(
            fingerprint = %credential.fingerprint(),
            method = ?credential.method,
            "credential replaced"
        );
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(credential.clone());
        match &self.key_file {
            Some(path) => write_key_file(path, &credential),
            None => Ok(()),
        }
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }
}

fn read_key_file(path: &Path) -> Result<CredentialSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file: {}", path.display()))?;
    let credential: CredentialSet = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse key file: {}", path.display()))?;
    Ok(credential)
}

fn write_key_file(path: &Path, credential: &CredentialSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(credential)?;
    // Readers never observe a partially written key file.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write key file: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace key file: {}", path.display()))?;
    Ok(())
}

/// Shape check for a candidate token.
///
/// Accepts tokens of at least `min_len` characters drawn from the base64 /
/// hex alphabet with no whitespace. This is a heuristic, not proof the
/// index will accept it.
pub fn validate_token(token: &str, min_len: usize) -> Result<()> {
    if token.is_empty() {
        bail!("token is empty");
    }
    if token.len() < min_len {
        bail!("token too short ({} chars, need at least {})", token.len(), min_len);
    }
    if token.chars().any(char::is_whitespace) {
        bail!("token contains whitespace");
    }
    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_')))
    {
        bail!("token contains invalid character '{}'", bad);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AcquisitionMethod;
    use tempfile::TempDir;

    const TOKEN: &str = "NDk4M2Q0ZWU0ZGQ3ODNmMDcxZGZlMmY2ZTA3NmUzNmVmYzE0MmEx";

    #[test]
    fn test_validate_token() {
        assert!(validate_token(TOKEN, 20).is_ok());
        assert!(validate_token("", 20).is_err());
        assert!(validate_token("abc", 20).is_err());
        assert!(validate_token("abcdefghij klmnopqrstu", 5).is_err());
        assert!(validate_token("abcdefghij\"klmnopqrstu", 5).is_err());
    }

    #[test]
    fn test_replace_persists_key_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keys").join("token.json");

        let store = CredentialStore::load(Some("manual-token-from-config-000"), Some(&path)).unwrap();
        assert_eq!(store.current().unwrap().method, AcquisitionMethod::Manual);

        store.replace(CredentialSet::auto_refreshed(TOKEN)).unwrap();
        assert!(path.exists());

        let reloaded = CredentialStore::load(Some("manual-token-from-config-000"), Some(&path)).unwrap();
        let current = reloaded.current().unwrap();
        assert_eq!(current.token, TOKEN);
        assert_eq!(current.method, AcquisitionMethod::AutoRefreshed);
    }

    #[test]
    fn test_in_memory_replace() {
        let store = CredentialStore::in_memory(None);
        assert_eq!(store.token(), "");
        store.replace(CredentialSet::manual(TOKEN)).unwrap();
        assert_eq!(store.token(), TOKEN);
        assert!(store.key_file().is_none());
    }

    #[test]
    fn test_corrupt_key_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("token.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(CredentialStore::load(None, Some(&path)).is_err());
    }
}
