// src/auth/mod.rs - Token store for the dashboard API
//
// Holds the access/refresh pair issued by `POST /api/token/` in
// ~/.studytrack/auth.json. The access token is sent as a bearer credential on
// every gateway request.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::gateway::http::{classify_status, map_transport_error};
use crate::infra::errors::StudyError;
use crate::infra::paths;

/// Persisted credentials.
///
/// Tokens are stored as plaintext JSON (chmod 600 on Unix).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStore {
    #[serde(default, rename = "access")]
    pub access_token: Option<String>,
    #[serde(default, rename = "refresh")]
    pub refresh_token: Option<String>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

impl TokenStore {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Load auth.json. Returns an empty store if the file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::auth_file_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&paths::auth_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        paths::write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    /// Forget the credentials on disk.
    pub fn clear() -> Result<()> {
        Self::clear_at(&paths::auth_file_path())
    }

    pub fn clear_at(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Exchange email/password for a token pair.
pub async fn request_tokens(
    base_url: &str,
    email: &str,
    password: &str,
    timeout: Duration,
) -> Result<TokenStore, StudyError> {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| StudyError::Config(format!("HTTP client: {e}")))?;

    let resp = client
        .post(format!("{base}api/token/"))
        .json(&TokenRequest { email, password })
        .send()
        .await
        .map_err(map_transport_error)?;

    let status = resp.status();
    let body = resp.text().await.map_err(map_transport_error)?;
    if !status.is_success() {
        // Bad credentials come back as 401 from the token endpoint.
        return Err(classify_status(status.as_u16(), &body));
    }

    let parsed: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| StudyError::inconsistency(format!("token response: {e}")))?;
    tracing::info!("Obtained dashboard access token");
    Ok(TokenStore::new(parsed.access, parsed.refresh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_token_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        assert_eq!(TokenStore::load_from(&path).unwrap(), TokenStore::default());

        let store = TokenStore::new("acc-123", Some("ref-456".into()));
        store.save_to(&path).unwrap();
        let loaded = TokenStore::load_from(&path).unwrap();
        assert_eq!(loaded, store);
        assert!(loaded.is_logged_in());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"access\""));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        TokenStore::new("a", None).save_to(&path).unwrap();
        TokenStore::clear_at(&path).unwrap();
        assert!(!path.exists());
        TokenStore::clear_at(&path).unwrap();
        assert!(!TokenStore::load_from(&path).unwrap().is_logged_in());
    }

    #[test]
    fn test_empty_token_is_not_logged_in() {
        assert!(!TokenStore::new("", None).is_logged_in());
        assert!(!TokenStore::default().is_logged_in());
    }
}
