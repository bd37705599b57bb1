// src/gateway/http.rs - reqwest implementation of the dashboard gateway

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use std::time::Duration;

use super::{CommandReceipt, DashboardGateway};
use crate::core::types::DashboardSnapshot;
use crate::infra::errors::StudyError;

/// Longest server message carried into an error.
const MAX_MESSAGE_LEN: usize = 300;

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct ClockInBody {
    location_id: i64,
}

#[derive(Serialize)]
struct EditBody {
    hours: f64,
}

impl HttpGateway {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, StudyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StudyError::Config(format!("HTTP client: {e}")))?;
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        Ok(Self {
            client,
            base_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send an authenticated request; returns the body of a 2xx response.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<String, StudyError> {
        let Some(token) = self.token.as_deref() else {
            return Err(StudyError::Unauthorized);
        };
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%method, %url, "Dashboard request");

        let mut req = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(map_transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(map_transport_error)?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(classify_status(status.as_u16(), &text))
        }
    }

    async fn command<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<CommandReceipt, StudyError> {
        self.send(Method::POST, path, Some(body)).await?;
        // The mutation is committed at this point; a failed refresh (even a
        // 401) only costs the snapshot.
        let snapshot = match self.fetch_current_state().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Command accepted but follow-up refresh failed: {}", e);
                None
            }
        };
        Ok(CommandReceipt { snapshot })
    }
}

#[async_trait]
impl DashboardGateway for HttpGateway {
    async fn fetch_current_state(&self) -> Result<DashboardSnapshot, StudyError> {
        let body = self.send::<()>(Method::GET, "api/dashboard/", None).await?;
        serde_json::from_str(&body)
            .map_err(|e| StudyError::inconsistency(format!("dashboard payload: {e}")))
    }

    async fn clock_in(&self, location_id: i64) -> Result<CommandReceipt, StudyError> {
        self.command("api/clockin/", &ClockInBody { location_id }).await
    }

    async fn clock_out(&self) -> Result<CommandReceipt, StudyError> {
        self.command("api/clockout/", &serde_json::json!({})).await
    }

    async fn edit_session(&self, session_id: i64, hours: f64) -> Result<(), StudyError> {
        if !hours.is_finite() || hours < 0.0 {
            return Err(StudyError::rejected(format!("invalid hours: {hours}")));
        }
        self.send(
            Method::PATCH,
            &format!("api/sessions/{session_id}/"),
            Some(&EditBody { hours }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_session(&self, session_id: i64) -> Result<(), StudyError> {
        self.send::<()>(Method::DELETE, &format!("api/sessions/{session_id}/"), None)
            .await
            .map(|_| ())
    }
}

/// Map a non-2xx response onto the error taxonomy.
pub fn classify_status(status: u16, body: &str) -> StudyError {
    match status {
        401 => StudyError::Unauthorized,
        // 403 is a permission refusal (e.g. non-staff session edits), not an
        // expired credential.
        400 | 403 | 404 | 409 | 422 => StudyError::rejected(server_message(status, body)),
        408 | 429 => StudyError::transient(format!("HTTP {status}")),
        s if s >= 500 => StudyError::transient(format!("HTTP {s}")),
        s => StudyError::rejected(server_message(s, body)),
    }
}

/// Pull a human-readable message from an error body (`detail`, `error`, or
/// the raw text).
fn server_message(status: u16, body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["detail", "error", "message"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
        });
    let message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        return format!("HTTP {status}");
    }
    let truncated: String = message.chars().take(MAX_MESSAGE_LEN).collect();
    format!("HTTP {status}: {truncated}")
}

/// Connection-level failures: no response reached us.
pub fn map_transport_error(e: reqwest::Error) -> StudyError {
    if e.is_timeout() {
        return StudyError::transient(format!("request timed out: {e}"));
    }
    if e.is_connect() || e.is_request() || e.is_body() {
        return StudyError::transient(format!("connection failed: {e}"));
    }
    if e.is_decode() {
        return StudyError::inconsistency(format!("undecodable response: {e}"));
    }
    match e.status() {
        Some(status) => classify_status(status.as_u16(), ""),
        None => StudyError::transient(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_failures() {
        assert!(classify_status(401, "").is_unauthorized());
    }

    #[test]
    fn test_forbidden_is_rejected_not_unauthorized() {
        let err = classify_status(
            403,
            r#"{"detail": "You do not have permission to perform this action."}"#,
        );
        assert!(!err.is_unauthorized());
        assert!(matches!(err, StudyError::Rejected { ref message } if message.contains("permission")));
    }

    #[test]
    fn test_classify_business_rejections() {
        let err = classify_status(400, r#"{"error": "Already clocked in"}"#);
        match err {
            StudyError::Rejected { message } => assert_eq!(message, "HTTP 400: Already clocked in"),
            other => panic!("unexpected {other:?}"),
        }
        let err = classify_status(404, r#"{"detail": "Not found."}"#);
        assert!(matches!(err, StudyError::Rejected { ref message } if message.contains("Not found.")));
        let err = classify_status(409, "plain text conflict");
        assert!(matches!(err, StudyError::Rejected { ref message } if message.ends_with("plain text conflict")));
    }

    #[test]
    fn test_classify_transient() {
        for status in [500, 502, 503, 504, 408, 429] {
            assert!(classify_status(status, "").is_retriable(), "status {status}");
        }
    }

    #[test]
    fn test_server_message_truncated() {
        let long = "x".repeat(1000);
        let msg = server_message(400, &long);
        assert!(msg.len() < 400);
        assert_eq!(server_message(422, ""), "HTTP 422");
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized_without_network() {
        let gw = HttpGateway::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        assert!(matches!(gw.fetch_current_state().await, Err(StudyError::Unauthorized)));
        assert!(matches!(gw.clock_out().await, Err(StudyError::Unauthorized)));
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let gw = HttpGateway::new("http://localhost:8000", Some("t".into()), Duration::from_secs(1)).unwrap();
        assert_eq!(gw.base_url(), "http://localhost:8000/");
    }
}
