//! Site-token → short-lived credential exchange.
//!
//! The widget never holds long-lived secrets on the wire: before opening the
//! transport, the publicly embeddable site token is exchanged once over HTTP
//! for a short-lived credential, which is then attached to the transport URL.
//! The auth endpoint is derived from the transport URL itself (scheme and
//! trailing path segment rewritten), so configuration carries a single URL.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// AuthError
// ---------------------------------------------------------------------------

/// Errors from the credential exchange. None of these retry automatically.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("transport endpoint is not a ws:// or wss:// URL: {0}")]
    BadEndpoint(String),

    #[error("auth request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("auth endpoint rejected the site token (HTTP {0})")]
    Denied(u16),

    #[error("auth response missing credential field: {0}")]
    MalformedResponse(String),
}

// ---------------------------------------------------------------------------
// URL derivation
// ---------------------------------------------------------------------------

/// Rewrite a transport URL into its sibling auth endpoint:
/// `wss://host/a/b/ws` → `https://host/a/b/token` (`ws://` → `http://`).
///
/// The trailing path segment is replaced by `token`; a URL with no path gets
/// `/token` appended.
pub fn derive_auth_url(endpoint: &str) -> Result<String, AuthError> {
    let rest = if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        return Err(AuthError::BadEndpoint(endpoint.to_string()));
    };

    // Strip any query before rewriting the path.
    let base = rest.split('?').next().unwrap_or(&rest).to_string();

    let scheme_end = base.find("://").map(|i| i + 3).unwrap_or(0);
    match base[scheme_end..].rfind('/') {
        Some(slash) => Ok(format!("{}token", &base[..scheme_end + slash + 1])),
        None => Ok(format!("{base}/token")),
    }
}

// ---------------------------------------------------------------------------
// AuthClient
// ---------------------------------------------------------------------------

/// HTTP client for the one-time credential exchange.
pub struct AuthClient {
    client: reqwest::Client,
}

impl AuthClient {
    /// Build with a per-request timeout so a stalled auth endpoint cannot
    /// hang `connect()` forever.
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Exchange `site_token` for a short-lived credential at the auth
    /// endpoint derived from `endpoint`.
    ///
    /// # Errors
    ///
    /// [`AuthError::Denied`] on a non-2xx response, [`AuthError::Request`]
    /// on network/timeout failure, [`AuthError::MalformedResponse`] when the
    /// body carries no `token` string.
    pub async fn exchange(&self, endpoint: &str, site_token: &str) -> Result<String, AuthError> {
        let url = derive_auth_url(endpoint)?;
        log::debug!("auth: exchanging site token at {url}");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "siteToken": site_token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("auth: exchange denied with HTTP {status}");
            return Err(AuthError::Denied(status.as_u16()));
        }

        let body: Value = response.json().await?;
        match body.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => {
                log::info!("auth: obtained short-lived credential");
                Ok(token.to_string())
            }
            _ => Err(AuthError::MalformedResponse(body.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
