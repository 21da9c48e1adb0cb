//! Credential client: fetches a short-lived session credential from the
//! coaching backend.
//!
//! One outbound `POST {backend}/voice/session` per `start()` call. The
//! returned bearer token is single-use by design — it authorizes exactly
//! one negotiation attempt and is never cached or reused.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::VoiceError;

// ── Wire types ───────────────────────────────────────────────────

/// Request body for the credential endpoint.
#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    #[serde(rename = "coachId")]
    coach_id: &'a str,
}

/// Error body the backend returns on non-success status.
#[derive(Debug, Deserialize)]
struct SessionErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: Option<String>,
    model: Option<String>,
}

// ── Credential ───────────────────────────────────────────────────

/// Short-lived, single-use credential authorizing one negotiation attempt.
#[derive(Clone)]
pub struct Credential {
    /// Opaque bearer token for the signaling endpoint.
    pub token: String,
    /// Remote model identifier to target.
    pub model: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

// ── Client ───────────────────────────────────────────────────────

/// HTTP client for the backend credential endpoint.
#[derive(Clone)]
pub struct CredentialClient {
    backend_url: String,
    http: reqwest::Client,
}

impl CredentialClient {
    /// Create a new credential client against the given backend base URL.
    pub fn new(backend_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            backend_url: backend_url.into(),
            http,
        }
    }

    /// Fetch a session credential for the given coach persona.
    ///
    /// Exactly one outbound request. Non-success statuses carry the
    /// backend's error message when it sent one, a generic message
    /// otherwise; a success body without a token is malformed.
    pub async fn fetch(&self, persona_id: &str) -> Result<Credential, VoiceError> {
        let url = format!("{}/voice/session", self.backend_url);

        tracing::debug!(persona_id = persona_id, "Requesting voice session credential");

        let response = self
            .http
            .post(&url)
            .json(&SessionRequest {
                coach_id: persona_id,
            })
            .send()
            .await
            .map_err(|e| VoiceError::Credential(format!("backend unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<SessionErrorBody>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| format!("backend returned {status}"));
            tracing::warn!(
                persona_id = persona_id,
                status = %status,
                error = %message,
                "Credential request rejected"
            );
            return Err(VoiceError::Credential(message));
        }

        let body: SessionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Credential(format!("malformed session response: {e}")))?;

        let token = match body.token {
            Some(token) if !token.is_empty() => token,
            _ => {
                return Err(VoiceError::Credential(
                    "malformed session response: missing token".to_string(),
                ))
            }
        };
        let model = body.model.unwrap_or_default();

        tracing::info!(persona_id = persona_id, model = %model, "Voice session credential issued");

        Ok(Credential { token, model })
    }
}

// ── Tests ────────────────────────────────────────────────────────
