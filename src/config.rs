//! Configuration for the voice session subsystem.
//!
//! Two endpoints matter: the coaching backend that mints short-lived
//! session credentials, and the remote speech service that answers SDP
//! offers. Both are plain HTTPS; everything else about a session flows
//! over the negotiated media transport.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Defaults ─────────────────────────────────────────────────────

/// Default signaling endpoint base for the remote speech service.
pub const DEFAULT_SPEECH_URL: &str = "https://api.openai.com";

/// Delay between the control channel opening and the session being
/// reported as listening. Gives the remote peer a moment to settle
/// before the UI tells the user to start talking.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 250;

/// HTTP timeout for credential and signaling requests. Capped at the
/// client level so a dead network surfaces as an error instead of a
/// stuck `Connecting`.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// ── Config ───────────────────────────────────────────────────────

/// Voice session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Coaching backend base URL (credential endpoint lives under it).
    pub backend_url: String,
    /// Speech service base URL for SDP signaling.
    pub speech_url: String,
    /// Settling delay between `Connected` and `Listening`, in ms.
    pub settle_delay_ms: u64,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            backend_url: String::new(),
            speech_url: DEFAULT_SPEECH_URL.to_string(),
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl VoiceConfig {
    /// Create a config pointing at the given backend, with defaults for
    /// everything else.
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Default::default()
        }
    }

    /// Load from environment variables.
    ///
    /// `VOXCOACH_BACKEND_URL` is required; `VOXCOACH_SPEECH_URL` overrides
    /// the default speech endpoint.
    pub fn from_env() -> Option<Self> {
        let backend_url = std::env::var("VOXCOACH_BACKEND_URL").ok()?;
        if backend_url.is_empty() {
            return None;
        }

        let speech_url = std::env::var("VOXCOACH_SPEECH_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SPEECH_URL.to_string());

        Some(Self {
            backend_url,
            speech_url,
            ..Default::default()
        })
    }

    /// Settling delay as a [`Duration`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// HTTP request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_openai() {
        let config = VoiceConfig::default();
        assert_eq!(config.speech_url, "https://api.openai.com");
        assert_eq!(config.settle_delay_ms, DEFAULT_SETTLE_DELAY_MS);
    }

    #[test]
    fn new_keeps_defaults_for_the_rest() {
        let config = VoiceConfig::new("https://coach.example.com");
        assert_eq!(config.backend_url, "https://coach.example.com");
        assert_eq!(config.speech_url, DEFAULT_SPEECH_URL);
        assert_eq!(
            config.request_timeout(),
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
    }

    #[test]
    fn settle_delay_converts_to_duration() {
        let config = VoiceConfig {
            settle_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.settle_delay(), Duration::from_millis(100));
    }
}
