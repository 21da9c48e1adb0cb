//! Error taxonomy for voice sessions.
//!
//! Each variant maps to one failure class a session attempt can hit:
//! credential minting, transport negotiation, microphone access, and
//! in-band protocol errors. The first three are start-path failures that
//! move the session to `Error` and force teardown. A `Protocol` error is
//! recorded and surfaced but leaves the session running — the remote peer
//! may keep functioning, and killing a working audio session over a
//! transient protocol fault is the UI's call, not ours.

use thiserror::Error;

/// Error produced by the voice session subsystem.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// The backend refused or failed to mint a session credential.
    #[error("credential request failed: {0}")]
    Credential(String),

    /// The signaling endpoint rejected the offer, or the offer/answer
    /// exchange failed partway through.
    #[error("transport negotiation failed: {0}")]
    Negotiation(String),

    /// Microphone permission denied or device unavailable. Kept distinct
    /// so the UI can suggest checking permissions.
    #[error("microphone unavailable: {0}")]
    MediaAccess(String),

    /// An `error`-typed event arrived on the control channel.
    #[error("protocol error: {0}")]
    Protocol(String),
}
