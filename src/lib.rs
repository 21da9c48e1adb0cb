//! Real-time voice session management for VoxCoach.
//!
//! Drives the life of a voice conversation between a user and a coach
//! persona: mint a short-lived credential from the coaching backend,
//! negotiate a media transport with the remote speech service via SDP
//! offer/answer, then run the session off the control-channel event
//! stream until `stop()` or failure tears everything down.
//!
//! ## Design
//! - One [`VoiceSession`] per coach page; at most one live attempt at a time
//! - Pure transition table (`(state, event) -> transition`) for all
//!   post-negotiation behavior, unit-testable without a transport
//! - Trait seams for the media transport and microphone capture, so the
//!   state machine runs against mocks in tests
//! - Monotonic attempt counter for cancellation: a `stop()` issued
//!   mid-negotiation always wins over a late-arriving success
//! - Idempotent teardown on every exit path (stop, start failure,
//!   remote close)

pub mod capture;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod profile;
pub mod session;
pub mod transport;

pub use capture::{AudioCapture, CaptureConstraints, CaptureHandle, LocalTrack};
pub use config::VoiceConfig;
pub use credential::{Credential, CredentialClient};
pub use error::VoiceError;
pub use events::{ServerEvent, TranscriptRole};
pub use session::{SessionOptions, SessionSnapshot, SessionState, VoiceSession};
pub use transport::{
    ActiveTransport, MediaTransport, TransportFactory, TransportNegotiator, TransportSignal,
};
