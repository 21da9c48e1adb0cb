//! Local microphone capture seam.
//!
//! The session core never touches audio hardware directly. It acquires a
//! capture handle through the [`AudioCapture`] trait, attaches the
//! resulting tracks to the media transport, and releases the handle during
//! teardown. Platform backends (and the test mock) live behind this trait,
//! so the state machine is exercisable without a device.

use async_trait::async_trait;

use crate::error::VoiceError;

// ── Constraints ──────────────────────────────────────────────────

/// Processing constraints applied when opening the microphone.
///
/// All three default to enabled — a coaching conversation runs mic and
/// speaker simultaneously, so echo cancellation is not optional in
/// practice.
#[derive(Debug, Clone)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

// ── Tracks ───────────────────────────────────────────────────────

/// Descriptor for one local media track produced by a capture handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
}

// ── Capture traits ───────────────────────────────────────────────

/// Opens the local microphone.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Acquire the microphone with the given constraints.
    ///
    /// Fails with [`VoiceError::MediaAccess`] when permission is denied or
    /// no device is available.
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, VoiceError>;
}

/// A live microphone acquisition. Owned exclusively by the session handle.
pub trait CaptureHandle: Send + Sync {
    /// Tracks to attach to the media transport before offer generation.
    fn tracks(&self) -> Vec<LocalTrack>;

    /// Enable or disable every captured track in place. Disabling mutes
    /// the microphone without recreating or renegotiating the transport.
    fn set_enabled(&self, enabled: bool);

    /// Whether the tracks are currently enabled.
    fn is_enabled(&self) -> bool;

    /// Stop capture and release the device. Must be idempotent — teardown
    /// may run more than once on the same handle.
    fn stop(&self);
}

impl std::fmt::Debug for dyn CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CaptureHandle")
    }
}

// ── Test mock ────────────────────────────────────────────────────


// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::mock::MockCapture;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn constraints_default_to_all_processing_on() {
        let constraints = CaptureConstraints::default();
        assert!(constraints.echo_cancellation);
        assert!(constraints.noise_suppression);
        assert!(constraints.auto_gain_control);
    }

    #[tokio::test]
    async fn mock_capture_tracks_enable_state() {
        let (capture, probe) = MockCapture::new();
        let handle = capture.open(&CaptureConstraints::default()).await.unwrap();

        assert!(handle.is_enabled());
        handle.set_enabled(false);
        assert!(!handle.is_enabled());
        handle.set_enabled(true);
        assert!(handle.is_enabled());

        handle.stop();
        assert_eq!(probe.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mock_capture_can_simulate_denied_permission() {
        let (capture, probe) = MockCapture::new();
        probe.fail_open.store(true, Ordering::SeqCst);

        let err = capture
            .open(&CaptureConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::MediaAccess(_)));
    }
}
