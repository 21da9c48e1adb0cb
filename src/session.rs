//! Voice session state machine and lifecycle management.
//!
//! One [`VoiceSession`] drives one coach page. A session attempt runs:
//!
//! ```text
//! start() ─▸ credential fetch ─▸ mic capture ─▸ offer/answer negotiation
//!                                                      │
//!                              control channel open ◂──┘
//!                                      │
//!                  Connected ── settle ──▸ Listening ⇄ Speaking
//!                                      │
//!            stop() / failure ──▸ teardown ──▸ Disconnected / Error
//! ```
//!
//! The state machine owns every resource a session acquires (credential,
//! transport, control channel, microphone) through a single
//! [`SessionHandle`]; teardown releases them exactly once on every exit
//! path. Post-negotiation transitions are driven solely by control-channel
//! events through the pure transition table in [`crate::events`].
//!
//! `start()` is guarded by the current state, so concurrent calls are safe
//! by construction, and every awaited step checks a monotonic attempt
//! counter before applying its result — a `stop()` issued mid-negotiation
//! cannot be overwritten by a negotiation that finishes afterward.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::capture::{AudioCapture, CaptureConstraints, CaptureHandle};
use crate::config::VoiceConfig;
use crate::credential::CredentialClient;
use crate::error::VoiceError;
use crate::events::{parse_event, transition, Action, ServerEvent, TranscriptRole};
use crate::profile;
use crate::transport::{
    ActiveTransport, MediaTransport, TransportFactory, TransportNegotiator, TransportSignal,
};

// ── Session state ────────────────────────────────────────────────

/// State of a voice session. Mutually exclusive; exactly one is active
/// at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session has run yet.
    Idle,
    /// Credential fetch, capture, and negotiation in flight.
    Connecting,
    /// Control channel open; settling before audio flows.
    Connected,
    /// Live and waiting for the user to speak.
    Listening,
    /// The remote persona is producing audio.
    Speaking,
    /// Ended by `stop()`. Terminal until the next `start()`.
    Disconnected,
    /// A start-path failure occurred. Terminal until the next `start()`.
    Error,
}

impl SessionState {
    /// States from which a new session attempt may begin.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected | Self::Error)
    }

    /// States in which the session is live and the duration counter ticks.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::Listening | Self::Speaking)
    }
}

// ── Options and snapshot ─────────────────────────────────────────

/// Per-session inputs selected by the UI: which coach, and its prompt.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Coach persona identifier, resolved against the voice profile table.
    pub persona_id: String,
    /// The persona's behavioral prompt; composed into session
    /// instructions together with the fixed spoken-style suffix.
    pub base_prompt: String,
}

/// Point-in-time view of a session for the UI observer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Seconds spent in the active states during this attempt.
    pub duration_secs: u64,
    pub muted: bool,
    /// Most recent completed utterance from the local user.
    pub local_transcript: Option<String>,
    /// Most recent completed utterance from the remote persona.
    pub remote_transcript: Option<String>,
    pub last_error: Option<String>,
}

// ── Observer callbacks ───────────────────────────────────────────

pub type StateCallback = Arc<dyn Fn(SessionState) + Send + Sync>;
pub type TranscriptCallback = Arc<dyn Fn(TranscriptRole, &str) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type RemoteTrackCallback = Arc<dyn Fn() + Send + Sync>;

// ── Session handle ───────────────────────────────────────────────

/// Owns every resource acquired during one session attempt. Destroyed
/// exactly once by [`teardown`]; a drained handle is never reused.
struct SessionHandle {
    capture: Option<Box<dyn CaptureHandle>>,
    transport: Option<Box<dyn MediaTransport>>,
    reader_task: Option<JoinHandle<()>>,
    ticker_task: Option<JoinHandle<()>>,
}

/// Release a handle's resources. Idempotent and safe on partially
/// constructed handles; release failures are the resources' own problem
/// and never surface past this function.
async fn teardown(handle: &mut SessionHandle) {
    // Microphone first, so the capture indicator disappears immediately
    // even if the transport is slow to close.
    if let Some(capture) = handle.capture.take() {
        capture.stop();
    }
    if let Some(mut transport) = handle.transport.take() {
        transport.close_control_channel().await;
        transport.close().await;
    }
    if let Some(task) = handle.reader_task.take() {
        task.abort();
    }
    if let Some(task) = handle.ticker_task.take() {
        task.abort();
    }
}

// ── Shared session internals ─────────────────────────────────────

struct TranscriptBuffer {
    local: Option<String>,
    remote: Option<String>,
}

struct Inner {
    state: Mutex<SessionState>,
    /// Monotonic attempt counter. Bumped by every `start()` and `stop()`;
    /// late-arriving results from a superseded attempt are discarded.
    attempt: AtomicU64,
    duration_secs: AtomicU64,
    muted: AtomicBool,
    transcripts: Mutex<TranscriptBuffer>,
    last_error: Mutex<Option<String>>,
    handle: AsyncMutex<Option<SessionHandle>>,
    on_state: Mutex<Option<StateCallback>>,
    on_transcript: Mutex<Option<TranscriptCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_remote_track: Mutex<Option<RemoteTrackCallback>>,
}

impl Inner {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
    }

    /// Transition to `next`, notifying the observer only on change.
    fn set_state(&self, next: SessionState) {
        let changed = {
            let mut state = self.state.lock();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            tracing::info!(state = ?next, "Session state changed");
            self.notify_state(next);
        }
    }

    /// Transition to `next` unless `attempt` has been superseded. The
    /// attempt check shares the state lock with the counter bumps in
    /// `start()` and `stop()`, so a stale task can never move the state
    /// once a bump has landed.
    fn set_state_if_current(&self, attempt: u64, next: SessionState) {
        let changed = {
            let mut state = self.state.lock();
            if self.attempt.load(Ordering::SeqCst) != attempt || *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            tracing::info!(state = ?next, "Session state changed");
            self.notify_state(next);
        }
    }

    /// Settle transition to `Listening`, skipped when events already moved
    /// the session past `Connected` or the attempt was superseded.
    fn settle_if_still_connected(&self, attempt: u64) {
        let changed = {
            let mut state = self.state.lock();
            if self.attempt.load(Ordering::SeqCst) == attempt
                && *state == SessionState::Connected
            {
                *state = SessionState::Listening;
                true
            } else {
                false
            }
        };
        if changed {
            tracing::info!(state = ?SessionState::Listening, "Session state changed");
            self.notify_state(SessionState::Listening);
        }
    }

    fn notify_state(&self, state: SessionState) {
        let callback = self.on_state.lock().clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    fn notify_transcript(&self, role: TranscriptRole, text: &str) {
        let callback = self.on_transcript.lock().clone();
        if let Some(callback) = callback {
            callback(role, text);
        }
    }

    fn notify_error(&self, message: &str) {
        let callback = self.on_error.lock().clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }

    fn notify_remote_track(&self) {
        let callback = self.on_remote_track.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Run one parsed control-channel event through the transition table
    /// and perform the actions it requests.
    fn apply_event(&self, attempt: u64, event: &ServerEvent) {
        let current = *self.state.lock();
        let outcome = transition(current, event);

        for action in &outcome.actions {
            match action {
                Action::ClearLocalTranscript => {
                    self.transcripts.lock().local = None;
                }
                Action::SetTranscript { role, text } => {
                    {
                        let mut transcripts = self.transcripts.lock();
                        match role {
                            TranscriptRole::Local => transcripts.local = Some(text.clone()),
                            TranscriptRole::Remote => transcripts.remote = Some(text.clone()),
                        }
                    }
                    self.notify_transcript(*role, text);
                }
                Action::RecordError(message) => {
                    // In-band protocol errors surface but do not tear the
                    // session down; the remote peer may keep functioning.
                    tracing::warn!(error = %message, "Protocol error from remote peer");
                    *self.last_error.lock() = Some(message.clone());
                    self.notify_error(message);
                }
            }
        }

        if outcome.next != current {
            self.set_state_if_current(attempt, outcome.next);
        }
    }
}

// ── Voice session ────────────────────────────────────────────────

/// Manages the lifecycle of real-time voice sessions with a coach persona.
///
/// At most one session attempt is live at a time; `start()` while a
/// session is in progress is a silent no-op. Cloning shares the same
/// underlying session.
#[derive(Clone)]
pub struct VoiceSession {
    config: VoiceConfig,
    options: SessionOptions,
    credentials: CredentialClient,
    negotiator: TransportNegotiator,
    factory: Arc<dyn TransportFactory>,
    capture: Arc<dyn AudioCapture>,
    inner: Arc<Inner>,
}

impl VoiceSession {
    /// Create a session manager for one coach persona.
    pub fn new(
        config: VoiceConfig,
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        capture: Arc<dyn AudioCapture>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        let credentials = CredentialClient::new(config.backend_url.clone(), http.clone());
        let negotiator = TransportNegotiator::new(config.speech_url.clone(), http);

        Ok(Self {
            config,
            options,
            credentials,
            negotiator,
            factory,
            capture,
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState::Idle),
                attempt: AtomicU64::new(0),
                duration_secs: AtomicU64::new(0),
                muted: AtomicBool::new(false),
                transcripts: Mutex::new(TranscriptBuffer {
                    local: None,
                    remote: None,
                }),
                last_error: Mutex::new(None),
                handle: AsyncMutex::new(None),
                on_state: Mutex::new(None),
                on_transcript: Mutex::new(None),
                on_error: Mutex::new(None),
                on_remote_track: Mutex::new(None),
            }),
        })
    }

    // ── Observers ─────────────────────────────────────────────────

    /// Register the state-change observer, invoked on every transition.
    pub fn on_state_change(&self, callback: impl Fn(SessionState) + Send + Sync + 'static) {
        *self.inner.on_state.lock() = Some(Arc::new(callback));
    }

    /// Register the transcript observer, invoked once per completed
    /// utterance with the speaking party and its text.
    pub fn on_transcript(
        &self,
        callback: impl Fn(TranscriptRole, &str) + Send + Sync + 'static,
    ) {
        *self.inner.on_transcript.lock() = Some(Arc::new(callback));
    }

    /// Register the error observer. Receives both start-path failures and
    /// in-band protocol errors; only the former end the session.
    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.on_error.lock() = Some(Arc::new(callback));
    }

    /// Register the remote-track observer, invoked once per session when
    /// the remote audio track is available for playback.
    pub fn on_remote_track(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_remote_track.lock() = Some(Arc::new(callback));
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Start a session attempt.
    ///
    /// A no-op unless the current state is `Idle`, `Disconnected`, or
    /// `Error` — which also makes retry after a failure simply another
    /// `start()`. On failure the error is recorded, the state moves to
    /// `Error`, and teardown has already run: the caller never needs to
    /// call [`Self::stop`] after a failed start.
    pub async fn start(&self) -> Result<(), VoiceError> {
        // Guard, transition, and attempt bump are one critical section: a
        // stop() interleaved between them would otherwise be superseded by
        // this attempt's own counter bump and silently lost.
        let attempt = {
            let mut state = self.inner.state.lock();
            if !state.can_start() {
                tracing::debug!(state = ?*state, "start() ignored, session already in progress");
                return Ok(());
            }
            *state = SessionState::Connecting;
            self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1
        };
        let session_id = uuid::Uuid::new_v4().to_string();

        // Fresh attempt: no stale duration, transcripts, or error.
        self.inner.duration_secs.store(0, Ordering::SeqCst);
        self.inner.muted.store(false, Ordering::SeqCst);
        {
            let mut transcripts = self.inner.transcripts.lock();
            transcripts.local = None;
            transcripts.remote = None;
        }
        *self.inner.last_error.lock() = None;

        tracing::info!(
            session_id = %session_id,
            persona = %self.options.persona_id,
            "Starting voice session"
        );
        self.inner.notify_state(SessionState::Connecting);

        match self.run_start(attempt, &session_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "Voice session start failed"
                );
                self.teardown_current().await;
                // A late failure on an attempt stop() already superseded
                // must not taint the cleanly stopped session.
                if self.inner.is_current(attempt) {
                    *self.inner.last_error.lock() = Some(e.to_string());
                    self.inner.set_state_if_current(attempt, SessionState::Error);
                    self.inner.notify_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn run_start(&self, attempt: u64, session_id: &str) -> Result<(), VoiceError> {
        let credential = self.credentials.fetch(&self.options.persona_id).await?;
        if !self.inner.is_current(attempt) {
            return Ok(());
        }

        // Microphone before the offer: its tracks must be represented in
        // the SDP the negotiator generates.
        let capture = self.capture.open(&CaptureConstraints::default()).await?;
        let tracks = capture.tracks();

        // Install the capture immediately so a stop() issued while the
        // signaling round trip is in flight still releases the device.
        {
            let mut guard = self.inner.handle.lock().await;
            if !self.inner.is_current(attempt) {
                drop(guard);
                capture.stop();
                return Ok(());
            }
            *guard = Some(SessionHandle {
                capture: Some(capture),
                transport: None,
                reader_task: None,
                ticker_task: None,
            });
        }

        let ActiveTransport {
            mut transport,
            signals,
        } = self
            .negotiator
            .negotiate(session_id, &credential, &tracks, self.factory.as_ref())
            .await?;

        if !self.inner.is_current(attempt) {
            // stop() superseded us mid-negotiation; it already drained the
            // handle, so only the late transport is ours to release.
            transport.close().await;
            return Ok(());
        }

        {
            let mut guard = self.inner.handle.lock().await;
            match guard.as_mut() {
                Some(handle) => handle.transport = Some(transport),
                None => {
                    transport.close().await;
                    return Ok(());
                }
            }
        }

        let reader = tokio::spawn(reader_loop(
            Arc::clone(&self.inner),
            signals,
            attempt,
            session_id.to_string(),
            self.config.settle_delay(),
            self.setup_frame(),
        ));
        let ticker = tokio::spawn(ticker_loop(Arc::clone(&self.inner), attempt));

        let mut guard = self.inner.handle.lock().await;
        match guard.as_mut() {
            Some(handle) => {
                handle.reader_task = Some(reader);
                handle.ticker_task = Some(ticker);
            }
            None => {
                reader.abort();
                ticker.abort();
            }
        }
        Ok(())
    }

    /// End the session and release every acquired resource.
    ///
    /// Effective in any state, including mid-`Connecting`; calling it when
    /// already `Idle` or `Disconnected` is a no-op.
    pub async fn stop(&self) {
        // Invalidate any in-flight attempt under the state lock, so the
        // guard check and the counter bump are atomic against a racing
        // start() and a negotiation that resolves later cannot resurrect
        // the session.
        let previous = {
            let state = self.inner.state.lock();
            if matches!(*state, SessionState::Idle | SessionState::Disconnected) {
                return;
            }
            self.inner.attempt.fetch_add(1, Ordering::SeqCst);
            *state
        };

        tracing::info!(state = ?previous, "Stopping voice session");

        self.teardown_current().await;
        self.inner.set_state(SessionState::Disconnected);
    }

    /// Mute the microphone in place. No-op without a live capture handle.
    pub async fn mute(&self) {
        self.set_muted(true).await;
    }

    /// Unmute the microphone in place. No-op without a live capture handle.
    pub async fn unmute(&self) {
        self.set_muted(false).await;
    }

    async fn set_muted(&self, muted: bool) {
        let guard = self.inner.handle.lock().await;
        let Some(capture) = guard.as_ref().and_then(|h| h.capture.as_ref()) else {
            return;
        };
        // Toggling the track enable flag never touches the transport or
        // the control channel.
        capture.set_enabled(!muted);
        self.inner.muted.store(muted, Ordering::SeqCst);
        tracing::debug!(muted = muted, "Microphone mute toggled");
    }

    // ── Inspection ────────────────────────────────────────────────

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Message of the most recent error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Point-in-time view of the whole session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let (local_transcript, remote_transcript) = {
            let transcripts = self.inner.transcripts.lock();
            (transcripts.local.clone(), transcripts.remote.clone())
        };
        SessionSnapshot {
            state: *self.inner.state.lock(),
            duration_secs: self.inner.duration_secs.load(Ordering::SeqCst),
            muted: self.inner.muted.load(Ordering::SeqCst),
            local_transcript,
            remote_transcript,
            last_error: self.inner.last_error.lock().clone(),
        }
    }

    // ── Internals ─────────────────────────────────────────────────

    /// The `session.update` frame sent once the control channel opens.
    fn setup_frame(&self) -> String {
        let voice = profile::voice_for(&self.options.persona_id);
        let instructions = profile::instructions_for(&self.options.base_prompt, voice);
        serde_json::json!({
            "type": "session.update",
            "session": {
                "instructions": instructions,
                "voice": voice,
            }
        })
        .to_string()
    }

    async fn teardown_current(&self) {
        let mut guard = self.inner.handle.lock().await;
        if let Some(mut handle) = guard.take() {
            teardown(&mut handle).await;
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Consume transport signals and drive the state machine. The signal
/// stream is ordered, and events are applied one at a time in arrival
/// order — transitions depend on strict event order.
async fn reader_loop(
    inner: Arc<Inner>,
    mut signals: mpsc::Receiver<TransportSignal>,
    attempt: u64,
    session_id: String,
    settle_delay: Duration,
    setup_frame: String,
) {
    while let Some(signal) = signals.recv().await {
        if !inner.is_current(attempt) {
            break;
        }
        match signal {
            TransportSignal::ChannelOpen => {
                tracing::info!(session_id = %session_id, "Control channel open");
                send_setup(&inner, &setup_frame, &session_id).await;
                inner.set_state_if_current(attempt, SessionState::Connected);

                // Settle briefly before reporting Listening, so the UI
                // flips only once the remote peer is ready for audio.
                let inner_settle = Arc::clone(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(settle_delay).await;
                    inner_settle.settle_if_still_connected(attempt);
                });
            }
            TransportSignal::RemoteTrack => {
                tracing::info!(session_id = %session_id, "Remote audio track available");
                inner.notify_remote_track();
            }
            TransportSignal::Message(raw) => {
                if let Some(event) = parse_event(&raw) {
                    inner.apply_event(attempt, &event);
                }
            }
            TransportSignal::Closed => {
                tracing::info!(session_id = %session_id, "Transport closed by remote peer");
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Control channel reader terminated");
}

async fn send_setup(inner: &Inner, frame: &str, session_id: &str) {
    let mut guard = inner.handle.lock().await;
    if let Some(transport) = guard.as_mut().and_then(|h| h.transport.as_mut()) {
        if let Err(e) = transport.send_control(frame).await {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Failed to send session instructions"
            );
        }
    }
}

/// One-second duration counter; ticks only while the session is in an
/// active state.
async fn ticker_loop(inner: Arc<Inner>, attempt: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        if !inner.is_current(attempt) {
            break;
        }
        if inner.state.lock().is_active() {
            inner.duration_secs.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
