//! Control-channel event parsing and the session transition table.
//!
//! The remote speech service streams JSON events over the transport's
//! control channel, one object per frame, each carrying a required `type`
//! discriminator. Malformed JSON and unrecognized types are dropped
//! silently — garbled frames are expected at the edges of a streaming
//! channel and must not crash the session.
//!
//! Transitions are expressed as a pure function
//! `(SessionState, &ServerEvent) -> Transition` so the whole table is
//! unit-testable without a live transport.

use crate::session::SessionState;

// ── Transcript roles ─────────────────────────────────────────────

/// Which party a completed transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    /// The user speaking into the local microphone.
    Local,
    /// The remote coach persona.
    Remote,
}

// ── Parsed events ────────────────────────────────────────────────

/// A recognized control-channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// `session.created` — informational only.
    SessionCreated,
    /// `session.updated` — informational only.
    SessionUpdated,
    /// `input_audio_buffer.speech_started` — the user began speaking.
    SpeechStarted,
    /// `conversation.item.input_audio_transcription.completed`.
    InputTranscript { transcript: String },
    /// `response.audio.delta` — the remote peer is producing audio.
    AudioDelta,
    /// `response.audio_transcript.done` — a completed remote utterance.
    OutputTranscriptDone { transcript: String },
    /// `response.done` — the remote turn finished.
    ResponseDone,
    /// `error` — in-band protocol error from the remote peer.
    Error { message: String },
}

/// Parse one raw control-channel frame.
///
/// Returns `None` for malformed JSON, frames without a `type` string, and
/// unrecognized types — all dropped without error.
pub fn parse_event(raw: &str) -> Option<ServerEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let event_type = value.get("type")?.as_str()?;

    let transcript_field = |v: &serde_json::Value| {
        v.get("transcript")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string()
    };

    match event_type {
        "session.created" => Some(ServerEvent::SessionCreated),
        "session.updated" => Some(ServerEvent::SessionUpdated),
        "input_audio_buffer.speech_started" => Some(ServerEvent::SpeechStarted),
        "conversation.item.input_audio_transcription.completed" => {
            Some(ServerEvent::InputTranscript {
                transcript: transcript_field(&value),
            })
        }
        "response.audio.delta" => Some(ServerEvent::AudioDelta),
        "response.audio_transcript.done" => Some(ServerEvent::OutputTranscriptDone {
            transcript: transcript_field(&value),
        }),
        "response.done" => Some(ServerEvent::ResponseDone),
        "error" => {
            let message = value
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown server error")
                .to_string();
            Some(ServerEvent::Error { message })
        }
        other => {
            tracing::debug!(event_type = other, "Unrecognized control-channel event");
            None
        }
    }
}

// ── Transition table ─────────────────────────────────────────────

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Clear the local transcript slot (user started speaking again).
    ClearLocalTranscript,
    /// Store a completed utterance and notify the transcript observer.
    SetTranscript { role: TranscriptRole, text: String },
    /// Record the message as the session's last error and notify the
    /// error observer. Does not force teardown.
    RecordError(String),
}

/// Result of applying one event to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SessionState,
    pub actions: Vec<Action>,
}

impl Transition {
    fn stay(state: SessionState) -> Self {
        Self {
            next: state,
            actions: Vec::new(),
        }
    }
}

/// Apply one control-channel event to the current state.
///
/// Pure function; the caller performs the returned actions. Events only
/// move the machine between the active states — an event arriving during
/// teardown or after an error leaves the state untouched, so out-of-order
/// frames (e.g. `response.done` before its matching transcript) always
/// land in a valid state.
pub fn transition(state: SessionState, event: &ServerEvent) -> Transition {
    match event {
        ServerEvent::SessionCreated | ServerEvent::SessionUpdated => Transition::stay(state),

        ServerEvent::SpeechStarted => Transition {
            next: state,
            actions: vec![Action::ClearLocalTranscript],
        },

        ServerEvent::InputTranscript { transcript } => Transition {
            next: state,
            actions: vec![Action::SetTranscript {
                role: TranscriptRole::Local,
                text: transcript.clone(),
            }],
        },

        ServerEvent::AudioDelta => match state {
            SessionState::Connected | SessionState::Listening => Transition {
                next: SessionState::Speaking,
                actions: Vec::new(),
            },
            other => Transition::stay(other),
        },

        ServerEvent::OutputTranscriptDone { transcript } => Transition {
            next: listening_if_active(state),
            actions: vec![Action::SetTranscript {
                role: TranscriptRole::Remote,
                text: transcript.clone(),
            }],
        },

        ServerEvent::ResponseDone => Transition {
            next: listening_if_active(state),
            actions: Vec::new(),
        },

        ServerEvent::Error { message } => Transition {
            next: state,
            actions: vec![Action::RecordError(message.clone())],
        },
    }
}

/// `Listening` is the terminal target for both turn-completion events,
/// but only the active states may move there.
fn listening_if_active(state: SessionState) -> SessionState {
    if state.is_active() {
        SessionState::Listening
    } else {
        state
    }
}

// ── Tests ────────────────────────────────────────────────────────
