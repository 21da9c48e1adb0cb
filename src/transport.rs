//! Media transport seam and offer/answer negotiation.
//!
//! ## Protocol Overview
//!
//! 1. **Create** — a fresh peer transport per session attempt, no identity
//!    beyond the attempt.
//! 2. **Control channel** — opened *before* offer generation; its open
//!    signal is how the session learns negotiation completed at the
//!    application layer, not just the transport layer.
//! 3. **Tracks** — every local microphone track is attached before the
//!    offer so it is represented in the SDP.
//! 4. **Signal** — `POST {speech}/v1/realtime?model=<model>` with the offer
//!    SDP as the body and the credential as a bearer token; the response
//!    body is the answer SDP in plain text, not JSON.
//! 5. **Apply** — the answer completes negotiation; media and control
//!    frames then flow through [`TransportSignal`]s.
//!
//! The transport itself sits behind [`MediaTransport`] so the negotiator
//! and the session state machine run against mocks in tests; only the
//! signaling round trip is real HTTP.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;

use crate::capture::LocalTrack;
use crate::credential::Credential;
use crate::error::VoiceError;

// ── Transport signals ────────────────────────────────────────────

/// Asynchronous signals emitted by a media transport over its lifetime.
#[derive(Debug)]
pub enum TransportSignal {
    /// The control channel is open — the session is live.
    ChannelOpen,
    /// The remote peer's audio track arrived. Emitted exactly once per
    /// session; the UI attaches it to an output device.
    RemoteTrack,
    /// One raw control-channel frame.
    Message(String),
    /// The transport closed from the remote side.
    Closed,
}

// ── Transport traits ─────────────────────────────────────────────

/// A peer media transport for one session attempt.
#[async_trait]
pub trait MediaTransport: Send {
    /// Open the ordered, reliable control channel. Must be called before
    /// [`Self::create_offer`] so the channel is part of the negotiation.
    fn open_control_channel(&mut self) -> Result<(), VoiceError>;

    /// Attach a local media track. Must happen before offer generation.
    fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), VoiceError>;

    /// Generate and locally apply the offer, returning its SDP text.
    async fn create_offer(&mut self) -> Result<String, VoiceError>;

    /// Apply the remote answer SDP.
    async fn apply_answer(&mut self, sdp: &str) -> Result<(), VoiceError>;

    /// Take the signal stream. Yields `Some` exactly once.
    fn take_signals(&mut self) -> Option<mpsc::Receiver<TransportSignal>>;

    /// Send one frame on the control channel.
    async fn send_control(&mut self, frame: &str) -> Result<(), VoiceError>;

    /// Close the control channel. Best-effort and idempotent.
    async fn close_control_channel(&mut self);

    /// Close the transport and release its resources. Best-effort and
    /// idempotent.
    async fn close(&mut self);
}

/// Creates a fresh [`MediaTransport`] per session attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn MediaTransport>, VoiceError>;
}

/// A successfully negotiated transport plus its signal stream.
pub struct ActiveTransport {
    pub transport: Box<dyn MediaTransport>,
    pub signals: mpsc::Receiver<TransportSignal>,
}

impl std::fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTransport").finish_non_exhaustive()
    }
}

// ── Negotiator ───────────────────────────────────────────────────

/// Performs the offer/answer exchange against the speech service.
#[derive(Clone)]
pub struct TransportNegotiator {
    http: reqwest::Client,
    speech_url: String,
}

impl TransportNegotiator {
    pub fn new(speech_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            speech_url: speech_url.into(),
        }
    }

    /// Negotiate a transport for one session attempt.
    ///
    /// On any failure, every transport-layer resource created so far is
    /// torn down before the error is returned — the caller never inherits
    /// a half-built transport.
    pub async fn negotiate(
        &self,
        session_id: &str,
        credential: &Credential,
        tracks: &[LocalTrack],
        factory: &dyn TransportFactory,
    ) -> Result<ActiveTransport, VoiceError> {
        let mut transport = factory.create().await?;

        match self
            .negotiate_inner(session_id, credential, tracks, transport.as_mut())
            .await
        {
            Ok(signals) => Ok(ActiveTransport { transport, signals }),
            Err(e) => {
                tracing::warn!(
                    session_id = session_id,
                    error = %e,
                    "Negotiation failed, releasing partial transport"
                );
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn negotiate_inner(
        &self,
        session_id: &str,
        credential: &Credential,
        tracks: &[LocalTrack],
        transport: &mut dyn MediaTransport,
    ) -> Result<mpsc::Receiver<TransportSignal>, VoiceError> {
        let signals = transport.take_signals().ok_or_else(|| {
            VoiceError::Negotiation("transport signal stream already taken".into())
        })?;

        // Channel first, then tracks, then the offer — the SDP must cover both.
        transport.open_control_channel()?;
        for track in tracks {
            transport.add_local_track(track)?;
        }

        let offer = transport.create_offer().await?;
        tracing::debug!(
            session_id = session_id,
            offer_len = offer.len(),
            model = %credential.model,
            "Sending offer to signaling endpoint"
        );

        let answer = self.exchange_offer(credential, &offer).await?;
        transport.apply_answer(&answer).await?;

        tracing::info!(
            session_id = session_id,
            answer_len = answer.len(),
            "Transport negotiated"
        );

        Ok(signals)
    }

    /// One outbound signaling request: offer SDP out, answer SDP back.
    async fn exchange_offer(
        &self,
        credential: &Credential,
        offer: &str,
    ) -> Result<String, VoiceError> {
        let url = format!("{}/v1/realtime", self.speech_url);

        let response = self
            .http
            .post(&url)
            .query(&[("model", credential.model.as_str())])
            .bearer_auth(&credential.token)
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer.to_string())
            .send()
            .await
            .map_err(|e| VoiceError::Negotiation(format!("signaling request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::Negotiation(format!(
                "signaling endpoint returned {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|e| VoiceError::Negotiation(format!("unreadable answer body: {e}")))
    }
}

// ── Test mock ────────────────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Shared observation point for transport activity in tests.
    #[derive(Default)]
    pub struct TransportProbe {
        pub created: AtomicUsize,
        pub channel_opens: AtomicUsize,
        pub channel_closes: AtomicUsize,
        pub closes: AtomicUsize,
        pub offers: AtomicUsize,
        pub tracks: Mutex<Vec<String>>,
        pub answers: Mutex<Vec<String>>,
        pub control_frames: Mutex<Vec<String>>,
        /// Ordering records taken at offer time.
        pub channel_open_before_offer: AtomicBool,
        pub tracks_attached_before_offer: AtomicBool,
        /// Failure injection.
        pub fail_create: AtomicBool,
        pub fail_offer: AtomicBool,
        /// Emit `ChannelOpen` as soon as the answer is applied.
        pub open_channel_on_answer: AtomicBool,
        /// Sender half of the most recent transport's signal stream, for
        /// tests to inject control frames.
        pub signal_tx: Mutex<Option<mpsc::Sender<TransportSignal>>>,
    }

    impl TransportProbe {
        /// Push a raw control frame into the live transport's stream.
        pub async fn send_frame(&self, raw: &str) {
            let tx = self.signal_tx.lock().clone().expect("no live transport");
            tx.send(TransportSignal::Message(raw.to_string()))
                .await
                .expect("signal stream closed");
        }

        pub async fn send_signal(&self, signal: TransportSignal) {
            let tx = self.signal_tx.lock().clone().expect("no live transport");
            tx.send(signal).await.expect("signal stream closed");
        }
    }

    pub struct MockFactory {
        pub probe: Arc<TransportProbe>,
    }

    impl MockFactory {
        pub fn new() -> (Self, Arc<TransportProbe>) {
            let probe = Arc::new(TransportProbe::default());
            (
                Self {
                    probe: Arc::clone(&probe),
                },
                probe,
            )
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(&self) -> Result<Box<dyn MediaTransport>, VoiceError> {
            if self.probe.fail_create.load(Ordering::SeqCst) {
                return Err(VoiceError::Negotiation("transport creation failed".into()));
            }
            self.probe.created.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(64);
            *self.probe.signal_tx.lock() = Some(tx.clone());
            Ok(Box::new(MockTransport {
                probe: Arc::clone(&self.probe),
                signals: Some(rx),
                signal_tx: tx,
            }))
        }
    }

    pub struct MockTransport {
        probe: Arc<TransportProbe>,
        signals: Option<mpsc::Receiver<TransportSignal>>,
        signal_tx: mpsc::Sender<TransportSignal>,
    }

    #[async_trait]
    impl MediaTransport for MockTransport {
        fn open_control_channel(&mut self) -> Result<(), VoiceError> {
            self.probe.channel_opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), VoiceError> {
            self.probe.tracks.lock().push(track.id.clone());
            Ok(())
        }

        async fn create_offer(&mut self) -> Result<String, VoiceError> {
            if self.probe.fail_offer.load(Ordering::SeqCst) {
                return Err(VoiceError::Negotiation("offer generation failed".into()));
            }
            self.probe.offers.fetch_add(1, Ordering::SeqCst);
            self.probe.channel_open_before_offer.store(
                self.probe.channel_opens.load(Ordering::SeqCst) > 0,
                Ordering::SeqCst,
            );
            self.probe
                .tracks_attached_before_offer
                .store(!self.probe.tracks.lock().is_empty(), Ordering::SeqCst);
            Ok("v=0\r\no=- mock offer\r\n".to_string())
        }

        async fn apply_answer(&mut self, sdp: &str) -> Result<(), VoiceError> {
            self.probe.answers.lock().push(sdp.to_string());
            if self.probe.open_channel_on_answer.load(Ordering::SeqCst) {
                let _ = self.signal_tx.send(TransportSignal::ChannelOpen).await;
                let _ = self.signal_tx.send(TransportSignal::RemoteTrack).await;
            }
            Ok(())
        }

        fn take_signals(&mut self) -> Option<mpsc::Receiver<TransportSignal>> {
            self.signals.take()
        }

        async fn send_control(&mut self, frame: &str) -> Result<(), VoiceError> {
            self.probe.control_frames.lock().push(frame.to_string());
            Ok(())
        }

        async fn close_control_channel(&mut self) {
            self.probe.channel_closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&mut self) {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::mock::MockFactory;
    use super::*;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> Credential {
        Credential {
            token: "ek_test".into(),
            model: "gpt-4o-realtime-preview".into(),
        }
    }

    fn mic_track() -> Vec<LocalTrack> {
        vec![LocalTrack { id: "mic-0".into() }]
    }

    #[tokio::test]
    async fn negotiate_exchanges_offer_for_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/realtime"))
            .and(query_param("model", "gpt-4o-realtime-preview"))
            .and(header("Authorization", "Bearer ek_test"))
            .and(header("Content-Type", "application/sdp"))
            .and(body_string_contains("mock offer"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v=0\r\no=- mock answer\r\n"))
            .expect(1)
            .mount(&server)
            .await;

        let (factory, probe) = MockFactory::new();
        let negotiator = TransportNegotiator::new(server.uri(), reqwest::Client::new());

        let active = negotiator
            .negotiate("s1", &credential(), &mic_track(), &factory)
            .await
            .unwrap();

        assert_eq!(probe.answers.lock().as_slice(), ["v=0\r\no=- mock answer\r\n"]);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 0);
        drop(active);
    }

    #[tokio::test]
    async fn channel_and_tracks_precede_the_offer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/realtime"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v=0\r\n"))
            .mount(&server)
            .await;

        let (factory, probe) = MockFactory::new();
        let negotiator = TransportNegotiator::new(server.uri(), reqwest::Client::new());
        negotiator
            .negotiate("s1", &credential(), &mic_track(), &factory)
            .await
            .unwrap();

        assert!(probe.channel_open_before_offer.load(Ordering::SeqCst));
        assert!(probe.tracks_attached_before_offer.load(Ordering::SeqCst));
        assert_eq!(probe.channel_opens.load(Ordering::SeqCst), 1);
        assert_eq!(probe.tracks.lock().as_slice(), ["mic-0"]);
    }

    #[tokio::test]
    async fn signaling_rejection_tears_down_the_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/realtime"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let (factory, probe) = MockFactory::new();
        let negotiator = TransportNegotiator::new(server.uri(), reqwest::Client::new());
        let err = negotiator
            .negotiate("s1", &credential(), &mic_track(), &factory)
            .await
            .unwrap_err();

        assert!(matches!(err, VoiceError::Negotiation(_)));
        assert!(err.to_string().contains("502"));
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offer_failure_tears_down_the_transport() {
        let (factory, probe) = MockFactory::new();
        probe.fail_offer.store(true, Ordering::SeqCst);

        let negotiator =
            TransportNegotiator::new("http://127.0.0.1:1", reqwest::Client::new());
        let err = negotiator
            .negotiate("s1", &credential(), &mic_track(), &factory)
            .await
            .unwrap_err();

        assert!(matches!(err, VoiceError::Negotiation(_)));
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_signaling_endpoint_is_a_negotiation_error() {
        let (factory, probe) = MockFactory::new();
        let negotiator =
            TransportNegotiator::new("http://127.0.0.1:1", reqwest::Client::new());
        let err = negotiator
            .negotiate("s1", &credential(), &mic_track(), &factory)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("signaling request failed"));
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }
}
