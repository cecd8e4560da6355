//! Session lifecycle: `Idle -> Connecting -> Open -> Closing -> Closed`.
//!
//! [`SessionController`] owns the transport, the capture pipeline and the
//! playback scheduler for one live-mode activation. It is driven from a
//! single task, so none of its state needs a lock.

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::capture::{AudioFrame, CaptureDevice, CapturePipeline};
use crate::audio::output::{BufferId, OutputDevice};
use crate::audio::pcm::parse_pcm_rate;
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::live::{LiveEvent, LiveStatus};
use crate::playback::PlaybackScheduler;
use crate::session::protocol::ServerEvent;
use crate::session::transport::{SessionSetup, Transport, TransportEvent};

/// Lifecycle state of the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    /// Terminal. `error` is set when the session ended because of a failure.
    Closed { error: Option<String> },
}

impl SessionState {
    /// Whether a new session may be started from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Closed { .. })
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed { error: None } => write!(f, "Closed"),
            Self::Closed { error: Some(e) } => write!(f, "Closed (error: {e})"),
        }
    }
}

/// Per-session inbound streams handed to the event loop.
pub struct SessionStreams {
    /// Captured frames in capture order.
    pub frames: mpsc::Receiver<AudioFrame>,
    /// Transport events in arrival order.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_rejected: u64,
    pub interruptions: u64,
}

/// Owns one live session at a time.
pub struct SessionController<T, C, O> {
    config: LiveConfig,
    transport: T,
    capture_device: C,
    scheduler: PlaybackScheduler<O>,
    state: SessionState,
    outbound: Option<mpsc::Sender<AudioFrame>>,
    close: Option<CancellationToken>,
    capture: Option<CapturePipeline>,
    stats: SessionStats,
    status_tx: watch::Sender<LiveStatus>,
    events_tx: broadcast::Sender<LiveEvent>,
}

impl<T, C, O> SessionController<T, C, O>
where
    T: Transport,
    C: CaptureDevice,
    O: OutputDevice,
{
    /// Create an idle controller.
    pub fn new(
        config: LiveConfig,
        transport: T,
        capture_device: C,
        output: O,
        status_tx: watch::Sender<LiveStatus>,
        events_tx: broadcast::Sender<LiveEvent>,
    ) -> Self {
        let scheduler = PlaybackScheduler::new(output, config.audio.output_sample_rate);
        Self {
            config,
            transport,
            capture_device,
            scheduler,
            state: SessionState::Idle,
            outbound: None,
            close: None,
            capture: None,
            stats: SessionStats::default(),
            status_tx,
            events_tx,
        }
    }

    /// Open a new session.
    ///
    /// Acquires the microphone, opens the transport, and starts capture. On
    /// any failure everything acquired so far is released and the state
    /// becomes `Closed` with the error.
    ///
    /// # Errors
    ///
    /// - [`LiveError::InvalidState`] if a session is already connecting or open.
    /// - [`LiveError::DeviceUnavailable`] if the microphone cannot be acquired;
    ///   no connection is attempted.
    /// - [`LiveError::SessionOpenFailed`] if the transport or handshake fails.
    pub async fn start(&mut self) -> Result<SessionStreams> {
        if !self.state.can_start() {
            return Err(LiveError::InvalidState(format!(
                "cannot start while {}",
                self.state
            )));
        }

        self.stats = SessionStats::default();
        self.set_state(SessionState::Connecting);
        info!("starting live session");

        let setup = match SessionSetup::from_config(&self.config.session) {
            Ok(setup) => setup,
            Err(e) => return Err(self.fail_start(e)),
        };

        let (mut capture, frames) =
            match CapturePipeline::acquire(&mut self.capture_device, &self.config.audio) {
                Ok(acquired) => acquired,
                Err(e) => return Err(self.fail_start(e)),
            };

        let link = match self.transport.open(&setup).await {
            Ok(link) => link,
            Err(e) => {
                capture.release();
                let e = match e {
                    LiveError::SessionOpenFailed(_) => e,
                    other => LiveError::SessionOpenFailed(other.to_string()),
                };
                return Err(self.fail_start(e));
            }
        };

        if let Err(e) = capture.start() {
            link.close.cancel();
            capture.release();
            return Err(self.fail_start(e));
        }

        self.outbound = Some(link.outbound);
        self.close = Some(link.close);
        self.capture = Some(capture);
        self.set_state(SessionState::Open);
        info!("live session open");

        Ok(SessionStreams {
            frames,
            events: link.events,
        })
    }

    /// Forward one captured frame. Best effort: frames are dropped, never
    /// queued for replay, when the session is not open or the sink is full.
    ///
    /// Returns whether the frame was handed to the transport.
    pub fn send(&mut self, frame: AudioFrame) -> bool {
        if self.state != SessionState::Open {
            debug!(sequence = frame.sequence, "session not open, dropping frame");
            self.stats.frames_dropped += 1;
            return false;
        }
        let Some(outbound) = self.outbound.as_ref() else {
            self.stats.frames_dropped += 1;
            return false;
        };
        match outbound.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("outbound sink full, dropping frame");
                self.stats.frames_dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("outbound sink closed, dropping frame");
                self.stats.frames_dropped += 1;
                false
            }
        }
    }

    /// Handle a transport-level notification.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(server_event) => self.on_server_event(server_event),
            TransportEvent::Closed => {
                if self.state == SessionState::Open {
                    info!("live session closed by remote");
                    self.teardown(None);
                }
            }
            TransportEvent::Error(cause) => {
                if self.state == SessionState::Open {
                    self.on_error(LiveError::Transport(cause));
                }
            }
        }
    }

    /// Dispatch one server event.
    pub fn on_server_event(&mut self, event: ServerEvent) {
        if self.state != SessionState::Open {
            debug!("session not open, ignoring server event");
            return;
        }
        match event {
            ServerEvent::AudioChunk { mime_type, data } => {
                match self.schedule_chunk(&mime_type, &data) {
                    Ok(started_speaking) => {
                        self.stats.chunks_scheduled += 1;
                        if started_speaking {
                            let _ = self.events_tx.send(LiveEvent::AssistantSpeechStart);
                            self.publish_status();
                        }
                    }
                    Err(e) => self.on_error(e),
                }
            }
            ServerEvent::Interrupted => {
                self.stats.interruptions += 1;
                let was_speaking = self.scheduler.is_speaking();
                let stopped = self.scheduler.flush();
                info!(stopped, "reply interrupted by user");
                if was_speaking {
                    let _ = self
                        .events_tx
                        .send(LiveEvent::AssistantSpeechEnd { interrupted: true });
                }
                self.publish_status();
            }
            ServerEvent::TurnComplete => {
                debug!("model turn complete");
                let _ = self.events_tx.send(LiveEvent::TurnComplete);
            }
            ServerEvent::SetupComplete => debug!("duplicate setup acknowledgement"),
            ServerEvent::GoAway => info!("server announced imminent disconnect"),
        }
    }

    /// An output buffer played out.
    pub fn on_buffer_ended(&mut self, id: BufferId) {
        if self.scheduler.on_buffer_ended(id) {
            let _ = self
                .events_tx
                .send(LiveEvent::AssistantSpeechEnd { interrupted: false });
            self.publish_status();
        }
    }

    /// Close the session and release everything. Idempotent.
    pub fn stop(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Closed { .. }) {
            return;
        }
        self.set_state(SessionState::Closing);
        self.outbound = None;
        if let Some(close) = self.close.take() {
            close.cancel();
        }
        self.release_resources();
        self.set_state(SessionState::Closed { error: None });
        info!(
            frames_sent = self.stats.frames_sent,
            frames_dropped = self.stats.frames_dropped,
            chunks = self.stats.chunks_scheduled,
            "live session stopped"
        );
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Counters for the current (or last) session.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Whether reply audio is scheduled or playing.
    pub fn is_speaking(&self) -> bool {
        self.scheduler.is_speaking()
    }

    /// Borrow the playback scheduler.
    pub fn scheduler(&self) -> &PlaybackScheduler<O> {
        &self.scheduler
    }

    /// Decode and schedule one reply chunk. Returns whether it started speech.
    fn schedule_chunk(&mut self, mime_type: &str, data: &str) -> Result<bool> {
        let expected = self.config.audio.output_sample_rate;
        if let Some(rate) = parse_pcm_rate(mime_type)
            && rate != expected
        {
            return Err(LiveError::Decode(format!(
                "chunk declares {rate} Hz, output runs at {expected} Hz"
            )));
        }
        Ok(self.scheduler.enqueue(data)?.started_speaking)
    }

    /// Session-ending errors tear the session down; others cost one chunk.
    fn on_error(&mut self, error: LiveError) {
        if !error.is_fatal_to_session() {
            self.stats.chunks_rejected += 1;
            warn!("dropping reply chunk: {error}");
            return;
        }
        warn!("live session failed: {error}");
        let _ = self.events_tx.send(LiveEvent::Error(error.to_string()));
        self.teardown(Some(error.to_string()));
    }

    fn fail_start(&mut self, error: LiveError) -> LiveError {
        warn!("live session start failed: {error}");
        self.outbound = None;
        self.close = None;
        self.release_resources();
        self.set_state(SessionState::Closed {
            error: Some(error.to_string()),
        });
        let _ = self.events_tx.send(LiveEvent::Error(error.to_string()));
        error
    }

    fn teardown(&mut self, error: Option<String>) {
        self.outbound = None;
        if let Some(close) = self.close.take() {
            close.cancel();
        }
        self.release_resources();
        self.set_state(SessionState::Closed { error });
    }

    fn release_resources(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
        let was_speaking = self.scheduler.is_speaking();
        self.scheduler.flush();
        if was_speaking {
            let _ = self
                .events_tx
                .send(LiveEvent::AssistantSpeechEnd { interrupted: true });
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("session state: {} -> {}", self.state, state);
        self.state = state.clone();
        let _ = self.events_tx.send(LiveEvent::StateChanged(state));
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(LiveStatus {
            is_connecting: self.state == SessionState::Connecting,
            is_open: self.state == SessionState::Open,
            is_speaking: self.scheduler.is_speaking(),
        });
    }
}
