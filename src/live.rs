//! Host-facing live mode: one task running the session event loop, and a
//! cloneable [`LiveHandle`] for the UI.
//!
//! The runtime task is the only place session state is touched. Host
//! commands, captured frames, transport events and output-ended
//! notifications are all multiplexed into that task with `select!`, so the
//! controller and scheduler need no locks.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::capture::{AudioFrame, CaptureDevice};
use crate::audio::output::{OutputDevice, OutputEvent};
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::session::controller::{SessionController, SessionState};
use crate::session::transport::{Transport, TransportEvent};

/// Indicators for the host UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStatus {
    /// A session is being opened.
    pub is_connecting: bool,
    /// A session is open and streaming.
    pub is_open: bool,
    /// Reply audio is scheduled or playing.
    pub is_speaking: bool,
}

/// Lifecycle notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    StateChanged(SessionState),
    /// The first reply chunk of a turn was scheduled.
    AssistantSpeechStart,
    /// Reply audio stopped, either played out or cut by the user.
    AssistantSpeechEnd { interrupted: bool },
    TurnComplete,
    /// A session failed; carries the display message.
    Error(String),
}

enum LiveCommand {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
}

const COMMAND_CAPACITY: usize = 8;
const EVENT_CAPACITY: usize = 64;

/// Control surface for the live-mode runtime.
#[derive(Clone)]
pub struct LiveHandle {
    commands: mpsc::Sender<LiveCommand>,
    status: watch::Receiver<LiveStatus>,
    events: broadcast::Sender<LiveEvent>,
    cancel: CancellationToken,
}

impl LiveHandle {
    /// Start a live session. Resolves once the session is open.
    ///
    /// # Errors
    ///
    /// Returns the controller's start error, or [`LiveError::Channel`] if
    /// the runtime has shut down.
    pub async fn start_live_session(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(LiveCommand::Start(tx))
            .await
            .map_err(|_| LiveError::Channel("live runtime is not running".into()))?;
        rx.await
            .map_err(|_| LiveError::Channel("live runtime dropped start request".into()))?
    }

    /// Stop the current session, if any. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Channel`] if the runtime has shut down.
    pub async fn stop_live_session(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(LiveCommand::Stop(tx))
            .await
            .map_err(|_| LiveError::Channel("live runtime is not running".into()))?;
        rx.await
            .map_err(|_| LiveError::Channel("live runtime dropped stop request".into()))
    }

    /// Stop any session and end the runtime task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of the UI indicators.
    pub fn status(&self) -> LiveStatus {
        *self.status.borrow()
    }

    /// Receiver that wakes on every status change.
    pub fn watch_status(&self) -> watch::Receiver<LiveStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }
}

/// The live-mode event loop.
pub struct LiveRuntime<T, C, O> {
    controller: SessionController<T, C, O>,
    commands: mpsc::Receiver<LiveCommand>,
    output_events: mpsc::UnboundedReceiver<OutputEvent>,
    cancel: CancellationToken,
}

impl<T, C, O> LiveRuntime<T, C, O>
where
    T: Transport,
    C: CaptureDevice,
    O: OutputDevice,
{
    /// Build the runtime and its handle. `output_events` must receive the
    /// ended notifications of `output`.
    pub fn new(
        config: LiveConfig,
        transport: T,
        capture: C,
        output: O,
        output_events: mpsc::UnboundedReceiver<OutputEvent>,
    ) -> (Self, LiveHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(LiveStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let controller = SessionController::new(
            config,
            transport,
            capture,
            output,
            status_tx,
            events_tx.clone(),
        );

        let runtime = Self {
            controller,
            commands: command_rx,
            output_events,
            cancel: cancel.clone(),
        };
        let handle = LiveHandle {
            commands: command_tx,
            status: status_rx,
            events: events_tx,
            cancel,
        };
        (runtime, handle)
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        let mut frames: Option<mpsc::Receiver<AudioFrame>> = None;
        let mut transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>> = None;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                cmd = self.commands.recv() => match cmd {
                    Some(LiveCommand::Start(reply)) => {
                        let result = match self.controller.start().await {
                            Ok(streams) => {
                                frames = Some(streams.frames);
                                transport_events = Some(streams.events);
                                Ok(())
                            }
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(result);
                    }
                    Some(LiveCommand::Stop(reply)) => {
                        self.controller.stop();
                        frames = None;
                        transport_events = None;
                        let _ = reply.send(());
                    }
                    None => break,
                },

                event = recv_transport(&mut transport_events) => {
                    let event = event.unwrap_or(TransportEvent::Closed);
                    self.controller.on_transport_event(event);
                    if self.controller.state().can_start() {
                        frames = None;
                        transport_events = None;
                    }
                }

                Some(OutputEvent::Ended(id)) = self.output_events.recv() => {
                    self.controller.on_buffer_ended(id);
                }

                frame = recv_frame(&mut frames) => match frame {
                    Some(frame) => {
                        self.controller.send(frame);
                    }
                    None => {
                        debug!("capture stream ended");
                        frames = None;
                    }
                },
            }
        }

        self.controller.stop();
        info!("live runtime stopped");
    }
}

async fn recv_frame(rx: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_transport(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Spawn the live runtime on the current tokio runtime.
pub fn spawn_live<T, C, O>(
    config: LiveConfig,
    transport: T,
    capture: C,
    output: O,
    output_events: mpsc::UnboundedReceiver<OutputEvent>,
) -> (LiveHandle, JoinHandle<()>)
where
    T: Transport + 'static,
    C: CaptureDevice + 'static,
    O: OutputDevice + 'static,
{
    let (runtime, handle) = LiveRuntime::new(config, transport, capture, output, output_events);
    let task = tokio::spawn(runtime.run());
    (handle, task)
}
