//! In-memory devices and transport for exercising the session without
//! hardware or a network.
//!
//! Each fake is `Clone` and shares its state, so a test keeps one handle to
//! drive and inspect while the controller owns the other.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::capture::{AudioFrame, BufferCallback, CaptureDevice, InputStream};
use crate::audio::output::{BufferId, OutputDevice, OutputEvent};
use crate::error::{LiveError, Result};
use crate::session::transport::{SessionSetup, Transport, TransportEvent, TransportLink};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureState {
    denied: bool,
    callback: Option<BufferCallback>,
    started: bool,
    acquire_count: usize,
    release_count: usize,
}

/// Microphone fed by hand via [`FakeCapture::feed`].
#[derive(Clone, Default)]
pub struct FakeCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose acquisition is always refused.
    pub fn denied() -> Self {
        let capture = Self::default();
        lock(&capture.state).denied = true;
        capture
    }

    /// Deliver one buffer as if captured. Ignored unless started.
    pub fn feed(&self, samples: &[f32]) {
        let mut state = lock(&self.state);
        if !state.started {
            return;
        }
        if let Some(callback) = state.callback.as_mut() {
            callback(samples);
        }
    }

    pub fn acquire_count(&self) -> usize {
        lock(&self.state).acquire_count
    }

    pub fn release_count(&self) -> usize {
        lock(&self.state).release_count
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    /// Whether the device is currently acquired.
    pub fn is_held(&self) -> bool {
        lock(&self.state).callback.is_some()
    }
}

impl CaptureDevice for FakeCapture {
    fn acquire(
        &mut self,
        _frame_size: usize,
        _sample_rate: u32,
        on_buffer: BufferCallback,
    ) -> Result<Box<dyn InputStream>> {
        let mut state = lock(&self.state);
        if state.denied {
            return Err(LiveError::DeviceUnavailable("permission denied".into()));
        }
        if state.callback.is_some() {
            return Err(LiveError::DeviceUnavailable("device busy".into()));
        }
        state.callback = Some(on_buffer);
        state.started = false;
        state.acquire_count += 1;
        Ok(Box::new(FakeInputStream {
            state: Arc::clone(&self.state),
            released: false,
        }))
    }
}

struct FakeInputStream {
    state: Arc<Mutex<CaptureState>>,
    released: bool,
}

impl InputStream for FakeInputStream {
    fn start(&mut self) -> Result<()> {
        if self.released {
            return Err(LiveError::DeviceUnavailable("stream released".into()));
        }
        lock(&self.state).started = true;
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = lock(&self.state);
        state.callback = None;
        state.started = false;
        state.release_count += 1;
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A buffer handed to [`ManualOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub sample_count: usize,
}

#[derive(Default)]
struct OutputState {
    time: f64,
    next_id: u64,
    scheduled: Vec<ScheduledBuffer>,
    stopped: Vec<BufferId>,
    events: Option<mpsc::UnboundedSender<OutputEvent>>,
}

/// Output device whose clock only moves when the test says so.
#[derive(Clone, Default)]
pub struct ManualOutput {
    state: Arc<Mutex<OutputState>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post ended notifications to `events` from [`play_out`](Self::play_out).
    pub fn with_events(events: mpsc::UnboundedSender<OutputEvent>) -> Self {
        let output = Self::default();
        lock(&output.state).events = Some(events);
        output
    }

    pub fn set_time(&self, seconds: f64) {
        lock(&self.state).time = seconds;
    }

    /// Every buffer scheduled so far, stopped or not.
    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        lock(&self.state).scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<BufferId> {
        lock(&self.state).stopped.clone()
    }

    /// Report `id` as played to the end, unless it was stopped.
    pub fn play_out(&self, id: BufferId) {
        let state = lock(&self.state);
        if state.stopped.contains(&id) {
            return;
        }
        if let Some(events) = state.events.as_ref() {
            let _ = events.send(OutputEvent::Ended(id));
        }
    }
}

impl OutputDevice for ManualOutput {
    fn current_time(&self) -> f64 {
        lock(&self.state).time
    }

    fn schedule_buffer(&mut self, samples: Vec<f32>, start_time: f64) -> Result<BufferId> {
        let mut state = lock(&self.state);
        let id = BufferId(state.next_id);
        state.next_id += 1;
        state.scheduled.push(ScheduledBuffer {
            id,
            start_time,
            sample_count: samples.len(),
        });
        Ok(id)
    }

    fn stop(&mut self, id: BufferId) {
        lock(&self.state).stopped.push(id);
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Server side of one session opened through [`FakeTransport`].
pub struct FakeServer {
    /// The negotiated setup.
    pub setup: SessionSetup,
    /// Everything the client sends.
    pub outbound: mpsc::Receiver<AudioFrame>,
    /// Inject server events.
    pub events: mpsc::UnboundedSender<TransportEvent>,
    /// Cancelled when the client closes the session.
    pub close: CancellationToken,
}

#[derive(Default)]
struct TransportState {
    failure: Option<String>,
    open_count: usize,
}

/// Transport whose sessions surface as [`FakeServer`]s on a channel.
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    servers: mpsc::UnboundedSender<FakeServer>,
}

impl FakeTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::default(),
                servers,
            },
            rx,
        )
    }

    /// A transport whose every open fails with `reason`.
    pub fn failing(reason: &str) -> (Self, mpsc::UnboundedReceiver<FakeServer>) {
        let (transport, rx) = Self::new();
        transport.set_failure(Some(reason));
        (transport, rx)
    }

    pub fn set_failure(&self, reason: Option<&str>) {
        lock(&self.state).failure = reason.map(str::to_owned);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).open_count
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&mut self, setup: &SessionSetup) -> Result<TransportLink> {
        {
            let mut state = lock(&self.state);
            state.open_count += 1;
            if let Some(reason) = state.failure.clone() {
                return Err(LiveError::SessionOpenFailed(reason));
            }
        }

        let (out_tx, out_rx) = mpsc::channel(setup.outbound_capacity);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let _ = self.servers.send(FakeServer {
            setup: setup.clone(),
            outbound: out_rx,
            events: ev_tx,
            close: close.clone(),
        });
        Ok(TransportLink {
            outbound: out_tx,
            events: ev_rx,
            close,
        })
    }
}
