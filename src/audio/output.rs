//! Audio output device with a sample-accurate clock.
//!
//! [`OutputDevice`] is the seam the playback scheduler drives: a monotonic
//! clock, scheduling of a buffer at an absolute start time, and early stop.
//! When a buffer plays out naturally the device posts [`OutputEvent::Ended`].
//! Stopped buffers produce no event.

use crate::config::AudioConfig;
use crate::error::{LiveError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Identifier of one scheduled output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Notifications from the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// The buffer played to its last sample.
    Ended(BufferId),
}

/// A playback device exposing its own clock.
pub trait OutputDevice: Send {
    /// Seconds of audio rendered since the device was opened.
    fn current_time(&self) -> f64;

    /// Begin playing `samples` (mono, at the device rate) at `start_time`
    /// on the device clock.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Audio`] if the device can no longer accept audio.
    fn schedule_buffer(&mut self, samples: Vec<f32>, start_time: f64) -> Result<BufferId>;

    /// Stop a scheduled or playing buffer immediately. Unknown ids are ignored.
    fn stop(&mut self, id: BufferId);
}

/// One buffer placed on the mixer timeline.
struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Timeline mixer rendered by the output callback.
///
/// The render position is the device clock: `rendered_frames / sample_rate`.
pub struct Mixer {
    sample_rate: u32,
    rendered_frames: u64,
    next_id: u64,
    voices: Vec<Voice>,
    events: mpsc::UnboundedSender<OutputEvent>,
}

impl Mixer {
    /// Create a mixer at `sample_rate` posting ended notifications to `events`.
    pub fn new(sample_rate: u32, events: mpsc::UnboundedSender<OutputEvent>) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            rendered_frames: 0,
            next_id: 0,
            voices: Vec::new(),
            events,
        }
    }

    /// Current clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.rendered_frames as f64 / f64::from(self.sample_rate)
    }

    /// Place `samples` on the timeline at `start_time` seconds.
    ///
    /// A start time already in the past plays from the next rendered frame.
    pub fn schedule(&mut self, samples: Vec<f32>, start_time: f64) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        let requested = (start_time.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        let start_frame = requested.max(self.rendered_frames);
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        id
    }

    /// Remove a voice without an ended notification.
    pub fn stop(&mut self, id: BufferId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Number of voices still on the timeline.
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Render interleaved output for `channels` channels and advance the clock.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let t = self.rendered_frames + i as u64;
            let mut acc = 0.0f32;
            for voice in &self.voices {
                if t >= voice.start_frame
                    && let Some(sample) = voice.samples.get((t - voice.start_frame) as usize)
                {
                    acc += *sample;
                }
            }
            frame.fill(acc.clamp(-1.0, 1.0));
        }

        self.rendered_frames += frames as u64;

        let now = self.rendered_frames;
        let events = &self.events;
        self.voices.retain(|voice| {
            if voice.end_frame() <= now {
                let _ = events.send(OutputEvent::Ended(voice.id));
                false
            } else {
                true
            }
        });
    }
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    match mixer.lock() {
        Ok(m) => m,
        Err(p) => p.into_inner(),
    }
}

/// Audio playback to system speakers via cpal.
///
/// A dedicated thread owns the cpal stream; the callback renders the shared
/// [`Mixer`], which is the only state touched from the audio thread.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the output device and start rendering silence.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Audio`] if no output device is available or the
    /// stream cannot be started.
    pub fn open(config: &AudioConfig, events: mpsc::UnboundedSender<OutputEvent>) -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::new(config.output_sample_rate, events)));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let device_name = config.output_device.clone();
        let sample_rate = config.output_sample_rate;
        let thread_mixer = Arc::clone(&mixer);

        let thread = std::thread::Builder::new()
            .name("kairos-output".into())
            .spawn(move || {
                let built = build_output_stream(device_name.as_deref(), sample_rate, thread_mixer);
                let stream = match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Hold the stream alive until shutdown or handle drop.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("output thread exiting");
            })
            .map_err(|e| LiveError::Audio(format!("cannot spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                mixer,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(LiveError::Audio("output thread exited during setup".into()))
            }
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| LiveError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        lock_mixer(&self.mixer).current_time()
    }

    fn schedule_buffer(&mut self, samples: Vec<f32>, start_time: f64) -> Result<BufferId> {
        if self.thread.is_none() {
            return Err(LiveError::Audio("output device closed".into()));
        }
        Ok(lock_mixer(&self.mixer).schedule(samples, start_time))
    }

    fn stop(&mut self, id: BufferId) {
        lock_mixer(&self.mixer).stop(id);
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("output thread panicked");
        }
    }
}

fn build_output_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| LiveError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| LiveError::Audio(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| LiveError::Audio("no default output device".into()))?
    };

    let device_label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_label}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = usize::from(stream_config.channels);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                lock_mixer(&mixer).render(data, channels);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| LiveError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| LiveError::Audio(format!("failed to start output stream: {e}")))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn mixer(rate: u32) -> (Mixer, mpsc::UnboundedReceiver<OutputEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Mixer::new(rate, tx), rx)
    }

    #[test]
    fn clock_advances_with_rendered_frames() {
        let (mut m, _rx) = mixer(10);
        let mut out = vec![0.0; 5];
        m.render(&mut out, 1);
        assert!((m.current_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn consecutive_voices_play_back_to_back() {
        let (mut m, mut rx) = mixer(4);
        let a = m.schedule(vec![0.1, 0.1], 0.0);
        let b = m.schedule(vec![0.2, 0.2], 0.5);

        let mut out = vec![0.0; 4];
        m.render(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(rx.try_recv().unwrap(), OutputEvent::Ended(a));
        assert_eq!(rx.try_recv().unwrap(), OutputEvent::Ended(b));
        assert_eq!(m.active_voices(), 0);
    }

    #[test]
    fn stopped_voice_is_silent_and_sends_no_event() {
        let (mut m, mut rx) = mixer(4);
        let id = m.schedule(vec![0.5; 8], 0.0);
        let mut out = vec![0.0; 2];
        m.render(&mut out, 1);
        assert!(m.stop(id));
        m.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0]);
        assert!(rx.try_recv().is_err());
        assert!(!m.stop(id));
    }

    #[test]
    fn past_start_plays_from_now() {
        let (mut m, _rx) = mixer(4);
        let mut out = vec![0.0; 4];
        m.render(&mut out, 1);
        m.schedule(vec![0.3], 0.0);
        let mut next = vec![0.0; 1];
        m.render(&mut next, 1);
        assert_eq!(next, vec![0.3]);
    }

    #[test]
    fn render_duplicates_across_channels() {
        let (mut m, _rx) = mixer(4);
        m.schedule(vec![0.25, -0.25], 0.0);
        let mut out = vec![0.0; 4];
        m.render(&mut out, 2);
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }
}
