//! Microphone capture and outbound frame production.
//!
//! [`CapturePipeline`] owns the input device for the lifetime of one live
//! session. Every fixed-size buffer the device delivers is converted to an
//! [`AudioFrame`] on the audio thread and posted to a bounded channel; the
//! session loop drains that channel. The device is released exactly once,
//! either explicitly or when the pipeline is dropped.

use crate::audio::pcm::{encode_base64_pcm16, pcm_mime_type};
use crate::config::AudioConfig;
use crate::error::{LiveError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One outbound block of microphone audio in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Capture order within the session, starting at 0.
    pub sequence: u64,
    /// Base64 of little-endian int16 PCM.
    pub data: String,
    /// MIME-style tag, e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
    /// Number of samples encoded in `data`.
    pub sample_count: usize,
}

impl AudioFrame {
    /// Encode normalized mono samples captured at `sample_rate`.
    pub fn from_samples(sequence: u64, samples: &[f32], sample_rate: u32) -> Self {
        Self {
            sequence,
            data: encode_base64_pcm16(samples),
            mime_type: pcm_mime_type(sample_rate),
            sample_count: samples.len(),
        }
    }
}

/// Callback receiving one fixed-size buffer of channel-0 samples in [-1, 1].
pub type BufferCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An input device that can be acquired for exclusive use.
pub trait CaptureDevice: Send {
    /// Acquire the device and register `on_buffer` for every `frame_size`
    /// samples captured at `sample_rate`. No samples flow until
    /// [`InputStream::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::DeviceUnavailable`] if permission is denied, the
    /// device is busy, or no matching device exists.
    fn acquire(
        &mut self,
        frame_size: usize,
        sample_rate: u32,
        on_buffer: BufferCallback,
    ) -> Result<Box<dyn InputStream>>;
}

/// A live acquisition of an input device.
pub trait InputStream: Send {
    /// Begin delivering buffers to the registered callback.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::DeviceUnavailable`] if the stream cannot start.
    fn start(&mut self) -> Result<()>;

    /// Stop delivery and give the device back. Must tolerate repeated calls.
    fn release(&mut self);
}

/// Scoped owner of the microphone for one session.
pub struct CapturePipeline {
    stream: Option<Box<dyn InputStream>>,
}

impl CapturePipeline {
    /// Acquire `device` and wire its callback to a new frame channel.
    ///
    /// # Errors
    ///
    /// Propagates [`LiveError::DeviceUnavailable`] from the device.
    pub fn acquire<D>(
        device: &mut D,
        config: &AudioConfig,
    ) -> Result<(Self, mpsc::Receiver<AudioFrame>)>
    where
        D: CaptureDevice + ?Sized,
    {
        let (tx, rx) = mpsc::channel(config.frame_channel_capacity.max(1));
        let sample_rate = config.input_sample_rate;
        let mut sequence = 0u64;

        let on_buffer: BufferCallback = Box::new(move |samples: &[f32]| {
            let frame = AudioFrame::from_samples(sequence, samples, sample_rate);
            sequence += 1;
            // Never block the audio thread; stale audio has no value.
            if tx.try_send(frame).is_err() {
                debug!("frame channel full or closed, dropping frame");
            }
        });

        let stream = device.acquire(config.frame_size, sample_rate, on_buffer)?;
        Ok((
            Self {
                stream: Some(stream),
            },
            rx,
        ))
    }

    /// Start producing frames.
    ///
    /// # Errors
    ///
    /// Fails if the device was already released or refuses to start.
    pub fn start(&mut self) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.start(),
            None => Err(LiveError::DeviceUnavailable(
                "capture device already released".into(),
            )),
        }
    }

    /// Release the device. Returns `true` only on the call that released it.
    pub fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.release();
                info!("capture device released");
                true
            }
            None => false,
        }
    }

    /// Whether the device is still held.
    pub fn is_held(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

/// Reassembles arbitrary-sized interleaved device callbacks into fixed-size
/// channel-0 frames at the target rate.
pub struct FrameAssembler {
    frame_size: usize,
    channels: usize,
    resampler: LinearResampler,
    pending: Vec<f32>,
}

impl FrameAssembler {
    /// Create an assembler for a device delivering `channels` interleaved
    /// channels at `native_rate`.
    pub fn new(frame_size: usize, channels: u16, native_rate: u32, target_rate: u32) -> Self {
        Self {
            frame_size: frame_size.max(1),
            channels: usize::from(channels.max(1)),
            resampler: LinearResampler::new(native_rate, target_rate),
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Feed one device callback; `emit` runs once per completed frame.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(&[f32])) {
        let channel0: Vec<f32> = interleaved.iter().step_by(self.channels).copied().collect();
        self.resampler.process(&channel0, &mut self.pending);

        let mut offset = 0;
        while self.pending.len() - offset >= self.frame_size {
            emit(&self.pending[offset..offset + self.frame_size]);
            offset += self.frame_size;
        }
        self.pending.drain(..offset);
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Linear-interpolation resampler that keeps its phase across buffers.
///
/// Speech energy sits well below 8kHz, so no anti-alias filter is applied
/// when going from 48kHz to 16kHz.
struct LinearResampler {
    /// Input samples advanced per output sample.
    step: f64,
    /// Position of the next output sample. Index 0 is `prev` when it is set.
    pos: f64,
    /// Last input sample of the previous buffer.
    prev: Option<f32>,
}

impl LinearResampler {
    fn new(src_rate: u32, dst_rate: u32) -> Self {
        let step = if src_rate == 0 || dst_rate == 0 {
            1.0
        } else {
            f64::from(src_rate) / f64::from(dst_rate)
        };
        Self {
            step,
            pos: 0.0,
            prev: None,
        }
    }

    /// Append the resampled form of `input` to `out`.
    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.step == 1.0 {
            out.extend_from_slice(input);
            return;
        }
        let Some(&last) = input.last() else {
            return;
        };

        let offset = usize::from(self.prev.is_some());
        let len = input.len() + offset;
        let prev = self.prev.unwrap_or(0.0);
        let at = |i: usize| if i < offset { prev } else { input[i - offset] };

        while self.pos + 1.0 < len as f64 {
            let idx = self.pos as usize;
            let frac = self.pos - idx as f64;
            let sample = f64::from(at(idx)) * (1.0 - frac) + f64::from(at(idx + 1)) * frac;
            out.push(sample as f32);
            self.pos += self.step;
        }

        // Re-anchor so index 0 of the next buffer is this buffer's last sample.
        self.pos -= (len - 1) as f64;
        self.prev = Some(last);
    }
}

/// Microphone capture via cpal.
///
/// The cpal stream is created and owned by a dedicated thread; the returned
/// [`InputStream`] drives it through a command channel.
pub struct CpalCapture {
    device_name: Option<String>,
}

impl CpalCapture {
    /// Capture from the named device, or the system default when `None`.
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
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

impl CaptureDevice for CpalCapture {
    fn acquire(
        &mut self,
        frame_size: usize,
        sample_rate: u32,
        on_buffer: BufferCallback,
    ) -> Result<Box<dyn InputStream>> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<StreamCommand>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("kairos-capture".into())
            .spawn(move || {
                let built =
                    build_input_stream(device_name.as_deref(), frame_size, sample_rate, on_buffer);
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

                for cmd in cmd_rx {
                    match cmd {
                        StreamCommand::Start(reply) => {
                            let result = stream.play().map_err(|e| {
                                LiveError::DeviceUnavailable(format!(
                                    "failed to start input stream: {e}"
                                ))
                            });
                            let _ = reply.send(result);
                        }
                        StreamCommand::Release => break,
                    }
                }

                drop(stream);
                debug!("capture thread exiting");
            })
            .map_err(|e| {
                LiveError::DeviceUnavailable(format!("cannot spawn capture thread: {e}"))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalInputStream {
                commands: cmd_tx,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(LiveError::DeviceUnavailable(
                    "capture thread exited during setup".into(),
                ))
            }
        }
    }
}

enum StreamCommand {
    Start(std_mpsc::Sender<Result<()>>),
    Release,
}

struct CpalInputStream {
    commands: std_mpsc::Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalInputStream {
    fn start(&mut self) -> Result<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.commands
            .send(StreamCommand::Start(reply_tx))
            .map_err(|_| LiveError::DeviceUnavailable("capture thread is gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| LiveError::DeviceUnavailable("capture thread is gone".into()))?
    }

    fn release(&mut self) {
        let _ = self.commands.send(StreamCommand::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("capture thread panicked");
        }
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    frame_size: usize,
    target_rate: u32,
    mut on_buffer: BufferCallback,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                LiveError::DeviceUnavailable(format!("input device '{name}' not found"))
            })?
    } else {
        host.default_input_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("no default input device".into()))?
    };

    let device_label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_label}");

    let default_config = device
        .default_input_config()
        .map_err(|e| LiveError::DeviceUnavailable(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "native input config: {}Hz, {} channels -> {}Hz frames of {} samples",
        native_rate, native_channels, target_rate, frame_size
    );

    let mut assembler = FrameAssembler::new(frame_size, native_channels, native_rate, target_rate);

    device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                assembler.push(data, |frame| on_buffer(frame));
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| LiveError::DeviceUnavailable(format!("failed to build input stream: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::pcm::decode_base64_pcm16;
    use crate::testing::FakeCapture;

    #[test]
    fn frame_carries_mime_tag_and_count() {
        let frame = AudioFrame::from_samples(3, &[0.0, 0.5, -0.5], 16_000);
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        assert_eq!(frame.sample_count, 3);
        let decoded = decode_base64_pcm16(&frame.data).unwrap();
        assert_eq!(decoded, vec![0.0, 0.5, -0.5]);
    }

    #[test]
    fn assembler_emits_fixed_frames_and_keeps_remainder() {
        let mut asm = FrameAssembler::new(4, 1, 16_000, 16_000);
        let mut frames: Vec<Vec<f32>> = Vec::new();
        asm.push(&[0.1, 0.2, 0.3], |f| frames.push(f.to_vec()));
        assert!(frames.is_empty());
        asm.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(asm.pending_len(), 1);
    }

    #[test]
    fn assembler_takes_channel_zero() {
        let mut asm = FrameAssembler::new(2, 2, 16_000, 16_000);
        let mut frames: Vec<Vec<f32>> = Vec::new();
        asm.push(&[0.1, 9.0, 0.2, 9.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![0.1, 0.2]]);
    }

    #[test]
    fn resample_48k_to_16k_thirds_length() {
        let mut resampler = LinearResampler::new(48_000, 16_000);
        let mut out = Vec::new();
        resampler.process(&vec![0.25f32; 4800], &mut out);
        assert_eq!(out.len(), 1600);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn resample_keeps_phase_across_callbacks() {
        // A ramp makes every output the exact input index it was taken at.
        let ramp: Vec<f32> = (0..3072).map(|i| i as f32).collect();
        let mut resampler = LinearResampler::new(48_000, 16_000);
        let mut out = Vec::new();
        for chunk in ramp.chunks(1024) {
            resampler.process(chunk, &mut out);
        }
        assert_eq!(out.len(), 1024);
        for (j, sample) in out.iter().enumerate() {
            assert!((sample - (j * 3) as f32).abs() < 1e-3, "{j}: {sample}");
        }
    }

    #[test]
    fn resample_interpolates_across_boundary() {
        // 44.1kHz -> 16kHz lands between samples, including across buffers.
        let ramp: Vec<f32> = (0..4410).map(|i| i as f32).collect();
        let step = 44_100.0 / 16_000.0;
        let mut resampler = LinearResampler::new(44_100, 16_000);
        let mut out = Vec::new();
        for chunk in ramp.chunks(441) {
            resampler.process(chunk, &mut out);
        }
        assert_eq!(out.len(), 1600);
        for (j, sample) in out.iter().enumerate() {
            let expected = (j as f64 * step) as f32;
            assert!((sample - expected).abs() < 1e-2, "{j}: {sample} vs {expected}");
        }
    }

    #[test]
    fn assembler_resamples_across_small_callbacks() {
        let mut asm = FrameAssembler::new(341, 1, 48_000, 16_000);
        let mut emitted = 0;
        for _ in 0..3 {
            asm.push(&[0.5; 1024], |f| emitted += f.len());
        }
        assert_eq!(emitted + asm.pending_len(), 1024);
    }

    #[tokio::test]
    async fn frames_flow_in_capture_order() {
        let capture = FakeCapture::new();
        let mut device = capture.clone();
        let config = AudioConfig {
            frame_size: 2,
            ..AudioConfig::default()
        };

        let (mut pipeline, mut rx) = CapturePipeline::acquire(&mut device, &config).unwrap();
        pipeline.start().unwrap();
        capture.feed(&[0.1, 0.1]);
        capture.feed(&[0.2, 0.2]);
        capture.feed(&[0.3, 0.3]);

        let seqs: Vec<u64> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|f| f.unwrap().sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn release_happens_once_including_drop() {
        let capture = FakeCapture::new();
        let mut device = capture.clone();
        let (mut pipeline, _rx) =
            CapturePipeline::acquire(&mut device, &AudioConfig::default()).unwrap();
        assert!(pipeline.is_held());
        assert!(pipeline.release());
        assert!(!pipeline.release());
        drop(pipeline);
        assert_eq!(capture.release_count(), 1);
    }

    #[test]
    fn drop_releases_device() {
        let capture = FakeCapture::new();
        let mut device = capture.clone();
        {
            let _pipeline = CapturePipeline::acquire(&mut device, &AudioConfig::default()).unwrap();
        }
        assert_eq!(capture.release_count(), 1);
    }

    #[test]
    fn denied_device_is_unavailable() {
        let capture = FakeCapture::denied();
        let mut device = capture.clone();
        match CapturePipeline::acquire(&mut device, &AudioConfig::default()) {
            Err(LiveError::DeviceUnavailable(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected acquisition to fail"),
        }
        assert_eq!(capture.release_count(), 0);
    }
}
