//! Gapless scheduling of inbound speech chunks.
//!
//! [`PlaybackScheduler`] owns the playback cursor, the set of in-flight
//! output buffers, and the "assistant is speaking" indicator. Every chunk
//! starts at `max(now, cursor)` and advances the cursor by its duration, so
//! chunks play in arrival order with no gap and no overlap. An interruption
//! calls [`flush`](PlaybackScheduler::flush), which stops everything in
//! flight and pins the cursor to the output clock, so the first chunk after
//! an interruption starts at "now" rather than where the cut reply would
//! have ended.

use std::collections::BTreeSet;

use crate::audio::output::{BufferId, OutputDevice};
use crate::audio::pcm::decode_base64_pcm16;
use crate::error::{LiveError, Result};
use tracing::debug;

/// Where and for how long a chunk was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    /// Output buffer handle.
    pub id: BufferId,
    /// Start on the output clock, in seconds.
    pub start_time: f64,
    /// Duration in seconds.
    pub duration: f64,
    /// Whether this chunk turned the speaking indicator on.
    pub started_speaking: bool,
}

/// Schedules decoded reply chunks on an [`OutputDevice`].
pub struct PlaybackScheduler<O> {
    output: O,
    sample_rate: u32,
    next_start_time: f64,
    in_flight: BTreeSet<BufferId>,
    speaking: bool,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    /// Create a scheduler for mono chunks at `sample_rate`.
    pub fn new(output: O, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate: sample_rate.max(1),
            next_start_time: 0.0,
            in_flight: BTreeSet::new(),
            speaking: false,
        }
    }

    /// Decode a base64 int16 PCM chunk and schedule it.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Decode`] for a malformed payload; scheduler state
    /// is unchanged in that case.
    pub fn enqueue(&mut self, payload: &str) -> Result<ScheduledChunk> {
        let samples = decode_base64_pcm16(payload)?;
        self.enqueue_samples(samples)
    }

    /// Schedule already-decoded samples.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Decode`] for an empty buffer, or the output
    /// device's error if it refuses the buffer.
    pub fn enqueue_samples(&mut self, samples: Vec<f32>) -> Result<ScheduledChunk> {
        if samples.is_empty() {
            return Err(LiveError::Decode("empty audio chunk".into()));
        }

        let duration = samples.len() as f64 / f64::from(self.sample_rate);
        let start_time = self.next_start_time.max(self.output.current_time());
        let id = self.output.schedule_buffer(samples, start_time)?;

        self.in_flight.insert(id);
        self.next_start_time = start_time + duration;

        let started_speaking = !self.speaking;
        self.speaking = true;

        debug!(buffer = id.0, start_time, duration, "scheduled reply chunk");

        Ok(ScheduledChunk {
            id,
            start_time,
            duration,
            started_speaking,
        })
    }

    /// Stop every in-flight buffer and clear the speaking indicator.
    ///
    /// Returns the number of buffers stopped. The cursor is pinned to the
    /// current clock; it never moves ahead of where it was.
    pub fn flush(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for id in std::mem::take(&mut self.in_flight) {
            self.output.stop(id);
        }
        self.speaking = false;
        self.next_start_time = self.next_start_time.min(self.output.current_time());
        if stopped > 0 {
            debug!(stopped, "flushed playback");
        }
        stopped
    }

    /// Record that a buffer played out. Returns `true` when this emptied the
    /// in-flight set and turned the speaking indicator off.
    pub fn on_buffer_ended(&mut self, id: BufferId) -> bool {
        if !self.in_flight.remove(&id) {
            return false;
        }
        if self.in_flight.is_empty() && self.speaking {
            self.speaking = false;
            return true;
        }
        false
    }

    /// Whether reply audio is scheduled or playing.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// The playback cursor: earliest start for the next chunk.
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of buffers scheduled or playing.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Borrow the output device.
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Mutably borrow the output device.
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}
