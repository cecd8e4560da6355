//! Reply scheduling rendered through the real mixer timeline.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use kairos_live::PlaybackScheduler;
use kairos_live::audio::output::{BufferId, Mixer, OutputDevice, OutputEvent};
use kairos_live::audio::pcm::encode_base64_pcm16;
use kairos_live::error::Result;
use tokio::sync::mpsc;

const RATE: u32 = 1_000;

struct MixerOutput(Mixer);

impl OutputDevice for MixerOutput {
    fn current_time(&self) -> f64 {
        self.0.current_time()
    }

    fn schedule_buffer(&mut self, samples: Vec<f32>, start_time: f64) -> Result<BufferId> {
        Ok(self.0.schedule(samples, start_time))
    }

    fn stop(&mut self, id: BufferId) {
        self.0.stop(id);
    }
}

fn scheduler() -> (
    PlaybackScheduler<MixerOutput>,
    mpsc::UnboundedReceiver<OutputEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PlaybackScheduler::new(MixerOutput(Mixer::new(RATE, tx)), RATE), rx)
}

fn render(s: &mut PlaybackScheduler<MixerOutput>, out: &mut [f32]) {
    s.output_mut().0.render(out, 1);
}

fn drain_ended(
    s: &mut PlaybackScheduler<MixerOutput>,
    rx: &mut mpsc::UnboundedReceiver<OutputEvent>,
) -> bool {
    let mut ended_speaking = false;
    while let Ok(OutputEvent::Ended(id)) = rx.try_recv() {
        ended_speaking |= s.on_buffer_ended(id);
    }
    ended_speaking
}

#[test]
fn consecutive_chunks_render_without_gap_or_overlap() {
    let (mut s, mut rx) = scheduler();
    s.enqueue(&encode_base64_pcm16(&[0.25; 100])).unwrap();
    s.enqueue(&encode_base64_pcm16(&[0.5; 50])).unwrap();

    let mut out = vec![0.0; 200];
    render(&mut s, &mut out);

    assert!(out[..100].iter().all(|&v| (v - 0.25).abs() < 1e-3));
    assert!(out[100..150].iter().all(|&v| (v - 0.5).abs() < 1e-3));
    assert!(out[150..].iter().all(|&v| v == 0.0));
    assert!(drain_ended(&mut s, &mut rx));
    assert!(!s.is_speaking());
}

#[test]
fn chunk_arriving_after_silence_starts_immediately() {
    let (mut s, mut rx) = scheduler();
    s.enqueue(&encode_base64_pcm16(&[0.25; 10])).unwrap();
    let mut out = vec![0.0; 500];
    render(&mut s, &mut out);
    assert!(drain_ended(&mut s, &mut rx));

    let late = s.enqueue(&encode_base64_pcm16(&[0.5; 10])).unwrap();
    assert!((late.start_time - 0.5).abs() < 1e-9);

    let mut next = vec![0.0; 10];
    render(&mut s, &mut next);
    assert!(next.iter().all(|&v| (v - 0.5).abs() < 1e-3));
}

#[test]
fn interruption_silences_output_and_next_reply_starts_at_now() {
    let (mut s, mut rx) = scheduler();
    s.enqueue(&encode_base64_pcm16(&[0.25; 500])).unwrap();
    s.enqueue(&encode_base64_pcm16(&[0.25; 500])).unwrap();

    let mut out = vec![0.0; 400];
    render(&mut s, &mut out);
    assert_eq!(s.flush(), 2);

    let mut after = vec![1.0; 100];
    render(&mut s, &mut after);
    assert!(after.iter().all(|&v| v == 0.0));
    assert!(!drain_ended(&mut s, &mut rx));

    let next = s.enqueue(&encode_base64_pcm16(&[0.5; 10])).unwrap();
    assert!((next.start_time - 0.5).abs() < 1e-9);
    assert!(s.is_speaking());
}
