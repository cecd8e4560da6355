//! Kairos live: real-time spoken conversation with a hosted speech model.
//!
//! Live mode streams microphone audio to the provider and plays the
//! provider's spoken replies back without gaps:
//! Microphone → Capture → Transport → Playback Scheduler → Speaker
//!
//! # Architecture
//!
//! - **Capture**: fixed-size microphone frames via `cpal`, encoded as int16 PCM
//! - **Session controller**: lifecycle of one live session and interruption handling
//! - **Transport**: WebSocket session with the provider (`tokio-tungstenite`)
//! - **Playback scheduler**: back-to-back placement of reply chunks on the output clock
//! - **Live runtime**: single-task event loop behind a cloneable [`LiveHandle`]

pub mod audio;
pub mod config;
pub mod error;
pub mod live;
pub mod logging;
pub mod playback;
pub mod session;
pub mod testing;

pub use config::LiveConfig;
pub use error::{LiveError, Result};
pub use live::{LiveEvent, LiveHandle, LiveRuntime, LiveStatus, spawn_live};
pub use playback::PlaybackScheduler;
pub use session::controller::{SessionController, SessionState};
