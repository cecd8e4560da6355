//! Audio capture, output, and PCM conversion via cpal.

pub mod capture;
pub mod output;
pub mod pcm;
