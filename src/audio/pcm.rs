//! Wire sample format conversion.
//!
//! Outbound frames are 16-bit signed little-endian PCM, base64 encoded and
//! tagged `audio/pcm;rate=<hz>`. Inbound chunks use the same sample layout
//! at the output rate.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::{LiveError, Result};

/// Scale between normalized f32 samples and int16 PCM.
pub const PCM_SCALE: f32 = 32768.0;

/// MIME-style tag for linear 16-bit PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Extract the `rate=` parameter from a PCM MIME tag.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Convert one normalized sample to int16 by scaling and truncating toward zero.
///
/// Values at or beyond full scale saturate to the int16 range; NaN maps to 0.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample * PCM_SCALE) as i16
}

/// Convert one int16 sample back to the normalized range.
pub fn pcm16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / PCM_SCALE
}

/// Convert normalized samples to little-endian int16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| f32_to_pcm16(s).to_le_bytes())
        .collect()
}

/// Interpret little-endian int16 bytes as normalized samples.
///
/// # Errors
///
/// Returns [`LiveError::Decode`] if the byte count is not a whole number of samples.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Base64-encode normalized samples as int16 PCM.
pub fn encode_base64_pcm16(samples: &[f32]) -> String {
    STANDARD.encode(encode_pcm16(samples))
}

/// Decode a base64 int16 PCM payload into normalized samples.
///
/// # Errors
///
/// Returns [`LiveError::Decode`] on invalid base64, odd byte counts, or an empty payload.
pub fn decode_base64_pcm16(payload: &str) -> Result<Vec<f32>> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| LiveError::Decode(format!("invalid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(LiveError::Decode("empty audio payload".into()));
    }
    decode_pcm16(&bytes)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn conversion_truncates_toward_zero() {
        // 0.00005 * 32768 = 1.6384 -> 1, not 2.
        assert_eq!(f32_to_pcm16(0.00005), 1);
        // -0.00005 * 32768 = -1.6384 -> -1, not -2.
        assert_eq!(f32_to_pcm16(-0.00005), -1);
        assert_eq!(f32_to_pcm16(0.5), 16384);
        assert_eq!(f32_to_pcm16(-1.0), i16::MIN);
    }

    #[test]
    fn full_scale_saturates() {
        assert_eq!(f32_to_pcm16(1.0), i16::MAX);
        assert_eq!(f32_to_pcm16(3.0), i16::MAX);
        assert_eq!(f32_to_pcm16(-3.0), i16::MIN);
        assert_eq!(f32_to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn encode_is_little_endian() {
        let bytes = encode_pcm16(&[0.5, -0.5]);
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn decode_odd_length_fails() {
        assert!(matches!(
            decode_pcm16(&[0x00, 0x40, 0x01]),
            Err(LiveError::Decode(_))
        ));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(matches!(
            decode_base64_pcm16("not*base64!"),
            Err(LiveError::Decode(_))
        ));
        assert!(matches!(decode_base64_pcm16(""), Err(LiveError::Decode(_))));
    }

    #[test]
    fn outbound_then_inbound_within_one_step() {
        let input: Vec<f32> = (0..200).map(|i| ((i as f32) * 0.37).sin() * 0.9).collect();
        let decoded = decode_base64_pcm16(&encode_base64_pcm16(&input)).unwrap();
        assert_eq!(decoded.len(), input.len());
        for (a, b) in input.iter().zip(&decoded) {
            assert!((a - b).abs() <= 1.0 / PCM_SCALE, "{a} vs {b}");
        }
    }

    #[test]
    fn mime_tag_and_rate() {
        assert_eq!(pcm_mime_type(16_000), "audio/pcm;rate=16000");
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
    }
}
