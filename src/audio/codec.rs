//! Lossless frame codec and level metering.
//!
//! Voice frames are PCM16 little-endian, zlib-deflated at maximum
//! compression before base64 encoding onto the wire. Decompression failure
//! means a corrupt frame; the frame is dropped, never partially rendered.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

#[derive(Debug)]
pub enum CodecError {
    Corrupt(std::io::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Corrupt(e) => write!(f, "corrupt audio frame: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

/// Serialize samples as PCM16 LE bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Parse PCM16 LE bytes back into samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Deflate a frame at maximum compression.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Inflate a frame. Errors indicate corruption in transit.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(CodecError::Corrupt)?;
    Ok(out)
}

/// Human-readable compression ratio for the envelope metadata field.
pub fn ratio_label(original: usize, compressed: usize) -> String {
    if original == 0 {
        return "0%".to_string();
    }
    let pct = (compressed as f64 / original as f64 * 100.0).round() as u64;
    format!("{}%", pct)
}

/// Perceptual scale 0..=100 from mean absolute amplitude, boosted 3x so
/// normal speech registers mid-scale.
pub fn level_of(samples: &[i16]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u64 = samples.iter().map(|s| (*s as i64).unsigned_abs()).sum();
    let mean = sum as f64 / samples.len() as f64;
    let level = (mean / 32_768.0 * 100.0 * 3.0).round();
    level.min(100.0) as u8
}

/// Text meter for the talk indicator, e.g. `[####------] 40`.
pub fn level_meter(level: u8) -> String {
    let filled = (level as usize / 10).min(10);
    let mut bar = String::with_capacity(14);
    bar.push('[');
    for i in 0..10 {
        bar.push(if i < filled { '#' } else { '-' });
    }
    bar.push(']');
    format!("{} {}", bar, level)
}
