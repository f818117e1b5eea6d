//! Audio capture, playback, and the frame codec.

pub mod capture;
pub mod codec;
pub mod devices;
pub mod playback;

#[derive(Debug)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    DeviceError(String),
    StreamError(String),
    UnsupportedFormat(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "no input device available"),
            AudioError::NoOutputDevice => write!(f, "no output device available"),
            AudioError::DeviceError(e) => write!(f, "device error: {}", e),
            AudioError::StreamError(e) => write!(f, "stream error: {}", e),
            AudioError::UnsupportedFormat(e) => write!(f, "unsupported format: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// Convert any cpal sample to PCM16.
pub fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Integer-ratio downsampling by block averaging. Non-integer ratios
/// return the input unchanged; the caller declares the true rate instead.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate <= target_rate || target_rate == 0 || source_rate % target_rate != 0 {
        return samples.to_vec();
    }
    let ratio = (source_rate / target_rate) as usize;
    samples
        .chunks(ratio)
        .map(|chunk| {
            let sum: i64 = chunk.iter().map(|s| *s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_halves_at_2x_ratio() {
        let samples: Vec<i16> = (0..16).collect();
        let out = downsample(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 8);
        // Block average of consecutive pairs.
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 2);
    }

    #[test]
    fn downsample_passes_through_non_integer_ratio() {
        let samples: Vec<i16> = (0..10).collect();
        let out = downsample(&samples, 44_100, 16_000);
        assert_eq!(out, samples);
    }

    #[test]
    fn downsample_passes_through_upsampling_request() {
        let samples = vec![1i16, 2, 3];
        assert_eq!(downsample(&samples, 16_000, 48_000), samples);
    }
}
