//! Per-sender playback sinks.
//!
//! Every remote sender gets its own output stream and sample queue, so in
//! group voice concurrent talkers play without any mixing step. Sinks are
//! created lazily on the first frame from a sender and live until the
//! mixer is dropped.
//!
//! Like capture, each sink parks a dedicated thread that owns the cpal
//! stream. The output callback drains the queue and pads with silence on
//! underrun.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use log::{debug, warn};

use super::{devices, AudioError};

/// Cap queued audio per sender; beyond this, incoming frames are dropped
/// to bound latency.
const MAX_QUEUE_SECONDS: u32 = 2;

/// Lazily-populated set of per-sender output sinks.
pub struct Playback {
    preferred: Option<String>,
    sinks: Mutex<HashMap<String, Sink>>,
}

impl Playback {
    pub fn new(preferred_output: Option<String>) -> Self {
        Self {
            preferred: preferred_output,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a decoded frame on the sender's sink, creating it on first
    /// use. A sink that cannot be opened drops the frame with a warning.
    pub fn render(&self, sender: &str, samples: &[i16], sample_rate: u32) {
        let mut sinks = match self.sinks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !sinks.contains_key(sender) {
            match Sink::open(self.preferred.as_deref()) {
                Ok(sink) => {
                    debug!("opened playback sink for {}", sender);
                    sinks.insert(sender.to_string(), sink);
                }
                Err(e) => {
                    warn!("cannot open playback sink for {}: {}", sender, e);
                    return;
                }
            }
        }
        if let Some(sink) = sinks.get(sender) {
            sink.push(samples, sample_rate);
        }
    }

    /// Drop all sinks, releasing their devices.
    pub fn clear(&self) {
        let mut sinks = match self.sinks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        sinks.clear();
    }
}

struct Sink {
    queue: Arc<Mutex<VecDeque<i16>>>,
    device_rate: u32,
    stopped: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl Sink {
    fn open(preferred: Option<&str>) -> Result<Self, AudioError> {
        let device = devices::find_output_device(preferred)?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;

        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let device_rate = config.sample_rate.0;
        let channels = config.channels.max(1) as usize;

        let queue: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let thread_queue = Arc::clone(&queue);
        let thread_stopped = Arc::clone(&stopped);

        let join = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::I16 => {
                        build_stream::<i16>(&device, &config, channels, thread_queue)
                    }
                    SampleFormat::F32 => {
                        build_stream::<f32>(&device, &config, channels, thread_queue)
                    }
                    SampleFormat::U16 => {
                        build_stream::<u16>(&device, &config, channels, thread_queue)
                    }
                    other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                };

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !thread_stopped.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                device_rate,
                stopped,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(AudioError::StreamError(
                    "playback thread died during startup".to_string(),
                ))
            }
        }
    }

    fn push(&self, samples: &[i16], sample_rate: u32) {
        let resampled = resample_linear(samples, sample_rate, self.device_rate);
        let mut queue = match self.queue.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cap = (self.device_rate * MAX_QUEUE_SECONDS) as usize;
        if queue.len() + resampled.len() > cap {
            debug!("playback queue full, dropping frame");
            return;
        }
        queue.extend(resampled);
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    queue: Arc<Mutex<VecDeque<i16>>>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<i16>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let mut queue = match queue.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0);
                    for slot in frame.iter_mut() {
                        *slot = T::from_sample(sample);
                    }
                }
            },
            |e| warn!("playback stream error: {}", e),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Linear-interpolation resampling from the declared wire rate to the
/// output device rate. Honoring the declared rate keeps mismatched
/// capture rates from playing back distorted.
pub fn resample_linear(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate || samples.is_empty() || source_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = source_rate as f64 / target_rate as f64;
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}
