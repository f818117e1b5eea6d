//! Microphone capture for push-to-talk.
//!
//! cpal streams are not `Send`, so each capture owns a dedicated thread
//! that holds the stream for its whole lifetime. The data callback does
//! only cheap work: sample conversion, channel extraction, and framing
//! into 100 ms chunks pushed over a bounded channel. Compression and
//! network writes happen downstream on the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::{devices, downsample, sample_to_i16, AudioError};
use crate::signaling::WIRE_SAMPLE_RATE;

/// One 100 ms chunk of mono PCM16 at the declared rate.
#[derive(Debug)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Live capture session. Dropping the handle stops the stream.
pub struct CaptureHandle {
    gate: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn stop(&mut self) {
        self.gate.store(false, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Verify that a capture source can be opened, without starting a stream.
/// Used before committing to an accepted call.
pub fn probe_input(preferred: Option<&str>) -> Result<(), AudioError> {
    let device = devices::find_input_device(preferred)?;
    device
        .default_input_config()
        .map_err(|e| AudioError::DeviceError(e.to_string()))?;
    Ok(())
}

/// Open the capture source and start framing into `frames`.
pub fn start_capture(
    preferred: Option<&str>,
    frames: mpsc::Sender<PcmFrame>,
) -> Result<CaptureHandle, AudioError> {
    let device = devices::find_input_device(preferred)?;
    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceError(e.to_string()))?;

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let device_rate = config.sample_rate.0;
    let channels = config.channels;

    let gate = Arc::new(AtomicBool::new(true));
    let stopped = Arc::new(AtomicBool::new(false));

    // Startup result crosses back from the stream thread so acquisition
    // failures surface to the caller instead of dying silently.
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();

    let thread_gate = Arc::clone(&gate);
    let thread_stopped = Arc::clone(&stopped);
    let join = thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            let framer = Framer::new(device_rate, channels, thread_gate, frames);
            let stream = match sample_format {
                SampleFormat::I16 => build_stream::<i16>(&device, &config, framer),
                SampleFormat::U16 => build_stream::<u16>(&device, &config, framer),
                SampleFormat::F32 => build_stream::<f32>(&device, &config, framer),
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
            debug!("capture thread exiting");
        })
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(CaptureHandle {
            gate,
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
                "capture thread died during startup".to_string(),
            ))
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut framer: Framer,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::Sample<Float = f32> + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _| framer.push(data),
            |e| warn!("capture stream error: {}", e),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Accumulates mono PCM16 and emits 100 ms frames.
struct Framer {
    device_rate: u32,
    wire_rate: u32,
    channels: usize,
    chunk_len: usize,
    buf: Vec<i16>,
    gate: Arc<AtomicBool>,
    frames: mpsc::Sender<PcmFrame>,
}

impl Framer {
    fn new(
        device_rate: u32,
        channels: u16,
        gate: Arc<AtomicBool>,
        frames: mpsc::Sender<PcmFrame>,
    ) -> Self {
        // Non-integer ratios go on the wire at the device rate; receivers
        // resample against the declared rate.
        let wire_rate = if device_rate % WIRE_SAMPLE_RATE == 0 {
            WIRE_SAMPLE_RATE
        } else {
            device_rate
        };
        let chunk_len = (device_rate / 10) as usize;
        Self {
            device_rate,
            wire_rate,
            channels: channels.max(1) as usize,
            chunk_len,
            buf: Vec::with_capacity(chunk_len),
            gate,
            frames,
        }
    }

    fn push<T: cpal::Sample<Float = f32>>(&mut self, data: &[T]) {
        if !self.gate.load(Ordering::Relaxed) {
            self.buf.clear();
            return;
        }
        // First channel only; the wire is mono.
        for chunk in data.chunks(self.channels) {
            if let Some(first) = chunk.first() {
                self.buf.push(sample_to_i16(*first));
            }
        }
        while self.buf.len() >= self.chunk_len {
            let rest = self.buf.split_off(self.chunk_len);
            let raw = std::mem::replace(&mut self.buf, rest);
            let samples = downsample(&raw, self.device_rate, self.wire_rate);
            // Back-pressure policy is drop: a full channel loses the
            // frame rather than stalling the audio callback.
            if self
                .frames
                .try_send(PcmFrame {
                    samples,
                    sample_rate: self.wire_rate,
                })
                .is_err()
            {
                debug!("capture frame dropped, consumer behind");
            }
        }
    }
}
