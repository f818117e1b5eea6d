//! Effect runner.
//!
//! Interprets [`Effect`] values produced by the state machine. Every
//! effect spawns onto the runtime so the event loop never blocks; results
//! come back as events on the same channel the loop consumes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::audio::capture::{self, CaptureHandle};
use crate::audio::codec;
use crate::audio::playback::Playback;
use crate::relay::RelayHandle;
use crate::signaling::{Identity, SignalingEnvelope};
use crate::state_machine::{Effect, Event, Signal};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const RING_INTERVAL: Duration = Duration::from_secs(2);

/// Executes effects. Implementations must be cheap to call; long work is
/// spawned, with completions delivered as events on `tx`.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Production runner wired to the relay, the microphone, and the
/// per-sender playback sinks.
pub struct VoiceEffectRunner {
    identity: Identity,
    relay: Arc<RelayHandle>,
    input_device: Option<String>,
    playback: Arc<Playback>,
    /// Active capture session, if any. Replaced wholesale on restart.
    capture: Arc<AsyncMutex<Option<CaptureHandle>>>,
    /// Authoritative voice target, read by the framing task per frame.
    /// `None` means stop transmitting.
    capture_target: Arc<Mutex<Option<String>>>,
    /// Id of the ring loop currently allowed to sound.
    active_ring: Arc<Mutex<Option<Uuid>>>,
}

impl VoiceEffectRunner {
    pub fn new(
        identity: Identity,
        relay: Arc<RelayHandle>,
        input_device: Option<String>,
        playback: Arc<Playback>,
    ) -> Self {
        Self {
            identity,
            relay,
            input_device,
            playback,
            capture: Arc::new(AsyncMutex::new(None)),
            capture_target: Arc::new(Mutex::new(None)),
            active_ring: Arc::new(Mutex::new(None)),
        }
    }

    fn envelope_for(&self, signal: Signal) -> SignalingEnvelope {
        let id = &self.identity;
        match signal {
            Signal::CallRequest { target } => SignalingEnvelope::call_request(id, &target),
            Signal::CallAccepted { target } => SignalingEnvelope::call_accepted(id, &target),
            Signal::CallRejected { target } => SignalingEnvelope::call_rejected(id, &target),
            Signal::CallBusy { target } => SignalingEnvelope::call_busy(id, &target),
            Signal::CallEnded { target } => SignalingEnvelope::call_ended(id, &target),
            Signal::VoiceStatus { activity, target } => {
                SignalingEnvelope::voice_status(id, activity, &target)
            }
            Signal::Video { activity, target } => {
                SignalingEnvelope::video_status(id, activity, &target)
            }
            Signal::JoinedGroupVoice => SignalingEnvelope::joined_group_voice(id),
            Signal::LeftGroupVoice => SignalingEnvelope::left_group_voice(id),
            Signal::Chat { message } => SignalingEnvelope::chat_message(id, &message),
        }
    }

    fn lock_target(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.capture_target.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_ring(&self) -> std::sync::MutexGuard<'_, Option<Uuid>> {
        match self.active_ring.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EffectRunner for VoiceEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::Send(signal) => {
                let envelope = self.envelope_for(signal);
                let relay = Arc::clone(&self.relay);
                tokio::spawn(async move {
                    if let Err(e) = relay.broadcast(envelope).await {
                        warn!("signaling send failed: {}", e);
                        let _ = tx.send(Event::Message(format!("Send failed: {}", e))).await;
                    }
                });
            }

            Effect::StartDialTimer { attempt } => {
                tokio::spawn(async move {
                    tokio::time::sleep(DIAL_TIMEOUT).await;
                    // Stale attempts are discarded by the reducer.
                    let _ = tx.send(Event::DialTimeout { attempt }).await;
                });
            }

            Effect::StartRing { ring, caller } => {
                *self.lock_ring() = Some(ring);
                let active_ring = Arc::clone(&self.active_ring);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(RING_INTERVAL);
                    loop {
                        ticker.tick().await;
                        let live = match active_ring.lock() {
                            Ok(g) => *g == Some(ring),
                            Err(poisoned) => *poisoned.into_inner() == Some(ring),
                        };
                        if !live {
                            debug!("ring loop {} retired", ring);
                            break;
                        }
                        // \x07 rings the terminal bell.
                        let banner = format!(
                            "\x07INCOMING CALL from {} (a = answer, r = reject)",
                            caller
                        );
                        if tx.send(Event::Message(banner)).await.is_err() {
                            break;
                        }
                    }
                });
            }

            Effect::StopRing { ring } => {
                let mut active = self.lock_ring();
                if *active == Some(ring) {
                    *active = None;
                }
            }

            Effect::AcquireForAnswer { caller } => {
                let input_device = self.input_device.clone();
                tokio::spawn(async move {
                    let probe = tokio::task::spawn_blocking(move || {
                        capture::probe_input(input_device.as_deref())
                    })
                    .await;
                    let event = match probe {
                        Ok(Ok(())) => Event::AnswerReady { caller },
                        Ok(Err(e)) => Event::AnswerFailed {
                            caller,
                            reason: e.to_string(),
                        },
                        Err(e) => Event::AnswerFailed {
                            caller,
                            reason: e.to_string(),
                        },
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::StartCapture { target } => {
                *self.lock_target() = Some(target);
                let identity = self.identity.clone();
                let relay = Arc::clone(&self.relay);
                let input_device = self.input_device.clone();
                let capture = Arc::clone(&self.capture);
                let capture_target = Arc::clone(&self.capture_target);

                tokio::spawn(async move {
                    let (frames_tx, mut frames_rx) = mpsc::channel(10);
                    let started = tokio::task::spawn_blocking(move || {
                        capture::start_capture(input_device.as_deref(), frames_tx)
                    })
                    .await;

                    let handle = match started {
                        Ok(Ok(handle)) => handle,
                        Ok(Err(e)) => {
                            match capture_target.lock() {
                                Ok(mut g) => *g = None,
                                Err(poisoned) => *poisoned.into_inner() = None,
                            }
                            let _ = tx
                                .send(Event::CaptureFailed {
                                    reason: e.to_string(),
                                })
                                .await;
                            return;
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Event::CaptureFailed {
                                    reason: e.to_string(),
                                })
                                .await;
                            return;
                        }
                    };

                    let old = capture.lock().await.replace(handle);
                    if let Some(old) = old {
                        // Stopping joins the stream thread; keep it off
                        // the runtime worker.
                        let _ = tokio::task::spawn_blocking(move || drop(old)).await;
                    }
                    let _ = tx.send(Event::CaptureStarted).await;

                    while let Some(frame) = frames_rx.recv().await {
                        let target = match capture_target.lock() {
                            Ok(g) => g.clone(),
                            Err(poisoned) => poisoned.into_inner().clone(),
                        };
                        let Some(target) = target else { break };

                        let level = codec::level_of(&frame.samples);
                        let bytes = codec::samples_to_bytes(&frame.samples);
                        let packed = codec::compress(&bytes);
                        let ratio = codec::ratio_label(bytes.len(), packed.len());
                        let envelope = SignalingEnvelope::voice_data(
                            &identity,
                            &packed,
                            frame.sample_rate,
                            &target,
                            ratio,
                        );
                        if relay.broadcast(envelope).await.is_err() {
                            break;
                        }
                        let _ = tx.send(Event::AudioLevel(level)).await;
                    }
                    debug!("framing task exiting");
                });
            }

            Effect::StopCapture => {
                *self.lock_target() = None;
                let capture = Arc::clone(&self.capture);
                tokio::spawn(async move {
                    let old = capture.lock().await.take();
                    if let Some(old) = old {
                        let _ = tokio::task::spawn_blocking(move || drop(old)).await;
                    }
                    let _ = tx.send(Event::CaptureStopped).await;
                });
            }

            Effect::RenderFrame { sender, frame } => {
                let playback = Arc::clone(&self.playback);
                tokio::spawn(async move {
                    let bytes = match codec::decompress(&frame.payload) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!("dropping corrupt frame from {}: {}", sender, e);
                            return;
                        }
                    };
                    let samples = codec::bytes_to_samples(&bytes);
                    let rate = frame.sample_rate;
                    // Sink creation touches the audio device.
                    let _ = tokio::task::spawn_blocking(move || {
                        playback.render(&sender, &samples, rate);
                    })
                    .await;
                });
            }

            Effect::ClearPlayback => {
                let playback = Arc::clone(&self.playback);
                tokio::spawn(async move {
                    // Dropping sinks joins their stream threads.
                    let _ = tokio::task::spawn_blocking(move || playback.clear()).await;
                });
            }

            // Printed at the loop edge, never dispatched here.
            Effect::Notify(message) => {
                debug!("notify effect reached runner: {}", message);
            }
        }
    }
}

/// Test runner: records every effect and immediately completes the ones
/// the loop waits on.
pub struct StubEffectRunner {
    pub effects: Arc<Mutex<Vec<Effect>>>,
}

impl StubEffectRunner {
    pub fn new() -> Self {
        Self {
            effects: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn recorded(&self) -> Vec<Effect> {
        match self.effects.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for StubEffectRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        if let Ok(mut effects) = self.effects.lock() {
            effects.push(effect.clone());
        }
        let completion = match effect {
            Effect::AcquireForAnswer { caller } => Some(Event::AnswerReady { caller }),
            Effect::StartCapture { .. } => Some(Event::CaptureStarted),
            Effect::StopCapture => Some(Event::CaptureStopped),
            _ => None,
        };
        if let Some(event) = completion {
            let _ = tx.try_send(event);
        }
    }
}
