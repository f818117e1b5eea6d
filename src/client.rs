//! Event loop and signaling dispatcher.
//!
//! A single consumer owns all mutable state: the call state, the
//! transmit flags, and the peer roster. Events from the terminal, the
//! relay reader, and effect completions funnel through one channel, so
//! no transition ever races another. Edge concerns (printing, mute
//! flags, roster bookkeeping, line parsing) are handled here; everything
//! else goes through the reducer.

use std::io::Write as _;
use std::mem::discriminant;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::audio::{codec, devices};
use crate::commands::Command;
use crate::effects::EffectRunner;
use crate::presence::{target_matches, Roster};
use crate::signaling::{Identity, SignalingEnvelope, VoiceActivity};
use crate::state_machine::{reduce, CallState, Effect, EncodedFrame, Event, Signal, TransmitState};

pub struct CallClient {
    identity: Identity,
    state: CallState,
    transmit: TransmitState,
    roster: Roster,
    runner: Arc<dyn EffectRunner>,
    events_tx: mpsc::Sender<Event>,
}

impl CallClient {
    pub fn new(
        identity: Identity,
        runner: Arc<dyn EffectRunner>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        let roster = Roster::new(&identity.nickname);
        Self {
            identity,
            state: CallState::Idle,
            transmit: TransmitState::default(),
            roster,
            runner,
            events_tx,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn transmit(&self) -> &TransmitState {
        &self.transmit
    }

    /// Consume events until quit or the channel closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        info!("event loop exited");
    }

    /// Process one event. Returns false when the client should exit.
    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::UserLine(line) => return self.handle_line(&line),

            Event::Quit => {
                self.wind_down();
                return false;
            }

            Event::Mute => {
                self.transmit.is_muted = true;
                println!(">> Muted (incoming audio dropped)");
            }
            Event::Unmute => {
                self.transmit.is_muted = false;
                println!(">> Unmuted");
            }

            Event::AudioLevel(level) => {
                self.transmit.audio_level = level;
                if self.transmit.is_talking {
                    print!("\r{}  ", codec::level_meter(level));
                    let _ = std::io::stdout().flush();
                }
            }

            Event::RosterReplaced(peers) => {
                let before = self.roster.len();
                self.roster.replace(peers);
                if self.roster.len() != before {
                    println!(">> Peers online: {}", self.roster.len());
                }
            }

            Event::EnvelopeReceived(envelope) => {
                if let Some(translated) = self.dispatch_envelope(envelope) {
                    self.apply(translated);
                }
            }

            Event::Message(text) => println!(">> {}", text),

            Event::CaptureStarted => {
                self.transmit.capture_pending = false;
                self.transmit.is_talking = true;
                println!(">> TALKING (s to stop)");
            }
            Event::CaptureStopped => {
                self.transmit.capture_pending = false;
                self.transmit.is_talking = false;
            }
            Event::CaptureFailed { reason } => {
                self.transmit.capture_pending = false;
                self.transmit.is_talking = false;
                self.apply(Event::CaptureFailed { reason });
            }

            other => self.apply(other),
        }
        true
    }

    /// Run one reduction and execute its effects.
    fn apply(&mut self, event: Event) {
        let (next, effects) = reduce(&self.state, &self.transmit, event);
        if discriminant(&next) != discriminant(&self.state) {
            info!("call state: {} -> {}", self.state.label(), next.label());
        }
        self.state = next;
        for effect in effects {
            match effect {
                Effect::Notify(message) => println!(">> {}", message),
                other => {
                    // Guard the window between requesting capture and its
                    // completion so a repeated start is rejected.
                    if matches!(other, Effect::StartCapture { .. }) {
                        self.transmit.capture_pending = true;
                    }
                    self.runner.spawn(other, self.events_tx.clone());
                }
            }
        }
    }

    /// Translate an inbound envelope to a reducer event. Loopback and
    /// mistargeted envelopes yield nothing.
    fn dispatch_envelope(&self, envelope: SignalingEnvelope) -> Option<Event> {
        // The relay fans broadcasts back to the sender; drop our own.
        if let Some(from) = envelope.from_id() {
            if from == self.identity.node_id {
                return None;
            }
        }
        if let Some(nick) = envelope.nickname() {
            if nick.eq_ignore_ascii_case(&self.identity.nickname) {
                return None;
            }
        }

        let sender = envelope.display_name();
        let me = &self.identity.nickname;

        match envelope {
            SignalingEnvelope::CallRequest { target, .. } => {
                if target_matches(&target, me) {
                    Some(Event::CallRequested { caller: sender })
                } else {
                    None
                }
            }
            SignalingEnvelope::CallAccepted { target, .. } => {
                target_matches(&target, me).then_some(Event::CallAccepted { from: sender })
            }
            SignalingEnvelope::CallRejected { target, .. } => {
                target_matches(&target, me).then_some(Event::CallRejected { from: sender })
            }
            SignalingEnvelope::CallBusy { target, .. } => {
                target_matches(&target, me).then_some(Event::CallBusy { from: sender })
            }
            SignalingEnvelope::CallEnded { target, .. } => {
                target_matches(&target, me).then_some(Event::CallEnded { from: sender })
            }

            SignalingEnvelope::VoiceStatus { status, .. } => Some(Event::VoiceActivityChanged {
                sender,
                activity: status,
            }),

            SignalingEnvelope::VoiceData {
                audio, sample_rate, ..
            } => match STANDARD.decode(&audio) {
                Ok(payload) => Some(Event::VoiceFrame {
                    sender,
                    frame: EncodedFrame {
                        payload,
                        sample_rate,
                    },
                }),
                Err(e) => {
                    warn!("dropping voiceData with bad base64 from {}: {}", sender, e);
                    None
                }
            },

            SignalingEnvelope::JoinedGroupVoice { .. } => {
                Some(Event::PeerJoinedGroup { name: sender })
            }
            SignalingEnvelope::LeftGroupVoice { .. } => Some(Event::PeerLeftGroup { name: sender }),

            SignalingEnvelope::ChatMessage { message, .. } => {
                println!("[{}] {}", sender, message);
                None
            }

            SignalingEnvelope::VideoStatus { status, mode, .. } => {
                let verb = match status {
                    VoiceActivity::Started => "started",
                    VoiceActivity::Stopped => "stopped",
                };
                println!(">> {} {} video ({:?})", sender, verb, mode);
                None
            }

            SignalingEnvelope::Unknown => {
                debug!("unrecognized envelope dropped");
                None
            }
        }
    }

    /// Parse and execute one line of terminal input. Returns false on
    /// quit.
    fn handle_line(&mut self, line: &str) -> bool {
        let ringing = matches!(self.state, CallState::Ringing { .. });
        match Command::parse(line, ringing) {
            None => {}
            Some(Command::Call(query)) => match self.roster.resolve(&query) {
                Some(peer) => {
                    let target = peer.display_name();
                    self.apply(Event::Dial { target });
                }
                None => {
                    println!(">> User '{}' not found. Type peers to see who's online.", query)
                }
            },
            Some(Command::Answer) => self.apply(Event::Answer),
            Some(Command::Reject) => self.apply(Event::Reject),
            Some(Command::HangUp) => self.apply(Event::HangUp),
            Some(Command::JoinGroup) => self.apply(Event::JoinGroup),
            Some(Command::LeaveGroup) => self.apply(Event::LeaveGroup),
            Some(Command::Talk) => self.apply(Event::StartTalking),
            Some(Command::StopTalk) => self.apply(Event::StopTalking),
            Some(Command::Mute) => {
                self.transmit.is_muted = true;
                println!(">> Muted (incoming audio dropped)");
            }
            Some(Command::Unmute) => {
                self.transmit.is_muted = false;
                println!(">> Unmuted");
            }
            Some(Command::Video) => self.send_video_status(VoiceActivity::Started),
            Some(Command::VideoStop) => self.send_video_status(VoiceActivity::Stopped),
            Some(Command::Peers) => self.print_peers(),
            Some(Command::Status) => self.print_status(),
            Some(Command::Devices) => print_devices(),
            Some(Command::Help) => print_help(),
            Some(Command::Quit) => {
                self.wind_down();
                return false;
            }
            Some(Command::Chat(message)) => {
                self.runner.spawn(
                    Effect::Send(Signal::Chat { message }),
                    self.events_tx.clone(),
                );
            }
        }
        true
    }

    /// Advisory only; there is no video frame transport.
    fn send_video_status(&mut self, activity: VoiceActivity) {
        match crate::state_machine::transmit_target(&self.state) {
            Some(target) => {
                let verb = match activity {
                    VoiceActivity::Started => "started",
                    VoiceActivity::Stopped => "stopped",
                };
                self.runner.spawn(
                    Effect::Send(Signal::Video { activity, target }),
                    self.events_tx.clone(),
                );
                println!(">> Video {} (advisory)", verb);
            }
            None => println!(">> Join a call first (call <user> or voice)"),
        }
    }

    /// Leave any active call cleanly before exit.
    fn wind_down(&mut self) {
        let event = match self.state {
            CallState::Idle => None,
            CallState::InGroup { .. } => Some(Event::LeaveGroup),
            CallState::Ringing { .. } => Some(Event::Reject),
            CallState::Calling { .. } | CallState::InCall { .. } => Some(Event::HangUp),
        };
        if let Some(event) = event {
            self.apply(event);
        }
    }

    fn print_peers(&self) {
        if self.roster.is_empty() {
            println!(">> No peers online");
            return;
        }
        println!(">> Peers online ({}):", self.roster.len());
        for peer in self.roster.iter() {
            let voice = if peer.supports_voice() { " [voice]" } else { "" };
            println!("   {}{}", peer.display_name(), voice);
        }
    }

    fn print_status(&self) {
        println!(
            ">> State: {} | talking: {} | muted: {} | peers: {}",
            self.state.label(),
            self.transmit.is_talking,
            self.transmit.is_muted,
            self.roster.len()
        );
        match &self.state {
            CallState::InCall { partner } => println!("   In call with {}", partner),
            CallState::Calling { partner, .. } => println!("   Calling {}", partner),
            CallState::Ringing { caller, .. } => println!("   Incoming call from {}", caller),
            CallState::InGroup { members } => {
                println!("   Group voice, {} other member(s)", members.len())
            }
            CallState::Idle => {}
        }
    }
}

fn print_devices() {
    println!(">> Input devices:");
    for name in devices::list_input_devices() {
        println!("   {}", name);
    }
    println!(">> Output devices:");
    for name in devices::list_output_devices() {
        println!("   {}", name);
    }
}

fn print_help() {
    println!("Commands:");
    println!("  call <user>    start a call (c)");
    println!("  answer         answer an incoming call (a while ringing)");
    println!("  reject         reject an incoming call (r while ringing)");
    println!("  hangup         end the current call (h)");
    println!("  voice          join group voice (v)");
    println!("  leave          leave group voice");
    println!("  t / s          start / stop talking");
    println!("  video [stop]   send a video started/stopped advisory");
    println!("  mute / unmute  drop or resume incoming audio");
    println!("  peers          list who is online (p)");
    println!("  status         show call state");
    println!("  devices        list audio devices");
    println!("  quit           exit (q)");
    println!("Anything else is sent as a chat message.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::StubEffectRunner;
    use crate::presence::PeerRecord;

    fn envelope_from(json: &str) -> SignalingEnvelope {
        serde_json::from_str(json).unwrap()
    }

    fn new_client() -> (CallClient, Arc<StubEffectRunner>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(32);
        let runner = Arc::new(StubEffectRunner::new());
        let identity = Identity {
            node_id: "Alice-1".to_string(),
            nickname: "Alice".to_string(),
        };
        let client = CallClient::new(identity, runner.clone(), tx);
        (client, runner, rx)
    }

    fn drain(client: &mut CallClient, rx: &mut mpsc::Receiver<Event>) {
        while let Ok(event) = rx.try_recv() {
            client.handle_event(event);
        }
    }

    fn roster_with_bob(client: &mut CallClient) {
        client.handle_event(Event::RosterReplaced(vec![PeerRecord {
            nickname: Some("Bob".to_string()),
            address: Some("Bob-1".to_string()),
            mode: Some("voice-chat".to_string()),
            capabilities: vec!["voice".to_string()],
        }]));
    }

    #[test]
    fn loopback_envelope_is_ignored() {
        let (mut client, _runner, _rx) = new_client();
        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Alice-1", "nickname": "Alice",
                "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        assert!(client.state().is_idle());
    }

    #[test]
    fn mistargeted_call_request_is_ignored() {
        let (mut client, _runner, _rx) = new_client();
        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Bob-1", "nickname": "Bob",
                "target": "Carol", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        assert!(client.state().is_idle());
    }

    #[test]
    fn targeted_call_request_rings() {
        let (mut client, _runner, _rx) = new_client();
        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Bob-1", "nickname": "Bob",
                "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        assert!(matches!(client.state(), CallState::Ringing { caller, .. } if caller == "Bob"));
    }

    #[test]
    fn answer_flow_reaches_in_call_with_stub_capture() {
        let (mut client, runner, mut rx) = new_client();
        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Bob-1", "nickname": "Bob",
                "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        client.handle_event(Event::UserLine("a".to_string()));
        // Stub acquisition completes immediately; feed it back.
        drain(&mut client, &mut rx);

        assert!(matches!(client.state(), CallState::InCall { partner } if partner == "Bob"));
        assert!(runner.recorded().contains(&Effect::Send(Signal::CallAccepted {
            target: "Bob".to_string()
        })));
    }

    #[test]
    fn dial_resolves_nickname_prefix() {
        let (mut client, runner, _rx) = new_client();
        roster_with_bob(&mut client);
        client.handle_event(Event::UserLine("call bo".to_string()));

        assert!(matches!(client.state(), CallState::Calling { partner, .. } if partner == "Bob"));
        assert!(runner.recorded().iter().any(|e| matches!(
            e,
            Effect::Send(Signal::CallRequest { target }) if target == "Bob"
        )));
    }

    #[test]
    fn dial_unknown_user_stays_idle() {
        let (mut client, _runner, _rx) = new_client();
        roster_with_bob(&mut client);
        client.handle_event(Event::UserLine("call nobody".to_string()));
        assert!(client.state().is_idle());
    }

    #[test]
    fn bare_text_is_sent_as_chat() {
        let (mut client, runner, _rx) = new_client();
        client.handle_event(Event::UserLine("hello everyone".to_string()));
        assert!(runner.recorded().iter().any(|e| matches!(
            e,
            Effect::Send(Signal::Chat { message }) if message == "hello everyone"
        )));
    }

    #[test]
    fn quit_while_in_group_leaves_first() {
        let (mut client, runner, mut rx) = new_client();
        client.handle_event(Event::UserLine("voice".to_string()));
        drain(&mut client, &mut rx);

        assert!(!client.handle_event(Event::UserLine("quit".to_string())));
        assert!(runner
            .recorded()
            .contains(&Effect::Send(Signal::LeftGroupVoice)));
    }

    #[test]
    fn talk_then_stop_round_trip() {
        let (mut client, runner, mut rx) = new_client();
        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Bob-1", "nickname": "Bob",
                "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        client.handle_event(Event::UserLine("a".to_string()));
        drain(&mut client, &mut rx);

        client.handle_event(Event::UserLine("t".to_string()));
        drain(&mut client, &mut rx);
        assert!(client.transmit().is_talking);

        client.handle_event(Event::UserLine("s".to_string()));
        drain(&mut client, &mut rx);
        assert!(!client.transmit().is_talking);

        let recorded = runner.recorded();
        assert!(recorded.iter().any(|e| matches!(
            e,
            Effect::Send(Signal::VoiceStatus { activity: VoiceActivity::Started, .. })
        )));
        assert!(recorded.iter().any(|e| matches!(
            e,
            Effect::Send(Signal::VoiceStatus { activity: VoiceActivity::Stopped, .. })
        )));
    }

    #[test]
    fn repeated_talk_before_capture_ready_starts_once() {
        let (mut client, runner, mut rx) = new_client();
        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Bob-1", "nickname": "Bob",
                "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        client.handle_event(Event::UserLine("a".to_string()));
        drain(&mut client, &mut rx);

        // Second press lands before CaptureStarted comes back.
        client.handle_event(Event::UserLine("t".to_string()));
        client.handle_event(Event::UserLine("t".to_string()));
        drain(&mut client, &mut rx);

        let recorded = runner.recorded();
        let starts = recorded
            .iter()
            .filter(|e| matches!(e, Effect::StartCapture { .. }))
            .count();
        assert_eq!(starts, 1);
        let announces = recorded
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Effect::Send(Signal::VoiceStatus { activity: VoiceActivity::Started, .. })
                )
            })
            .count();
        assert_eq!(announces, 1);
        assert!(client.transmit().is_talking);
    }

    #[test]
    fn video_advisory_sends_only_inside_a_call() {
        let (mut client, runner, mut rx) = new_client();
        client.handle_event(Event::UserLine("video".to_string()));
        assert!(!runner
            .recorded()
            .iter()
            .any(|e| matches!(e, Effect::Send(Signal::Video { .. }))));

        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Bob-1", "nickname": "Bob",
                "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        client.handle_event(Event::UserLine("a".to_string()));
        drain(&mut client, &mut rx);

        client.handle_event(Event::UserLine("video".to_string()));
        client.handle_event(Event::UserLine("video stop".to_string()));

        let recorded = runner.recorded();
        assert!(recorded.iter().any(|e| matches!(
            e,
            Effect::Send(Signal::Video { activity: VoiceActivity::Started, target }) if target == "Bob"
        )));
        assert!(recorded.iter().any(|e| matches!(
            e,
            Effect::Send(Signal::Video { activity: VoiceActivity::Stopped, target }) if target == "Bob"
        )));
    }

    #[test]
    fn mute_drops_frames_before_render() {
        let (mut client, runner, mut rx) = new_client();
        let env = envelope_from(
            r#"{"type": "callRequest", "from": "Bob-1", "nickname": "Bob",
                "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(env));
        client.handle_event(Event::UserLine("a".to_string()));
        drain(&mut client, &mut rx);
        client.handle_event(Event::UserLine("mute".to_string()));

        let frame = envelope_from(
            r#"{"type": "voiceData", "from": "Bob-1", "nickname": "Bob",
                "audio": "AAAA", "target": "Alice", "timestamp": 0}"#,
        );
        client.handle_event(Event::EnvelopeReceived(frame));

        assert!(!runner
            .recorded()
            .iter()
            .any(|e| matches!(e, Effect::RenderFrame { .. })));
    }
}
