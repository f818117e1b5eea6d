//! Call state machine.
//!
//! `reduce` is a pure function from (state, transmit flags, event) to
//! (next state, effects). All side effects are values interpreted by an
//! [`EffectRunner`](crate::effects::EffectRunner); nothing here touches
//! sockets, audio devices, or timers. Timer races are settled with ids:
//! every dial attempt and ring loop carries a `Uuid`, and completions
//! bearing a stale id are ignored.

use std::collections::BTreeSet;

use log::debug;
use uuid::Uuid;

use crate::presence::PeerRecord;
use crate::signaling::{SignalingEnvelope, VoiceActivity};

/// One received voice frame, still compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub payload: Vec<u8>,
    pub sample_rate: u32,
}

/// Exclusive call workflow state. At most one of dial, ring, call, group
/// is active at any moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Outgoing call awaiting an answer. `attempt` guards the dial timer.
    Calling { partner: String, attempt: Uuid },
    /// Incoming call. `ring` guards the ring loop; `answering` is set once
    /// the user accepted and capture acquisition is in flight.
    Ringing {
        caller: String,
        ring: Uuid,
        answering: bool,
    },
    InCall { partner: String },
    InGroup { members: BTreeSet<String> },
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling { .. } => "calling",
            CallState::Ringing { .. } => "ringing",
            CallState::InCall { .. } => "in-call",
            CallState::InGroup { .. } => "group-voice",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }
}

/// Transmit-side flags, owned by the event loop and passed to `reduce`
/// read-only. `is_talking` tracks confirmed capture, not user intent;
/// `capture_pending` bridges the gap between requesting capture and its
/// `CaptureStarted` completion so a repeated start is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TransmitState {
    pub is_talking: bool,
    pub capture_pending: bool,
    pub is_muted: bool,
    pub audio_level: u8,
}

/// Everything the event loop can receive, from user commands, the relay
/// reader, and effect completions alike.
#[derive(Debug)]
pub enum Event {
    // User commands. Dial targets are already resolved to a nickname.
    Dial { target: String },
    Answer,
    Reject,
    HangUp,
    JoinGroup,
    LeaveGroup,
    StartTalking,
    StopTalking,

    // Inbound signaling, post-dispatch. Senders are display names and
    // loopback has already been filtered.
    CallRequested { caller: String },
    CallAccepted { from: String },
    CallRejected { from: String },
    CallBusy { from: String },
    CallEnded { from: String },
    VoiceFrame { sender: String, frame: EncodedFrame },
    VoiceActivityChanged { sender: String, activity: VoiceActivity },
    PeerJoinedGroup { name: String },
    PeerLeftGroup { name: String },

    // Effect completions.
    DialTimeout { attempt: Uuid },
    AnswerReady { caller: String },
    AnswerFailed { caller: String, reason: String },
    CaptureStarted,
    CaptureStopped,
    CaptureFailed { reason: String },
    TransportLost,

    // Handled at the loop edge, never passed to `reduce`.
    UserLine(String),
    Mute,
    Unmute,
    AudioLevel(u8),
    RosterReplaced(Vec<PeerRecord>),
    EnvelopeReceived(SignalingEnvelope),
    Message(String),
    Quit,
}

/// Outbound signaling messages a reduction can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    CallRequest { target: String },
    CallAccepted { target: String },
    CallRejected { target: String },
    CallBusy { target: String },
    CallEnded { target: String },
    VoiceStatus { activity: VoiceActivity, target: String },
    Video { activity: VoiceActivity, target: String },
    JoinedGroupVoice,
    LeftGroupVoice,
    Chat { message: String },
}

/// Side effects requested by `reduce`, interpreted by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(Signal),
    /// Arm the 30 s no-answer timer for a dial attempt.
    StartDialTimer { attempt: Uuid },
    /// Start the audible 2 s ring loop for an incoming call.
    StartRing { ring: Uuid, caller: String },
    StopRing { ring: Uuid },
    /// Validate microphone access before committing to an accepted call.
    /// Completes with `AnswerReady` or `AnswerFailed`.
    AcquireForAnswer { caller: String },
    /// Acquire the capture source and begin framing toward `target`.
    StartCapture { target: String },
    StopCapture,
    /// Decompress and queue a frame on the sender's playback sink.
    RenderFrame { sender: String, frame: EncodedFrame },
    /// Drop all per-sender playback sinks, releasing their devices.
    ClearPlayback,
    /// User-facing status line.
    Notify(String),
}

/// Current voice target for the local transmit path, derived from state.
pub fn transmit_target(state: &CallState) -> Option<String> {
    match state {
        CallState::InCall { partner } => Some(partner.clone()),
        CallState::InGroup { .. } => Some(crate::signaling::GROUP_TARGET.to_string()),
        _ => None,
    }
}

pub fn reduce(state: &CallState, tx: &TransmitState, event: Event) -> (CallState, Vec<Effect>) {
    match (state, event) {
        // ---- Outgoing calls ----------------------------------------------
        (CallState::Idle, Event::Dial { target }) => {
            let attempt = Uuid::new_v4();
            let effects = vec![
                Effect::Send(Signal::CallRequest {
                    target: target.clone(),
                }),
                Effect::StartDialTimer { attempt },
                Effect::Notify(format!("Calling {}... (30s timeout)", target)),
            ];
            (
                CallState::Calling {
                    partner: target,
                    attempt,
                },
                effects,
            )
        }
        (_, Event::Dial { .. }) => reject_command(state, "Finish the current call first"),

        (CallState::Calling { partner, .. }, Event::CallAccepted { from }) if from == *partner => (
            CallState::InCall {
                partner: partner.clone(),
            },
            vec![Effect::Notify(format!(
                "{} answered! Connected. Press t to talk.",
                from
            ))],
        ),

        (CallState::Calling { partner, .. }, Event::CallRejected { from }) if from == *partner => (
            CallState::Idle,
            vec![Effect::Notify(format!("{} declined the call", from))],
        ),

        (CallState::Calling { partner, .. }, Event::CallBusy { from }) if from == *partner => (
            CallState::Idle,
            vec![Effect::Notify(format!("{} is busy on another call", from))],
        ),

        (CallState::Calling { partner, attempt }, Event::DialTimeout { attempt: id })
            if id == *attempt =>
        {
            (
                CallState::Idle,
                vec![
                    Effect::Send(Signal::CallEnded {
                        target: partner.clone(),
                    }),
                    Effect::Notify(format!("No answer from {}", partner)),
                ],
            )
        }
        // A timeout from an abandoned attempt changes nothing.
        (_, Event::DialTimeout { attempt }) => {
            debug!("ignoring stale dial timeout {}", attempt);
            unchanged(state)
        }

        // Caller may abandon the attempt before it is answered.
        (CallState::Calling { partner, .. }, Event::HangUp) => (
            CallState::Idle,
            vec![
                Effect::Send(Signal::CallEnded {
                    target: partner.clone(),
                }),
                Effect::Notify("Call cancelled".to_string()),
            ],
        ),

        (CallState::Calling { partner, .. }, Event::CallEnded { from }) if from == *partner => (
            CallState::Idle,
            vec![Effect::Notify(format!("{} is unavailable", from))],
        ),

        // ---- Incoming calls ----------------------------------------------
        (CallState::Idle, Event::CallRequested { caller }) => {
            let ring = Uuid::new_v4();
            let effects = vec![Effect::StartRing {
                ring,
                caller: caller.clone(),
            }];
            (
                CallState::Ringing {
                    caller,
                    ring,
                    answering: false,
                },
                effects,
            )
        }
        // Busy on any established or pending call.
        (_, Event::CallRequested { caller }) => {
            debug!("busy: rejecting call from {} while {}", caller, state.label());
            (
                state.clone(),
                vec![Effect::Send(Signal::CallBusy { target: caller })],
            )
        }

        (
            CallState::Ringing {
                caller,
                ring,
                answering: false,
            },
            Event::Answer,
        ) => (
            CallState::Ringing {
                caller: caller.clone(),
                ring: *ring,
                answering: true,
            },
            vec![
                Effect::StopRing { ring: *ring },
                Effect::AcquireForAnswer {
                    caller: caller.clone(),
                },
            ],
        ),
        (CallState::Ringing { answering: true, .. }, Event::Answer) => unchanged(state),
        (_, Event::Answer) => reject_command(state, "No incoming call to answer"),

        (
            CallState::Ringing {
                caller, answering, ..
            },
            Event::AnswerReady { caller: who },
        ) if who == *caller && *answering => (
            CallState::InCall {
                partner: caller.clone(),
            },
            vec![
                Effect::Send(Signal::CallAccepted {
                    target: caller.clone(),
                }),
                Effect::Notify(format!("Connected with {}. Press t to talk.", caller)),
            ],
        ),

        (
            CallState::Ringing {
                caller, answering, ..
            },
            Event::AnswerFailed { caller: who, reason },
        ) if who == *caller && *answering => (
            CallState::Idle,
            vec![
                Effect::Send(Signal::CallRejected {
                    target: caller.clone(),
                }),
                Effect::Notify(format!("Cannot answer: {}", reason)),
            ],
        ),
        (_, Event::AnswerReady { caller }) | (_, Event::AnswerFailed { caller, .. }) => {
            debug!("ignoring stale answer completion for {}", caller);
            unchanged(state)
        }

        (
            CallState::Ringing {
                caller,
                ring,
                answering,
            },
            Event::Reject,
        ) => {
            let mut effects = Vec::new();
            if !answering {
                effects.push(Effect::StopRing { ring: *ring });
            }
            effects.push(Effect::Send(Signal::CallRejected {
                target: caller.clone(),
            }));
            effects.push(Effect::Notify(format!("Rejected call from {}", caller)));
            (CallState::Idle, effects)
        }
        (_, Event::Reject) => reject_command(state, "No incoming call to reject"),

        // Caller gave up while we were ringing (or mid-answer).
        (
            CallState::Ringing {
                caller,
                ring,
                answering,
            },
            Event::CallEnded { from },
        ) if from == *caller => {
            let mut effects = Vec::new();
            if !answering {
                effects.push(Effect::StopRing { ring: *ring });
            }
            effects.push(Effect::Notify(format!(
                "{} hung up before you answered",
                from
            )));
            (CallState::Idle, effects)
        }

        // ---- Established calls -------------------------------------------
        (CallState::InCall { partner }, Event::HangUp) => (
            CallState::Idle,
            vec![
                Effect::StopCapture,
                Effect::ClearPlayback,
                Effect::Send(Signal::CallEnded {
                    target: partner.clone(),
                }),
                Effect::Notify("Call ended".to_string()),
            ],
        ),

        (CallState::InCall { partner }, Event::CallEnded { from }) if from == *partner => (
            CallState::Idle,
            vec![
                Effect::StopCapture,
                Effect::ClearPlayback,
                Effect::Notify(format!("{} ended the call", from)),
            ],
        ),

        // Idle, Ringing, InGroup: hangup is not the right verb.
        (_, Event::HangUp) => reject_command(state, "Not in a call"),

        // ---- Group voice -------------------------------------------------
        (CallState::Idle, Event::JoinGroup) => (
            CallState::InGroup {
                members: BTreeSet::new(),
            },
            vec![
                Effect::Send(Signal::JoinedGroupVoice),
                Effect::Notify("Joined group voice. Press t to talk.".to_string()),
            ],
        ),
        (_, Event::JoinGroup) => reject_command(state, "Finish the current call first"),

        (CallState::InGroup { .. }, Event::LeaveGroup) => (
            CallState::Idle,
            vec![
                Effect::StopCapture,
                Effect::ClearPlayback,
                Effect::Send(Signal::LeftGroupVoice),
                Effect::Notify("Left group voice".to_string()),
            ],
        ),
        (_, Event::LeaveGroup) => reject_command(state, "Not in group voice"),

        (CallState::InGroup { members }, Event::PeerJoinedGroup { name }) => {
            let mut members = members.clone();
            let added = members.insert(name.clone());
            let effects = if added {
                vec![Effect::Notify(format!("{} joined group voice", name))]
            } else {
                Vec::new()
            };
            (CallState::InGroup { members }, effects)
        }
        (CallState::InGroup { members }, Event::PeerLeftGroup { name }) => {
            let mut members = members.clone();
            let removed = members.remove(&name);
            let effects = if removed {
                vec![Effect::Notify(format!("{} left group voice", name))]
            } else {
                Vec::new()
            };
            (CallState::InGroup { members }, effects)
        }
        (_, Event::PeerJoinedGroup { .. }) | (_, Event::PeerLeftGroup { .. }) => unchanged(state),

        // ---- Push-to-talk ------------------------------------------------
        (_, Event::StartTalking) => match transmit_target(state) {
            Some(target) if !tx.is_talking && !tx.capture_pending => (
                state.clone(),
                vec![
                    Effect::Send(Signal::VoiceStatus {
                        activity: VoiceActivity::Started,
                        target: target.clone(),
                    }),
                    Effect::StartCapture { target },
                ],
            ),
            Some(_) => (
                state.clone(),
                vec![Effect::Notify("Already talking".to_string())],
            ),
            None => reject_command(state, "Join a call first (call <user> or voice)"),
        },

        (_, Event::StopTalking) => match transmit_target(state) {
            Some(target) if tx.is_talking || tx.capture_pending => (
                state.clone(),
                vec![
                    Effect::Send(Signal::VoiceStatus {
                        activity: VoiceActivity::Stopped,
                        target,
                    }),
                    Effect::StopCapture,
                    Effect::Notify("Stopped talking".to_string()),
                ],
            ),
            Some(_) => (
                state.clone(),
                vec![Effect::Notify("Not currently talking".to_string())],
            ),
            None => unchanged(state),
        },

        (_, Event::CaptureFailed { reason }) => {
            let mut effects = vec![Effect::Notify(format!(
                "Microphone unavailable: {}",
                reason
            ))];
            if let Some(target) = transmit_target(state) {
                // Withdraw the advisory sent before acquisition started.
                effects.insert(
                    0,
                    Effect::Send(Signal::VoiceStatus {
                        activity: VoiceActivity::Stopped,
                        target,
                    }),
                );
            }
            (state.clone(), effects)
        }

        // ---- Inbound media -----------------------------------------------
        (state_now, Event::VoiceFrame { sender, frame }) => {
            let accepted = match state_now {
                CallState::InCall { partner } => sender == *partner,
                CallState::InGroup { .. } => true,
                _ => false,
            };
            // Muted frames are dropped before decompression.
            if accepted && !tx.is_muted {
                (
                    state_now.clone(),
                    vec![Effect::RenderFrame { sender, frame }],
                )
            } else {
                unchanged(state_now)
            }
        }

        (state_now, Event::VoiceActivityChanged { sender, activity }) => {
            let relevant = match state_now {
                CallState::InCall { partner } => sender == *partner,
                CallState::InGroup { .. } => true,
                _ => false,
            };
            if relevant {
                let line = match activity {
                    VoiceActivity::Started => format!("{} is talking...", sender),
                    VoiceActivity::Stopped => format!("{} stopped talking", sender),
                };
                (state_now.clone(), vec![Effect::Notify(line)])
            } else {
                unchanged(state_now)
            }
        }

        // ---- Transport ---------------------------------------------------
        (CallState::Idle, Event::TransportLost) => (
            CallState::Idle,
            vec![Effect::Notify("Disconnected from relay".to_string())],
        ),
        (state_now, Event::TransportLost) => {
            let mut effects = Vec::new();
            if let CallState::Ringing {
                ring, answering, ..
            } = state_now
            {
                if !answering {
                    effects.push(Effect::StopRing { ring: *ring });
                }
            }
            if tx.is_talking
                || matches!(state_now, CallState::InCall { .. } | CallState::InGroup { .. })
            {
                effects.push(Effect::StopCapture);
            }
            effects.push(Effect::ClearPlayback);
            effects.push(Effect::Notify(
                "Disconnected from relay; call ended".to_string(),
            ));
            (CallState::Idle, effects)
        }

        // Signaling from non-partners, or anything else out of place.
        (_, event) => {
            debug!("ignoring {:?} while {}", event, state.label());
            unchanged(state)
        }
    }
}

fn unchanged(state: &CallState) -> (CallState, Vec<Effect>) {
    (state.clone(), Vec::new())
}

fn reject_command(state: &CallState, reason: &str) -> (CallState, Vec<Effect>) {
    (state.clone(), vec![Effect::Notify(reason.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_tx() -> TransmitState {
        TransmitState::default()
    }

    fn talking_tx() -> TransmitState {
        TransmitState {
            is_talking: true,
            ..TransmitState::default()
        }
    }

    fn frame() -> EncodedFrame {
        EncodedFrame {
            payload: vec![1, 2, 3],
            sample_rate: 16_000,
        }
    }

    #[test]
    fn dial_from_idle_sends_request_and_arms_timer() {
        let (next, effects) = reduce(
            &CallState::Idle,
            &idle_tx(),
            Event::Dial {
                target: "Bob".to_string(),
            },
        );

        let attempt = match next {
            CallState::Calling {
                ref partner,
                attempt,
            } => {
                assert_eq!(partner, "Bob");
                attempt
            }
            other => panic!("expected Calling, got {:?}", other),
        };
        assert!(effects.contains(&Effect::Send(Signal::CallRequest {
            target: "Bob".to_string()
        })));
        assert!(effects.contains(&Effect::StartDialTimer { attempt }));
    }

    #[test]
    fn dial_timeout_with_live_id_returns_to_idle() {
        let attempt = Uuid::new_v4();
        let state = CallState::Calling {
            partner: "Bob".to_string(),
            attempt,
        };

        let (next, effects) = reduce(&state, &idle_tx(), Event::DialTimeout { attempt });
        assert!(next.is_idle());
        assert!(effects.contains(&Effect::Send(Signal::CallEnded {
            target: "Bob".to_string()
        })));
    }

    #[test]
    fn stale_dial_timeout_is_ignored() {
        let state = CallState::Calling {
            partner: "Bob".to_string(),
            attempt: Uuid::new_v4(),
        };

        let (next, effects) = reduce(
            &state,
            &idle_tx(),
            Event::DialTimeout {
                attempt: Uuid::new_v4(),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn accept_transitions_calling_to_in_call() {
        let state = CallState::Calling {
            partner: "Bob".to_string(),
            attempt: Uuid::new_v4(),
        };

        let (next, _) = reduce(
            &state,
            &idle_tx(),
            Event::CallAccepted {
                from: "Bob".to_string(),
            },
        );
        assert!(matches!(next, CallState::InCall { ref partner } if partner == "Bob"));
    }

    #[test]
    fn accept_from_wrong_sender_is_ignored() {
        let state = CallState::Calling {
            partner: "Bob".to_string(),
            attempt: Uuid::new_v4(),
        };

        let (next, effects) = reduce(
            &state,
            &idle_tx(),
            Event::CallAccepted {
                from: "Mallory".to_string(),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn incoming_request_while_idle_starts_ringing() {
        let (next, effects) = reduce(
            &CallState::Idle,
            &idle_tx(),
            Event::CallRequested {
                caller: "Bob".to_string(),
            },
        );

        match next {
            CallState::Ringing {
                ref caller,
                ring,
                answering,
            } => {
                assert_eq!(caller, "Bob");
                assert!(!answering);
                assert!(effects.contains(&Effect::StartRing {
                    ring,
                    caller: "Bob".to_string()
                }));
            }
            other => panic!("expected Ringing, got {:?}", other),
        }
    }

    #[test]
    fn busy_reply_from_every_non_idle_state() {
        let non_idle = [
            CallState::Calling {
                partner: "Bob".to_string(),
                attempt: Uuid::new_v4(),
            },
            CallState::Ringing {
                caller: "Bob".to_string(),
                ring: Uuid::new_v4(),
                answering: false,
            },
            CallState::InCall {
                partner: "Bob".to_string(),
            },
            CallState::InGroup {
                members: BTreeSet::new(),
            },
        ];

        for state in non_idle {
            let (next, effects) = reduce(
                &state,
                &idle_tx(),
                Event::CallRequested {
                    caller: "Carol".to_string(),
                },
            );
            assert_eq!(next, state, "state changed for {:?}", state);
            assert_eq!(
                effects,
                vec![Effect::Send(Signal::CallBusy {
                    target: "Carol".to_string()
                })],
            );
        }
    }

    #[test]
    fn answer_stops_ring_and_acquires_capture() {
        let ring = Uuid::new_v4();
        let state = CallState::Ringing {
            caller: "Bob".to_string(),
            ring,
            answering: false,
        };

        let (next, effects) = reduce(&state, &idle_tx(), Event::Answer);
        assert!(matches!(next, CallState::Ringing { answering: true, .. }));
        assert_eq!(effects[0], Effect::StopRing { ring });
        assert_eq!(
            effects[1],
            Effect::AcquireForAnswer {
                caller: "Bob".to_string()
            }
        );
    }

    #[test]
    fn answer_ready_connects_and_sends_accept() {
        let state = CallState::Ringing {
            caller: "Bob".to_string(),
            ring: Uuid::new_v4(),
            answering: true,
        };

        let (next, effects) = reduce(
            &state,
            &idle_tx(),
            Event::AnswerReady {
                caller: "Bob".to_string(),
            },
        );
        assert!(matches!(next, CallState::InCall { ref partner } if partner == "Bob"));
        assert!(effects.contains(&Effect::Send(Signal::CallAccepted {
            target: "Bob".to_string()
        })));
    }

    #[test]
    fn answer_failure_falls_back_to_reject() {
        let state = CallState::Ringing {
            caller: "Bob".to_string(),
            ring: Uuid::new_v4(),
            answering: true,
        };

        let (next, effects) = reduce(
            &state,
            &idle_tx(),
            Event::AnswerFailed {
                caller: "Bob".to_string(),
                reason: "no input device".to_string(),
            },
        );
        assert!(next.is_idle());
        assert!(effects.contains(&Effect::Send(Signal::CallRejected {
            target: "Bob".to_string()
        })));
        // Ring was already stopped when the answer started.
        assert!(!effects.iter().any(|e| matches!(e, Effect::StopRing { .. })));
    }

    #[test]
    fn reject_stops_ring_and_notifies_caller() {
        let ring = Uuid::new_v4();
        let state = CallState::Ringing {
            caller: "Bob".to_string(),
            ring,
            answering: false,
        };

        let (next, effects) = reduce(&state, &idle_tx(), Event::Reject);
        assert!(next.is_idle());
        assert!(effects.contains(&Effect::StopRing { ring }));
        assert!(effects.contains(&Effect::Send(Signal::CallRejected {
            target: "Bob".to_string()
        })));
    }

    #[test]
    fn caller_hangup_while_ringing_stops_ring() {
        let ring = Uuid::new_v4();
        let state = CallState::Ringing {
            caller: "Bob".to_string(),
            ring,
            answering: false,
        };

        let (next, effects) = reduce(
            &state,
            &idle_tx(),
            Event::CallEnded {
                from: "Bob".to_string(),
            },
        );
        assert!(next.is_idle());
        assert!(effects.contains(&Effect::StopRing { ring }));
    }

    #[test]
    fn hangup_in_call_stops_capture_before_sending_ended() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };

        let (next, effects) = reduce(&state, &talking_tx(), Event::HangUp);
        assert!(next.is_idle());
        assert_eq!(effects[0], Effect::StopCapture);
        assert_eq!(effects[1], Effect::ClearPlayback);
        assert_eq!(
            effects[2],
            Effect::Send(Signal::CallEnded {
                target: "Bob".to_string()
            })
        );
    }

    #[test]
    fn hangup_outside_a_call_prints_a_local_message() {
        let states = [
            CallState::Idle,
            CallState::Ringing {
                caller: "Bob".to_string(),
                ring: Uuid::new_v4(),
                answering: false,
            },
            CallState::InGroup {
                members: BTreeSet::new(),
            },
        ];

        for state in states {
            let (next, effects) = reduce(&state, &idle_tx(), Event::HangUp);
            assert_eq!(next, state, "state changed for {:?}", state);
            assert!(
                matches!(effects.as_slice(), [Effect::Notify(_)]),
                "expected a single local message for {:?}, got {:?}",
                state,
                effects
            );
        }
    }

    #[test]
    fn every_call_teardown_releases_playback_sinks() {
        let in_call = CallState::InCall {
            partner: "Bob".to_string(),
        };
        let in_group = CallState::InGroup {
            members: BTreeSet::new(),
        };

        let teardowns = [
            reduce(&in_call, &idle_tx(), Event::HangUp),
            reduce(
                &in_call,
                &idle_tx(),
                Event::CallEnded {
                    from: "Bob".to_string(),
                },
            ),
            reduce(&in_group, &idle_tx(), Event::LeaveGroup),
            reduce(&in_call, &idle_tx(), Event::TransportLost),
        ];

        for (next, effects) in teardowns {
            assert!(next.is_idle());
            assert!(
                effects.contains(&Effect::ClearPlayback),
                "missing ClearPlayback in {:?}",
                effects
            );
        }
    }

    #[test]
    fn start_talking_sends_status_before_capture() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };

        let (_, effects) = reduce(&state, &idle_tx(), Event::StartTalking);
        assert_eq!(
            effects[0],
            Effect::Send(Signal::VoiceStatus {
                activity: VoiceActivity::Started,
                target: "Bob".to_string()
            })
        );
        assert_eq!(
            effects[1],
            Effect::StartCapture {
                target: "Bob".to_string()
            }
        );
    }

    #[test]
    fn start_talking_while_idle_acquires_nothing() {
        let (next, effects) = reduce(&CallState::Idle, &idle_tx(), Event::StartTalking);
        assert!(next.is_idle());
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn group_talk_targets_group() {
        let state = CallState::InGroup {
            members: BTreeSet::new(),
        };

        let (_, effects) = reduce(&state, &idle_tx(), Event::StartTalking);
        assert!(effects.contains(&Effect::StartCapture {
            target: "group".to_string()
        }));
    }

    #[test]
    fn start_talking_while_acquisition_pending_is_a_noop() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };
        let pending = TransmitState {
            capture_pending: true,
            ..TransmitState::default()
        };

        let (next, effects) = reduce(&state, &pending, Event::StartTalking);
        assert_eq!(next, state);
        assert!(
            matches!(effects.as_slice(), [Effect::Notify(_)]),
            "expected a warning only, got {:?}",
            effects
        );
    }

    #[test]
    fn stop_talking_while_acquisition_pending_still_stops_capture() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };
        let pending = TransmitState {
            capture_pending: true,
            ..TransmitState::default()
        };

        let (_, effects) = reduce(&state, &pending, Event::StopTalking);
        assert!(effects.contains(&Effect::StopCapture));
    }

    #[test]
    fn stop_talking_sends_status_and_stops_capture() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };

        let (_, effects) = reduce(&state, &talking_tx(), Event::StopTalking);
        assert_eq!(
            effects[0],
            Effect::Send(Signal::VoiceStatus {
                activity: VoiceActivity::Stopped,
                target: "Bob".to_string()
            })
        );
        assert!(effects.contains(&Effect::StopCapture));
    }

    #[test]
    fn voice_frame_from_partner_is_rendered() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };

        let (_, effects) = reduce(
            &state,
            &idle_tx(),
            Event::VoiceFrame {
                sender: "Bob".to_string(),
                frame: frame(),
            },
        );
        assert!(matches!(effects.as_slice(), [Effect::RenderFrame { .. }]));
    }

    #[test]
    fn voice_frame_from_third_party_is_dropped_in_call() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };

        let (_, effects) = reduce(
            &state,
            &idle_tx(),
            Event::VoiceFrame {
                sender: "Carol".to_string(),
                frame: frame(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn voice_frame_while_muted_is_never_rendered() {
        let state = CallState::InGroup {
            members: BTreeSet::new(),
        };
        let muted = TransmitState {
            is_muted: true,
            ..TransmitState::default()
        };

        let (_, effects) = reduce(
            &state,
            &muted,
            Event::VoiceFrame {
                sender: "Bob".to_string(),
                frame: frame(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn group_accepts_frames_from_any_sender() {
        let state = CallState::InGroup {
            members: BTreeSet::new(),
        };

        for sender in ["Bob", "Carol", "Dave"] {
            let (_, effects) = reduce(
                &state,
                &idle_tx(),
                Event::VoiceFrame {
                    sender: sender.to_string(),
                    frame: frame(),
                },
            );
            assert_eq!(effects.len(), 1, "frame from {} dropped", sender);
        }
    }

    #[test]
    fn group_membership_tracks_joins_and_leaves() {
        let state = CallState::InGroup {
            members: BTreeSet::new(),
        };

        let (state, _) = reduce(
            &state,
            &idle_tx(),
            Event::PeerJoinedGroup {
                name: "Bob".to_string(),
            },
        );
        let (state, dup_effects) = reduce(
            &state,
            &idle_tx(),
            Event::PeerJoinedGroup {
                name: "Bob".to_string(),
            },
        );
        assert!(dup_effects.is_empty());

        let (state, _) = reduce(
            &state,
            &idle_tx(),
            Event::PeerLeftGroup {
                name: "Bob".to_string(),
            },
        );
        assert!(matches!(state, CallState::InGroup { ref members } if members.is_empty()));
    }

    #[test]
    fn transport_loss_in_call_stops_capture_and_idles() {
        let state = CallState::InCall {
            partner: "Bob".to_string(),
        };

        let (next, effects) = reduce(&state, &talking_tx(), Event::TransportLost);
        assert!(next.is_idle());
        assert!(effects.contains(&Effect::StopCapture));
        // No callEnded over a transport that is already gone.
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::Send(Signal::CallEnded { .. }))));
    }

    #[test]
    fn transport_loss_while_ringing_stops_ring() {
        let ring = Uuid::new_v4();
        let state = CallState::Ringing {
            caller: "Bob".to_string(),
            ring,
            answering: false,
        };

        let (next, effects) = reduce(&state, &idle_tx(), Event::TransportLost);
        assert!(next.is_idle());
        assert!(effects.contains(&Effect::StopRing { ring }));
    }
}
