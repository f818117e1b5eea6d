//! Peer-to-peer voice calls over a dumb websocket relay.
//!
//! The relay only fans broadcasts out to a channel; every call semantic
//! (dial/answer/reject, busy handling, push-to-talk, group voice) lives
//! client-side in a pure state machine. See [`state_machine::reduce`]
//! for the transition table and [`client::CallClient`] for the single
//! event loop that owns all mutable state.

pub mod audio;
pub mod client;
pub mod commands;
pub mod config;
pub mod effects;
pub mod presence;
pub mod relay;
pub mod signaling;
pub mod state_machine;
