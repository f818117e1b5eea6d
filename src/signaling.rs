//! Relay wire protocol types
//!
//! Two layers of JSON messages travel over the websocket:
//!
//! 1. Relay frames (`register`, `getPeers`, `broadcast`, ...) understood by
//!    the relay itself.
//! 2. Signaling envelopes (`callRequest`, `voiceData`, ...) carried opaquely
//!    inside `broadcast` frames. The relay fans every broadcast out to all
//!    registered peers, including the sender, so receivers must self-filter.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::presence::PeerRecord;

/// Wire format for transmitted voice: PCM16 mono, 100 ms frames.
pub const WIRE_SAMPLE_RATE: u32 = 16_000;
pub const WIRE_CHANNELS: u16 = 1;
pub const CHUNK_DURATION_MS: u32 = 100;

/// Reserved target for group voice; everything else is a peer nickname.
pub const GROUP_TARGET: &str = "group";

/// Stable node identity supplied by the identity provider at startup.
/// This subsystem never generates or persists identity material itself.
#[derive(Debug, Clone)]
pub struct Identity {
    pub node_id: String,
    pub nickname: String,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Relay frames
// ============================================================================

/// Frames sent from client to relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "register")]
    Register {
        address: String,
        nickname: String,
        channel: String,
        mode: String,
        capabilities: Vec<String>,
    },

    #[serde(rename = "getPeers")]
    GetPeers,

    /// Fan-out payload. The relay rebroadcasts it verbatim to every
    /// registered client with no validation or per-target routing.
    #[serde(rename = "broadcast")]
    Broadcast { payload: SignalingEnvelope },

    #[serde(rename = "ping")]
    Ping,
}

/// Frames received from the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "welcome")]
    Welcome,

    #[serde(rename = "registered")]
    Registered,

    #[serde(rename = "peerList")]
    PeerList {
        #[serde(default)]
        peers: Vec<PeerRecord>,
    },

    #[serde(rename = "peerListUpdate")]
    PeerListUpdate {
        #[serde(default)]
        peers: Vec<PeerRecord>,
    },

    #[serde(rename = "broadcast")]
    Broadcast { payload: SignalingEnvelope },

    /// Some relay builds deliver directed payloads under this name; the
    /// content is identical to `broadcast`.
    #[serde(rename = "nodeMessage")]
    NodeMessage { payload: SignalingEnvelope },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    /// Catch-all so unrecognized frame types never fail deserialization.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Signaling envelopes
// ============================================================================

/// Talking advisory carried by `voiceStatus` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceActivity {
    Started,
    Stopped,
}

/// Media transport selection for the video signaling path. Only relay
/// fan-out is implemented; `Direct` is the negotiation contract for a
/// future peer-to-peer path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Broadcast,
    Direct,
}

/// A typed signaling message exchanged through the relay. Immutable once
/// sent; there is no acknowledgement or retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingEnvelope {
    #[serde(rename = "callRequest")]
    CallRequest {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        target: String,
        timestamp: i64,
    },

    #[serde(rename = "callAccepted")]
    CallAccepted {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        target: String,
        timestamp: i64,
    },

    #[serde(rename = "callRejected")]
    CallRejected {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        target: String,
        timestamp: i64,
    },

    #[serde(rename = "callBusy")]
    CallBusy {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        target: String,
        timestamp: i64,
    },

    #[serde(rename = "callEnded")]
    CallEnded {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        target: String,
        timestamp: i64,
    },

    #[serde(rename = "voiceStatus")]
    VoiceStatus {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        status: VoiceActivity,
        #[serde(default)]
        target: Option<String>,
        timestamp: i64,
    },

    #[serde(rename = "voiceData")]
    VoiceData {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        /// Base64 of the zlib-compressed PCM16 frame.
        audio: String,
        #[serde(rename = "sampleRate", default = "default_sample_rate")]
        sample_rate: u32,
        target: String,
        #[serde(default)]
        compression: Option<String>,
        timestamp: i64,
    },

    #[serde(rename = "joinedGroupVoice")]
    JoinedGroupVoice {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        timestamp: i64,
    },

    #[serde(rename = "leftGroupVoice")]
    LeftGroupVoice {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        timestamp: i64,
    },

    #[serde(rename = "videoStatus")]
    VideoStatus {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        status: VoiceActivity,
        #[serde(default)]
        mode: TransportMode,
        #[serde(default)]
        target: Option<String>,
        timestamp: i64,
    },

    #[serde(rename = "chatMessage")]
    ChatMessage {
        from: String,
        #[serde(default)]
        nickname: Option<String>,
        message: String,
        timestamp: i64,
    },

    /// Unrecognized payload types are dropped by the dispatcher instead of
    /// failing deserialization.
    #[serde(other)]
    Unknown,
}

fn default_sample_rate() -> u32 {
    WIRE_SAMPLE_RATE
}

impl SignalingEnvelope {
    pub fn call_request(id: &Identity, target: &str) -> Self {
        Self::CallRequest {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            target: target.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn call_accepted(id: &Identity, target: &str) -> Self {
        Self::CallAccepted {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            target: target.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn call_rejected(id: &Identity, target: &str) -> Self {
        Self::CallRejected {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            target: target.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn call_busy(id: &Identity, target: &str) -> Self {
        Self::CallBusy {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            target: target.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn call_ended(id: &Identity, target: &str) -> Self {
        Self::CallEnded {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            target: target.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn voice_status(id: &Identity, status: VoiceActivity, target: &str) -> Self {
        Self::VoiceStatus {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            status,
            target: Some(target.to_string()),
            timestamp: now_millis(),
        }
    }

    /// Build a `voiceData` envelope from an already-compressed frame.
    pub fn voice_data(
        id: &Identity,
        compressed: &[u8],
        sample_rate: u32,
        target: &str,
        compression: String,
    ) -> Self {
        Self::VoiceData {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            audio: STANDARD.encode(compressed),
            sample_rate,
            target: target.to_string(),
            compression: Some(compression),
            timestamp: now_millis(),
        }
    }

    pub fn joined_group_voice(id: &Identity) -> Self {
        Self::JoinedGroupVoice {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            timestamp: now_millis(),
        }
    }

    pub fn left_group_voice(id: &Identity) -> Self {
        Self::LeftGroupVoice {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            timestamp: now_millis(),
        }
    }

    pub fn chat_message(id: &Identity, message: &str) -> Self {
        Self::ChatMessage {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            message: message.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn video_status(id: &Identity, status: VoiceActivity, target: &str) -> Self {
        Self::VideoStatus {
            from: id.node_id.clone(),
            nickname: Some(id.nickname.clone()),
            status,
            mode: TransportMode::Broadcast,
            target: Some(target.to_string()),
            timestamp: now_millis(),
        }
    }

    /// Declared sender nickname, if any.
    pub fn nickname(&self) -> Option<&str> {
        match self {
            Self::CallRequest { nickname, .. }
            | Self::CallAccepted { nickname, .. }
            | Self::CallRejected { nickname, .. }
            | Self::CallBusy { nickname, .. }
            | Self::CallEnded { nickname, .. }
            | Self::VoiceStatus { nickname, .. }
            | Self::VoiceData { nickname, .. }
            | Self::JoinedGroupVoice { nickname, .. }
            | Self::LeftGroupVoice { nickname, .. }
            | Self::VideoStatus { nickname, .. }
            | Self::ChatMessage { nickname, .. } => nickname.as_deref(),
            Self::Unknown => None,
        }
    }

    /// Sender node id (`from`), if present.
    pub fn from_id(&self) -> Option<&str> {
        match self {
            Self::CallRequest { from, .. }
            | Self::CallAccepted { from, .. }
            | Self::CallRejected { from, .. }
            | Self::CallBusy { from, .. }
            | Self::CallEnded { from, .. }
            | Self::VoiceStatus { from, .. }
            | Self::VoiceData { from, .. }
            | Self::JoinedGroupVoice { from, .. }
            | Self::LeftGroupVoice { from, .. }
            | Self::VideoStatus { from, .. }
            | Self::ChatMessage { from, .. } => Some(from),
            Self::Unknown => None,
        }
    }

    /// Display name for the sender: declared nickname, falling back to a
    /// short prefix of the node id.
    pub fn display_name(&self) -> String {
        if let Some(nick) = self.nickname() {
            if !nick.is_empty() {
                return nick.to_string();
            }
        }
        match self.from_id() {
            Some(from) => from.chars().take(12).collect(),
            None => "Unknown".to_string(),
        }
    }
}
