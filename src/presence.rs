//! Peer directory maintained from relay roster snapshots.
//!
//! The relay is the single source of presence truth: every `peerList` or
//! `peerListUpdate` replaces the roster wholesale. No incremental join or
//! leave deltas exist on the wire.

use serde::{Deserialize, Serialize};

/// One entry in the relay's peer roster. All fields are optional on the
/// wire; older clients register with partial records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl PeerRecord {
    /// Human-readable name: nickname, else a short address prefix.
    pub fn display_name(&self) -> String {
        if let Some(nick) = self.nickname.as_deref() {
            if !nick.is_empty() {
                return nick.to_string();
            }
        }
        match self.address.as_deref() {
            Some(addr) => addr.chars().take(12).collect(),
            None => "Unknown".to_string(),
        }
    }

    pub fn supports_voice(&self) -> bool {
        self.capabilities.iter().any(|c| c == "voice")
    }
}

/// In-memory roster, always excluding the local client.
#[derive(Debug)]
pub struct Roster {
    local_nickname: String,
    peers: Vec<PeerRecord>,
}

impl Roster {
    pub fn new(local_nickname: &str) -> Self {
        Self {
            local_nickname: local_nickname.to_string(),
            peers: Vec::new(),
        }
    }

    /// Replace the roster with a fresh snapshot, dropping our own entry.
    pub fn replace(&mut self, peers: Vec<PeerRecord>) {
        let local = self.local_nickname.to_lowercase();
        self.peers = peers
            .into_iter()
            .filter(|p| {
                p.nickname
                    .as_deref()
                    .map(|n| n.to_lowercase() != local)
                    .unwrap_or(true)
            })
            .collect();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    /// Resolve a user-typed query to a peer. Exact case-insensitive
    /// nickname match wins; then nickname prefix, then address prefix.
    pub fn resolve(&self, query: &str) -> Option<&PeerRecord> {
        let q = query.to_lowercase();

        self.peers
            .iter()
            .find(|p| {
                p.nickname
                    .as_deref()
                    .map(|n| n.to_lowercase() == q)
                    .unwrap_or(false)
            })
            .or_else(|| {
                self.peers.iter().find(|p| {
                    p.nickname
                        .as_deref()
                        .map(|n| n.to_lowercase().starts_with(&q))
                        .unwrap_or(false)
                })
            })
            .or_else(|| {
                self.peers.iter().find(|p| {
                    p.address
                        .as_deref()
                        .map(|a| a.to_lowercase().starts_with(&q))
                        .unwrap_or(false)
                })
            })
    }
}

/// Whether an envelope's `target` field addresses the given nickname.
///
/// Matching is deliberately loose for compatibility with peers that
/// truncate nicknames: exact case-insensitive equality, or either string
/// being a prefix of the other. A target of "Al" therefore matches both
/// "Alice" and "Alfred"; callers on shared channels should prefer full
/// nicknames.
pub fn target_matches(target: &str, nickname: &str) -> bool {
    if target == nickname {
        return true;
    }
    let t = target.to_lowercase();
    let n = nickname.to_lowercase();
    t == n || n.starts_with(&t) || t.starts_with(&n)
}
