//! Peer registry - known peers ordered by start time
//!
//! Not synchronized on its own: the coordinator mutates it under the same
//! lock that guards its lifecycle flags. Times are epoch milliseconds and
//! are passed in, so eviction is testable without waiting.

use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

/// A peer is presumed gone after this much silence
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

// ─────────────────────────────────────────────────────────────────
// Peer Record
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub server_id: String,

    /// When the peer started, as it reported it
    pub start_time: i64,

    /// When we last heard from it
    pub last_contact: i64,
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
    /// Server ids, oldest start time first
    by_age: Vec<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer unless it is already known. Returns true if added.
    pub fn add(&mut self, server_id: &str, start_time: i64, now: i64) -> bool {
        if self.peers.contains_key(server_id) {
            return false;
        }
        self.peers.insert(
            server_id.to_string(),
            PeerRecord {
                server_id: server_id.to_string(),
                start_time,
                last_contact: now,
            },
        );
        self.by_age.push(server_id.to_string());
        self.resort();
        true
    }

    pub fn remove(&mut self, server_id: &str) -> Option<PeerRecord> {
        let removed = self.peers.remove(server_id)?;
        self.by_age.retain(|id| id != server_id);
        Some(removed)
    }

    /// Record contact with a known peer. Unknown peers are not created.
    pub fn touch(&mut self, server_id: &str, now: i64) -> bool {
        match self.peers.get_mut(server_id) {
            Some(peer) => {
                peer.last_contact = now;
                true
            }
            None => false,
        }
    }

    pub fn has(&self, server_id: &str) -> bool {
        self.peers.contains_key(server_id)
    }

    pub fn get(&self, server_id: &str) -> Option<&PeerRecord> {
        self.peers.get(server_id)
    }

    pub fn oldest(&self) -> Option<&PeerRecord> {
        self.by_age.first().and_then(|id| self.peers.get(id))
    }

    pub fn newest(&self) -> Option<&PeerRecord> {
        self.by_age.last().and_then(|id| self.peers.get(id))
    }

    /// Ordered copy, oldest start time first
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.by_age
            .iter()
            .filter_map(|id| self.peers.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Evict peers silent for longer than `PEER_TIMEOUT`.
    /// Returns the evicted records.
    pub fn sweep(&mut self, now: i64) -> Vec<PeerRecord> {
        let limit = PEER_TIMEOUT.as_millis() as i64;
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| now - p.last_contact > limit)
            .map(|p| p.server_id.clone())
            .collect();

        stale.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Log the peer list, one line per peer
    pub fn log_peers(&self, local_id: &str, now: i64) {
        info!(server_id = local_id, count = self.len(), "Known peers");
        for peer in self.snapshot() {
            info!(
                server_id = local_id,
                peer = %peer.server_id,
                up_secs = (now - peer.start_time) / 1000,
                silent_ms = now - peer.last_contact,
                "  peer"
            );
        }
    }

    fn resort(&mut self) {
        let peers = &self.peers;
        self.by_age.sort_by(|a, b| {
            let ta = peers.get(a).map(|p| p.start_time).unwrap_or(i64::MAX);
            let tb = peers.get(b).map(|p| p.start_time).unwrap_or(i64::MAX);
            ta.cmp(&tb).then_with(|| a.cmp(b))
        });
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
