//! Outbound channels and the registry mapping peer identities to them.
//!
//! Every connected peer owns exactly one outbound channel.  The coordinator
//! never writes to sockets directly; it hands [`CentralMessage`]s to the
//! channel registered for the recipient, and the channel implementation
//! decides how they reach the wire (a JSON line, a framed reply, or an
//! in-memory list in tests).
//!
//! # Send serialization
//!
//! Implementations must serialize their own sends so that a broadcast and a
//! direct reply can never interleave bytes on one connection.  This is a
//! per-channel lock, independent of the coordinator lock.
//!
//! # Last writer wins
//!
//! A new connection for an identity replaces the previous registration.  The
//! older socket is not closed by the registry; when it eventually closes, its
//! [`ChannelId`] no longer matches and its disconnect is ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ev_core::protocol::{CentralMessage, PeerRole};
use thiserror::Error;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one outbound channel (one connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for coordinator-originated messages.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Delivers one message.  Concurrent calls on the same channel are
    /// serialized by the implementation.
    async fn send(&self, message: &CentralMessage) -> Result<(), ChannelError>;
}

pub type SharedChannel = Arc<dyn OutboundChannel>;

// ── Registry ──────────────────────────────────────────────────────────────────

/// Current outbound channel per charging point and per driver.
///
/// CP ids and driver ids live in separate namespaces, so a driver called
/// `"ALC1"` never shadows the charging point `"ALC1"`.
#[derive(Default)]
pub struct ChannelRegistry {
    charging_points: HashMap<String, SharedChannel>,
    drivers: HashMap<String, SharedChannel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, role: PeerRole) -> &HashMap<String, SharedChannel> {
        match role {
            PeerRole::ChargingPoint => &self.charging_points,
            PeerRole::Driver => &self.drivers,
        }
    }

    fn map_mut(&mut self, role: PeerRole) -> &mut HashMap<String, SharedChannel> {
        match role {
            PeerRole::ChargingPoint => &mut self.charging_points,
            PeerRole::Driver => &mut self.drivers,
        }
    }

    /// Registers `channel` for `id`, returning the channel it replaced.
    pub fn register(&mut self, role: PeerRole, id: &str, channel: SharedChannel) -> Option<SharedChannel> {
        self.map_mut(role).insert(id.to_string(), channel)
    }

    pub fn get(&self, role: PeerRole, id: &str) -> Option<SharedChannel> {
        self.map(role).get(id).cloned()
    }

    pub fn is_connected(&self, role: PeerRole, id: &str) -> bool {
        self.map(role).contains_key(id)
    }

    /// Removes the registration for `id` only if it still belongs to
    /// `channel`.  Returns `false` when a newer connection has taken over.
    pub fn unregister_if_current(&mut self, role: PeerRole, id: &str, channel: ChannelId) -> bool {
        let map = self.map_mut(role);
        match map.get(id) {
            Some(current) if current.id() == channel => {
                map.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Channels of every connected driver.
    pub fn drivers(&self) -> impl Iterator<Item = &SharedChannel> {
        self.drivers.values()
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }
}

// ── In-memory channel ─────────────────────────────────────────────────────────

/// Channel that records every message it is asked to send.
///
/// Used by tests and by diagnostics that want to observe the coordinator
/// without a socket.  [`MemoryChannel::set_failing`] makes every send fail,
/// which simulates a peer whose socket has gone away.
pub struct MemoryChannel {
    id: ChannelId,
    messages: Mutex<Vec<CentralMessage>>,
    failing: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            messages: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    /// Copy of everything sent so far, oldest first.
    pub fn messages(&self) -> Vec<CentralMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Drains and returns everything sent so far.
    pub fn take(&self) -> Vec<CentralMessage> {
        self.messages
            .lock()
            .map(|mut m| std::mem::take(&mut *m))
            .unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl OutboundChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn send(&self, message: &CentralMessage) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ChannelError::Closed);
        }
        let mut messages = self.messages.lock().map_err(|_| ChannelError::Closed)?;
        messages.push(message.clone());
        Ok(())
    }
}
