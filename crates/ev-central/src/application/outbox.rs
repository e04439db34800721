//! Notifications collected under the coordinator lock and sent after it.
//!
//! Coordinator operations never perform I/O while holding their lock.  They
//! push every message they want to send into an [`Outbox`], release the lock,
//! and then call [`Outbox::deliver`].
//!
//! Delivery runs concurrently across channels (one slow driver does not hold
//! up the others) but strictly in push order within a channel, so a driver
//! always sees `supply_status PENDING` before the `cp_state` that follows it.
//!
//! A message addressed to an identity with no registered channel is dropped
//! silently at push time.  That is the single place where the "missing peer
//! is a no-op" rule lives.

use futures_util::future::join_all;
use tracing::{debug, warn};

use ev_core::protocol::{CentralMessage, PeerRole};

use crate::application::channels::{ChannelId, ChannelRegistry, SharedChannel};

#[derive(Default)]
pub struct Outbox {
    deliveries: Vec<(SharedChannel, CentralMessage)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel: SharedChannel, message: CentralMessage) {
        self.deliveries.push((channel, message));
    }

    /// Queues `message` for the peer registered as `id`, if any.
    pub fn to_peer(&mut self, registry: &ChannelRegistry, role: PeerRole, id: &str, message: CentralMessage) {
        match registry.get(role, id) {
            Some(channel) => self.push(channel, message),
            None => debug!("{role} {id} has no channel; dropping {}", message.kind()),
        }
    }

    /// Queues `message` for every connected driver.
    pub fn to_drivers(&mut self, registry: &ChannelRegistry, message: CentralMessage) {
        for channel in registry.drivers() {
            self.push(channel.clone(), message.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Sends everything.  Failures are logged per message and never
    /// returned: the failing connection's own read loop notices the broken
    /// socket and runs the disconnect path.
    pub async fn deliver(self) {
        if self.deliveries.is_empty() {
            return;
        }

        let mut queues: Vec<(ChannelId, SharedChannel, Vec<CentralMessage>)> = Vec::new();
        for (channel, message) in self.deliveries {
            let id = channel.id();
            match queues.iter_mut().find(|(qid, _, _)| *qid == id) {
                Some((_, _, messages)) => messages.push(message),
                None => queues.push((id, channel, vec![message])),
            }
        }

        join_all(queues.into_iter().map(|(id, channel, messages)| async move {
            for message in messages {
                if let Err(e) = channel.send(&message).await {
                    warn!("{id}: {} not delivered: {e}", message.kind());
                }
            }
        }))
        .await;
    }
}
