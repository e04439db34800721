//! Framed text transport: `OP#field#field` commands in checksummed frames.
//!
//! # Exchange rules (for beginners)
//!
//! Every frame, in either direction, is answered with exactly one byte:
//! ACK when it decoded and its checksum matched, NACK otherwise.  A NACK
//! only says "that frame was damaged"; it is never a business answer.
//!
//! ```text
//! monitor ──► STX AUTH#ALC1 ETX lrc        ◄── ACK
//! driver  ──► STX REQ#D1#ALC1 ETX lrc      ◄── ACK
//! driver  ◄── STX AUTH_GRANTED#ALC1#D1 ETX lrc   ──► ACK
//! ```
//!
//! The first valid frame decides who the peer is: `AUTH`/`FAULT` come from
//! a charging point's health monitor, `REQ`/`FINISH` from a driver.  Later
//! frames must carry the same identity or they are ignored.
//!
//! Coordinator notifications reach the connection task through an
//! unbounded queue; only supply decisions have a framed form, everything
//! else is dropped.  When a newer connection takes over the identity the
//! queue closes, but the older socket stays open and its frames are still
//! confirmed and applied until the peer hangs up or goes idle.  Outbound frames are sent between inbound reads, so a
//! peer that sends while we wait for its ACK sees its frame consumed as a
//! bad confirmation and must resend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ev_core::protocol::reliable::{acknowledge, read_chunk, DEFAULT_ACK_TIMEOUT};
use ev_core::protocol::{receive_and_ack, send_and_await_ack, CentralMessage, FramedCommand, FramedReply, PeerRole};
use ev_core::{DenialReason, ExchangeError, HealthStatus, Inbound, SessionState};

use crate::application::channels::{ChannelError, ChannelId, OutboundChannel};
use crate::application::coordinator::Coordinator;
use crate::infrastructure::network::{Transport, TransportError};

/// Framed form of a coordinator notification, if it has one.
///
/// Only the driver-facing supply decisions are rendered: a new PENDING
/// session or a reconnect becomes `AUTH_GRANTED`, a coordinator denial
/// becomes `AUTH_DENIED#<code>`.
pub fn render_framed(message: &CentralMessage) -> Option<String> {
    let CentralMessage::SupplyStatus(status) = message else {
        return None;
    };
    let reply = if status.reconnect || status.state == SessionState::Pending {
        FramedReply::Granted {
            cp_id: status.cp_id.clone(),
            driver_id: status.driver_id.clone(),
            reconnect: status.reconnect,
        }
    } else {
        match (status.state, status.reason) {
            (SessionState::Denied, Some(reason)) if reason != DenialReason::Rejected => FramedReply::Denied(reason),
            _ => return None,
        }
    };
    Some(reply.render())
}

// ── Outbound channel ──────────────────────────────────────────────────────────

/// Queues rendered payloads for the connection task, which owns the socket.
pub struct FramedChannel {
    id: ChannelId,
    queue: mpsc::UnboundedSender<String>,
}

impl FramedChannel {
    pub fn new(queue: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ChannelId::next(),
            queue,
        }
    }
}

#[async_trait]
impl OutboundChannel for FramedChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn send(&self, message: &CentralMessage) -> Result<(), ChannelError> {
        match render_framed(message) {
            Some(payload) => self.queue.send(payload).map_err(|_| ChannelError::Closed),
            None => {
                debug!("{}: {} has no framed form; dropped", self.id, message.kind());
                Ok(())
            }
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FramedTransport {
    ack_timeout: Duration,
    idle_timeout: Duration,
}

impl Default for FramedTransport {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_TIMEOUT, Duration::from_secs(300))
    }
}

enum Event {
    Inbound(Result<Vec<u8>, ExchangeError>),
    Outbound(Option<String>),
}

impl FramedTransport {
    pub fn new(ack_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            ack_timeout,
            idle_timeout,
        }
    }

    /// Reads frames until one parses as a command.  Corrupt frames are
    /// NACKed, unusable ones are ACKed and logged.
    async fn handshake<S>(&self, stream: &mut S, peer: SocketAddr) -> anyhow::Result<FramedCommand>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let inbound = match receive_and_ack(stream, self.idle_timeout).await {
                Ok(inbound) => inbound,
                Err(ExchangeError::Closed) => return Err(TransportError::ClosedBeforeHandshake.into()),
                Err(e) => return Err(e).with_context(|| format!("{peer}: waiting for the first frame")),
            };
            match inbound {
                Inbound::Frame(payload) => match FramedCommand::parse(&payload) {
                    Ok(command) => return Ok(command),
                    Err(e) => warn!("{peer}: unusable opening frame {payload:?}: {e}"),
                },
                Inbound::Corrupt(e) => debug!("{peer}: NACKed corrupt frame: {e}"),
            }
        }
    }

    async fn session_loop(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        role: PeerRole,
        identity: &str,
        coordinator: &Coordinator,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> anyhow::Result<()> {
        let mut outbound_open = true;
        loop {
            let event = tokio::select! {
                chunk = read_chunk(&mut *stream, self.idle_timeout) => Event::Inbound(chunk),
                payload = outbound.recv(), if outbound_open => Event::Outbound(payload),
            };

            match event {
                Event::Inbound(Err(ExchangeError::Closed)) => return Ok(()),
                Event::Inbound(Err(e)) => {
                    return Err(e).with_context(|| format!("{peer}: {role} {identity} went silent or failed"));
                }
                Event::Inbound(Ok(raw)) => {
                    let inbound = acknowledge(stream, &raw)
                        .await
                        .with_context(|| format!("{peer}: confirming frame"))?;
                    match inbound {
                        Inbound::Frame(payload) => match FramedCommand::parse(&payload) {
                            Ok(command) if command.role() == role && command.identity() == identity => {
                                dispatch(coordinator, command).await;
                            }
                            Ok(command) => warn!("{peer}: {role} {identity} sent {:?}; ignored", command.render()),
                            Err(e) => warn!("{peer}: unusable frame {payload:?}: {e}"),
                        },
                        Inbound::Corrupt(e) => debug!("{peer}: NACKed corrupt frame: {e}"),
                    }
                }
                Event::Outbound(None) => {
                    info!("{peer}: {role} {identity} superseded by a newer connection; still reading its frames");
                    outbound_open = false;
                }
                Event::Outbound(Some(payload)) => match send_and_await_ack(stream, &payload, self.ack_timeout).await {
                    Ok(()) => debug!("{peer}: {payload:?} confirmed"),
                    Err(ExchangeError::Closed) => return Err(TransportError::PeerGone.into()),
                    Err(ExchangeError::Io(e)) => {
                        return Err(e).with_context(|| format!("{peer}: sending {payload:?}"));
                    }
                    Err(e) => warn!("{peer}: {payload:?} not confirmed: {e}"),
                },
            }
        }
    }
}

/// Applies one command from an identified peer.
async fn dispatch(coordinator: &Coordinator, command: FramedCommand) {
    let result = match &command {
        FramedCommand::Auth { cp_id } => coordinator.update_health(cp_id, HealthStatus::Ok, None).await,
        FramedCommand::Fault { cp_id, reason } => {
            coordinator
                .update_health(cp_id, HealthStatus::Fault, Some(reason.clone()))
                .await
        }
        FramedCommand::Request { driver_id, cp_id } => coordinator
            .request_supply(driver_id, cp_id, None)
            .await
            .map(|_| ()),
        FramedCommand::Finish { cp_id, driver_id } => match coordinator.finish_by_driver(cp_id, driver_id).await {
            Ok(None) => {
                debug!("{driver_id} has no session on {cp_id} to finish");
                Ok(())
            }
            other => other.map(|_| ()),
        },
    };
    if let Err(e) = result {
        warn!("{} not applied: {e}", command.render());
    }
}

#[async_trait]
impl Transport for FramedTransport {
    fn name(&self) -> &'static str {
        "framed"
    }

    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr, coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
        let first = self.handshake(&mut stream, peer).await?;
        let role = first.role();
        let identity = first.identity().to_string();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Arc::new(FramedChannel::new(tx));
        let channel_id = channel.id();
        match role {
            PeerRole::ChargingPoint => {
                coordinator.attach_cp_channel(&identity, channel).await;
            }
            PeerRole::Driver => coordinator.attach_driver_channel(&identity, channel).await,
        }
        info!("{peer} identified as {role} {identity} over framed transport");

        dispatch(&coordinator, first).await;
        let result = self
            .session_loop(&mut stream, peer, role, &identity, &coordinator, &mut rx)
            .await;

        coordinator.on_disconnect(role, &identity, channel_id).await;
        result
    }
}
