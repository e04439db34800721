//! Newline-delimited JSON transport.
//!
//! ```text
//! peer ──► {"role":"driver","id":"D1"}            handshake
//! peer ◄── {"type":"welcome","role":"driver","id":"D1"}
//! peer ◄── {"type":"snapshot","charging_points":[..]}   (drivers only)
//! peer ──► {"type":"request_supply","cp_id":"ALC1"}
//! ...
//! ```
//!
//! A line that is not valid JSON, or names a message type the peer's role
//! does not send, is logged and skipped.  Non-UTF-8 input and socket errors
//! end the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ev_core::protocol::{decode_line, encode_line, CentralMessage, CpMessage, DriverMessage, Hello, PeerRole};

use crate::application::channels::{ChannelError, ChannelId, OutboundChannel};
use crate::application::coordinator::Coordinator;
use crate::infrastructure::network::{Transport, TransportError};

type LineReader = Lines<BufReader<OwnedReadHalf>>;

// ── Outbound channel ──────────────────────────────────────────────────────────

/// Writes each message as one JSON line.  The writer lock keeps concurrent
/// sends from interleaving.
pub struct LineChannel {
    id: ChannelId,
    writer: Mutex<OwnedWriteHalf>,
}

impl LineChannel {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            id: ChannelId::next(),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl OutboundChannel for LineChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn send(&self, message: &CentralMessage) -> Result<(), ChannelError> {
        let line = encode_line(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

// ── Per-role message handling ─────────────────────────────────────────────────

/// What a connected peer may send after the handshake, and what to do with it.
#[async_trait]
trait LineRole: Send + Sync {
    type Inbound: DeserializeOwned + Send;

    fn label(&self) -> String;

    async fn handle(&self, message: Self::Inbound);
}

struct ChargingPointLink<'a> {
    cp_id: &'a str,
    coordinator: &'a Coordinator,
}

#[async_trait]
impl LineRole for ChargingPointLink<'_> {
    type Inbound = CpMessage;

    fn label(&self) -> String {
        format!("charging point {}", self.cp_id)
    }

    async fn handle(&self, message: CpMessage) {
        let coordinator = self.coordinator;
        let result = match message {
            CpMessage::AuthorizationResponse {
                session_id,
                accepted,
                reason,
            } => {
                coordinator
                    .cp_authorization_response(&session_id, accepted, reason)
                    .await
            }
            CpMessage::SupplyStarted { session_id } => coordinator.supply_started(&session_id).await,
            CpMessage::SupplyUpdate {
                session_id,
                energy,
                amount,
            } => coordinator.supply_progress(&session_id, energy, amount).await,
            CpMessage::SupplyFinished {
                session_id,
                success,
                message,
            } => coordinator.finalize_session(&session_id, success, message).await,
            CpMessage::Health { status, message } => coordinator.update_health(self.cp_id, status, message).await,
        };
        if let Err(e) = result {
            warn!("{}: message ignored: {e}", self.label());
        }
    }
}

struct DriverLink<'a> {
    driver_id: &'a str,
    coordinator: &'a Coordinator,
    channel: &'a LineChannel,
}

impl DriverLink<'_> {
    async fn reply_error(&self, message: String) {
        if let Err(e) = self.channel.send(&CentralMessage::Error { message }).await {
            debug!("{}: error reply not delivered: {e}", self.label());
        }
    }
}

#[async_trait]
impl LineRole for DriverLink<'_> {
    type Inbound = DriverMessage;

    fn label(&self) -> String {
        format!("driver {}", self.driver_id)
    }

    async fn handle(&self, message: DriverMessage) {
        match message {
            DriverMessage::RequestSupply { cp_id, requested_energy } => {
                if let Err(e) = self
                    .coordinator
                    .request_supply(self.driver_id, &cp_id, requested_energy)
                    .await
                {
                    warn!("{}: request for {cp_id} failed: {e}", self.label());
                    self.reply_error(e.to_string()).await;
                }
            }
            DriverMessage::ListCps => self.coordinator.send_snapshot(self.driver_id).await,
            DriverMessage::RemoteCommand { command, cp_id } => {
                match self.coordinator.remote_command(command, cp_id.as_deref()).await {
                    Ok(ids) => info!("{}: {command:?} applied to {}", self.label(), ids.join(", ")),
                    Err(e) => self.reply_error(e.to_string()).await,
                }
            }
        }
    }
}

async fn read_loop<R: LineRole>(lines: &mut LineReader, role: &R) -> anyhow::Result<()> {
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("{}: reading line", role.label()))?
    {
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<R::Inbound>(&line) {
            Ok(message) => role.handle(message).await,
            Err(e) => warn!("{}: discarding malformed line {:?}: {e}", role.label(), line.trim()),
        }
    }
    Ok(())
}

// ── Transport ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct LineTransport;

impl LineTransport {
    async fn read_hello(lines: &mut LineReader) -> Result<Hello, TransportError> {
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?
                .ok_or(TransportError::ClosedBeforeHandshake)?;
            if line.trim().is_empty() {
                continue;
            }
            let hello: Hello = decode_line(&line).map_err(|e| TransportError::Handshake(e.to_string()))?;
            if hello.id.trim().is_empty() {
                return Err(TransportError::Handshake("empty id".to_string()));
            }
            return Ok(hello);
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    fn name(&self) -> &'static str {
        "line"
    }

    async fn serve(&self, stream: TcpStream, peer: SocketAddr, coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let channel = Arc::new(LineChannel::new(write_half));

        let hello = match Self::read_hello(&mut lines).await {
            Ok(hello) => hello,
            Err(e) => {
                let _ = channel.send(&CentralMessage::Error { message: e.to_string() }).await;
                return Err(e).with_context(|| format!("{peer}: handshake"));
            }
        };
        let (role, id) = (hello.role, hello.id.clone());

        channel
            .send(&CentralMessage::Welcome { role, id: id.clone() })
            .await
            .with_context(|| format!("{peer}: sending welcome to {role} {id}"))?;
        info!("{peer} identified as {role} {id}");

        let result = match role {
            PeerRole::ChargingPoint => {
                coordinator
                    .register_cp(
                        &id,
                        hello.location.as_deref().unwrap_or(""),
                        hello.price_per_kwh,
                        hello.max_power,
                    )
                    .await;
                coordinator.attach_cp_channel(&id, channel.clone()).await;
                let link = ChargingPointLink {
                    cp_id: &id,
                    coordinator: &coordinator,
                };
                read_loop(&mut lines, &link).await
            }
            PeerRole::Driver => {
                coordinator.attach_driver_channel(&id, channel.clone()).await;
                let link = DriverLink {
                    driver_id: &id,
                    coordinator: &coordinator,
                    channel: &channel,
                };
                read_loop(&mut lines, &link).await
            }
        };

        coordinator.on_disconnect(role, &id, channel.id()).await;
        result
    }
}
