//! Network infrastructure: the two peer transports and their accept loop.
//!
//! # Sub-modules
//!
//! - **`line_transport`** – Newline-delimited JSON records.  A handshake
//!   record names the peer's role and id; afterwards each line is one
//!   message.
//!
//! - **`framed_transport`** – `STX payload ETX lrc` frames confirmed with a
//!   single ACK/NACK byte.  The role is implied by the first valid command.
//!
//! Both transports turn inbound messages into [`Coordinator`] calls and
//! register an outbound channel so the coordinator can reach the peer.
//!
//! # Connection task shape (for beginners)
//!
//! ```text
//! run_listener ── accept ──► tokio::spawn(handle_connection)
//!                                   └─ transport.serve(..)   -> anyhow::Result
//!                                        ├─ handshake
//!                                        ├─ attach channel
//!                                        ├─ read loop
//!                                        └─ coordinator.on_disconnect(..)
//! ```
//!
//! `handle_connection` only logs the outcome of `serve`, which keeps `?`
//! usable everywhere inside a connection.

pub mod framed_transport;
pub mod line_transport;

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::application::coordinator::Coordinator;

pub use framed_transport::FramedTransport;
pub use line_transport::LineTransport;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Failures that end a connection before or outside normal message flow.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection before identifying itself")]
    ClosedBeforeHandshake,

    #[error("invalid handshake: {0}")]
    Handshake(String),

    #[error("peer stopped confirming frames")]
    PeerGone,
}

/// One way of speaking to peers over an accepted TCP stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one connection to completion.  Implementations must call
    /// [`Coordinator::on_disconnect`] for any channel they attached.
    async fn serve(&self, stream: TcpStream, peer: SocketAddr, coordinator: Arc<Coordinator>) -> anyhow::Result<()>;
}

/// Binds a listener for `transport`.
///
/// # Errors
///
/// Returns an error if the address cannot be bound (port in use, no
/// permission).
pub async fn bind(addr: &str, transport: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {transport} listener on {addr}"))?;
    info!("{transport} transport listening on {}", listener.local_addr().context("listener address")?);
    Ok(listener)
}

/// Accepts connections until `running` is cleared, serving each one on its
/// own task.
pub async fn run_listener<T>(
    listener: TcpListener,
    transport: Arc<T>,
    coordinator: Arc<Coordinator>,
    running: Arc<AtomicBool>,
) where
    T: Transport + 'static,
{
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping {} accept loop", transport.name());
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!("new {} connection from {peer}", transport.name());
                let transport = Arc::clone(&transport);
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    handle_connection(transport, stream, peer, coordinator).await;
                });
            }
            Ok(Err(e)) => error!("{} accept error: {e}", transport.name()),
            Err(_) => {}
        }
    }
}

async fn handle_connection<T: Transport>(
    transport: Arc<T>,
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
) {
    match transport.serve(stream, peer, coordinator).await {
        Ok(()) => info!("{} connection {peer} closed normally", transport.name()),
        Err(e) => warn!("{} connection {peer} closed with error: {e:#}", transport.name()),
    }
}
