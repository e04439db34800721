//! Application layer of the coordinator.
//!
//! Everything that decides *what happens* lives here; nothing here opens a
//! socket or touches the file system.  Transports and storage plug in
//! through the traits defined in this layer.
//!
//! # Sub-modules
//!
//! - **`coordinator`** – The single authority over charging points and
//!   supply sessions.  Every transport ends up calling its operations.
//!
//! - **`channels`** – The `OutboundChannel` abstraction and the registry
//!   that maps a peer identity to its current connection.
//!
//! - **`outbox`** – Notifications queued under the coordinator lock and
//!   delivered after it is released.
//!
//! - **`repository`** – The persistence boundary for charging-point records.
//!
//! - **`telemetry`** – Meter readings delivered from outside the peer
//!   connections.
//!
//! - **`operator`** – Console command parsing, execution and rendering.

pub mod channels;
pub mod coordinator;
pub mod operator;
pub mod outbox;
pub mod repository;
pub mod telemetry;
