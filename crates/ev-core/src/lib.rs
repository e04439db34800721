//! # ev-core
//!
//! Shared library for EV-Central containing the framed wire codec, the
//! reliable exchange primitives built on top of it, the message types of both
//! peer protocols, and the charging-point / supply-session domain entities.
//!
//! This crate holds no coordinator state and opens no sockets.  The reliable
//! exchange functions are generic over any tokio byte stream so the same code
//! drives a `TcpStream` in production and an in-memory mock in tests.
//!
//! # Architecture overview (for beginners)
//!
//! EV-Central coordinates a network of electric-vehicle charging points
//! ("CPs").  Drivers ask the central coordinator for an energy-delivery
//! session on a CP; the coordinator asks the CP to authorize it, tracks the
//! session while energy flows, and tells every connected driver when a CP
//! changes state.
//!
//! This crate (`ev-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the network.  There are two peer
//!   protocols: newline-delimited JSON records, and short `OP#field#field`
//!   text commands wrapped in checksum-verified frames that are acknowledged
//!   with a single ACK/NACK byte.
//!
//! - **`domain`** – The entities the coordinator manages: charging points,
//!   supply sessions, and the enums describing their lifecycles.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `ev_core::ChargingPoint` instead of `ev_core::domain::charging_point::ChargingPoint`.
pub use domain::charging_point::{ChargingPoint, CpRecord, CpStatus, CpView, HealthStatus};
pub use domain::session::{DenialReason, SessionId, SessionState, SupplySession};
pub use protocol::frame::{decode_frame, encode_frame, FrameError};
pub use protocol::reliable::{receive_and_ack, send_and_await_ack, ExchangeError, Inbound};
