//! Wire protocols spoken between EV-Central and its peers.
//!
//! # Two transports, one vocabulary (for beginners)
//!
//! Charging points and drivers can reach the coordinator in two ways:
//!
//! - **Line-delimited JSON** (`messages`) – rich, self-describing records,
//!   one per line.  Used by full charging-point controllers and driver apps.
//! - **Framed text** (`frame` + `command` + `reliable`) – tiny `OP#a#b`
//!   commands wrapped in `STX … ETX lrc` frames, each confirmed by a single
//!   ACK or NACK byte.  Used by CP health monitors and simple driver
//!   terminals.
//!
//! Both end up as calls on the same coordinator, so the charging logic is
//! written once.

pub mod command;
pub mod frame;
pub mod messages;
pub mod reliable;

pub use command::{CommandError, FramedCommand, FramedReply};
pub use frame::{decode_frame, encode_frame, FrameError, ACK, NACK};
pub use messages::{
    decode_line, encode_line, CentralMessage, CpMessage, DriverMessage, Hello, OperatorAction,
    PeerRole, RemoteCommand, SupplyStatus,
};
pub use reliable::{receive_and_ack, send_and_await_ack, ExchangeError, Inbound};
