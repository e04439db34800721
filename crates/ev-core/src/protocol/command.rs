//! Text commands carried inside frames: `OP#field1#field2...`.
//!
//! | Payload                    | Sender  | Meaning                              |
//! |----------------------------|---------|--------------------------------------|
//! | `AUTH#<cp_id>`             | monitor | CP present and healthy (heartbeat)   |
//! | `FAULT#<cp_id>#<reason>`   | monitor | CP reports a fault                   |
//! | `REQ#<driver_id>#<cp_id>`  | driver  | request a supply session             |
//! | `FINISH#<cp_id>#<driver_id>` | driver | driver is done charging              |
//!
//! Replies from the coordinator are framed the same way:
//! `AUTH_GRANTED#<cp_id>#<driver_id>[#RECONNECT]` or `AUTH_DENIED#<code>`.

use thiserror::Error;

use crate::domain::session::DenialReason;
use crate::protocol::messages::PeerRole;

/// Separator between operation code and fields.
pub const FIELD_SEPARATOR: char = '#';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown operation {0:?}")]
    UnknownOperation(String),

    #[error("{op} needs {expected} non-empty field(s), got {got}")]
    MissingFields {
        op: &'static str,
        expected: usize,
        got: usize,
    },
}

/// A parsed inbound text command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedCommand {
    Auth { cp_id: String },
    Fault { cp_id: String, reason: String },
    Request { driver_id: String, cp_id: String },
    Finish { cp_id: String, driver_id: String },
}

impl FramedCommand {
    /// Parses a frame payload.
    ///
    /// The `FAULT` reason keeps any further `#` characters verbatim.
    ///
    /// # Errors
    ///
    /// [`CommandError`] for empty payloads, unknown operations, or missing
    /// fields.
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(CommandError::Empty);
        }
        let (op, rest) = payload
            .split_once(FIELD_SEPARATOR)
            .unwrap_or((payload, ""));

        match op {
            "AUTH" => {
                let [cp_id] = fields::<1>("AUTH", rest)?;
                Ok(FramedCommand::Auth { cp_id })
            }
            "FAULT" => {
                let (cp_id, reason) = rest.split_once(FIELD_SEPARATOR).unwrap_or((rest, ""));
                if cp_id.is_empty() {
                    return Err(CommandError::MissingFields { op: "FAULT", expected: 1, got: 0 });
                }
                Ok(FramedCommand::Fault {
                    cp_id: cp_id.to_string(),
                    reason: reason.to_string(),
                })
            }
            "REQ" => {
                let [driver_id, cp_id] = fields::<2>("REQ", rest)?;
                Ok(FramedCommand::Request { driver_id, cp_id })
            }
            "FINISH" => {
                let [cp_id, driver_id] = fields::<2>("FINISH", rest)?;
                Ok(FramedCommand::Finish { cp_id, driver_id })
            }
            other => Err(CommandError::UnknownOperation(other.to_string())),
        }
    }

    pub fn render(&self) -> String {
        match self {
            FramedCommand::Auth { cp_id } => format!("AUTH#{cp_id}"),
            FramedCommand::Fault { cp_id, reason } => format!("FAULT#{cp_id}#{reason}"),
            FramedCommand::Request { driver_id, cp_id } => format!("REQ#{driver_id}#{cp_id}"),
            FramedCommand::Finish { cp_id, driver_id } => format!("FINISH#{cp_id}#{driver_id}"),
        }
    }

    /// Role implied by this command when it opens a connection.
    pub fn role(&self) -> PeerRole {
        match self {
            FramedCommand::Auth { .. } | FramedCommand::Fault { .. } => PeerRole::ChargingPoint,
            FramedCommand::Request { .. } | FramedCommand::Finish { .. } => PeerRole::Driver,
        }
    }

    /// Identity of the sender: the CP id for monitor commands, the driver id
    /// for driver commands.
    pub fn identity(&self) -> &str {
        match self {
            FramedCommand::Auth { cp_id } | FramedCommand::Fault { cp_id, .. } => cp_id,
            FramedCommand::Request { driver_id, .. } | FramedCommand::Finish { driver_id, .. } => {
                driver_id
            }
        }
    }
}

fn fields<const N: usize>(op: &'static str, rest: &str) -> Result<[String; N], CommandError> {
    let parts: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(FIELD_SEPARATOR).collect()
    };
    let present = parts.iter().take(N).filter(|p| !p.is_empty()).count();
    if parts.len() < N || present < N {
        return Err(CommandError::MissingFields {
            op,
            expected: N,
            got: present,
        });
    }
    Ok(std::array::from_fn(|i| parts[i].to_string()))
}

/// Application-level reply to a `REQ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedReply {
    Granted {
        cp_id: String,
        driver_id: String,
        reconnect: bool,
    },
    Denied(DenialReason),
}

impl FramedReply {
    pub fn render(&self) -> String {
        match self {
            FramedReply::Granted { cp_id, driver_id, reconnect: false } => {
                format!("AUTH_GRANTED#{cp_id}#{driver_id}")
            }
            FramedReply::Granted { cp_id, driver_id, reconnect: true } => {
                format!("AUTH_GRANTED#{cp_id}#{driver_id}#RECONNECT")
            }
            FramedReply::Denied(reason) => format!("AUTH_DENIED#{}", reason.code()),
        }
    }

    /// Parses a reply payload, as a driver would.
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.trim().split(FIELD_SEPARATOR);
        match parts.next()? {
            "AUTH_GRANTED" => {
                let cp_id = parts.next()?.to_string();
                let driver_id = parts.next()?.to_string();
                let reconnect = parts.next() == Some("RECONNECT");
                Some(FramedReply::Granted { cp_id, driver_id, reconnect })
            }
            "AUTH_DENIED" => DenialReason::from_code(parts.next()?).map(FramedReply::Denied),
            _ => None,
        }
    }
}
