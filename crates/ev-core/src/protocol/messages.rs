//! JSON message types for the line-delimited peer protocol.
//!
//! Every record is one JSON object terminated by `\n`.  The first record a
//! peer sends is a [`Hello`] handshake; every record after that carries a
//! `"type"` field naming the variant:
//!
//! ```json
//! {"role":"charging-point","id":"ALC1","location":"Calle Mayor 1"}
//! {"type":"supply_update","session_id":"4f0c...","energy":3.2}
//! {"type":"request_supply","cp_id":"ALC1","requested_energy":10.0}
//! ```
//!
//! # Why three message enums?
//!
//! Charging points and drivers may send different things, and the coordinator
//! sends a third set.  Splitting [`CpMessage`], [`DriverMessage`] and
//! [`CentralMessage`] makes a driver that sends `health` a decode error at
//! the edge instead of a role check deep in the coordinator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::charging_point::{CpView, HealthStatus};
use crate::domain::session::{DenialReason, SessionId, SessionState, SupplySession};

/// Which side of the network a peer is on, fixed by its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    #[serde(rename = "charging-point", alias = "cp", alias = "charging_point")]
    ChargingPoint,
    #[serde(rename = "driver")]
    Driver,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::ChargingPoint => f.write_str("charging-point"),
            PeerRole::Driver => f.write_str("driver"),
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// First record on every line-protocol connection.
///
/// `cp_id` and `driver_id` are accepted as spellings of `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub role: PeerRole,
    #[serde(alias = "cp_id", alias = "driver_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_per_kwh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_power: Option<f64>,
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Operator actions accepted from consoles and operator links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Stop,
    Resume,
}

/// Instructions the coordinator sends to a charging point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Go out of service and halt any supply in progress.
    Stop,
    /// Return to service.
    Resume,
    /// End the named session (the driver finished).
    EndSupply,
}

impl From<OperatorAction> for RemoteCommand {
    fn from(action: OperatorAction) -> Self {
        match action {
            OperatorAction::Stop => RemoteCommand::Stop,
            OperatorAction::Resume => RemoteCommand::Resume,
        }
    }
}

// ── Charging point → central ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CpMessage {
    AuthorizationResponse {
        session_id: SessionId,
        accepted: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    SupplyStarted {
        session_id: SessionId,
    },
    SupplyUpdate {
        session_id: SessionId,
        energy: f64,
        #[serde(default)]
        amount: Option<f64>,
    },
    SupplyFinished {
        session_id: SessionId,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    Health {
        status: HealthStatus,
        #[serde(default)]
        message: Option<String>,
    },
}

fn default_success() -> bool {
    true
}

// ── Driver → central ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    RequestSupply {
        cp_id: String,
        #[serde(default, alias = "requested_kwh")]
        requested_energy: Option<f64>,
    },
    ListCps,
    /// Sent by operator consoles that attach as drivers.  `cp_id` absent
    /// means every charging point.
    RemoteCommand {
        command: OperatorAction,
        #[serde(default)]
        cp_id: Option<String>,
    },
}

// ── Central → peers ───────────────────────────────────────────────────────────

/// Outcome of a supply request or a later session change, addressed to the
/// session's driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyStatus {
    pub state: SessionState,
    pub cp_id: String,
    pub driver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SupplySession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    pub message: String,
    /// Set when a driver re-requests the CP it is already supplying from.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CentralMessage {
    Welcome {
        role: PeerRole,
        id: String,
    },
    Snapshot {
        charging_points: Vec<CpView>,
    },
    CpState {
        cp: CpView,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        health_message: Option<String>,
    },
    AuthorizeSupply {
        session_id: SessionId,
        driver_id: String,
        requested_energy: Option<f64>,
    },
    SupplyStatus(SupplyStatus),
    SupplyUpdate {
        session: SupplySession,
    },
    RemoteCommand {
        command: RemoteCommand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    Error {
        message: String,
    },
}

impl CentralMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CentralMessage::Welcome { .. } => "welcome",
            CentralMessage::Snapshot { .. } => "snapshot",
            CentralMessage::CpState { .. } => "cp_state",
            CentralMessage::AuthorizeSupply { .. } => "authorize_supply",
            CentralMessage::SupplyStatus(_) => "supply_status",
            CentralMessage::SupplyUpdate { .. } => "supply_update",
            CentralMessage::RemoteCommand { .. } => "remote_command",
            CentralMessage::Error { .. } => "error",
        }
    }
}

// ── Line encoding ─────────────────────────────────────────────────────────────

/// Serializes `msg` as one JSON record including the trailing newline.
///
/// # Errors
///
/// Returns the `serde_json` error if the value cannot be represented.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parses one JSON record; surrounding whitespace (including `\r\n`) is ignored.
///
/// # Errors
///
/// Returns the `serde_json` error for malformed JSON or an unknown `"type"`.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::charging_point::CpStatus;

    #[test]
    fn test_hello_accepts_canonical_and_legacy_spellings() {
        // Arrange
        let canonical = r#"{"role":"charging-point","id":"ALC1","location":"Calle"}"#;
        let legacy = r#"{"role":"cp","cp_id":"ALC1"}"#;
        let driver = r#"{"role":"driver","driver_id":"D1"}"#;

        // Act
        let a: Hello = decode_line(canonical).unwrap();
        let b: Hello = decode_line(legacy).unwrap();
        let c: Hello = decode_line(driver).unwrap();

        // Assert
        assert_eq!(a.role, PeerRole::ChargingPoint);
        assert_eq!(a.location.as_deref(), Some("Calle"));
        assert_eq!(b.role, PeerRole::ChargingPoint);
        assert_eq!(b.id, "ALC1");
        assert_eq!(c.role, PeerRole::Driver);
        assert_eq!(c.id, "D1");
    }

    #[test]
    fn test_request_supply_accepts_requested_kwh_alias() {
        let msg: DriverMessage =
            decode_line(r#"{"type":"request_supply","cp_id":"ALC1","requested_kwh":10}"#).unwrap();
        assert_eq!(
            msg,
            DriverMessage::RequestSupply {
                cp_id: "ALC1".to_string(),
                requested_energy: Some(10.0),
            }
        );
    }

    #[test]
    fn test_supply_finished_defaults_to_success() {
        let msg: CpMessage = decode_line(r#"{"type":"supply_finished","session_id":"abc"}"#).unwrap();
        assert!(matches!(msg, CpMessage::SupplyFinished { success: true, message: None, .. }));
    }

    #[test]
    fn test_driver_cannot_send_cp_messages() {
        let result: Result<DriverMessage, _> = decode_line(r#"{"type":"health","status":"FAULT"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_health_message_parses_status() {
        let msg: CpMessage =
            decode_line(r#"{"type":"health","status":"FAULT","message":"overheat"}"#).unwrap();
        assert_eq!(
            msg,
            CpMessage::Health {
                status: HealthStatus::Fault,
                message: Some("overheat".to_string()),
            }
        );
    }

    #[test]
    fn test_supply_status_omits_reconnect_when_false() {
        // Arrange
        let status = CentralMessage::SupplyStatus(SupplyStatus {
            state: SessionState::Denied,
            cp_id: "GHOST".to_string(),
            driver_id: "D2".to_string(),
            session: None,
            reason: Some(DenialReason::NotFound),
            message: "charging point GHOST does not exist".to_string(),
            reconnect: false,
        });

        // Act
        let line = encode_line(&status).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        // Assert
        assert!(line.ends_with('\n'));
        assert_eq!(value["type"], "supply_status");
        assert_eq!(value["state"], "DENIED");
        assert_eq!(value["reason"], "CP_NOT_FOUND");
        assert!(value.get("reconnect").is_none());
        assert!(value.get("session").is_none());
    }

    #[test]
    fn test_cp_state_round_trips_through_json() {
        let msg = CentralMessage::CpState {
            cp: CpView {
                cp_id: "ALC1".to_string(),
                location: "Calle".to_string(),
                status: CpStatus::Available,
                health: HealthStatus::Ok,
                current_session_id: None,
                price_per_kwh: 0.35,
                max_power: 11.0,
                last_seen: None,
            },
            health_message: None,
        };
        let back: CentralMessage = decode_line(&encode_line(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_remote_command_wire_shape() {
        let line = encode_line(&CentralMessage::RemoteCommand {
            command: RemoteCommand::Stop,
            session_id: None,
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"remote_command\",\"command\":\"stop\"}\n");
    }

    #[test]
    fn test_unknown_type_is_a_decode_error() {
        let result: Result<CpMessage, _> = decode_line(r#"{"type":"dance"}"#);
        assert!(result.is_err());
    }
}
