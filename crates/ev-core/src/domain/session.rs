//! Supply sessions: identifiers, states, denial reasons, and transitions.
//!
//! ```text
//! PENDING ──accept──► AUTHORIZED ──start──► IN_PROGRESS ──success──► FINISHED
//!    │                    │                      │
//!    └─reject─► DENIED    └──── failure / fault / disconnect ──► ABORTED
//! ```
//!
//! A PENDING session interrupted before the CP answered also ends ABORTED.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque, unguessable session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Draws a fresh random token (128-bit UUID v4, hex encoded).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Authorized,
    Denied,
    InProgress,
    Finished,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Denied | SessionState::Finished | SessionState::Aborted
        )
    }

    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Authorized)
                | (Pending, Denied)
                | (Pending, Aborted)
                | (Authorized, InProgress)
                | (Authorized, Finished)
                | (Authorized, Aborted)
                | (InProgress, Finished)
                | (InProgress, Aborted)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "PENDING",
            SessionState::Authorized => "AUTHORIZED",
            SessionState::Denied => "DENIED",
            SessionState::InProgress => "IN_PROGRESS",
            SessionState::Finished => "FINISHED",
            SessionState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Why a supply request was refused.
///
/// The first five are decided by the coordinator in this precedence order
/// (after `NotFound`): `Stopped` > `Fault` > `Busy` > `Disconnected`.
/// `Rejected` means the CP itself declined the authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DenialReason {
    #[serde(rename = "CP_NOT_FOUND")]
    NotFound,
    #[serde(rename = "OUT_OF_ORDER")]
    Stopped,
    #[serde(rename = "FAULT")]
    Fault,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl DenialReason {
    /// Wire code used in `AUTH_DENIED#<code>` replies and JSON `reason` fields.
    pub fn code(self) -> &'static str {
        match self {
            DenialReason::NotFound => "CP_NOT_FOUND",
            DenialReason::Stopped => "OUT_OF_ORDER",
            DenialReason::Fault => "FAULT",
            DenialReason::Busy => "BUSY",
            DenialReason::Disconnected => "DISCONNECTED",
            DenialReason::Rejected => "REJECTED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "CP_NOT_FOUND" => Some(DenialReason::NotFound),
            "OUT_OF_ORDER" => Some(DenialReason::Stopped),
            "FAULT" => Some(DenialReason::Fault),
            "BUSY" => Some(DenialReason::Busy),
            "DISCONNECTED" => Some(DenialReason::Disconnected),
            "REJECTED" => Some(DenialReason::Rejected),
            _ => None,
        }
    }

    /// Human-readable explanation for the driver.
    pub fn describe(self, cp_id: &str) -> String {
        match self {
            DenialReason::NotFound => format!("charging point {cp_id} does not exist"),
            DenialReason::Stopped => format!("charging point {cp_id} is out of order"),
            DenialReason::Fault => format!("charging point {cp_id} reports a fault"),
            DenialReason::Busy => format!("charging point {cp_id} is busy"),
            DenialReason::Disconnected => format!("charging point {cp_id} is not connected"),
            DenialReason::Rejected => format!("charging point {cp_id} rejected the request"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

/// One energy-delivery episode between a driver and a charging point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplySession {
    #[serde(rename = "session_id")]
    pub id: SessionId,
    pub cp_id: String,
    pub driver_id: String,
    pub requested_energy: Option<f64>,
    pub state: SessionState,
    pub energy_delivered: f64,
    pub amount_due: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl SupplySession {
    /// Opens a PENDING session with a fresh id.
    pub fn open(cp_id: impl Into<String>, driver_id: impl Into<String>, requested_energy: Option<f64>) -> Self {
        Self {
            id: SessionId::generate(),
            cp_id: cp_id.into(),
            driver_id: driver_id.into(),
            requested_energy,
            state: SessionState::Pending,
            energy_delivered: 0.0,
            amount_due: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            reason: None,
        }
    }

    /// Moves to `next` if the lifecycle allows it, stamping timestamps.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidTransition`] for moves outside the lifecycle.
    pub fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_move_to(next) {
            return Err(SessionError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            SessionState::Authorized | SessionState::InProgress => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Folds a meter reading into the session.  An explicit `amount` wins
    /// over `energy × price_per_kwh`.
    pub fn record_progress(&mut self, energy: f64, amount: Option<f64>, price_per_kwh: f64) {
        self.energy_delivered = energy;
        self.amount_due = amount.unwrap_or(energy * price_per_kwh);
    }
}
