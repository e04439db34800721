//! Charging point entity, its status enums, and its persisted/public shapes.
//!
//! # Status lifecycle (for beginners)
//!
//! ```text
//!                 attach                request routed          CP accepts
//! DISCONNECTED ───────────► AVAILABLE ────────────────► PENDING_AUTH ──────► SUPPLYING
//!      ▲                        ▲  ▲                           │                 │
//!      │ channel lost           │  └────────── session ends ───┴─────────────────┘
//!      │ (from any state)       │ health OK
//!      │                      FAULT ◄──── health FAULT (from any state)
//!      │
//!   STOPPED ◄── operator stop (from any state); operator resume leaves it
//! ```
//!
//! Only three things are persisted: identity, location and pricing.  Runtime
//! fields start over as DISCONNECTED / OK on every process start.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::{DenialReason, SessionId};

/// Availability of a charging point as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CpStatus {
    Disconnected,
    Available,
    PendingAuth,
    Supplying,
    Stopped,
    Fault,
}

impl CpStatus {
    /// Wire spelling of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            CpStatus::Disconnected => "DISCONNECTED",
            CpStatus::Available => "AVAILABLE",
            CpStatus::PendingAuth => "PENDING_AUTH",
            CpStatus::Supplying => "SUPPLYING",
            CpStatus::Stopped => "STOPPED",
            CpStatus::Fault => "FAULT",
        }
    }

    /// `true` for the two statuses that require a current session.
    pub fn hosts_session(self) -> bool {
        matches!(self, CpStatus::PendingAuth | CpStatus::Supplying)
    }
}

impl fmt::Display for CpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-reported health of a charging point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Ok,
    Fault,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Ok => f.write_str("OK"),
            HealthStatus::Fault => f.write_str("FAULT"),
        }
    }
}

/// Persisted shape of a charging point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpRecord {
    pub id: String,
    #[serde(default)]
    pub location: String,
    pub price_per_kwh: f64,
    pub max_power: f64,
}

/// Snapshot of a charging point as broadcast to drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpView {
    pub cp_id: String,
    pub location: String,
    pub status: CpStatus,
    pub health: HealthStatus,
    pub current_session_id: Option<SessionId>,
    pub price_per_kwh: f64,
    pub max_power: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// A charging point tracked by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargingPoint {
    pub id: String,
    pub location: String,
    pub status: CpStatus,
    pub health: HealthStatus,
    pub current_session_id: Option<SessionId>,
    pub last_seen: Option<DateTime<Utc>>,
    pub price_per_kwh: f64,
    pub max_power: f64,
    /// Set by an operator `stop`, cleared only by `resume`.
    pub out_of_service: bool,
}

impl ChargingPoint {
    /// Creates a disconnected, healthy charging point.
    pub fn new(id: impl Into<String>, location: impl Into<String>, price_per_kwh: f64, max_power: f64) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            status: CpStatus::Disconnected,
            health: HealthStatus::Ok,
            current_session_id: None,
            last_seen: None,
            price_per_kwh,
            max_power,
            out_of_service: false,
        }
    }

    /// Rebuilds a charging point from storage; runtime fields start fresh.
    pub fn from_record(record: CpRecord) -> Self {
        Self::new(record.id, record.location, record.price_per_kwh, record.max_power)
    }

    pub fn to_record(&self) -> CpRecord {
        CpRecord {
            id: self.id.clone(),
            location: self.location.clone(),
            price_per_kwh: self.price_per_kwh,
            max_power: self.max_power,
        }
    }

    pub fn view(&self) -> CpView {
        CpView {
            cp_id: self.id.clone(),
            location: self.location.clone(),
            status: self.status,
            health: self.health,
            current_session_id: self.current_session_id.clone(),
            price_per_kwh: self.price_per_kwh,
            max_power: self.max_power,
            last_seen: self.last_seen,
        }
    }

    /// The status this CP settles into when it hosts no session.
    ///
    /// Precedence: no channel, then operator stop, then health.
    pub fn resting_status(&self, connected: bool) -> CpStatus {
        if !connected {
            CpStatus::Disconnected
        } else if self.out_of_service {
            CpStatus::Stopped
        } else if self.health == HealthStatus::Fault {
            CpStatus::Fault
        } else {
            CpStatus::Available
        }
    }

    /// Why a new supply request must be refused, or `None` if it may proceed.
    ///
    /// When several reasons apply the most operator-relevant one wins:
    /// `Stopped` > `Fault` > `Busy` > `Disconnected`.
    pub fn denial_reason(&self, connected: bool) -> Option<DenialReason> {
        if self.out_of_service || self.status == CpStatus::Stopped {
            Some(DenialReason::Stopped)
        } else if self.health == HealthStatus::Fault || self.status == CpStatus::Fault {
            Some(DenialReason::Fault)
        } else if self.current_session_id.is_some() || self.status.hosts_session() {
            Some(DenialReason::Busy)
        } else if !connected || self.status != CpStatus::Available {
            Some(DenialReason::Disconnected)
        } else {
            None
        }
    }

    /// Records contact from the CP.
    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    /// Cost of `energy` kWh at this CP's tariff.
    pub fn price_for(&self, energy: f64) -> f64 {
        energy * self.price_per_kwh
    }
}
