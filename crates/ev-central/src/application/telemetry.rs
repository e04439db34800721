//! Meter readings arriving outside the peer connections.
//!
//! Some deployments publish CP meter readings on a message bus instead of
//! (or as well as) the CP's own `supply_update` records.  Whatever adapter
//! consumes that bus hands each payload to a [`TelemetrySink`]; the
//! coordinator is the production sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::application::coordinator::Coordinator;

/// One meter reading from a charging point.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryUpdate {
    pub cp_id: String,
    /// Cumulative energy delivered in this session, kWh.
    #[serde(alias = "kw")]
    pub energy: f64,
    /// Cumulative amount due, when the CP computes it itself.
    #[serde(default, alias = "eur")]
    pub amount: Option<f64>,
    /// Reading time as Unix seconds.
    #[serde(default)]
    pub ts: Option<f64>,
}

impl TelemetryUpdate {
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// `ts` as a UTC timestamp, if present and representable.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        let ts = self.ts.filter(|t| t.is_finite())?;
        let secs = ts.floor();
        let nanos = ((ts - secs) * 1e9) as u32;
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn on_telemetry(&self, update: TelemetryUpdate);

    /// Parses a raw bus payload and forwards it.  Malformed payloads are
    /// logged and dropped.
    async fn on_payload(&self, payload: &[u8]) {
        match TelemetryUpdate::from_json(payload) {
            Ok(update) => self.on_telemetry(update).await,
            Err(e) => warn!("discarding malformed telemetry payload: {e}"),
        }
    }
}

#[async_trait]
impl TelemetrySink for Coordinator {
    async fn on_telemetry(&self, update: TelemetryUpdate) {
        let seen_at = update.observed_at();
        match self
            .record_meter_reading(&update.cp_id, update.energy, update.amount, seen_at)
            .await
        {
            Ok(Some(session)) => debug!("telemetry from {} applied to session {session}", update.cp_id),
            Ok(None) => debug!("telemetry from {} with no running session", update.cp_id),
            Err(e) => warn!("telemetry from {} ignored: {e}", update.cp_id),
        }
    }
}
