//! Coordinator: the authoritative charging-point and session state machine.
//!
//! The coordinator owns three maps behind one lock:
//!
//! - charging points by id,
//! - active (non-terminal) supply sessions by id,
//! - the channel registry (who is connected, and how to reach them).
//!
//! # Operation shape (for beginners)
//!
//! Every public operation follows the same three steps:
//!
//! ```text
//! 1. lock      – acquire the coordinator lock
//! 2. mutate    – change state, queue notifications into an Outbox
//! 3. unlock    – drop the lock, then deliver the Outbox (and persist)
//! ```
//!
//! Because nothing awaits network I/O while the lock is held, two concurrent
//! `request_supply` calls for the same charging point are decided one after
//! the other: the first sees AVAILABLE and moves it to PENDING_AUTH, the
//! second sees PENDING_AUTH and is denied BUSY.
//!
//! # Missing entities
//!
//! Lookups of sessions and charging points go through
//! [`CentralState::session`] / [`CentralState::cp_mut`], which return
//! [`CoordinatorError::UnknownSession`] / [`CoordinatorError::UnknownChargingPoint`].
//! Transports log those and carry on; they never change state.  Messages
//! addressed to peers that are not connected are dropped by the
//! [`Outbox`](crate::application::outbox::Outbox).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ev_core::domain::session::SessionError;
use ev_core::protocol::{CentralMessage, OperatorAction, PeerRole, RemoteCommand, SupplyStatus};
use ev_core::{
    ChargingPoint, CpRecord, CpStatus, CpView, DenialReason, HealthStatus, SessionId, SessionState,
    SupplySession,
};

use crate::application::channels::{ChannelId, ChannelRegistry, SharedChannel};
use crate::application::outbox::Outbox;
use crate::application::repository::Repository;

/// Location given to charging points that connect before being registered.
/// It carries no meaning beyond "not provided".
pub const PLACEHOLDER_LOCATION: &str = "unregistered";

#[derive(Debug, Error, PartialEq)]
pub enum CoordinatorError {
    #[error("driver {0} has no registered channel")]
    DriverNotConnected(String),

    #[error("unknown charging point {0}")]
    UnknownChargingPoint(String),

    #[error("unknown or already finished session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is not supplying energy")]
    NotSupplying(SessionId),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result of a supply request, as decided under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupplyOutcome {
    /// New session created; the CP has been asked to authorize it.
    Pending(SessionId),
    /// The driver already owns the CP's running session.
    Reconnected(SessionId),
    Denied(DenialReason),
}

/// Tunables the coordinator needs from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub default_price_per_kwh: f64,
    pub default_max_power: f64,
    /// Number of finished sessions kept for the operator console.
    pub session_history: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_price_per_kwh: 0.35,
            default_max_power: 11.0,
            session_history: 64,
        }
    }
}

// ── Locked state ──────────────────────────────────────────────────────────────

struct CentralState {
    charging_points: HashMap<String, ChargingPoint>,
    sessions: HashMap<SessionId, SupplySession>,
    channels: ChannelRegistry,
    history: VecDeque<SupplySession>,
    history_limit: usize,
}

impl CentralState {
    fn cp_connected(&self, cp_id: &str) -> bool {
        self.channels.is_connected(PeerRole::ChargingPoint, cp_id)
    }

    fn cp_mut(&mut self, cp_id: &str) -> Result<&mut ChargingPoint, CoordinatorError> {
        self.charging_points
            .get_mut(cp_id)
            .ok_or_else(|| CoordinatorError::UnknownChargingPoint(cp_id.to_string()))
    }

    fn session(&self, id: &SessionId) -> Result<&SupplySession, CoordinatorError> {
        self.sessions
            .get(id)
            .ok_or_else(|| CoordinatorError::UnknownSession(id.clone()))
    }

    fn session_mut(&mut self, id: &SessionId) -> Result<&mut SupplySession, CoordinatorError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::UnknownSession(id.clone()))
    }

    fn views(&self) -> Vec<CpView> {
        let mut views: Vec<CpView> = self.charging_points.values().map(ChargingPoint::view).collect();
        views.sort_by(|a, b| a.cp_id.cmp(&b.cp_id));
        views
    }

    fn records(&self) -> Vec<CpRecord> {
        let mut records: Vec<CpRecord> = self.charging_points.values().map(ChargingPoint::to_record).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn broadcast_cp(&self, cp_id: &str, health_message: Option<String>, outbox: &mut Outbox) {
        if let Some(cp) = self.charging_points.get(cp_id) {
            outbox.to_drivers(
                &self.channels,
                CentralMessage::CpState {
                    cp: cp.view(),
                    health_message,
                },
            );
        }
    }

    fn notify_driver(&self, session: &SupplySession, message: impl Into<String>, outbox: &mut Outbox) {
        let status = SupplyStatus {
            state: session.state,
            cp_id: session.cp_id.clone(),
            driver_id: session.driver_id.clone(),
            session: Some(session.clone()),
            reason: (session.state == SessionState::Denied).then_some(DenialReason::Rejected),
            message: message.into(),
            reconnect: false,
        };
        outbox.to_peer(
            &self.channels,
            PeerRole::Driver,
            &session.driver_id,
            CentralMessage::SupplyStatus(status),
        );
    }

    /// Moves a session to a terminal state, releases its CP, notifies the
    /// driver and files the session into history.
    fn end_session(
        &mut self,
        id: &SessionId,
        outcome: SessionState,
        reason: String,
        outbox: &mut Outbox,
    ) -> Result<SupplySession, CoordinatorError> {
        let mut session = self
            .sessions
            .remove(id)
            .ok_or_else(|| CoordinatorError::UnknownSession(id.clone()))?;
        if let Err(e) = session.advance(outcome) {
            self.sessions.insert(id.clone(), session);
            return Err(e.into());
        }
        session.reason = Some(reason.clone());

        let connected = self.cp_connected(&session.cp_id);
        if let Some(cp) = self.charging_points.get_mut(&session.cp_id) {
            if cp.current_session_id.as_ref() == Some(id) {
                cp.current_session_id = None;
                cp.status = cp.resting_status(connected);
            }
            cp.touch();
        }

        self.notify_driver(&session, reason, outbox);
        info!(
            "session {} on {} for {} ended {} ({:.2} kWh, {:.2} due)",
            session.id, session.cp_id, session.driver_id, session.state, session.energy_delivered, session.amount_due
        );

        self.history.push_back(session.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        Ok(session)
    }

    /// Aborts whatever session `cp_id` hosts.  No session is not an error.
    fn abort_hosted_session(&mut self, cp_id: &str, reason: &str, outbox: &mut Outbox) -> Option<SupplySession> {
        let id = self.charging_points.get(cp_id)?.current_session_id.clone()?;
        match self.end_session(&id, SessionState::Aborted, reason.to_string(), outbox) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("could not abort session {id} on {cp_id}: {e}");
                None
            }
        }
    }

    fn decide_supply(
        &mut self,
        driver: SharedChannel,
        driver_id: &str,
        cp_id: &str,
        requested_energy: Option<f64>,
        outbox: &mut Outbox,
    ) -> SupplyOutcome {
        let connected = self.cp_connected(cp_id);
        let Some(cp) = self.charging_points.get_mut(cp_id) else {
            outbox.push(driver, denial(cp_id, driver_id, DenialReason::NotFound));
            return SupplyOutcome::Denied(DenialReason::NotFound);
        };
        cp.touch();

        if cp.status == CpStatus::Supplying {
            let running = cp.current_session_id.as_ref().and_then(|id| self.sessions.get(id));
            if let Some(session) = running.filter(|s| s.driver_id == driver_id) {
                let status = SupplyStatus {
                    state: session.state,
                    cp_id: cp_id.to_string(),
                    driver_id: driver_id.to_string(),
                    session: Some(session.clone()),
                    reason: None,
                    message: "reconnected to the running session".to_string(),
                    reconnect: true,
                };
                outbox.push(driver, CentralMessage::SupplyStatus(status));
                return SupplyOutcome::Reconnected(session.id.clone());
            }
        }

        if let Some(reason) = cp.denial_reason(connected) {
            outbox.push(driver, denial(cp_id, driver_id, reason));
            return SupplyOutcome::Denied(reason);
        }

        let session = SupplySession::open(cp_id, driver_id, requested_energy);
        let id = session.id.clone();
        cp.status = CpStatus::PendingAuth;
        cp.current_session_id = Some(id.clone());

        outbox.push(
            driver,
            CentralMessage::SupplyStatus(SupplyStatus {
                state: SessionState::Pending,
                cp_id: cp_id.to_string(),
                driver_id: driver_id.to_string(),
                session: Some(session.clone()),
                reason: None,
                message: "request forwarded to the charging point".to_string(),
                reconnect: false,
            }),
        );
        outbox.to_peer(
            &self.channels,
            PeerRole::ChargingPoint,
            cp_id,
            CentralMessage::AuthorizeSupply {
                session_id: id.clone(),
                driver_id: driver_id.to_string(),
                requested_energy,
            },
        );
        self.sessions.insert(id.clone(), session);
        self.broadcast_cp(cp_id, None, outbox);
        SupplyOutcome::Pending(id)
    }

    /// Folds a meter reading into a supplying session and tells its driver.
    fn record_progress(
        &mut self,
        id: &SessionId,
        energy: f64,
        amount: Option<f64>,
        default_price: f64,
        outbox: &mut Outbox,
    ) -> Result<(), CoordinatorError> {
        let cp_id = self.session(id)?.cp_id.clone();
        let price = self
            .charging_points
            .get(&cp_id)
            .map_or(default_price, |cp| cp.price_per_kwh);

        let session = self.session_mut(id)?;
        if !matches!(session.state, SessionState::Authorized | SessionState::InProgress) {
            return Err(CoordinatorError::NotSupplying(id.clone()));
        }
        session.record_progress(energy, amount, price);
        let snapshot = session.clone();

        if let Some(cp) = self.charging_points.get_mut(&cp_id) {
            cp.touch();
        }
        outbox.to_peer(
            &self.channels,
            PeerRole::Driver,
            &snapshot.driver_id,
            CentralMessage::SupplyUpdate { session: snapshot.clone() },
        );
        Ok(())
    }
}

fn denial(cp_id: &str, driver_id: &str, reason: DenialReason) -> CentralMessage {
    CentralMessage::SupplyStatus(SupplyStatus {
        state: SessionState::Denied,
        cp_id: cp_id.to_string(),
        driver_id: driver_id.to_string(),
        session: None,
        reason: Some(reason),
        message: reason.describe(cp_id),
        reconnect: false,
    })
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct Coordinator {
    state: Mutex<CentralState>,
    repository: Arc<dyn Repository>,
    /// Serializes saves so a slower, older snapshot never overwrites a newer one.
    persist_lock: Mutex<()>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    /// Builds a coordinator seeded from `repository`.
    ///
    /// A failing load is logged and the coordinator starts empty.
    pub fn new(repository: Arc<dyn Repository>, settings: CoordinatorSettings) -> Self {
        let charging_points: HashMap<String, ChargingPoint> = match repository.load() {
            Ok(records) => records
                .into_iter()
                .map(|r| (r.id.clone(), ChargingPoint::from_record(r)))
                .collect(),
            Err(e) => {
                warn!("could not load charging points, starting empty: {e}");
                HashMap::new()
            }
        };
        info!("coordinator loaded {} charging point(s)", charging_points.len());

        Self {
            state: Mutex::new(CentralState {
                charging_points,
                sessions: HashMap::new(),
                channels: ChannelRegistry::new(),
                history: VecDeque::new(),
                history_limit: settings.session_history,
            }),
            repository,
            persist_lock: Mutex::new(()),
            settings,
        }
    }

    // ── Registration and channels ─────────────────────────────────────────────

    /// Creates `cp_id` if unknown, or updates its location and pricing.
    ///
    /// Persists when any stored field changed.  An empty `location` leaves
    /// the current one untouched.
    pub async fn register_cp(
        &self,
        cp_id: &str,
        location: &str,
        price_per_kwh: Option<f64>,
        max_power: Option<f64>,
    ) -> ChargingPoint {
        let (cp, changed) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let mut changed = false;
            let cp = state.charging_points.entry(cp_id.to_string()).or_insert_with(|| {
                changed = true;
                let location = if location.is_empty() { PLACEHOLDER_LOCATION } else { location };
                ChargingPoint::new(
                    cp_id,
                    location,
                    price_per_kwh.unwrap_or(self.settings.default_price_per_kwh),
                    max_power.unwrap_or(self.settings.default_max_power),
                )
            });
            if !location.is_empty() && cp.location != location {
                cp.location = location.to_string();
                changed = true;
            }
            if let Some(price) = price_per_kwh.filter(|p| *p != cp.price_per_kwh) {
                cp.price_per_kwh = price;
                changed = true;
            }
            if let Some(power) = max_power.filter(|p| *p != cp.max_power) {
                cp.max_power = power;
                changed = true;
            }
            (cp.clone(), changed)
        };

        if changed {
            info!("registered charging point {cp_id} at {:?}", cp.location);
            self.persist().await;
        }
        cp
    }

    /// Registers the CP's outbound channel, auto-provisioning unknown ids,
    /// and announces its new state to every driver.
    pub async fn attach_cp_channel(&self, cp_id: &str, channel: SharedChannel) -> ChargingPoint {
        let mut outbox = Outbox::new();
        let (cp, created) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let mut created = false;
            let cp = state.charging_points.entry(cp_id.to_string()).or_insert_with(|| {
                created = true;
                ChargingPoint::new(
                    cp_id,
                    PLACEHOLDER_LOCATION,
                    self.settings.default_price_per_kwh,
                    self.settings.default_max_power,
                )
            });
            cp.touch();
            if !cp.status.hosts_session() {
                cp.status = cp.resting_status(true);
            }
            let snapshot = cp.clone();

            if let Some(previous) = state.channels.register(PeerRole::ChargingPoint, cp_id, channel) {
                info!("charging point {cp_id}: new connection replaces {}", previous.id());
            }
            state.broadcast_cp(cp_id, None, &mut outbox);
            (snapshot, created)
        };

        info!("charging point {cp_id} attached ({})", cp.status);
        outbox.deliver().await;
        if created {
            self.persist().await;
        }
        cp
    }

    /// Registers a driver's outbound channel and sends it a snapshot.
    pub async fn attach_driver_channel(&self, driver_id: &str, channel: SharedChannel) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.channels.register(PeerRole::Driver, driver_id, channel.clone()) {
                info!("driver {driver_id}: new connection replaces {}", previous.id());
            }
            outbox.push(
                channel,
                CentralMessage::Snapshot {
                    charging_points: state.views(),
                },
            );
        }
        info!("driver {driver_id} attached");
        outbox.deliver().await;
    }

    /// Sends the current list of charging points to `driver_id`.
    pub async fn send_snapshot(&self, driver_id: &str) {
        let mut outbox = Outbox::new();
        {
            let state = self.state.lock().await;
            outbox.to_peer(
                &state.channels,
                PeerRole::Driver,
                driver_id,
                CentralMessage::Snapshot {
                    charging_points: state.views(),
                },
            );
        }
        outbox.deliver().await;
    }

    /// Cleans up after a connection ends.
    ///
    /// Ignored when `channel` is no longer the registered one for `id`
    /// (a newer connection took over).  A charging point goes DISCONNECTED
    /// and its session, if any, is aborted.  A driver's sessions keep running.
    pub async fn on_disconnect(&self, role: PeerRole, id: &str, channel: ChannelId) {
        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if !state.channels.unregister_if_current(role, id, channel) {
                debug!("{role} {id}: {channel} already superseded; nothing to clean up");
                return;
            }
            match role {
                PeerRole::Driver => info!("driver {id} disconnected"),
                PeerRole::ChargingPoint => {
                    state.abort_hosted_session(id, "CP disconnected", &mut outbox);
                    if let Some(cp) = state.charging_points.get_mut(id) {
                        cp.status = CpStatus::Disconnected;
                        cp.touch();
                    }
                    state.broadcast_cp(id, None, &mut outbox);
                    info!("charging point {id} disconnected");
                }
            }
        }
        outbox.deliver().await;
    }

    // ── Supply lifecycle ──────────────────────────────────────────────────────

    /// Handles a driver's request to charge at `cp_id`.
    ///
    /// Denials are protocol answers (`Ok(SupplyOutcome::Denied)`), sent to
    /// the driver like any other status.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::DriverNotConnected`] when the driver has no
    /// registered channel to answer on.
    pub async fn request_supply(
        &self,
        driver_id: &str,
        cp_id: &str,
        requested_energy: Option<f64>,
    ) -> Result<SupplyOutcome, CoordinatorError> {
        let mut outbox = Outbox::new();
        let outcome = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let driver = state
                .channels
                .get(PeerRole::Driver, driver_id)
                .ok_or_else(|| CoordinatorError::DriverNotConnected(driver_id.to_string()))?;
            state.decide_supply(driver, driver_id, cp_id, requested_energy, &mut outbox)
        };

        match &outcome {
            SupplyOutcome::Pending(id) => info!("driver {driver_id} requested {cp_id}: session {id} pending"),
            SupplyOutcome::Reconnected(id) => info!("driver {driver_id} reconnected to session {id} on {cp_id}"),
            SupplyOutcome::Denied(reason) => info!("driver {driver_id} denied {cp_id}: {}", reason.code()),
        }
        outbox.deliver().await;
        Ok(outcome)
    }

    /// The CP's answer to an `authorize_supply` prompt.
    pub async fn cp_authorization_response(
        &self,
        session_id: &SessionId,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let cp_id = state.session(session_id)?.cp_id.clone();
            if accepted {
                let session = state.session_mut(session_id)?;
                session.advance(SessionState::Authorized)?;
                let snapshot = session.clone();
                if let Some(cp) = state.charging_points.get_mut(&cp_id) {
                    cp.status = CpStatus::Supplying;
                    cp.touch();
                }
                state.notify_driver(&snapshot, "authorized; connect the vehicle", &mut outbox);
            } else {
                let reason = reason.unwrap_or_else(|| "rejected by the charging point".to_string());
                state.end_session(session_id, SessionState::Denied, reason, &mut outbox)?;
            }
            state.broadcast_cp(&cp_id, None, &mut outbox);
        }
        outbox.deliver().await;
        Ok(())
    }

    /// The CP confirms energy started flowing.  Repeats are harmless.
    pub async fn supply_started(&self, session_id: &SessionId) -> Result<(), CoordinatorError> {
        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let session = state.session_mut(session_id)?;
            if session.state == SessionState::InProgress {
                return Ok(());
            }
            session.advance(SessionState::InProgress)?;
            let snapshot = session.clone();
            if let Some(cp) = state.charging_points.get_mut(&snapshot.cp_id) {
                cp.touch();
            }
            state.notify_driver(&snapshot, "supply in progress", &mut outbox);
            state.broadcast_cp(&snapshot.cp_id, None, &mut outbox);
        }
        outbox.deliver().await;
        Ok(())
    }

    /// Meter update from the CP.  An explicit `amount` wins over
    /// `energy × price_per_kwh`.
    pub async fn supply_progress(
        &self,
        session_id: &SessionId,
        energy: f64,
        amount: Option<f64>,
    ) -> Result<(), CoordinatorError> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().await;
            state.record_progress(
                session_id,
                energy,
                amount,
                self.settings.default_price_per_kwh,
                &mut outbox,
            )?;
        }
        outbox.deliver().await;
        Ok(())
    }

    /// Ends a session as reported by its CP.
    ///
    /// `success` finishes a session that was authorized or running; anything
    /// else (including a session still PENDING) ends ABORTED.
    pub async fn finalize_session(
        &self,
        session_id: &SessionId,
        success: bool,
        message: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let current = state.session(session_id)?.state;
            let finished = success && matches!(current, SessionState::Authorized | SessionState::InProgress);
            let (outcome, fallback) = if finished {
                (SessionState::Finished, "supply finished")
            } else {
                (SessionState::Aborted, "supply aborted")
            };
            let reason = message.unwrap_or_else(|| fallback.to_string());
            let ended = state.end_session(session_id, outcome, reason, &mut outbox)?;
            state.broadcast_cp(&ended.cp_id, None, &mut outbox);
        }
        outbox.deliver().await;
        Ok(())
    }

    /// Driver-initiated end of its session on `cp_id` (framed `FINISH`).
    ///
    /// Returns the ended session id, or `None` when the driver has no
    /// session on that CP.  The CP is told to end the supply.
    pub async fn finish_by_driver(&self, cp_id: &str, driver_id: &str) -> Result<Option<SessionId>, CoordinatorError> {
        let mut outbox = Outbox::new();
        let ended = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let cp = state.cp_mut(cp_id)?;
            let Some(session_id) = cp.current_session_id.clone() else {
                return Ok(None);
            };
            let session = state.session(&session_id)?;
            if session.driver_id != driver_id {
                warn!("driver {driver_id} tried to finish {session_id} owned by {}", session.driver_id);
                return Ok(None);
            }
            let (outcome, reason) = match session.state {
                SessionState::Authorized | SessionState::InProgress => (SessionState::Finished, "finished by driver"),
                _ => (SessionState::Aborted, "cancelled by driver"),
            };
            state.end_session(&session_id, outcome, reason.to_string(), &mut outbox)?;
            outbox.to_peer(
                &state.channels,
                PeerRole::ChargingPoint,
                cp_id,
                CentralMessage::RemoteCommand {
                    command: RemoteCommand::EndSupply,
                    session_id: Some(session_id.clone()),
                },
            );
            state.broadcast_cp(cp_id, None, &mut outbox);
            session_id
        };
        outbox.deliver().await;
        Ok(Some(ended))
    }

    // ── Health and operator control ───────────────────────────────────────────

    /// Applies a health report.
    ///
    /// FAULT forces the CP to FAULT and, as a separate step, aborts any
    /// session it hosts with `message` as the reason.  OK clears a FAULT
    /// status back to the CP's resting status.  A report that changes
    /// nothing only refreshes `last_seen`.
    pub async fn update_health(
        &self,
        cp_id: &str,
        status: HealthStatus,
        message: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let message = message.filter(|m| !m.is_empty());
        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let connected = state.cp_connected(cp_id);
            let before = {
                let cp = state.cp_mut(cp_id)?;
                let before = (cp.health, cp.status);
                cp.health = status;
                cp.touch();
                before
            };

            match status {
                HealthStatus::Fault => {
                    let reason = message.clone().unwrap_or_else(|| "charging point fault".to_string());
                    state.abort_hosted_session(cp_id, &reason, &mut outbox);
                    if let Some(cp) = state.charging_points.get_mut(cp_id) {
                        cp.status = CpStatus::Fault;
                    }
                }
                HealthStatus::Ok => {
                    if let Some(cp) = state.charging_points.get_mut(cp_id) {
                        if cp.status == CpStatus::Fault {
                            cp.status = cp.resting_status(connected);
                        }
                    }
                }
            }

            let after = state.charging_points.get(cp_id).map(|cp| (cp.health, cp.status));
            if after != Some(before) || message.is_some() {
                info!("charging point {cp_id} health {status}{}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default());
                state.broadcast_cp(cp_id, message, &mut outbox);
            }
        }
        outbox.deliver().await;
        Ok(())
    }

    /// Operator stop/resume for one CP, or for every CP when `cp_id` is `None`.
    ///
    /// `stop` aborts a hosted session, marks the CP STOPPED and tells it to
    /// halt.  `resume` returns it to its resting status.  Returns the ids
    /// that were affected.
    pub async fn remote_command(&self, action: OperatorAction, cp_id: Option<&str>) -> Result<Vec<String>, CoordinatorError> {
        let mut outbox = Outbox::new();
        let targets = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let targets: Vec<String> = match cp_id {
                Some(id) if state.charging_points.contains_key(id) => vec![id.to_string()],
                Some(id) => return Err(CoordinatorError::UnknownChargingPoint(id.to_string())),
                None => {
                    let mut all: Vec<String> = state.charging_points.keys().cloned().collect();
                    all.sort();
                    all
                }
            };

            for id in &targets {
                let connected = state.cp_connected(id);
                match action {
                    OperatorAction::Stop => {
                        state.abort_hosted_session(id, "stopped by operator", &mut outbox);
                        if let Some(cp) = state.charging_points.get_mut(id) {
                            cp.out_of_service = true;
                            cp.status = CpStatus::Stopped;
                        }
                    }
                    OperatorAction::Resume => {
                        if let Some(cp) = state.charging_points.get_mut(id) {
                            cp.out_of_service = false;
                            if !cp.status.hosts_session() {
                                cp.status = cp.resting_status(connected);
                            }
                        }
                    }
                }
                outbox.to_peer(
                    &state.channels,
                    PeerRole::ChargingPoint,
                    id,
                    CentralMessage::RemoteCommand {
                        command: action.into(),
                        session_id: None,
                    },
                );
                state.broadcast_cp(id, None, &mut outbox);
            }
            targets
        };

        info!("operator {action:?} applied to {} charging point(s)", targets.len());
        outbox.deliver().await;
        Ok(targets)
    }

    /// Folds an externally delivered meter reading into the CP's running
    /// session.  Without one, only `last_seen` moves.
    ///
    /// Returns the session that was updated, if any.
    pub async fn record_meter_reading(
        &self,
        cp_id: &str,
        energy: f64,
        amount: Option<f64>,
        seen_at: Option<DateTime<Utc>>,
    ) -> Result<Option<SessionId>, CoordinatorError> {
        let mut outbox = Outbox::new();
        let updated = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let cp = state.cp_mut(cp_id)?;
            cp.last_seen = Some(seen_at.unwrap_or_else(Utc::now));
            let session_id = cp.current_session_id.clone().filter(|_| cp.status == CpStatus::Supplying);
            match session_id {
                Some(id) => {
                    state.record_progress(&id, energy, amount, self.settings.default_price_per_kwh, &mut outbox)?;
                    Some(id)
                }
                None => None,
            }
        };
        outbox.deliver().await;
        Ok(updated)
    }

    // ── Read model ────────────────────────────────────────────────────────────

    /// Every known charging point, sorted by id.
    pub async fn charging_points(&self) -> Vec<ChargingPoint> {
        let state = self.state.lock().await;
        let mut cps: Vec<ChargingPoint> = state.charging_points.values().cloned().collect();
        cps.sort_by(|a, b| a.id.cmp(&b.id));
        cps
    }

    pub async fn charging_point(&self, cp_id: &str) -> Option<ChargingPoint> {
        self.state.lock().await.charging_points.get(cp_id).cloned()
    }

    /// Non-terminal sessions, oldest first.
    pub async fn active_sessions(&self) -> Vec<SupplySession> {
        let state = self.state.lock().await;
        let mut sessions: Vec<SupplySession> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn session(&self, id: &SessionId) -> Option<SupplySession> {
        self.state.lock().await.sessions.get(id).cloned()
    }

    /// Recently ended sessions, oldest first.
    pub async fn recent_sessions(&self) -> Vec<SupplySession> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn is_connected(&self, role: PeerRole, id: &str) -> bool {
        self.state.lock().await.channels.is_connected(role, id)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    async fn persist(&self) {
        let _serial = self.persist_lock.lock().await;
        let records = self.state.lock().await.records();
        let count = records.len();
        let repository = Arc::clone(&self.repository);
        match tokio::task::spawn_blocking(move || repository.save(&records)).await {
            Ok(Ok(())) => debug!("persisted {count} charging point record(s)"),
            Ok(Err(e)) => warn!("persisting charging points failed: {e}"),
            Err(e) => warn!("persistence task failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::channels::MemoryChannel;
    use crate::application::repository::{MockRepository, RepositoryError};

    fn record(id: &str) -> CpRecord {
        CpRecord {
            id: id.to_string(),
            location: "Calle Mayor 1".to_string(),
            price_per_kwh: 0.5,
            max_power: 22.0,
        }
    }

    fn disk_full() -> RepositoryError {
        RepositoryError::Io {
            path: "central_db.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        }
    }

    #[tokio::test]
    async fn test_loaded_records_start_disconnected() {
        // Arrange
        let mut repo = MockRepository::new();
        repo.expect_load().returning(|| Ok(vec![record("ALC1")]));

        // Act
        let coordinator = Coordinator::new(Arc::new(repo), CoordinatorSettings::default());
        let cp = coordinator.charging_point("ALC1").await.unwrap();

        // Assert
        assert_eq!(cp.status, CpStatus::Disconnected);
        assert_eq!(cp.health, HealthStatus::Ok);
        assert!((cp.price_per_kwh - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_load_starts_empty() {
        let mut repo = MockRepository::new();
        repo.expect_load().returning(|| Err(disk_full()));

        let coordinator = Coordinator::new(Arc::new(repo), CoordinatorSettings::default());

        assert!(coordinator.charging_points().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_persists_only_on_change() {
        // Arrange – create, then a no-op re-register, then a location change.
        let mut repo = MockRepository::new();
        repo.expect_load().returning(|| Ok(Vec::new()));
        repo.expect_save().times(2).returning(|_| Ok(()));
        let coordinator = Coordinator::new(Arc::new(repo), CoordinatorSettings::default());

        // Act
        coordinator.register_cp("ALC1", "Calle", None, None).await;
        coordinator.register_cp("ALC1", "Calle", None, None).await;
        let cp = coordinator.register_cp("ALC1", "Avenida", None, None).await;

        // Assert
        assert_eq!(cp.location, "Avenida");
    }

    #[tokio::test]
    async fn test_save_failure_does_not_block_protocol_path() {
        // Arrange
        let mut repo = MockRepository::new();
        repo.expect_load().returning(|| Ok(Vec::new()));
        repo.expect_save().returning(|_| Err(disk_full()));
        let coordinator = Coordinator::new(Arc::new(repo), CoordinatorSettings::default());
        let cp_channel = MemoryChannel::new();

        // Act
        let cp = coordinator.attach_cp_channel("NEW1", cp_channel).await;

        // Assert
        assert_eq!(cp.status, CpStatus::Available);
        assert_eq!(cp.location, PLACEHOLDER_LOCATION);
    }

    #[tokio::test]
    async fn test_saved_records_reflect_registration() {
        // Arrange
        let mut repo = MockRepository::new();
        repo.expect_load().returning(|| Ok(Vec::new()));
        repo.expect_save()
            .withf(|records| records.len() == 1 && records[0].id == "ALC1" && records[0].max_power == 50.0)
            .times(1)
            .returning(|_| Ok(()));
        let coordinator = Coordinator::new(Arc::new(repo), CoordinatorSettings::default());

        // Act
        let cp = coordinator.register_cp("ALC1", "", None, Some(50.0)).await;

        // Assert
        assert_eq!(cp.location, PLACEHOLDER_LOCATION);
        assert!((cp.price_per_kwh - 0.35).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        // Arrange
        let mut repo = MockRepository::new();
        repo.expect_load().returning(|| Ok(Vec::new()));
        repo.expect_save().returning(|_| Ok(()));
        let settings = CoordinatorSettings {
            session_history: 2,
            ..CoordinatorSettings::default()
        };
        let coordinator = Coordinator::new(Arc::new(repo), settings);
        coordinator.attach_cp_channel("ALC1", MemoryChannel::new()).await;
        coordinator.attach_driver_channel("D1", MemoryChannel::new()).await;

        // Act – three sessions, each rejected by the CP.
        for _ in 0..3 {
            let SupplyOutcome::Pending(id) = coordinator.request_supply("D1", "ALC1", None).await.unwrap() else {
                panic!("expected a pending session");
            };
            coordinator.cp_authorization_response(&id, false, None).await.unwrap();
        }

        // Assert
        let history = coordinator.recent_sessions().await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|s| s.state == SessionState::Denied));
    }
}
