//! Domain entities for EV-Central.
//!
//! Pure data and lifecycle rules with no I/O:
//!
//! - **`charging_point`** – a physical charger, its availability status and
//!   health, plus the persisted record and the read-only view sent to drivers.
//! - **`session`** – one energy-delivery episode between a driver and a CP,
//!   with its state machine and the reasons an authorization can be denied.

pub mod charging_point;
pub mod session;
