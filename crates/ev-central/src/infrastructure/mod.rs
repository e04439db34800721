//! Infrastructure layer of the coordinator.
//!
//! Contains the OS-facing adapters: TCP transports, the stdin operator
//! console, and file-system storage.
//!
//! **Dependency rule**: this layer may depend on `application` and `ev_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod console;
pub mod network;
pub mod storage;
