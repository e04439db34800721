//! Storage infrastructure: configuration file and charging-point records.
//!
//! - **`config`** – TOML configuration with defaults for every field.
//! - **`json_repository`** – the on-disk `Repository` used in production.
//! - **`memory_repository`** – an in-process `Repository` for ephemeral runs
//!   and tests.

pub mod config;
pub mod json_repository;
pub mod memory_repository;

pub use json_repository::JsonFileRepository;
pub use memory_repository::MemoryRepository;
