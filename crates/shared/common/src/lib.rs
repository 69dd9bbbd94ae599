//! Common utilities shared by the unit-of-work crate and its binaries.
//!
//! This crate provides:
//! - Configuration value objects (DSN, pool sizing, migrations)
//! - Application-wide constants
//! - Tracing subscriber setup

pub mod config;
pub mod constants;
pub mod telemetry;

pub use config::*;
pub use constants::*;
