//! `binrelay` Core Library
//!
//! Shared functionality for the relay hub:
//! - Environment-driven hub configuration with safe fallbacks
//! - Terminal role definitions
//! - `SQLite` pool helpers and millisecond timestamps for the judgment store
//! - Common error types and tracing initialisation

pub mod config;
pub mod db;
pub mod error;
pub mod role;
pub mod tracing_init;

pub use config::HubConfig;
pub use error::{Error, Result};
pub use role::Role;
