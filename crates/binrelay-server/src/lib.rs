//! binrelay Hub Library
//!
//! Core functionality for the relay hub:
//! - Terminal registry and the `/ws` socket surface
//! - Supervised upstream realtime session with reconnect and ordered queue
//! - Image intake, WAV recording and local playback
//! - Judgment tool-call dispatch, `SQLite` record store and actuator bridge

pub mod actuator;
pub mod audio;
pub mod dispatcher;
pub mod hub;
pub mod image;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;
pub mod storage;
pub mod subprocess;
pub mod upstream;
