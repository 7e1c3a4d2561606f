//! Terminal connection registry.

mod connection;

pub use connection::{TerminalConnection, TerminalRegistry};
