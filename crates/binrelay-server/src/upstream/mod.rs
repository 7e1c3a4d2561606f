//! Upstream realtime session: one supervised connection shared by every
//! terminal, with automatic reconnection and bounded retry.

pub mod config;
pub mod error;
pub mod supervisor;
pub mod transport;

pub use config::ReconnectPolicy;
pub use error::UpstreamError;
pub use supervisor::{UpstreamHandler, UpstreamState, UpstreamSupervisor};
pub use transport::{UpstreamConnector, UpstreamLink, UpstreamSink, UpstreamSource, WsConnector};
