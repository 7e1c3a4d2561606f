//! Upstream connection error types.

/// Errors that can occur on the upstream session.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream closed the connection")]
    Closed,

    #[error("Outbound queue closed")]
    QueueClosed,

    #[error("Pump task failed: {0}")]
    PumpFailed(String),
}
