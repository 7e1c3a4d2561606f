//! Physical actuator: a line-oriented command channel and the servo logic
//! that drives it.

mod bridge;
mod servo;

use async_trait::async_trait;

pub use bridge::SubprocessBridge;
pub use servo::{NEUTRAL_ANGLE, ServoController, judgment_angle};

/// Errors delivering an actuator command.
#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("Actuator bridge is not running")]
    NotRunning,

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Accepts one JSON command per line.
#[async_trait]
pub trait ActuatorChannel: Send + Sync {
    async fn send_command(&self, line: String) -> Result<(), ActuatorError>;
}

/// In-process channel that records every command line.
pub mod memory {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ActuatorChannel, ActuatorError};

    pub struct MemoryActuator {
        tx: mpsc::UnboundedSender<String>,
    }

    impl MemoryActuator {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }
    }

    #[async_trait]
    impl ActuatorChannel for MemoryActuator {
        async fn send_command(&self, line: String) -> Result<(), ActuatorError> {
            self.tx.send(line).map_err(|_| ActuatorError::NotRunning)
        }
    }
}
