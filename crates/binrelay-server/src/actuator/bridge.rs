use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::{ActuatorChannel, ActuatorError};
use crate::subprocess::{ManagedChild, SubprocessError};

/// Grace period for the bridge to exit after its stdin closes.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Drives the actuator through a `node <script> <device id>` subprocess
/// that reads one JSON command per stdin line.
pub struct SubprocessBridge {
    stdin_tx: Mutex<Option<mpsc::Sender<String>>>,
    child: ManagedChild,
}

impl SubprocessBridge {
    pub fn spawn(node: &str, script: &Path, device_id: &str) -> Result<Self, SubprocessError> {
        let args = vec![script.display().to_string(), device_id.to_string()];
        let (child, stdin) = ManagedChild::spawn("actuator-bridge", node, &args, TERMINATE_TIMEOUT)?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!("Failed to write to bridge stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!("Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("Failed to flush bridge stdin: {}", e);
                    break;
                }
            }
        });

        info!(device_id, "Actuator bridge started");
        Ok(Self {
            stdin_tx: Mutex::new(Some(stdin_tx)),
            child,
        })
    }

    pub async fn is_running(&self) -> bool {
        self.child.is_running().await
    }

    /// Close stdin so the bridge can exit, then wait (or kill).
    pub async fn terminate(&self) {
        if let Ok(mut tx) = self.stdin_tx.lock() {
            tx.take();
        }
        self.child.terminate().await;
        info!("Actuator bridge terminated");
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.stdin_tx.lock().ok().and_then(|tx| tx.clone())
    }
}

#[async_trait]
impl ActuatorChannel for SubprocessBridge {
    async fn send_command(&self, line: String) -> Result<(), ActuatorError> {
        if !self.child.is_running().await {
            return Err(ActuatorError::NotRunning);
        }
        let tx = self.sender().ok_or(ActuatorError::NotRunning)?;
        tx.send(line).await.map_err(|_| ActuatorError::NotRunning)
    }
}
