//! In-memory registry binding each terminal role to its live connection.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use binrelay_core::Role;

/// Holds an active terminal connection.
pub struct TerminalConnection {
    /// Unique id so a stale socket cannot unregister its replacement.
    pub id: Uuid,
    pub role: Role,
    /// Sender feeding the socket's writer task.
    frame_tx: mpsc::Sender<String>,
    /// Cancelled when the connection is replaced or the hub shuts down.
    closed: CancellationToken,
}

impl TerminalConnection {
    pub fn new(role: Role, frame_tx: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            frame_tx,
            closed: CancellationToken::new(),
        }
    }

    /// Queue a text frame for the terminal.
    pub async fn send(&self, message: String) -> Result<(), mpsc::error::SendError<String>> {
        self.frame_tx.send(message).await
    }

    /// Ask the socket loops serving this connection to stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Thread-safe map of role to connection. At most one connection per role.
#[derive(Clone, Default)]
pub struct TerminalRegistry {
    connections: Arc<Mutex<HashMap<Role, Arc<TerminalConnection>>>>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn` to its role. Any previous connection for the role is
    /// closed and returned.
    pub async fn register(&self, conn: Arc<TerminalConnection>) -> Option<Arc<TerminalConnection>> {
        let role = conn.role;
        let id = conn.id;
        let previous = self.connections.lock().await.insert(role, conn);
        if let Some(old) = &previous {
            old.close();
            info!(role = %role, old_id = %old.id, new_id = %id, "Terminal connection replaced");
        } else {
            info!(role = %role, id = %id, "Terminal connection registered");
        }
        previous
    }

    /// Remove the mapping for `role` if it still points at connection `id`.
    pub async fn unregister(&self, role: Role, id: Uuid) -> bool {
        let mut connections = self.connections.lock().await;
        let matches = connections.get(&role).is_some_and(|c| c.id == id);
        if matches {
            connections.remove(&role);
        }
        drop(connections);

        if matches {
            info!(role = %role, id = %id, "Terminal connection unregistered");
        } else {
            debug!(role = %role, id = %id, "Ignoring unregister of superseded connection");
        }
        matches
    }

    pub async fn get(&self, role: Role) -> Option<Arc<TerminalConnection>> {
        self.connections.lock().await.get(&role).cloned()
    }

    pub async fn connected_roles(&self) -> Vec<Role> {
        self.connections.lock().await.keys().copied().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Send `message` to every registered terminal in parallel. Returns the
    /// number of terminals that accepted it.
    pub async fn broadcast(&self, message: &str) -> usize {
        let targets: Vec<Arc<TerminalConnection>> =
            self.connections.lock().await.values().cloned().collect();
        if targets.is_empty() {
            return 0;
        }

        let sends = targets.iter().map(|conn| async move {
            match conn.send(message.to_string()).await {
                Ok(()) => true,
                Err(_) => {
                    warn!(role = %conn.role, "Failed to broadcast to terminal");
                    false
                }
            }
        });
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }

    /// Best-effort unicast. A missing terminal is not an error.
    pub async fn send_to_role(&self, role: Role, message: &str) -> bool {
        let Some(conn) = self.get(role).await else {
            debug!(role = %role, "No terminal bound for role");
            return false;
        };
        if conn.send(message.to_string()).await.is_err() {
            warn!(role = %role, "Failed to send to terminal");
            return false;
        }
        true
    }

    /// Close every registered connection.
    pub async fn close_all(&self) {
        let targets: Vec<Arc<TerminalConnection>> =
            self.connections.lock().await.values().cloned().collect();
        for conn in targets {
            conn.close();
        }
    }
}
