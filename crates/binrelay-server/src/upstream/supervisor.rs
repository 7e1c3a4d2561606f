//! Supervisor owning the single upstream session.
//!
//! The supervisor runs one background task that connects, runs a send pump
//! and a receive pump for the lifetime of the connection, and reconnects with
//! exponential backoff when either pump fails. Once the failure budget is
//! spent it parks in `Exhausted` and never retries on its own.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ReconnectPolicy;
use super::error::UpstreamError;
use super::transport::{UpstreamConnector, UpstreamLink, UpstreamSink, UpstreamSource};

/// Queue depth at which a backlog warning is logged (and every multiple of it).
const QUEUE_HIGH_WATER: usize = 256;

/// Lifecycle of the upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry after `attempt` consecutive failures.
    Reconnecting { attempt: u32 },
    /// Retry budget spent. Only a process restart recovers.
    Exhausted,
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { .. } => f.write_str("reconnecting"),
            Self::Exhausted => f.write_str("exhausted"),
        }
    }
}

/// Receives every inbound upstream frame, in arrival order.
#[async_trait]
pub trait UpstreamHandler: Send + Sync + 'static {
    async fn on_upstream_message(&self, text: String);
}

struct OutboundQueue {
    tx: mpsc::UnboundedSender<String>,
    depth: Arc<AtomicUsize>,
}

pub struct UpstreamSupervisor {
    connector: Arc<dyn UpstreamConnector>,
    policy: ReconnectPolicy,
    /// Sent first on every fresh connection.
    init_message: String,
    /// Present only while `Connected`.
    outbound: Mutex<Option<OutboundQueue>>,
    state_tx: watch::Sender<UpstreamState>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl UpstreamSupervisor {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        policy: ReconnectPolicy,
        init_message: String,
    ) -> Self {
        let (state_tx, _) = watch::channel(UpstreamState::Disconnected);
        Self {
            connector,
            policy,
            init_message,
            outbound: Mutex::new(None),
            state_tx,
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> UpstreamState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpstreamState> {
        self.state_tx.subscribe()
    }

    /// Events waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.outbound
            .lock()
            .ok()
            .and_then(|q| q.as_ref().map(|q| q.depth.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// Queue `text` for delivery. Returns `false` and discards the event when
    /// no session is connected.
    pub fn submit(&self, text: String) -> bool {
        self.submit_all([text])
    }

    /// Queue several events back to back; nothing from other submitters can
    /// land between them. All are discarded when no session is connected.
    pub fn submit_all<I>(&self, texts: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let Ok(guard) = self.outbound.lock() else {
            return false;
        };
        let Some(queue) = guard.as_ref() else {
            debug!("Upstream not connected, discarding event");
            return false;
        };
        for text in texts {
            if queue.tx.send(text).is_err() {
                debug!("Outbound queue closed, discarding event");
                return false;
            }
            let depth = queue.depth.fetch_add(1, Ordering::Relaxed) + 1;
            if depth % QUEUE_HIGH_WATER == 0 {
                warn!(depth, "Upstream outbound queue is backing up");
            }
        }
        true
    }

    /// Start the supervisor task unless it is already running, exhausted or
    /// shut down. Returns whether a task was started.
    pub fn ensure_running(self: &Arc<Self>, handler: Arc<dyn UpstreamHandler>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self.state() == UpstreamState::Exhausted {
            warn!("Upstream reconnect budget exhausted, restart the process to reconnect");
            return false;
        }
        let Ok(mut slot) = self.task.lock() else {
            return false;
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(this.run(handler)));
        true
    }

    /// Stop the supervisor and wait for both pumps to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Upstream supervisor task failed");
            }
        }
    }

    async fn run(self: Arc<Self>, handler: Arc<dyn UpstreamHandler>) {
        let mut failures: u32 = 0;
        let mut dropped: usize = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if failures == 0 {
                self.set_state(UpstreamState::Connecting);
            }

            let connected = tokio::select! {
                result = self.connector.connect() => result,
                () = self.shutdown.cancelled() => break,
            };

            let outcome = match connected {
                Ok(link) => {
                    failures = 0;
                    dropped = 0;
                    let (outcome, leftover) = self.run_session(link, &handler).await;
                    dropped += leftover;
                    outcome
                }
                Err(e) => Err(e),
            };

            let Err(e) = outcome else {
                break;
            };
            if self.shutdown.is_cancelled() {
                break;
            }

            failures = failures.saturating_add(1);
            if !self.policy.should_retry(failures) {
                error!(
                    error = %e,
                    failures,
                    dropped,
                    "Upstream reconnect budget exhausted, discarding outbound queue"
                );
                self.set_state(UpstreamState::Exhausted);
                return;
            }

            let delay = self.policy.delay_for_attempt(failures);
            self.set_state(UpstreamState::Reconnecting { attempt: failures });
            warn!(error = %e, attempt = failures, delay_ms = delay.as_millis(), "Reconnecting upstream");

            tokio::select! {
                () = sleep(delay) => {}
                () = self.shutdown.cancelled() => break,
            }
        }

        info!("Upstream supervisor stopped");
        self.set_state(UpstreamState::Disconnected);
    }

    /// Run one connected session until a pump fails or shutdown. `Ok` means
    /// shutdown was requested. Also returns the number of events left
    /// undelivered in the queue.
    async fn run_session(
        &self,
        link: UpstreamLink,
        handler: &Arc<dyn UpstreamHandler>,
    ) -> (Result<(), UpstreamError>, usize) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        if tx.send(self.init_message.clone()).is_ok() {
            depth.fetch_add(1, Ordering::Relaxed);
        }
        self.attach(OutboundQueue {
            tx,
            depth: Arc::clone(&depth),
        });
        self.set_state(UpstreamState::Connected);
        info!("Upstream session established");

        let cancel = self.shutdown.child_token();
        let UpstreamLink { sink, source } = link;
        let send_task = tokio::spawn(send_pump(sink, rx, depth, cancel.clone()));
        let recv_task = tokio::spawn(receive_pump(source, Arc::clone(handler), cancel.clone()));
        let (send_joined, recv_joined) = tokio::join!(send_task, recv_task);

        self.detach();

        let (send_result, leftover) = match send_joined {
            Ok((mut rx, result)) => {
                rx.close();
                let mut leftover = 0;
                while rx.try_recv().is_ok() {
                    leftover += 1;
                }
                (result, leftover)
            }
            Err(e) => (Err(UpstreamError::PumpFailed(e.to_string())), 0),
        };
        let recv_result =
            recv_joined.unwrap_or_else(|e| Err(UpstreamError::PumpFailed(e.to_string())));

        if leftover > 0 {
            debug!(leftover, "Discarded undelivered upstream events");
        }
        if self.shutdown.is_cancelled() {
            return (Ok(()), leftover);
        }
        let outcome = match (recv_result, send_result) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Err(UpstreamError::Closed),
        };
        (outcome, leftover)
    }

    fn attach(&self, queue: OutboundQueue) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(queue);
        }
    }

    fn detach(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            slot.take();
        }
    }

    fn set_state(&self, state: UpstreamState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Upstream state changed");
        }
    }
}

async fn send_pump(
    mut sink: Box<dyn UpstreamSink>,
    mut rx: mpsc::UnboundedReceiver<String>,
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
) -> (mpsc::UnboundedReceiver<String>, Result<(), UpstreamError>) {
    let result = loop {
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            next = rx.recv() => match next {
                Some(text) => text,
                None => break Err(UpstreamError::QueueClosed),
            },
        };
        depth.fetch_sub(1, Ordering::Relaxed);
        tokio::select! {
            sent = sink.send_text(text) => {
                if let Err(e) = sent {
                    break Err(e);
                }
            }
            () = cancel.cancelled() => break Ok(()),
        }
    };
    if let Err(e) = &result {
        warn!(error = %e, "Upstream send pump failed");
    }
    cancel.cancel();
    sink.close().await;
    (rx, result)
}

async fn receive_pump(
    mut source: Box<dyn UpstreamSource>,
    handler: Arc<dyn UpstreamHandler>,
    cancel: CancellationToken,
) -> Result<(), UpstreamError> {
    let result = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            next = source.next_text() => match next {
                Some(Ok(text)) => handler.on_upstream_message(text).await,
                Some(Err(e)) => break Err(e),
                None => break Err(UpstreamError::Closed),
            },
        }
    };
    if let Err(e) = &result {
        warn!(error = %e, "Upstream receive pump stopped");
    }
    cancel.cancel();
    result
}
