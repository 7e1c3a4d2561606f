//! Transport seam between the supervisor and the wire.
//!
//! The supervisor only deals in text frames. `WsConnector` speaks the real
//! realtime WebSocket; `memory::MemoryConnector` is an in-process stand-in
//! driven by tests.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use super::error::UpstreamError;

/// Write half of an upstream connection.
#[async_trait]
pub trait UpstreamSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), UpstreamError>;

    async fn close(&mut self);
}

/// Read half of an upstream connection. `None` means the peer went away.
#[async_trait]
pub trait UpstreamSource: Send {
    async fn next_text(&mut self) -> Option<Result<String, UpstreamError>>;
}

/// An established connection, already split into its two halves.
pub struct UpstreamLink {
    pub sink: Box<dyn UpstreamSink>,
    pub source: Box<dyn UpstreamSource>,
}

/// Opens new upstream connections.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<UpstreamLink, UpstreamError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the realtime service over TLS WebSocket with a bearer credential.
pub struct WsConnector {
    url: String,
    api_key: String,
}

impl WsConnector {
    pub const fn new(url: String, api_key: String) -> Self {
        Self { url, api_key }
    }
}

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(&self) -> Result<UpstreamLink, UpstreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Connection(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| UpstreamError::Handshake(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| UpstreamError::Connection(e.to_string()))?;
        info!(status = %response.status(), "Upstream WebSocket connected");

        let (sink, source) = stream.split();
        Ok(UpstreamLink {
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: source }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl UpstreamSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), UpstreamError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!(error = %e, "Upstream close failed");
        }
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl UpstreamSource for WsSource {
    async fn next_text(&mut self) -> Option<Result<String, UpstreamError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => {
                    return Some(Ok(String::from_utf8_lossy(&data).into_owned()));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Upstream sent close frame");
                    return Some(Err(UpstreamError::Closed));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(UpstreamError::Transport(e.to_string()))),
            }
        }
    }
}

/// In-process transport with scripted connection outcomes.
pub mod memory {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::{UpstreamConnector, UpstreamLink, UpstreamSink, UpstreamSource};
    use crate::upstream::error::UpstreamError;

    enum Scripted {
        Fail,
        Session(UpstreamLink),
    }

    /// Connector that hands out pre-scripted outcomes in order. An empty
    /// script behaves like an unreachable service.
    #[derive(Default)]
    pub struct MemoryConnector {
        script: Mutex<VecDeque<Scripted>>,
        attempts: AtomicUsize,
    }

    impl MemoryConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next connection attempt fail.
        pub fn push_failure(&self) {
            self.push(Scripted::Fail);
        }

        /// Make the next connection attempt succeed; the returned peer plays
        /// the upstream service.
        pub fn push_session(&self) -> MemoryPeer {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            self.push(Scripted::Session(UpstreamLink {
                sink: Box::new(MemorySink { tx: outbound_tx }),
                source: Box::new(MemorySource { rx: inbound_rx }),
            }));
            MemoryPeer {
                sent: outbound_rx,
                inbound: inbound_tx,
            }
        }

        /// Number of `connect` calls made so far.
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn push(&self, outcome: Scripted) {
            if let Ok(mut script) = self.script.lock() {
                script.push_back(outcome);
            }
        }
    }

    #[async_trait]
    impl UpstreamConnector for MemoryConnector {
        async fn connect(&self) -> Result<UpstreamLink, UpstreamError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
            match next {
                Some(Scripted::Session(link)) => Ok(link),
                Some(Scripted::Fail) | None => {
                    Err(UpstreamError::Connection("scripted failure".into()))
                }
            }
        }
    }

    /// Upstream side of an in-memory session. Dropping it disconnects.
    pub struct MemoryPeer {
        sent: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::UnboundedSender<Result<String, UpstreamError>>,
    }

    impl MemoryPeer {
        /// Next frame the hub sent upstream, if the session is still open.
        pub async fn next_sent(&mut self) -> Option<String> {
            self.sent.recv().await
        }

        /// Next frame the hub sent upstream, parsed as JSON.
        pub async fn next_event(&mut self) -> Option<Value> {
            let text = self.next_sent().await?;
            serde_json::from_str(&text).ok()
        }

        /// Frames already sent, without waiting.
        pub fn drain_sent(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.sent.try_recv() {
                frames.push(frame);
            }
            frames
        }

        /// Deliver an event to the hub as if the service sent it.
        pub fn emit(&self, event: &Value) -> bool {
            self.emit_raw(event.to_string())
        }

        pub fn emit_raw(&self, text: String) -> bool {
            self.inbound.send(Ok(text)).is_ok()
        }

        /// Inject a transport fault.
        pub fn fail(&self) -> bool {
            self.inbound
                .send(Err(UpstreamError::Transport("injected fault".into())))
                .is_ok()
        }
    }

    struct MemorySink {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl UpstreamSink for MemorySink {
        async fn send_text(&mut self, text: String) -> Result<(), UpstreamError> {
            self.tx.send(text).map_err(|_| UpstreamError::Closed)
        }

        async fn close(&mut self) {}
    }

    struct MemorySource {
        rx: mpsc::UnboundedReceiver<Result<String, UpstreamError>>,
    }

    #[async_trait]
    impl UpstreamSource for MemorySource {
        async fn next_text(&mut self) -> Option<Result<String, UpstreamError>> {
            self.rx.recv().await
        }
    }
}
