//! The relay hub: wires terminals, the upstream session and the
//! side effects (recording, judgments, actuator) together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use binrelay_core::{HubConfig, Role};

use crate::actuator::{ActuatorChannel, ServoController};
use crate::audio::{AudioRecorder, PlaybackSink};
use crate::dispatcher::{DispatchOutcome, ToolCallDispatcher};
use crate::image::{ImageIntake, IntakeOutcome};
use crate::protocol::{self, UpstreamKind};
use crate::registry::{TerminalConnection, TerminalRegistry};
use crate::state::{SessionState, SpeakingState};
use crate::storage::JudgmentStore;
use crate::upstream::{ReconnectPolicy, UpstreamConnector, UpstreamHandler, UpstreamState, UpstreamSupervisor};

/// Collaborators handed to the hub at startup.
pub struct HubDeps {
    pub connector: Arc<dyn UpstreamConnector>,
    pub store: Option<Arc<dyn JudgmentStore>>,
    pub actuator: Option<Arc<dyn ActuatorChannel>>,
    pub player: Option<Arc<dyn PlaybackSink>>,
    pub image_dir: PathBuf,
    pub audio_dir: PathBuf,
    /// Data URL of the empty-bin reference image.
    pub reference_image: Option<String>,
}

/// What happened to a terminal message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Queued for the upstream session.
    Forwarded,
    /// Accepted but the upstream session is not connected.
    Discarded,
    /// Consumed by the one-shot "skip next response" flag.
    Suppressed,
    /// Rejected by routing rules or as malformed.
    Dropped(&'static str),
}

pub struct RelayHub {
    registry: TerminalRegistry,
    supervisor: Arc<UpstreamSupervisor>,
    session: Mutex<SessionState>,
    speaking: SpeakingState,
    images: ImageIntake,
    audio: AudioRecorder,
    player: Option<Arc<dyn PlaybackSink>>,
    dispatcher: ToolCallDispatcher,
    servo: Arc<ServoController>,
    store: Option<Arc<dyn JudgmentStore>>,
    audio_endpoint: Role,
    patch_window: Duration,
}

impl RelayHub {
    pub fn new(config: &HubConfig, deps: HubDeps) -> Arc<Self> {
        let init_message = protocol::session_update(&config.upstream).to_string();
        let supervisor = Arc::new(UpstreamSupervisor::new(
            deps.connector,
            ReconnectPolicy::from(&config.reconnect),
            init_message,
        ));

        Arc::new(Self {
            registry: TerminalRegistry::new(),
            supervisor,
            session: Mutex::new(SessionState::default()),
            speaking: SpeakingState::new(config.speaking_clear_delay),
            images: ImageIntake::new(
                deps.image_dir,
                deps.reference_image,
                config.max_image_base64_bytes,
                config.skip_unchanged_images,
            ),
            audio: AudioRecorder::new(deps.audio_dir),
            player: deps.player,
            dispatcher: ToolCallDispatcher::new(deps.store.clone()),
            servo: Arc::new(ServoController::new(deps.actuator, config.servo_reset_delay)),
            store: deps.store,
            audio_endpoint: config.audio_endpoint,
            patch_window: config.transcript_patch_window,
        })
    }

    pub const fn registry(&self) -> &TerminalRegistry {
        &self.registry
    }

    pub fn upstream_state(&self) -> UpstreamState {
        self.supervisor.state()
    }

    pub fn subscribe_upstream(&self) -> tokio::sync::watch::Receiver<UpstreamState> {
        self.supervisor.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.is_speaking()
    }

    pub const fn session(&self) -> &Mutex<SessionState> {
        &self.session
    }

    /// Bind a terminal to its role and make sure the upstream session runs.
    pub async fn register_terminal(self: &Arc<Self>, conn: Arc<TerminalConnection>) {
        self.registry.register(conn).await;
        let handler: Arc<dyn UpstreamHandler> = Arc::clone(self) as Arc<dyn UpstreamHandler>;
        if self.supervisor.ensure_running(handler) {
            info!("Upstream supervisor started");
        }
    }

    pub async fn unregister_terminal(&self, role: Role, id: Uuid) -> bool {
        self.registry.unregister(role, id).await
    }

    /// Route one inbound terminal frame.
    pub async fn handle_terminal_message(&self, role: Role, text: String) -> Routed {
        let event: Value = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(role = %role, error = %e, "Invalid JSON from terminal");
                return Routed::Dropped("invalid json");
            }
        };

        match protocol::event_type(&event) {
            protocol::INPUT_AUDIO_APPEND => {
                if role != self.audio_endpoint {
                    return Routed::Dropped("not the audio endpoint");
                }
                if self.speaking.is_speaking() {
                    return Routed::Dropped("assistant is speaking");
                }
                self.forward([text])
            }
            protocol::CONVERSATION_ITEM_CREATE if role == Role::Bin => {
                match self.images.process(event, &self.session).await {
                    IntakeOutcome::Accepted { event, .. } => {
                        info!("Sending snapshot for judgment");
                        self.forward([event.to_string(), protocol::response_trigger().to_string()])
                    }
                    IntakeOutcome::NoImage(_) => self.forward([text]),
                    IntakeOutcome::Unchanged => Routed::Dropped("unchanged image"),
                    IntakeOutcome::Rejected(e) => {
                        debug!(error = %e, "Image event rejected");
                        Routed::Dropped("image rejected")
                    }
                }
            }
            protocol::RESPONSE_CREATE => {
                if self.session.lock().await.take_skip_next_response() {
                    debug!(role = %role, "Suppressing response trigger");
                    return Routed::Suppressed;
                }
                self.forward([text])
            }
            _ => self.forward([text]),
        }
    }

    fn forward<const N: usize>(&self, texts: [String; N]) -> Routed {
        if self.supervisor.submit_all(texts) {
            Routed::Forwarded
        } else {
            Routed::Discarded
        }
    }

    async fn handle_audio_delta(&self, event: &Value, raw: String) {
        let delta = event.get("delta").and_then(Value::as_str).unwrap_or_default();
        if !delta.is_empty() {
            let pcm = match STANDARD.decode(delta) {
                Ok(pcm) => pcm,
                Err(e) => {
                    warn!(error = %e, "Invalid base64 audio delta, dropping");
                    return;
                }
            };
            let item_id = event
                .get("item_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            self.audio.record_chunk(item_id, pcm.clone());

            if let Some(player) = &self.player {
                player.play(pcm);
                return;
            }
        }
        self.registry.send_to_role(self.audio_endpoint, &raw).await;
    }

    async fn handle_audio_done(&self, event: &Value) {
        self.speaking.stop();
        match event.get("item_id").and_then(Value::as_str) {
            Some(item_id) => {
                let total = self.audio.finish(item_id).unwrap_or(0);
                debug!(item_id, total_bytes = total, "Audio done");
            }
            None => {
                self.audio.finish_all();
            }
        }

        let pending = self.session.lock().await.take_pending_angle();
        if let Some(angle) = pending {
            info!(angle, "Executing pending servo action");
            let servo = Arc::clone(&self.servo);
            tokio::spawn(async move { servo.move_to(angle).await });
        }
    }

    async fn handle_transcript(&self, event: &Value, done: bool) {
        let text = ["transcript", "delta"]
            .iter()
            .filter_map(|field| event.get(*field).and_then(Value::as_str))
            .find(|t| !t.is_empty())
            .unwrap_or_default();
        let item_id = event.get("item_id").and_then(Value::as_str);

        let patch = {
            let mut state = self.session.lock().await;
            state.record_transcript(item_id, text, done, Instant::now());
            if done && !text.is_empty() {
                state.take_patchable_disposal(Instant::now(), self.patch_window)
            } else {
                None
            }
        };

        if done && !text.is_empty() {
            info!(item_id = ?item_id, text = %truncate(text, 200), "Transcript done");
        }

        if let (Some(mark), Some(store)) = (patch, &self.store) {
            let store = Arc::clone(store);
            let message = text.to_string();
            tokio::spawn(async move {
                match store
                    .patch_message(&mark.user_id, mark.recorded_at, &message)
                    .await
                {
                    Ok(true) => info!(recorded_at = mark.recorded_at, "Updated record with transcript"),
                    Ok(false) => debug!(recorded_at = mark.recorded_at, "No record to update"),
                    Err(e) => warn!(error = %e, "Failed to update record with transcript"),
                }
            });
        }
    }

    /// Stop the upstream session, close terminals and flush recordings.
    pub async fn shutdown(&self) {
        info!("Relay hub shutting down");
        self.registry.close_all().await;
        self.supervisor.shutdown().await;
        self.audio.flush().await;
        self.audio.finish_all();
    }
}

#[async_trait]
impl UpstreamHandler for RelayHub {
    async fn on_upstream_message(&self, text: String) {
        let event: Value = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Invalid JSON from upstream, dropping");
                return;
            }
        };
        let event_type = protocol::event_type(&event);
        if protocol::is_notable(event_type) {
            let item_id = event.get("item_id").and_then(Value::as_str);
            info!(event_type, item_id = ?item_id, "Upstream event");
        }

        match UpstreamKind::classify(event_type) {
            UpstreamKind::FunctionCallDone => {
                if let DispatchOutcome::Handled(judged) =
                    self.dispatcher.handle(&event, &self.session).await
                {
                    let replies = judged.replies.iter().map(Value::to_string);
                    if !self.supervisor.submit_all(replies) {
                        warn!("Upstream not connected, tool acknowledgement lost");
                    }
                }
            }
            UpstreamKind::Transcript { done } => self.handle_transcript(&event, done).await,
            UpstreamKind::Text { done } => {
                if done {
                    let text = ["text", "delta"]
                        .iter()
                        .find_map(|field| event.get(*field).and_then(Value::as_str))
                        .unwrap_or_default();
                    info!(event_type, text = %truncate(text, 200), "Text done");
                }
            }
            UpstreamKind::AudioStart => self.speaking.start(),
            UpstreamKind::AudioDelta => {
                // Deltas may arrive without a start event.
                self.speaking.start();
                self.handle_audio_delta(&event, text).await;
                return;
            }
            UpstreamKind::AudioDone => self.handle_audio_done(&event).await,
            UpstreamKind::Other => {}
        }

        self.registry.broadcast(&text).await;
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.replace('\n', "\\n").chars().take(max_chars).collect()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::upstream::transport::memory::MemoryConnector;

    struct Fixture {
        hub: Arc<RelayHub>,
        _dir: tempfile::TempDir,
    }

    fn fixture(connector: &Arc<MemoryConnector>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let connector: Arc<dyn UpstreamConnector> = connector.clone();
        let hub = RelayHub::new(
            &HubConfig::new("sk-test".into()),
            HubDeps {
                connector,
                store: None,
                actuator: None,
                player: None,
                image_dir: dir.path().join("images"),
                audio_dir: dir.path().join("audio"),
                reference_image: None,
            },
        );
        Fixture { hub, _dir: dir }
    }

    async fn terminal(hub: &Arc<RelayHub>, role: Role) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        hub.register_terminal(Arc::new(TerminalConnection::new(role, tx)))
            .await;
        rx
    }

    async fn connected(hub: &RelayHub) {
        hub.subscribe_upstream()
            .wait_for(|s| *s == UpstreamState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn audio_only_from_endpoint_role() {
        let connector = Arc::new(MemoryConnector::new());
        let _peer = connector.push_session();
        let f = fixture(&connector);
        let _bin = terminal(&f.hub, Role::Bin).await;
        connected(&f.hub).await;

        let append = json!({ "type": "input_audio_buffer.append", "audio": "AAAA" }).to_string();
        assert_eq!(
            f.hub.handle_terminal_message(Role::Assistant, append.clone()).await,
            Routed::Dropped("not the audio endpoint")
        );
        assert_eq!(
            f.hub.handle_terminal_message(Role::Bin, append).await,
            Routed::Forwarded
        );
    }

    #[tokio::test]
    async fn invalid_json_is_dropped() {
        let connector = Arc::new(MemoryConnector::new());
        let f = fixture(&connector);
        assert_eq!(
            f.hub
                .handle_terminal_message(Role::Bin, "{nope".into())
                .await,
            Routed::Dropped("invalid json")
        );
    }

    #[tokio::test]
    async fn messages_before_connect_are_discarded() {
        let connector = Arc::new(MemoryConnector::new());
        let f = fixture(&connector);
        let event = json!({ "type": "session.update" }).to_string();
        assert_eq!(
            f.hub.handle_terminal_message(Role::Assistant, event).await,
            Routed::Discarded
        );
    }

    #[tokio::test]
    async fn skip_flag_suppresses_one_response_trigger() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.push_session();
        let f = fixture(&connector);
        let _bin = terminal(&f.hub, Role::Bin).await;
        connected(&f.hub).await;
        peer.next_sent().await.unwrap();

        f.hub.session().lock().await.skip_next_response = true;
        let trigger = protocol::response_trigger().to_string();
        assert_eq!(
            f.hub.handle_terminal_message(Role::Bin, trigger.clone()).await,
            Routed::Suppressed
        );
        assert_eq!(
            f.hub.handle_terminal_message(Role::Bin, trigger.clone()).await,
            Routed::Forwarded
        );
        assert_eq!(peer.next_sent().await.unwrap(), trigger);
    }

    #[tokio::test]
    async fn assistant_image_events_pass_through_untouched() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.push_session();
        let f = fixture(&connector);
        let _ar = terminal(&f.hub, Role::Assistant).await;
        connected(&f.hub).await;
        peer.next_sent().await.unwrap();

        let event = json!({
            "type": "conversation.item.create",
            "item": { "content": [{ "type": "input_image", "image_url": "data:image/jpeg;base64,AAAA" }] },
        })
        .to_string();
        assert_eq!(
            f.hub.handle_terminal_message(Role::Assistant, event.clone()).await,
            Routed::Forwarded
        );
        assert_eq!(peer.next_sent().await.unwrap(), event);
    }

    #[tokio::test]
    async fn audio_deltas_go_only_to_endpoint() {
        let connector = Arc::new(MemoryConnector::new());
        let f = fixture(&connector);
        let mut bin = terminal(&f.hub, Role::Bin).await;
        let mut ar = terminal(&f.hub, Role::Assistant).await;

        let delta = json!({
            "type": "response.audio.delta",
            "item_id": "item_1",
            "delta": STANDARD.encode([0u8; 32]),
        })
        .to_string();
        f.hub.on_upstream_message(delta.clone()).await;

        assert_eq!(bin.recv().await.unwrap(), delta);
        assert!(ar.try_recv().is_err());
        assert_eq!(f.hub.audio.bytes_for("item_1"), Some(32));
    }

    #[tokio::test]
    async fn other_events_are_broadcast() {
        let connector = Arc::new(MemoryConnector::new());
        let f = fixture(&connector);
        let mut bin = terminal(&f.hub, Role::Bin).await;
        let mut ar = terminal(&f.hub, Role::Assistant).await;

        let event = json!({ "type": "response.created" }).to_string();
        f.hub.on_upstream_message(event.clone()).await;
        assert_eq!(bin.recv().await.unwrap(), event);
        assert_eq!(ar.recv().await.unwrap(), event);

        f.hub.on_upstream_message("not json".into()).await;
        assert!(bin.try_recv().is_err());
    }

    #[tokio::test]
    async fn transcripts_feed_session_state() {
        let connector = Arc::new(MemoryConnector::new());
        let f = fixture(&connector);
        let mut ar = terminal(&f.hub, Role::Assistant).await;

        for (kind, field, text) in [
            ("response.audio_transcript.delta", "delta", "Thank "),
            ("response.audio_transcript.delta", "delta", "you"),
            ("response.audio_transcript.done", "transcript", "Thank you!"),
        ] {
            let mut event = json!({ "type": kind, "item_id": "it" });
            event[field] = json!(text);
            f.hub.on_upstream_message(event.to_string()).await;
            ar.recv().await.unwrap();
        }

        let state = f.hub.session().lock().await;
        assert_eq!(state.last_transcript.as_ref().unwrap().text, "Thank you!");
        assert_eq!(state.open_transcripts(), 0);
    }
}
