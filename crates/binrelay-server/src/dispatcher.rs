//! Tool-call dispatcher for the disposal judgment tool.
//!
//! Each completed `log_disposal` call is acted on at most once: it is
//! recorded, schedules the actuator for after the current utterance, and
//! yields the events that acknowledge the call and ask the model to speak.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actuator::judgment_angle;
use crate::protocol::{self, JUDGMENT_TOOL, WRONG_ITEM};
use crate::state::{DisposalMark, SessionState, idempotency_key};
use crate::storage::{
    CHAT_SESSION_PATH, DEFAULT_USER_ID, IMAGE_SESSION_PATH, JudgmentStore, NewJudgment,
};

/// How long a record insert may take before the turn continues without it.
const STORE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Tool call has no call_id")]
    MissingCallId,

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),
}

/// Arguments of the judgment tool as the model sends them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JudgmentArgs {
    items: Value,
    pub result: String,
    pub rejection_reason: Option<String>,
    pub has_change: bool,
    pub message: Option<String>,
}

impl JudgmentArgs {
    /// Parse arguments, tolerating a stray `;` before the closing brace or
    /// at the end, and a trailing comma.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let mut cleaned = raw.trim();
        if let Some(stripped) = cleaned.strip_suffix(';') {
            cleaned = stripped;
        }
        let cleaned = cleaned.replace(";}", "}").replace(",}", "}");
        serde_json::from_str(&cleaned)
    }

    /// Item labels; the model may send one string or a list.
    pub fn items(&self) -> Vec<String> {
        match &self.items {
            Value::String(item) => vec![item.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == "OK"
    }

    pub fn is_wrong_item(&self) -> bool {
        self.rejection_reason.as_deref() == Some(WRONG_ITEM)
    }
}

/// A judgment that was acted on.
#[derive(Debug, Clone)]
pub struct Judged {
    pub judgment: NewJudgment,
    /// Whether the record store accepted the judgment.
    pub stored: bool,
    /// Angle scheduled for when the current utterance finishes.
    pub scheduled_angle: Option<u16>,
    /// Events to send upstream, in order.
    pub replies: Vec<Value>,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Not the judgment tool.
    Ignored,
    /// Already handled this exact call.
    Duplicate,
    Malformed(DispatchError),
    Handled(Box<Judged>),
}

pub struct ToolCallDispatcher {
    store: Option<Arc<dyn JudgmentStore>>,
    store_timeout: Duration,
}

impl ToolCallDispatcher {
    pub fn new(store: Option<Arc<dyn JudgmentStore>>) -> Self {
        Self {
            store,
            store_timeout: STORE_TIMEOUT,
        }
    }

    /// Act on a `response.function_call_arguments.done` event.
    pub async fn handle(&self, event: &Value, session: &Mutex<SessionState>) -> DispatchOutcome {
        let name = event.get("name").and_then(Value::as_str).unwrap_or_default();
        if name != JUDGMENT_TOOL {
            debug!(name, "Ignoring call to unknown tool");
            return DispatchOutcome::Ignored;
        }
        let Some(call_id) = event.get("call_id").and_then(Value::as_str) else {
            warn!("Judgment tool call without call_id, dropping");
            return DispatchOutcome::Malformed(DispatchError::MissingCallId);
        };
        let raw_args = event
            .get("arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        info!(call_id, "Function call: {}", name);

        let key = idempotency_key(call_id, raw_args);
        let image_pending = {
            let mut state = session.lock().await;
            if !state.processed_calls.insert(key.clone()) {
                info!(key = %key, "Duplicate function call, skipping");
                return DispatchOutcome::Duplicate;
            }
            state.image_pending()
        };

        let args = match JudgmentArgs::parse(raw_args) {
            Ok(args) => args,
            Err(e) => {
                warn!(call_id, error = %e, "Malformed judgment arguments, dropping");
                return DispatchOutcome::Malformed(e.into());
            }
        };

        let message = session.lock().await.resolve_message(args.message.clone());
        let judgment = NewJudgment {
            user_id: DEFAULT_USER_ID.to_string(),
            recorded_at: binrelay_core::db::unix_timestamp_millis(),
            image_path: if image_pending {
                IMAGE_SESSION_PATH
            } else {
                CHAT_SESSION_PATH
            }
            .to_string(),
            detected_items: args.items(),
            is_valid: args.is_ok(),
            rejection_reason: args.rejection_reason.clone(),
            has_change: args.has_change && image_pending,
            message: message.clone(),
        };

        let stored = self.persist(&judgment).await;
        let wrong_item = args.is_wrong_item();
        let scheduled_angle = (!wrong_item).then(|| judgment_angle(&args.result));

        {
            let mut state = session.lock().await;
            let mark = stored.then(|| DisposalMark {
                user_id: judgment.user_id.clone(),
                recorded_at: judgment.recorded_at,
                logged_at: Instant::now(),
            });
            state.mark_judged(Instant::now(), mark);
            if let Some(angle) = scheduled_angle {
                state.pending_angle = Some(angle);
            }
        }

        info!(
            items = ?judgment.detected_items,
            result = %args.result,
            rejection_reason = ?judgment.rejection_reason,
            has_change = judgment.has_change,
            message = ?judgment.message,
            image_path = %judgment.image_path,
            "Judgment result"
        );
        match scheduled_angle {
            Some(angle) => info!(angle, "Servo action scheduled for end of speech"),
            None => info!("Wrong item, no servo action and no speech"),
        }

        let mut replies = vec![protocol::tool_call_output(call_id)];
        if !wrong_item {
            replies.push(protocol::speak_instruction(message.as_deref()));
        }

        DispatchOutcome::Handled(Box::new(Judged {
            judgment,
            stored,
            scheduled_angle,
            replies,
        }))
    }

    async fn persist(&self, judgment: &NewJudgment) -> bool {
        let Some(store) = &self.store else {
            debug!("No record store configured, judgment not persisted");
            return false;
        };
        match tokio::time::timeout(self.store_timeout, store.record(judgment)).await {
            Ok(Ok(id)) => {
                info!(id, recorded_at = judgment.recorded_at, "Judgment saved");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to save judgment");
                false
            }
            Err(_) => {
                warn!("Timed out saving judgment");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::{CONVERSATION_ITEM_CREATE, RESPONSE_CREATE, event_type};
    use crate::state::TranscriptSnapshot;
    use crate::storage::JudgmentDatabase;

    fn call(call_id: &str, arguments: &str) -> Value {
        json!({
            "type": "response.function_call_arguments.done",
            "name": JUDGMENT_TOOL,
            "call_id": call_id,
            "arguments": arguments,
        })
    }

    async fn dispatcher_with_db() -> (ToolCallDispatcher, JudgmentDatabase) {
        let db = JudgmentDatabase::open_in_memory().await.unwrap();
        let store: Arc<dyn JudgmentStore> = Arc::new(db.clone());
        (ToolCallDispatcher::new(Some(store)), db)
    }

    fn handled(outcome: DispatchOutcome) -> Judged {
        match outcome {
            DispatchOutcome::Handled(judged) => *judged,
            other => panic!("expected handled call, got {other:?}"),
        }
    }

    #[test]
    fn parses_sloppy_arguments() {
        let args = JudgmentArgs::parse(r#"{"items":"PET bottle","result":"OK";}"#).unwrap();
        assert_eq!(args.items(), vec!["PET bottle"]);
        assert!(args.is_ok());

        let args = JudgmentArgs::parse(r#"{"items":["can","cup"],"result":"NG",};"#).unwrap();
        assert_eq!(args.items(), vec!["can", "cup"]);
        assert!(!args.is_ok());

        assert!(JudgmentArgs::parse("{not json").is_err());
    }

    #[tokio::test]
    async fn ok_verdict_records_and_schedules_accept() {
        let (dispatcher, db) = dispatcher_with_db().await;
        let session = Mutex::new(SessionState::default());
        session.lock().await.last_image_at = Some(Instant::now());

        let judged = handled(
            dispatcher
                .handle(
                    &call(
                        "call_1",
                        r#"{"items":"PET bottle","result":"OK","has_change":true,"message":"Great!"}"#,
                    ),
                    &session,
                )
                .await,
        );

        assert!(judged.stored);
        assert_eq!(judged.scheduled_angle, Some(45));
        assert_eq!(judged.judgment.image_path, IMAGE_SESSION_PATH);
        assert!(judged.judgment.has_change);
        assert_eq!(judged.replies.len(), 2);
        assert_eq!(event_type(&judged.replies[0]), CONVERSATION_ITEM_CREATE);
        assert_eq!(judged.replies[0]["item"]["call_id"], "call_1");
        assert_eq!(event_type(&judged.replies[1]), RESPONSE_CREATE);
        assert!(judged.replies[1]["response"]["instructions"]
            .as_str()
            .unwrap()
            .contains("Great!"));

        let state = session.lock().await;
        assert_eq!(state.pending_angle, Some(45));
        assert!(!state.image_pending());
        assert_eq!(
            state.last_disposal.as_ref().unwrap().recorded_at,
            judged.judgment.recorded_at
        );
        drop(state);

        let rows = db.recent_judgments(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message.as_deref(), Some("Great!"));
    }

    #[tokio::test]
    async fn ng_verdict_schedules_reject() {
        let (dispatcher, _db) = dispatcher_with_db().await;
        let session = Mutex::new(SessionState::default());
        let judged = handled(
            dispatcher
                .handle(
                    &call("c", r#"{"items":"can","result":"NG","rejection_reason":"garbage"}"#),
                    &session,
                )
                .await,
        );
        assert_eq!(judged.scheduled_angle, Some(135));
        assert_eq!(judged.replies.len(), 2);
    }

    #[tokio::test]
    async fn wrong_item_stays_silent_and_still() {
        let (dispatcher, _db) = dispatcher_with_db().await;
        let session = Mutex::new(SessionState::default());
        let judged = handled(
            dispatcher
                .handle(
                    &call(
                        "c",
                        r#"{"items":"nothing","result":"NG","rejection_reason":"wrong_item"}"#,
                    ),
                    &session,
                )
                .await,
        );
        assert_eq!(judged.scheduled_angle, None);
        assert_eq!(judged.replies.len(), 1);
        assert!(session.lock().await.pending_angle.is_none());
    }

    #[tokio::test]
    async fn duplicate_call_is_acted_on_once() {
        let (dispatcher, db) = dispatcher_with_db().await;
        let session = Mutex::new(SessionState::default());
        let event = call("dup", r#"{"items":"PET bottle","result":"OK"}"#);

        assert!(matches!(
            dispatcher.handle(&event, &session).await,
            DispatchOutcome::Handled(_)
        ));
        assert!(matches!(
            dispatcher.handle(&event, &session).await,
            DispatchOutcome::Duplicate
        ));
        assert_eq!(db.recent_judgments(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn change_flag_requires_pending_image() {
        let dispatcher = ToolCallDispatcher::new(None);
        let session = Mutex::new(SessionState::default());
        let judged = handled(
            dispatcher
                .handle(
                    &call("c", r#"{"items":"PET bottle","result":"OK","has_change":true}"#),
                    &session,
                )
                .await,
        );
        assert!(!judged.judgment.has_change);
        assert_eq!(judged.judgment.image_path, CHAT_SESSION_PATH);
        assert!(!judged.stored);
        assert!(session.lock().await.last_disposal.is_none());
    }

    #[tokio::test]
    async fn fresh_transcript_overrides_tool_message() {
        let dispatcher = ToolCallDispatcher::new(None);
        let session = Mutex::new(SessionState::default());
        {
            let mut state = session.lock().await;
            let now = Instant::now();
            state.last_image_at = Some(now);
            state.last_transcript = Some(TranscriptSnapshot {
                text: "What a lovely bottle".into(),
                at: now,
            });
        }
        let judged = handled(
            dispatcher
                .handle(
                    &call("c", r#"{"items":"PET bottle","result":"OK","message":"ok"}"#),
                    &session,
                )
                .await,
        );
        assert_eq!(
            judged.judgment.message.as_deref(),
            Some("What a lovely bottle")
        );
        assert!(session.lock().await.last_transcript.is_none());
    }

    #[tokio::test]
    async fn malformed_and_foreign_calls() {
        let dispatcher = ToolCallDispatcher::new(None);
        let session = Mutex::new(SessionState::default());

        assert!(matches!(
            dispatcher.handle(&call("c", "{broken"), &session).await,
            DispatchOutcome::Malformed(DispatchError::InvalidArguments(_))
        ));

        let foreign = json!({ "name": "other_tool", "call_id": "x", "arguments": "{}" });
        assert!(matches!(
            dispatcher.handle(&foreign, &session).await,
            DispatchOutcome::Ignored
        ));

        let no_id = json!({ "name": JUDGMENT_TOOL, "arguments": "{}" });
        assert!(matches!(
            dispatcher.handle(&no_id, &session).await,
            DispatchOutcome::Malformed(DispatchError::MissingCallId)
        ));
    }
}
