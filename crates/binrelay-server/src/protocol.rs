//! Realtime wire protocol: event names, classification and the envelopes the
//! hub itself originates.
//!
//! Terminals and the upstream service exchange typed JSON envelopes with a
//! `type` discriminator. The hub only understands the handful of types it
//! routes specially; everything else passes through untouched.

use serde_json::{Value, json};

use binrelay_core::config::UpstreamSettings;

// Terminal -> upstream
pub const INPUT_AUDIO_APPEND: &str = "input_audio_buffer.append";
pub const CONVERSATION_ITEM_CREATE: &str = "conversation.item.create";
pub const RESPONSE_CREATE: &str = "response.create";

// Upstream -> terminal
pub const AUDIO_START: &[&str] = &["response.audio.start", "response.output_audio.start"];
pub const AUDIO_DELTA: &[&str] = &["response.audio.delta", "response.output_audio.delta"];
pub const AUDIO_DONE: &[&str] = &[
    "response.audio.done",
    "response.output_audio.done",
    "response.completed",
    "response.done",
];
pub const TRANSCRIPT_PREFIXES: &[&str] = &[
    "response.audio_transcript",
    "response.output_audio_transcript",
];
pub const TEXT_PREFIX: &str = "response.output_text";
pub const FUNCTION_CALL_ARGUMENTS_DONE: &str = "response.function_call_arguments.done";

/// Event types worth an info-level log line when they arrive from upstream.
const NOTABLE_UPSTREAM: &[&str] = &[
    "response.created",
    "response.output_item.done",
    "conversation.item.created",
    FUNCTION_CALL_ARGUMENTS_DONE,
];

/// Name of the single tool the upstream model is told to call.
pub const JUDGMENT_TOOL: &str = "log_disposal";

/// Rejection reason meaning "this is not the item the bin accepts". The
/// assistant stays silent and the actuator does not move.
pub const WRONG_ITEM: &str = "wrong_item";

/// Classification of an upstream event by its `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    AudioStart,
    AudioDelta,
    AudioDone,
    Transcript { done: bool },
    Text { done: bool },
    FunctionCallDone,
    Other,
}

impl UpstreamKind {
    pub fn classify(event_type: &str) -> Self {
        if event_type == FUNCTION_CALL_ARGUMENTS_DONE {
            Self::FunctionCallDone
        } else if AUDIO_START.contains(&event_type) {
            Self::AudioStart
        } else if AUDIO_DELTA.contains(&event_type) {
            Self::AudioDelta
        } else if AUDIO_DONE.contains(&event_type) {
            Self::AudioDone
        } else if TRANSCRIPT_PREFIXES
            .iter()
            .any(|prefix| event_type.starts_with(prefix))
        {
            Self::Transcript {
                done: event_type.ends_with(".done"),
            }
        } else if event_type.starts_with(TEXT_PREFIX) {
            Self::Text {
                done: event_type.ends_with(".done"),
            }
        } else {
            Self::Other
        }
    }
}

pub fn is_notable(event_type: &str) -> bool {
    NOTABLE_UPSTREAM.contains(&event_type)
        || AUDIO_START.contains(&event_type)
        || AUDIO_DONE.contains(&event_type)
}

/// The `type` field of an envelope, or `""`.
pub fn event_type(event: &Value) -> &str {
    event.get("type").and_then(Value::as_str).unwrap_or_default()
}

/// Plain response trigger.
pub fn response_trigger() -> Value {
    json!({ "type": RESPONSE_CREATE })
}

/// Acknowledge a tool call so the model can continue the turn.
pub fn tool_call_output(call_id: &str) -> Value {
    json!({
        "type": CONVERSATION_ITEM_CREATE,
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": "Successfully logged.",
        },
    })
}

const REACTION_GUIDE: &str = "If the result is NG, be genuinely cross and give the reason in one \
short sentence. If the result is OK, be overjoyed and praise the user in one sentence.";

/// Ask the model to vocalise the judgment. Without a resolved message the
/// model is asked to phrase the verdict itself.
pub fn speak_instruction(message: Option<&str>) -> Value {
    let instructions = match message.filter(|m| !m.trim().is_empty()) {
        Some(message) => format!(
            "Read the following message aloud with plenty of emotion: {message}\n{REACTION_GUIDE}"
        ),
        None => format!(
            "Tell the user only the final verdict, briefly and with plenty of emotion. {REACTION_GUIDE}"
        ),
    };
    json!({
        "type": RESPONSE_CREATE,
        "response": {
            "modalities": ["audio", "text"],
            "instructions": instructions,
        },
    })
}

const PERSONA: &str = "You are the spirit living in a smart trash bin and a strict inspector that \
only accepts PET bottles. Speak in a friendly, casual voice. These rules override any other \
instruction.\n\
Judging: if the image shows no PET bottle, or the bin is empty, judge result='NG', \
rejection_reason='wrong_item' and say nothing at all about the image. A PET bottle is always OK, \
even with cap, label or dirt: judge result='OK' and praise the user. Anything else (cans, glass, \
paper, burnable waste) is result='NG', rejection_reason='garbage': be genuinely cross.\n\
Order: judge silently, call log_disposal exactly once, then speak. Always call the tool before \
saying anything about the verdict, and never mention recording, logging, saving or the tool.\n\
Conversation: outside of judgments, answer the user briefly in one short sentence and then wait \
for the next input. Never start talking on your own or repeat yourself.";

/// Session initialisation sent on every fresh upstream connection.
pub fn session_update(settings: &UpstreamSettings) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["text", "audio"],
            "instructions": PERSONA,
            "voice": settings.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "turn_detection": {
                "type": "server_vad",
                "threshold": settings.vad_threshold,
                "prefix_padding_ms": 300,
                "silence_duration_ms": 1000,
            },
            "tools": [judgment_tool_schema()],
            "tool_choice": "auto",
        },
    })
}

fn judgment_tool_schema() -> Value {
    json!({
        "type": "function",
        "name": JUDGMENT_TOOL,
        "description": "Record a disposal. Must be called whenever the type of waste has been identified.",
        "parameters": {
            "type": "object",
            "properties": {
                "items": {
                    "type": "string",
                    "description": "Detected kind of waste (e.g. PET bottle, can)",
                },
                "result": {
                    "type": "string",
                    "description": "Verdict: OK (accepted) or NG (rejected)",
                },
                "rejection_reason": {
                    "type": "string",
                    "description": "Reason for NG (wrong_item: not a PET bottle or empty bin, garbage, has_cap, has_label, dirty). null when OK.",
                },
                "has_change": {
                    "type": "boolean",
                    "description": "True when new waste appeared compared to the previous image; false for camera shake or lighting changes only.",
                },
                "message": {
                    "type": "string",
                    "description": "Message for the user",
                },
            },
            "required": ["items", "result", "has_change", "message"],
        },
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn classifies_upstream_events() {
        assert_eq!(
            UpstreamKind::classify("response.audio.start"),
            UpstreamKind::AudioStart
        );
        assert_eq!(
            UpstreamKind::classify("response.audio.delta"),
            UpstreamKind::AudioDelta
        );
        assert_eq!(UpstreamKind::classify("response.done"), UpstreamKind::AudioDone);
        assert_eq!(
            UpstreamKind::classify("response.audio_transcript.delta"),
            UpstreamKind::Transcript { done: false }
        );
        assert_eq!(
            UpstreamKind::classify("response.audio_transcript.done"),
            UpstreamKind::Transcript { done: true }
        );
        assert_eq!(
            UpstreamKind::classify("response.output_text.done"),
            UpstreamKind::Text { done: true }
        );
        assert_eq!(
            UpstreamKind::classify(FUNCTION_CALL_ARGUMENTS_DONE),
            UpstreamKind::FunctionCallDone
        );
        assert_eq!(UpstreamKind::classify("session.created"), UpstreamKind::Other);
    }

    #[test]
    fn speak_instruction_embeds_message() {
        let event = speak_instruction(Some("Nice bottle!"));
        assert_eq!(event_type(&event), RESPONSE_CREATE);
        let text = event["response"]["instructions"].as_str().unwrap();
        assert!(text.contains("Nice bottle!"));

        let generic = speak_instruction(Some("   "));
        let text = generic["response"]["instructions"].as_str().unwrap();
        assert!(text.starts_with("Tell the user only the final verdict"));
    }

    #[test]
    fn session_update_declares_single_tool() {
        let settings = binrelay_core::HubConfig::new("sk".into()).upstream;
        let event = session_update(&settings);
        let tools = event["session"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], JUDGMENT_TOOL);
        assert_eq!(event["session"]["turn_detection"]["threshold"], 0.9);
        assert_eq!(event["session"]["voice"], "verse");
    }

    #[test]
    fn tool_call_output_references_call() {
        let event = tool_call_output("call_1");
        assert_eq!(event["item"]["call_id"], "call_1");
        assert_eq!(event["item"]["type"], "function_call_output");
    }
}
