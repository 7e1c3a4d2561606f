//! Data models for judgment storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User id recorded for judgments from the bin terminals.
pub const DEFAULT_USER_ID: &str = "webapp_user";
/// `image_path` when the judgment covered a freshly captured image.
pub const IMAGE_SESSION_PATH: &str = "webapp_session";
/// `image_path` when the judgment came from conversation alone.
pub const CHAT_SESSION_PATH: &str = "webapp_chat";

/// A judgment about to be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewJudgment {
    pub user_id: String,
    /// Unix milliseconds; also the key for later message patches.
    pub recorded_at: i64,
    pub image_path: String,
    pub detected_items: Vec<String>,
    pub is_valid: bool,
    pub rejection_reason: Option<String>,
    pub has_change: bool,
    pub message: Option<String>,
}

impl NewJudgment {
    /// The full result document stored alongside the columns.
    pub fn result_json(&self) -> Value {
        serde_json::json!({
            "detected_items": self.detected_items,
            "is_valid": self.is_valid,
            "rejection_reason": self.rejection_reason,
            "has_change": self.has_change,
            "message": self.message,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Judgment {
    pub id: i64,
    pub user_id: String,
    pub recorded_at: i64,
    pub image_path: String,
    /// JSON array of item labels.
    pub detected_items: String,
    pub is_valid: bool,
    pub rejection_reason: Option<String>,
    pub has_change: bool,
    pub message: Option<String>,
    pub raw_json: String,
}
