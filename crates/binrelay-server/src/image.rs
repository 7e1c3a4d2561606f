//! Image intake: decode, persist and reframe bin-terminal snapshots.
//!
//! A terminal sends a `conversation.item.create` whose content carries an
//! `input_image` data URL. The accepted image is written to disk and the
//! event is rewritten so the model sees the empty-bin reference first, then
//! the new snapshot, then an instruction to call the judgment tool.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::JUDGMENT_TOOL;
use crate::state::SessionState;

const INPUT_IMAGE: &str = "input_image";
const INPUT_TEXT: &str = "input_text";

const REFERENCE_LABEL: &str = "[Reference image: the empty bin]";
const CURRENT_LABEL: &str = "[Current image]";

/// Errors rejecting an image event.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Image payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported image URL")]
    UnsupportedUrl,

    #[error("Invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Failed to persist image: {0}")]
    Persist(#[from] std::io::Error),
}

/// Result of running an event through the pipeline.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// Image accepted and persisted; forward the rewritten event.
    Accepted { event: Value, path: PathBuf },
    /// The event carried no image and is returned untouched.
    NoImage(Value),
    /// Identical to the previous snapshot; nothing to forward.
    Unchanged,
    /// Malformed or oversized; nothing to forward.
    Rejected(ImageError),
}

pub struct ImageIntake {
    save_dir: PathBuf,
    /// Data URL of the empty-bin reference, if one was loaded.
    reference: Option<String>,
    max_base64_bytes: usize,
    skip_unchanged: bool,
}

impl ImageIntake {
    pub const fn new(
        save_dir: PathBuf,
        reference: Option<String>,
        max_base64_bytes: usize,
        skip_unchanged: bool,
    ) -> Self {
        Self {
            save_dir,
            reference,
            max_base64_bytes,
            skip_unchanged,
        }
    }

    /// Read a JPEG from disk as a data URL for use as the reference image.
    pub async fn load_reference(path: &Path) -> Result<String, ImageError> {
        let bytes = tokio::fs::read(path).await?;
        info!(path = %path.display(), bytes = bytes.len(), "Loaded reference image");
        Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes)))
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub async fn process(&self, mut event: Value, session: &Mutex<SessionState>) -> IntakeOutcome {
        let Some(url) = last_image_url(&event) else {
            return IntakeOutcome::NoImage(event);
        };

        let (extension, payload) = match split_data_url(&url) {
            Some(parts) => parts,
            None => return IntakeOutcome::Rejected(ImageError::UnsupportedUrl),
        };
        if payload.len() > self.max_base64_bytes {
            warn!(
                size = payload.len(),
                max = self.max_base64_bytes,
                "Image payload too large, dropping"
            );
            return IntakeOutcome::Rejected(ImageError::TooLarge {
                size: payload.len(),
                max: self.max_base64_bytes,
            });
        }
        let bytes = match STANDARD.decode(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Image payload is not valid base64, dropping");
                return IntakeOutcome::Rejected(e.into());
            }
        };

        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        {
            let mut state = session.lock().await;
            if self.skip_unchanged && state.previous_image_digest == Some(digest) {
                state.skip_next_response = true;
                info!("Image unchanged since last snapshot, skipping");
                return IntakeOutcome::Unchanged;
            }
        }

        let path = match self.persist(&bytes, extension).await {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Failed to save image, dropping");
                return IntakeOutcome::Rejected(e.into());
            }
        };
        info!(path = %path.display(), bytes = bytes.len(), "Image saved");

        {
            // Only a saved image counts as the previous snapshot.
            let mut state = session.lock().await;
            state.previous_image_digest = Some(digest);
            state.last_image_at = Some(Instant::now());
        }

        if let Some(item) = event.get_mut("item") {
            item["content"] = Value::Array(self.judgment_content(url));
        }
        IntakeOutcome::Accepted { event, path }
    }

    async fn persist(&self, bytes: &[u8], extension: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.save_dir).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}_{}.{extension}",
            binrelay_core::db::unix_timestamp_millis(),
            &id[..8]
        );
        let path = self.save_dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    fn judgment_content(&self, current: String) -> Vec<Value> {
        let mut content = Vec::with_capacity(5);
        if let Some(reference) = &self.reference {
            content.push(json!({ "type": INPUT_TEXT, "text": REFERENCE_LABEL }));
            content.push(json!({ "type": INPUT_IMAGE, "image_url": reference }));
        } else {
            debug!("No reference image loaded, sending snapshot alone");
        }
        content.push(json!({ "type": INPUT_TEXT, "text": CURRENT_LABEL }));
        content.push(json!({ "type": INPUT_IMAGE, "image_url": current }));
        content.push(json!({
            "type": INPUT_TEXT,
            "text": format!(
                "Judge this image and always call {JUDGMENT_TOOL} before saying anything. \
                 Compare the reference image with the current image: if there is clearly no \
                 new waste (the bin is still empty), judge result='NG', \
                 rejection_reason='wrong_item'."
            ),
        }));
        content
    }
}

/// The last `input_image` URL in the event's content, if any.
fn last_image_url(event: &Value) -> Option<String> {
    event
        .get("item")?
        .get("content")?
        .as_array()?
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some(INPUT_IMAGE))
        .filter_map(|part| part.get("image_url").and_then(Value::as_str))
        .next_back()
        .map(str::to_owned)
}

/// Split `data:image/<kind>;base64,<payload>` into a file extension and the payload.
fn split_data_url(url: &str) -> Option<(&'static str, &str)> {
    let rest = url.strip_prefix("data:image/")?;
    let (kind, payload) = rest.split_once(";base64,")?;
    let extension = match kind.to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => "jpg",
        "png" => "png",
        "webp" => "webp",
        _ => return None,
    };
    Some((extension, payload))
}
