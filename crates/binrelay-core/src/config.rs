//! Hub configuration resolution.
//!
//! All domain knobs come from environment-style variables. Every value is
//! parsed with a safe fallback: a missing variable silently takes the default,
//! an unparsable one takes the default with a warning. Only the upstream
//! credential is mandatory.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::role::Role;

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-realtime-mini";
pub const DEFAULT_VOICE: &str = "verse";
pub const DEFAULT_LOCAL_PLAYER_CMD: &str = "aplay -q -t raw -f S16_LE -r 24000 -c 1";
/// Largest accepted base64 image payload (10 MiB of base64 text).
pub const DEFAULT_MAX_IMAGE_BASE64_BYTES: usize = 10 * 1024 * 1024;

/// Upstream realtime service settings.
#[derive(Clone)]
pub struct UpstreamSettings {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub base_url: String,
    pub vad_threshold: f64,
}

impl UpstreamSettings {
    /// Full connection URL including the model query parameter.
    pub fn url(&self) -> String {
        format!("{}?model={}", self.base_url, self.model)
    }
}

impl fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("base_url", &self.base_url)
            .field("vad_threshold", &self.vad_threshold)
            .finish()
    }
}

/// Reconnect budget for the upstream supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

/// Complete hub configuration.
#[derive(Clone)]
pub struct HubConfig {
    pub upstream: UpstreamSettings,
    /// Shared token terminals must present in the `token` query parameter.
    pub auth_token: String,
    /// Whether `auth_token` was generated because none was configured.
    pub auth_token_generated: bool,
    /// Role that owns the microphone and speaker.
    pub audio_endpoint: Role,
    /// Seconds terminals wait after motion before capturing (exposed via `/config`).
    pub detection_delay_secs: u64,
    /// Minimum seconds between captures (exposed via `/config`).
    pub image_interval_secs: u64,
    /// Delay before the actuator returns to neutral.
    pub servo_reset_delay: Duration,
    /// Actuator device id; the bridge is disabled when unset.
    pub actuator_device_id: Option<String>,
    /// Play AI audio through a local player instead of the audio endpoint.
    pub local_speaker: bool,
    pub local_player_cmd: String,
    pub reconnect: ReconnectSettings,
    pub speaking_clear_delay: Duration,
    pub transcript_patch_window: Duration,
    pub max_image_base64_bytes: usize,
    pub skip_unchanged_images: bool,
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("upstream", &self.upstream)
            .field("auth_token", &mask_token(&self.auth_token))
            .field("audio_endpoint", &self.audio_endpoint)
            .field("detection_delay_secs", &self.detection_delay_secs)
            .field("image_interval_secs", &self.image_interval_secs)
            .field("servo_reset_delay", &self.servo_reset_delay)
            .field("actuator_device_id", &self.actuator_device_id)
            .field("local_speaker", &self.local_speaker)
            .field("reconnect", &self.reconnect)
            .field("speaking_clear_delay", &self.speaking_clear_delay)
            .field("transcript_patch_window", &self.transcript_patch_window)
            .field("max_image_base64_bytes", &self.max_image_base64_bytes)
            .field("skip_unchanged_images", &self.skip_unchanged_images)
            .finish_non_exhaustive()
    }
}

impl HubConfig {
    /// Create a config with the given credential and every other value at
    /// its default. A fresh terminal token is generated.
    pub fn new(api_key: String) -> Self {
        Self {
            upstream: UpstreamSettings {
                api_key,
                model: DEFAULT_MODEL.to_string(),
                voice: DEFAULT_VOICE.to_string(),
                base_url: DEFAULT_REALTIME_URL.to_string(),
                vad_threshold: 0.9,
            },
            auth_token: generate_token(),
            auth_token_generated: true,
            audio_endpoint: Role::Bin,
            detection_delay_secs: 5,
            image_interval_secs: 15,
            servo_reset_delay: Duration::from_secs(3),
            actuator_device_id: None,
            local_speaker: false,
            local_player_cmd: DEFAULT_LOCAL_PLAYER_CMD.to_string(),
            reconnect: ReconnectSettings::default(),
            speaking_clear_delay: Duration::from_millis(200),
            transcript_patch_window: Duration::from_secs(10),
            max_image_base64_bytes: DEFAULT_MAX_IMAGE_BASE64_BYTES,
            skip_unchanged_images: false,
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Config("OPENAI_API_KEY is not set".into()))?;
        let mut config = Self::new(api_key);

        if let Some(model) = non_empty(&lookup, "REALTIME_MODEL") {
            config.upstream.model = model;
        }
        if let Some(voice) = non_empty(&lookup, "REALTIME_VOICE") {
            config.upstream.voice = voice;
        }
        if let Some(url) = non_empty(&lookup, "REALTIME_URL") {
            config.upstream.base_url = url;
        }
        config.upstream.vad_threshold = parse_or(&lookup, "VAD_THRESHOLD", 0.9);

        if let Some(token) = non_empty(&lookup, "WS_AUTH_TOKEN") {
            config.auth_token = token;
            config.auth_token_generated = false;
        }

        if let Some(raw) = lookup("AUDIO_ENDPOINT") {
            match raw.parse::<Role>() {
                Ok(role) => config.audio_endpoint = role,
                Err(_) => warn!(
                    value = %raw,
                    "AUDIO_ENDPOINT must be camera or ar, using camera"
                ),
            }
        }

        config.detection_delay_secs = parse_or(&lookup, "DETECTION_DELAY", 5);
        config.image_interval_secs = parse_or(&lookup, "IMAGE_INTERVAL", 15);
        config.servo_reset_delay =
            Duration::from_secs(parse_or(&lookup, "SERVO_RESET_DELAY", 3));
        config.actuator_device_id = non_empty(&lookup, "OBNIZ_ID");
        config.local_speaker = parse_flag(&lookup, "USE_LOCAL_SPEAKER");
        if let Some(cmd) = non_empty(&lookup, "LOCAL_PLAYER_CMD") {
            config.local_player_cmd = cmd;
        }

        config.reconnect = ReconnectSettings {
            base_delay: Duration::from_millis(parse_or(&lookup, "RECONNECT_BASE_DELAY_MS", 1000)),
            max_delay: Duration::from_millis(parse_or(&lookup, "RECONNECT_MAX_DELAY_MS", 60_000)),
            multiplier: 2.0,
            max_attempts: parse_or(&lookup, "MAX_RECONNECT_ATTEMPTS", 10),
        };
        config.speaking_clear_delay =
            Duration::from_millis(parse_or(&lookup, "SPEAKING_CLEAR_DELAY_MS", 200));
        config.transcript_patch_window =
            Duration::from_secs(parse_or(&lookup, "TRANSCRIPT_PATCH_WINDOW_SECS", 10));
        config.max_image_base64_bytes = parse_or(
            &lookup,
            "MAX_IMAGE_BASE64_BYTES",
            DEFAULT_MAX_IMAGE_BASE64_BYTES,
        );
        config.skip_unchanged_images = parse_flag(&lookup, "SKIP_UNCHANGED_IMAGES");

        Ok(config)
    }

    /// Terminal token with everything but the first and last four characters hidden.
    pub fn masked_token(&self) -> String {
        mask_token(&self.auth_token)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    raw.trim().parse().unwrap_or_else(|_| {
        warn!(key, value = %raw, "Invalid value, using default");
        default
    })
}

fn parse_flag<F>(lookup: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let result = HubConfig::from_lookup(lookup_from(&[]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn defaults_when_only_key_is_set() {
        let config = HubConfig::from_lookup(lookup_from(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.audio_endpoint, Role::Bin);
        assert_eq!(config.detection_delay_secs, 5);
        assert_eq!(config.image_interval_secs, 15);
        assert!((config.upstream.vad_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.reconnect, ReconnectSettings::default());
        assert_eq!(config.speaking_clear_delay, Duration::from_millis(200));
        assert_eq!(config.transcript_patch_window, Duration::from_secs(10));
        assert!(config.auth_token_generated);
        assert_eq!(config.auth_token.len(), 32);
        assert!(config.actuator_device_id.is_none());
        assert_eq!(
            config.upstream.url(),
            "wss://api.openai.com/v1/realtime?model=gpt-realtime-mini"
        );
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = HubConfig::from_lookup(lookup_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("DETECTION_DELAY", "soon"),
            ("VAD_THRESHOLD", "loud"),
            ("AUDIO_ENDPOINT", "speaker"),
            ("MAX_RECONNECT_ATTEMPTS", "-3"),
        ]))
        .unwrap();
        assert_eq!(config.detection_delay_secs, 5);
        assert!((config.upstream.vad_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.audio_endpoint, Role::Bin);
        assert_eq!(config.reconnect.max_attempts, 10);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = HubConfig::from_lookup(lookup_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("WS_AUTH_TOKEN", "secret-token-value"),
            ("AUDIO_ENDPOINT", "ar"),
            ("IMAGE_INTERVAL", "30"),
            ("OBNIZ_ID", "1234-5678"),
            ("USE_LOCAL_SPEAKER", "true"),
            ("SPEAKING_CLEAR_DELAY_MS", "500"),
        ]))
        .unwrap();
        assert_eq!(config.auth_token, "secret-token-value");
        assert!(!config.auth_token_generated);
        assert_eq!(config.audio_endpoint, Role::Assistant);
        assert_eq!(config.image_interval_secs, 30);
        assert_eq!(config.actuator_device_id.as_deref(), Some("1234-5678"));
        assert!(config.local_speaker);
        assert_eq!(config.speaking_clear_delay, Duration::from_millis(500));
    }

    #[test]
    fn token_masking_keeps_only_edges() {
        assert_eq!(mask_token("abcd1234efgh5678"), "abcd********5678");
        assert_eq!(mask_token("short"), "*****");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let mut config = HubConfig::new("sk-very-secret".into());
        config.auth_token = "abcd1234efgh5678".into();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(!rendered.contains("abcd1234efgh5678"));
    }
}
