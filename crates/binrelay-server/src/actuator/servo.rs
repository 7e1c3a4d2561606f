use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::ActuatorChannel;

/// Resting position of the lid.
pub const NEUTRAL_ANGLE: u16 = 90;
const ACCEPT_ANGLE: u16 = 45;
const REJECT_ANGLE: u16 = 135;

/// Angle for a verdict: accept for `OK`, reject for anything else.
pub fn judgment_angle(result: &str) -> u16 {
    if result == "OK" { ACCEPT_ANGLE } else { REJECT_ANGLE }
}

/// Moves the servo and returns it to neutral after `reset_delay`.
///
/// Without a channel every command is logged and skipped.
pub struct ServoController {
    channel: Option<Arc<dyn ActuatorChannel>>,
    reset_delay: Duration,
    pending_reset: Mutex<Option<JoinHandle<()>>>,
}

impl ServoController {
    pub fn new(channel: Option<Arc<dyn ActuatorChannel>>, reset_delay: Duration) -> Self {
        Self {
            channel,
            reset_delay,
            pending_reset: Mutex::new(None),
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    /// Send `{"angle": angle}`. A non-neutral angle schedules the return to
    /// neutral, replacing any reset still pending.
    pub async fn move_to(&self, angle: u16) {
        let Some(channel) = &self.channel else {
            warn!(angle, "Actuator bridge is not configured, skipping command");
            return;
        };

        info!(angle, "Sending servo command");
        if let Err(e) = send_angle(channel.as_ref(), angle).await {
            warn!(angle, error = %e, "Servo command failed");
            return;
        }
        if angle == NEUTRAL_ANGLE {
            return;
        }

        let channel = Arc::clone(channel);
        let delay = self.reset_delay;
        let reset = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Resetting servo to neutral");
            if let Err(e) = send_angle(channel.as_ref(), NEUTRAL_ANGLE).await {
                warn!(error = %e, "Servo reset failed");
            }
        });
        if let Ok(mut slot) = self.pending_reset.lock() {
            if let Some(previous) = slot.replace(reset) {
                previous.abort();
            }
        }
    }
}

async fn send_angle(channel: &dyn ActuatorChannel, angle: u16) -> Result<(), super::ActuatorError> {
    let line = serde_json::to_string(&json!({ "angle": angle }))?;
    channel.send_command(line).await
}
