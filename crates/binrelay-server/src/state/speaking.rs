use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

const SPEAKING_BIT: u64 = 1;

/// Whether the assistant is currently speaking, with a delayed clear so
/// trailing audio packets are not mistaken for a new turn.
///
/// The flag lives in the low bit of a turn counter. Every `start` bumps the
/// counter, so a clear scheduled for an earlier turn can never land on a
/// later one, even if it wakes before it is aborted.
pub struct SpeakingState {
    turn: Arc<AtomicU64>,
    pending_clear: Mutex<Option<JoinHandle<()>>>,
    clear_delay: Duration,
}

impl SpeakingState {
    pub fn new(clear_delay: Duration) -> Self {
        Self {
            turn: Arc::new(AtomicU64::new(0)),
            pending_clear: Mutex::new(None),
            clear_delay,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.turn.load(Ordering::SeqCst) & SPEAKING_BIT != 0
    }

    /// Mark speech as started, cancelling any pending clear.
    pub fn start(&self) {
        if let Some(handle) = self.take_pending() {
            handle.abort();
        }
        let previous = self
            .turn
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.wrapping_add(2) | SPEAKING_BIT)
            })
            .unwrap_or_else(|v| v);
        if previous & SPEAKING_BIT == 0 {
            debug!("Speaking started");
        }
    }

    /// Schedule the flag to clear after the delay, replacing any earlier
    /// scheduled clear.
    pub fn stop(&self) {
        let turn = Arc::clone(&self.turn);
        let observed = turn.load(Ordering::SeqCst);
        let delay = self.clear_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if clear_if_current(&turn, observed) {
                debug!("Speaking cleared");
            }
        });
        if let Ok(mut slot) = self.pending_clear.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    fn take_pending(&self) -> Option<JoinHandle<()>> {
        self.pending_clear.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Clear the flag only if no `start` happened since `observed` was read.
fn clear_if_current(turn: &AtomicU64, observed: u64) -> bool {
    observed & SPEAKING_BIT != 0
        && turn
            .compare_exchange(
                observed,
                observed & !SPEAKING_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
}

impl Drop for SpeakingState {
    fn drop(&mut self) {
        if let Some(handle) = self.take_pending() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn clears_only_after_delay() {
        let state = SpeakingState::new(Duration::from_millis(200));
        state.start();
        assert!(state.is_speaking());

        state.stop();
        assert!(state.is_speaking());
        sleep(Duration::from_millis(150)).await;
        assert!(state.is_speaking());
        sleep(Duration::from_millis(100)).await;
        assert!(!state.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cancels_pending_clear() {
        let state = SpeakingState::new(Duration::from_millis(200));
        state.start();
        state.stop();
        sleep(Duration::from_millis(100)).await;
        state.start();
        sleep(Duration::from_millis(500)).await;
        assert!(state.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_stop_keeps_single_timer() {
        let state = SpeakingState::new(Duration::from_millis(200));
        state.start();
        state.stop();
        sleep(Duration::from_millis(150)).await;
        state.stop();
        sleep(Duration::from_millis(100)).await;
        assert!(state.is_speaking());
        sleep(Duration::from_millis(150)).await;
        assert!(!state.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_clear_does_not_end_a_newer_turn() {
        let state = SpeakingState::new(Duration::from_millis(200));
        state.start();
        let observed = state.turn.load(Ordering::SeqCst);
        state.stop();
        state.start();

        // The earlier turn's timer body running late must be a no-op.
        assert!(!clear_if_current(&state.turn, observed));
        assert!(state.is_speaking());
        sleep(Duration::from_millis(500)).await;
        assert!(state.is_speaking());
    }

    #[test]
    fn clear_is_a_no_op_when_already_silent() {
        let turn = AtomicU64::new(4);
        assert!(!clear_if_current(&turn, 4));
        assert_eq!(turn.load(Ordering::SeqCst), 4);
    }
}
