use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::idempotency::IdempotencyWindow;

/// Most recent assistant transcript and when it was last extended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSnapshot {
    pub text: String,
    pub at: Instant,
}

/// The last judgment written to the record store, kept so the finished
/// transcript can replace its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposalMark {
    pub user_id: String,
    pub recorded_at: i64,
    pub logged_at: Instant,
}

/// Session state shared by the intake and dispatch paths. Always accessed
/// through a single lock.
#[derive(Debug, Default)]
pub struct SessionState {
    pub last_image_at: Option<Instant>,
    pub last_judgment_at: Option<Instant>,
    /// Accumulating transcript text per upstream item id.
    transcripts: HashMap<String, String>,
    pub last_transcript: Option<TranscriptSnapshot>,
    pub processed_calls: IdempotencyWindow,
    pub last_disposal: Option<DisposalMark>,
    /// Angle to apply once the current utterance finishes.
    pub pending_angle: Option<u16>,
    /// Suppress the next terminal `response.create`.
    pub skip_next_response: bool,
    pub previous_image_digest: Option<[u8; 32]>,
}

impl SessionState {
    /// An image arrived that no judgment has covered yet.
    pub fn image_pending(&self) -> bool {
        match (self.last_image_at, self.last_judgment_at) {
            (Some(image), Some(judgment)) => image > judgment,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Fold a transcript event into the per-item map. A non-empty final
    /// transcript replaces the accumulated deltas; the entry is dropped once
    /// the item is done. Returns the item's current text.
    pub fn record_transcript(
        &mut self,
        item_id: Option<&str>,
        text: &str,
        done: bool,
        now: Instant,
    ) -> Option<String> {
        let current = match item_id {
            Some(id) => {
                let entry = self.transcripts.entry(id.to_string()).or_default();
                if done && !text.is_empty() {
                    entry.clear();
                }
                entry.push_str(text);
                let current = entry.clone();
                if done {
                    self.transcripts.remove(id);
                }
                current
            }
            None => text.to_string(),
        };

        if text.is_empty() {
            return None;
        }
        self.last_transcript = Some(TranscriptSnapshot {
            text: current.clone(),
            at: now,
        });
        Some(current)
    }

    /// Pending transcripts still being streamed.
    pub fn open_transcripts(&self) -> usize {
        self.transcripts.len()
    }

    /// The message to record for a judgment: the latest transcript if it was
    /// spoken at or after the last image, otherwise `fallback`.
    pub fn resolve_message(&self, fallback: Option<String>) -> Option<String> {
        match &self.last_transcript {
            Some(transcript)
                if self
                    .last_image_at
                    .is_none_or(|image_at| transcript.at >= image_at) =>
            {
                Some(transcript.text.clone())
            }
            _ => fallback,
        }
    }

    /// Mark a judgment as recorded at `now`.
    pub fn mark_judged(&mut self, now: Instant, disposal: Option<DisposalMark>) {
        self.last_judgment_at = Some(now);
        self.last_transcript = None;
        if disposal.is_some() {
            self.last_disposal = disposal;
        }
    }

    pub fn take_skip_next_response(&mut self) -> bool {
        std::mem::take(&mut self.skip_next_response)
    }

    pub fn take_pending_angle(&mut self) -> Option<u16> {
        self.pending_angle.take()
    }

    /// Take the last disposal if it was logged less than `window` ago. A
    /// record is patched at most once.
    pub fn take_patchable_disposal(&mut self, now: Instant, window: Duration) -> Option<DisposalMark> {
        let fresh = self
            .last_disposal
            .as_ref()
            .is_some_and(|mark| now.saturating_duration_since(mark.logged_at) < window);
        if fresh { self.last_disposal.take() } else { None }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn image_pending_compares_timestamps() {
        let mut state = SessionState::default();
        assert!(!state.image_pending());

        let t0 = Instant::now();
        state.last_image_at = Some(t0);
        assert!(state.image_pending());

        state.last_judgment_at = Some(t0 + Duration::from_secs(1));
        assert!(!state.image_pending());

        state.last_image_at = Some(t0 + Duration::from_secs(2));
        assert!(state.image_pending());
    }

    #[test]
    fn transcript_deltas_accumulate_and_done_replaces() {
        let mut state = SessionState::default();
        let now = Instant::now();

        state.record_transcript(Some("item_1"), "Nice ", false, now);
        let text = state.record_transcript(Some("item_1"), "bottle", false, now);
        assert_eq!(text.as_deref(), Some("Nice bottle"));
        assert_eq!(state.open_transcripts(), 1);

        let done = state.record_transcript(Some("item_1"), "Nice bottle!", true, now);
        assert_eq!(done.as_deref(), Some("Nice bottle!"));
        assert_eq!(state.open_transcripts(), 0);
        assert_eq!(state.last_transcript.as_ref().unwrap().text, "Nice bottle!");
    }

    #[test]
    fn empty_done_keeps_accumulated_text() {
        let mut state = SessionState::default();
        let now = Instant::now();
        state.record_transcript(Some("a"), "Hello", false, now);
        assert!(state.record_transcript(Some("a"), "", true, now).is_none());
        assert_eq!(state.last_transcript.as_ref().unwrap().text, "Hello");
        assert_eq!(state.open_transcripts(), 0);
    }

    #[test]
    fn resolve_message_prefers_fresh_transcript() {
        let mut state = SessionState::default();
        let t0 = Instant::now();
        state.last_image_at = Some(t0 + Duration::from_secs(5));
        state.last_transcript = Some(TranscriptSnapshot {
            text: "old words".into(),
            at: t0,
        });
        assert_eq!(
            state.resolve_message(Some("from tool".into())).as_deref(),
            Some("from tool")
        );

        state.last_transcript = Some(TranscriptSnapshot {
            text: "fresh words".into(),
            at: t0 + Duration::from_secs(5),
        });
        assert_eq!(
            state.resolve_message(Some("from tool".into())).as_deref(),
            Some("fresh words")
        );
    }

    #[test]
    fn disposal_is_patched_once_within_window() {
        let mut state = SessionState::default();
        let t0 = Instant::now();
        state.mark_judged(
            t0,
            Some(DisposalMark {
                user_id: "u".into(),
                recorded_at: 42,
                logged_at: t0,
            }),
        );

        let window = Duration::from_secs(10);
        assert!(state
            .take_patchable_disposal(t0 + Duration::from_secs(11), window)
            .is_none());
        let mark = state
            .take_patchable_disposal(t0 + Duration::from_secs(3), window)
            .unwrap();
        assert_eq!(mark.recorded_at, 42);
        assert!(state
            .take_patchable_disposal(t0 + Duration::from_secs(4), window)
            .is_none());
    }

    #[test]
    fn one_shot_flags_are_consumed() {
        let mut state = SessionState {
            skip_next_response: true,
            pending_angle: Some(45),
            ..SessionState::default()
        };
        assert!(state.take_skip_next_response());
        assert!(!state.take_skip_next_response());
        assert_eq!(state.take_pending_angle(), Some(45));
        assert_eq!(state.take_pending_angle(), None);
    }
}
