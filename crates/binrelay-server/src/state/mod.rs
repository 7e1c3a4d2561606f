//! Shared mutable hub state.

mod idempotency;
mod session;
mod speaking;

pub use idempotency::{IdempotencyWindow, PROCESSED_CALL_CAPACITY, idempotency_key};
pub use session::{DisposalMark, SessionState, TranscriptSnapshot};
pub use speaking::SpeakingState;
