//! Bounded FIFO set of processed tool-call keys.

use std::collections::{HashSet, VecDeque};

use sha2::{Digest, Sha256};

/// Number of recent tool-call keys remembered.
pub const PROCESSED_CALL_CAPACITY: usize = 100;

/// Deterministic key for a tool invocation: the first 16 hex characters of
/// `sha256("{call_id}:{arguments}")`.
pub fn idempotency_key(call_id: &str, arguments: &str) -> String {
    let digest = Sha256::digest(format!("{call_id}:{arguments}").as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Insertion-ordered set that evicts its oldest entry once full.
#[derive(Debug)]
pub struct IdempotencyWindow {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl Default for IdempotencyWindow {
    fn default() -> Self {
        Self::with_capacity(PROCESSED_CALL_CAPACITY)
    }
}

impl IdempotencyWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
