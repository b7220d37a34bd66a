//! Paired-credential pool.
//!
//! A user may register up to two API keys per provider; calls round-robin
//! between them, and a key that fails with an auth or quota error sits out a
//! cooldown window before being offered again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::LlmError;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct PoolState {
    next: usize,
    cooldown_until: Vec<Option<Instant>>,
}

/// Process-global key pool, shared behind an `Arc` by all provider clients.
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<String>,
    cooldown: Duration,
    state: Mutex<PoolState>,
}

impl KeyPool {
    pub fn new(keys: Vec<String>) -> Self {
        Self::with_cooldown(keys, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(keys: Vec<String>, cooldown: Duration) -> Self {
        let len = keys.len();
        Self {
            keys,
            cooldown,
            state: Mutex::new(PoolState {
                next: 0,
                cooldown_until: vec![None; len],
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Pick the next usable key, round-robin, skipping keys in cooldown.
    /// When every key is cooling down, the least-recently-penalized one is
    /// returned anyway so a transient quota blip cannot wedge the build.
    pub fn checkout(&self) -> Result<(usize, String), LlmError> {
        if self.keys.is_empty() {
            return Err(LlmError::NoKey);
        }
        let mut state = self.state.lock().expect("key pool lock");
        let now = Instant::now();
        let n = self.keys.len();

        for offset in 0..n {
            let idx = (state.next + offset) % n;
            let cooling = state.cooldown_until[idx].map(|t| t > now).unwrap_or(false);
            if !cooling {
                state.next = (idx + 1) % n;
                return Ok((idx, self.keys[idx].clone()));
            }
        }

        let idx = state
            .cooldown_until
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.unwrap_or(now))
            .map(|(i, _)| i)
            .unwrap_or(0);
        state.next = (idx + 1) % n;
        Ok((idx, self.keys[idx].clone()))
    }

    /// Put a key on cooldown after an auth/quota failure.
    pub fn report_failure(&self, idx: usize) {
        let mut state = self.state.lock().expect("key pool lock");
        if let Some(slot) = state.cooldown_until.get_mut(idx) {
            *slot = Some(Instant::now() + self.cooldown);
        }
    }
}
