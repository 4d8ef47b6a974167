//! Replay cache for credential nonces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::credential::NONCE_LEN;

type Seen = Mutex<HashMap<u64, Instant>>;

/// First 8 bytes of SHA-256(nonce), big-endian.
pub fn fingerprint(nonce: &[u8; NONCE_LEN]) -> u64 {
    let digest = Sha256::digest(nonce);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Accepts each nonce at most once inside the retention window.
///
/// Entries are keyed by an 8-byte fingerprint. A sweep removes entries older
/// than the retention window; [`NonceGuard::spawn`] runs it every
/// `retention / 2` on a background thread that exits once the guard is
/// dropped.
pub struct NonceGuard {
    seen: Arc<Seen>,
    retention: Duration,
}

impl NonceGuard {
    /// Guard without a background sweeper; callers drive [`NonceGuard::sweep`].
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    pub fn spawn(retention: Duration) -> std::io::Result<Self> {
        let guard = Self::new(retention);
        let weak = Arc::downgrade(&guard.seen);
        let interval = (retention / 2).max(Duration::from_millis(1));
        thread::Builder::new()
            .name("nonce-sweep".into())
            .spawn(move || sweep_loop(weak, retention, interval))?;
        Ok(guard)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// `true` the first time a nonce is seen, `false` for a replay.
    pub fn is_valid(&self, nonce: &[u8; NONCE_LEN]) -> bool {
        self.is_valid_at(nonce, Instant::now())
    }

    pub fn is_valid_at(&self, nonce: &[u8; NONCE_LEN], now: Instant) -> bool {
        let key = fingerprint(nonce);
        let mut seen = lock(&self.seen);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drops entries older than the retention window; returns how many.
    pub fn sweep_at(&self, now: Instant) -> usize {
        purge(&self.seen, self.retention, now)
    }

    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(seen: &Seen) -> MutexGuard<'_, HashMap<u64, Instant>> {
    seen.lock().unwrap_or_else(PoisonError::into_inner)
}

fn purge(seen: &Seen, retention: Duration, now: Instant) -> usize {
    let mut seen = lock(seen);
    let before = seen.len();
    seen.retain(|_, at| now.saturating_duration_since(*at) <= retention);
    before - seen.len()
}

fn sweep_loop(seen: Weak<Seen>, retention: Duration, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(seen) = seen.upgrade() else {
            break;
        };
        let removed = purge(&seen, retention, Instant::now());
        if removed > 0 {
            tracing::trace!(removed, "expired nonces swept");
        }
    }
}
