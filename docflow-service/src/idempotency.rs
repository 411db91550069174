//! Keyed duplicate-suppression store.
//!
//! At-least-once channels redeliver; every consumer claims its deterministic
//! message key here before doing work. A live claim means the work already
//! happened (or is happening) and the delivery must be acknowledged without
//! side effects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Concurrent claim store with per-entry expiry.
pub struct IdempotencyGuard {
    claims: DashMap<String, Instant>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            claims: DashMap::new(),
            ttl,
        }
    }

    /// Atomically claim a message id.
    ///
    /// Returns `true` if this call inserted the claim (caller proceeds),
    /// `false` if a live claim already existed (caller must skip). Expired
    /// claims are treated as absent and re-claimed in the same operation; the
    /// whole check-and-set happens under one shard lock, so concurrent
    /// callers cannot both win.
    pub fn try_claim(&self, message_id: &str) -> bool {
        let now = Instant::now();
        match self.claims.entry(message_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) >= self.ttl {
                    entry.insert(now);
                    true
                } else {
                    debug!(message_id = %message_id, "Duplicate delivery suppressed");
                    false
                }
            }
        }
    }

    /// Drop a claim so a redelivery can retry the work.
    ///
    /// Called when processing fails after the claim was taken; without this,
    /// the broker's redelivery would be absorbed as a duplicate and the
    /// message lost.
    pub fn release(&self, message_id: &str) {
        self.claims.remove(message_id);
    }

    /// Remove expired claims. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.claims.len();
        self.claims
            .retain(|_, claimed_at| now.duration_since(*claimed_at) < self.ttl);
        before - self.claims.len()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// Periodically sweep expired claims so the store stays bounded.
pub fn start_sweeper(
    guard: Arc<IdempotencyGuard>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = guard.sweep();
                    if removed > 0 {
                        info!(removed, remaining = guard.len(), "Swept expired idempotency claims");
                    }
                }
            }
        }
    });
}
