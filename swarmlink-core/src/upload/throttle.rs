//! Outbound rate limiting for uploads.
//!
//! A global token bucket caps total serving bandwidth, a bucket per session
//! caps each downloader, and a slot set caps how many sessions serve at once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use tokio::time::Instant;

use super::SessionKey;
use crate::config::UploadConfig;

/// Token bucket rate limiter for controlling bandwidth usage.
///
/// Tokens are added at a fixed rate and consumed when bytes are sent. Allows
/// bursts up to bucket capacity while maintaining the average rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: u64,
    /// Current number of tokens in the bucket
    tokens: u64,
    /// Tokens added per second
    refill_rate: u64,
    last_refill: Instant,
}

/// Errors that can occur during token bucket operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TokenBucketError {
    #[error("Insufficient tokens: requested {requested}, available {available}")]
    InsufficientTokens { requested: u64, available: u64 },
}

impl TokenBucket {
    /// Creates a full bucket. Zero capacity or rate is raised to one.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(1),
            last_refill: Instant::now(),
        }
    }

    /// Bucket sized from a sustained rate and a burst multiplier.
    pub fn with_burst(rate: u64, burst_multiplier: f64) -> Self {
        Self::new(burst_capacity(rate, burst_multiplier), rate)
    }

    /// Attempts to consume specified number of tokens.
    ///
    /// # Errors
    /// - `TokenBucketError::InsufficientTokens` - Requested tokens exceed available tokens
    pub fn try_consume(&mut self, tokens: u64) -> Result<(), TokenBucketError> {
        self.refill();

        if self.tokens >= tokens {
            self.tokens -= tokens;
            Ok(())
        } else {
            Err(TokenBucketError::InsufficientTokens {
                requested: tokens,
                available: self.tokens,
            })
        }
    }

    /// Returns current number of available tokens.
    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Adds tokens to bucket based on elapsed time since last refill.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed >= Duration::from_millis(1) {
            let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;

            if tokens_to_add > 0 {
                self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
                self.last_refill = now;
            }
        }
    }
}

/// Capacity of a bucket refilled at `rate` that may burst to `burst_multiplier` times it.
fn burst_capacity(rate: u64, burst_multiplier: f64) -> u64 {
    ((rate as f64 * burst_multiplier.max(1.0)) as u64).max(1)
}

/// Combined global, per-session, and slot limits.
#[derive(Debug)]
pub struct UploadThrottle {
    global: TokenBucket,
    sessions: HashMap<SessionKey, TokenBucket>,
    per_connection_rate: u64,
    burst_multiplier: f64,
    max_slots: usize,
}

impl UploadThrottle {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            global: TokenBucket::with_burst(config.global_rate_bps, config.burst_multiplier),
            sessions: HashMap::new(),
            per_connection_rate: config.per_connection_rate_bps,
            burst_multiplier: config.burst_multiplier,
            max_slots: config.max_serving_slots,
        }
    }

    /// Claims a serving slot for `key`. Returns false when all slots are taken.
    ///
    /// Claiming a slot the session already holds succeeds.
    pub fn try_open(&mut self, key: &SessionKey) -> bool {
        if self.sessions.contains_key(key) {
            return true;
        }
        if self.sessions.len() >= self.max_slots {
            return false;
        }
        self.sessions.insert(
            key.clone(),
            TokenBucket::with_burst(self.per_connection_rate, self.burst_multiplier),
        );
        true
    }

    /// Largest request a full session bucket and a full global bucket can
    /// both pay for. Anything longer could never be admitted.
    pub fn max_payable(&self) -> u64 {
        burst_capacity(self.per_connection_rate, self.burst_multiplier).min(self.global.capacity())
    }

    /// Takes tokens for `bytes` from both the session and the global bucket.
    ///
    /// Every byte is charged. Nothing is consumed unless both buckets can pay.
    ///
    /// # Errors
    /// - `TokenBucketError::InsufficientTokens` - Either bucket is short; the
    ///   error reports the tighter of the two
    pub fn try_acquire(&mut self, key: &SessionKey, bytes: u64) -> Result<(), TokenBucketError> {
        let session = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(TokenBucket::with_burst(
                self.per_connection_rate,
                self.burst_multiplier,
            )),
        };

        let session_available = session.available_tokens();
        let global_available = self.global.available_tokens();

        if session_available < bytes {
            return Err(TokenBucketError::InsufficientTokens {
                requested: bytes,
                available: session_available,
            });
        }
        if global_available < bytes {
            return Err(TokenBucketError::InsufficientTokens {
                requested: bytes,
                available: global_available,
            });
        }

        session.try_consume(bytes)?;
        self.global.try_consume(bytes)
    }

    /// Returns the slot held by `key`. Returns false if it held none.
    pub fn release(&mut self, key: &SessionKey) -> bool {
        self.sessions.remove(key).is_some()
    }

    pub fn active_slots(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.sessions.len() < self.max_slots
    }
}
