//! Session tokens and per-key rate limiting.
//!
//! Tokens are opaque 32-byte random values held in memory; issuing them is
//! the embedder's job (a login flow sits in front of this server). The rate
//! limiter is a token bucket keyed by caller-chosen strings, used for
//! byte-heavy operations like sprite submission.

use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

use crate::util::ids::AccountId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub account_id: AccountId,
    pub display_name: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
}

/// In-memory token store. Tokens are random and unforgeable but do not
/// survive a restart.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: Mutex<HashMap<String, TokenClaims>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, account_id: &str, display_name: Option<&str>) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);
        self.tokens.lock().insert(
            token.clone(),
            TokenClaims {
                account_id: account_id.to_string(),
                display_name: display_name.map(str::to_string),
            },
        );
        token
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.tokens
            .lock()
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.lock().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Token bucket limiter: `max` operations per `refill_ms`, refilled
/// continuously. Callers pass explicit clocks so tests never sleep.
pub struct RateLimiter {
    max: u32,
    refill_ms: u64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(max: u32, refill_ms: u64) -> Self {
        Self {
            max: max.max(1),
            refill_ms: refill_ms.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`. On exhaustion returns how long until a
    /// token is available.
    pub fn consume(&self, key: &str, now_ms: u64) -> Result<(), u64> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.max as f64,
            last_refill_ms: now_ms,
        });
        let elapsed = now_ms.saturating_sub(bucket.last_refill_ms) as f64;
        let refill = elapsed / self.refill_ms as f64 * self.max as f64;
        bucket.tokens = (bucket.tokens + refill).min(self.max as f64);
        bucket.last_refill_ms = now_ms;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after = (deficit / self.max as f64 * self.refill_ms as f64).ceil() as u64;
            Err(retry_after.max(1))
        }
    }

    /// Drop buckets idle long enough to be full again.
    pub fn cleanup(&self, now_ms: u64) {
        let horizon = self.refill_ms.saturating_mul(2);
        self.buckets
            .lock()
            .retain(|_, b| now_ms.saturating_sub(b.last_refill_ms) < horizon);
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }
}
