//! Presence cache: in-memory resume state keyed by account.
//!
//! Every authoritative position change refreshes an account's entry; on
//! disconnect the entry gets a resume deadline. A reconnect inside the
//! deadline resumes at the cached zone and position, otherwise the client
//! joins fresh. Not persisted.
//!
//! All methods take an explicit `now_ms` so deadline behavior is testable
//! without sleeping.

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::net::protocol::Facing;
use crate::util::ids::{AccountId, ZoneId};

/// How long after a disconnect a session may resume.
pub const RESUME_TTL_SECONDS: u64 = 30;

/// Why a reconnect resolved the way it did; sent verbatim in `hello_ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    ClientForcedFresh,
    NoPresence,
    TtlExpired,
    ZoneMismatchForcedTransfer,
    WithinTtl,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub zone_id: ZoneId,
    pub x: i32,
    pub y: i32,
    pub facing: Facing,
    pub sprite_ref: String,
    pub last_seen_at_ms: u64,
    pub disconnected_at_ms: Option<u64>,
    pub resume_until_ms: Option<u64>,
}

/// Where and how to (re)spawn a connecting account.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPlan {
    pub zone_id: ZoneId,
    pub resume: bool,
    pub reason: ResumeReason,
    /// Cached position and appearance, only on resume.
    pub restore: Option<RestoreState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreState {
    pub x: i32,
    pub y: i32,
    pub facing: Facing,
    pub sprite_ref: String,
}

pub struct PresenceCache {
    ttl_seconds: u64,
    entries: Mutex<HashMap<AccountId, PresenceEntry>>,
}

impl PresenceCache {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Record an authoritative position. Clears any disconnect state, so a
    /// live update always reads as connected.
    pub fn update(
        &self,
        account_id: &str,
        zone_id: &str,
        x: i32,
        y: i32,
        facing: Facing,
        sprite_ref: &str,
        now_ms: u64,
    ) {
        self.entries.lock().insert(
            account_id.to_string(),
            PresenceEntry {
                zone_id: zone_id.to_string(),
                x,
                y,
                facing,
                sprite_ref: sprite_ref.to_string(),
                last_seen_at_ms: now_ms,
                disconnected_at_ms: None,
                resume_until_ms: None,
            },
        );
    }

    /// Rewrite an entry to a zone's neutral state. Used when a connection
    /// dies between transfer begin and commit, where the entity never left
    /// the source zone.
    pub fn rewrite_zone(&self, account_id: &str, zone_id: &str, now_ms: u64) {
        self.update(account_id, zone_id, 0, 0, Facing::S, "base:van", now_ms);
    }

    /// Start the resume window for a disconnecting account.
    pub fn mark_disconnected(&self, account_id: &str, now_ms: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(account_id) {
            entry.disconnected_at_ms = Some(now_ms);
            entry.resume_until_ms = Some(now_ms + self.ttl_seconds * 1000);
        }
    }

    /// Decide where a reconnecting account lands.
    ///
    /// The client's requested zone only wins when there is nothing to
    /// resume; a live or in-TTL entry always pulls the session back to its
    /// cached zone.
    pub fn resolve_reconnect(
        &self,
        account_id: &str,
        client_zone: &str,
        client_resume: bool,
        now_ms: u64,
    ) -> ReconnectPlan {
        if !client_resume {
            return fresh(client_zone, ResumeReason::ClientForcedFresh);
        }
        let entries = self.entries.lock();
        let Some(entry) = entries.get(account_id) else {
            return fresh(client_zone, ResumeReason::NoPresence);
        };
        if let (Some(_), Some(deadline)) = (entry.disconnected_at_ms, entry.resume_until_ms) {
            if now_ms > deadline {
                return fresh(client_zone, ResumeReason::TtlExpired);
            }
        }
        let reason = if entry.zone_id != client_zone {
            ResumeReason::ZoneMismatchForcedTransfer
        } else {
            ResumeReason::WithinTtl
        };
        ReconnectPlan {
            zone_id: entry.zone_id.clone(),
            resume: true,
            reason,
            restore: Some(RestoreState {
                x: entry.x,
                y: entry.y,
                facing: entry.facing,
                sprite_ref: entry.sprite_ref.clone(),
            }),
        }
    }

    pub fn get(&self, account_id: &str) -> Option<PresenceEntry> {
        self.entries.lock().get(account_id).cloned()
    }

    pub fn remove(&self, account_id: &str) {
        self.entries.lock().remove(account_id);
    }

    /// Drop entries whose resume window has passed. Returns how many were
    /// removed.
    pub fn cleanup(&self, now_ms: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            match (entry.disconnected_at_ms, entry.resume_until_ms) {
                (Some(_), Some(deadline)) => now_ms <= deadline,
                _ => true,
            }
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn has(&self, account_id: &str) -> bool {
        self.entries.lock().contains_key(account_id)
    }
}

fn fresh(zone_id: &str, reason: ResumeReason) -> ReconnectPlan {
    ReconnectPlan {
        zone_id: zone_id.to_string(),
        resume: false,
        reason,
        restore: None,
    }
}
