//! Identifier types and generators.
//!
//! Entities, accounts, and zones are addressed by strings on the wire, so the
//! aliases here are documentation more than enforcement. Entity ids are
//! server-generated and never reused within a process lifetime.

use rand::RngCore;

use crate::util::hex_string;

/// Server-generated per-connection entity id, e.g. `p_3fa9c012`.
pub type EntityId = String;

/// Stable account identity carried by auth token claims.
pub type AccountId = String;

/// Canonical zone id string, e.g. `world:na` or `region:na:town_01`.
pub type ZoneId = String;

/// Generate a fresh entity id: `p_` followed by 8 lowercase hex chars.
pub fn make_entity_id() -> EntityId {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("p_{}", hex_string(&bytes))
}
