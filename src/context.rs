//! Shared server state, passed explicitly to every subsystem.
//!
//! One `ServerContext` is built at startup and handed around as an `Arc`;
//! nothing in the server reads global state. It owns the static data store,
//! presence cache, zone manager, directory, auth, and UGC registries, plus
//! the table mapping each account to its single live connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::data::StaticDataStore;
use crate::net::auth::{RateLimiter, TokenRegistry};
use crate::net::protocol::ResumeInfo;
use crate::ugc::UgcRegistry;
use crate::util::ids::{make_entity_id, AccountId, EntityId, ZoneId};
use crate::zones::bounds::BoundsResolver;
use crate::zones::collision::BuildDiagnostics;
use crate::zones::directory::ZoneDirectory;
use crate::zones::manager::{SharedZone, ZoneManager};
use crate::zones::presence::PresenceCache;
use crate::zones::zone::{ConnTx, Entity};

/// Zone joined when a hello names none and presence has nothing to resume.
pub const DEFAULT_ZONE: &str = "world:na";

/// The live connection registered for an account. A newer connection for
/// the same account displaces the older one.
#[derive(Clone)]
pub struct ActiveConn {
    pub conn_id: Uuid,
    pub tx: ConnTx,
}

/// Result of placing a connecting player into a zone.
pub struct JoinResult {
    pub entity_id: EntityId,
    pub zone_id: ZoneId,
    pub zone: SharedZone,
    pub resume: ResumeInfo,
}

pub struct RemovedPlayer {
    pub entity_id: EntityId,
    pub zone_id: ZoneId,
    pub zone: SharedZone,
}

pub struct ServerContext {
    pub config: ServerConfig,
    pub data: StaticDataStore,
    pub bounds: Arc<BoundsResolver>,
    pub presence: Arc<PresenceCache>,
    pub diagnostics: Arc<BuildDiagnostics>,
    pub zones: ZoneManager,
    pub directory: ZoneDirectory,
    pub auth: TokenRegistry,
    pub ugc: UgcRegistry,
    conns: Mutex<HashMap<AccountId, ActiveConn>>,
    tick_count: AtomicU64,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        let data = StaticDataStore::new(&config.data_dir);
        let bounds = Arc::new(BoundsResolver::new(data.clone()));
        let presence = Arc::new(PresenceCache::new(config.resume_ttl_seconds));
        let diagnostics = Arc::new(BuildDiagnostics::default());
        let zones = ZoneManager::new(
            data.clone(),
            Arc::clone(&bounds),
            Arc::clone(&diagnostics),
            Arc::clone(&presence),
            config.aoi_cell_size_tiles,
            config.zone_idle_evict_seconds,
            DEFAULT_ZONE.to_string(),
        );
        let directory = ZoneDirectory::new(
            data.clone(),
            Arc::clone(&diagnostics),
            config.allow_world_level_teleport,
        );
        let ugc = UgcRegistry::new(
            config.ugc_max_width,
            config.ugc_max_height,
            config.ugc_mass_tolerance,
            RateLimiter::new(
                config.ugc_submit_rate_limit_per_min,
                config.ugc_submit_rate_window_ms,
            ),
        );
        Self {
            config,
            data,
            bounds,
            presence,
            diagnostics,
            zones,
            directory,
            auth: TokenRegistry::new(),
            ugc,
            conns: Mutex::new(HashMap::new()),
            tick_count: AtomicU64::new(0),
        }
    }

    /// First directory refresh and the always-on default zone.
    pub fn boot(&self, now_ms: u64) {
        let listed = self.directory.refresh(now_ms);
        self.zones.get_or_create(DEFAULT_ZONE);
        info!(zones_listed = listed, default_zone = DEFAULT_ZONE, "server context ready");
    }

    /// Next global tick id, shared across all zones.
    pub fn next_tick(&self) -> u64 {
        self.tick_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_tick(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Connection registry
    // -----------------------------------------------------------------------

    /// Register a connection for an account, returning the previous one if
    /// a different connection held the slot.
    pub fn register_conn(
        &self,
        account_id: &str,
        conn_id: Uuid,
        tx: ConnTx,
    ) -> Option<ActiveConn> {
        let mut conns = self.conns.lock();
        let previous = conns
            .get(account_id)
            .filter(|existing| existing.conn_id != conn_id)
            .cloned();
        conns.insert(account_id.to_string(), ActiveConn { conn_id, tx });
        previous
    }

    /// Drop the registration, but only if this connection still owns it. A
    /// replaced connection must not unregister its successor.
    pub fn unregister_conn(&self, account_id: &str, conn_id: Uuid) -> bool {
        let mut conns = self.conns.lock();
        match conns.get(account_id) {
            Some(existing) if existing.conn_id == conn_id => {
                conns.remove(account_id);
                true
            }
            _ => false,
        }
    }

    pub fn conn_count(&self) -> usize {
        self.conns.lock().len()
    }

    // -----------------------------------------------------------------------
    // Player lifecycle
    // -----------------------------------------------------------------------

    /// Place a connecting player: resume into the cached zone and position
    /// when presence allows it, otherwise a fresh join at the requested
    /// zone's spawn point.
    pub fn add_player_with_resume(
        &self,
        account_id: &str,
        display_name: &str,
        client_zone: &str,
        client_resume: bool,
        tx: Option<ConnTx>,
        now_ms: u64,
    ) -> JoinResult {
        let plan =
            self.presence
                .resolve_reconnect(account_id, client_zone, client_resume, now_ms);
        let mut entity = Entity::new(
            make_entity_id(),
            account_id.to_string(),
            display_name.to_string(),
            0,
            0,
        );
        let zone = self.zones.get_or_create(&plan.zone_id);
        let entity_id = match plan.restore.as_ref() {
            Some(restore) => {
                let bounds = self.bounds.load_bounds(&plan.zone_id);
                let (x, y) = bounds.clamp(restore.x, restore.y);
                entity.x = x;
                entity.y = y;
                entity.px = x as i64 * crate::zones::zone::TILE_SIZE;
                entity.py = y as i64 * crate::zones::zone::TILE_SIZE;
                entity.facing = restore.facing;
                entity.sprite_ref = restore.sprite_ref.clone();
                zone.lock().add_entity(entity, tx, now_ms)
            }
            None => zone.lock().add_conn(entity, tx, now_ms),
        };
        JoinResult {
            entity_id,
            zone_id: plan.zone_id,
            zone,
            resume: ResumeInfo {
                applied: plan.resume,
                reason: plan.reason,
            },
        }
    }

    /// Detach an account's entity from its zone and start the resume
    /// window. Returns the zone it left so the caller can notify peers.
    pub fn remove_player(&self, account_id: &str, now_ms: u64) -> Option<RemovedPlayer> {
        let (zone_id, zone) = self.zones.zone_for_account(account_id)?;
        let entity_id = {
            let mut guard = zone.lock();
            let entity_id = guard.entity_id_for_account(account_id)?;
            guard.remove_entity(&entity_id);
            entity_id
        };
        self.presence.mark_disconnected(account_id, now_ms);
        Some(RemovedPlayer {
            entity_id,
            zone_id,
            zone,
        })
    }

    pub fn zone_for_account(&self, account_id: &str) -> Option<(ZoneId, SharedZone)> {
        self.zones.zone_for_account(account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::Facing;
    use crate::zones::presence::ResumeReason;
    use tokio::sync::mpsc;

    const NOW: u64 = 100_000;

    fn context() -> ServerContext {
        let config = ServerConfig {
            data_dir: "/nonexistent/vantown-ctx-test".to_string(),
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(config);
        ctx.boot(NOW);
        ctx
    }

    #[test]
    fn test_boot_creates_default_zone() {
        let ctx = context();
        assert!(ctx.zones.get_zone(DEFAULT_ZONE).is_some());
    }

    #[test]
    fn test_fresh_join_lands_at_spawn() {
        let ctx = context();
        let join = ctx.add_player_with_resume("acct_a", "Ada", DEFAULT_ZONE, true, None, NOW);
        assert_eq!(join.zone_id, DEFAULT_ZONE);
        assert!(!join.resume.applied);
        assert_eq!(join.resume.reason, ResumeReason::NoPresence);
        let zone = join.zone.lock();
        let entity = zone.get_entity(&join.entity_id).unwrap();
        assert_eq!((entity.x, entity.y), zone.spawn());
        assert_eq!(entity.display_name, "Ada");
    }

    #[test]
    fn test_resume_restores_position_and_sprite() {
        let ctx = context();
        ctx.presence
            .update("acct_a", DEFAULT_ZONE, 42, 17, Facing::W, "ugc:acct_a:u0001", NOW);
        ctx.presence.mark_disconnected("acct_a", NOW);
        let join =
            ctx.add_player_with_resume("acct_a", "Ada", DEFAULT_ZONE, true, None, NOW + 1_000);
        assert!(join.resume.applied);
        assert_eq!(join.resume.reason, ResumeReason::WithinTtl);
        let zone = join.zone.lock();
        let entity = zone.get_entity(&join.entity_id).unwrap();
        assert_eq!((entity.x, entity.y), (42, 17));
        assert_eq!((entity.px, entity.py), (42 * 64, 17 * 64));
        assert_eq!(entity.facing, Facing::W);
        assert_eq!(entity.sprite_ref, "ugc:acct_a:u0001");
    }

    #[test]
    fn test_resume_clamps_cached_position_to_bounds() {
        let ctx = context();
        // fallback bounds are 200x120
        ctx.presence
            .update("acct_a", DEFAULT_ZONE, 5_000, -3, Facing::N, "base:van", NOW);
        let join = ctx.add_player_with_resume("acct_a", "Ada", DEFAULT_ZONE, true, None, NOW + 1);
        let zone = join.zone.lock();
        let entity = zone.get_entity(&join.entity_id).unwrap();
        assert_eq!((entity.x, entity.y), (199, 0));
    }

    #[test]
    fn test_resume_pulls_session_back_to_cached_zone() {
        let ctx = context();
        ctx.presence
            .update("acct_a", "level:level_sewer", 1, 1, Facing::S, "base:van", NOW);
        ctx.presence.mark_disconnected("acct_a", NOW);
        let join = ctx.add_player_with_resume("acct_a", "Ada", DEFAULT_ZONE, true, None, NOW + 1);
        assert_eq!(join.zone_id, "level:level_sewer");
        assert_eq!(join.resume.reason, ResumeReason::ZoneMismatchForcedTransfer);
    }

    #[test]
    fn test_remove_player_starts_resume_window() {
        let ctx = context();
        let join = ctx.add_player_with_resume("acct_a", "Ada", DEFAULT_ZONE, true, None, NOW);
        let removed = ctx.remove_player("acct_a", NOW + 10).unwrap();
        assert_eq!(removed.entity_id, join.entity_id);
        assert_eq!(removed.zone_id, DEFAULT_ZONE);
        assert_eq!(removed.zone.lock().player_count(), 0);
        let entry = ctx.presence.get("acct_a").unwrap();
        assert!(entry.disconnected_at_ms.is_some());
        assert!(ctx.remove_player("acct_a", NOW + 20).is_none());
    }

    #[test]
    fn test_register_conn_reports_displaced_connection() {
        let ctx = context();
        let (tx_old, _rx_old) = mpsc::unbounded_channel();
        let (tx_new, _rx_new) = mpsc::unbounded_channel();
        let old_id = Uuid::new_v4();
        let new_id = Uuid::new_v4();
        assert!(ctx.register_conn("acct_a", old_id, tx_old).is_none());
        let displaced = ctx.register_conn("acct_a", new_id, tx_new).unwrap();
        assert_eq!(displaced.conn_id, old_id);
        // the displaced connection can no longer unregister the account
        assert!(!ctx.unregister_conn("acct_a", old_id));
        assert!(ctx.unregister_conn("acct_a", new_id));
        assert_eq!(ctx.conn_count(), 0);
    }

    #[test]
    fn test_tick_counter_is_monotonic() {
        let ctx = context();
        assert_eq!(ctx.next_tick(), 1);
        assert_eq!(ctx.next_tick(), 2);
        assert_eq!(ctx.current_tick(), 2);
    }
}
