//! Zone lifecycle: lazy creation, lookup, atomic transfer, idle eviction.
//!
//! Zones are created on first demand with bounds, spawn point, and an
//! immutable collision grid resolved from static data. A transfer detaches
//! the entity and its connection handle from the source zone before
//! attaching them to the destination, so no tick can observe the entity in
//! both.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::data::StaticDataStore;
use crate::util::ids::ZoneId;
use crate::zones::bounds::BoundsResolver;
use crate::zones::collision::{build_collision, BuildDiagnostics};
use crate::zones::presence::PresenceCache;
use crate::zones::zone::Zone;

pub type SharedZone = Arc<Mutex<Zone>>;

pub struct ZoneManager {
    data: StaticDataStore,
    bounds: Arc<BoundsResolver>,
    diagnostics: Arc<BuildDiagnostics>,
    presence: Arc<PresenceCache>,
    aoi_cell_size: i32,
    idle_evict_ms: u64,
    /// Zone that survives idle eviction even when empty.
    default_zone: ZoneId,
    zones: Mutex<HashMap<ZoneId, SharedZone>>,
    empty_since: Mutex<HashMap<ZoneId, u64>>,
}

impl ZoneManager {
    pub fn new(
        data: StaticDataStore,
        bounds: Arc<BoundsResolver>,
        diagnostics: Arc<BuildDiagnostics>,
        presence: Arc<PresenceCache>,
        aoi_cell_size: i32,
        idle_evict_seconds: u64,
        default_zone: ZoneId,
    ) -> Self {
        Self {
            data,
            bounds,
            diagnostics,
            presence,
            aoi_cell_size,
            idle_evict_ms: idle_evict_seconds * 1000,
            default_zone,
            zones: Mutex::new(HashMap::new()),
            empty_since: Mutex::new(HashMap::new()),
        }
    }

    fn build_zone(&self, zone_id: &str) -> Zone {
        let bounds = self.bounds.load_bounds(zone_id);
        let spawn = self.bounds.spawn(zone_id, bounds);
        let (grid, descriptor) =
            build_collision(zone_id, bounds.w, bounds.h, &self.data, &self.diagnostics);
        let zone = Zone::new(
            zone_id.to_string(),
            bounds,
            spawn,
            Arc::new(grid),
            descriptor,
            self.aoi_cell_size,
            Arc::clone(&self.presence),
        );
        info!(
            zone = zone_id,
            kind = zone.kind().as_str(),
            w = bounds.w,
            h = bounds.h,
            "zone created"
        );
        zone
    }

    pub fn get_zone(&self, zone_id: &str) -> Option<SharedZone> {
        self.zones.lock().get(zone_id).cloned()
    }

    pub fn get_or_create(&self, zone_id: &str) -> SharedZone {
        if let Some(zone) = self.get_zone(zone_id) {
            return zone;
        }
        // Built outside the map lock; a racing creator may win.
        let built = Arc::new(Mutex::new(self.build_zone(zone_id)));
        let mut zones = self.zones.lock();
        zones
            .entry(zone_id.to_string())
            .or_insert(built)
            .clone()
    }

    /// Tear a zone down, detaching every entity first.
    pub fn destroy_zone(&self, zone_id: &str) -> bool {
        let Some(zone) = self.zones.lock().remove(zone_id) else {
            return false;
        };
        self.empty_since.lock().remove(zone_id);
        let mut zone = zone.lock();
        let ids: Vec<_> = zone
            .build_snapshot_for()
            .into_iter()
            .map(|s| s.id)
            .collect();
        for id in ids {
            zone.remove_entity(&id);
        }
        info!(zone = zone_id, "zone destroyed");
        true
    }

    /// Linear scan for the zone currently holding an account's entity.
    pub fn zone_for_account(&self, account_id: &str) -> Option<(ZoneId, SharedZone)> {
        let zones: Vec<_> = self
            .zones
            .lock()
            .iter()
            .map(|(id, z)| (id.clone(), Arc::clone(z)))
            .collect();
        zones
            .into_iter()
            .find(|(_, zone)| zone.lock().has_account(account_id))
    }

    /// Move an entity between zones. The source releases the entity and its
    /// connection handle before the destination takes them; the entity lands
    /// at the destination spawn with input state reset.
    ///
    /// Returns the destination zone, or `None` when the source zone or the
    /// entity does not exist.
    pub fn transfer_entity(
        &self,
        from_zone_id: &str,
        entity_id: &str,
        to_zone_id: &str,
        now_ms: u64,
    ) -> Option<SharedZone> {
        let from_zone = self.get_zone(from_zone_id)?;
        let (entity, tx) = {
            let mut from = from_zone.lock();
            let tx = from.conn_tx(entity_id);
            let entity = from.remove_conn(entity_id)?;
            (entity, tx)
        };
        let to_zone = self.get_or_create(to_zone_id);
        to_zone.lock().add_conn(entity, tx, now_ms);
        debug!(
            entity = entity_id,
            from = from_zone_id,
            to = to_zone_id,
            "entity transferred"
        );
        Some(to_zone)
    }

    pub fn all_zones(&self) -> Vec<(ZoneId, SharedZone)> {
        self.zones
            .lock()
            .iter()
            .map(|(id, z)| (id.clone(), Arc::clone(z)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.zones.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.lock().is_empty()
    }

    /// Destroy zones that have sat empty past the grace window. The default
    /// zone is exempt. Returns the ids evicted.
    pub fn sweep_idle(&self, now_ms: u64) -> Vec<ZoneId> {
        let zones = self.all_zones();
        let mut evict = Vec::new();
        {
            let mut empty_since = self.empty_since.lock();
            for (id, zone) in &zones {
                if *id == self.default_zone {
                    continue;
                }
                if zone.lock().is_deserted() {
                    let since = *empty_since.entry(id.clone()).or_insert(now_ms);
                    if now_ms.saturating_sub(since) >= self.idle_evict_ms {
                        evict.push(id.clone());
                    }
                } else {
                    empty_since.remove(id);
                }
            }
        }
        for id in &evict {
            debug!(zone = %id, "evicting idle zone");
            self.destroy_zone(id);
        }
        evict
    }
}
