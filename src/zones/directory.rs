//! Zone directory: the periodically rebuilt catalog of joinable zones.
//!
//! A refresh scans the static data directory and produces an immutable
//! snapshot: world entries (one per region file), region entries (one per
//! valid town), level entries (keyed on the id embedded in each level
//! file), plus the entrance tables that gate region-to-level transfers.
//! Lookups read whichever snapshot is current; a directory that has never
//! refreshed answers as if every zone were unknown.
//!
//! Authored-data problems are skipped with a warning logged once per
//! offending entry per process.

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{info, warn};

use crate::data::{as_tile_coord, StaticDataStore};
use crate::net::protocol::{ErrorCode, Facing};
use crate::util::ids::ZoneId;
use crate::zones::bounds::{rect_bounds, Bounds, FALLBACK_BOUNDS};
use crate::zones::collision::{build_collision, BuildDiagnostics, COLLISION_VER};
use crate::zones::id::{parse_zone_id, ParsedZoneId};

/// Seconds between directory refreshes, also advertised to clients as the
/// snapshot TTL.
pub const DIR_REFRESH_SEC: u64 = 60;

/// Collision identity carried by world and level entries so clients can
/// tell when a cached grid is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionSummary {
    pub ver: u32,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldEntry {
    pub id: ZoneId,
    pub bounds: Bounds,
    pub collision: CollisionSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionEntry {
    pub id: ZoneId,
    pub world: ZoneId,
    pub town_key: String,
    pub name: String,
    pub spawn: (i32, i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelEntry {
    pub id: ZoneId,
    pub bounds: Bounds,
    pub collision: CollisionSummary,
}

/// A tile a player must stand on to enter a level from a region.
#[derive(Debug, Clone, PartialEq)]
pub struct Entrance {
    pub x: i32,
    pub y: i32,
    pub facing: Option<Facing>,
}

#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    pub worlds: Vec<WorldEntry>,
    pub regions: Vec<RegionEntry>,
    pub levels: Vec<LevelEntry>,
    pub zone_set: HashSet<ZoneId>,
    /// region key -> destination level zone id -> entrance tiles.
    pub entrances: HashMap<String, HashMap<ZoneId, Vec<Entrance>>>,
    pub built_at_ms: u64,
}

impl DirectorySnapshot {
    pub fn zone_count(&self) -> usize {
        self.zone_set.len()
    }
}

/// A refused transfer, carrying the wire error code and message.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferDenied {
    pub code: ErrorCode,
    pub msg: String,
}

impl TransferDenied {
    fn invalid_zone(msg: &str) -> Self {
        Self {
            code: ErrorCode::TransferInvalidZone,
            msg: msg.to_string(),
        }
    }

    fn failed(msg: &str) -> Self {
        Self {
            code: ErrorCode::TransferFailed,
            msg: msg.to_string(),
        }
    }
}

pub struct ZoneDirectory {
    data: StaticDataStore,
    diagnostics: Arc<BuildDiagnostics>,
    allow_world_level_teleport: bool,
    snapshot: RwLock<Option<Arc<DirectorySnapshot>>>,
    warned: Mutex<HashSet<String>>,
}

impl ZoneDirectory {
    pub fn new(
        data: StaticDataStore,
        diagnostics: Arc<BuildDiagnostics>,
        allow_world_level_teleport: bool,
    ) -> Self {
        Self {
            data,
            diagnostics,
            allow_world_level_teleport,
            snapshot: RwLock::new(None),
            warned: Mutex::new(HashSet::new()),
        }
    }

    fn warn_once(&self, key: String, what: &str) {
        if self.warned.lock().insert(key.clone()) {
            warn!(entry = %key, "{what}, skipping directory entry");
        }
    }

    /// Rebuild the snapshot from disk. Returns the number of zones listed.
    pub fn refresh(&self, now_ms: u64) -> usize {
        let snapshot = self.build_snapshot(now_ms);
        let count = snapshot.zone_count();
        info!(
            worlds = snapshot.worlds.len(),
            regions = snapshot.regions.len(),
            levels = snapshot.levels.len(),
            "zone directory refreshed"
        );
        *self.snapshot.write() = Some(Arc::new(snapshot));
        count
    }

    pub fn snapshot(&self) -> Option<Arc<DirectorySnapshot>> {
        self.snapshot.read().clone()
    }

    /// False until the first refresh completes.
    pub fn exists(&self, zone_id: &str) -> bool {
        self.snapshot()
            .map_or(false, |s| s.zone_set.contains(zone_id))
    }

    #[cfg(test)]
    pub fn inject_snapshot(&self, snapshot: DirectorySnapshot) {
        *self.snapshot.write() = Some(Arc::new(snapshot));
    }

    fn build_snapshot(&self, now_ms: u64) -> DirectorySnapshot {
        let mut snap = DirectorySnapshot {
            built_at_ms: now_ms,
            ..Default::default()
        };
        let mut region_files: Vec<(String, crate::data::RegionData)> = Vec::new();
        for region_key in self.data.list_region_keys() {
            let Some(region) = self.data.read_region(&region_key) else {
                self.warn_once(format!("region:{region_key}"), "region file unreadable");
                continue;
            };
            self.add_world_and_towns(&mut snap, &region_key, &region);
            region_files.push((region_key, region));
        }
        for file_name in self.data.list_level_files() {
            self.add_level(&mut snap, &file_name);
        }
        // Entrances resolve against the full zone set, so this pass runs
        // after every level entry is in.
        for (region_key, region) in &region_files {
            self.add_entrances(&mut snap, region_key, region);
        }
        snap
    }

    fn add_world_and_towns(
        &self,
        snap: &mut DirectorySnapshot,
        region_key: &str,
        region: &crate::data::RegionData,
    ) {
        let bounds = region
            .terrain_grid
            .as_deref()
            .and_then(rect_bounds)
            .unwrap_or(FALLBACK_BOUNDS);
        let world_id = format!("world:{region_key}");
        let (_, descriptor) = build_collision(
            &world_id,
            bounds.w,
            bounds.h,
            &self.data,
            &self.diagnostics,
        );
        snap.zone_set.insert(world_id.clone());
        snap.worlds.push(WorldEntry {
            id: world_id.clone(),
            bounds,
            collision: CollisionSummary {
                ver: COLLISION_VER,
                hash: descriptor.hash,
            },
        });
        for town in region.towns.as_deref().unwrap_or(&[]) {
            let Some(town_key) = town.id.as_deref().filter(|id| is_simple_key(id)) else {
                self.warn_once(
                    format!("{region_key}:{:?}", town.id),
                    "invalid town key",
                );
                continue;
            };
            let (Some(x), Some(y)) = (as_tile_coord(town.x), as_tile_coord(town.y)) else {
                self.warn_once(
                    format!("{region_key}:{town_key}"),
                    "town anchor not an integer tile",
                );
                continue;
            };
            let (x, y) = bounds.clamp(x, y);
            let name = town
                .label
                .as_deref()
                .or(town.name.as_deref())
                .unwrap_or(town_key)
                .to_string();
            let region_id = format!("region:{region_key}:{town_key}");
            snap.zone_set.insert(region_id.clone());
            snap.regions.push(RegionEntry {
                id: region_id,
                world: world_id.clone(),
                town_key: town_key.to_string(),
                name,
                spawn: (x, y),
            });
        }
    }

    fn add_level(&self, snap: &mut DirectorySnapshot, file_name: &str) {
        let Some(level) = self.data.read_level_file(file_name) else {
            self.warn_once(format!("level:{file_name}"), "level file unreadable");
            return;
        };
        // Levels are keyed on the embedded id, not the file name.
        let Some(level_key) = level.id.as_deref().filter(|id| is_simple_key(id)) else {
            self.warn_once(format!("level:{file_name}"), "missing or invalid level id");
            return;
        };
        let Some(bounds) = level.tilemap.as_deref().and_then(rect_bounds) else {
            self.warn_once(format!("level:{level_key}"), "tilemap not rectangular");
            return;
        };
        let spawn = level.spawns.as_ref().and_then(|s| s.player.as_ref());
        let spawn_tile = spawn.and_then(|p| {
            Some((as_tile_coord(p.x)?, as_tile_coord(p.y)?))
        });
        match spawn_tile {
            Some((x, y)) if bounds.contains(x, y) => {}
            _ => {
                self.warn_once(
                    format!("level:{level_key}"),
                    "player spawn missing or out of bounds",
                );
                return;
            }
        }
        let zone_id = format!("level:{level_key}");
        let (_, descriptor) = build_collision(
            &zone_id,
            bounds.w,
            bounds.h,
            &self.data,
            &self.diagnostics,
        );
        snap.zone_set.insert(zone_id.clone());
        snap.levels.push(LevelEntry {
            id: zone_id,
            bounds,
            collision: CollisionSummary {
                ver: COLLISION_VER,
                hash: descriptor.hash,
            },
        });
    }

    fn add_entrances(
        &self,
        snap: &mut DirectorySnapshot,
        region_key: &str,
        region: &crate::data::RegionData,
    ) {
        let bounds = region
            .terrain_grid
            .as_deref()
            .and_then(rect_bounds)
            .unwrap_or(FALLBACK_BOUNDS);
        for decl in region.level_entrances.as_deref().unwrap_or(&[]) {
            let Some(entrance_id) = decl.id.as_deref().filter(|id| is_simple_key(id)) else {
                self.warn_once(
                    format!("{region_key}:{:?}", decl.id),
                    "invalid entrance id",
                );
                continue;
            };
            let key = format!("{region_key}:{entrance_id}");
            let (Some(x), Some(y)) = (as_tile_coord(decl.x), as_tile_coord(decl.y)) else {
                self.warn_once(key, "entrance tile not an integer");
                continue;
            };
            if !bounds.contains(x, y) {
                self.warn_once(key, "entrance tile out of bounds");
                continue;
            }
            let Some(to_level) = decl.to_level_id.as_deref() else {
                self.warn_once(key, "entrance missing destination");
                continue;
            };
            let to_is_level = matches!(
                parse_zone_id(to_level),
                Some(ParsedZoneId::Level { .. })
            );
            if !to_is_level || !snap.zone_set.contains(to_level) {
                self.warn_once(key, "entrance destination is not a listed level");
                continue;
            }
            let facing = match decl.facing.as_deref() {
                Some("n") => Some(Facing::N),
                Some("e") => Some(Facing::E),
                Some("s") => Some(Facing::S),
                Some("w") => Some(Facing::W),
                _ => None,
            };
            snap.entrances
                .entry(region_key.to_string())
                .or_default()
                .entry(to_level.to_string())
                .or_default()
                .push(Entrance { x, y, facing });
        }
    }

    // -----------------------------------------------------------------------
    // Transfer checks
    // -----------------------------------------------------------------------

    /// Route-shape policy between zone kinds. Region-to-region moves are
    /// deliberately unchecked.
    pub fn validate_transfer_route(&self, from: &str, to: &str) -> Result<(), TransferDenied> {
        if !self.exists(to) {
            return Err(TransferDenied::invalid_zone("zone not in directory"));
        }
        let (Some(from_id), Some(to_id)) = (parse_zone_id(from), parse_zone_id(to)) else {
            return Err(TransferDenied::invalid_zone("invalid zone id"));
        };
        match (&from_id, &to_id) {
            (
                ParsedZoneId::World { region_key: fr },
                ParsedZoneId::Region { region_key: tr, .. },
            )
            | (
                ParsedZoneId::Region { region_key: fr, .. },
                ParsedZoneId::World { region_key: tr },
            ) => {
                if fr != tr {
                    return Err(TransferDenied::invalid_zone(
                        "cross-region transfer forbidden",
                    ));
                }
            }
            (ParsedZoneId::World { .. }, ParsedZoneId::Level { .. })
                if !self.allow_world_level_teleport =>
            {
                return Err(TransferDenied::invalid_zone(
                    "world-to-level teleport disabled",
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// For region-to-level transfers, the player must stand on an entrance
    /// tile wired to that level. Other routes pass through untouched.
    pub fn check_entrance_eligibility(
        &self,
        from: &str,
        to: &str,
        x: i32,
        y: i32,
    ) -> Result<Option<Entrance>, TransferDenied> {
        let Some(snapshot) = self.snapshot() else {
            return Err(TransferDenied::failed("directory not ready"));
        };
        let from_region = match parse_zone_id(from) {
            Some(ParsedZoneId::Region { region_key, .. }) => region_key,
            _ => return Ok(None),
        };
        if !matches!(parse_zone_id(to), Some(ParsedZoneId::Level { .. })) {
            return Ok(None);
        }
        let Some(region_entrances) = snapshot.entrances.get(from_region.as_str()) else {
            return Err(TransferDenied::failed("no entrances in region"));
        };
        let Some(candidates) = region_entrances.get(to).filter(|c| !c.is_empty()) else {
            return Err(TransferDenied::failed(
                "no entrance to this level from region",
            ));
        };
        match candidates.iter().find(|e| e.x == x && e.y == y) {
            Some(entrance) => Ok(Some(entrance.clone())),
            None => Err(TransferDenied::failed("not_on_entrance")),
        }
    }
}

/// Key grammar for town and entrance ids: lowercase alphanumerics and
/// underscores.
fn is_simple_key(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
