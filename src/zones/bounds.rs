//! Zone bounds and spawn resolution.
//!
//! Bounds come from the rectangular terrain grid (world/region zones) or
//! tilemap (level zones). A missing, malformed, or non-rectangular grid
//! resolves to [`FALLBACK_BOUNDS`] so a zone can always be constructed.
//! Results are cached per zone id for the process lifetime.

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::{as_tile_coord, StaticDataStore};
use crate::util::ids::ZoneId;
use crate::zones::id::{parse_zone_id, ParsedZoneId};

/// Bounds used whenever zone data cannot produce real ones.
pub const FALLBACK_BOUNDS: Bounds = Bounds { w: 200, h: 120 };

/// Zone dimensions in tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub w: i32,
    pub h: i32,
}

impl Bounds {
    pub fn center(&self) -> (i32, i32) {
        (self.w / 2, self.h / 2)
    }

    /// Clamp a tile coordinate into `[0, w-1] x [0, h-1]`.
    pub fn clamp(&self, x: i32, y: i32) -> (i32, i32) {
        (x.clamp(0, self.w - 1), y.clamp(0, self.h - 1))
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.w && y < self.h
    }
}

/// Rectangularity check shared by bounds resolution and the zone directory.
/// Returns `None` for empty, ragged, or zero-width grids.
pub fn rect_bounds(grid: &[Vec<Option<i64>>]) -> Option<Bounds> {
    let h = grid.len();
    if h == 0 {
        return None;
    }
    let w = grid[0].len();
    if w == 0 {
        return None;
    }
    if grid.iter().skip(1).any(|row| row.len() != w) {
        return None;
    }
    Some(Bounds {
        w: w as i32,
        h: h as i32,
    })
}

/// Resolves bounds and spawn points for zones, caching per zone id.
pub struct BoundsResolver {
    data: StaticDataStore,
    bounds_cache: Mutex<HashMap<ZoneId, Bounds>>,
    // Region key -> towns by instance id, None when the file had no usable towns.
    town_cache: Mutex<HashMap<String, Option<HashMap<String, (i32, i32)>>>>,
    level_spawn_cache: Mutex<HashMap<String, Option<(i32, i32)>>>,
}

impl BoundsResolver {
    pub fn new(data: StaticDataStore) -> Self {
        Self {
            data,
            bounds_cache: Mutex::new(HashMap::new()),
            town_cache: Mutex::new(HashMap::new()),
            level_spawn_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the bounds for a zone id. Never fails; unparsable ids and bad
    /// data yield [`FALLBACK_BOUNDS`].
    pub fn load_bounds(&self, zone_id: &str) -> Bounds {
        if let Some(b) = self.bounds_cache.lock().get(zone_id) {
            return *b;
        }
        let bounds = self.resolve_bounds(zone_id);
        self.bounds_cache.lock().insert(zone_id.to_string(), bounds);
        bounds
    }

    fn resolve_bounds(&self, zone_id: &str) -> Bounds {
        let Some(parsed) = parse_zone_id(zone_id) else {
            return FALLBACK_BOUNDS;
        };
        match parsed {
            ParsedZoneId::World { region_key } | ParsedZoneId::Region { region_key, .. } => {
                let Some(region) = self.data.read_region(&region_key) else {
                    warn!(zone = zone_id, "region file not found, using fallback bounds");
                    return FALLBACK_BOUNDS;
                };
                grid_bounds_logged(region.terrain_grid.as_deref(), "terrainGrid", zone_id)
            }
            ParsedZoneId::Level { level_id } => {
                let Some(level) = self.data.read_level(&level_id) else {
                    warn!(zone = zone_id, "level file not found, using fallback bounds");
                    return FALLBACK_BOUNDS;
                };
                grid_bounds_logged(level.tilemap.as_deref(), "tilemap", zone_id)
            }
        }
    }

    /// Spawn tile for a zone, always clamped into `bounds`.
    ///
    /// World zones spawn at the center, region zones at their town anchor,
    /// level zones at `spawns.player`. Missing or non-integer anchors fall
    /// back to the center.
    pub fn spawn(&self, zone_id: &str, bounds: Bounds) -> (i32, i32) {
        let center = bounds.center();
        let anchor = match parse_zone_id(zone_id) {
            Some(ParsedZoneId::World { .. }) | None => None,
            Some(ParsedZoneId::Region {
                region_key,
                instance_id,
            }) => self.town_anchor(&region_key, &instance_id),
            Some(ParsedZoneId::Level { level_id }) => self.level_spawn(&level_id),
        };
        let (x, y) = anchor.unwrap_or(center);
        bounds.clamp(x, y)
    }

    fn town_anchor(&self, region_key: &str, instance_id: &str) -> Option<(i32, i32)> {
        let mut cache = self.town_cache.lock();
        let towns = cache
            .entry(region_key.to_string())
            .or_insert_with(|| self.load_towns(region_key));
        towns.as_ref().and_then(|map| map.get(instance_id)).copied()
    }

    fn load_towns(&self, region_key: &str) -> Option<HashMap<String, (i32, i32)>> {
        let region = self.data.read_region(region_key)?;
        let towns = region.towns?;
        let mut map = HashMap::new();
        for town in towns {
            let Some(id) = town.id else { continue };
            if id.is_empty() {
                continue;
            }
            if let (Some(x), Some(y)) = (as_tile_coord(town.x), as_tile_coord(town.y)) {
                map.insert(id, (x, y));
            }
        }
        Some(map)
    }

    fn level_spawn(&self, level_id: &str) -> Option<(i32, i32)> {
        let mut cache = self.level_spawn_cache.lock();
        *cache
            .entry(level_id.to_string())
            .or_insert_with(|| self.load_level_spawn(level_id))
    }

    fn load_level_spawn(&self, level_id: &str) -> Option<(i32, i32)> {
        let level = self.data.read_level(level_id)?;
        let player = level.spawns?.player?;
        Some((as_tile_coord(player.x)?, as_tile_coord(player.y)?))
    }
}

fn grid_bounds_logged(grid: Option<&[Vec<Option<i64>>]>, field: &str, zone_id: &str) -> Bounds {
    let Some(grid) = grid else {
        warn!(zone = zone_id, field, "grid missing, using fallback bounds");
        return FALLBACK_BOUNDS;
    };
    match rect_bounds(grid) {
        Some(bounds) => {
            info!(zone = zone_id, w = bounds.w, h = bounds.h, "bounds resolved");
            bounds
        }
        None => {
            warn!(
                zone = zone_id,
                field, "grid empty or non-rectangular, using fallback bounds"
            );
            FALLBACK_BOUNDS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn write_fixture(tag: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vantown-bounds-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("regions")).unwrap();
        fs::create_dir_all(dir.join("levels")).unwrap();
        for (rel, body) in files {
            fs::write(dir.join(rel), body).unwrap();
        }
        dir
    }

    fn resolver(dir: &PathBuf) -> BoundsResolver {
        BoundsResolver::new(StaticDataStore::new(dir.to_str().unwrap()))
    }

    #[test]
    fn test_rect_bounds() {
        let grid = vec![vec![Some(2), Some(2)], vec![Some(2), Some(0)]];
        assert_eq!(rect_bounds(&grid), Some(Bounds { w: 2, h: 2 }));
        let ragged = vec![vec![Some(2), Some(2)], vec![Some(2)]];
        assert_eq!(rect_bounds(&ragged), None);
        assert_eq!(rect_bounds(&[]), None);
        let empty_row: Vec<Vec<Option<i64>>> = vec![vec![]];
        assert_eq!(rect_bounds(&empty_row), None);
    }

    #[test]
    fn test_bounds_from_terrain_grid_and_cache() {
        let dir = write_fixture(
            "grid",
            &[("regions/na.json", r#"{"terrainGrid":[[2,2,2],[2,2,2]]}"#)],
        );
        let r = resolver(&dir);
        assert_eq!(r.load_bounds("world:na"), Bounds { w: 3, h: 2 });
        // Cached: deleting the file does not change the answer.
        fs::remove_file(dir.join("regions/na.json")).unwrap();
        assert_eq!(r.load_bounds("world:na"), Bounds { w: 3, h: 2 });
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fallback_for_missing_and_invalid() {
        let dir = write_fixture(
            "fallback",
            &[("regions/bad.json", r#"{"terrainGrid":[[2,2],[2]]}"#)],
        );
        let r = resolver(&dir);
        assert_eq!(r.load_bounds("world:zz"), FALLBACK_BOUNDS);
        assert_eq!(r.load_bounds("world:bad"), FALLBACK_BOUNDS);
        assert_eq!(r.load_bounds("not a zone id"), FALLBACK_BOUNDS);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_world_spawn_is_center() {
        let dir = write_fixture("center", &[]);
        let r = resolver(&dir);
        let b = Bounds { w: 9, h: 5 };
        assert_eq!(r.spawn("world:na", b), (4, 2));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_region_spawn_uses_town_anchor() {
        let dir = write_fixture(
            "town",
            &[(
                "regions/na.json",
                r#"{"terrainGrid":[[2,2,2,2],[2,2,2,2],[2,2,2,2]],
                    "towns":[{"id":"town_01","x":3,"y":1},{"id":"bad","x":1.5,"y":0}]}"#,
            )],
        );
        let r = resolver(&dir);
        let b = r.load_bounds("region:na:town_01");
        assert_eq!(r.spawn("region:na:town_01", b), (3, 1));
        // Non-integer anchor falls back to center.
        assert_eq!(r.spawn("region:na:bad", b), b.center());
        // Unknown instance falls back to center.
        assert_eq!(r.spawn("region:na:nowhere", b), b.center());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_level_spawn_and_clamp() {
        let dir = write_fixture(
            "level",
            &[(
                "levels/level_sewer.json",
                r#"{"id":"level_sewer","tilemap":[[0,0],[0,0]],"spawns":{"player":{"x":50,"y":1}}}"#,
            )],
        );
        let r = resolver(&dir);
        let b = r.load_bounds("level:level_sewer");
        assert_eq!(b, Bounds { w: 2, h: 2 });
        // Spawn outside bounds clamps in.
        assert_eq!(r.spawn("level:level_sewer", b), (1, 1));
        let _ = fs::remove_dir_all(&dir);
    }
}
