//! Collision grids: per-zone blocked/walkable bitmaps.
//!
//! Grids are generated once at zone creation from static data and never
//! mutated afterwards; runtime movement only reads them. Derivation for
//! world/region zones runs four passes in a fixed priority order:
//!
//! 1. terrain: OCEAN, MOUNTAIN, RIVER block; COAST and LAND walk
//! 2. buildings: SW-anchored footprint rectangles block
//! 3. roads: force walkable, overriding both
//! 4. sidewalks: LAND/COAST tiles 4-adjacent to a road become walkable,
//!    unless covered by a building
//!
//! Level zones derive from their tilemap, where wall tiles block.
//!
//! The wire form is a run-length encoded bitset in standard base64, hashed so
//! clients can skip re-decoding an unchanged grid.

use base64::prelude::*;
use bitvec::prelude::*;
use hashbrown::HashSet;
use parking_lot::Mutex;
use ring::digest;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::{as_tile_coord, Building, LevelData, RegionData, StaticDataStore};
use crate::util::hex_string;
use crate::util::ids::ZoneId;
use crate::zones::id::{parse_zone_id, ParsedZoneId};

pub const TERRAIN_OCEAN: i64 = 0;
pub const TERRAIN_COAST: i64 = 1;
pub const TERRAIN_LAND: i64 = 2;
pub const TERRAIN_MOUNTAIN: i64 = 3;
pub const TERRAIN_RIVER: i64 = 4;

/// Tilemap value that blocks movement in level zones.
pub const LEVEL_WALL: i64 = 1;

/// Version stamped into collision descriptors.
pub const COLLISION_VER: u32 = 1;

fn terrain_blocks(v: i64) -> bool {
    matches!(v, TERRAIN_OCEAN | TERRAIN_MOUNTAIN | TERRAIN_RIVER)
}

fn terrain_known(v: i64) -> bool {
    (TERRAIN_OCEAN..=TERRAIN_RIVER).contains(&v)
}

fn sidewalk_eligible(v: i64) -> bool {
    matches!(v, TERRAIN_COAST | TERRAIN_LAND)
}

/// Immutable blocked/walkable bitmap for one zone. Row-major, bit set means
/// blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionGrid {
    w: i32,
    h: i32,
    bits: BitVec,
}

impl CollisionGrid {
    /// All-walkable grid. Non-positive dimensions produce an empty bitmap
    /// whose every query is out of bounds.
    pub fn empty(w: i32, h: i32) -> Self {
        let cells = (w.max(0) as usize) * (h.max(0) as usize);
        Self {
            w: w.max(0),
            h: h.max(0),
            bits: bitvec![0; cells],
        }
    }

    pub fn width(&self) -> i32 {
        self.w
    }

    pub fn height(&self) -> i32 {
        self.h
    }

    /// Out-of-bounds tiles are always blocked.
    pub fn is_blocked(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x >= self.w || y >= self.h {
            return true;
        }
        self.bits[(y as usize) * (self.w as usize) + (x as usize)]
    }

    fn set_blocked(&mut self, x: i32, y: i32, blocked: bool) {
        if x < 0 || y < 0 || x >= self.w || y >= self.h {
            return;
        }
        let idx = (y as usize) * (self.w as usize) + (x as usize);
        self.bits.set(idx, blocked);
    }

    pub fn blocked_count(&self) -> usize {
        self.bits.count_ones()
    }

    #[cfg(test)]
    pub fn set_blocked_for_test(&mut self, x: i32, y: i32) {
        self.set_blocked(x, y, true);
    }
}

/// Warn-once bookkeeping for data problems found during grid generation.
/// Shared between the zone manager and the directory so each zone warns at
/// most once per process for each problem class.
#[derive(Debug, Default)]
pub struct BuildDiagnostics {
    unknown_terrain: Mutex<HashSet<ZoneId>>,
    building_oob: Mutex<HashSet<ZoneId>>,
    road_oob: Mutex<HashSet<ZoneId>>,
}

impl BuildDiagnostics {
    fn warn_unknown_terrain(&self, zone_id: &str, value: i64) {
        if self.unknown_terrain.lock().insert(zone_id.to_string()) {
            warn!(zone = zone_id, value, "unknown terrain value, treating as LAND");
        }
    }

    fn warn_building_oob(&self, zone_id: &str, rect: &FootprintRect) {
        if self.building_oob.lock().insert(zone_id.to_string()) {
            warn!(
                zone = zone_id,
                x = rect.x0,
                y = rect.y0,
                w = rect.w,
                h = rect.h,
                "building footprint partially out of bounds"
            );
        }
    }

    fn warn_road_oob(&self, zone_id: &str) {
        if self.road_oob.lock().insert(zone_id.to_string()) {
            warn!(zone = zone_id, "road tile out of bounds");
        }
    }
}

/// Footprint in tiles, already converted from the SW anchor to a top-left
/// origin rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FootprintRect {
    pub x0: i32,
    pub y0: i32,
    pub w: i32,
    pub h: i32,
}

fn kind_footprint(kind: Option<&str>) -> (i32, i32) {
    match kind {
        Some("mall") | Some("warehouse") | Some("gas_station") => (4, 2),
        Some("apt_tall") | Some("apt_med") | Some("shop") | Some("fastfood") | Some("pizza") => {
            (2, 2)
        }
        _ => (1, 1),
    }
}

/// Resolve the footprint rect for a building. Explicit `fp` wins over the
/// kind table; `rotated` swaps only table footprints, and only non-square
/// ones. `None` when the anchor coordinates are unusable.
pub fn footprint_rect(b: &Building) -> Option<FootprintRect> {
    let x = as_tile_coord(b.x)?;
    let y = as_tile_coord(b.y)?;
    let (w, h) = match b.fp {
        Some(fp) if fp.w.is_finite() && fp.h.is_finite() => (fp.w as i32, fp.h as i32),
        _ => {
            let (w, h) = kind_footprint(b.kind.as_deref());
            if b.rotated.unwrap_or(false) && w != h {
                (h, w)
            } else {
                (w, h)
            }
        }
    };
    Some(FootprintRect {
        x0: x,
        y0: y - (h - 1),
        w,
        h,
    })
}

/// Generate the grid for any zone id, reading static data through `store`.
pub fn generate_grid(
    zone_id: &str,
    w: i32,
    h: i32,
    store: &StaticDataStore,
    diag: &BuildDiagnostics,
) -> CollisionGrid {
    match parse_zone_id(zone_id) {
        None => CollisionGrid::empty(w, h),
        Some(ParsedZoneId::World { region_key }) | Some(ParsedZoneId::Region { region_key, .. }) => {
            let region = store.read_region(&region_key);
            if region.is_none() {
                warn!(zone = zone_id, "region data not found, empty collision grid");
            }
            generate_region_grid(zone_id, w, h, region.as_ref(), diag)
        }
        Some(ParsedZoneId::Level { level_id }) => {
            let level = store.read_level(&level_id);
            if level.is_none() {
                warn!(zone = zone_id, "level data not found, empty collision grid");
            }
            generate_level_grid(w, h, level.as_ref())
        }
    }
}

/// Four-pass derivation for world and region zones.
pub fn generate_region_grid(
    zone_id: &str,
    w: i32,
    h: i32,
    region: Option<&RegionData>,
    diag: &BuildDiagnostics,
) -> CollisionGrid {
    let mut grid = CollisionGrid::empty(w, h);
    let Some(region) = region else {
        return grid;
    };

    // Pass 1: terrain.
    if let Some(terrain) = region.terrain_grid.as_ref() {
        for (y, row) in terrain.iter().enumerate().take(h.max(0) as usize) {
            for (x, cell) in row.iter().enumerate().take(w.max(0) as usize) {
                let Some(tv) = cell else { continue };
                if terrain_blocks(*tv) {
                    grid.set_blocked(x as i32, y as i32, true);
                } else if !terrain_known(*tv) {
                    diag.warn_unknown_terrain(zone_id, *tv);
                }
            }
        }
    }

    // Pass 2: building footprints, clipped to bounds.
    if let Some(buildings) = region.bg_buildings.as_ref() {
        for b in buildings {
            let Some(rect) = footprint_rect(b) else { continue };
            for yy in rect.y0..rect.y0 + rect.h {
                for xx in rect.x0..rect.x0 + rect.w {
                    grid.set_blocked(xx, yy, true);
                }
            }
            if rect.x0 < 0 || rect.x0 + rect.w > w || rect.y0 < 0 || rect.y0 + rect.h > h {
                diag.warn_building_oob(zone_id, &rect);
            }
        }
    }

    // Pass 3: roads carve through everything.
    if let Some(roads) = region.road_tiles.as_ref() {
        for rt in roads {
            match (as_tile_coord(rt.x), as_tile_coord(rt.y)) {
                (Some(x), Some(y)) if x >= 0 && x < w && y >= 0 && y < h => {
                    grid.set_blocked(x, y, false);
                }
                _ => diag.warn_road_oob(zone_id),
            }
        }
    }

    // Pass 4: sidewalks. Derived, never stored: a blocked LAND/COAST tile
    // that is not under a building and touches a road on a 4-neighbor side
    // becomes walkable.
    if let (Some(terrain), Some(roads)) = (region.terrain_grid.as_ref(), region.road_tiles.as_ref())
    {
        let mut road_set: FxHashSet<i64> = FxHashSet::default();
        for rt in roads {
            if let (Some(x), Some(y)) = (as_tile_coord(rt.x), as_tile_coord(rt.y)) {
                if x >= 0 && x < w && y >= 0 && y < h {
                    road_set.insert(y as i64 * w as i64 + x as i64);
                }
            }
        }

        let mut building_set: FxHashSet<i64> = FxHashSet::default();
        if let Some(buildings) = region.bg_buildings.as_ref() {
            for b in buildings {
                let Some(rect) = footprint_rect(b) else { continue };
                for yy in rect.y0..rect.y0 + rect.h {
                    for xx in rect.x0..rect.x0 + rect.w {
                        if xx >= 0 && xx < w && yy >= 0 && yy < h {
                            building_set.insert(yy as i64 * w as i64 + xx as i64);
                        }
                    }
                }
            }
        }

        for y in 0..h {
            for x in 0..w {
                if !grid.is_blocked(x, y) {
                    continue;
                }
                let tv = terrain
                    .get(y as usize)
                    .and_then(|row| row.get(x as usize))
                    .copied()
                    .flatten();
                if !tv.is_some_and(sidewalk_eligible) {
                    continue;
                }
                let k = y as i64 * w as i64 + x as i64;
                if building_set.contains(&k) {
                    continue;
                }
                let touches_road = (x > 0 && road_set.contains(&(k - 1)))
                    || (x < w - 1 && road_set.contains(&(k + 1)))
                    || (y > 0 && road_set.contains(&(k - w as i64)))
                    || (y < h - 1 && road_set.contains(&(k + w as i64)));
                if touches_road {
                    grid.set_blocked(x, y, false);
                }
            }
        }
    }

    grid
}

/// Tilemap derivation for level zones: wall tiles block, everything else
/// walks. Missing tilemap means all-walkable.
pub fn generate_level_grid(w: i32, h: i32, level: Option<&LevelData>) -> CollisionGrid {
    let mut grid = CollisionGrid::empty(w, h);
    let Some(tilemap) = level.and_then(|l| l.tilemap.as_ref()) else {
        return grid;
    };
    for (y, row) in tilemap.iter().enumerate().take(h.max(0) as usize) {
        for (x, cell) in row.iter().enumerate().take(w.max(0) as usize) {
            if *cell == Some(LEVEL_WALL) {
                grid.set_blocked(x as i32, y as i32, true);
            }
        }
    }
    grid
}

// ---------------------------------------------------------------------------
// Bitset RLE wire encoding
// ---------------------------------------------------------------------------

/// Encode a grid as `[startBit][varint run]...` in standard base64.
/// Runs alternate bit value starting from `startBit`; scan order is
/// row-major. Zero-area grids encode as the empty string.
pub fn encode_bitset_rle(grid: &CollisionGrid) -> String {
    let (w, h) = (grid.width(), grid.height());
    if w == 0 || h == 0 {
        return String::new();
    }

    let start_bit = grid.is_blocked(0, 0) as u8;
    let mut prev = start_bit;
    let mut count: u64 = 0;
    let mut bytes: Vec<u8> = vec![start_bit & 1];

    for y in 0..h {
        for x in 0..w {
            let bit = grid.is_blocked(x, y) as u8;
            if bit == prev {
                count += 1;
            } else {
                push_varint(&mut bytes, count);
                prev = bit;
                count = 1;
            }
        }
    }
    push_varint(&mut bytes, count);

    BASE64_STANDARD.encode(&bytes)
}

fn push_varint(bytes: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        bytes.push(((value & 0x7f) | 0x80) as u8);
        value >>= 7;
    }
    bytes.push((value & 0x7f) as u8);
}

/// Decode the RLE form back into a grid of the given dimensions.
///
/// Tolerant by construction: decoding stops at `w*h` bits or at the end of
/// the buffer, whichever comes first, and unexpected input degrades to
/// walkable tiles rather than failing.
pub fn decode_bitset_rle(b64: &str, w: i32, h: i32) -> CollisionGrid {
    let mut grid = CollisionGrid::empty(w, h);
    let buf = BASE64_STANDARD.decode(b64).unwrap_or_default();
    if buf.is_empty() {
        return grid;
    }

    let total = (w.max(0) as u64) * (h.max(0) as u64);
    let mut pos = 1usize;
    let mut current_bit = buf[0] & 1;
    let mut bit_idx: u64 = 0;

    while bit_idx < total && pos < buf.len() {
        let mut run: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = buf[pos];
            pos += 1;
            run |= ((b & 0x7f) as u64) << shift;
            shift += 7;
            if b & 0x80 == 0 || pos >= buf.len() {
                break;
            }
        }

        let end = (bit_idx + run).min(total);
        if current_bit == 1 {
            for i in bit_idx..end {
                let x = (i % w as u64) as i32;
                let y = (i / w as u64) as i32;
                grid.set_blocked(x, y, true);
            }
        }
        bit_idx = end;
        current_bit ^= 1;
    }

    grid
}

/// Short content hash over the exact base64 string bytes:
/// `sha256:` + first 16 hex chars of the digest.
pub fn hash_grid(b64: &str) -> String {
    let digest = digest::digest(&digest::SHA256, b64.as_bytes());
    format!("sha256:{}", &hex_string(digest.as_ref())[..16])
}

/// Wire descriptor sent alongside snapshots and collision refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionDescriptor {
    pub mode: String,
    pub ver: u32,
    pub hash: String,
    pub format: String,
    pub data: String,
}

pub fn build_descriptor(grid: &CollisionGrid) -> CollisionDescriptor {
    let data = encode_bitset_rle(grid);
    let hash = hash_grid(&data);
    CollisionDescriptor {
        mode: "grid".to_string(),
        ver: COLLISION_VER,
        hash,
        format: "bitset_rle".to_string(),
        data,
    }
}

/// Generate a zone's grid and its wire descriptor in one step.
pub fn build_collision(
    zone_id: &str,
    w: i32,
    h: i32,
    store: &StaticDataStore,
    diag: &BuildDiagnostics,
) -> (CollisionGrid, CollisionDescriptor) {
    let grid = generate_grid(zone_id, w, h, store, diag);
    let descriptor = build_descriptor(&grid);
    (grid, descriptor)
}
