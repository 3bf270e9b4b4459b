//! Static map data loading.
//!
//! Region files live at `<data_dir>/regions/<regionKey>.json` and carry the
//! terrain grid plus towns, roads, buildings, and level entrances. Level files
//! live at `<data_dir>/levels/<levelId>.json` and carry a tilemap plus spawn
//! points. Reads are uncached; callers that need caching (bounds, spawns)
//! keep their own per-zone caches.
//!
//! Authored data is treated as untrusted: coordinates deserialize as raw
//! numbers and are validated at the use site, and a file that fails to parse
//! reads as absent.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

/// One road tile. Coordinates are validated (integer, in bounds) by the
/// collision builder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoadTile {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

/// Explicit footprint override carried by a building entry.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Footprint {
    pub w: f64,
    pub h: f64,
}

/// Background building placement, SW-anchored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Building {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub fp: Option<Footprint>,
    #[serde(default)]
    pub rotated: Option<bool>,
}

/// Town declaration inside a region file. Becomes a joinable region zone
/// once the directory validates it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Town {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Level entrance declaration inside a region file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntranceDecl {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub to_level_id: Option<String>,
    #[serde(default)]
    pub facing: Option<String>,
}

/// Parsed region file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionData {
    #[serde(default)]
    pub terrain_grid: Option<Vec<Vec<Option<i64>>>>,
    #[serde(default)]
    pub road_tiles: Option<Vec<RoadTile>>,
    #[serde(default)]
    pub bg_buildings: Option<Vec<Building>>,
    #[serde(default)]
    pub towns: Option<Vec<Town>>,
    #[serde(default)]
    pub level_entrances: Option<Vec<EntranceDecl>>,
}

/// Spawn point in a level file.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SpawnPoint {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LevelSpawns {
    #[serde(default)]
    pub player: Option<SpawnPoint>,
}

/// Parsed level file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LevelData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tilemap: Option<Vec<Vec<Option<i64>>>>,
    #[serde(default)]
    pub spawns: Option<LevelSpawns>,
}

/// Reads region and level files from the configured data directory.
#[derive(Debug, Clone)]
pub struct StaticDataStore {
    regions_dir: PathBuf,
    levels_dir: PathBuf,
}

impl StaticDataStore {
    pub fn new(data_dir: &str) -> Self {
        let base = PathBuf::from(data_dir);
        Self {
            regions_dir: base.join("regions"),
            levels_dir: base.join("levels"),
        }
    }

    /// Read `regions/<regionKey>.json`. `None` when missing or unparseable.
    pub fn read_region(&self, region_key: &str) -> Option<RegionData> {
        let path = self.regions_dir.join(format!("{region_key}.json"));
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "region file unparseable");
                None
            }
        }
    }

    /// Read `levels/<levelId>.json`. `None` when missing or unparseable.
    pub fn read_level(&self, level_id: &str) -> Option<LevelData> {
        self.read_level_file(&format!("{level_id}.json"))
    }

    /// Read a level file by file name (used by the directory scan, which
    /// keys levels on the embedded `id` field rather than the file name).
    pub fn read_level_file(&self, file_name: &str) -> Option<LevelData> {
        let path = self.levels_dir.join(file_name);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "level file unparseable");
                None
            }
        }
    }

    /// Region keys present on disk (file stems of `regions/*.json`).
    pub fn list_region_keys(&self) -> Vec<String> {
        list_json_stems(&self.regions_dir)
    }

    /// Level file names present on disk, excluding the index.
    pub fn list_level_files(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.levels_dir) else {
            return Vec::new();
        };
        let mut files: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.ends_with(".json") && name != "index.json")
            .collect();
        files.sort();
        files
    }
}

fn list_json_stems(dir: &PathBuf) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut stems: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| name.strip_suffix(".json").map(|s| s.to_string()))
        .collect();
    stems.sort();
    stems
}

/// `Number.isInteger`-style check applied to authored coordinates before use.
pub fn as_tile_coord(v: Option<f64>) -> Option<i32> {
    let v = v?;
    if v.is_finite() && v.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&v) {
        Some(v as i32)
    } else {
        None
    }
}
