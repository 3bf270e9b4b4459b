//! Render-side smoothing for the local player and remote entities.
//!
//! The local player renders toward its predicted tile. Remote entities keep
//! a short ring of timestamped pixel samples and render at a fixed delay
//! behind now, interpolating between the two samples that straddle the
//! render time. Both paths share the same stepping rule: snap when a full
//! tile behind, otherwise ease by a constant factor.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::net::protocol::{Facing, MoveMode, PlayerSnapshot, PosEntry};
use crate::util::ids::EntityId;
use crate::zones::zone::TILE_SIZE;

/// How far behind now remote entities are rendered.
pub const INTERP_DELAY_MS: u64 = 100;
/// Samples kept per remote. Two are enough to interpolate; a couple more
/// ride out bursty delivery.
pub const MAX_SAMPLES: usize = 4;
/// Remotes with no update for this long are dropped from the render set.
pub const STALE_REMOTE_MS: u64 = 30_000;
/// At or beyond this distance the render position jumps instead of easing.
pub const SNAP_DIST_PX: f64 = 64.0;
/// Fraction of the remaining distance covered per render step.
pub const SMOOTH_FACTOR: f64 = 0.35;

// ---------------------------------------------------------------------------
// Render position
// ---------------------------------------------------------------------------

/// A pixel-space render position easing toward a target.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderPos {
    pub px: f64,
    pub py: f64,
}

impl RenderPos {
    pub fn at(px: f64, py: f64) -> Self {
        Self { px, py }
    }

    pub fn snap_to(&mut self, px: f64, py: f64) {
        self.px = px;
        self.py = py;
    }

    /// One render step toward the target. Teleport-sized gaps snap; small
    /// gaps ease; below half a pixel the position rests where it is.
    pub fn step_toward(&mut self, tx: f64, ty: f64) {
        let dist = (tx - self.px).abs().max((ty - self.py).abs());
        if dist >= SNAP_DIST_PX {
            self.px = tx;
            self.py = ty;
        } else if dist > 0.5 {
            self.px += (tx - self.px) * SMOOTH_FACTOR;
            self.py += (ty - self.py) * SMOOTH_FACTOR;
        }
    }
}

// ---------------------------------------------------------------------------
// Remote entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct PosSample {
    at_ms: u64,
    px: f64,
    py: f64,
}

/// A parked van reported alongside an on-foot entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VanPark {
    pub px: f64,
    pub py: f64,
    pub facing: Facing,
}

/// Another player's entity as this client sees it.
#[derive(Debug, Clone)]
pub struct RemoteEntity {
    pub x: i32,
    pub y: i32,
    pub facing: Facing,
    pub mode: MoveMode,
    pub sprite_ref: String,
    pub dn: Option<String>,
    pub vehicle: Option<VanPark>,
    pub render: RenderPos,
    samples: VecDeque<PosSample>,
    last_update_ms: u64,
}

impl RemoteEntity {
    fn from_snapshot(snap: &PlayerSnapshot, now_ms: u64) -> Self {
        let px = (snap.x as i64 * TILE_SIZE) as f64;
        let py = (snap.y as i64 * TILE_SIZE) as f64;
        let mut entity = Self {
            x: snap.x,
            y: snap.y,
            facing: snap.facing,
            mode: MoveMode::Van,
            sprite_ref: snap.sprite_ref.clone(),
            dn: snap.dn.clone(),
            vehicle: None,
            render: RenderPos::at(px, py),
            samples: VecDeque::new(),
            last_update_ms: now_ms,
        };
        entity.push_sample(now_ms, px, py);
        entity
    }

    fn from_pos_entry(entry: &PosEntry, now_ms: u64) -> Self {
        let px = entry.1 as f64;
        let py = entry.2 as f64;
        let mut entity = Self {
            x: entry.1.div_euclid(TILE_SIZE) as i32,
            y: entry.2.div_euclid(TILE_SIZE) as i32,
            facing: entry.3,
            mode: entry.4,
            // position-only sighting: the real sprite arrives with the
            // next snapshot or delta upsert
            sprite_ref: "base:van".to_string(),
            dn: (!entry.8.is_empty()).then(|| entry.8.clone()),
            vehicle: None,
            render: RenderPos::at(px, py),
            samples: VecDeque::new(),
            last_update_ms: now_ms,
        };
        entity.apply_vehicle(entry);
        entity.push_sample(now_ms, px, py);
        entity
    }

    fn apply_vehicle(&mut self, entry: &PosEntry) {
        if let (Some(vpx), Some(vpy)) = (entry.5, entry.6) {
            self.vehicle = Some(VanPark {
                px: vpx as f64,
                py: vpy as f64,
                facing: entry.7.unwrap_or_default(),
            });
        }
    }

    fn push_sample(&mut self, at_ms: u64, px: f64, py: f64) {
        self.samples.push_back(PosSample { at_ms, px, py });
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.last_update_ms = at_ms;
    }

    /// Pixel target for the given render time: the lerp between the two
    /// samples straddling it, or the freshest sample when none do.
    pub fn target_at(&self, render_ms: u64) -> Option<(f64, f64)> {
        if self.samples.len() >= 2 {
            for pair in 0..self.samples.len() - 1 {
                let a = self.samples[pair];
                let b = self.samples[pair + 1];
                if a.at_ms <= render_ms && render_ms <= b.at_ms {
                    let dt = b.at_ms.saturating_sub(a.at_ms);
                    let frac = if dt == 0 {
                        1.0
                    } else {
                        ((render_ms - a.at_ms) as f64 / dt as f64).min(1.0)
                    };
                    return Some((
                        a.px + (b.px - a.px) * frac,
                        a.py + (b.py - a.py) * frac,
                    ));
                }
            }
        }
        self.samples.back().map(|last| (last.px, last.py))
    }

    #[cfg(test)]
    fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

// ---------------------------------------------------------------------------
// Remote set
// ---------------------------------------------------------------------------

/// All remote entities in the current zone, keyed by entity id.
#[derive(Default)]
pub struct RemoteSet {
    remotes: HashMap<EntityId, RemoteEntity>,
}

impl RemoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a roster snapshot or delta upsert. New entities render in
    /// place; known ones keep their sample ring and render position.
    pub fn upsert_snapshot(&mut self, snap: &PlayerSnapshot, now_ms: u64) {
        let px = (snap.x as i64 * TILE_SIZE) as f64;
        let py = (snap.y as i64 * TILE_SIZE) as f64;
        match self.remotes.get_mut(&snap.id) {
            Some(entity) => {
                entity.x = snap.x;
                entity.y = snap.y;
                entity.facing = snap.facing;
                entity.sprite_ref = snap.sprite_ref.clone();
                entity.dn = snap.dn.clone();
                entity.push_sample(now_ms, px, py);
            }
            None => {
                self.remotes
                    .insert(snap.id.clone(), RemoteEntity::from_snapshot(snap, now_ms));
            }
        }
    }

    /// Apply one position-stream entry. Known entities get a fresh sample
    /// and facing/mode; the tile stays whatever the last roster said.
    /// Unknown entities are created on the spot so they render before
    /// their first delta arrives.
    pub fn apply_pos_entry(&mut self, entry: &PosEntry, now_ms: u64) {
        match self.remotes.get_mut(&entry.0) {
            Some(entity) => {
                entity.facing = entry.3;
                entity.mode = entry.4;
                entity.apply_vehicle(entry);
                if !entry.8.is_empty() {
                    entity.dn = Some(entry.8.clone());
                }
                entity.push_sample(now_ms, entry.1 as f64, entry.2 as f64);
            }
            None => {
                self.remotes
                    .insert(entry.0.clone(), RemoteEntity::from_pos_entry(entry, now_ms));
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.remotes.remove(id).is_some()
    }

    /// Step every render position toward its delayed interpolation target.
    pub fn advance(&mut self, now_ms: u64) {
        let render_ms = now_ms.saturating_sub(INTERP_DELAY_MS);
        for entity in self.remotes.values_mut() {
            if let Some((tx, ty)) = entity.target_at(render_ms) {
                entity.render.step_toward(tx, ty);
            }
        }
    }

    /// Drop remotes that have gone quiet. Returns how many were dropped.
    pub fn sweep_stale(&mut self, now_ms: u64) -> usize {
        let before = self.remotes.len();
        self.remotes
            .retain(|_, entity| now_ms.saturating_sub(entity.last_update_ms) <= STALE_REMOTE_MS);
        before - self.remotes.len()
    }

    pub fn clear(&mut self) {
        self.remotes.clear();
    }

    pub fn get(&self, id: &str) -> Option<&RemoteEntity> {
        self.remotes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &RemoteEntity)> {
        self.remotes.iter()
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }
}
