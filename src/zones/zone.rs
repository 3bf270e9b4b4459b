//! A single simulated zone: entity state, tile movement, and delta fanout.
//!
//! Movement is authoritative here. Clients send intents (`input`) which are
//! applied once per tick; between ticks clients stream cosmetic pixel
//! positions (`pos_sync`) that never affect collision. Broadcast is
//! interest-scoped: tile upserts go to connections whose area-of-interest
//! neighborhood contains the mover, removals go to everyone in the zone.

use hashbrown::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::net::aoi::AoiGrid;
use crate::net::protocol::{
    Ack, Facing, MoveMode, MoveVec, PlayerSnapshot, PosEntry, ServerMsg, PROTOCOL_VERSION,
};
use crate::util::ids::{AccountId, EntityId, ZoneId};
use crate::zones::bounds::Bounds;
use crate::zones::collision::{CollisionDescriptor, CollisionGrid};
use crate::zones::id::{zone_kind_or_world, ZoneKind};
use crate::zones::presence::PresenceCache;

/// Tiles moved per tick while an input intent is held.
pub const MOVE_SPEED: i32 = 1;

/// Pixels per tile, shared with the client-side prediction math.
pub const TILE_SIZE: i64 = 64;

/// Pixel delta below which a pos_sync report is not worth broadcasting.
const POS_DIRTY_PX: i64 = 4;

/// Outbound frame queue for one connection. The socket writer owns the
/// receiving end; zones never touch the transport directly.
pub type ConnTx = mpsc::UnboundedSender<ServerMsg>;

/// Held movement intent, replaced by each accepted input and kept until the
/// next one arrives.
#[derive(Debug, Clone)]
pub struct Intent {
    pub mv: MoveVec,
    pub facing: Option<Facing>,
    pub keys: Option<serde_json::Value>,
}

/// Parked-vehicle marker carried while an entity is on foot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleState {
    pub px: i64,
    pub py: i64,
    pub facing: Facing,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub account_id: AccountId,
    pub zone_id: ZoneId,
    /// Authoritative tile position.
    pub x: i32,
    pub y: i32,
    /// Client-reported pixel position, reset to `tile * 64` on any
    /// authoritative move or teleport.
    pub px: i64,
    pub py: i64,
    pub facing: Facing,
    pub sprite_ref: String,
    pub display_name: String,
    pub mode: MoveMode,
    pub vehicle: Option<VehicleState>,
    pub last_seq: i64,
    pub intent: Option<Intent>,
}

impl Entity {
    pub fn new(id: EntityId, account_id: AccountId, display_name: String, x: i32, y: i32) -> Self {
        Self {
            id,
            account_id,
            zone_id: String::new(),
            x,
            y,
            px: x as i64 * TILE_SIZE,
            py: y as i64 * TILE_SIZE,
            facing: Facing::S,
            sprite_ref: "base:van".to_string(),
            display_name,
            mode: MoveMode::Van,
            vehicle: None,
            last_seq: 0,
            intent: None,
        }
    }
}

/// One decoded `pos_sync` frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosReport {
    pub px: f64,
    pub py: f64,
    pub facing: Option<Facing>,
    pub mode: Option<MoveMode>,
    pub vpx: Option<f64>,
    pub vpy: Option<f64>,
    pub vf: Option<Facing>,
}

/// Collapse a raw move vector to one axis step. Horizontal wins on
/// diagonals so prediction and server agree.
pub fn normalize_move(mv: MoveVec) -> (i32, i32) {
    let dx = mv.x.signum() as i32 * MOVE_SPEED;
    let mut dy = mv.y.signum() as i32 * MOVE_SPEED;
    if dx != 0 && dy != 0 {
        dy = 0;
    }
    (dx, dy)
}

fn wire_snapshot(e: &Entity) -> PlayerSnapshot {
    PlayerSnapshot {
        id: e.id.clone(),
        x: e.x,
        y: e.y,
        facing: e.facing,
        sprite_ref: e.sprite_ref.clone(),
        dn: (!e.display_name.is_empty()).then(|| e.display_name.clone()),
    }
}

fn pos_entry(e: &Entity) -> PosEntry {
    PosEntry(
        e.id.clone(),
        e.px,
        e.py,
        e.facing,
        e.mode,
        e.vehicle.map(|v| v.px),
        e.vehicle.map(|v| v.py),
        e.vehicle.map(|v| v.facing),
        e.display_name.clone(),
    )
}

pub struct Zone {
    id: ZoneId,
    kind: ZoneKind,
    bounds: Bounds,
    spawn: (i32, i32),
    collision: Arc<CollisionGrid>,
    collision_descriptor: CollisionDescriptor,
    entities: HashMap<EntityId, Entity>,
    by_account: HashMap<AccountId, EntityId>,
    conns: HashMap<EntityId, ConnTx>,
    aoi: AoiGrid,
    dirty_upserts: HashMap<EntityId, PlayerSnapshot>,
    dirty_pos: HashMap<EntityId, PosEntry>,
    dirty_removes: HashSet<EntityId>,
    pending_teleports: HashMap<EntityId, PlayerSnapshot>,
    tick_id: u64,
    presence: Arc<PresenceCache>,
}

impl Zone {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ZoneId,
        bounds: Bounds,
        spawn: (i32, i32),
        collision: Arc<CollisionGrid>,
        collision_descriptor: CollisionDescriptor,
        aoi_cell_size: i32,
        presence: Arc<PresenceCache>,
    ) -> Self {
        let kind = zone_kind_or_world(&id);
        Self {
            id,
            kind,
            bounds,
            spawn,
            collision,
            collision_descriptor,
            entities: HashMap::new(),
            by_account: HashMap::new(),
            conns: HashMap::new(),
            aoi: AoiGrid::new(aoi_cell_size),
            dirty_upserts: HashMap::new(),
            dirty_pos: HashMap::new(),
            dirty_removes: HashSet::new(),
            pending_teleports: HashMap::new(),
            tick_id: 0,
            presence,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn spawn(&self) -> (i32, i32) {
        self.spawn
    }

    pub fn collision_descriptor(&self) -> &CollisionDescriptor {
        &self.collision_descriptor
    }

    pub fn tick_id(&self) -> u64 {
        self.tick_id
    }

    pub fn player_count(&self) -> usize {
        self.entities.len()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn is_deserted(&self) -> bool {
        self.entities.is_empty() && self.conns.is_empty()
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Register an entity at its current coordinates.
    pub fn add_entity(&mut self, mut entity: Entity, tx: Option<ConnTx>, now_ms: u64) -> EntityId {
        entity.zone_id = self.id.clone();
        let eid = entity.id.clone();
        self.by_account.insert(entity.account_id.clone(), eid.clone());
        self.aoi.add_player(&eid, entity.x, entity.y);
        if let Some(tx) = tx {
            self.conns.insert(eid.clone(), tx);
        }
        self.presence.update(
            &entity.account_id,
            &self.id,
            entity.x,
            entity.y,
            entity.facing,
            &entity.sprite_ref,
            now_ms,
        );
        self.entities.insert(eid.clone(), entity);
        eid
    }

    /// Register an entity at the zone spawn point with reset input state.
    /// Used for fresh joins and transfers.
    pub fn add_conn(&mut self, mut entity: Entity, tx: Option<ConnTx>, now_ms: u64) -> EntityId {
        let (sx, sy) = self.spawn;
        entity.x = sx;
        entity.y = sy;
        entity.px = sx as i64 * TILE_SIZE;
        entity.py = sy as i64 * TILE_SIZE;
        entity.last_seq = 0;
        entity.intent = None;
        self.add_entity(entity, tx, now_ms)
    }

    /// Remove an entity and queue a removal delta for everyone else.
    pub fn remove_entity(&mut self, entity_id: &str) -> Option<Entity> {
        let entity = self.entities.remove(entity_id)?;
        self.by_account.remove(&entity.account_id);
        self.conns.remove(entity_id);
        self.aoi.remove_player(entity_id);
        self.dirty_pos.remove(entity_id);
        self.pending_teleports.remove(entity_id);
        self.dirty_removes.insert(entity_id.to_string());
        Some(entity)
    }

    /// Detach a connection's entity, handing it back for transfer.
    pub fn remove_conn(&mut self, entity_id: &str) -> Option<Entity> {
        self.remove_entity(entity_id)
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.get(entity_id)
    }

    pub fn entity_id_for_account(&self, account_id: &str) -> Option<EntityId> {
        self.by_account.get(account_id).cloned()
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        self.by_account.contains_key(account_id)
    }

    pub fn conn_tx(&self, entity_id: &str) -> Option<ConnTx> {
        self.conns.get(entity_id).cloned()
    }

    pub fn set_facing(&mut self, entity_id: &str, facing: Facing) {
        if let Some(e) = self.entities.get_mut(entity_id) {
            e.facing = facing;
        }
    }

    /// Re-skin an entity (accepted sprite submission). The new ref also goes
    /// into presence so it survives disconnect and resume.
    pub fn set_sprite_ref(&mut self, entity_id: &str, sprite_ref: &str, now_ms: u64) {
        let Self {
            id: zone_id,
            entities,
            presence,
            ..
        } = self;
        if let Some(e) = entities.get_mut(entity_id) {
            e.sprite_ref = sprite_ref.to_string();
            presence.update(&e.account_id, zone_id, e.x, e.y, e.facing, &e.sprite_ref, now_ms);
        }
    }

    // -----------------------------------------------------------------------
    // Input and movement
    // -----------------------------------------------------------------------

    /// Accept one input frame. Frames at or below the entity's last applied
    /// sequence are dropped without touching any state.
    pub fn apply_input(
        &mut self,
        entity_id: &str,
        seq: i64,
        mv: MoveVec,
        facing: Option<Facing>,
        keys: Option<serde_json::Value>,
    ) -> bool {
        let Some(e) = self.entities.get_mut(entity_id) else {
            return false;
        };
        if seq <= e.last_seq {
            return false;
        }
        e.last_seq = seq;
        e.intent = Some(Intent { mv, facing, keys });
        true
    }

    /// Discrete reposition: clamp, clear held intent, reset pixel position,
    /// and queue a full upsert for the next tick.
    pub fn teleport_entity(&mut self, entity_id: &str, x: f64, y: f64, now_ms: u64) -> bool {
        let Self {
            id: zone_id,
            bounds,
            entities,
            aoi,
            pending_teleports,
            presence,
            ..
        } = self;
        let Some(e) = entities.get_mut(entity_id) else {
            return false;
        };
        let (nx, ny) = bounds.clamp(x.round() as i32, y.round() as i32);
        e.x = nx;
        e.y = ny;
        e.px = nx as i64 * TILE_SIZE;
        e.py = ny as i64 * TILE_SIZE;
        e.intent = None;
        aoi.move_player(entity_id, nx, ny);
        pending_teleports.insert(e.id.clone(), wire_snapshot(e));
        presence.update(&e.account_id, zone_id, nx, ny, e.facing, &e.sprite_ref, now_ms);
        true
    }

    /// Fold a client pixel-position report into the entity. The derived tile
    /// keeps interest management and presence current; the report is marked
    /// for broadcast only past a small movement threshold.
    pub fn pos_sync(&mut self, entity_id: &str, report: &PosReport, now_ms: u64) {
        let Self {
            id: zone_id,
            bounds,
            entities,
            aoi,
            dirty_pos,
            presence,
            ..
        } = self;
        let Some(e) = entities.get_mut(entity_id) else {
            return;
        };
        let max_px = (bounds.w as i64 * TILE_SIZE - 1).max(0);
        let max_py = (bounds.h as i64 * TILE_SIZE - 1).max(0);
        let px = (report.px.round() as i64).clamp(0, max_px);
        let py = (report.py.round() as i64).clamp(0, max_py);
        let prev = (e.px, e.py, e.facing, e.mode);
        e.px = px;
        e.py = py;
        if let Some(f) = report.facing {
            e.facing = f;
        }
        if let Some(m) = report.mode {
            e.mode = m;
        }
        match e.mode {
            MoveMode::Foot => {
                if let (Some(vx), Some(vy)) = (report.vpx, report.vpy) {
                    e.vehicle = Some(VehicleState {
                        px: vx.round() as i64,
                        py: vy.round() as i64,
                        facing: report.vf.unwrap_or(Facing::S),
                    });
                }
            }
            MoveMode::Van => e.vehicle = None,
        }
        let (tx, ty) = bounds.clamp((px / TILE_SIZE) as i32, (py / TILE_SIZE) as i32);
        if (tx, ty) != (e.x, e.y) {
            e.x = tx;
            e.y = ty;
            aoi.move_player(entity_id, tx, ty);
        }
        let dirty = (px - prev.0).abs() >= POS_DIRTY_PX
            || (py - prev.1).abs() >= POS_DIRTY_PX
            || e.facing != prev.2
            || e.mode != prev.3;
        if dirty {
            dirty_pos.insert(e.id.clone(), pos_entry(e));
            presence.update(&e.account_id, zone_id, e.x, e.y, e.facing, &e.sprite_ref, now_ms);
        }
    }

    /// Advance one simulation step: apply teleports, then every held intent.
    /// Intents persist across ticks until replaced.
    pub fn tick(&mut self, now_ms: u64) {
        self.tick_id += 1;
        let Self {
            id: zone_id,
            bounds,
            collision,
            entities,
            aoi,
            dirty_upserts,
            pending_teleports,
            presence,
            ..
        } = self;
        dirty_upserts.clear();
        for (eid, snap) in pending_teleports.drain() {
            dirty_upserts.insert(eid, snap);
        }
        for e in entities.values_mut() {
            let Some(intent) = e.intent.as_ref() else {
                continue;
            };
            let mut dirty = false;
            if let Some(f) = intent.facing {
                if f != e.facing {
                    e.facing = f;
                    dirty = true;
                }
            }
            let (dx, dy) = normalize_move(intent.mv);
            if dx != 0 || dy != 0 {
                // An attempted move is always broadcast, even when blocked
                // or clamped, so predicting clients get corrected.
                dirty = true;
                let (nx, ny) = bounds.clamp(e.x + dx, e.y + dy);
                if !collision.is_blocked(nx, ny) && (nx, ny) != (e.x, e.y) {
                    e.x = nx;
                    e.y = ny;
                    e.px = nx as i64 * TILE_SIZE;
                    e.py = ny as i64 * TILE_SIZE;
                    aoi.move_player(&e.id, nx, ny);
                }
            }
            if dirty {
                dirty_upserts.insert(e.id.clone(), wire_snapshot(e));
                presence.update(&e.account_id, zone_id, e.x, e.y, e.facing, &e.sprite_ref, now_ms);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Fan accumulated dirt out to connections. Upserts and pixel updates
    /// reach the mover's AOI neighborhood, removals reach the whole zone,
    /// and each recipient's delta carries its own input ack. At most one
    /// delta and one pos_batch per connection per tick.
    pub fn broadcast_deltas(&mut self, global_tick: u64) {
        if self.dirty_upserts.is_empty()
            && self.dirty_removes.is_empty()
            && self.dirty_pos.is_empty()
        {
            return;
        }
        let removes: Vec<EntityId> = self.dirty_removes.iter().cloned().collect();
        let mut upsert_buckets: HashMap<EntityId, Vec<PlayerSnapshot>> = HashMap::new();
        let mut pos_buckets: HashMap<EntityId, Vec<PosEntry>> = HashMap::new();
        for (mover_id, snap) in &self.dirty_upserts {
            let Some(cell) = self.aoi.cell_of(mover_id) else {
                continue;
            };
            // The mover is its own neighbor: its delta carries the ack that
            // drives client-side reconciliation.
            for rid in self.aoi.neighbor_players(cell, "") {
                if self.conns.contains_key(&rid) {
                    upsert_buckets.entry(rid).or_default().push(snap.clone());
                }
            }
        }
        for (mover_id, entry) in &self.dirty_pos {
            let Some(cell) = self.aoi.cell_of(mover_id) else {
                continue;
            };
            for rid in self.aoi.neighbor_players(cell, mover_id) {
                if self.conns.contains_key(&rid) {
                    pos_buckets.entry(rid).or_default().push(entry.clone());
                }
            }
        }
        let recipients: Vec<EntityId> = if removes.is_empty() {
            upsert_buckets.keys().cloned().collect()
        } else {
            self.conns.keys().cloned().collect()
        };
        for rid in recipients {
            let Some(tx) = self.conns.get(&rid) else {
                continue;
            };
            let upserts = upsert_buckets.remove(&rid).unwrap_or_default();
            if upserts.is_empty() && removes.is_empty() {
                continue;
            }
            let ack = self.entities.get(&rid).map_or(0, |e| e.last_seq);
            let _ = tx.send(ServerMsg::Delta {
                v: PROTOCOL_VERSION,
                zone: self.id.clone(),
                tick: global_tick,
                ack: Ack { seq: ack },
                upserts,
                removes: removes.clone(),
            });
        }
        for (rid, p) in pos_buckets {
            let Some(tx) = self.conns.get(&rid) else {
                continue;
            };
            let _ = tx.send(ServerMsg::PosBatch {
                v: PROTOCOL_VERSION,
                zone: self.id.clone(),
                tick: global_tick,
                p,
            });
        }
        self.dirty_removes.clear();
        self.dirty_pos.clear();
    }

    /// Immediate one-entity upsert to every other connection, used when a
    /// player joins or arrives by transfer.
    pub fn broadcast_arrival(&self, entity_id: &str) {
        let Some(snap) = self.wire_snapshot_of(entity_id) else {
            return;
        };
        for (rid, tx) in &self.conns {
            if rid == entity_id {
                continue;
            }
            let ack = self.entities.get(rid).map_or(0, |e| e.last_seq);
            let _ = tx.send(ServerMsg::Delta {
                v: PROTOCOL_VERSION,
                zone: self.id.clone(),
                tick: self.tick_id,
                ack: Ack { seq: ack },
                upserts: vec![snap.clone()],
                removes: Vec::new(),
            });
        }
    }

    /// Immediate removal delta to every remaining connection.
    pub fn broadcast_removal(&self, entity_id: &str) {
        for (rid, tx) in &self.conns {
            if rid == entity_id {
                continue;
            }
            let ack = self.entities.get(rid).map_or(0, |e| e.last_seq);
            let _ = tx.send(ServerMsg::Delta {
                v: PROTOCOL_VERSION,
                zone: self.id.clone(),
                tick: self.tick_id,
                ack: Ack { seq: ack },
                upserts: Vec::new(),
                removes: vec![entity_id.to_string()],
            });
        }
    }

    /// Zone-wide fanout for frames that are not AOI-scoped, such as sprite
    /// updates. The sender's own connection is included.
    pub fn broadcast_all(&self, msg: &ServerMsg) {
        for tx in self.conns.values() {
            let _ = tx.send(msg.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Every entity in the zone, for join and transfer snapshots.
    pub fn build_snapshot_for(&self) -> Vec<PlayerSnapshot> {
        self.entities.values().map(wire_snapshot).collect()
    }

    /// Entities visible from `entity_id`'s AOI neighborhood, excluding it.
    pub fn get_visible_snapshots(&self, entity_id: &str) -> Vec<PlayerSnapshot> {
        self.aoi
            .visible_players(entity_id)
            .iter()
            .filter_map(|id| self.entities.get(id).map(wire_snapshot))
            .collect()
    }

    pub fn wire_snapshot_of(&self, entity_id: &str) -> Option<PlayerSnapshot> {
        self.entities.get(entity_id).map(wire_snapshot)
    }
}
