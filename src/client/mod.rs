//! Sans-IO world client: prediction, reconciliation, and remote smoothing.
//!
//! `WorldClient` owns no socket and no clock. The host decodes frames off
//! its transport and feeds them to [`WorldClient::handle_message`] with the
//! current time; outgoing traffic comes back as [`ClientMsg`] values from
//! the builder methods, and everything a UI cares about is published on a
//! channel of [`ClientEvent`]s. That keeps the protocol rules testable
//! without a server on the other end.
//!
//! The rules mirror the server zone tick: inputs are applied locally the
//! instant they are built, queued until acknowledged, and replayed on top
//! of every authoritative update, so a mispredicted step heals within one
//! correction instead of rubber-banding.

pub mod interp;
pub mod prediction;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::net::protocol::{
    ActionBody, ClientMsg, ErrorCode, Facing, MoveMode, MoveVec, ResumeInfo, ServerEvent,
    ServerInfo, ServerMsg, YouRef, PROTOCOL_VERSION,
};
use crate::util::ids::{AccountId, ZoneId};
use crate::zones::bounds::Bounds;
use crate::zones::collision::{decode_bitset_rle, CollisionDescriptor};
use crate::zones::zone::TILE_SIZE;

use interp::{RemoteSet, RenderPos, VanPark};
use prediction::Predictor;

/// Position reports are paced to at most one per interval.
pub const POS_SYNC_INTERVAL_MS: u64 = 100;
/// Rounded pixel delta below this is not worth a report.
pub const POS_SEND_THRESHOLD_PX: i64 = 2;
/// A report goes out at least this often while connected, moving or not.
pub const POS_KEEPALIVE_MS: u64 = 2_000;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// State changes the host renders or reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Joined {
        you: YouRef,
        resume: ResumeInfo,
        server: ServerInfo,
    },
    SnapshotApplied {
        zone: ZoneId,
        players: usize,
    },
    TransferBegan {
        from: ZoneId,
        to: ZoneId,
    },
    TransferCommitted {
        zone: ZoneId,
    },
    CollisionUpdated {
        zone: ZoneId,
    },
    SpriteResult {
        ok: bool,
        sprite_ref: Option<String>,
        error: Option<String>,
        retry_after_ms: Option<u64>,
    },
    SpriteAnnounced {
        account_id: AccountId,
        ugc_id: String,
        sprite_ref: String,
    },
    ServerError {
        code: ErrorCode,
        msg: String,
        fatal: bool,
    },
}

// ---------------------------------------------------------------------------
// Position report cadence
// ---------------------------------------------------------------------------

/// Decides when a pixel position report is due: never more often than the
/// interval, and then only on a real change or the keepalive timeout.
#[derive(Default)]
pub struct PosSyncCadence {
    last_send_ms: u64,
    last_px: i64,
    last_py: i64,
    last_facing: Facing,
    last_mode: MoveMode,
    primed: bool,
}

impl PosSyncCadence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_send(
        &mut self,
        now_ms: u64,
        px: i64,
        py: i64,
        facing: Facing,
        mode: MoveMode,
    ) -> bool {
        let since = now_ms.saturating_sub(self.last_send_ms);
        if self.primed && since < POS_SYNC_INTERVAL_MS {
            return false;
        }
        let due = !self.primed
            || since >= POS_KEEPALIVE_MS
            || mode != self.last_mode
            || facing != self.last_facing
            || (px - self.last_px).abs() >= POS_SEND_THRESHOLD_PX
            || (py - self.last_py).abs() >= POS_SEND_THRESHOLD_PX;
        if due {
            self.primed = true;
            self.last_send_ms = now_ms;
            self.last_px = px;
            self.last_py = py;
            self.last_facing = facing;
            self.last_mode = mode;
        }
        due
    }
}

// ---------------------------------------------------------------------------
// World client
// ---------------------------------------------------------------------------

pub struct WorldClient {
    events: Sender<ClientEvent>,
    you: Option<YouRef>,
    server: Option<ServerInfo>,
    zone: Option<ZoneId>,
    last_tick: u64,
    frozen: bool,
    next_seq: i64,
    predictor: Predictor,
    remotes: RemoteSet,
    self_render: RenderPos,
    self_sprite: Option<String>,
    bounds: Option<Bounds>,
    collision_hash: Option<String>,
    cadence: PosSyncCadence,
}

impl WorldClient {
    pub fn new() -> (Self, Receiver<ClientEvent>) {
        let (tx, rx) = unbounded();
        let client = Self {
            events: tx,
            you: None,
            server: None,
            zone: None,
            last_tick: 0,
            frozen: false,
            next_seq: 0,
            predictor: Predictor::new(),
            remotes: RemoteSet::new(),
            self_render: RenderPos::default(),
            self_sprite: None,
            bounds: None,
            collision_hash: None,
            cadence: PosSyncCadence::new(),
        };
        (client, rx)
    }

    // -- outgoing ----------------------------------------------------------

    pub fn hello(token: &str, zone: Option<&str>, resume: bool, dn: Option<&str>) -> ClientMsg {
        ClientMsg::Hello {
            v: Some(PROTOCOL_VERSION),
            token: Some(token.to_string()),
            zone: zone.map(str::to_string),
            resume: Some(resume),
            dn: dn.map(str::to_string),
        }
    }

    pub fn sprite_submission(
        base_sprite_key: &str,
        width: f64,
        height: f64,
        rows: Vec<serde_json::Value>,
    ) -> ClientMsg {
        ClientMsg::UgcSubmit {
            base_sprite_key: base_sprite_key.to_string(),
            width,
            height,
            rows,
        }
    }

    /// Build one movement input and apply it to the local prediction.
    /// Returns `None` before the join completes and while a transfer has
    /// input frozen; those intents are dropped, not queued.
    pub fn local_input(&mut self, mv: MoveVec, facing: Option<Facing>) -> Option<ClientMsg> {
        if self.you.is_none() || self.frozen {
            return None;
        }
        self.next_seq += 1;
        self.predictor.predict(self.next_seq, mv);
        Some(ClientMsg::Input {
            seq: self.next_seq,
            mv,
            facing,
            keys: None,
        })
    }

    /// Build a pixel position report if the cadence says one is due.
    /// Vehicle fields ride along only while on foot.
    pub fn pos_report(
        &mut self,
        now_ms: u64,
        px: f64,
        py: f64,
        facing: Facing,
        mode: MoveMode,
        vehicle: Option<VanPark>,
    ) -> Option<ClientMsg> {
        if self.you.is_none() || self.frozen {
            return None;
        }
        let rpx = px.round();
        let rpy = py.round();
        if !self
            .cadence
            .should_send(now_ms, rpx as i64, rpy as i64, facing, mode)
        {
            return None;
        }
        let van = vehicle.filter(|_| mode == MoveMode::Foot);
        Some(ClientMsg::PosSync {
            px: rpx,
            py: rpy,
            facing: Some(facing),
            mode: Some(mode),
            vpx: van.map(|v| v.px),
            vpy: van.map(|v| v.py),
            vf: van.map(|v| v.facing),
        })
    }

    pub fn request_transfer(&mut self, to: &str) -> Option<ClientMsg> {
        if self.you.is_none() || self.frozen {
            return None;
        }
        self.next_seq += 1;
        Some(ClientMsg::Action {
            seq: self.next_seq,
            body: ActionBody::Transfer { to: to.to_string() },
        })
    }

    /// Build an in-zone teleport request and move locally right away; the
    /// snapshot that follows the ack corrects if the server clamped it.
    pub fn request_spawn(&mut self, x: i32, y: i32) -> ClientMsg {
        self.predictor.force_position(x, y);
        let (px, py) = self.predicted_px();
        self.self_render.snap_to(px, py);
        self.next_seq += 1;
        ClientMsg::Action {
            seq: self.next_seq,
            body: ActionBody::SpawnPos {
                x: Some(x as f64),
                y: Some(y as f64),
            },
        }
    }

    pub fn request_collision(&mut self) -> ClientMsg {
        self.next_seq += 1;
        ClientMsg::Action {
            seq: self.next_seq,
            body: ActionBody::CollisionRequest,
        }
    }

    // -- incoming ----------------------------------------------------------

    /// Apply one decoded server frame. Zone-scoped traffic that names a
    /// different zone than the one this client is in is discarded; during
    /// a transfer that is exactly the stale tail from the source zone.
    pub fn handle_message(&mut self, msg: ServerMsg, now_ms: u64) {
        match msg {
            ServerMsg::HelloOk {
                you,
                resume,
                server,
                ..
            } => {
                self.zone = you.zone.clone();
                self.you = Some(you.clone());
                self.server = Some(server);
                self.emit(ClientEvent::Joined {
                    you,
                    resume,
                    server,
                });
            }
            ServerMsg::Snapshot {
                zone,
                tick,
                ack,
                players,
                bounds,
                collision,
                ..
            } => {
                if !self.in_zone(&zone) {
                    return;
                }
                self.last_tick = tick;
                if let Some(b) = bounds {
                    self.bounds = Some(b);
                    self.predictor.set_bounds(b);
                }
                if let Some(desc) = &collision {
                    if self.apply_collision(desc) {
                        self.emit(ClientEvent::CollisionUpdated { zone: zone.clone() });
                    }
                }
                self.predictor.process_ack(ack.seq);
                self.remotes.clear();
                let count = players.len();
                for p in &players {
                    if self.is_me(&p.id) {
                        self.predictor.apply_authoritative(p.x, p.y);
                        let (px, py) = self.predicted_px();
                        self.self_render.snap_to(px, py);
                    } else {
                        self.remotes.upsert_snapshot(p, now_ms);
                    }
                }
                self.frozen = false;
                self.emit(ClientEvent::SnapshotApplied {
                    zone,
                    players: count,
                });
            }
            ServerMsg::Delta {
                zone,
                tick,
                ack,
                upserts,
                removes,
                ..
            } => {
                if !self.in_zone(&zone) {
                    return;
                }
                self.last_tick = tick;
                self.predictor.process_ack(ack.seq);
                for p in &upserts {
                    if self.is_me(&p.id) {
                        self.predictor.apply_authoritative(p.x, p.y);
                    } else {
                        self.remotes.upsert_snapshot(p, now_ms);
                    }
                }
                for id in &removes {
                    if !self.is_me(id) {
                        self.remotes.remove(id);
                    }
                }
            }
            ServerMsg::PosBatch { zone, tick, p, .. } => {
                if !self.in_zone(&zone) {
                    return;
                }
                self.last_tick = tick;
                for entry in &p {
                    if !self.is_me(&entry.0) {
                        self.remotes.apply_pos_entry(entry, now_ms);
                    }
                }
            }
            ServerMsg::TransferBegin { from, to, .. } => {
                self.frozen = true;
                self.remotes.clear();
                self.predictor.reset();
                self.predictor.clear_collision();
                self.collision_hash = None;
                self.self_render = RenderPos::default();
                self.emit(ClientEvent::TransferBegan { from, to });
            }
            ServerMsg::TransferCommit { zone, you, .. } => {
                self.zone = Some(zone.clone());
                if let Some(me) = &mut self.you {
                    me.entity_id = you.entity_id;
                    me.account_id = you.account_id;
                }
                self.emit(ClientEvent::TransferCommitted { zone });
            }
            ServerMsg::Event { body, .. } => match body {
                ServerEvent::CollisionFull { zone, collision } => {
                    if self.in_zone(&zone) && self.apply_collision(&collision) {
                        self.emit(ClientEvent::CollisionUpdated { zone });
                    }
                }
                // the roster snapshot preceding the ack already moved us
                ServerEvent::SpawnAck { .. } => {}
            },
            ServerMsg::UgcResult {
                ok,
                sprite_ref,
                error,
                retry_after_ms,
                ..
            } => {
                self.emit(ClientEvent::SpriteResult {
                    ok,
                    sprite_ref,
                    error,
                    retry_after_ms,
                });
            }
            ServerMsg::UgcUpdate {
                zone,
                account_id,
                ugc_id,
                sprite_ref,
                ..
            } => {
                if !self.in_zone(&zone) {
                    return;
                }
                if self.you.as_ref().is_some_and(|me| me.account_id == account_id) {
                    self.self_sprite = Some(sprite_ref.clone());
                }
                self.emit(ClientEvent::SpriteAnnounced {
                    account_id,
                    ugc_id,
                    sprite_ref,
                });
            }
            ServerMsg::Error {
                code, msg, fatal, ..
            } => {
                self.emit(ClientEvent::ServerError { code, msg, fatal });
            }
        }
    }

    // -- rendering ---------------------------------------------------------

    /// One render-loop step: ease the local player toward its predicted
    /// tile, advance remote interpolation, and drop stale remotes.
    pub fn render_tick(&mut self, now_ms: u64) {
        let (tx, ty) = self.predicted_px();
        self.self_render.step_toward(tx, ty);
        self.remotes.advance(now_ms);
        self.remotes.sweep_stale(now_ms);
    }

    // -- accessors ---------------------------------------------------------

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    pub fn you(&self) -> Option<&YouRef> {
        self.you.as_ref()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server
    }

    pub fn predicted(&self) -> (i32, i32) {
        self.predictor.predicted()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn remotes(&self) -> &RemoteSet {
        &self.remotes
    }

    pub fn self_render(&self) -> RenderPos {
        self.self_render
    }

    pub fn self_sprite(&self) -> Option<&str> {
        self.self_sprite.as_deref()
    }

    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    // -- internals ---------------------------------------------------------

    fn in_zone(&self, zone: &str) -> bool {
        self.zone.as_deref() == Some(zone)
    }

    fn is_me(&self, id: &str) -> bool {
        self.you.as_ref().is_some_and(|me| me.entity_id == id)
    }

    fn predicted_px(&self) -> (f64, f64) {
        let (x, y) = self.predictor.predicted();
        ((x as i64 * TILE_SIZE) as f64, (y as i64 * TILE_SIZE) as f64)
    }

    /// Install a collision descriptor. A matching hash means the cached
    /// grid is already current; an unknown format clears it so prediction
    /// falls back to permissive. Returns whether the grid changed.
    fn apply_collision(&mut self, desc: &CollisionDescriptor) -> bool {
        if desc.format != "bitset_rle" || desc.data.is_empty() {
            self.predictor.clear_collision();
            self.collision_hash = None;
            return false;
        }
        if self.collision_hash.as_deref() == Some(desc.hash.as_str()) {
            return false;
        }
        let Some(bounds) = self.bounds else {
            return false;
        };
        self.predictor
            .set_collision(decode_bitset_rle(&desc.data, bounds.w, bounds.h));
        self.collision_hash = Some(desc.hash.clone());
        true
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
