//! Per-connection session orchestration.
//!
//! One task owns each WebSocket. Inbound frames feed the synchronous
//! [`ConnState`] machine; every game effect goes through [`ServerContext`],
//! and outbound frames go to the connection's unbounded channel, so zone
//! code never blocks on a slow socket. A fatal error frame closes the
//! socket with its mapped close code right after it is written.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ServerContext, DEFAULT_ZONE};
use crate::net::protocol::{
    decode_client, encode_server, hello_error, validate_move, Ack, ActionBody, ClientMsg, DirInfo,
    ErrorCode, PlayerSnapshot, ServerEvent, ServerInfo, ServerMsg, TilePos, YouRef,
    PROTOCOL_VERSION,
};
use crate::ugc::UgcOutcome;
use crate::util::ids::{AccountId, EntityId, ZoneId};
use crate::util::now_ms;
use crate::zones::directory::DIR_REFRESH_SEC;
use crate::zones::id::is_valid_zone_id;
use crate::zones::manager::SharedZone;
use crate::zones::zone::{ConnTx, PosReport, Zone};

/// How long a connection may sit unauthenticated before the socket closes.
pub const AUTH_TIMEOUT_MS: u64 = 5_000;
/// Minimum gap between `INPUT_IGNORED_TRANSFER` notices to one client.
pub const TRANSFER_IGNORE_NOTIFY_MS: u64 = 1_000;
/// Floor on client position report frequency; faster reports are dropped.
pub const POS_SYNC_MIN_MS: u64 = 40;

/// Where an in-flight transfer got to, recorded so a disconnect mid-transfer
/// can be resolved to a sane resume target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferPhase {
    BeginSent,
    CommitSent,
    SnapshotSent,
}

#[derive(Debug, Clone)]
struct PendingTransfer {
    from: ZoneId,
    to: ZoneId,
    phase: TransferPhase,
}

/// Marker: a fatal frame has been queued and the socket should stop reading.
struct SessionClosed;

/// Synchronous per-connection state machine. The socket pump feeds decoded
/// frames in and ships queued [`ServerMsg`] frames out.
pub struct ConnState {
    ctx: Arc<ServerContext>,
    conn_id: Uuid,
    tx: ConnTx,
    account_id: Option<AccountId>,
    entity_id: Option<EntityId>,
    zone_id: Option<ZoneId>,
    zone: Option<SharedZone>,
    transferring: bool,
    pending_transfer: Option<PendingTransfer>,
    last_pos_sync_ms: u64,
    last_transfer_notice_ms: u64,
}

impl ConnState {
    pub fn new(ctx: Arc<ServerContext>, conn_id: Uuid, tx: ConnTx) -> Self {
        Self {
            ctx,
            conn_id,
            tx,
            account_id: None,
            entity_id: None,
            zone_id: None,
            zone: None,
            transferring: false,
            pending_transfer: None,
            last_pos_sync_ms: 0,
            last_transfer_notice_ms: 0,
        }
    }

    pub fn is_authed(&self) -> bool {
        self.account_id.is_some()
    }

    fn send(&self, msg: ServerMsg) {
        let _ = self.tx.send(msg);
    }

    fn send_error(&self, code: ErrorCode, msg: impl Into<String>, fatal: bool) {
        self.send(ServerMsg::error(code, msg, fatal));
    }

    fn fatal(&self, code: ErrorCode, msg: impl Into<String>) -> SessionClosed {
        self.send_error(code, msg, true);
        SessionClosed
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Feed one decoded frame through the session. `Err` means a fatal error
    /// frame is queued and the connection should stop reading.
    fn route_message(&mut self, msg: ClientMsg, now_ms: u64) -> Result<(), SessionClosed> {
        if !self.is_authed() {
            return match msg {
                ClientMsg::Hello {
                    v,
                    token,
                    zone,
                    resume,
                    dn,
                } => self.handle_hello(v, token, zone, resume, dn, now_ms),
                _ => Err(self.fatal(ErrorCode::MessageInvalid, "Invalid hello message")),
            };
        }
        if self.transferring {
            self.route_while_transferring(msg, now_ms);
            return Ok(());
        }
        match msg {
            ClientMsg::Hello { .. } => {
                self.send_error(ErrorCode::MessageInvalid, "unexpected hello", false);
            }
            ClientMsg::Input {
                seq,
                mv,
                facing,
                keys,
            } => {
                if !validate_move(&mv) {
                    self.send_error(ErrorCode::InputInvalid, "move component out of range", false);
                } else if let (Some(zone), Some(entity_id)) =
                    (self.zone.as_ref(), self.entity_id.as_deref())
                {
                    zone.lock().apply_input(entity_id, seq, mv, facing, keys);
                }
            }
            ClientMsg::PosSync {
                px,
                py,
                facing,
                mode,
                vpx,
                vpy,
                vf,
            } => {
                if now_ms.saturating_sub(self.last_pos_sync_ms) < POS_SYNC_MIN_MS {
                    return Ok(());
                }
                self.last_pos_sync_ms = now_ms;
                if let (Some(zone), Some(entity_id)) =
                    (self.zone.as_ref(), self.entity_id.as_deref())
                {
                    let report = PosReport {
                        px,
                        py,
                        facing,
                        mode,
                        vpx,
                        vpy,
                        vf,
                    };
                    zone.lock().pos_sync(entity_id, &report, now_ms);
                }
            }
            ClientMsg::Action { seq: _, body } => match body {
                ActionBody::Transfer { to } => self.handle_transfer(&to, now_ms),
                ActionBody::CollisionRequest => self.handle_collision_request(),
                ActionBody::SpawnPos { x, y } => self.handle_spawn_pos(x, y, now_ms),
            },
            ClientMsg::UgcSubmit {
                base_sprite_key,
                width,
                height,
                rows,
            } => self.handle_ugc(&base_sprite_key, width, height, &rows, now_ms),
        }
        Ok(())
    }

    /// During a transfer only inputs and repeat transfer requests get a
    /// reply; everything else is dropped so stale state cannot leak across
    /// zones. Input notices are rate limited per connection.
    fn route_while_transferring(&mut self, msg: ClientMsg, now_ms: u64) {
        match msg {
            ClientMsg::Input { .. } => {
                if now_ms.saturating_sub(self.last_transfer_notice_ms) >= TRANSFER_IGNORE_NOTIFY_MS
                {
                    self.last_transfer_notice_ms = now_ms;
                    self.send_error(
                        ErrorCode::InputIgnoredTransfer,
                        "transfer in progress",
                        false,
                    );
                }
            }
            ClientMsg::Action {
                body: ActionBody::Transfer { .. },
                ..
            } => {
                self.send_error(
                    ErrorCode::TransferAlreadyInProgress,
                    "transfer in progress",
                    false,
                );
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn handle_hello(
        &mut self,
        v: Option<u32>,
        token: Option<String>,
        zone: Option<String>,
        resume: Option<bool>,
        dn: Option<String>,
        now_ms: u64,
    ) -> Result<(), SessionClosed> {
        if let Some(code) = hello_error(v, token.as_deref(), zone.as_deref()) {
            let msg = match code {
                ErrorCode::VersionMismatch => format!(
                    "Server requires v{PROTOCOL_VERSION}, got {}",
                    v.map_or_else(|| "none".to_string(), |n| format!("v{n}"))
                ),
                ErrorCode::AuthRequired => "Missing or invalid token in hello".to_string(),
                ErrorCode::ZoneInvalid => {
                    format!("Invalid zone format: {}", zone.as_deref().unwrap_or(""))
                }
                _ => "Invalid hello message".to_string(),
            };
            return Err(self.fatal(code, msg));
        }
        let token = token.unwrap_or_default();
        let claims = match self.ctx.auth.verify(&token) {
            Ok(claims) => claims,
            Err(e) => return Err(self.fatal(ErrorCode::AuthRequired, e.to_string())),
        };
        let account_id = claims.account_id.clone();
        if let Some(replaced) = self
            .ctx
            .register_conn(&account_id, self.conn_id, self.tx.clone())
        {
            let _ = replaced.tx.send(ServerMsg::error(
                ErrorCode::ReplacedByNewConnection,
                "connection replaced by a newer login",
                true,
            ));
            self.ctx.remove_player(&account_id, now_ms);
            info!(account = %account_id, "connection replaced by newer login");
        }
        let client_zone = zone.unwrap_or_else(|| DEFAULT_ZONE.to_string());
        let client_resume = resume.unwrap_or(true);
        let display_name = dn
            .filter(|d| !d.is_empty())
            .or_else(|| claims.display_name.clone().filter(|d| !d.is_empty()))
            .unwrap_or_else(|| account_id.chars().take(8).collect());
        let join = self.ctx.add_player_with_resume(
            &account_id,
            &display_name,
            &client_zone,
            client_resume,
            Some(self.tx.clone()),
            now_ms,
        );
        self.account_id = Some(account_id.clone());
        self.entity_id = Some(join.entity_id.clone());
        self.zone_id = Some(join.zone_id.clone());
        self.zone = Some(Arc::clone(&join.zone));
        self.send(ServerMsg::HelloOk {
            v: PROTOCOL_VERSION,
            you: YouRef {
                entity_id: join.entity_id.clone(),
                account_id: account_id.clone(),
                zone: Some(join.zone_id.clone()),
            },
            resume: join.resume,
            server: ServerInfo {
                tick_hz: self.ctx.config.tick_hz,
                aoi_cell: self.ctx.config.aoi_cell_size_tiles,
                resume_ttl_sec: self.ctx.config.resume_ttl_seconds,
            },
            dir: DirInfo {
                ttl_sec: DIR_REFRESH_SEC,
            },
        });
        {
            let guard = join.zone.lock();
            self.send_snapshot(&guard, &join.entity_id, false);
            guard.broadcast_arrival(&join.entity_id);
        }
        info!(
            account = %account_id,
            entity = %join.entity_id,
            zone = %join.zone_id,
            resume = join.resume.applied,
            "player joined"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Zone transfer: route and entrance checks, then the begin, commit,
    /// snapshot sequence. Any failure before the entity moves leaves the
    /// player where they were.
    fn handle_transfer(&mut self, to: &str, now_ms: u64) {
        let (Some(account_id), Some(entity_id), Some(from_id)) = (
            self.account_id.clone(),
            self.entity_id.clone(),
            self.zone_id.clone(),
        ) else {
            return;
        };
        if !is_valid_zone_id(to) {
            self.send_error(
                ErrorCode::TransferInvalidZone,
                format!("invalid zone id: {to}"),
                false,
            );
            return;
        }
        if to == from_id {
            self.send_error(ErrorCode::TransferFailed, "already in zone", false);
            return;
        }
        if let Err(denied) = self.ctx.directory.validate_transfer_route(&from_id, to) {
            self.send_error(denied.code, denied.msg, false);
            return;
        }
        let (x, y) = self
            .zone
            .as_ref()
            .and_then(|z| z.lock().get_entity(&entity_id).map(|e| (e.x, e.y)))
            .unwrap_or((-1, -1));
        let entrance = match self
            .ctx
            .directory
            .check_entrance_eligibility(&from_id, to, x, y)
        {
            Ok(entrance) => entrance,
            Err(denied) => {
                self.send_error(denied.code, denied.msg, false);
                return;
            }
        };
        self.transferring = true;
        self.pending_transfer = Some(PendingTransfer {
            from: from_id.clone(),
            to: to.to_string(),
            phase: TransferPhase::BeginSent,
        });
        self.send(ServerMsg::TransferBegin {
            v: PROTOCOL_VERSION,
            from: from_id.clone(),
            to: to.to_string(),
            reason: "enter_region".to_string(),
            fatal: false,
        });
        let Some(dest) = self
            .ctx
            .zones
            .transfer_entity(&from_id, &entity_id, to, now_ms)
        else {
            self.transferring = false;
            self.pending_transfer = None;
            self.send_error(ErrorCode::TransferFailed, "transfer failed", false);
            return;
        };
        self.zone_id = Some(to.to_string());
        self.zone = Some(Arc::clone(&dest));
        self.set_phase(TransferPhase::CommitSent);
        {
            let mut guard = dest.lock();
            if let Some(facing) = entrance.and_then(|e| e.facing) {
                guard.set_facing(&entity_id, facing);
            }
            self.send(ServerMsg::TransferCommit {
                v: PROTOCOL_VERSION,
                zone: to.to_string(),
                you: YouRef {
                    entity_id: entity_id.clone(),
                    account_id: account_id.clone(),
                    zone: None,
                },
            });
            self.send_snapshot(&guard, &entity_id, true);
            self.set_phase(TransferPhase::SnapshotSent);
            guard.broadcast_arrival(&entity_id);
        }
        self.transferring = false;
        self.pending_transfer = None;
        info!(account = %account_id, from = %from_id, to, "zone transfer complete");
    }

    fn set_phase(&mut self, phase: TransferPhase) {
        if let Some(pending) = self.pending_transfer.as_mut() {
            pending.phase = phase;
        }
    }

    fn handle_spawn_pos(&mut self, x: Option<f64>, y: Option<f64>, now_ms: u64) {
        let (Some(x), Some(y)) = (x, y) else {
            self.send_spawn_nack("bad_xy");
            return;
        };
        let (Some(zone), Some(entity_id)) = (self.zone.clone(), self.entity_id.clone()) else {
            self.send_spawn_nack("no_zone");
            return;
        };
        let mut guard = zone.lock();
        let tele_ok = guard.teleport_entity(&entity_id, x, y, now_ms);
        let pos = guard
            .get_entity(&entity_id)
            .map(|e| TilePos { x: e.x, y: e.y });
        self.send_snapshot(&guard, &entity_id, false);
        let players = guard.player_count();
        drop(guard);
        self.send(ServerMsg::event(ServerEvent::SpawnAck {
            ok: true,
            reason: None,
            tele_ok: Some(tele_ok),
            pos,
            players: Some(players),
        }));
    }

    fn send_spawn_nack(&self, reason: &str) {
        self.send(ServerMsg::event(ServerEvent::SpawnAck {
            ok: false,
            reason: Some(reason.to_string()),
            tele_ok: None,
            pos: None,
            players: None,
        }));
    }

    fn handle_collision_request(&self) {
        let Some(zone) = self.zone.as_ref() else {
            return;
        };
        let guard = zone.lock();
        self.send(ServerMsg::event(ServerEvent::CollisionFull {
            zone: guard.id().to_string(),
            collision: guard.collision_descriptor().clone(),
        }));
    }

    fn handle_ugc(
        &mut self,
        base_sprite_key: &str,
        width: f64,
        height: f64,
        rows: &[serde_json::Value],
        now_ms: u64,
    ) {
        let Some(account_id) = self.account_id.clone() else {
            return;
        };
        match self
            .ctx
            .ugc
            .submit(&account_id, base_sprite_key, width, height, rows, now_ms)
        {
            UgcOutcome::Accepted {
                ugc_id,
                sprite_ref,
                base_sprite_key,
                deduped,
            } => {
                self.send(ServerMsg::UgcResult {
                    v: PROTOCOL_VERSION,
                    ok: true,
                    ugc_id: Some(ugc_id.clone()),
                    sprite_ref: Some(sprite_ref.clone()),
                    base_sprite_key: Some(base_sprite_key.clone()),
                    deduped: Some(deduped),
                    errors: None,
                    error: None,
                    retry_after_ms: None,
                });
                if deduped {
                    return;
                }
                let (Some(zone), Some(entity_id), Some(zone_id)) = (
                    self.zone.as_ref(),
                    self.entity_id.as_deref(),
                    self.zone_id.as_deref(),
                ) else {
                    return;
                };
                let mut guard = zone.lock();
                guard.set_sprite_ref(entity_id, &sprite_ref, now_ms);
                guard.broadcast_all(&ServerMsg::UgcUpdate {
                    v: PROTOCOL_VERSION,
                    zone: zone_id.to_string(),
                    account_id: account_id.clone(),
                    ugc_id,
                    base_sprite_key,
                    sprite_ref,
                });
            }
            UgcOutcome::Rejected { errors } => {
                self.send(ServerMsg::UgcResult {
                    v: PROTOCOL_VERSION,
                    ok: false,
                    ugc_id: None,
                    sprite_ref: None,
                    base_sprite_key: None,
                    deduped: None,
                    errors: Some(errors),
                    error: None,
                    retry_after_ms: None,
                });
            }
            UgcOutcome::RateLimited { retry_after_ms } => {
                self.send(ServerMsg::UgcResult {
                    v: PROTOCOL_VERSION,
                    ok: false,
                    ugc_id: None,
                    sprite_ref: None,
                    base_sprite_key: None,
                    deduped: None,
                    errors: None,
                    error: Some("rate_limited".to_string()),
                    retry_after_ms: Some(retry_after_ms),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots and teardown
    // -----------------------------------------------------------------------

    /// Authoritative snapshot for this connection: full zone roster after a
    /// transfer, self plus AOI neighborhood otherwise. Always carries bounds
    /// and the collision descriptor.
    fn send_snapshot(&self, zone: &Zone, entity_id: &str, everyone: bool) {
        let players = if everyone {
            zone.build_snapshot_for()
        } else {
            let mut players: Vec<PlayerSnapshot> =
                zone.wire_snapshot_of(entity_id).into_iter().collect();
            players.extend(zone.get_visible_snapshots(entity_id));
            players
        };
        let ack = zone.get_entity(entity_id).map_or(0, |e| e.last_seq);
        self.send(ServerMsg::Snapshot {
            v: PROTOCOL_VERSION,
            zone: zone.id().to_string(),
            tick: zone.tick_id(),
            ack: Ack { seq: ack },
            players,
            bounds: Some(zone.bounds()),
            collision: Some(zone.collision_descriptor().clone()),
        });
    }

    /// Connection teardown. Safe to call for unauthenticated sockets and
    /// idempotent for replaced ones: a connection that no longer owns its
    /// account slot must not tear down its successor's state.
    pub fn handle_close(&mut self, now_ms: u64) {
        let Some(account_id) = self.account_id.take() else {
            return;
        };
        if !self.ctx.unregister_conn(&account_id, self.conn_id) {
            return;
        }
        if let Some(pending) = self.pending_transfer.take() {
            if pending.phase == TransferPhase::BeginSent {
                // Died between begin and commit: resume into the source zone
                // at its spawn rather than a half-transferred position.
                self.ctx
                    .presence
                    .rewrite_zone(&account_id, &pending.from, now_ms);
            }
        }
        if let Some(removed) = self.ctx.remove_player(&account_id, now_ms) {
            removed.zone.lock().broadcast_removal(&removed.entity_id);
            debug!(account = %account_id, zone = %removed.zone_id, "player disconnected");
        }
    }
}

// ---------------------------------------------------------------------------
// Socket pump
// ---------------------------------------------------------------------------

/// Decode and route one text frame. True when the session has queued a fatal
/// error and reads should stop.
fn route_text(state: &mut ConnState, text: &str) -> bool {
    match decode_client(text) {
        Ok(msg) => state.route_message(msg, now_ms()).is_err(),
        Err(_) => route_undecodable(state),
    }
}

/// Undecodable frames are fatal before auth and a non-fatal complaint after.
fn route_undecodable(state: &mut ConnState) -> bool {
    if state.is_authed() {
        state.send_error(ErrorCode::MessageInvalid, "unrecognized message", false);
        false
    } else {
        state.send_error(ErrorCode::MessageInvalid, "Invalid hello message", true);
        true
    }
}

/// Drive one accepted TCP connection through the WebSocket handshake and the
/// session state machine. Returns when the socket is gone.
pub async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMsg>();
    let conn_id = Uuid::new_v4();
    let mut state = ConnState::new(Arc::clone(&ctx), conn_id, tx);
    debug!(%peer, conn = %conn_id, "connection open");

    let auth_deadline = tokio::time::Instant::now() + Duration::from_millis(AUTH_TIMEOUT_MS);
    let mut ping = tokio::time::interval(Duration::from_millis(ctx.config.ws_ping_interval_ms));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await;
    let mut alive = true;
    // Set once a fatal frame is queued; reads are ignored until the write
    // side flushes it and closes.
    let mut closing = false;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                let fatal_code = match &msg {
                    ServerMsg::Error { code, fatal: true, .. } => Some(*code),
                    _ => None,
                };
                let text = match encode_server(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(conn = %conn_id, error = %e, "outbound frame encode failed");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if let Some(code) = fatal_code {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code.fatal_close_code()),
                            reason: Cow::Borrowed(code.as_str()),
                        })))
                        .await;
                    break;
                }
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !closing {
                            closing = route_text(&mut state, &text);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !closing {
                            closing = match String::from_utf8(data) {
                                Ok(text) => route_text(&mut state, &text),
                                Err(_) => route_undecodable(&mut state),
                            };
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        alive = true;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        debug!(conn = %conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if !alive {
                    debug!(conn = %conn_id, "no pong before next ping, terminating");
                    break;
                }
                alive = false;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(auth_deadline), if !state.is_authed() && !closing => {
                closing = true;
                let _ = state.tx.send(ServerMsg::error(
                    ErrorCode::AuthRequired,
                    "no hello before deadline",
                    true,
                ));
            }
        }
    }

    state.handle_close(now_ms());
    let _ = sink.close().await;
    debug!(conn = %conn_id, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::net::protocol::{Facing, MoveVec};
    use crate::zones::bounds::Bounds;
    use crate::zones::presence::ResumeReason;
    use std::fs;
    use std::path::PathBuf;
    use tokio::sync::mpsc::UnboundedReceiver;

    const NOW: u64 = 100_000;

    fn temp_data_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("vantown-session-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("regions")).unwrap();
        fs::create_dir_all(dir.join("levels")).unwrap();
        // 50x20 open region, one town, one entrance at (40,12) into the sewer.
        let row: Vec<&str> = std::iter::repeat("2").take(50).collect();
        let rows: Vec<String> = std::iter::repeat(format!("[{}]", row.join(",")))
            .take(20)
            .collect();
        let region = format!(
            concat!(
                r#"{{"terrainGrid":[{}],"#,
                r#""towns":[{{"id":"town_01","x":10,"y":5}}],"#,
                r#""levelEntrances":[{{"id":"sewer_door","x":40,"y":12,"#,
                r#""toLevelId":"level:level_sewer","facing":"n"}}]}}"#
            ),
            rows.join(",")
        );
        fs::write(dir.join("regions/na.json"), region).unwrap();
        fs::write(
            dir.join("levels/level_sewer.json"),
            r#"{"id":"level_sewer","tilemap":[[0,0,0],[0,0,0],[0,0,0]],"spawns":{"player":{"x":1,"y":1}}}"#,
        )
        .unwrap();
        dir
    }

    fn ctx_with_dir(dir: &PathBuf) -> Arc<ServerContext> {
        let config = ServerConfig {
            data_dir: dir.to_str().unwrap().to_string(),
            ..ServerConfig::default()
        };
        let ctx = Arc::new(ServerContext::new(config));
        ctx.boot(NOW);
        ctx
    }

    fn conn(ctx: &Arc<ServerContext>) -> (ConnState, UnboundedReceiver<ServerMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnState::new(Arc::clone(ctx), Uuid::new_v4(), tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn hello(token: &str, zone: Option<&str>, dn: Option<&str>) -> ClientMsg {
        ClientMsg::Hello {
            v: Some(PROTOCOL_VERSION),
            token: Some(token.to_string()),
            zone: zone.map(str::to_string),
            resume: None,
            dn: dn.map(str::to_string),
        }
    }

    fn join(
        ctx: &Arc<ServerContext>,
        account: &str,
        zone: Option<&str>,
    ) -> (ConnState, UnboundedReceiver<ServerMsg>) {
        let token = ctx.auth.issue(account, None);
        let (mut state, mut rx) = conn(ctx);
        assert!(state.route_message(hello(&token, zone, None), NOW).is_ok());
        drain(&mut rx);
        (state, rx)
    }

    fn expect_error(frames: &[ServerMsg], code: ErrorCode) -> (String, bool) {
        for frame in frames {
            if let ServerMsg::Error {
                code: c,
                msg,
                fatal,
                ..
            } = frame
            {
                if *c == code {
                    return (msg.clone(), *fatal);
                }
            }
        }
        panic!("no {code:?} error in {frames:?}");
    }

    // rows for the 32x24 van base with exactly `mass` opaque pixels
    fn van_rows(mass: usize) -> Vec<serde_json::Value> {
        let mut remaining = mass;
        let mut rows = Vec::new();
        for _ in 0..24 {
            let fill = remaining.min(32);
            remaining -= fill;
            let row: String = "x".repeat(fill) + &".".repeat(32 - fill);
            rows.push(serde_json::Value::String(row));
        }
        assert_eq!(remaining, 0);
        rows
    }

    fn ugc_submit(rows: Vec<serde_json::Value>) -> ClientMsg {
        ClientMsg::UgcSubmit {
            base_sprite_key: "van".to_string(),
            width: 32.0,
            height: 24.0,
            rows,
        }
    }

    #[test]
    fn test_hello_rejects_wrong_version() {
        let dir = temp_data_dir("ver");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = conn(&ctx);
        let msg = ClientMsg::Hello {
            v: Some(2),
            token: Some("tok".to_string()),
            zone: None,
            resume: None,
            dn: None,
        };
        assert!(state.route_message(msg, NOW).is_err());
        let (msg, fatal) = expect_error(&drain(&mut rx), ErrorCode::VersionMismatch);
        assert_eq!(msg, "Server requires v1, got v2");
        assert!(fatal);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_hello_validation_failures() {
        let dir = temp_data_dir("val");
        let ctx = ctx_with_dir(&dir);
        // missing token
        let (mut state, mut rx) = conn(&ctx);
        let msg = ClientMsg::Hello {
            v: Some(1),
            token: None,
            zone: None,
            resume: None,
            dn: None,
        };
        assert!(state.route_message(msg, NOW).is_err());
        let (msg, fatal) = expect_error(&drain(&mut rx), ErrorCode::AuthRequired);
        assert_eq!(msg, "Missing or invalid token in hello");
        assert!(fatal);
        // malformed zone
        let (mut state, mut rx) = conn(&ctx);
        assert!(state
            .route_message(hello("tok", Some("Bad Zone"), None), NOW)
            .is_err());
        let (msg, _) = expect_error(&drain(&mut rx), ErrorCode::ZoneInvalid);
        assert_eq!(msg, "Invalid zone format: Bad Zone");
        // token not in the registry
        let (mut state, mut rx) = conn(&ctx);
        assert!(state.route_message(hello("nope", None, None), NOW).is_err());
        let (msg, fatal) = expect_error(&drain(&mut rx), ErrorCode::AuthRequired);
        assert_eq!(msg, "invalid or expired token");
        assert!(fatal);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_pre_auth_non_hello_is_fatal() {
        let dir = temp_data_dir("preauth");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = conn(&ctx);
        let msg = ClientMsg::Input {
            seq: 1,
            mv: MoveVec { x: 1, y: 0 },
            facing: None,
            keys: None,
        };
        assert!(state.route_message(msg, NOW).is_err());
        let (_, fatal) = expect_error(&drain(&mut rx), ErrorCode::MessageInvalid);
        assert!(fatal);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_hello_ok_then_snapshot() {
        let dir = temp_data_dir("ok");
        let ctx = ctx_with_dir(&dir);
        let token = ctx.auth.issue("acct_alpha", Some("Karl"));
        let (mut state, mut rx) = conn(&ctx);
        assert!(state.route_message(hello(&token, None, None), NOW).is_ok());
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        let ServerMsg::HelloOk {
            you,
            resume,
            server,
            dir: dir_info,
            ..
        } = &frames[0]
        else {
            panic!("expected hello_ok, got {:?}", frames[0]);
        };
        assert_eq!(you.account_id, "acct_alpha");
        assert_eq!(you.zone.as_deref(), Some(DEFAULT_ZONE));
        assert!(!resume.applied);
        assert_eq!(resume.reason, ResumeReason::NoPresence);
        assert_eq!(server.tick_hz, 20);
        assert_eq!(server.aoi_cell, 16);
        assert_eq!(dir_info.ttl_sec, DIR_REFRESH_SEC);
        let ServerMsg::Snapshot {
            zone,
            players,
            bounds,
            collision,
            ack,
            ..
        } = &frames[1]
        else {
            panic!("expected snapshot, got {:?}", frames[1]);
        };
        assert_eq!(zone, DEFAULT_ZONE);
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].dn.as_deref(), Some("Karl"));
        assert_eq!(*bounds, Some(Bounds { w: 50, h: 20 }));
        assert!(collision.is_some());
        assert_eq!(ack.seq, 0);
        assert!(state.is_authed());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_display_name_fallback_chain() {
        let dir = temp_data_dir("dn");
        let ctx = ctx_with_dir(&dir);
        let zone = ctx.zones.get_or_create(DEFAULT_ZONE);

        let name_of = |account: &str| {
            let guard = zone.lock();
            let id = guard.entity_id_for_account(account).unwrap();
            guard.get_entity(&id).unwrap().display_name.clone()
        };

        // explicit dn wins over the token's display name
        let token = ctx.auth.issue("acct_one_xx", Some("FromToken"));
        let (mut state, _rx) = conn(&ctx);
        state
            .route_message(hello(&token, None, Some("FromHello")), NOW)
            .unwrap_or_else(|_| panic!("hello failed"));
        assert_eq!(name_of("acct_one_xx"), "FromHello");

        // empty dn falls back to the token
        let token = ctx.auth.issue("acct_two_xx", Some("FromToken"));
        let (mut state, _rx) = conn(&ctx);
        state
            .route_message(hello(&token, None, Some("")), NOW)
            .unwrap_or_else(|_| panic!("hello failed"));
        assert_eq!(name_of("acct_two_xx"), "FromToken");

        // nothing anywhere: first eight characters of the account id
        let token = ctx.auth.issue("acct_three_xx", None);
        let (mut state, _rx) = conn(&ctx);
        state
            .route_message(hello(&token, None, None), NOW)
            .unwrap_or_else(|_| panic!("hello failed"));
        assert_eq!(name_of("acct_three_xx"), "acct_thr");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_hello_replaces_older_connection() {
        let dir = temp_data_dir("replace");
        let ctx = ctx_with_dir(&dir);
        let token = ctx.auth.issue("acct_dup", None);

        let (mut first, mut rx1) = conn(&ctx);
        first
            .route_message(hello(&token, None, None), NOW)
            .unwrap_or_else(|_| panic!("hello failed"));
        drain(&mut rx1);

        let (mut second, mut rx2) = conn(&ctx);
        second
            .route_message(hello(&token, None, None), NOW + 1_000)
            .unwrap_or_else(|_| panic!("hello failed"));

        // the displaced connection got a fatal REPLACED error
        let (_, fatal) = expect_error(&drain(&mut rx1), ErrorCode::ReplacedByNewConnection);
        assert!(fatal);
        // exactly one entity remains, and the new login resumed the old spot
        let zone = ctx.zones.get_or_create(DEFAULT_ZONE);
        assert_eq!(zone.lock().player_count(), 1);
        let frames = drain(&mut rx2);
        let ServerMsg::HelloOk { resume, .. } = &frames[0] else {
            panic!("expected hello_ok");
        };
        assert!(resume.applied);
        assert_eq!(resume.reason, ResumeReason::WithinTtl);

        // the displaced connection's close must not tear down its successor
        first.handle_close(NOW + 2_000);
        assert_eq!(ctx.conn_count(), 1);
        assert_eq!(zone.lock().player_count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_post_auth_noise_is_not_fatal() {
        let dir = temp_data_dir("noise");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", None);
        // a second hello is complained about but the session stays up
        let token = ctx.auth.issue("acct_a", None);
        assert!(state.route_message(hello(&token, None, None), NOW).is_ok());
        let (_, fatal) = expect_error(&drain(&mut rx), ErrorCode::MessageInvalid);
        assert!(!fatal);
        // undecodable frames likewise
        assert!(!route_undecodable(&mut state));
        let (_, fatal) = expect_error(&drain(&mut rx), ErrorCode::MessageInvalid);
        assert!(!fatal);
        assert!(state.is_authed());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_input_applies_and_validates() {
        let dir = temp_data_dir("input");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", None);
        let entity_id = state.entity_id.clone().unwrap();
        let msg = ClientMsg::Input {
            seq: 3,
            mv: MoveVec { x: 1, y: 0 },
            facing: Some(Facing::E),
            keys: None,
        };
        assert!(state.route_message(msg, NOW).is_ok());
        let zone = ctx.zones.get_or_create(DEFAULT_ZONE);
        assert_eq!(zone.lock().get_entity(&entity_id).unwrap().last_seq, 3);

        // out-of-range component: complaint, no state change
        let msg = ClientMsg::Input {
            seq: 4,
            mv: MoveVec { x: 2, y: 0 },
            facing: None,
            keys: None,
        };
        assert!(state.route_message(msg, NOW).is_ok());
        let (_, fatal) = expect_error(&drain(&mut rx), ErrorCode::InputInvalid);
        assert!(!fatal);
        assert_eq!(zone.lock().get_entity(&entity_id).unwrap().last_seq, 3);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_pos_sync_rate_floor() {
        let dir = temp_data_dir("possync");
        let ctx = ctx_with_dir(&dir);
        let (mut state, _rx) = join(&ctx, "acct_a", None);
        let entity_id = state.entity_id.clone().unwrap();
        let zone = ctx.zones.get_or_create(DEFAULT_ZONE);
        let report = |px: f64| ClientMsg::PosSync {
            px,
            py: 320.0,
            facing: None,
            mode: None,
            vpx: None,
            vpy: None,
            vf: None,
        };
        assert!(state.route_message(report(999.0), NOW).is_ok());
        assert_eq!(zone.lock().get_entity(&entity_id).unwrap().px, 999);
        // 10ms later: under the floor, silently dropped
        assert!(state.route_message(report(555.0), NOW + 10).is_ok());
        assert_eq!(zone.lock().get_entity(&entity_id).unwrap().px, 999);
        // 50ms later: accepted again
        assert!(state.route_message(report(777.0), NOW + 50).is_ok());
        assert_eq!(zone.lock().get_entity(&entity_id).unwrap().px, 777);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_transfer_flow_end_to_end() {
        let dir = temp_data_dir("transfer");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", Some("region:na:town_01"));
        let entity_id = state.entity_id.clone().unwrap();

        // step onto the entrance tile first
        let msg = ClientMsg::Action {
            seq: 1,
            body: ActionBody::SpawnPos {
                x: Some(40.0),
                y: Some(12.0),
            },
        };
        assert!(state.route_message(msg, NOW).is_ok());
        drain(&mut rx);

        let msg = ClientMsg::Action {
            seq: 2,
            body: ActionBody::Transfer {
                to: "level:level_sewer".to_string(),
            },
        };
        assert!(state.route_message(msg, NOW + 100).is_ok());
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        let ServerMsg::TransferBegin {
            from,
            to,
            reason,
            fatal,
            ..
        } = &frames[0]
        else {
            panic!("expected transfer_begin, got {:?}", frames[0]);
        };
        assert_eq!(from, "region:na:town_01");
        assert_eq!(to, "level:level_sewer");
        assert_eq!(reason, "enter_region");
        assert!(!fatal);
        let ServerMsg::TransferCommit { zone, you, .. } = &frames[1] else {
            panic!("expected transfer_commit, got {:?}", frames[1]);
        };
        assert_eq!(zone, "level:level_sewer");
        assert_eq!(you.entity_id, entity_id);
        assert_eq!(you.zone, None);
        let ServerMsg::Snapshot {
            zone,
            players,
            bounds,
            ..
        } = &frames[2]
        else {
            panic!("expected snapshot, got {:?}", frames[2]);
        };
        assert_eq!(zone, "level:level_sewer");
        assert_eq!(players.len(), 1);
        assert_eq!(*bounds, Some(Bounds { w: 3, h: 3 }));

        // entity landed at the level spawn with the entrance facing applied
        let dest = ctx.zones.get_zone("level:level_sewer").unwrap();
        let guard = dest.lock();
        let entity = guard.get_entity(&entity_id).unwrap();
        assert_eq!((entity.x, entity.y), (1, 1));
        assert_eq!(entity.facing, Facing::N);
        drop(guard);
        // source zone no longer holds the entity, session state is settled
        let source = ctx.zones.get_zone("region:na:town_01").unwrap();
        assert_eq!(source.lock().player_count(), 0);
        assert!(!state.transferring);
        assert!(state.pending_transfer.is_none());
        assert_eq!(state.zone_id.as_deref(), Some("level:level_sewer"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_transfer_rejections() {
        let dir = temp_data_dir("denied");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", Some("region:na:town_01"));
        let transfer = |to: &str| ClientMsg::Action {
            seq: 1,
            body: ActionBody::Transfer { to: to.to_string() },
        };

        assert!(state.route_message(transfer("not a zone"), NOW).is_ok());
        let (msg, _) = expect_error(&drain(&mut rx), ErrorCode::TransferInvalidZone);
        assert_eq!(msg, "invalid zone id: not a zone");

        assert!(state
            .route_message(transfer("region:na:town_01"), NOW)
            .is_ok());
        let (msg, _) = expect_error(&drain(&mut rx), ErrorCode::TransferFailed);
        assert_eq!(msg, "already in zone");

        assert!(state
            .route_message(transfer("region:na:ghost_town"), NOW)
            .is_ok());
        let (msg, _) = expect_error(&drain(&mut rx), ErrorCode::TransferInvalidZone);
        assert_eq!(msg, "zone not in directory");

        // standing at the town anchor, not the entrance tile
        assert!(state
            .route_message(transfer("level:level_sewer"), NOW)
            .is_ok());
        let (msg, _) = expect_error(&drain(&mut rx), ErrorCode::TransferFailed);
        assert_eq!(msg, "not_on_entrance");
        assert!(!state.transferring);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_transferring_guard() {
        let dir = temp_data_dir("guard");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", None);
        state.transferring = true;
        let input = ClientMsg::Input {
            seq: 9,
            mv: MoveVec { x: 0, y: 1 },
            facing: None,
            keys: None,
        };
        assert!(state.route_message(input.clone(), NOW).is_ok());
        expect_error(&drain(&mut rx), ErrorCode::InputIgnoredTransfer);
        // repeat within the notice window: silent
        assert!(state.route_message(input.clone(), NOW + 100).is_ok());
        assert!(drain(&mut rx).is_empty());
        // after the window: notified again
        assert!(state.route_message(input, NOW + 1_500).is_ok());
        expect_error(&drain(&mut rx), ErrorCode::InputIgnoredTransfer);
        // a second transfer request is refused outright
        let msg = ClientMsg::Action {
            seq: 1,
            body: ActionBody::Transfer {
                to: "level:level_sewer".to_string(),
            },
        };
        assert!(state.route_message(msg, NOW + 1_600).is_ok());
        expect_error(&drain(&mut rx), ErrorCode::TransferAlreadyInProgress);
        // everything else is dropped without a reply
        let msg = ClientMsg::PosSync {
            px: 1.0,
            py: 1.0,
            facing: None,
            mode: None,
            vpx: None,
            vpy: None,
            vf: None,
        };
        assert!(state.route_message(msg, NOW + 2_000).is_ok());
        assert!(drain(&mut rx).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_spawn_pos_acks() {
        let dir = temp_data_dir("spawn");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", None);
        // missing coordinate
        let msg = ClientMsg::Action {
            seq: 1,
            body: ActionBody::SpawnPos {
                x: Some(4.0),
                y: None,
            },
        };
        assert!(state.route_message(msg, NOW).is_ok());
        let frames = drain(&mut rx);
        let ServerMsg::Event {
            body: ServerEvent::SpawnAck { ok, reason, .. },
            ..
        } = &frames[0]
        else {
            panic!("expected spawn_ack, got {:?}", frames[0]);
        };
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("bad_xy"));

        // happy path: snapshot first, then the ack with the clamped position
        let msg = ClientMsg::Action {
            seq: 2,
            body: ActionBody::SpawnPos {
                x: Some(40.0),
                y: Some(999.0),
            },
        };
        assert!(state.route_message(msg, NOW).is_ok());
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ServerMsg::Snapshot { .. }));
        let ServerMsg::Event {
            body:
                ServerEvent::SpawnAck {
                    ok,
                    tele_ok,
                    pos,
                    players,
                    ..
                },
            ..
        } = &frames[1]
        else {
            panic!("expected spawn_ack, got {:?}", frames[1]);
        };
        assert!(ok);
        assert_eq!(*tele_ok, Some(true));
        assert_eq!(*pos, Some(TilePos { x: 40, y: 19 }));
        assert_eq!(*players, Some(1));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_collision_request_event() {
        let dir = temp_data_dir("collreq");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", None);
        let msg = ClientMsg::Action {
            seq: 1,
            body: ActionBody::CollisionRequest,
        };
        assert!(state.route_message(msg, NOW).is_ok());
        let frames = drain(&mut rx);
        let ServerMsg::Event {
            body: ServerEvent::CollisionFull { zone, collision },
            ..
        } = &frames[0]
        else {
            panic!("expected collision_full, got {:?}", frames[0]);
        };
        assert_eq!(zone, DEFAULT_ZONE);
        assert_eq!(collision.mode, "grid");
        assert_eq!(collision.format, "bitset_rle");
        assert!(collision.hash.starts_with("sha256:"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_ugc_accept_reskins_and_broadcasts() {
        let dir = temp_data_dir("ugc");
        let ctx = ctx_with_dir(&dir);
        let (mut submitter, mut rx_a) = join(&ctx, "acct_a", None);
        let (_other, mut rx_b) = join(&ctx, "acct_b", None);
        drain(&mut rx_a); // arrival delta for acct_b

        assert!(submitter
            .route_message(ugc_submit(van_rows(500)), NOW)
            .is_ok());
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 2);
        let ServerMsg::UgcResult {
            ok,
            ugc_id,
            sprite_ref,
            deduped,
            ..
        } = &frames[0]
        else {
            panic!("expected ugc_result, got {:?}", frames[0]);
        };
        assert!(ok);
        assert_eq!(ugc_id.as_deref(), Some("u0001"));
        assert_eq!(sprite_ref.as_deref(), Some("ugc:acct_a:u0001"));
        assert_eq!(*deduped, Some(false));
        assert!(matches!(frames[1], ServerMsg::UgcUpdate { .. }));

        // the other connection sees the re-skin
        let frames = drain(&mut rx_b);
        let update = frames
            .iter()
            .find_map(|f| match f {
                ServerMsg::UgcUpdate {
                    account_id,
                    sprite_ref,
                    ..
                } => Some((account_id.clone(), sprite_ref.clone())),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no ugc_update in {frames:?}"));
        assert_eq!(update.0, "acct_a");
        assert_eq!(update.1, "ugc:acct_a:u0001");

        // entity now carries the ugc ref, so future snapshots agree
        let zone = ctx.zones.get_or_create(DEFAULT_ZONE);
        let guard = zone.lock();
        let id = guard.entity_id_for_account("acct_a").unwrap();
        assert_eq!(
            guard.get_entity(&id).unwrap().sprite_ref,
            "ugc:acct_a:u0001"
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_ugc_dedupe_and_rate_limit_results() {
        let dir = temp_data_dir("ugclimit");
        let ctx = ctx_with_dir(&dir);
        let (mut state, mut rx) = join(&ctx, "acct_a", None);
        let rows = van_rows(480);

        assert!(state.route_message(ugc_submit(rows.clone()), NOW).is_ok());
        assert_eq!(drain(&mut rx).len(), 2); // result + update

        // identical resubmission: accepted as a dedupe, no re-broadcast
        assert!(state.route_message(ugc_submit(rows.clone()), NOW).is_ok());
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let ServerMsg::UgcResult { ok, deduped, .. } = &frames[0] else {
            panic!("expected ugc_result, got {:?}", frames[0]);
        };
        assert!(ok);
        assert_eq!(*deduped, Some(true));

        // third consumes the last rate-limit token, fourth is refused
        assert!(state.route_message(ugc_submit(rows.clone()), NOW).is_ok());
        drain(&mut rx);
        assert!(state.route_message(ugc_submit(rows), NOW).is_ok());
        let frames = drain(&mut rx);
        let ServerMsg::UgcResult {
            ok,
            error,
            retry_after_ms,
            ..
        } = &frames[0]
        else {
            panic!("expected ugc_result, got {:?}", frames[0]);
        };
        assert!(!ok);
        assert_eq!(error.as_deref(), Some("rate_limited"));
        assert!(retry_after_ms.is_some());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_close_mid_transfer_rewrites_presence() {
        let dir = temp_data_dir("midclose");
        let ctx = ctx_with_dir(&dir);
        let (mut state, _rx) = join(&ctx, "acct_a", Some("region:na:town_01"));
        state.transferring = true;
        state.pending_transfer = Some(PendingTransfer {
            from: "region:na:town_01".to_string(),
            to: "level:level_sewer".to_string(),
            phase: TransferPhase::BeginSent,
        });
        state.handle_close(NOW + 5_000);
        let entry = ctx.presence.get("acct_a").unwrap();
        assert_eq!(entry.zone_id, "region:na:town_01");
        assert_eq!((entry.x, entry.y), (0, 0));
        assert!(entry.disconnected_at_ms.is_some());
        assert_eq!(ctx.conn_count(), 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_close_broadcasts_removal() {
        let dir = temp_data_dir("close");
        let ctx = ctx_with_dir(&dir);
        let (mut leaver, _rx_a) = join(&ctx, "acct_a", None);
        let (_stayer, mut rx_b) = join(&ctx, "acct_b", None);
        let gone = leaver.entity_id.clone().unwrap();

        leaver.handle_close(NOW + 1_000);
        let frames = drain(&mut rx_b);
        let removed = frames
            .iter()
            .find_map(|f| match f {
                ServerMsg::Delta { removes, .. } if !removes.is_empty() => Some(removes.clone()),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no removal delta in {frames:?}"));
        assert_eq!(removed, vec![gone]);
        let zone = ctx.zones.get_or_create(DEFAULT_ZONE);
        assert_eq!(zone.lock().player_count(), 1);
        assert_eq!(ctx.conn_count(), 1);
        // closing again is a no-op
        leaver.handle_close(NOW + 2_000);
        assert_eq!(ctx.conn_count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
