//! JSON wire protocol.
//!
//! Every frame is a JSON object tagged by `t`. Decoding is exhaustive: a
//! frame that does not match a known message shape is a protocol error, which
//! sessions answer with a non-fatal `MESSAGE_INVALID` (or a fatal close
//! during the handshake).
//!
//! Snake-case tags and camelCase field names are part of the wire contract
//! and must not change without a `PROTOCOL_VERSION` bump.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ugc::UgcIssue;
use crate::util::ids::{AccountId, EntityId, ZoneId};
use crate::zones::bounds::Bounds;
use crate::zones::collision::CollisionDescriptor;
use crate::zones::id::is_valid_zone_id;
use crate::zones::presence::ResumeReason;

pub const PROTOCOL_VERSION: u32 = 1;

/// Cardinal facing carried by inputs and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    N,
    E,
    S,
    W,
}

impl Default for Facing {
    fn default() -> Self {
        Facing::S
    }
}

impl Facing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Facing::N => "n",
            Facing::E => "e",
            Facing::S => "s",
            Facing::W => "w",
        }
    }
}

/// Movement mode reported by position sync: driving or on foot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveMode {
    Van,
    Foot,
}

impl Default for MoveMode {
    fn default() -> Self {
        MoveMode::Van
    }
}

/// Per-axis move intent, each component in {-1, 0, 1}.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveVec {
    pub x: i8,
    pub y: i8,
}

/// Move component range check. Shape errors are caught by serde; this guards
/// only the value range.
pub fn validate_move(mv: &MoveVec) -> bool {
    (-1..=1).contains(&mv.x) && (-1..=1).contains(&mv.y)
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Body of an `action` frame, selected by the `action` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionBody {
    /// Request a zone transfer.
    Transfer { to: String },
    /// Ask for a full collision descriptor resend.
    CollisionRequest,
    /// Teleport within the current zone.
    SpawnPos {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Handshake. Fields are optional at the decode layer so validation can
    /// report the precise failure (version vs auth vs zone).
    Hello {
        #[serde(default)]
        v: Option<u32>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        zone: Option<String>,
        #[serde(default)]
        resume: Option<bool>,
        #[serde(default)]
        dn: Option<String>,
    },
    /// Movement intent for one predicted step.
    Input {
        seq: i64,
        #[serde(rename = "move")]
        mv: MoveVec,
        #[serde(default)]
        facing: Option<Facing>,
        #[serde(default)]
        keys: Option<serde_json::Value>,
    },
    /// Client-authoritative pixel position report.
    PosSync {
        px: f64,
        py: f64,
        #[serde(default)]
        facing: Option<Facing>,
        #[serde(default)]
        mode: Option<MoveMode>,
        #[serde(default)]
        vpx: Option<f64>,
        #[serde(default)]
        vpy: Option<f64>,
        #[serde(default)]
        vf: Option<Facing>,
    },
    Action {
        seq: i64,
        #[serde(flatten)]
        body: ActionBody,
    },
    /// Sprite pattern submission.
    UgcSubmit {
        #[serde(rename = "baseSpriteKey")]
        base_sprite_key: String,
        width: f64,
        height: f64,
        rows: Vec<serde_json::Value>,
    },
}

/// Handshake validation, in fixed order: version, then token, then zone.
/// `None` means the hello is acceptable. An absent zone is fine (the join
/// falls back to the default zone); a present but malformed one is not.
pub fn hello_error(v: Option<u32>, token: Option<&str>, zone: Option<&str>) -> Option<ErrorCode> {
    if v != Some(PROTOCOL_VERSION) {
        return Some(ErrorCode::VersionMismatch);
    }
    if token.map_or(true, |t| t.is_empty()) {
        return Some(ErrorCode::AuthRequired);
    }
    if zone.is_some_and(|z| !is_valid_zone_id(z)) {
        return Some(ErrorCode::ZoneInvalid);
    }
    None
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Identity block in `hello_ok` and `transfer_commit`. The zone field is only
/// present in `hello_ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YouRef {
    pub entity_id: EntityId,
    pub account_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<ZoneId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub applied: bool,
    pub reason: ResumeReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub tick_hz: u32,
    pub aoi_cell: i32,
    pub resume_ttl_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirInfo {
    #[serde(rename = "ttlSec")]
    pub ttl_sec: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub seq: i64,
}

/// Entity state as broadcast in snapshots and deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: EntityId,
    pub x: i32,
    pub y: i32,
    pub facing: Facing,
    #[serde(rename = "spriteRef")]
    pub sprite_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dn: Option<String>,
}

/// One `pos_batch` entry, serialized as a JSON array:
/// `[id, px, py, facing, mode, vpx, vpy, vf, dn]`.
/// Vehicle fields are null unless the entity is on foot with a parked van.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosEntry(
    pub EntityId,
    pub i64,
    pub i64,
    pub Facing,
    pub MoveMode,
    pub Option<i64>,
    pub Option<i64>,
    pub Option<Facing>,
    pub String,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

/// Body of an `event` frame, selected by the `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    CollisionFull {
        zone: ZoneId,
        collision: CollisionDescriptor,
    },
    #[serde(rename_all = "camelCase")]
    SpawnAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tele_ok: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pos: Option<TilePos>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        players: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMsg {
    HelloOk {
        v: u32,
        you: YouRef,
        resume: ResumeInfo,
        server: ServerInfo,
        dir: DirInfo,
    },
    Snapshot {
        v: u32,
        zone: ZoneId,
        tick: u64,
        ack: Ack,
        players: Vec<PlayerSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bounds: Option<Bounds>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collision: Option<CollisionDescriptor>,
    },
    Delta {
        v: u32,
        zone: ZoneId,
        tick: u64,
        ack: Ack,
        upserts: Vec<PlayerSnapshot>,
        removes: Vec<EntityId>,
    },
    PosBatch {
        v: u32,
        zone: ZoneId,
        tick: u64,
        p: Vec<PosEntry>,
    },
    TransferBegin {
        v: u32,
        from: ZoneId,
        to: ZoneId,
        reason: String,
        fatal: bool,
    },
    TransferCommit {
        v: u32,
        zone: ZoneId,
        you: YouRef,
    },
    Event {
        v: u32,
        #[serde(flatten)]
        body: ServerEvent,
    },
    #[serde(rename_all = "camelCase")]
    UgcResult {
        v: u32,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ugc_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sprite_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_sprite_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deduped: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<UgcIssue>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    UgcUpdate {
        v: u32,
        zone: ZoneId,
        account_id: AccountId,
        ugc_id: String,
        base_sprite_key: String,
        sprite_ref: String,
    },
    Error {
        v: u32,
        code: ErrorCode,
        msg: String,
        fatal: bool,
    },
}

impl ServerMsg {
    /// Convenience constructor for error frames.
    pub fn error(code: ErrorCode, msg: impl Into<String>, fatal: bool) -> Self {
        ServerMsg::Error {
            v: PROTOCOL_VERSION,
            code,
            msg: msg.into(),
            fatal,
        }
    }

    pub fn event(body: ServerEvent) -> Self {
        ServerMsg::Event {
            v: PROTOCOL_VERSION,
            body,
        }
    }
}

/// Stable error codes shared by error frames and fatal close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MessageInvalid,
    VersionMismatch,
    AuthRequired,
    ZoneInvalid,
    ZoneNotFound,
    ReplacedByNewConnection,
    InputInvalid,
    InputIgnoredTransfer,
    TransferInvalidZone,
    TransferFailed,
    TransferAlreadyInProgress,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MessageInvalid => "MESSAGE_INVALID",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::ZoneInvalid => "ZONE_INVALID",
            ErrorCode::ZoneNotFound => "ZONE_NOT_FOUND",
            ErrorCode::ReplacedByNewConnection => "REPLACED_BY_NEW_CONNECTION",
            ErrorCode::InputInvalid => "INPUT_INVALID",
            ErrorCode::InputIgnoredTransfer => "INPUT_IGNORED_TRANSFER",
            ErrorCode::TransferInvalidZone => "TRANSFER_INVALID_ZONE",
            ErrorCode::TransferFailed => "TRANSFER_FAILED",
            ErrorCode::TransferAlreadyInProgress => "TRANSFER_ALREADY_IN_PROGRESS",
        }
    }

    /// WebSocket close code used when this error is fatal: 4000 plus a
    /// per-code offset. Codes without a reserved offset close as 4000.
    pub fn fatal_close_code(&self) -> u16 {
        let offset = match self {
            ErrorCode::VersionMismatch => 1,
            ErrorCode::AuthRequired => 2,
            ErrorCode::ZoneInvalid => 3,
            ErrorCode::ZoneNotFound => 4,
            ErrorCode::ReplacedByNewConnection => 5,
            _ => 0,
        };
        4000 + offset
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message encode failed: {0}")]
    Encode(serde_json::Error),
    #[error("message decode failed: {0}")]
    Decode(serde_json::Error),
}

pub fn encode_server(msg: &ServerMsg) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(ProtocolError::Encode)
}

pub fn decode_server(raw: &str) -> Result<ServerMsg, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::Decode)
}

pub fn encode_client(msg: &ClientMsg) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(ProtocolError::Encode)
}

pub fn decode_client(raw: &str) -> Result<ClientMsg, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::Decode)
}
