//! Zone id grammar.
//!
//! Three shapes, all lowercase, matched exactly (no case folding, no
//! trimming):
//!
//! - `world:<regionKey>` where regionKey is 2-8 letters a-z
//! - `region:<regionKey>:<instanceId>` where instanceId is 1-32 of [a-z0-9_]
//! - `level:level_<suffix>` where suffix is 1-64 of [a-z0-9_]
//!
//! The level id embedded in a level zone id keeps its `level_` prefix, so
//! `level:level_sewer` names the level `level_sewer`.

use serde::Serialize;

/// Coarse zone category derived from the id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    World,
    Region,
    Level,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::World => "world",
            ZoneKind::Region => "region",
            ZoneKind::Level => "level",
        }
    }
}

/// Structured form of a valid zone id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedZoneId {
    World { region_key: String },
    Region { region_key: String, instance_id: String },
    Level { level_id: String },
}

impl ParsedZoneId {
    pub fn kind(&self) -> ZoneKind {
        match self {
            ParsedZoneId::World { .. } => ZoneKind::World,
            ParsedZoneId::Region { .. } => ZoneKind::Region,
            ParsedZoneId::Level { .. } => ZoneKind::Level,
        }
    }

    /// Region key for world and region zones, `None` for levels.
    pub fn region_key(&self) -> Option<&str> {
        match self {
            ParsedZoneId::World { region_key } => Some(region_key),
            ParsedZoneId::Region { region_key, .. } => Some(region_key),
            ParsedZoneId::Level { .. } => None,
        }
    }

    /// Level id (including the `level_` prefix) for level zones.
    pub fn level_id(&self) -> Option<&str> {
        match self {
            ParsedZoneId::Level { level_id } => Some(level_id),
            _ => None,
        }
    }
}

fn is_region_key(s: &str) -> bool {
    (2..=8).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_lowercase())
}

fn is_slug(s: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&s.len())
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Parse a zone id, returning `None` for anything outside the grammar.
pub fn parse_zone_id(id: &str) -> Option<ParsedZoneId> {
    if let Some(rest) = id.strip_prefix("world:") {
        if is_region_key(rest) {
            return Some(ParsedZoneId::World {
                region_key: rest.to_string(),
            });
        }
        return None;
    }
    if let Some(rest) = id.strip_prefix("region:") {
        let (key, instance) = rest.split_once(':')?;
        if is_region_key(key) && is_slug(instance, 1, 32) {
            return Some(ParsedZoneId::Region {
                region_key: key.to_string(),
                instance_id: instance.to_string(),
            });
        }
        return None;
    }
    if let Some(rest) = id.strip_prefix("level:") {
        let suffix = rest.strip_prefix("level_")?;
        if is_slug(suffix, 1, 64) {
            return Some(ParsedZoneId::Level {
                level_id: rest.to_string(),
            });
        }
        return None;
    }
    None
}

pub fn is_valid_zone_id(id: &str) -> bool {
    parse_zone_id(id).is_some()
}

/// Kind for a zone id, defaulting to `World` when the id does not parse.
///
/// Used where a zone object must still be constructed for an id that slipped
/// past validation; such zones behave like worlds with fallback bounds.
pub fn zone_kind_or_world(id: &str) -> ZoneKind {
    parse_zone_id(id).map(|p| p.kind()).unwrap_or(ZoneKind::World)
}
