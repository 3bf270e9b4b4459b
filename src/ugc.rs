//! User-submitted sprite patterns.
//!
//! A submission re-skins one of the built-in base sprites with a character
//! grid: `.` is transparent, any ASCII alphanumeric is a palette pixel.
//! Dimensions are locked to the base sprite, and the pattern must carry at
//! least 90% (configurable) of the base sprite's pixel mass so players stay
//! recognizable. Accepted patterns are content-addressed per account, so
//! resubmitting the same grid returns the existing sprite.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use ring::digest;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::net::auth::RateLimiter;
use crate::util::hex_string;
use crate::util::ids::AccountId;

/// Built-in sprite a pattern may re-skin.
#[derive(Debug, Clone, Copy)]
pub struct BaseSprite {
    pub key: &'static str,
    pub w: u32,
    pub h: u32,
    /// Opaque pixel count of the base art, the reference for mass checks.
    pub mass: u32,
}

pub const BASE_SPRITES: [BaseSprite; 2] = [
    BaseSprite { key: "van", w: 32, h: 24, mass: 480 },
    BaseSprite { key: "walker", w: 18, h: 17, mass: 200 },
];

pub fn base_sprite(key: &str) -> Option<&'static BaseSprite> {
    BASE_SPRITES.iter().find(|b| b.key == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
    Info,
}

/// One validation finding, serialized verbatim into `ugc_result` errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UgcIssue {
    pub code: String,
    pub severity: Severity,
    pub path: String,
    pub msg: String,
}

impl UgcIssue {
    fn error(code: &str, path: String, msg: String) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Error,
            path,
            msg,
        }
    }
}

/// A stored, validated sprite.
#[derive(Debug, Clone, PartialEq)]
pub struct UgcSprite {
    pub ugc_id: String,
    pub account_id: AccountId,
    pub base_sprite_key: String,
    pub w: u32,
    pub h: u32,
    pub rows: Vec<String>,
    pub mass: u32,
    pub hash: String,
    pub sprite_ref: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UgcOutcome {
    Accepted {
        ugc_id: String,
        sprite_ref: String,
        base_sprite_key: String,
        deduped: bool,
    },
    Rejected {
        errors: Vec<UgcIssue>,
    },
    RateLimited {
        retry_after_ms: u64,
    },
}

struct ValidPattern {
    rows: Vec<String>,
    w: u32,
    h: u32,
    mass: u32,
}

fn pattern_char_ok(c: char) -> bool {
    c == '.' || c.is_ascii_alphanumeric()
}

/// Validate one submission against its base sprite. Stages run in order and
/// the first failing stage returns every issue it found; later stages only
/// see structurally sound input.
fn validate_pattern(
    base: &BaseSprite,
    width: f64,
    height: f64,
    rows: &[serde_json::Value],
    max_width: u32,
    max_height: u32,
    mass_tolerance: f64,
) -> Result<ValidPattern, Vec<UgcIssue>> {
    if rows.is_empty() {
        return Err(vec![UgcIssue::error(
            "UGC_ROWS_MISSING",
            "rows".to_string(),
            "pattern rows are required".to_string(),
        )]);
    }
    if width != base.w as f64 || height != base.h as f64 {
        return Err(vec![UgcIssue::error(
            "UGC_DIM_LOCKED",
            "width".to_string(),
            format!("dimensions are locked to {}x{} for {}", base.w, base.h, base.key),
        )]);
    }
    if base.w > max_width || base.h > max_height {
        return Err(vec![UgcIssue::error(
            "UGC_DIM_EXCEEDS_CAP",
            "width".to_string(),
            format!("dimensions exceed the {max_width}x{max_height} cap"),
        )]);
    }
    let mut issues = Vec::new();
    if rows.len() != base.h as usize {
        issues.push(UgcIssue::error(
            "PAT_HEIGHT_MISMATCH",
            "rows".to_string(),
            format!("expected {} rows, got {}", base.h, rows.len()),
        ));
    }
    let mut text_rows: Vec<String> = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let Some(s) = row.as_str() else {
            issues.push(UgcIssue::error(
                "PAT_ROW_NOT_STRING",
                format!("rows[{i}]"),
                "row must be a string".to_string(),
            ));
            continue;
        };
        if s.chars().count() != base.w as usize {
            issues.push(UgcIssue::error(
                "PAT_WIDTH_MISMATCH",
                format!("rows[{i}]"),
                format!("expected {} columns, got {}", base.w, s.chars().count()),
            ));
            continue;
        }
        text_rows.push(s.to_string());
    }
    if !issues.is_empty() {
        return Err(issues);
    }
    for (i, row) in text_rows.iter().enumerate() {
        if let Some(bad) = row.chars().find(|c| !pattern_char_ok(*c)) {
            issues.push(UgcIssue::error(
                "PAT_INVALID_CHAR",
                format!("rows[{i}]"),
                format!("invalid character {bad:?}, allowed are '.' and alphanumerics"),
            ));
        }
    }
    if !issues.is_empty() {
        return Err(issues);
    }
    let mass = text_rows
        .iter()
        .map(|r| r.chars().filter(|c| *c != '.').count() as u32)
        .sum::<u32>();
    if mass == 0 {
        return Err(vec![UgcIssue::error(
            "UGC_EMPTY",
            "rows".to_string(),
            "pattern has no opaque pixels".to_string(),
        )]);
    }
    let min_mass = (base.mass as f64 * mass_tolerance).floor() as u32;
    if mass < min_mass {
        return Err(vec![UgcIssue::error(
            "UGC_MASS_TOO_LOW",
            "rows".to_string(),
            format!("pattern mass {mass} below minimum {min_mass}"),
        )]);
    }
    Ok(ValidPattern {
        rows: text_rows,
        w: base.w,
        h: base.h,
        mass,
    })
}

fn pattern_hash(base_key: &str, w: u32, h: u32, rows: &[String]) -> String {
    let canonical = json!({
        "baseSpriteKey": base_key,
        "w": w,
        "h": h,
        "rows": rows,
    })
    .to_string();
    hex_string(digest::digest(&digest::SHA256, canonical.as_bytes()).as_ref())
}

pub struct UgcRegistry {
    max_width: u32,
    max_height: u32,
    mass_tolerance: f64,
    limiter: RateLimiter,
    sprites: Mutex<HashMap<String, UgcSprite>>,
    /// `<account>:<hash>` -> ugc id, the per-account dedupe index.
    by_hash: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
}

impl UgcRegistry {
    pub fn new(
        max_width: u32,
        max_height: u32,
        mass_tolerance: f64,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            max_width,
            max_height,
            mass_tolerance,
            limiter,
            sprites: Mutex::new(HashMap::new()),
            by_hash: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn submit(
        &self,
        account_id: &str,
        base_sprite_key: &str,
        width: f64,
        height: f64,
        rows: &[serde_json::Value],
        now_ms: u64,
    ) -> UgcOutcome {
        if let Err(retry_after_ms) = self
            .limiter
            .consume(&format!("acct:ugc:{account_id}"), now_ms)
        {
            return UgcOutcome::RateLimited { retry_after_ms };
        }
        let Some(base) = base_sprite(base_sprite_key) else {
            return UgcOutcome::Rejected {
                errors: vec![UgcIssue::error(
                    "UGC_UNKNOWN_BASE",
                    "baseSpriteKey".to_string(),
                    format!("unknown base sprite: {base_sprite_key}"),
                )],
            };
        };
        let pattern = match validate_pattern(
            base,
            width,
            height,
            rows,
            self.max_width,
            self.max_height,
            self.mass_tolerance,
        ) {
            Ok(p) => p,
            Err(errors) => return UgcOutcome::Rejected { errors },
        };
        let hash = pattern_hash(base.key, pattern.w, pattern.h, &pattern.rows);
        let dedupe_key = format!("{account_id}:{hash}");
        if let Some(existing_id) = self.by_hash.lock().get(&dedupe_key) {
            let sprites = self.sprites.lock();
            if let Some(sprite) = sprites.get(existing_id) {
                return UgcOutcome::Accepted {
                    ugc_id: sprite.ugc_id.clone(),
                    sprite_ref: sprite.sprite_ref.clone(),
                    base_sprite_key: sprite.base_sprite_key.clone(),
                    deduped: true,
                };
            }
        }
        let ugc_id = format!("u{:04}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let sprite_ref = format!("ugc:{account_id}:{ugc_id}");
        let sprite = UgcSprite {
            ugc_id: ugc_id.clone(),
            account_id: account_id.to_string(),
            base_sprite_key: base.key.to_string(),
            w: pattern.w,
            h: pattern.h,
            rows: pattern.rows,
            mass: pattern.mass,
            hash,
            sprite_ref: sprite_ref.clone(),
            created_at_ms: now_ms,
        };
        self.by_hash
            .lock()
            .insert(dedupe_key, ugc_id.clone());
        self.sprites.lock().insert(ugc_id.clone(), sprite);
        UgcOutcome::Accepted {
            ugc_id,
            sprite_ref,
            base_sprite_key: base.key.to_string(),
            deduped: false,
        }
    }

    pub fn get(&self, ugc_id: &str) -> Option<UgcSprite> {
        self.sprites.lock().get(ugc_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sprites.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sprites.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const NOW: u64 = 7_000;

    fn registry() -> UgcRegistry {
        UgcRegistry::new(64, 64, 0.90, RateLimiter::new(3, 60_000))
    }

    /// Row-major pattern for `base` with exactly `mass` opaque pixels.
    fn rows_with_mass(base: &BaseSprite, mass: u32) -> Vec<Value> {
        let cells = base.w * base.h;
        assert!(mass <= cells);
        (0..base.h)
            .map(|y| {
                (0..base.w)
                    .map(|x| if y * base.w + x < mass { 'x' } else { '.' })
                    .collect::<String>()
            })
            .map(Value::from)
            .collect()
    }

    fn van() -> &'static BaseSprite {
        base_sprite("van").unwrap()
    }

    fn submit_van(reg: &UgcRegistry, account: &str, rows: Vec<Value>) -> UgcOutcome {
        reg.submit(account, "van", 32.0, 24.0, &rows, NOW)
    }

    fn first_code(outcome: &UgcOutcome) -> &str {
        match outcome {
            UgcOutcome::Rejected { errors } => &errors[0].code,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_pattern_accepted() {
        let reg = registry();
        let outcome = submit_van(&reg, "acct_a", rows_with_mass(van(), 500));
        match outcome {
            UgcOutcome::Accepted { ugc_id, sprite_ref, base_sprite_key, deduped } => {
                assert_eq!(ugc_id, "u0001");
                assert_eq!(sprite_ref, "ugc:acct_a:u0001");
                assert_eq!(base_sprite_key, "van");
                assert!(!deduped);
            }
            other => panic!("expected accept, got {other:?}"),
        }
        let sprite = reg.get("u0001").unwrap();
        assert_eq!(sprite.mass, 500);
        assert_eq!(sprite.rows.len(), 24);
    }

    #[test]
    fn test_unknown_base_rejected() {
        let reg = registry();
        let outcome = reg.submit("acct_a", "tank", 32.0, 24.0, &rows_with_mass(van(), 500), NOW);
        assert_eq!(first_code(&outcome), "UGC_UNKNOWN_BASE");
    }

    #[test]
    fn test_missing_rows_rejected() {
        let reg = registry();
        let outcome = reg.submit("acct_a", "van", 32.0, 24.0, &[], NOW);
        assert_eq!(first_code(&outcome), "UGC_ROWS_MISSING");
    }

    #[test]
    fn test_dimensions_locked_to_base() {
        let reg = registry();
        let outcome = reg.submit("acct_a", "van", 31.0, 24.0, &rows_with_mass(van(), 500), NOW);
        assert_eq!(first_code(&outcome), "UGC_DIM_LOCKED");
        let outcome = reg.submit("acct_a", "van", 32.0, 25.0, &rows_with_mass(van(), 500), NOW);
        assert_eq!(first_code(&outcome), "UGC_DIM_LOCKED");
    }

    #[test]
    fn test_cap_below_base_dims_rejects() {
        let reg = UgcRegistry::new(16, 16, 0.90, RateLimiter::new(3, 60_000));
        let outcome = reg.submit("acct_a", "van", 32.0, 24.0, &rows_with_mass(van(), 500), NOW);
        assert_eq!(first_code(&outcome), "UGC_DIM_EXCEEDS_CAP");
    }

    #[test]
    fn test_pattern_shape_errors_reported_per_row() {
        let reg = registry();
        let mut rows = rows_with_mass(van(), 500);
        rows[2] = Value::from(7);
        rows[5] = Value::from("x".repeat(31));
        let outcome = submit_van(&reg, "acct_a", rows);
        match outcome {
            UgcOutcome::Rejected { errors } => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].code, "PAT_ROW_NOT_STRING");
                assert_eq!(errors[0].path, "rows[2]");
                assert_eq!(errors[1].code, "PAT_WIDTH_MISMATCH");
                assert_eq!(errors[1].path, "rows[5]");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_height_mismatch_detected() {
        let reg = registry();
        let mut rows = rows_with_mass(van(), 500);
        rows.pop();
        let outcome = submit_van(&reg, "acct_a", rows);
        assert_eq!(first_code(&outcome), "PAT_HEIGHT_MISMATCH");
    }

    #[test]
    fn test_invalid_character_rejected() {
        let reg = registry();
        let mut rows = rows_with_mass(van(), 500);
        rows[0] = Value::from(format!("!{}", "x".repeat(31)));
        let outcome = submit_van(&reg, "acct_a", rows);
        assert_eq!(first_code(&outcome), "PAT_INVALID_CHAR");
    }

    #[test]
    fn test_empty_and_low_mass_rejected() {
        let reg = registry();
        let outcome = submit_van(&reg, "acct_a", rows_with_mass(van(), 0));
        assert_eq!(first_code(&outcome), "UGC_EMPTY");
        // van minimum is floor(480 * 0.90) = 432
        let outcome = submit_van(&reg, "acct_a", rows_with_mass(van(), 431));
        assert_eq!(first_code(&outcome), "UGC_MASS_TOO_LOW");
    }

    #[test]
    fn test_mass_exactly_at_minimum_accepted() {
        let reg = registry();
        let outcome = submit_van(&reg, "acct_a", rows_with_mass(van(), 432));
        assert!(matches!(outcome, UgcOutcome::Accepted { .. }));
    }

    #[test]
    fn test_walker_minimum_mass() {
        let reg = registry();
        let walker = base_sprite("walker").unwrap();
        // walker minimum is floor(200 * 0.90) = 180
        let low = reg.submit("acct_a", "walker", 18.0, 17.0, &rows_with_mass(walker, 179), NOW);
        assert_eq!(first_code(&low), "UGC_MASS_TOO_LOW");
        let ok = reg.submit("acct_a", "walker", 18.0, 17.0, &rows_with_mass(walker, 180), NOW);
        assert!(matches!(ok, UgcOutcome::Accepted { .. }));
    }

    #[test]
    fn test_resubmission_dedupes_per_account() {
        let reg = registry();
        let rows = rows_with_mass(van(), 500);
        let first = submit_van(&reg, "acct_a", rows.clone());
        let UgcOutcome::Accepted { ugc_id: first_id, .. } = first else {
            panic!("expected accept");
        };
        match submit_van(&reg, "acct_a", rows.clone()) {
            UgcOutcome::Accepted { ugc_id, deduped, .. } => {
                assert_eq!(ugc_id, first_id);
                assert!(deduped);
            }
            other => panic!("expected dedupe, got {other:?}"),
        }
        // another account gets its own sprite for the same pattern
        match submit_van(&reg, "acct_b", rows) {
            UgcOutcome::Accepted { ugc_id, deduped, sprite_ref, .. } => {
                assert_ne!(ugc_id, first_id);
                assert!(!deduped);
                assert!(sprite_ref.starts_with("ugc:acct_b:"));
            }
            other => panic!("expected accept, got {other:?}"),
        }
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_rate_limit_three_per_window() {
        let reg = registry();
        let rows = rows_with_mass(van(), 500);
        for _ in 0..3 {
            assert!(!matches!(
                submit_van(&reg, "acct_a", rows.clone()),
                UgcOutcome::RateLimited { .. }
            ));
        }
        match submit_van(&reg, "acct_a", rows.clone()) {
            UgcOutcome::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, 20_000),
            other => panic!("expected rate limit, got {other:?}"),
        }
        // other accounts are unaffected
        assert!(matches!(
            submit_van(&reg, "acct_b", rows),
            UgcOutcome::Accepted { .. }
        ));
    }
}
