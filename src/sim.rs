//! Fixed-rate simulation driver.
//!
//! Two background tasks: a fast loop at the configured tick rate that steps
//! every zone and flushes its deltas, and a 1 Hz housekeeping loop for
//! presence expiry, idle zone eviction, and the periodic directory refresh.
//! A slow tick never delays movement; the loops are independent.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::context::ServerContext;
use crate::util::now_ms;
use crate::zones::directory::DIR_REFRESH_SEC;

/// Spawn the simulation tasks. They run until the runtime shuts down.
pub fn start(ctx: Arc<ServerContext>) {
    let fast_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(fast_ctx.config.tick_ms()));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_hz = fast_ctx.config.tick_hz, "simulation loop started");
        loop {
            ticker.tick().await;
            fast_tick(&fast_ctx, now_ms());
        }
    });
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut seconds: u64 = 0;
        loop {
            ticker.tick().await;
            let now = now_ms();
            slow_tick(&ctx, now);
            seconds += 1;
            if seconds % DIR_REFRESH_SEC == 0 {
                let zones = ctx.directory.refresh(now);
                debug!(zones, "directory refreshed");
            }
        }
    });
}

/// One simulation step: advance the global tick, then step and flush every
/// zone under its own lock.
fn fast_tick(ctx: &ServerContext, now_ms: u64) {
    let tick = ctx.next_tick();
    for (_, zone) in ctx.zones.all_zones() {
        let mut guard = zone.lock();
        guard.tick(now_ms);
        guard.broadcast_deltas(tick);
    }
}

/// Once-a-second housekeeping: expired resume entries, deserted zones, and a
/// population log line per live zone.
fn slow_tick(ctx: &ServerContext, now_ms: u64) {
    let cleaned = ctx.presence.cleanup(now_ms);
    if cleaned > 0 {
        debug!(cleaned, "expired presence entries dropped");
    }
    let evicted = ctx.zones.sweep_idle(now_ms);
    for zone_id in &evicted {
        info!(zone = %zone_id, "idle zone evicted");
    }
    for (zone_id, zone) in ctx.zones.all_zones() {
        let guard = zone.lock();
        debug!(
            zone = %zone_id,
            players = guard.player_count(),
            tick = guard.tick_id(),
            "zone stats"
        );
    }
}
