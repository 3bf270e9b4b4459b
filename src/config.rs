use std::net::{IpAddr, Ipv4Addr};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Simulation tick rate in Hz
    pub tick_hz: u32,
    /// AOI cell size in tiles
    pub aoi_cell_size_tiles: i32,
    /// Root directory for static region/level data files
    pub data_dir: String,
    /// Allow direct world -> level teleports (dev convenience)
    pub allow_world_level_teleport: bool,
    /// WebSocket keepalive ping interval
    pub ws_ping_interval_ms: u64,
    /// Resume window after disconnect
    pub resume_ttl_seconds: u64,
    /// Evict zones that stayed empty this long (default zone exempt)
    pub zone_idle_evict_seconds: u64,
    /// UGC sprite width cap
    pub ugc_max_width: u32,
    /// UGC sprite height cap
    pub ugc_max_height: u32,
    /// Minimum UGC pixel mass as a fraction of the base sprite's mass
    pub ugc_mass_tolerance: f64,
    /// UGC submissions allowed per account per window
    pub ugc_submit_rate_limit_per_min: u32,
    /// UGC rate limit window
    pub ugc_submit_rate_window_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 3000,
            tick_hz: 20,
            aoi_cell_size_tiles: 16,
            data_dir: "data".to_string(),
            allow_world_level_teleport: true,
            ws_ping_interval_ms: 25_000,
            resume_ttl_seconds: 30,
            zone_idle_evict_seconds: 120,
            ugc_max_width: 64,
            ugc_max_height: 64,
            ugc_mass_tolerance: 0.90,
            ugc_submit_rate_limit_per_min: 3,
            ugc_submit_rate_window_ms: 60_000,
        }
    }
}

impl ServerConfig {
    /// Milliseconds per simulation tick
    pub fn tick_ms(&self) -> u64 {
        1000 / self.tick_hz as u64
    }

    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                if parsed > 0 {
                    config.port = parsed;
                } else {
                    tracing::warn!("PORT must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid PORT '{}', using default", port);
            }
        }

        if let Ok(hz) = std::env::var("TICK_HZ") {
            if let Ok(parsed) = hz.parse::<u32>() {
                if (1..=120).contains(&parsed) {
                    config.tick_hz = parsed;
                } else {
                    tracing::warn!("TICK_HZ must be 1-120, using default");
                }
            } else {
                tracing::warn!("Invalid TICK_HZ '{}', using default", hz);
            }
        }

        if let Ok(cell) = std::env::var("AOI_CELL_SIZE_TILES") {
            if let Ok(parsed) = cell.parse::<i32>() {
                if parsed > 0 {
                    config.aoi_cell_size_tiles = parsed;
                } else {
                    tracing::warn!("AOI_CELL_SIZE_TILES must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid AOI_CELL_SIZE_TILES '{}', using default", cell);
            }
        }

        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = dir;
        }

        if let Ok(allow) = std::env::var("ALLOW_WORLD_LEVEL_TELEPORT") {
            config.allow_world_level_teleport = allow == "true" || allow == "1";
        }

        if let Ok(ms) = std::env::var("WS_PING_INTERVAL_MS") {
            match ms.parse::<u64>() {
                Ok(parsed) if parsed >= 1000 => config.ws_ping_interval_ms = parsed,
                _ => tracing::warn!("Invalid WS_PING_INTERVAL_MS '{}', using default", ms),
            }
        }

        if let Ok(ttl) = std::env::var("RESUME_TTL_SECONDS") {
            match ttl.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.resume_ttl_seconds = parsed,
                _ => tracing::warn!("Invalid RESUME_TTL_SECONDS '{}', using default", ttl),
            }
        }

        if let Ok(secs) = std::env::var("ZONE_IDLE_EVICT_SECONDS") {
            match secs.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.zone_idle_evict_seconds = parsed,
                _ => tracing::warn!("Invalid ZONE_IDLE_EVICT_SECONDS '{}', using default", secs),
            }
        }

        if let Ok(limit) = std::env::var("UGC_SUBMIT_RATE_LIMIT_PER_MIN") {
            match limit.parse::<u32>() {
                Ok(parsed) if parsed > 0 => config.ugc_submit_rate_limit_per_min = parsed,
                _ => tracing::warn!("Invalid UGC_SUBMIT_RATE_LIMIT_PER_MIN '{}', using default", limit),
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.tick_hz == 0 || self.tick_hz > 120 {
            return Err("tick_hz must be 1-120".to_string());
        }
        if self.aoi_cell_size_tiles <= 0 {
            return Err("aoi_cell_size_tiles must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.ugc_mass_tolerance) {
            return Err("ugc_mass_tolerance must be within 0.0-1.0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.tick_hz, 20);
        assert_eq!(config.tick_ms(), 50);
        assert_eq!(config.aoi_cell_size_tiles, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
        assert!(config.validate().is_ok());
    }
}
