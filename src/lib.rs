//! Vantown Realtime Server Library
//!
//! Authoritative world backbone for a tile-based multiplayer town. Zones own
//! their entities, collision, and area-of-interest state; a fixed-rate
//! simulation loop advances every zone and broadcasts deltas over a JSON
//! WebSocket protocol with client-side prediction support.

pub mod client;
pub mod config;
pub mod context;
pub mod data;
pub mod net;
pub mod sim;
pub mod ugc;
pub mod util;
pub mod zones;
