//! Networking: AOI spatial index, wire protocol, auth tokens, per-connection
//! sessions, and the WebSocket accept loop.

pub mod aoi;
pub mod auth;
pub mod protocol;
pub mod server;
pub mod session;
