//! Zone domain: id grammar, bounds and spawn resolution, collision grids,
//! per-zone entity state, the zone registry, the transfer directory, and the
//! presence cache backing reconnect resume.

pub mod bounds;
pub mod collision;
pub mod directory;
pub mod id;
pub mod manager;
pub mod presence;
pub mod zone;
