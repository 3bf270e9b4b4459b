//! Area-of-interest grid.
//!
//! Zones bucket entities into square cells of [`ServerConfig::aoi_cell_size_tiles`]
//! tiles; visibility is always the 3x3 cell neighborhood around an entity's
//! cell. Broadcast fan-out walks cells instead of the whole zone population.
//!
//! [`ServerConfig::aoi_cell_size_tiles`]: crate::config::ServerConfig

use hashbrown::HashSet;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::util::ids::EntityId;

/// Cell coordinate, tile position divided by the cell size (floored).
pub type CellCoord = (i32, i32);

/// Map a tile coordinate to its cell.
pub fn pos_to_cell(tile_x: i32, tile_y: i32, cell_size: i32) -> CellCoord {
    (tile_x.div_euclid(cell_size), tile_y.div_euclid(cell_size))
}

/// The 3x3 neighborhood around a cell, center included.
pub fn neighbor_cells(cell: CellCoord) -> SmallVec<[CellCoord; 9]> {
    let mut out = SmallVec::new();
    for dy in -1..=1 {
        for dx in -1..=1 {
            out.push((cell.0 + dx, cell.1 + dy));
        }
    }
    out
}

/// Recorded cell transition returned by [`AoiGrid::move_player`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellMove {
    pub from: CellCoord,
    pub to: CellCoord,
}

/// Entity-to-cell index for one zone.
#[derive(Debug)]
pub struct AoiGrid {
    cell_size: i32,
    cells: FxHashMap<CellCoord, HashSet<EntityId>>,
    player_cells: FxHashMap<EntityId, CellCoord>,
}

impl AoiGrid {
    pub fn new(cell_size: i32) -> Self {
        Self {
            cell_size: cell_size.max(1),
            cells: FxHashMap::default(),
            player_cells: FxHashMap::default(),
        }
    }

    pub fn cell_size(&self) -> i32 {
        self.cell_size
    }

    /// Cell for a tile position under this grid's cell size.
    pub fn cell_for_tile(&self, tile_x: i32, tile_y: i32) -> CellCoord {
        pos_to_cell(tile_x, tile_y, self.cell_size)
    }

    pub fn add_player(&mut self, id: &str, tile_x: i32, tile_y: i32) {
        let cell = self.cell_for_tile(tile_x, tile_y);
        self.cells.entry(cell).or_default().insert(id.to_string());
        self.player_cells.insert(id.to_string(), cell);
    }

    pub fn remove_player(&mut self, id: &str) {
        let Some(cell) = self.player_cells.remove(id) else {
            return;
        };
        if let Some(set) = self.cells.get_mut(&cell) {
            set.remove(id);
            if set.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Move an entity to the cell containing the given tile. Returns `None`
    /// when the cell did not change (including for unknown entities).
    pub fn move_player(&mut self, id: &str, tile_x: i32, tile_y: i32) -> Option<CellMove> {
        let new_cell = self.cell_for_tile(tile_x, tile_y);
        let old_cell = *self.player_cells.get(id)?;
        if old_cell == new_cell {
            return None;
        }
        if let Some(set) = self.cells.get_mut(&old_cell) {
            set.remove(id);
            if set.is_empty() {
                self.cells.remove(&old_cell);
            }
        }
        self.cells
            .entry(new_cell)
            .or_default()
            .insert(id.to_string());
        self.player_cells.insert(id.to_string(), new_cell);
        Some(CellMove {
            from: old_cell,
            to: new_cell,
        })
    }

    /// Current cell of an entity, if indexed.
    pub fn cell_of(&self, id: &str) -> Option<CellCoord> {
        self.player_cells.get(id).copied()
    }

    /// Entities in the 3x3 neighborhood of `cell`, excluding `exclude`.
    pub fn neighbor_players(&self, cell: CellCoord, exclude: &str) -> Vec<EntityId> {
        let mut out = Vec::new();
        for c in neighbor_cells(cell) {
            if let Some(set) = self.cells.get(&c) {
                for id in set {
                    if id != exclude {
                        out.push(id.clone());
                    }
                }
            }
        }
        out
    }

    /// Entities visible to `id`: its 3x3 neighborhood, excluding itself.
    /// Empty when `id` is not indexed.
    pub fn visible_players(&self, id: &str) -> Vec<EntityId> {
        match self.player_cells.get(id) {
            Some(cell) => self.neighbor_players(*cell, id),
            None => Vec::new(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn player_count(&self) -> usize {
        self.player_cells.len()
    }
}
