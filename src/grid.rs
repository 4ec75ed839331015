//! Map grid and area-of-interest cell math.
//!
//! The world is partitioned twice. Coarsely, 10 000 maps are laid out on a
//! 100x100 grid and addressed by a single id in `0..10000`. Finely, positions
//! inside a map are bucketed into square AOI cells on the horizontal plane so
//! clients can subscribe to just the cells they can see.

use std::collections::HashSet;

/// A map id in `0..10000` on the 100x100 world grid.
pub type MapId = u16;

/// Width (and height) of the world grid, in maps.
pub const MAP_GRID_WIDTH: u16 = 100;

/// Total number of addressable maps.
pub const MAP_COUNT: u16 = MAP_GRID_WIDTH * MAP_GRID_WIDTH;

/// Edge length of one AOI cell, in world units. Uniform across nodes so a
/// client's subscription means the same thing on every server.
pub const CELL_SIZE: f32 = 10.0;

/// Cell coordinates beyond this magnitude are rejected by [`validate_cells`].
const CELL_COORD_LIMIT: i32 = 10_000;

/// The six anchor maps the auto-selector expands from. Always implicitly
/// guarded by the grid.
pub const SEED_MAPS: [MapId; 6] = [0, 2211, 4455, 5544, 7788, 9999];

/// Returns true iff `map_id` addresses a map on the grid.
pub fn is_valid_map(map_id: u16) -> bool {
    map_id < MAP_COUNT
}

/// Buckets a horizontal position into its AOI cell id.
///
/// Deterministic, including for non-finite inputs (NaN saturates to cell 0).
pub fn cell_from_position(x: f32, z: f32) -> String {
    let gx = (x / CELL_SIZE).floor() as i32;
    let gz = (z / CELL_SIZE).floor() as i32;
    format!("{gx},{gz}")
}

/// Defensive filter over client-supplied cell ids: keeps only well-formed
/// `"gx,gz"` pairs of in-range integers, dropping duplicates.
pub fn validate_cells(cells: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    cells
        .iter()
        .filter(|cell| parse_cell(cell).is_some())
        .filter(|cell| seen.insert(cell.as_str()))
        .cloned()
        .collect()
}

fn parse_cell(cell: &str) -> Option<(i32, i32)> {
    let (gx, gz) = cell.split_once(',')?;
    let gx: i32 = gx.parse().ok()?;
    let gz: i32 = gz.parse().ok()?;
    if gx.abs() > CELL_COORD_LIMIT || gz.abs() > CELL_COORD_LIMIT {
        return None;
    }
    Some((gx, gz))
}

/// Grid coordinates `(col, row)` of a map.
pub fn map_coords(map_id: MapId) -> (u16, u16) {
    (map_id % MAP_GRID_WIDTH, map_id / MAP_GRID_WIDTH)
}

/// Manhattan distance between two maps on the grid.
pub fn manhattan_distance(a: MapId, b: MapId) -> u16 {
    let (ax, ay) = map_coords(a);
    let (bx, by) = map_coords(b);
    ax.abs_diff(bx) + ay.abs_diff(by)
}

/// The up-to-eight grid neighbors of a map, clipped at the world edge.
pub fn neighbors8(map_id: MapId) -> Vec<MapId> {
    let (x, y) = map_coords(map_id);
    let mut out = Vec::with_capacity(8);
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = i32::from(x) + dx;
            let ny = i32::from(y) + dy;
            if (0..i32::from(MAP_GRID_WIDTH)).contains(&nx)
                && (0..i32::from(MAP_GRID_WIDTH)).contains(&ny)
            {
                out.push((ny * i32::from(MAP_GRID_WIDTH) + nx) as MapId);
            }
        }
    }
    out
}
