//! Temperature diffusion
//!
//! Each tile pulls toward the conduction-weighted average of its 3x3 window.
//! A neighbor's weight grows with the magnitude of its temperature and its
//! `conduction_other`; the tile's own `conduction_self` decides how far it
//! moves toward that average, then its `add_temperature` is added. Every
//! class takes part, air included; built-in air neither conducts nor adds
//! heat, so it keeps its temperature. Neighbors at exactly 0 carry no heat.

use crate::simulation::{MaterialInstance, MaterialRegistry};

/// Temperature scale at which a neighbor reaches full weight
const HEAT_SCALE: f32 = 64.0;

/// Keeps the weight sum non-zero
const BASE_WEIGHT: f32 = 0.01;

/// New temperature of `tile` given its 3x3 window (the tile itself included)
pub fn diffused_temperature<'a>(
    registry: &MaterialRegistry,
    tile: &MaterialInstance,
    window: impl IntoIterator<Item = &'a MaterialInstance>,
) -> i32 {
    let material = registry.get(tile.material);

    let mut weighted = 0.0f32;
    let mut total = BASE_WEIGHT;
    for neighbor in window {
        if neighbor.temperature == 0 {
            continue;
        }
        let factor = neighbor.temperature.abs() as f32 / HEAT_SCALE
            * registry.get(neighbor.material).conduction_other;
        weighted += neighbor.temperature as f32 * factor;
        total += factor;
    }

    let current = tile.temperature as f32;
    let next = if weighted != 0.0 {
        weighted / total * material.conduction_self + current * (1.0 - material.conduction_self)
    } else {
        current
    };

    material.add_temperature + next as i32
}

/// Compute the next temperature of every tile in a `width` x `height` grid
///
/// `outside` resolves coordinates beyond the grid (neighbor chunks); `None`
/// means nothing is there. Reads only the old state, so the result does not
/// depend on iteration order.
pub fn diffuse_grid<F>(
    registry: &MaterialRegistry,
    tiles: &[MaterialInstance],
    width: usize,
    height: usize,
    outside: F,
) -> Vec<i32>
where
    F: Fn(i32, i32) -> Option<MaterialInstance>,
{
    debug_assert_eq!(tiles.len(), width * height);
    let mut next = Vec::with_capacity(tiles.len());
    let mut window: Vec<MaterialInstance> = Vec::with_capacity(9);

    for y in 0..height {
        for x in 0..width {
            let tile = &tiles[y * width + x];
            let material = registry.get(tile.material);
            // Result would equal the current temperature
            if material.conduction_self == 0.0 && material.add_temperature == 0 {
                next.push(tile.temperature);
                continue;
            }

            window.clear();
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let nx = x as i32 + dx;
                    let ny = y as i32 + dy;
                    if (0..width as i32).contains(&nx) && (0..height as i32).contains(&ny) {
                        window.push(tiles[ny as usize * width + nx as usize]);
                    } else if let Some(neighbor) = outside(nx, ny) {
                        window.push(neighbor);
                    }
                }
            }

            next.push(diffused_temperature(registry, tile, window.iter()));
        }
    }

    next
}
