//! Cellular automaton for a single chunk
//!
//! A [`ChunkTicker`] owns one chunk mutably for the duration of a tick and
//! reads its eight neighbors through shared references. Moves that leave the
//! chunk are not written to the neighbor; they land in [`BoundaryWrites`],
//! which the caller merges once every chunk of the same checkerboard set has
//! finished.

use crate::simulation::temperature::diffuse_grid;
use crate::simulation::{Interaction, InteractionKind, MaterialInstance, MaterialRegistry, PhysicsClass, ReactionEngine};
use crate::world::stats::{SimStats, TickCounters};
use crate::world::{Chunk, WorldRng, CHUNK_SIZE};
use glam::IVec2;
use std::collections::HashMap;

const SIZE: i32 = CHUNK_SIZE as i32;

/// The 3x3 block around a chunk, index = (dy + 1) * 3 + (dx + 1)
pub type Neighbors<'a> = [Option<&'a Chunk>; 9];

#[inline]
pub fn neighbor_slot(dx: i32, dy: i32) -> usize {
    ((dy + 1) * 3 + (dx + 1)) as usize
}

#[inline]
fn in_chunk(x: i32, y: i32) -> bool {
    (0..SIZE).contains(&x) && (0..SIZE).contains(&y)
}

/// Which per-tick passes run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickOptions {
    pub temperature: bool,
    pub reactions: bool,
}

impl Default for TickOptions {
    fn default() -> Self {
        Self {
            temperature: true,
            reactions: true,
        }
    }
}

/// Tiles a chunk wrote into its neighbors this tick, keyed by world coordinate
#[derive(Debug, Default)]
pub struct BoundaryWrites {
    tiles: HashMap<IVec2, MaterialInstance>,
}

impl BoundaryWrites {
    pub fn get(&self, world: IVec2) -> Option<MaterialInstance> {
        self.tiles.get(&world).copied()
    }

    pub fn insert(&mut self, world: IVec2, tile: MaterialInstance) {
        self.tiles.insert(world, tile);
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Writes sorted by (y, x) so merges are reproducible
    pub fn into_sorted(self) -> Vec<(IVec2, MaterialInstance)> {
        let mut writes: Vec<_> = self.tiles.into_iter().collect();
        writes.sort_unstable_by_key(|(world, _)| (world.y, world.x));
        writes
    }
}

/// What one chunk's tick produced
#[derive(Debug, Default)]
pub struct ChunkTickResult {
    pub counters: TickCounters,
    pub boundary: BoundaryWrites,
    /// A tile on the chunk's outer ring changed
    pub edge_changed: bool,
}

pub struct ChunkTicker<'a, R: WorldRng> {
    registry: &'a MaterialRegistry,
    reactions: &'a ReactionEngine,
    chunk: &'a mut Chunk,
    neighbors: Neighbors<'a>,
    rng: R,
    result: ChunkTickResult,
}

impl<'a, R: WorldRng> ChunkTicker<'a, R> {
    pub fn new(
        registry: &'a MaterialRegistry,
        reactions: &'a ReactionEngine,
        chunk: &'a mut Chunk,
        neighbors: Neighbors<'a>,
        rng: R,
    ) -> Self {
        Self {
            registry,
            reactions,
            chunk,
            neighbors,
            rng,
            result: ChunkTickResult::default(),
        }
    }

    /// Movement and interactions, then diffusion, then unary reactions
    pub fn run(mut self, options: TickOptions) -> ChunkTickResult {
        self.update_tiles(options.reactions);
        if options.temperature {
            self.diffuse_temperature();
        }
        if options.reactions {
            self.apply_reactions();
        }
        self.result
    }

    // ===== Tile access =====

    /// Tile at chunk-local coordinates, which may lie in a neighbor
    fn read(&self, x: i32, y: i32) -> Option<MaterialInstance> {
        if in_chunk(x, y) {
            return Some(*self.chunk.tile(x as usize, y as usize));
        }
        let world = self.chunk.origin() + IVec2::new(x, y);
        if let Some(tile) = self.result.boundary.get(world) {
            return Some(tile);
        }
        let (dx, dy) = (x.div_euclid(SIZE), y.div_euclid(SIZE));
        if dx.abs() > 1 || dy.abs() > 1 {
            return None;
        }
        let neighbor = self.neighbors[neighbor_slot(dx, dy)]?;
        Some(*neighbor.tile(x.rem_euclid(SIZE) as usize, y.rem_euclid(SIZE) as usize))
    }

    fn write(&mut self, x: i32, y: i32, tile: MaterialInstance) {
        if in_chunk(x, y) {
            let (ux, uy) = (x as usize, y as usize);
            self.chunk.set_tile(ux, uy, tile);
            self.chunk.mark_moved(ux, uy);
            if x == 0 || y == 0 || x == SIZE - 1 || y == SIZE - 1 {
                self.result.edge_changed = true;
            }
        } else {
            let world = self.chunk.origin() + IVec2::new(x, y);
            self.result.boundary.insert(world, tile);
        }
    }

    // ===== Movement =====

    /// Bottom to top, x direction alternating per row
    fn update_tiles(&mut self, interactions: bool) {
        for y in 0..CHUNK_SIZE {
            if y % 2 == 0 {
                for x in 0..CHUNK_SIZE {
                    self.update_tile(x, y, interactions);
                }
            } else {
                for x in (0..CHUNK_SIZE).rev() {
                    self.update_tile(x, y, interactions);
                }
            }
        }
    }

    fn update_tile(&mut self, x: usize, y: usize, interactions: bool) {
        if self.chunk.is_moved(x, y) {
            return;
        }
        let material = self.chunk.material(x, y);
        let class = self.registry.physics_class(material);
        if class == PhysicsClass::Air {
            return;
        }

        let (x, y) = (x as i32, y as i32);
        if interactions && self.check_interactions(x, y) && self.chunk.material(x as usize, y as usize) != material {
            return;
        }

        match class {
            PhysicsClass::Sand => self.move_sand(x, y),
            PhysicsClass::Soup => self.move_soup(x, y),
            PhysicsClass::Gas => self.move_gas(x, y),
            _ => {}
        }
    }

    /// `mover` may swap with `target`
    fn can_displace(&self, mover: u16, target: u16) -> bool {
        let target_def = self.registry.get(target);
        match target_def.physics_class {
            PhysicsClass::Air => true,
            class if class.is_movable() => {
                let mover_def = self.registry.get(mover);
                if mover_def.physics_class == PhysicsClass::Gas {
                    target_def.density > mover_def.density
                } else {
                    target_def.density < mover_def.density
                }
            }
            _ => false,
        }
    }

    /// Swap the tile at (x, y) with (tx, ty); unloaded targets refuse
    fn try_move(&mut self, x: i32, y: i32, tx: i32, ty: i32) -> bool {
        debug_assert!(in_chunk(x, y));
        let Some(target) = self.read(tx, ty) else {
            return false;
        };
        let tile = *self.chunk.tile(x as usize, y as usize);
        if !self.can_displace(tile.material, target.material) {
            return false;
        }

        self.write(x, y, target);
        self.write(tx, ty, tile);
        self.result.counters.record_tile_moved();
        true
    }

    fn move_sand(&mut self, x: i32, y: i32) {
        if self.try_move(x, y, x, y - 1) {
            return;
        }
        let dx = self.rng.side();
        if self.try_move(x, y, x + dx, y - 1) {
            return;
        }
        self.try_move(x, y, x - dx, y - 1);
    }

    fn move_soup(&mut self, x: i32, y: i32) {
        if self.try_move(x, y, x, y - 1) {
            return;
        }
        let dx = self.rng.side();
        if self.try_move(x, y, x + dx, y - 1) || self.try_move(x, y, x - dx, y - 1) {
            return;
        }

        let budget = self
            .registry
            .get(self.chunk.material(x as usize, y as usize))
            .iteration_budget
            .max(1);
        for direction in [dx, -dx] {
            let mut cx = x;
            for _ in 0..budget {
                // Stop once the tile has left this chunk
                if !in_chunk(cx, y) || !self.try_move(cx, y, cx + direction, y) {
                    break;
                }
                cx += direction;
            }
            if cx != x {
                return;
            }
        }
    }

    fn move_gas(&mut self, x: i32, y: i32) {
        if self.try_move(x, y, x, y + 1) {
            return;
        }
        let dx = self.rng.side();
        if self.try_move(x, y, x + dx, y + 1) || self.try_move(x, y, x - dx, y + 1) {
            return;
        }
        if !self.try_move(x, y, x + dx, y) {
            self.try_move(x, y, x - dx, y);
        }
    }

    // ===== Interactions =====

    /// Check the four neighbors; at most one interaction fires
    fn check_interactions(&mut self, x: i32, y: i32) -> bool {
        let material = self.chunk.material(x as usize, y as usize);
        for (dx, dy) in [(0, -1), (0, 1), (-1, 0), (1, 0)] {
            let (nx, ny) = (x + dx, y + dy);
            let Some(other) = self.read(nx, ny) else {
                continue;
            };
            if other.material == material {
                continue;
            }
            let Some(interaction) = self.reactions.select_interaction(material, other.material).copied() else {
                continue;
            };
            self.apply_interaction(&interaction, IVec2::new(nx, ny), other.material);
            self.result.counters.record_interaction();
            return true;
        }
        false
    }

    /// Affected tiles outside this chunk are left alone
    fn apply_interaction(&mut self, interaction: &Interaction, touched: IVec2, touched_material: u16) {
        let center = touched + interaction.offset;
        let radius = interaction.radius;
        let result = self.registry.get(interaction.result);

        for ay in center.y - radius..=center.y + radius {
            for ax in center.x - radius..=center.x + radius {
                let (ddx, ddy) = (ax - center.x, ay - center.y);
                if ddx * ddx + ddy * ddy > radius * radius || !in_chunk(ax, ay) {
                    continue;
                }
                let (ux, uy) = (ax as usize, ay as usize);
                let current = self.chunk.material(ux, uy);
                let affected = match interaction.kind {
                    InteractionKind::TransformMaterial => current == touched_material,
                    InteractionKind::SpawnMaterial => self.registry.physics_class(current) == PhysicsClass::Air,
                };
                if affected {
                    let tile = MaterialInstance::new(result.id, result.color, result.default_temperature);
                    self.chunk.replace_tile(self.registry, ux, uy, tile);
                    self.chunk.mark_moved(ux, uy);
                }
            }
        }
    }

    // ===== Temperature =====

    fn diffuse_temperature(&mut self) {
        let next = diffuse_grid(self.registry, self.chunk.tiles(), CHUNK_SIZE, CHUNK_SIZE, |x, y| {
            self.read(x, y)
        });

        for (index, temperature) in next.into_iter().enumerate() {
            let (x, y) = (index % CHUNK_SIZE, index / CHUNK_SIZE);
            if self.chunk.tile(x, y).temperature != temperature {
                self.chunk.set_temperature(x, y, temperature);
                self.result.counters.record_temperature_change();
            }
        }
    }

    // ===== Unary reactions =====

    fn apply_reactions(&mut self) {
        for y in 0..CHUNK_SIZE {
            for x in 0..CHUNK_SIZE {
                let mut tile = *self.chunk.tile(x, y);
                if self.reactions.react(self.registry, &mut tile) {
                    self.chunk.replace_tile(self.registry, x, y, tile);
                    self.result.counters.record_reaction();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::MaterialId;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn setup() -> (MaterialRegistry, ReactionEngine) {
        let registry = MaterialRegistry::with_defaults();
        let reactions = ReactionEngine::with_defaults(&registry).unwrap();
        (registry, reactions)
    }

    fn tick(
        registry: &MaterialRegistry,
        reactions: &ReactionEngine,
        chunk: &mut Chunk,
        neighbors: Neighbors,
        options: TickOptions,
    ) -> ChunkTickResult {
        chunk.clear_tick_marks();
        let rng = Xoshiro256StarStar::seed_from_u64(7);
        ChunkTicker::new(registry, reactions, chunk, neighbors, rng).run(options)
    }

    const MOVEMENT_ONLY: TickOptions = TickOptions {
        temperature: false,
        reactions: false,
    };

    #[test]
    fn test_sand_falls_one_row_per_tick() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        chunk.set_tile(10, 20, registry.instance(MaterialId::SAND));

        let result = tick(&registry, &reactions, &mut chunk, [None; 9], MOVEMENT_ONLY);

        assert_eq!(chunk.material(10, 19), MaterialId::SAND);
        assert_eq!(chunk.material(10, 20), MaterialId::AIR);
        assert_eq!(result.counters.tiles_moved, 1);
    }

    #[test]
    fn test_sand_rests_on_missing_neighbor() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        chunk.set_tile(5, 0, registry.instance(MaterialId::SAND));

        let result = tick(&registry, &reactions, &mut chunk, [None; 9], MOVEMENT_ONLY);

        assert_eq!(chunk.material(5, 0), MaterialId::SAND);
        assert!(!result.counters.any_change());
    }

    #[test]
    fn test_sand_sinks_through_water() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        chunk.set_tile(3, 1, registry.instance(MaterialId::SAND));
        chunk.set_tile(3, 0, registry.instance(MaterialId::WATER));

        tick(&registry, &reactions, &mut chunk, [None; 9], MOVEMENT_ONLY);

        assert_eq!(chunk.material(3, 0), MaterialId::SAND);
        assert_eq!(chunk.material(3, 1), MaterialId::WATER);
    }

    #[test]
    fn test_water_spreads_sideways() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        for x in 0..CHUNK_SIZE {
            chunk.set_tile(x, 0, registry.instance(MaterialId::STONE));
        }
        chunk.set_tile(30, 1, registry.instance(MaterialId::WATER));

        tick(&registry, &reactions, &mut chunk, [None; 9], MOVEMENT_ONLY);

        assert_eq!(chunk.material(30, 1), MaterialId::AIR);
        let water: Vec<usize> = (0..CHUNK_SIZE)
            .filter(|&x| chunk.material(x, 1) == MaterialId::WATER)
            .collect();
        assert_eq!(water.len(), 1);
        let budget = registry.get(MaterialId::WATER).iteration_budget as usize;
        assert!(water[0].abs_diff(30) <= budget);
    }

    #[test]
    fn test_gas_rises() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        chunk.set_tile(8, 8, registry.instance(MaterialId::STEAM));

        tick(&registry, &reactions, &mut chunk, [None; 9], MOVEMENT_ONLY);

        assert_eq!(chunk.material(8, 9), MaterialId::STEAM);
    }

    #[test]
    fn test_solids_never_move() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        chunk.set_tile(8, 8, registry.instance(MaterialId::STONE));

        tick(&registry, &reactions, &mut chunk, [None; 9], MOVEMENT_ONLY);
        assert_eq!(chunk.material(8, 8), MaterialId::STONE);
    }

    #[test]
    fn test_move_into_neighbor_goes_to_boundary() {
        let (registry, reactions) = setup();
        let below = Chunk::new(0, -1);
        let mut chunk = Chunk::new(0, 0);
        let sand = registry.instance(MaterialId::SAND);
        chunk.set_tile(4, 0, sand);

        let mut neighbors: Neighbors = [None; 9];
        neighbors[neighbor_slot(0, -1)] = Some(&below);
        let result = tick(&registry, &reactions, &mut chunk, neighbors, MOVEMENT_ONLY);

        assert_eq!(chunk.material(4, 0), MaterialId::AIR);
        assert!(result.edge_changed);
        let writes = result.boundary.into_sorted();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, IVec2::new(4, -1));
        assert_eq!(writes[0].1, sand);
        // The neighbor itself is untouched until the merge
        assert_eq!(below.material(4, CHUNK_SIZE - 1), MaterialId::AIR);
    }

    #[test]
    fn test_unary_reaction_fires_once() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        for x in 0..CHUNK_SIZE {
            chunk.set_tile(x, 0, registry.instance(MaterialId::STONE));
        }
        chunk.set_tile(2, 1, MaterialInstance::new(MaterialId::WATER, 0, 200));
        chunk.set_tile(40, 1, MaterialInstance::new(MaterialId::LAVA, 0, 400));
        let options = TickOptions {
            temperature: false,
            reactions: true,
        };

        let result = tick(&registry, &reactions, &mut chunk, [None; 9], options);

        let count = |material| chunk.tiles().iter().filter(|t| t.material == material).count();
        assert_eq!(count(MaterialId::STEAM), 1);
        assert_eq!(count(MaterialId::OBSIDIAN), 1);
        assert_eq!(count(MaterialId::WATER), 0);
        assert_eq!(result.counters.reactions, 2);
        // Obsidian is solid
        assert!(chunk.is_dirty(crate::world::DirtyFlags::MESH));
    }

    #[test]
    fn test_water_douses_fire() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        for x in 0..CHUNK_SIZE {
            chunk.set_tile(x, 0, registry.instance(MaterialId::STONE));
        }
        // Rows tick bottom to top, so the water checks before the fire rises
        chunk.set_tile(10, 1, registry.instance(MaterialId::WATER));
        chunk.set_tile(10, 2, registry.instance(MaterialId::FIRE));
        let options = TickOptions {
            temperature: false,
            reactions: true,
        };

        let result = tick(&registry, &reactions, &mut chunk, [None; 9], options);

        assert!(result.counters.interactions >= 1);
        assert!(chunk.tiles().iter().all(|t| t.material != MaterialId::FIRE));
    }

    #[test]
    fn test_diffusion_heats_neighbors() {
        let (registry, reactions) = setup();
        let mut chunk = Chunk::new(0, 0);
        for x in 0..CHUNK_SIZE {
            chunk.set_tile(x, 0, MaterialInstance::new(MaterialId::STONE, 0, 0));
        }
        chunk.set_tile(20, 0, MaterialInstance::new(MaterialId::STONE, 0, 800));
        let options = TickOptions {
            temperature: true,
            reactions: false,
        };

        let result = tick(&registry, &reactions, &mut chunk, [None; 9], options);

        assert!(chunk.tile(19, 0).temperature > 0);
        assert!(chunk.tile(21, 0).temperature > 0);
        assert!(result.counters.temperature_changes >= 2);
    }
}
