//! Chunk - 64x64 region of tiles

use crate::physics::{BodyHandle, Polygon};
use crate::simulation::{MaterialId, MaterialInstance, MaterialRegistry, PhysicsClass};
use bitflags::bitflags;
use glam::IVec2;

pub const CHUNK_SIZE: usize = 64;
pub const CHUNK_AREA: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Generation progress; only ever moves forward
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GenerationState {
    NotGenerated,
    Generating,
    Generated,
}

bitflags! {
    /// Stale caches, each cleared by the consumer that refreshed it
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DirtyFlags: u8 {
        /// Pixel buffer needs re-upload
        const RENDER = 1 << 0;
        /// Background layer changed
        const LAYER2 = 1 << 1;
        /// Solid outline changed, mesh and hitbox need rebuilding
        const MESH = 1 << 2;
        /// Modified since last save
        const PERSIST = 1 << 3;
    }
}

/// Which tile grid a write targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layer {
    Primary,
    Layer2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyRect {
    pub min_x: usize,
    pub min_y: usize,
    pub max_x: usize,
    pub max_y: usize,
}

impl DirtyRect {
    pub fn new(x: usize, y: usize) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    pub fn full() -> Self {
        Self {
            min_x: 0,
            min_y: 0,
            max_x: CHUNK_SIZE - 1,
            max_y: CHUNK_SIZE - 1,
        }
    }

    pub fn expand(&mut self, x: usize, y: usize) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }
}

/// Row-major index, y = 0 is the bottom row
#[inline]
pub fn tile_index(x: usize, y: usize) -> usize {
    debug_assert!(x < CHUNK_SIZE && y < CHUNK_SIZE);
    y * CHUNK_SIZE + x
}

/// Chunk holding world coordinate `(world_x, world_y)` and the local offset inside it
#[inline]
pub fn world_to_chunk_coords(world_x: i32, world_y: i32) -> (IVec2, usize, usize) {
    let size = CHUNK_SIZE as i32;
    let chunk = IVec2::new(world_x.div_euclid(size), world_y.div_euclid(size));
    (
        chunk,
        world_x.rem_euclid(size) as usize,
        world_y.rem_euclid(size) as usize,
    )
}

/// A 64x64 region of the world
pub struct Chunk {
    /// Chunk coordinates (in chunk space, not tile space)
    pub x: i32,
    pub y: i32,

    /// Primary tiles, index = y * CHUNK_SIZE + x
    tiles: Vec<MaterialInstance>,
    /// Background/decoration tiles
    layer2: Vec<MaterialInstance>,

    generation: GenerationState,
    /// Bit n set once populator phase n has run
    populated: u32,

    dirty: DirtyFlags,
    /// Bounding rect of tiles changed since the last render pull
    dirty_rect: Option<DirtyRect>,

    /// Cached outline of solid tiles
    mesh: Vec<Polygon>,
    /// Static body mirroring the outline, if a bridge is attached
    pub rigid_body: Option<BodyHandle>,

    /// Tasks (hitbox rebuilds, ...) still referencing this chunk
    tasks_in_flight: u32,

    /// "Already moved this tick" marks
    moved: Vec<bool>,
}

impl Chunk {
    /// Empty (all air) chunk awaiting generation
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            tiles: (0..CHUNK_AREA).map(|_| MaterialInstance::air()).collect(),
            layer2: (0..CHUNK_AREA).map(|_| MaterialInstance::air()).collect(),
            generation: GenerationState::NotGenerated,
            populated: 0,
            dirty: DirtyFlags::empty(),
            dirty_rect: None,
            mesh: Vec::new(),
            rigid_body: None,
            tasks_in_flight: 0,
            moved: vec![false; CHUNK_AREA],
        }
    }

    /// Chunk assembled from decoded grids
    pub(crate) fn from_parts(
        x: i32,
        y: i32,
        tiles: Vec<MaterialInstance>,
        layer2: Vec<MaterialInstance>,
        populated: u32,
    ) -> Self {
        debug_assert_eq!(tiles.len(), CHUNK_AREA);
        debug_assert_eq!(layer2.len(), CHUNK_AREA);
        let mut chunk = Self::new(x, y);
        chunk.tiles = tiles;
        chunk.layer2 = layer2;
        chunk.populated = populated;
        chunk
    }

    #[inline]
    pub fn coord(&self) -> IVec2 {
        IVec2::new(self.x, self.y)
    }

    /// World tile coordinate of local (0, 0)
    #[inline]
    pub fn origin(&self) -> IVec2 {
        self.coord() * CHUNK_SIZE as i32
    }

    /// Name of this chunk's pack file inside the world's chunk directory
    pub fn pack_filename(&self) -> String {
        pack_filename(self.x, self.y)
    }

    // ===== Tiles =====

    /// Get tile at local coordinates (0-63, 0-63)
    #[inline]
    pub fn tile(&self, x: usize, y: usize) -> &MaterialInstance {
        &self.tiles[tile_index(x, y)]
    }

    #[inline]
    pub fn material(&self, x: usize, y: usize) -> u16 {
        self.tile(x, y).material
    }

    /// Set tile at local coordinates
    ///
    /// Marks render and persist dirty. Callers that may change the solid
    /// outline use [`Chunk::replace_tile`] instead.
    #[inline]
    pub fn set_tile(&mut self, x: usize, y: usize, tile: MaterialInstance) {
        self.tiles[tile_index(x, y)] = tile;
        self.mark_tile_dirty(x, y);
    }

    /// Set tile and mark the mesh dirty if solidity changed
    pub fn replace_tile(
        &mut self,
        registry: &MaterialRegistry,
        x: usize,
        y: usize,
        tile: MaterialInstance,
    ) {
        let was_solid = registry.physics_class(self.material(x, y)) == PhysicsClass::Solid;
        let is_solid = registry.physics_class(tile.material) == PhysicsClass::Solid;
        self.set_tile(x, y, tile);
        if was_solid != is_solid {
            self.dirty |= DirtyFlags::MESH;
        }
    }

    /// Temperature-only update; the color is unchanged, so no render
    pub fn set_temperature(&mut self, x: usize, y: usize, temperature: i32) {
        self.tiles[tile_index(x, y)].temperature = temperature;
        self.dirty |= DirtyFlags::PERSIST;
    }

    #[inline]
    pub fn layer2_tile(&self, x: usize, y: usize) -> &MaterialInstance {
        &self.layer2[tile_index(x, y)]
    }

    pub fn set_layer2_tile(&mut self, x: usize, y: usize, tile: MaterialInstance) {
        self.layer2[tile_index(x, y)] = tile;
        self.dirty |= DirtyFlags::LAYER2 | DirtyFlags::PERSIST;
    }

    /// Write to either layer
    pub fn set_layer_tile(
        &mut self,
        registry: &MaterialRegistry,
        layer: Layer,
        x: usize,
        y: usize,
        tile: MaterialInstance,
    ) {
        match layer {
            Layer::Primary => self.replace_tile(registry, x, y, tile),
            Layer::Layer2 => self.set_layer2_tile(x, y, tile),
        }
    }

    /// Get raw tile slice for rendering and encoding
    pub fn tiles(&self) -> &[MaterialInstance] {
        &self.tiles
    }

    pub fn layer2(&self) -> &[MaterialInstance] {
        &self.layer2
    }

    /// Bulk access for generation; the caller marks dirty flags afterwards
    pub(crate) fn tiles_mut(&mut self) -> &mut [MaterialInstance] {
        &mut self.tiles
    }

    /// RGBA colors of the primary layer, row-major
    pub fn pixel_colors(&self) -> Vec<u32> {
        self.tiles.iter().map(|tile| tile.color).collect()
    }

    /// Count non-air tiles (for debugging save/load)
    pub fn count_non_air(&self) -> usize {
        self.tiles
            .iter()
            .filter(|tile| tile.material != MaterialId::AIR)
            .count()
    }

    /// Number of primary tiles per physics class, indexed by `PhysicsClass::index`
    pub fn class_counts(&self, registry: &MaterialRegistry) -> [usize; 7] {
        let mut counts = [0; 7];
        for tile in &self.tiles {
            counts[registry.physics_class(tile.material).index()] += 1;
        }
        counts
    }

    /// FNV-1a over the persisted contents of both layers
    pub fn checksum(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for tile in self.tiles.iter().chain(self.layer2.iter()) {
            for byte in tile
                .material
                .to_le_bytes()
                .into_iter()
                .chain(tile.color.to_le_bytes())
                .chain(tile.temperature.to_le_bytes())
            {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    // ===== Generation =====

    pub fn generation_state(&self) -> GenerationState {
        self.generation
    }

    /// Move generation forward; refuses (returns false) to stay or go back
    pub fn advance_generation(&mut self, next: GenerationState) -> bool {
        if next <= self.generation {
            log::debug!(
                "[GEN] Chunk ({}, {}) refused generation change {:?} -> {:?}",
                self.x,
                self.y,
                self.generation,
                next
            );
            return false;
        }
        self.generation = next;
        true
    }

    pub fn populated_mask(&self) -> u32 {
        self.populated
    }

    pub fn is_phase_populated(&self, phase: u32) -> bool {
        phase < 32 && self.populated & (1 << phase) != 0
    }

    /// Set the bit for `phase`; false if it was already set
    pub fn mark_phase_populated(&mut self, phase: u32) -> bool {
        debug_assert!(phase < 32, "populator phase {} out of range", phase);
        if phase >= 32 || self.is_phase_populated(phase) {
            return false;
        }
        self.populated |= 1 << phase;
        true
    }

    // ===== Dirty tracking =====

    fn mark_tile_dirty(&mut self, x: usize, y: usize) {
        self.dirty |= DirtyFlags::RENDER | DirtyFlags::PERSIST;
        match &mut self.dirty_rect {
            Some(rect) => rect.expand(x, y),
            None => self.dirty_rect = Some(DirtyRect::new(x, y)),
        }
    }

    /// Mark everything stale (freshly generated or loaded chunk)
    pub fn mark_all_dirty(&mut self) {
        self.dirty |= DirtyFlags::RENDER | DirtyFlags::LAYER2 | DirtyFlags::MESH;
        self.dirty_rect = Some(DirtyRect::full());
    }

    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
        if flags.contains(DirtyFlags::RENDER) && self.dirty_rect.is_none() {
            self.dirty_rect = Some(DirtyRect::full());
        }
    }

    pub fn dirty_flags(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn is_dirty(&self, flags: DirtyFlags) -> bool {
        self.dirty.intersects(flags)
    }

    /// Clear flags after the consumer refreshed its cache
    pub fn clear_dirty(&mut self, flags: DirtyFlags) {
        self.dirty.remove(flags);
    }

    /// Take the render rect and clear render-dirty
    pub fn take_render_update(&mut self) -> Option<DirtyRect> {
        if !self.dirty.contains(DirtyFlags::RENDER) {
            return None;
        }
        self.dirty.remove(DirtyFlags::RENDER);
        self.dirty_rect.take().or(Some(DirtyRect::full()))
    }

    // ===== Mesh =====

    /// Cached outline polygons (chunk-local tile units)
    pub fn mesh(&self) -> &[Polygon] {
        &self.mesh
    }

    /// Store a rebuilt outline and clear mesh-dirty
    pub fn set_mesh(&mut self, mesh: Vec<Polygon>) {
        self.mesh = mesh;
        self.dirty.remove(DirtyFlags::MESH);
    }

    // ===== Task accounting =====

    pub fn begin_task(&mut self) {
        self.tasks_in_flight += 1;
    }

    pub fn end_task(&mut self) {
        debug_assert!(self.tasks_in_flight > 0, "task count underflow");
        self.tasks_in_flight = self.tasks_in_flight.saturating_sub(1);
    }

    pub fn has_pending_tasks(&self) -> bool {
        self.tasks_in_flight > 0
    }

    // ===== Per-tick marks =====

    /// Clear all "moved this tick" marks
    pub fn clear_tick_marks(&mut self) {
        self.moved.fill(false);
    }

    #[inline]
    pub fn is_moved(&self, x: usize, y: usize) -> bool {
        self.moved[tile_index(x, y)]
    }

    #[inline]
    pub fn mark_moved(&mut self, x: usize, y: usize) {
        self.moved[tile_index(x, y)] = true;
    }
}

/// Pack file name for a chunk coordinate
pub fn pack_filename(x: i32, y: i32) -> String {
    format!("c_{}_{}.pack", x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_access() {
        let registry = MaterialRegistry::with_defaults();
        let mut chunk = Chunk::new(0, 0);

        chunk.set_tile(10, 20, registry.instance(MaterialId::SAND));
        assert_eq!(chunk.material(10, 20), MaterialId::SAND);

        chunk.set_tile(0, 0, registry.instance(MaterialId::STONE));
        chunk.set_tile(63, 63, registry.instance(MaterialId::WATER));
        assert_eq!(chunk.material(0, 0), MaterialId::STONE);
        assert_eq!(chunk.material(63, 63), MaterialId::WATER);
    }

    #[test]
    fn test_new_chunk_is_all_air() {
        let chunk = Chunk::new(3, -1);
        assert_eq!(chunk.count_non_air(), 0);
        assert_eq!(chunk.generation_state(), GenerationState::NotGenerated);
        assert_eq!(chunk.populated_mask(), 0);
        assert!(chunk.dirty_flags().is_empty());
    }

    #[test]
    fn test_dirty_rect() {
        let registry = MaterialRegistry::with_defaults();
        let mut chunk = Chunk::new(0, 0);

        chunk.set_tile(10, 10, registry.instance(MaterialId::SAND));
        chunk.set_tile(50, 50, registry.instance(MaterialId::SAND));

        let rect = chunk.take_render_update().unwrap();
        assert_eq!(rect, DirtyRect {
            min_x: 10,
            min_y: 10,
            max_x: 50,
            max_y: 50
        });
        assert!(!chunk.is_dirty(DirtyFlags::RENDER));
        assert!(chunk.take_render_update().is_none());
        // Persist flag survives the render pull
        assert!(chunk.is_dirty(DirtyFlags::PERSIST));
    }

    #[test]
    fn test_replace_tile_marks_mesh_only_on_solidity_change() {
        let registry = MaterialRegistry::with_defaults();
        let mut chunk = Chunk::new(0, 0);

        chunk.replace_tile(&registry, 1, 1, registry.instance(MaterialId::SAND));
        assert!(!chunk.is_dirty(DirtyFlags::MESH));

        chunk.replace_tile(&registry, 1, 1, registry.instance(MaterialId::STONE));
        assert!(chunk.is_dirty(DirtyFlags::MESH));

        chunk.set_mesh(Vec::new());
        assert!(!chunk.is_dirty(DirtyFlags::MESH));
    }

    #[test]
    fn test_generation_only_moves_forward() {
        let mut chunk = Chunk::new(0, 0);

        assert!(chunk.advance_generation(GenerationState::Generating));
        assert!(chunk.advance_generation(GenerationState::Generated));
        assert!(!chunk.advance_generation(GenerationState::Generating));
        assert!(!chunk.advance_generation(GenerationState::Generated));
        assert_eq!(chunk.generation_state(), GenerationState::Generated);
    }

    #[test]
    fn test_phase_bits_set_once() {
        let mut chunk = Chunk::new(0, 0);

        assert!(chunk.mark_phase_populated(0));
        assert!(chunk.mark_phase_populated(1));
        assert!(!chunk.mark_phase_populated(1));
        assert_eq!(chunk.populated_mask(), 0b11);
    }

    #[test]
    fn test_world_to_chunk_coords_negative() {
        let (chunk, lx, ly) = world_to_chunk_coords(-1, -65);
        assert_eq!(chunk, IVec2::new(-1, -2));
        assert_eq!(lx, 63);
        assert_eq!(ly, 63);

        let (chunk, lx, ly) = world_to_chunk_coords(64, 0);
        assert_eq!(chunk, IVec2::new(1, 0));
        assert_eq!((lx, ly), (0, 0));
    }

    #[test]
    fn test_checksum_tracks_contents_not_identity() {
        let registry = MaterialRegistry::with_defaults();
        let mut a = Chunk::new(0, 0);
        let mut b = Chunk::new(0, 0);
        assert_eq!(a.checksum(), b.checksum());

        a.set_tile(5, 5, registry.instance(MaterialId::SAND));
        assert_ne!(a.checksum(), b.checksum());

        b.set_tile(5, 5, registry.instance(MaterialId::SAND));
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_task_accounting() {
        let mut chunk = Chunk::new(0, 0);
        assert!(!chunk.has_pending_tasks());

        chunk.begin_task();
        chunk.begin_task();
        chunk.end_task();
        assert!(chunk.has_pending_tasks());

        chunk.end_task();
        assert!(!chunk.has_pending_tasks());
    }

    #[test]
    fn test_pack_filename() {
        assert_eq!(Chunk::new(-2, 7).pack_filename(), "c_-2_7.pack");
    }
}
