//! Populator pipeline - phased procedural features on freshly generated chunks
//!
//! A populator sees the target chunk (live, writable) and an id-only
//! snapshot of the resident 3x3 neighborhood. It may only write the center
//! chunk; features that spill into neighbors are returned as
//! [`PlacedStructure`]s and spliced by the pipeline and the chunk store.

use crate::simulation::{MaterialId, MaterialRegistry};
use crate::world::chunk::{Chunk, CHUNK_AREA, CHUNK_SIZE};
use crate::world::generation::{BEDROCK_LEVEL, SURFACE_LEVEL};
use crate::world::rng_trait::{chunk_rng, WorldRng};
use crate::world::structure::{PlacedStructure, Splice, Structure};
use crate::world::{biome::BiomeRegistry, chunk::Layer};
use glam::IVec2;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use std::sync::Arc;

/// Material ids of the resident chunks around a target, captured at task start
///
/// Index `(ix, iy)` with `ix, iy` in `0..3`; the center `(1, 1)` is always
/// empty because the center chunk is passed live.
#[derive(Clone, Default)]
pub struct NeighborSnapshot {
    chunks: [Option<Arc<[u16]>>; 9],
}

impl NeighborSnapshot {
    /// Snapshot built from a lookup of resident chunks by coordinate
    pub fn capture<'a>(center: IVec2, lookup: impl Fn(IVec2) -> Option<&'a Chunk>) -> Self {
        let mut snapshot = Self::default();
        for iy in 0..3 {
            for ix in 0..3 {
                if ix == 1 && iy == 1 {
                    continue;
                }
                let coord = center + IVec2::new(ix as i32 - 1, iy as i32 - 1);
                snapshot.chunks[iy * 3 + ix] = lookup(coord)
                    .map(|chunk| chunk.tiles().iter().map(|tile| tile.material).collect());
            }
        }
        snapshot
    }

    pub fn get(&self, ix: usize, iy: usize) -> Option<&[u16]> {
        if ix >= 3 || iy >= 3 {
            return None;
        }
        self.chunks[iy * 3 + ix].as_deref()
    }

    /// Number of resident neighbors captured
    pub fn resident(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn set(&mut self, ix: usize, iy: usize, materials: Vec<u16>) {
        debug_assert_eq!(materials.len(), CHUNK_AREA);
        self.chunks[iy * 3 + ix] = Some(materials.into());
    }
}

/// What a populator gets to work with
pub struct Neighborhood<'a> {
    center: &'a mut Chunk,
    snapshot: &'a NeighborSnapshot,
    registry: &'a MaterialRegistry,
    seed: u64,
}

impl<'a> Neighborhood<'a> {
    pub fn new(
        center: &'a mut Chunk,
        snapshot: &'a NeighborSnapshot,
        registry: &'a MaterialRegistry,
        seed: u64,
    ) -> Self {
        Self {
            center,
            snapshot,
            registry,
            seed,
        }
    }

    pub fn coord(&self) -> IVec2 {
        self.center.coord()
    }

    /// World tile coordinate of the center chunk's (0, 0)
    pub fn origin(&self) -> IVec2 {
        self.center.origin()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn registry(&self) -> &MaterialRegistry {
        self.registry
    }

    pub fn center(&self) -> &Chunk {
        self.center
    }

    /// Material at a coordinate relative to the center chunk's origin
    ///
    /// Reaches one chunk in every direction; `None` for non-resident
    /// neighbors and anything further out.
    pub fn material_at(&self, x: i32, y: i32) -> Option<u16> {
        let size = CHUNK_SIZE as i32;
        let ix = x.div_euclid(size) + 1;
        let iy = y.div_euclid(size) + 1;
        let lx = x.rem_euclid(size) as usize;
        let ly = y.rem_euclid(size) as usize;

        if ix == 1 && iy == 1 {
            return Some(self.center.material(lx, ly));
        }
        if !(0..3).contains(&ix) || !(0..3).contains(&iy) {
            return None;
        }
        self.snapshot
            .get(ix as usize, iy as usize)
            .map(|materials| materials[ly * CHUNK_SIZE + lx])
    }

    /// Write a tile of the center chunk
    ///
    /// Coordinates outside the center are a populator bug: asserted in
    /// debug builds, ignored otherwise.
    pub fn set_material(&mut self, x: i32, y: i32, material: u16) -> bool {
        let size = CHUNK_SIZE as i32;
        let inside = (0..size).contains(&x) && (0..size).contains(&y);
        debug_assert!(
            inside,
            "populator wrote ({}, {}) outside chunk {:?}",
            x,
            y,
            self.center.coord()
        );
        if !inside {
            return false;
        }
        let tile = self.registry.instance(material);
        self.center
            .replace_tile(self.registry, x as usize, y as usize, tile);
        true
    }
}

/// A procedural feature applied to newly generated chunks
pub trait Populator: Send + Sync {
    fn name(&self) -> &str;

    /// Phases run in increasing order; lower phases see nothing of higher ones
    fn phase(&self) -> u32;

    fn apply(&self, hood: &mut Neighborhood) -> Vec<PlacedStructure>;
}

/// Ordered set of populators
pub struct PopulatorPipeline {
    populators: Vec<Box<dyn Populator>>,
}

impl PopulatorPipeline {
    pub fn new() -> Self {
        Self {
            populators: Vec::new(),
        }
    }

    /// Caves, ores, cobble rims and trees
    pub fn with_defaults(seed: u64) -> Self {
        let mut pipeline = Self::new();
        pipeline.register(Box::new(CavePopulator::new(seed)));
        pipeline.register(Box::new(OrePopulator::new(seed)));
        pipeline.register(Box::new(CobblePopulator));
        pipeline.register(Box::new(TreePopulator::new(seed)));
        pipeline
    }

    pub fn register(&mut self, populator: Box<dyn Populator>) {
        debug_assert!(populator.phase() < 32, "phase out of range");
        log::debug!(
            "[GEN] Registered populator '{}' (phase {})",
            populator.name(),
            populator.phase()
        );
        self.populators.push(populator);
    }

    /// Distinct phases in ascending order
    pub fn phases(&self) -> Vec<u32> {
        let mut phases: Vec<u32> = self.populators.iter().map(|p| p.phase()).collect();
        phases.sort_unstable();
        phases.dedup();
        phases
    }

    /// Bits of every registered phase
    pub fn full_mask(&self) -> u32 {
        self.phases().iter().fold(0, |mask, phase| mask | 1 << phase)
    }

    /// Run one phase over the center chunk; returns splices for other chunks
    ///
    /// Populators run in registration order. Structure parts landing in the
    /// center are written here; the rest is returned.
    pub fn run_phase(&self, phase: u32, hood: &mut Neighborhood) -> Vec<Splice> {
        let mut outgoing = Vec::new();
        let center = hood.coord();

        for populator in self.populators.iter().filter(|p| p.phase() == phase) {
            for structure in populator.apply(hood) {
                for splice in structure.splices() {
                    if splice.chunk == center {
                        splice.apply(hood.registry, hood.center);
                    } else {
                        outgoing.push(splice);
                    }
                }
            }
        }

        hood.center.mark_phase_populated(phase);
        outgoing
    }

    /// Run every phase the chunk has not seen yet, in ascending order
    ///
    /// `on_phase` is called after each phase completes.
    pub fn populate(
        &self,
        registry: &MaterialRegistry,
        seed: u64,
        chunk: &mut Chunk,
        snapshot: &NeighborSnapshot,
        mut on_phase: impl FnMut(u32),
    ) -> Vec<Splice> {
        let mut outgoing = Vec::new();
        for phase in self.phases() {
            if chunk.is_phase_populated(phase) {
                continue;
            }
            let mut hood = Neighborhood::new(chunk, snapshot, registry, seed);
            outgoing.extend(self.run_phase(phase, &mut hood));
            on_phase(phase);
        }
        outgoing
    }
}

impl Default for PopulatorPipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Built-in populators =====

/// Carves noise caves out of stone
pub struct CavePopulator {
    noise: Fbm<Perlin>,
}

impl CavePopulator {
    /// Higher threshold = fewer caves
    const THRESHOLD: f64 = 0.2;

    pub fn new(seed: u64) -> Self {
        // Multi-octave noise for natural-looking caves, ~50 tile wavelength
        let noise = Fbm::<Perlin>::new(seed.wrapping_add(11) as u32)
            .set_octaves(4)
            .set_frequency(0.02)
            .set_lacunarity(2.0)
            .set_persistence(0.5);
        Self { noise }
    }
}

impl Populator for CavePopulator {
    fn name(&self) -> &str {
        "caves"
    }

    fn phase(&self) -> u32 {
        0
    }

    fn apply(&self, hood: &mut Neighborhood) -> Vec<PlacedStructure> {
        let origin = hood.origin();
        for y in 0..CHUNK_SIZE as i32 {
            let world_y = origin.y + y;
            if world_y <= BEDROCK_LEVEL + 2 {
                continue;
            }
            for x in 0..CHUNK_SIZE as i32 {
                if hood.material_at(x, y) != Some(MaterialId::STONE) {
                    continue;
                }
                let value = self.noise.get([(origin.x + x) as f64, world_y as f64]);
                if value > Self::THRESHOLD {
                    hood.set_material(x, y, MaterialId::AIR);
                }
            }
        }
        Vec::new()
    }
}

struct OreBand {
    material: u16,
    depth: std::ops::RangeInclusive<i32>,
    threshold: f64,
    noise: Perlin,
}

/// Depth-stratified ore veins inside stone
pub struct OrePopulator {
    bands: Vec<OreBand>,
}

impl OrePopulator {
    /// ~12 tile vein wavelength
    const NOISE_SCALE: f64 = 0.08;

    pub fn new(seed: u64) -> Self {
        let band = |offset: u64, material, depth, threshold| OreBand {
            material,
            depth,
            threshold,
            noise: Perlin::new(seed.wrapping_add(offset) as u32),
        };
        Self {
            bands: vec![
                band(1, MaterialId::COAL_ORE, 8..=40, 0.75),
                band(2, MaterialId::IRON_ORE, 30..=80, 0.76),
                band(4, MaterialId::GOLD_ORE, 60..=120, 0.80),
            ],
        }
    }
}

impl Populator for OrePopulator {
    fn name(&self) -> &str {
        "ores"
    }

    fn phase(&self) -> u32 {
        0
    }

    fn apply(&self, hood: &mut Neighborhood) -> Vec<PlacedStructure> {
        let origin = hood.origin();
        for y in 0..CHUNK_SIZE as i32 {
            let world_y = origin.y + y;
            let depth = SURFACE_LEVEL - world_y;
            for x in 0..CHUNK_SIZE as i32 {
                if hood.material_at(x, y) != Some(MaterialId::STONE) {
                    continue;
                }
                let sample = [
                    (origin.x + x) as f64 * Self::NOISE_SCALE,
                    world_y as f64 * Self::NOISE_SCALE,
                ];
                if let Some(band) = self
                    .bands
                    .iter()
                    .find(|band| band.depth.contains(&depth) && band.noise.get(sample) > band.threshold)
                {
                    hood.set_material(x, y, band.material);
                }
            }
        }
        Vec::new()
    }
}

/// Rims stone and dirt exposed to air with their cobbled variants
pub struct CobblePopulator;

impl Populator for CobblePopulator {
    fn name(&self) -> &str {
        "cobble"
    }

    fn phase(&self) -> u32 {
        1
    }

    fn apply(&self, hood: &mut Neighborhood) -> Vec<PlacedStructure> {
        for y in 0..CHUNK_SIZE as i32 {
            for x in 0..CHUNK_SIZE as i32 {
                let cobble = match hood.material_at(x, y) {
                    Some(MaterialId::STONE) => MaterialId::COBBLE_STONE,
                    Some(MaterialId::DIRT) => MaterialId::COBBLE_DIRT,
                    _ => continue,
                };
                // Surface dirt stays dirt so trees can root in it
                if cobble == MaterialId::COBBLE_DIRT && hood.material_at(x, y + 1) == Some(MaterialId::AIR) {
                    continue;
                }
                let exposed = [(0, 1), (0, -1), (1, 0), (-1, 0)]
                    .iter()
                    .any(|(dx, dy)| hood.material_at(x + dx, y + dy) == Some(MaterialId::AIR));
                if exposed {
                    hood.set_material(x, y, cobble);
                }
            }
        }
        Vec::new()
    }
}

/// Trees on dirt surfaces; canopies may overhang neighbor chunks
pub struct TreePopulator {
    biomes: BiomeRegistry,
}

impl TreePopulator {
    pub fn new(seed: u64) -> Self {
        Self {
            biomes: BiomeRegistry::new(seed),
        }
    }

    fn tree(trunk: usize, canopy: usize) -> Structure {
        let width = canopy * 2 + 1;
        let mut tree = Structure::new(width, trunk + canopy + 1);
        for y in 0..trunk {
            tree.set(canopy, y, MaterialId::WOOD);
        }

        let center_y = (trunk + canopy / 2) as i32;
        let radius = canopy as i32;
        for y in trunk..tree.height {
            for x in 0..width {
                let dx = x as i32 - canopy as i32;
                let dy = y as i32 - center_y;
                if dx * dx + dy * dy <= radius * radius {
                    tree.set(x, y, MaterialId::LEAVES);
                }
            }
        }
        tree
    }
}

impl Populator for TreePopulator {
    fn name(&self) -> &str {
        "trees"
    }

    fn phase(&self) -> u32 {
        1
    }

    fn apply(&self, hood: &mut Neighborhood) -> Vec<PlacedStructure> {
        let coord = hood.coord();
        let origin = hood.origin();
        let mut rng = chunk_rng(hood.seed(), coord.x, coord.y, 0x7233);
        let mut structures = Vec::new();

        let mut x = 0;
        while x < CHUNK_SIZE as i32 {
            // Ground tile with open air above it, top row excluded
            let ground = (0..CHUNK_SIZE as i32 - 1).rev().find(|&y| {
                hood.material_at(x, y) == Some(MaterialId::DIRT)
                    && hood.material_at(x, y + 1) == Some(MaterialId::AIR)
            });

            let density = self.biomes.biome_at(origin.x + x, origin.y).tree_density;
            match ground {
                Some(y) if rng.chance(density) => {
                    let trunk = 5 + rng.below(5) as usize;
                    let canopy = 2 + rng.below(2) as usize;
                    let template = Self::tree(trunk, canopy);
                    hood.set_material(x, y, MaterialId::DIRT);
                    structures.push(PlacedStructure {
                        template: Arc::new(template),
                        origin: origin + IVec2::new(x - canopy as i32, y + 1),
                        layer: Layer::Primary,
                        overwrite: false,
                    });
                    // Keep canopies apart
                    x += 8;
                }
                _ => x += 1,
            }
        }

        structures
    }
}
