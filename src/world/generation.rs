use crate::simulation::{MaterialId, MaterialRegistry};
use crate::world::biome::BiomeRegistry;
use crate::world::chunk::{Chunk, DirtyFlags, CHUNK_SIZE};
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};

/// Base ground level in world tiles
pub const SURFACE_LEVEL: i32 = 32;
/// Indestructible floor
pub const BEDROCK_LEVEL: i32 = -96;

/// Lays down base terrain; caves, ores and trees come from populators
pub struct WorldGenerator {
    pub seed: u64,
    height_noise: Fbm<Perlin>,
    biomes: BiomeRegistry,
}

impl WorldGenerator {
    pub fn new(seed: u64) -> Self {
        // Rolling hills, ~150 tile wavelength
        let height_noise = Fbm::<Perlin>::new(seed as u32)
            .set_octaves(3)
            .set_frequency(0.007)
            .set_lacunarity(2.0)
            .set_persistence(0.5);

        Self {
            seed,
            height_noise,
            biomes: BiomeRegistry::new(seed),
        }
    }

    pub fn biomes(&self) -> &BiomeRegistry {
        &self.biomes
    }

    /// Topmost ground tile of a world column
    pub fn surface_height(&self, world_x: i32) -> i32 {
        let value = self.height_noise.get([world_x as f64, 0.0]);
        SURFACE_LEVEL + (value * 12.0) as i32
    }

    /// Generate a complete chunk at the given chunk coordinates
    pub fn generate_chunk(&self, registry: &MaterialRegistry, chunk_x: i32, chunk_y: i32) -> Chunk {
        let mut chunk = Chunk::new(chunk_x, chunk_y);
        self.generate_into(registry, &mut chunk);
        chunk
    }

    /// Fill both layers of `chunk` with base terrain
    pub fn generate_into(&self, registry: &MaterialRegistry, chunk: &mut Chunk) {
        let origin = chunk.origin();

        for local_x in 0..CHUNK_SIZE {
            let world_x = origin.x + local_x as i32;
            let surface = self.surface_height(world_x);

            for local_y in 0..CHUNK_SIZE {
                let world_y = origin.y + local_y as i32;
                let material = self.material_at(world_x, world_y, surface);
                chunk.tiles_mut()[local_y * CHUNK_SIZE + local_x] = registry.instance(material);

                // Backdrop behind everything underground
                if world_y <= surface {
                    let backdrop = if world_y > surface - 8 {
                        MaterialId::DIRT
                    } else {
                        MaterialId::STONE
                    };
                    chunk.set_layer2_tile(local_x, local_y, registry.instance(backdrop));
                }
            }
        }

        chunk.mark_dirty(DirtyFlags::RENDER | DirtyFlags::MESH | DirtyFlags::PERSIST);
    }

    /// Base material at a world coordinate for a column with the given surface
    fn material_at(&self, world_x: i32, world_y: i32, surface: i32) -> u16 {
        if world_y <= BEDROCK_LEVEL {
            return MaterialId::BEDROCK;
        }
        if world_y > surface {
            return MaterialId::AIR;
        }

        let biome = self.biomes.biome_at(world_x, world_y);
        let depth = surface - world_y;
        if depth < 3 {
            biome.surface
        } else if depth < 8 {
            biome.subsurface
        } else {
            MaterialId::STONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_generation() {
        let registry = MaterialRegistry::with_defaults();
        let gen1 = WorldGenerator::new(42);
        let gen2 = WorldGenerator::new(42);

        let chunk1 = gen1.generate_chunk(&registry, 0, 0);
        let chunk2 = gen2.generate_chunk(&registry, 0, 0);

        // Same seed should produce identical chunks
        assert_eq!(chunk1.checksum(), chunk2.checksum());
    }

    #[test]
    fn test_bedrock_layer() {
        let registry = MaterialRegistry::with_defaults();
        let gen = WorldGenerator::new(42);

        // chunk y=-2 covers y=-128 to y=-65
        let chunk = gen.generate_chunk(&registry, 0, -2);

        for x in 0..CHUNK_SIZE {
            assert_eq!(
                chunk.material(x, 0),
                MaterialId::BEDROCK,
                "Expected bedrock at bottom of chunk"
            );
        }
    }

    #[test]
    fn test_surface_layer() {
        let registry = MaterialRegistry::with_defaults();
        let gen = WorldGenerator::new(42);

        // chunk y=1 covers y=64 to y=127, above any hill
        let chunk = gen.generate_chunk(&registry, 0, 1);
        assert_eq!(chunk.count_non_air(), 0);

        // chunk y=-1 is fully underground
        let chunk = gen.generate_chunk(&registry, 0, -1);
        assert_eq!(chunk.count_non_air(), CHUNK_SIZE * CHUNK_SIZE);
    }

    #[test]
    fn test_surface_height_is_bounded() {
        let gen = WorldGenerator::new(9);
        for x in (-5000..5000).step_by(37) {
            let h = gen.surface_height(x);
            assert!((SURFACE_LEVEL - 14..=SURFACE_LEVEL + 14).contains(&h));
        }
    }
}
