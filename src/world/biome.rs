//! Biomes - per-coordinate terrain flavour used during generation

use crate::simulation::MaterialId;
use noise::{NoiseFn, Perlin};

/// Depth below which every column is underground, regardless of surface biome
const UNDERGROUND_LEVEL: i32 = -64;

#[derive(Clone, Debug, PartialEq)]
pub struct Biome {
    pub id: u16,
    pub name: String,
    /// Top few tiles of the column
    pub surface: u16,
    /// Between surface and stone
    pub subsurface: u16,
    /// Trees per surface column, 0.0..1.0
    pub tree_density: f32,
}

/// Immutable biome catalogue plus the noise that picks between them
pub struct BiomeRegistry {
    biomes: Vec<Biome>,
    selector: Perlin,
}

impl BiomeRegistry {
    pub const PLAINS: u16 = 0;
    pub const DESERT: u16 = 1;
    pub const HIGHLANDS: u16 = 2;
    pub const UNDERGROUND: u16 = 3;

    pub fn new(seed: u64) -> Self {
        let biomes = vec![
            Biome {
                id: Self::PLAINS,
                name: "plains".to_string(),
                surface: MaterialId::DIRT,
                subsurface: MaterialId::DIRT,
                tree_density: 0.06,
            },
            Biome {
                id: Self::DESERT,
                name: "desert".to_string(),
                surface: MaterialId::SAND,
                subsurface: MaterialId::SAND,
                tree_density: 0.0,
            },
            Biome {
                id: Self::HIGHLANDS,
                name: "highlands".to_string(),
                surface: MaterialId::STONE,
                subsurface: MaterialId::DIRT,
                tree_density: 0.02,
            },
            Biome {
                id: Self::UNDERGROUND,
                name: "underground".to_string(),
                surface: MaterialId::STONE,
                subsurface: MaterialId::STONE,
                tree_density: 0.0,
            },
        ];

        Self {
            biomes,
            selector: Perlin::new(seed.wrapping_add(100) as u32),
        }
    }

    pub fn get(&self, id: u16) -> Option<&Biome> {
        self.biomes.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.biomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.biomes.is_empty()
    }

    /// Biome at a world tile coordinate
    pub fn biome_at(&self, world_x: i32, world_y: i32) -> &Biome {
        if world_y < UNDERGROUND_LEVEL {
            return &self.biomes[Self::UNDERGROUND as usize];
        }

        // ~500 tile wide bands
        let value = self.selector.get([world_x as f64 * 0.002, 0.5]);
        let id = if value < -0.25 {
            Self::DESERT
        } else if value > 0.3 {
            Self::HIGHLANDS
        } else {
            Self::PLAINS
        };
        &self.biomes[id as usize]
    }
}
