//! Structures - tile templates stamped into the world by populators

use crate::simulation::{MaterialId, MaterialRegistry};
use crate::world::chunk::{world_to_chunk_coords, Chunk, Layer};
use glam::IVec2;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructureTile {
    pub material: u16,
    /// Overrides the material's base color
    pub color: Option<u32>,
}

/// Width x height template; `None` cells leave the world untouched
#[derive(Clone, Debug, PartialEq)]
pub struct Structure {
    pub width: usize,
    pub height: usize,
    tiles: Vec<Option<StructureTile>>,
}

impl Structure {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            tiles: vec![None; width * height],
        }
    }

    /// Template from an RGBA image; pixels with alpha above zero become `material`
    /// tinted with the pixel color. Image row 0 is the top of the structure.
    pub fn from_image(image: &image::RgbaImage, material: u16) -> Self {
        let (width, height) = image.dimensions();
        let mut structure = Self::new(width as usize, height as usize);
        for (px, py, pixel) in image.enumerate_pixels() {
            let [r, g, b, a] = pixel.0;
            if a == 0 {
                continue;
            }
            let color = u32::from_be_bytes([r, g, b, a]);
            structure.set_tile(
                px as usize,
                (height - 1 - py) as usize,
                StructureTile {
                    material,
                    color: Some(color),
                },
            );
        }
        structure
    }

    pub fn set(&mut self, x: usize, y: usize, material: u16) {
        self.set_tile(
            x,
            y,
            StructureTile {
                material,
                color: None,
            },
        );
    }

    pub fn set_tile(&mut self, x: usize, y: usize, tile: StructureTile) {
        if x < self.width && y < self.height {
            self.tiles[y * self.width + x] = Some(tile);
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Option<StructureTile> {
        if x < self.width && y < self.height {
            self.tiles[y * self.width + x]
        } else {
            None
        }
    }

    /// Number of non-empty cells
    pub fn filled(&self) -> usize {
        self.tiles.iter().filter(|tile| tile.is_some()).count()
    }
}

/// A structure positioned in the world
#[derive(Clone, Debug)]
pub struct PlacedStructure {
    pub template: Arc<Structure>,
    /// World tile coordinate of the template's (0, 0)
    pub origin: IVec2,
    pub layer: Layer,
    /// When false, only air tiles are replaced
    pub overwrite: bool,
}

impl PlacedStructure {
    /// Per-chunk tile writes, ordered by chunk coordinate
    pub fn splices(&self) -> Vec<Splice> {
        let mut by_chunk: BTreeMap<(i32, i32), Splice> = BTreeMap::new();

        for ty in 0..self.template.height {
            for tx in 0..self.template.width {
                let Some(tile) = self.template.get(tx, ty) else {
                    continue;
                };
                let world = self.origin + IVec2::new(tx as i32, ty as i32);
                let (chunk, lx, ly) = world_to_chunk_coords(world.x, world.y);
                by_chunk
                    .entry((chunk.x, chunk.y))
                    .or_insert_with(|| Splice {
                        chunk,
                        layer: self.layer,
                        overwrite: self.overwrite,
                        writes: Vec::new(),
                    })
                    .writes
                    .push((lx as u8, ly as u8, tile));
            }
        }

        by_chunk.into_values().collect()
    }
}

/// Tile writes destined for one chunk
#[derive(Clone, Debug, PartialEq)]
pub struct Splice {
    pub chunk: IVec2,
    pub layer: Layer,
    pub overwrite: bool,
    /// Local x, local y, tile
    pub writes: Vec<(u8, u8, StructureTile)>,
}

impl Splice {
    /// Write into `chunk`; returns how many tiles changed
    pub fn apply(&self, registry: &MaterialRegistry, chunk: &mut Chunk) -> usize {
        debug_assert_eq!(chunk.coord(), self.chunk, "splice applied to wrong chunk");

        let mut written = 0;
        for &(x, y, tile) in &self.writes {
            let (x, y) = (x as usize, y as usize);
            let current = match self.layer {
                Layer::Primary => chunk.material(x, y),
                Layer::Layer2 => chunk.layer2_tile(x, y).material,
            };
            if !self.overwrite && current != MaterialId::AIR {
                continue;
            }

            let mut instance = registry.instance(tile.material);
            if let Some(color) = tile.color {
                instance.color = color;
            }
            chunk.set_layer_tile(registry, self.layer, x, y, instance);
            written += 1;
        }
        written
    }
}
