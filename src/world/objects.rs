//! Pixel objects - rigid bodies made of tiles
//!
//! An object's pixels live outside the grid. Each step they are stamped into
//! the cells under the body's current transform, the automaton ticks around
//! them, and they are picked back up. A pixel whose tile was replaced while
//! stamped is gone, and the body's hitbox is rebuilt from what is left.
//!
//! Floating solid islands are cut out of the terrain into objects, and
//! explosions fling loose tiles as particles.

use crate::error::BridgeError;
use crate::physics::{BodyDesc, BodyHandle, BodyKind, CollisionMask, RigidBodyBridge};
use crate::simulation::{MaterialId, MaterialInstance, MaterialRegistry, Particle, PhysicsClass};
use crate::world::chunk::world_to_chunk_coords;
use crate::world::chunk_store::ChunkStore;
use glam::{IVec2, Vec2};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Fills larger than this are treated as anchored terrain
pub const MAX_ISLAND: usize = 1000;

/// Islands up to this size crumble into particles instead of becoming objects
pub const CRUMBLE_SIZE: usize = 10;

/// Upward speed of a tile pushed aside by a stamped pixel
const DISPLACE_SPEED: f32 = 1.5;

const SIDES: [IVec2; 4] = [IVec2::new(1, 0), IVec2::new(0, 1), IVec2::new(-1, 0), IVec2::new(0, -1)];

/// Tiles cut out of the grid, plus their bounding box
#[derive(Clone, Debug)]
pub struct PixelGrid {
    /// World cell of pixel (0, 0)
    pub origin: IVec2,
    pub width: usize,
    pub height: usize,
    /// Row-major, row 0 at the bottom
    pub pixels: Vec<Option<MaterialInstance>>,
}

impl PixelGrid {
    pub fn new(origin: IVec2, width: usize, height: usize) -> Self {
        Self {
            origin,
            width,
            height,
            pixels: vec![None; width * height],
        }
    }

    /// Grid covering exactly `cells`, with their tiles taken from `tile_at`
    pub fn from_cells(cells: &[IVec2], mut tile_at: impl FnMut(IVec2) -> Option<MaterialInstance>) -> Option<Self> {
        let min = cells.iter().copied().reduce(IVec2::min)?;
        let max = cells.iter().copied().reduce(IVec2::max)?;
        let size = (max - min + IVec2::ONE).as_uvec2();
        let mut grid = Self::new(min, size.x as usize, size.y as usize);
        for &cell in cells {
            let local = cell - min;
            grid.set(local.x as usize, local.y as usize, tile_at(cell));
        }
        Some(grid)
    }

    pub fn get(&self, x: usize, y: usize) -> Option<&MaterialInstance> {
        self.pixels.get(y * self.width + x)?.as_ref()
    }

    pub fn set(&mut self, x: usize, y: usize, tile: Option<MaterialInstance>) {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x] = tile;
        }
    }

    pub fn count(&self) -> usize {
        self.pixels.iter().filter(|pixel| pixel.is_some()).count()
    }

    pub fn mask(&self) -> CollisionMask {
        let mut mask = CollisionMask::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                mask.set(x, y, self.get(x, y).is_some());
            }
        }
        mask
    }
}

struct PixelObject {
    grid: PixelGrid,
    /// Cell each pixel was stamped into this step, parallel to `grid.pixels`
    stamped: Vec<Option<IVec2>>,
}

/// What a stamp pass did to the grid
#[derive(Clone, Debug, Default)]
pub struct StampReport {
    pub stamped: usize,
    /// Pixels with no free cell under them this step
    pub skipped: usize,
    /// Movable tiles pushed out of the way, to be spawned as particles
    pub displaced: Vec<Particle>,
    pub touched: Vec<IVec2>,
}

/// Every live pixel object, keyed by its body
#[derive(Default)]
pub struct ObjectSet {
    objects: BTreeMap<BodyHandle, PixelObject>,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn handles(&self) -> Vec<BodyHandle> {
        self.objects.keys().copied().collect()
    }

    /// Pixels an object still has
    pub fn pixel_count(&self, handle: BodyHandle) -> Option<usize> {
        self.objects.get(&handle).map(|object| object.grid.count())
    }

    /// Create a dynamic body for `grid`, its pixel (0, 0) at `grid.origin`
    pub fn spawn(&mut self, bridge: &mut RigidBodyBridge, mut grid: PixelGrid) -> Result<BodyHandle, BridgeError> {
        for pixel in grid.pixels.iter_mut().flatten() {
            *pixel = MaterialInstance::new(MaterialId::OBJECT, pixel.color, pixel.temperature);
        }
        let desc = BodyDesc::with_mask(BodyKind::Dynamic, grid.origin.as_vec2(), grid.mask());
        let handle = bridge.create_body(desc)?;
        log::debug!(
            "[OBJECT] Spawned {:?} with {} pixels at {:?}",
            handle,
            grid.count(),
            grid.origin
        );
        let stamped = vec![None; grid.pixels.len()];
        self.objects.insert(handle, PixelObject { grid, stamped });
        Ok(handle)
    }

    /// Write every object's pixels into the grid under its body
    pub fn stamp(&mut self, bridge: &RigidBodyBridge, store: &mut ChunkStore, registry: &MaterialRegistry) -> StampReport {
        let mut report = StampReport::default();
        for (handle, object) in self.objects.iter_mut() {
            let (position, angle) = match bridge.body_transform(*handle) {
                Ok(transform) => transform,
                Err(e) => {
                    log::warn!("[OBJECT] No transform for {:?}: {}", handle, e);
                    continue;
                }
            };
            let rotation = Vec2::from_angle(angle);
            let width = object.grid.width;

            for (index, pixel) in object.grid.pixels.iter().enumerate() {
                object.stamped[index] = None;
                let Some(tile) = pixel else {
                    continue;
                };
                let local = Vec2::new((index % width) as f32 + 0.5, (index / width) as f32 + 0.5);
                let cell = (position + rotation.rotate(local)).floor().as_ivec2();

                let Some(target) = free_cell(store, registry, cell) else {
                    report.skipped += 1;
                    continue;
                };
                let (coord, x, y) = world_to_chunk_coords(target.x, target.y);
                let Some(chunk) = store.get_chunk_mut(coord.x, coord.y) else {
                    report.skipped += 1;
                    continue;
                };
                let previous = *chunk.tile(x, y);
                if previous.material != MaterialId::AIR {
                    let velocity = Vec2::new(0.0, DISPLACE_SPEED);
                    report
                        .displaced
                        .push(Particle::new(previous, target.as_vec2() + Vec2::new(0.5, 1.5), velocity));
                }
                chunk.set_tile(x, y, *tile);
                chunk.mark_moved(x, y);
                object.stamped[index] = Some(target);
                report.stamped += 1;
                report.touched.push(coord);
            }
        }
        report.touched.sort_unstable_by_key(|c| (c.y, c.x));
        report.touched.dedup();
        report
    }

    /// Take stamped pixels back out of the grid
    ///
    /// Pixels whose tile is no longer in its cell are dropped from the
    /// object; an object left with no pixels loses its body.
    pub fn pick_up(&mut self, bridge: &mut RigidBodyBridge, store: &mut ChunkStore) -> usize {
        let mut lost = 0;
        let mut emptied = Vec::new();
        for (handle, object) in self.objects.iter_mut() {
            let mut changed = false;
            for (index, stamped) in object.stamped.iter_mut().enumerate() {
                let Some(cell) = stamped.take() else {
                    continue;
                };
                let Some(pixel) = object.grid.pixels[index].as_mut() else {
                    continue;
                };
                let (coord, x, y) = world_to_chunk_coords(cell.x, cell.y);
                let current = store.get_chunk(coord.x, coord.y).map(|chunk| *chunk.tile(x, y));
                match current {
                    Some(tile) if tile == *pixel && tile.material == MaterialId::OBJECT => {
                        pixel.temperature = tile.temperature;
                        if let Some(chunk) = store.get_chunk_mut(coord.x, coord.y) {
                            chunk.set_tile(x, y, MaterialInstance::air());
                        }
                    }
                    _ => {
                        object.grid.pixels[index] = None;
                        changed = true;
                        lost += 1;
                    }
                }
            }

            if object.grid.count() == 0 {
                emptied.push(*handle);
            } else if changed {
                if let Err(e) = bridge.update_hitbox_from_mask(*handle, Some(object.grid.mask())) {
                    log::warn!("[OBJECT] Hitbox rebuild for {:?} failed: {}", handle, e);
                }
            }
        }

        for handle in emptied {
            self.objects.remove(&handle);
            if let Err(e) = bridge.destroy_body(handle) {
                log::warn!("[OBJECT] Failed to destroy {:?}: {}", handle, e);
            }
            log::debug!("[OBJECT] {:?} lost its last pixel", handle);
        }
        lost
    }

    /// Drop every object and its body
    pub fn clear(&mut self, bridge: &RigidBodyBridge) {
        for handle in std::mem::take(&mut self.objects).into_keys() {
            if let Err(e) = bridge.destroy_body(handle) {
                log::warn!("[OBJECT] Failed to destroy {:?}: {}", handle, e);
            }
        }
    }
}

/// `cell` itself unless something rigid is there, then the first open side
fn free_cell(store: &ChunkStore, registry: &MaterialRegistry, cell: IVec2) -> Option<IVec2> {
    let open = |cell: IVec2| {
        let (coord, x, y) = world_to_chunk_coords(cell.x, cell.y);
        store.get_chunk(coord.x, coord.y).is_some_and(|chunk| {
            !matches!(
                registry.physics_class(chunk.material(x, y)),
                PhysicsClass::Solid | PhysicsClass::Object
            )
        })
    };
    if open(cell) {
        return Some(cell);
    }
    SIDES.iter().map(|side| cell + *side).find(|c| open(*c))
}

/// Result of flood-filling the solid tiles around a cell
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Island {
    /// Start cell is not solid
    Empty,
    /// Reaches bedrock, unloaded terrain, or more than [`MAX_ISLAND`] tiles
    Anchored,
    /// Cells in fill order
    Floating(Vec<IVec2>),
}

/// 4-way fill over Solid tiles starting at `start`
pub fn find_island(store: &ChunkStore, registry: &MaterialRegistry, start: IVec2) -> Island {
    let solid_at = |cell: IVec2| -> Option<Option<u16>> {
        let (coord, x, y) = world_to_chunk_coords(cell.x, cell.y);
        let chunk = store.get_chunk(coord.x, coord.y)?;
        let material = chunk.material(x, y);
        Some((registry.physics_class(material) == PhysicsClass::Solid).then_some(material))
    };

    match solid_at(start) {
        Some(Some(material)) if material != MaterialId::BEDROCK => {}
        Some(Some(_)) => return Island::Anchored,
        _ => return Island::Empty,
    }

    let mut visited = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    let mut cells = Vec::new();
    while let Some(cell) = queue.pop_front() {
        cells.push(cell);
        if cells.len() > MAX_ISLAND {
            return Island::Anchored;
        }
        for side in SIDES {
            let next = cell + side;
            if visited.contains(&next) {
                continue;
            }
            match solid_at(next) {
                None => return Island::Anchored,
                Some(Some(MaterialId::BEDROCK)) => return Island::Anchored,
                Some(Some(_)) => {
                    visited.insert(next);
                    queue.push_back(next);
                }
                Some(None) => {}
            }
        }
    }
    Island::Floating(cells)
}

/// What became of a solid island
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Detachment {
    Anchored,
    /// Small island turned into this many particles
    Crumbled(usize),
    Object(BodyHandle),
}

/// Outcome of one explosion
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExplosionReport {
    /// Tiles turned to air outright
    pub cleared: usize,
    /// Tiles thrown out as particles
    pub flung: usize,
    /// Islands cut loose around the crater
    pub detached: Vec<Detachment>,
}

/// Color with RGB quartered, alpha kept
pub fn scorched(color: u32) -> u32 {
    let r = (color >> 24) & 0xff;
    let g = (color >> 16) & 0xff;
    let b = (color >> 8) & 0xff;
    ((r / 4) << 24) | ((g / 4) << 16) | ((b / 4) << 8) | (color & 0xff)
}
