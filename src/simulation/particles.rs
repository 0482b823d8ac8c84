//! Free-flying tiles
//!
//! A particle carries one tile out of the grid and moves ballistically until
//! it hits something that does not give way, or its lifetime runs out. Then
//! it is written back as a tile at the nearest free cell.
//!
//! Particles are bucketed by the chunk under them. A bucket only advances
//! while its chunk is resident and ticking, so nothing flies into unloaded
//! terrain and the next bucket picks a particle up once it crosses a border.

use crate::simulation::{MaterialId, MaterialInstance, MaterialRegistry, PhysicsClass};
use crate::world::chunk_store::ChunkStore;
use crate::world::world_to_chunk_coords;
use glam::{IVec2, Vec2};
use std::collections::HashMap;

/// Default acceleration, tiles per tick squared
pub const GRAVITY: Vec2 = Vec2::new(0.0, -0.1);

/// Per-axis speed cap, tiles per tick
const MAX_SPEED: f32 = 32.0;

/// Rings searched for a free cell when depositing
const DEPOSIT_SEARCH: i32 = 16;

/// Upward kick when there is nowhere to deposit
const BOUNCE: f32 = 4.0;

#[derive(Clone, Debug)]
pub struct Particle {
    pub tile: MaterialInstance,
    /// World tile coordinates
    pub position: Vec2,
    /// Tiles per tick
    pub velocity: Vec2,
    pub acceleration: Vec2,
    /// Ticks left before it deposits where it is; `None` flies until it lands
    pub lifetime: Option<u32>,
}

impl Particle {
    pub fn new(tile: MaterialInstance, position: Vec2, velocity: Vec2) -> Self {
        Self {
            tile,
            position,
            velocity,
            acceleration: GRAVITY,
            lifetime: None,
        }
    }

    pub fn with_lifetime(mut self, ticks: u32) -> Self {
        self.lifetime = Some(ticks);
        self
    }

    pub fn with_acceleration(mut self, acceleration: Vec2) -> Self {
        self.acceleration = acceleration;
        self
    }

    /// World cell the particle is over
    pub fn cell(&self) -> IVec2 {
        self.position.floor().as_ivec2()
    }

    pub fn chunk(&self) -> IVec2 {
        let cell = self.cell();
        world_to_chunk_coords(cell.x, cell.y).0
    }
}

/// Outcome of one particle step
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParticleStep {
    pub deposited: u32,
    /// Particles that moved into another chunk's bucket
    pub handed_off: u32,
    /// Particles held over a missing or inactive chunk
    pub parked: u32,
    /// Chunks that received a deposited tile, in deposit order
    pub touched: Vec<IVec2>,
}

enum Fate {
    Flying,
    Landed(IVec2),
}

#[derive(Default)]
pub struct ParticleSystem {
    buckets: HashMap<IVec2, Vec<Particle>>,
}

impl ParticleSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, particle: Particle) {
        self.buckets.entry(particle.chunk()).or_default().push(particle);
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }

    /// Particles currently over `chunk`
    pub fn in_chunk(&self, chunk: IVec2) -> &[Particle] {
        self.buckets.get(&chunk).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Particle> {
        self.buckets.values().flatten()
    }

    /// Advance every particle over an active chunk by one tick
    ///
    /// Buckets run in (y, x) order and particles keep their spawn order
    /// inside a bucket, so the result does not depend on map iteration.
    pub fn step(
        &mut self,
        store: &mut ChunkStore,
        registry: &MaterialRegistry,
        is_active: impl Fn(IVec2) -> bool,
    ) -> ParticleStep {
        let mut keys: Vec<IVec2> = self.buckets.keys().copied().collect();
        keys.sort_unstable_by_key(|c| (c.y, c.x));

        let mut step = ParticleStep::default();
        let mut next: HashMap<IVec2, Vec<Particle>> = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(bucket) = self.buckets.remove(&key) else {
                continue;
            };
            if !store.contains(key) || !is_active(key) {
                step.parked += bucket.len() as u32;
                next.entry(key).or_default().extend(bucket);
                continue;
            }

            for mut particle in bucket {
                let landed = match advance(&mut particle, store, registry) {
                    Fate::Landed(cell) => Some(cell),
                    Fate::Flying => match particle.lifetime.as_mut() {
                        Some(ticks) => {
                            *ticks = ticks.saturating_sub(1);
                            (*ticks == 0).then(|| particle.cell())
                        }
                        None => None,
                    },
                };

                if let Some(cell) = landed {
                    match deposit(store, registry, cell, particle.tile) {
                        Some(chunk) => {
                            step.deposited += 1;
                            step.touched.push(chunk);
                            continue;
                        }
                        None => {
                            log::trace!("[PARTICLE] No free cell near {:?}, bouncing", cell);
                            particle.position = cell.as_vec2() + Vec2::splat(0.5);
                            particle.velocity = Vec2::new(0.0, BOUNCE);
                        }
                    }
                }

                let chunk = particle.chunk();
                if chunk != key {
                    step.handed_off += 1;
                }
                next.entry(chunk).or_default().push(particle);
            }
        }

        next.retain(|_, bucket| !bucket.is_empty());
        self.buckets = next;
        step
    }
}

/// Solid and object tiles stop a particle; so does the edge of the loaded map
fn blocks(store: &ChunkStore, registry: &MaterialRegistry, cell: IVec2) -> bool {
    let (coord, x, y) = world_to_chunk_coords(cell.x, cell.y);
    match store.get_chunk(coord.x, coord.y) {
        Some(chunk) => matches!(
            registry.physics_class(chunk.material(x, y)),
            PhysicsClass::Solid | PhysicsClass::Object
        ),
        None => true,
    }
}

/// Move in sub-steps of at most one tile so nothing is tunnelled through
fn advance(particle: &mut Particle, store: &ChunkStore, registry: &MaterialRegistry) -> Fate {
    particle.velocity = (particle.velocity + particle.acceleration).clamp(Vec2::splat(-MAX_SPEED), Vec2::splat(MAX_SPEED));

    let steps = (particle.velocity.x.abs() + particle.velocity.y.abs()) as u32 + 1;
    let delta = particle.velocity / steps as f32;
    let mut last = particle.cell();
    for _ in 0..steps {
        let position = particle.position + delta;
        let cell = position.floor().as_ivec2();
        if cell != last && blocks(store, registry, cell) {
            particle.velocity = Vec2::ZERO;
            return Fate::Landed(last);
        }
        particle.position = position;
        last = cell;
    }
    Fate::Flying
}

/// Write `tile` into the nearest air cell around `cell`, returning its chunk
fn deposit(store: &mut ChunkStore, registry: &MaterialRegistry, cell: IVec2, tile: MaterialInstance) -> Option<IVec2> {
    for radius in 0..=DEPOSIT_SEARCH {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx.abs().max(dy.abs()) != radius {
                    continue;
                }
                let target = cell + IVec2::new(dx, dy);
                let (coord, x, y) = world_to_chunk_coords(target.x, target.y);
                let Some(chunk) = store.get_chunk_mut(coord.x, coord.y) else {
                    continue;
                };
                if chunk.material(x, y) == MaterialId::AIR {
                    chunk.replace_tile(registry, x, y, tile);
                    return Some(coord);
                }
            }
        }
    }
    None
}
