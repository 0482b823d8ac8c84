//! Parallel chunk ticking
//!
//! Active chunks are split into four checkerboard sets by coordinate parity.
//! No two chunks of a set touch, so each set is taken out of the store, ticked
//! on the rayon pool against the untouched rest of the map, put back, and
//! then the tiles it pushed across chunk borders are merged single-threaded.
//! Particles step last, on the calling thread.

use crate::simulation::automaton::{neighbor_slot, ChunkTickResult, ChunkTicker, Neighbors, TickOptions};
use crate::simulation::{MaterialRegistry, Particle, ParticleSystem, ReactionEngine};
use crate::world::chunk::{world_to_chunk_coords, Chunk};
use crate::world::chunk_store::{ChunkStore, ChunkView};
use crate::world::rng_trait::chunk_rng;
use crate::world::stats::TickCounters;
use glam::IVec2;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scheduling state of a chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    /// Outside the tick zone
    Inactive,
    Active,
    /// Nothing changed for a full stability window; skipped until disturbed
    Settled,
}

#[derive(Clone, Copy, Debug)]
struct ActivityState {
    activity: Activity,
    quiet_ticks: u32,
}

impl ActivityState {
    fn active() -> Self {
        Self {
            activity: Activity::Active,
            quiet_ticks: 0,
        }
    }
}

/// Summary of one simulation tick
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    pub chunks_ticked: usize,
    pub chunks_settled: usize,
    pub boundary_writes: usize,
    pub particles_deposited: u32,
    /// Particles still in flight after the tick
    pub particles: usize,
    pub counters: TickCounters,
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct SimulationSettings {
    pub options: TickOptions,
    /// Quiet ticks before a chunk is settled
    pub stability_window: u32,
    /// Rayon threads; 0 lets rayon decide
    pub workers: usize,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            options: TickOptions::default(),
            stability_window: 30,
            workers: 0,
        }
    }
}

const CHECKERBOARD: [(i32, i32); 4] = [(0, 0), (1, 0), (0, 1), (1, 1)];

pub struct SimulationLoop {
    pool: rayon::ThreadPool,
    registry: Arc<MaterialRegistry>,
    reactions: Arc<ReactionEngine>,
    seed: u64,
    tick: u64,
    settings: SimulationSettings,
    activity: HashMap<IVec2, ActivityState>,
    /// (center, radius) in chunks; `None` ticks every resident chunk
    zone: Option<(IVec2, i32)>,
    particles: ParticleSystem,
}

impl SimulationLoop {
    pub fn new(
        registry: Arc<MaterialRegistry>,
        reactions: Arc<ReactionEngine>,
        seed: u64,
        settings: SimulationSettings,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers)
            .thread_name(|index| format!("tick-{}", index))
            .build()?;

        log::debug!("[TICK] Simulation pool with {} threads", pool.current_num_threads());

        Ok(Self {
            pool,
            registry,
            reactions,
            seed,
            tick: 0,
            settings,
            activity: HashMap::new(),
            zone: None,
            particles: ParticleSystem::new(),
        })
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    pub fn set_tick_zone(&mut self, center: IVec2, radius: i32) {
        self.zone = Some((center, radius));
    }

    pub fn clear_tick_zone(&mut self) {
        self.zone = None;
    }

    pub fn particles(&self) -> &ParticleSystem {
        &self.particles
    }

    pub fn spawn_particle(&mut self, particle: Particle) {
        self.particles.spawn(particle);
    }

    fn in_zone(&self, coord: IVec2) -> bool {
        match self.zone {
            Some((center, radius)) => (coord - center).abs().max_element() <= radius,
            None => true,
        }
    }

    pub fn activity(&self, coord: IVec2) -> Activity {
        self.activity
            .get(&coord)
            .map(|state| state.activity)
            .unwrap_or(Activity::Inactive)
    }

    /// Wake a chunk and its neighbors
    pub fn disturb(&mut self, coord: IVec2) {
        for dy in -1..=1 {
            for dx in -1..=1 {
                let neighbor = coord + IVec2::new(dx, dy);
                if let Some(state) = self.activity.get_mut(&neighbor) {
                    if state.activity == Activity::Settled {
                        log::trace!("[TICK] Chunk {:?} woke up", neighbor);
                    }
                    if state.activity != Activity::Inactive {
                        *state = ActivityState::active();
                    }
                }
            }
        }
    }

    /// Bring activity states in line with residency and the tick zone
    fn refresh_activity(&mut self, store: &mut ChunkStore) {
        let coords = store.coords();
        let mut next = HashMap::with_capacity(coords.len());
        for coord in coords {
            let state = if self.in_zone(coord) {
                match self.activity.get(&coord) {
                    Some(state) if state.activity != Activity::Inactive => *state,
                    _ => ActivityState::active(),
                }
            } else {
                ActivityState {
                    activity: Activity::Inactive,
                    quiet_ticks: 0,
                }
            };
            next.insert(coord, state);
        }
        self.activity = next;

        for coord in store.take_disturbed() {
            self.disturb(coord);
        }
    }

    /// Advance every active chunk by one tick
    pub fn tick(&mut self, store: &mut ChunkStore) -> TickReport {
        let started = Instant::now();
        self.refresh_activity(store);

        let mut active: Vec<IVec2> = self
            .activity
            .iter()
            .filter(|(_, state)| state.activity == Activity::Active)
            .map(|(coord, _)| *coord)
            .collect();
        active.sort_unstable_by_key(|c| (c.y, c.x));

        let mut report = TickReport {
            tick: self.tick,
            chunks_settled: self
                .activity
                .values()
                .filter(|state| state.activity == Activity::Settled)
                .count(),
            ..Default::default()
        };

        for coord in &active {
            if let Some(chunk) = store.get_chunk_mut(coord.x, coord.y) {
                chunk.clear_tick_marks();
            }
        }

        for (px, py) in CHECKERBOARD {
            let set: Vec<IVec2> = active
                .iter()
                .copied()
                .filter(|c| c.x.rem_euclid(2) == px && c.y.rem_euclid(2) == py)
                .collect();
            if set.is_empty() {
                continue;
            }
            self.tick_set(store, &set, &mut report);
        }

        if !self.particles.is_empty() {
            let activity = &self.activity;
            let step = self.particles.step(store, &self.registry, |coord| {
                activity
                    .get(&coord)
                    .is_some_and(|state| state.activity != Activity::Inactive)
            });
            report.particles_deposited = step.deposited;
            for coord in step.touched {
                self.disturb(coord);
            }
        }
        report.particles = self.particles.len();

        self.tick += 1;
        report.duration = started.elapsed();
        log::trace!(
            "[TICK] {} chunks, {} moves, {} reactions in {:?}",
            report.chunks_ticked,
            report.counters.tiles_moved,
            report.counters.reactions,
            report.duration
        );
        report
    }

    fn tick_set(&mut self, store: &mut ChunkStore, set: &[IVec2], report: &mut TickReport) {
        let mut taken: Vec<Box<Chunk>> = set.iter().filter_map(|coord| store.take_chunk(*coord)).collect();

        let results: Vec<ChunkTickResult> = {
            let view = store.view();
            let registry = self.registry.as_ref();
            let reactions = self.reactions.as_ref();
            let options = self.settings.options;
            let (seed, tick) = (self.seed, self.tick);

            self.pool.install(|| {
                taken
                    .par_iter_mut()
                    .map(|chunk| {
                        let neighbors = neighbors_of(&view, chunk.coord());
                        let rng = chunk_rng(seed, chunk.x, chunk.y, tick);
                        ChunkTicker::new(registry, reactions, chunk.as_mut(), neighbors, rng).run(options)
                    })
                    .collect()
            })
        };

        let mut woken = Vec::new();
        for (chunk, result) in taken.into_iter().zip(results) {
            let coord = chunk.coord();
            store.return_chunk(chunk);
            report.chunks_ticked += 1;
            report.counters.merge(&result.counters);

            if let Some(state) = self.activity.get_mut(&coord) {
                if result.counters.any_change() {
                    state.quiet_ticks = 0;
                } else {
                    state.quiet_ticks += 1;
                    if state.quiet_ticks >= self.settings.stability_window {
                        state.activity = Activity::Settled;
                    }
                }
            }
            if result.edge_changed {
                woken.push(coord);
            }

            let writes = result.boundary.into_sorted();
            report.boundary_writes += writes.len();
            for (world, tile) in writes {
                let (target, lx, ly) = world_to_chunk_coords(world.x, world.y);
                match store.get_chunk_mut(target.x, target.y) {
                    Some(neighbor) => {
                        neighbor.set_tile(lx, ly, tile);
                        neighbor.mark_moved(lx, ly);
                        woken.push(target);
                    }
                    None => {
                        debug_assert!(false, "boundary write into missing chunk {:?}", target);
                        log::warn!("[TICK] Dropped boundary write into missing chunk {:?}", target);
                    }
                }
            }
        }

        for coord in woken {
            self.disturb(coord);
        }
    }
}

fn neighbors_of<'a>(view: &ChunkView<'a>, coord: IVec2) -> Neighbors<'a> {
    let mut neighbors: Neighbors<'a> = [None; 9];
    for dy in -1..=1 {
        for dx in -1..=1 {
            if dx != 0 || dy != 0 {
                neighbors[neighbor_slot(dx, dy)] = view.get(coord + IVec2::new(dx, dy));
            }
        }
    }
    neighbors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::MaterialId;
    use crate::world::chunk::CHUNK_SIZE;
    use crate::world::chunk_store::LoadContext;

    fn setup(settings: SimulationSettings) -> (ChunkStore, SimulationLoop) {
        let registry = Arc::new(MaterialRegistry::with_defaults());
        let reactions = Arc::new(ReactionEngine::with_defaults(&registry).unwrap());
        let context = LoadContext::new(Arc::clone(&registry), 1, None);
        let store = ChunkStore::new(context, 1, 1, 1).unwrap();
        let sim = SimulationLoop::new(registry, reactions, 1, settings).unwrap();
        (store, sim)
    }

    fn movement_only() -> SimulationSettings {
        SimulationSettings {
            options: TickOptions {
                temperature: false,
                reactions: false,
            },
            stability_window: 3,
            workers: 2,
        }
    }

    #[test]
    fn test_sand_crosses_chunk_border() {
        let (mut store, mut sim) = setup(movement_only());
        let registry = Arc::clone(store.registry());
        store.insert_chunk(Chunk::new(0, 0));
        store.insert_chunk(Chunk::new(0, -1));
        if let Some(chunk) = store.get_chunk_mut(0, 0) {
            chunk.set_tile(7, 0, registry.instance(MaterialId::SAND));
        }

        let report = sim.tick(&mut store);

        assert_eq!(report.boundary_writes, 1);
        assert_eq!(store.get_chunk(0, 0).unwrap().material(7, 0), MaterialId::AIR);
        assert_eq!(
            store.get_chunk(0, -1).unwrap().material(7, CHUNK_SIZE - 1),
            MaterialId::SAND
        );
    }

    #[test]
    fn test_merged_tile_does_not_move_again_same_tick() {
        let (mut store, mut sim) = setup(movement_only());
        let registry = Arc::clone(store.registry());
        store.insert_chunk(Chunk::new(0, 0));
        store.insert_chunk(Chunk::new(0, -1));
        if let Some(chunk) = store.get_chunk_mut(0, 0) {
            chunk.set_tile(7, 0, registry.instance(MaterialId::SAND));
        }

        // (0, 0) ticks in the first set, (0, -1) in a later one
        sim.tick(&mut store);
        assert_eq!(
            store.get_chunk(0, -1).unwrap().material(7, CHUNK_SIZE - 1),
            MaterialId::SAND
        );
    }

    #[test]
    fn test_quiet_chunk_settles_and_wakes() {
        let (mut store, mut sim) = setup(movement_only());
        let registry = Arc::clone(store.registry());
        store.insert_chunk(Chunk::new(0, 0));

        for _ in 0..3 {
            sim.tick(&mut store);
        }
        assert_eq!(sim.activity(IVec2::ZERO), Activity::Settled);
        let report = sim.tick(&mut store);
        assert_eq!(report.chunks_ticked, 0);
        assert_eq!(report.chunks_settled, 1);

        if let Some(chunk) = store.get_chunk_mut(0, 0) {
            chunk.set_tile(1, 5, registry.instance(MaterialId::SAND));
        }
        store.mark_disturbed(IVec2::ZERO);
        let report = sim.tick(&mut store);
        assert_eq!(report.chunks_ticked, 1);
        assert_eq!(report.counters.tiles_moved, 1);
        assert_eq!(sim.activity(IVec2::ZERO), Activity::Active);
    }

    #[test]
    fn test_deposited_particle_wakes_settled_chunk() {
        let (mut store, mut sim) = setup(movement_only());
        let registry = Arc::clone(store.registry());
        let mut chunk = Chunk::new(0, 0);
        for x in 0..CHUNK_SIZE {
            chunk.set_tile(x, 0, registry.instance(MaterialId::STONE));
        }
        store.insert_chunk(chunk);
        for _ in 0..3 {
            sim.tick(&mut store);
        }
        assert_eq!(sim.activity(IVec2::ZERO), Activity::Settled);

        let sand = registry.instance(MaterialId::SAND);
        sim.spawn_particle(Particle::new(sand, glam::Vec2::new(12.5, 1.5), glam::Vec2::new(0.0, -1.0)));
        let report = sim.tick(&mut store);

        assert_eq!(report.particles_deposited, 1);
        assert_eq!(report.particles, 0);
        assert_eq!(*store.get_chunk(0, 0).unwrap().tile(12, 1), sand);
        assert_eq!(sim.activity(IVec2::ZERO), Activity::Active);
    }

    #[test]
    fn test_chunks_outside_zone_are_inactive() {
        let (mut store, mut sim) = setup(movement_only());
        store.insert_chunk(Chunk::new(0, 0));
        store.insert_chunk(Chunk::new(5, 0));
        sim.set_tick_zone(IVec2::ZERO, 1);

        let report = sim.tick(&mut store);

        assert_eq!(report.chunks_ticked, 1);
        assert_eq!(sim.activity(IVec2::new(5, 0)), Activity::Inactive);
    }
}
