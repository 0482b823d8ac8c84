//! Chunk store - sparse map of resident chunks plus the load/unload machinery
//!
//! The store is the only writer of map topology. Load tasks run on the load
//! pool and hand back finished chunks, which are inserted here; neighbor
//! splices produced by populators are routed here as well.

use crate::concurrency::{Report, WorkerMessage, WorkerPool};
use crate::simulation::MaterialRegistry;
use crate::world::chunk::{Chunk, DirtyFlags, GenerationState};
use crate::world::generation::WorldGenerator;
use crate::world::hooks::{NoopHooks, WorldHooks};
use crate::world::persistence::ChunkPersistence;
use crate::world::populators::{NeighborSnapshot, PopulatorPipeline};
use crate::world::structure::{PlacedStructure, Splice};
use glam::IVec2;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub coord: IVec2,
    /// Run populator phases the chunk has not seen yet
    pub populate: bool,
    /// Mark the chunk render-dirty once resident
    pub render: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    /// Already in the map, nothing to do
    Resident,
    /// A load for this coordinate is already running or queued
    AlreadyPending,
    Dispatched,
    /// Waiting for a free load worker
    Queued,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnloadStatus {
    Unloaded,
    /// Tasks still reference the chunk; retried by `process_deferred_unloads`
    Deferred,
    NotResident,
    /// Inside the retained radius of the current load zone
    Retained,
}

/// Messages from load workers
pub enum LoadEvent {
    State {
        coord: IVec2,
        state: GenerationState,
    },
    Phase {
        coord: IVec2,
        phase: u32,
    },
    Finished(Box<LoadOutcome>),
    /// The load panicked; the coordinate is free to be requested again
    Failed {
        coord: IVec2,
        reason: String,
    },
}

pub struct LoadOutcome {
    pub chunk: Chunk,
    /// Structure parts destined for other chunks
    pub splices: Vec<Splice>,
    pub from_pack: bool,
}

pub struct LoadJob {
    request: LoadRequest,
    snapshot: NeighborSnapshot,
}

/// Read-only state shared by all load workers
pub struct LoadContext {
    pub registry: Arc<MaterialRegistry>,
    pub generator: WorldGenerator,
    pub pipeline: PopulatorPipeline,
    pub persistence: Option<ChunkPersistence>,
    pub seed: u64,
}

impl LoadContext {
    pub fn new(
        registry: Arc<MaterialRegistry>,
        seed: u64,
        persistence: Option<ChunkPersistence>,
    ) -> Self {
        Self {
            registry,
            generator: WorldGenerator::new(seed),
            pipeline: PopulatorPipeline::with_defaults(seed),
            persistence,
            seed,
        }
    }

    /// Load or generate one chunk
    ///
    /// Pack present: decoded as is, then only missing phases run. No pack:
    /// base terrain, then every phase.
    pub fn load(
        &self,
        request: &LoadRequest,
        snapshot: &NeighborSnapshot,
        report: Report<LoadEvent>,
    ) -> LoadOutcome {
        let coord = request.coord;
        let registry = self.registry.as_ref();

        let loaded = self
            .persistence
            .as_ref()
            .and_then(|persistence| persistence.load_chunk(registry, coord.x, coord.y));
        let from_pack = loaded.is_some();

        let mut chunk = match loaded {
            Some(chunk) => chunk,
            None => {
                let mut chunk = Chunk::new(coord.x, coord.y);
                chunk.advance_generation(GenerationState::Generating);
                report(LoadEvent::State {
                    coord,
                    state: GenerationState::Generating,
                });
                self.generator.generate_into(registry, &mut chunk);
                chunk
            }
        };

        let mut splices = Vec::new();
        let mut changed = !from_pack;
        if request.populate && self.pipeline.full_mask() & !chunk.populated_mask() != 0 {
            changed = true;
            if chunk.advance_generation(GenerationState::Generating) {
                report(LoadEvent::State {
                    coord,
                    state: GenerationState::Generating,
                });
            }
            splices = self
                .pipeline
                .populate(registry, self.seed, &mut chunk, snapshot, |phase| {
                    report(LoadEvent::Phase { coord, phase })
                });
        }

        chunk.advance_generation(GenerationState::Generated);
        report(LoadEvent::State {
            coord,
            state: GenerationState::Generated,
        });

        chunk.mark_all_dirty();
        if changed {
            // Not on disk yet, or the pack predates the new phases
            chunk.mark_dirty(DirtyFlags::PERSIST);
        }
        if !request.render {
            chunk.clear_dirty(DirtyFlags::RENDER | DirtyFlags::LAYER2);
        }

        log::debug!(
            "[GEN] Chunk ({}, {}) ready - {} non-air tiles, mask {:#b}, {} outgoing splices",
            coord.x,
            coord.y,
            chunk.count_non_air(),
            chunk.populated_mask(),
            splices.len()
        );

        LoadOutcome {
            chunk,
            splices,
            from_pack,
        }
    }
}

/// Proof that a task holds a chunk; the chunk cannot unload until released
#[must_use]
#[derive(Debug)]
pub struct TaskTicket {
    coord: IVec2,
}

impl TaskTicket {
    pub fn coord(&self) -> IVec2 {
        self.coord
    }
}

type ChunkMap = HashMap<i32, HashMap<i32, Box<Chunk>>>;

fn chunk_mut(chunks: &mut ChunkMap, coord: IVec2) -> Option<&mut Chunk> {
    chunks
        .get_mut(&coord.x)
        .and_then(|column| column.get_mut(&coord.y))
        .map(|chunk| chunk.as_mut())
}

/// Area the store keeps resident
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LoadZone {
    center: IVec2,
    /// Load radius plus the retain margin
    retain: i32,
}

impl LoadZone {
    fn retains(&self, coord: IVec2) -> bool {
        (coord.x - self.center.x).abs() <= self.retain && (coord.y - self.center.y).abs() <= self.retain
    }
}

/// Shareable read-only view of the resident chunks
#[derive(Clone, Copy)]
pub struct ChunkView<'a> {
    chunks: &'a ChunkMap,
}

impl<'a> ChunkView<'a> {
    pub fn get(&self, coord: IVec2) -> Option<&'a Chunk> {
        self.chunks
            .get(&coord.x)
            .and_then(|column| column.get(&coord.y))
            .map(|chunk| chunk.as_ref())
    }
}

pub struct ChunkStore {
    /// Outer key x, inner key y
    chunks: ChunkMap,
    resident: usize,
    in_flight: HashSet<IVec2>,
    /// Splices for chunks that have never been generated
    pending_splices: HashMap<IVec2, Vec<Splice>>,
    deferred_unloads: Vec<IVec2>,
    zone: Option<LoadZone>,
    /// Chunks changed from outside the simulation since the last tick
    disturbed: HashSet<IVec2>,
    pool: WorkerPool<LoadJob, LoadEvent>,
    context: Arc<LoadContext>,
    hooks: Box<dyn WorldHooks>,
    retain_margin: i32,
}

impl ChunkStore {
    pub fn new(
        context: LoadContext,
        load_workers: usize,
        max_in_flight: usize,
        retain_margin: i32,
    ) -> std::io::Result<Self> {
        let context = Arc::new(context);
        let worker_context = Arc::clone(&context);
        let pool = WorkerPool::new(
            "chunk-load",
            load_workers,
            max_in_flight,
            move |job: LoadJob, report: Report<LoadEvent>| {
                let coord = job.request.coord;
                let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
                    worker_context.load(&job.request, &job.snapshot, report)
                }));
                match loaded {
                    Ok(outcome) => LoadEvent::Finished(Box::new(outcome)),
                    Err(payload) => LoadEvent::Failed {
                        coord,
                        reason: payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "load panicked".to_string()),
                    },
                }
            },
        )?;

        Ok(Self {
            chunks: HashMap::new(),
            resident: 0,
            in_flight: HashSet::new(),
            pending_splices: HashMap::new(),
            deferred_unloads: Vec::new(),
            zone: None,
            disturbed: HashSet::new(),
            pool,
            context,
            hooks: Box::new(NoopHooks),
            retain_margin,
        })
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn WorldHooks>) {
        self.hooks = hooks;
    }

    pub fn hooks_mut(&mut self) -> &mut dyn WorldHooks {
        self.hooks.as_mut()
    }

    pub fn registry(&self) -> &Arc<MaterialRegistry> {
        &self.context.registry
    }

    pub fn context(&self) -> &LoadContext {
        &self.context
    }

    pub fn persistence(&self) -> Option<&ChunkPersistence> {
        self.context.persistence.as_ref()
    }

    // ===== Lookup =====

    pub fn get_chunk(&self, x: i32, y: i32) -> Option<&Chunk> {
        self.chunks
            .get(&x)
            .and_then(|column| column.get(&y))
            .map(|chunk| chunk.as_ref())
    }

    pub fn get_chunk_mut(&mut self, x: i32, y: i32) -> Option<&mut Chunk> {
        chunk_mut(&mut self.chunks, IVec2::new(x, y))
    }

    /// Read-only view that can cross thread boundaries
    pub fn view(&self) -> ChunkView<'_> {
        ChunkView {
            chunks: &self.chunks,
        }
    }

    pub fn contains(&self, coord: IVec2) -> bool {
        self.get_chunk(coord.x, coord.y).is_some()
    }

    pub fn len(&self) -> usize {
        self.resident
    }

    pub fn is_empty(&self) -> bool {
        self.resident == 0
    }

    /// Resident coordinates, sorted by (y, x)
    pub fn coords(&self) -> Vec<IVec2> {
        let mut coords: Vec<IVec2> = self
            .chunks
            .iter()
            .flat_map(|(&x, column)| column.keys().map(move |&y| IVec2::new(x, y)))
            .collect();
        coords.sort_unstable_by_key(|c| (c.y, c.x));
        coords
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks
            .values()
            .flat_map(|column| column.values().map(|chunk| chunk.as_ref()))
    }

    pub fn chunks_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.chunks
            .values_mut()
            .flat_map(|column| column.values_mut().map(|chunk| chunk.as_mut()))
    }

    // ===== Map topology =====

    fn insert_box(&mut self, chunk: Box<Chunk>) {
        let (x, y) = (chunk.x, chunk.y);
        if self.chunks.entry(x).or_default().insert(y, chunk).is_none() {
            self.resident += 1;
        }
    }

    fn remove_box(&mut self, coord: IVec2) -> Option<Box<Chunk>> {
        let column = self.chunks.get_mut(&coord.x)?;
        let chunk = column.remove(&coord.y)?;
        if column.is_empty() {
            self.chunks.remove(&coord.x);
        }
        self.resident -= 1;
        Some(chunk)
    }

    /// Temporarily take a chunk out of the map (simulation partitions)
    pub(crate) fn take_chunk(&mut self, coord: IVec2) -> Option<Box<Chunk>> {
        self.remove_box(coord)
    }

    /// Put back a chunk taken with `take_chunk`
    pub(crate) fn return_chunk(&mut self, chunk: Box<Chunk>) {
        self.insert_box(chunk);
    }

    /// Insert an already built chunk, bypassing the load pool
    ///
    /// The chunk is marked generated; pending splices for it are applied.
    pub fn insert_chunk(&mut self, mut chunk: Chunk) {
        let coord = chunk.coord();
        chunk.advance_generation(GenerationState::Generated);
        self.in_flight.remove(&coord);
        self.finish_insert(Box::new(chunk), false);
    }

    fn finish_insert(&mut self, mut chunk: Box<Chunk>, from_pack: bool) {
        let coord = chunk.coord();
        if let Some(pending) = self.pending_splices.remove(&coord) {
            let registry = Arc::clone(&self.context.registry);
            let written: usize = pending
                .iter()
                .map(|splice| splice.apply(&registry, &mut chunk))
                .sum();
            log::debug!(
                "[GEN] Applied {} pending splices ({} tiles) to chunk ({}, {})",
                pending.len(),
                written,
                coord.x,
                coord.y
            );
        }

        self.insert_box(chunk);
        self.disturbed.insert(coord);
        self.hooks.chunk_loaded(coord, from_pack);
    }

    /// Send a splice to its chunk, wherever that chunk currently is
    fn route_splice(&mut self, splice: Splice) {
        let target = splice.chunk;
        let registry = Arc::clone(&self.context.registry);

        if let Some(chunk) = chunk_mut(&mut self.chunks, target) {
            splice.apply(&registry, chunk);
            self.disturbed.insert(target);
            return;
        }

        if !self.in_flight.contains(&target) {
            if let Some(persistence) = self.context.persistence.as_ref() {
                if let Some(mut chunk) = persistence.load_chunk(&registry, target.x, target.y) {
                    splice.apply(&registry, &mut chunk);
                    match persistence.save_chunk(&chunk) {
                        Ok(()) => return,
                        Err(e) => log::warn!(
                            "[SAVE] Failed to rewrite pack ({}, {}) for splice: {:#}",
                            target.x,
                            target.y,
                            e
                        ),
                    }
                }
            }
        }

        self.pending_splices.entry(target).or_default().push(splice);
    }

    /// Stamp a structure into the world; returns how many chunks it touched
    ///
    /// Parts over non-resident chunks follow the same rules as populator
    /// splices: packs are rewritten, never-generated chunks get them later.
    pub fn place_structure(&mut self, structure: &PlacedStructure) -> usize {
        let splices = structure.splices();
        let touched = splices.len();
        for splice in splices {
            self.route_splice(splice);
        }
        touched
    }

    // ===== Loading =====

    /// Start loading a chunk; a no-op for resident or in-flight coordinates
    pub fn request_load(&mut self, x: i32, y: i32, populate: bool, render: bool) -> LoadStatus {
        let coord = IVec2::new(x, y);
        if self.contains(coord) {
            return LoadStatus::Resident;
        }
        if self.in_flight.contains(&coord) {
            return LoadStatus::AlreadyPending;
        }

        let snapshot = NeighborSnapshot::capture(coord, |c| self.get_chunk(c.x, c.y));
        self.in_flight.insert(coord);

        let job = LoadJob {
            request: LoadRequest {
                coord,
                populate,
                render,
            },
            snapshot,
        };
        if self.pool.publish(job) {
            LoadStatus::Dispatched
        } else {
            log::debug!("[LOAD] Load pool busy, queued chunk ({}, {})", x, y);
            LoadStatus::Queued
        }
    }

    /// Insert finished loads; returns the coordinates that became resident
    pub fn process_loads(&mut self) -> Vec<IVec2> {
        let messages = self.pool.drain();
        self.handle_messages(messages)
    }

    /// Block until no load is in flight (or `timeout` passes)
    pub fn wait_for_loads(&mut self, timeout: Duration) -> Vec<IVec2> {
        let deadline = Instant::now() + timeout;
        let mut loaded = Vec::new();
        while !self.in_flight.is_empty() && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let messages = self.pool.drain_wait(remaining.min(Duration::from_millis(50)));
            loaded.extend(self.handle_messages(messages));
        }
        loaded
    }

    fn handle_messages(&mut self, messages: Vec<WorkerMessage<LoadEvent>>) -> Vec<IVec2> {
        let mut loaded = Vec::new();
        for message in messages {
            let event = match message {
                WorkerMessage::Progress(event) | WorkerMessage::Done(event) => event,
                WorkerMessage::Failed(reason) => {
                    log::error!("[LOAD] Load worker failed outside a load: {}", reason);
                    continue;
                }
            };
            match event {
                LoadEvent::State { coord, state } => {
                    self.hooks.generation_state_changed(coord, state);
                }
                LoadEvent::Phase { coord, phase } => {
                    self.hooks.phase_populated(coord, phase);
                }
                LoadEvent::Finished(outcome) => {
                    let LoadOutcome {
                        chunk,
                        splices,
                        from_pack,
                    } = *outcome;
                    let coord = chunk.coord();
                    self.in_flight.remove(&coord);

                    if self.contains(coord) {
                        debug_assert!(false, "chunk ({}, {}) loaded twice", coord.x, coord.y);
                        continue;
                    }

                    log::debug!(
                        "[LOAD] Chunk ({}, {}) resident ({})",
                        coord.x,
                        coord.y,
                        if from_pack { "pack" } else { "generated" }
                    );
                    self.finish_insert(Box::new(chunk), from_pack);
                    for splice in splices {
                        self.route_splice(splice);
                    }
                    loaded.push(coord);
                }
                LoadEvent::Failed { coord, reason } => {
                    log::error!("[LOAD] Chunk ({}, {}) failed to load: {}", coord.x, coord.y, reason);
                    self.in_flight.remove(&coord);
                    self.deferred_unloads.retain(|c| *c != coord);
                }
            }
        }
        loaded
    }

    pub fn is_loading(&self, coord: IVec2) -> bool {
        self.in_flight.contains(&coord)
    }

    pub fn loads_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Load tasks ever published to the pool
    pub fn loads_published(&self) -> u64 {
        self.pool.published()
    }

    pub fn pending_splice_count(&self) -> usize {
        self.pending_splices.values().map(Vec::len).sum()
    }

    // ===== Unloading =====

    fn defer_unload(&mut self, coord: IVec2) {
        if !self.deferred_unloads.contains(&coord) {
            self.deferred_unloads.push(coord);
        }
    }

    fn is_retained(&self, coord: IVec2) -> bool {
        self.zone.is_some_and(|zone| zone.retains(coord))
    }

    /// Save a chunk and drop it from the map
    ///
    /// Refused inside the current load zone. Refused while tasks hold the
    /// chunk or its load is still running; the request is remembered and
    /// retried by `process_deferred_unloads`.
    pub fn unload(&mut self, x: i32, y: i32) -> UnloadStatus {
        let coord = IVec2::new(x, y);
        if self.is_retained(coord) {
            self.deferred_unloads.retain(|c| *c != coord);
            return UnloadStatus::Retained;
        }
        if self.in_flight.contains(&coord) {
            self.defer_unload(coord);
            return UnloadStatus::Deferred;
        }
        let Some(chunk) = self.get_chunk(x, y) else {
            self.deferred_unloads.retain(|c| *c != coord);
            return UnloadStatus::NotResident;
        };
        if chunk.has_pending_tasks() {
            log::debug!("[SAVE] Chunk ({}, {}) busy, unload deferred", x, y);
            self.defer_unload(coord);
            return UnloadStatus::Deferred;
        }

        if let Some(persistence) = self.context.persistence.as_ref() {
            if chunk.is_dirty(DirtyFlags::PERSIST) || !persistence.has_pack(x, y) {
                if let Err(e) = persistence.save_chunk(chunk) {
                    log::error!("[SAVE] Chunk ({}, {}) not unloaded: {:#}", x, y, e);
                    self.defer_unload(coord);
                    return UnloadStatus::Deferred;
                }
            }
        }

        self.remove_box(coord);
        self.deferred_unloads.retain(|c| *c != coord);
        self.disturbed.remove(&coord);
        self.hooks.chunk_unloaded(coord);
        UnloadStatus::Unloaded
    }

    /// Retry deferred unloads; returns how many went through
    pub fn process_deferred_unloads(&mut self) -> usize {
        let deferred = std::mem::take(&mut self.deferred_unloads);
        deferred
            .into_iter()
            .filter(|coord| self.unload(coord.x, coord.y) == UnloadStatus::Unloaded)
            .count()
    }

    pub fn deferred_unloads(&self) -> &[IVec2] {
        &self.deferred_unloads
    }

    /// Center and retained radius of the last `set_load_zone`
    pub fn load_zone(&self) -> Option<(IVec2, i32)> {
        self.zone.map(|zone| (zone.center, zone.retain))
    }

    /// Load everything within `radius` of `center`, unload beyond `radius + margin`
    ///
    /// Deferred unloads the new zone retains are dropped.
    pub fn set_load_zone(&mut self, center: IVec2, radius: i32, populate: bool) {
        let zone = LoadZone {
            center,
            retain: radius + self.retain_margin,
        };
        self.zone = Some(zone);
        self.deferred_unloads.retain(|c| !zone.retains(*c));

        let mut wanted: Vec<IVec2> = (-radius..=radius)
            .flat_map(|dy| (-radius..=radius).map(move |dx| center + IVec2::new(dx, dy)))
            .collect();
        // Closest first
        wanted.sort_by_key(|c| ((*c - center).length_squared(), c.y, c.x));
        for coord in wanted {
            self.request_load(coord.x, coord.y, populate, true);
        }

        let outside: Vec<IVec2> = self
            .coords()
            .into_iter()
            .filter(|c| !zone.retains(*c))
            .collect();
        for coord in outside {
            self.unload(coord.x, coord.y);
        }
    }

    // ===== Tasks =====

    /// Pin a resident chunk for a task
    pub fn acquire_ticket(&mut self, coord: IVec2) -> Option<TaskTicket> {
        let chunk = chunk_mut(&mut self.chunks, coord)?;
        chunk.begin_task();
        Some(TaskTicket { coord })
    }

    pub fn release_ticket(&mut self, ticket: TaskTicket) {
        match chunk_mut(&mut self.chunks, ticket.coord) {
            Some(chunk) => chunk.end_task(),
            None => debug_assert!(false, "ticket for non-resident chunk {:?}", ticket.coord),
        }
    }

    // ===== Persistence & activity =====

    /// Save every chunk with unsaved edits; returns how many were written
    pub fn save_all(&mut self) -> anyhow::Result<usize> {
        let Some(persistence) = self.context.persistence.clone() else {
            return Ok(0);
        };

        let mut saved = 0;
        for chunk in self.chunks_mut() {
            if chunk.is_dirty(DirtyFlags::PERSIST) {
                persistence.save_chunk(chunk)?;
                chunk.clear_dirty(DirtyFlags::PERSIST);
                saved += 1;
            }
        }
        if saved > 0 {
            log::info!("[SAVE] Saved {} chunks", saved);
        }
        Ok(saved)
    }

    pub fn mark_disturbed(&mut self, coord: IVec2) {
        self.disturbed.insert(coord);
    }

    /// Chunks changed outside the simulation since the last call
    pub fn take_disturbed(&mut self) -> Vec<IVec2> {
        self.disturbed.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::MaterialId;
    use crate::world::structure::StructureTile;

    fn store(persistence: Option<ChunkPersistence>) -> ChunkStore {
        let registry = Arc::new(MaterialRegistry::with_defaults());
        ChunkStore::new(LoadContext::new(registry, 42, persistence), 2, 1, 1).unwrap()
    }

    #[test]
    fn test_request_load_is_idempotent() {
        let mut store = store(None);

        let first = store.request_load(0, 0, true, true);
        let second = store.request_load(0, 0, true, true);

        assert!(matches!(first, LoadStatus::Dispatched | LoadStatus::Queued));
        assert_eq!(second, LoadStatus::AlreadyPending);
        assert_eq!(store.loads_published(), 1);

        let loaded = store.wait_for_loads(Duration::from_secs(10));
        assert_eq!(loaded, vec![IVec2::ZERO]);
        assert_eq!(store.request_load(0, 0, true, true), LoadStatus::Resident);
        assert_eq!(store.loads_published(), 1);

        let chunk = store.get_chunk(0, 0).unwrap();
        assert_eq!(chunk.generation_state(), GenerationState::Generated);
        assert_eq!(chunk.populated_mask(), 0b11);
    }

    #[test]
    fn test_load_without_populate_leaves_mask_empty() {
        let mut store = store(None);
        store.request_load(3, -1, false, false);
        store.wait_for_loads(Duration::from_secs(10));

        let chunk = store.get_chunk(3, -1).unwrap();
        assert_eq!(chunk.generation_state(), GenerationState::Generated);
        assert_eq!(chunk.populated_mask(), 0);
        assert!(!chunk.is_dirty(DirtyFlags::RENDER));
    }

    #[test]
    fn test_two_level_map_bookkeeping() {
        let mut store = store(None);
        store.insert_chunk(Chunk::new(1, 1));
        store.insert_chunk(Chunk::new(1, 2));
        store.insert_chunk(Chunk::new(-4, 1));

        assert_eq!(store.len(), 3);
        assert_eq!(
            store.coords(),
            vec![IVec2::new(-4, 1), IVec2::new(1, 1), IVec2::new(1, 2)]
        );

        assert_eq!(store.unload(1, 1), UnloadStatus::Unloaded);
        assert_eq!(store.unload(1, 1), UnloadStatus::NotResident);
        assert_eq!(store.len(), 2);
        assert!(store.get_chunk(1, 2).is_some());
    }

    #[test]
    fn test_unload_deferred_while_ticket_held() {
        let mut store = store(None);
        store.insert_chunk(Chunk::new(0, 0));

        let ticket = store.acquire_ticket(IVec2::ZERO).unwrap();
        assert_eq!(store.unload(0, 0), UnloadStatus::Deferred);
        assert_eq!(store.process_deferred_unloads(), 0);
        assert_eq!(store.deferred_unloads(), &[IVec2::ZERO]);

        store.release_ticket(ticket);
        assert_eq!(store.process_deferred_unloads(), 1);
        assert!(store.is_empty());
        assert!(store.deferred_unloads().is_empty());
    }

    #[test]
    fn test_splices_reach_resident_and_future_chunks() {
        let mut store = store(None);
        store.insert_chunk(Chunk::new(1, 0));
        store.take_disturbed();

        let splice = |chunk: IVec2| Splice {
            chunk,
            layer: crate::world::chunk::Layer::Primary,
            overwrite: true,
            writes: vec![(
                2,
                3,
                StructureTile {
                    material: MaterialId::WOOD,
                    color: None,
                },
            )],
        };

        store.route_splice(splice(IVec2::new(1, 0)));
        store.route_splice(splice(IVec2::new(5, 5)));

        assert_eq!(store.get_chunk(1, 0).unwrap().material(2, 3), MaterialId::WOOD);
        assert_eq!(store.take_disturbed(), vec![IVec2::new(1, 0)]);
        assert_eq!(store.pending_splice_count(), 1);

        store.insert_chunk(Chunk::new(5, 5));
        assert_eq!(store.get_chunk(5, 5).unwrap().material(2, 3), MaterialId::WOOD);
        assert_eq!(store.pending_splice_count(), 0);
    }

    #[test]
    fn test_load_zone_requests_and_evicts() {
        let mut store = store(None);
        store.insert_chunk(Chunk::new(10, 10));

        store.set_load_zone(IVec2::ZERO, 1, false);
        store.wait_for_loads(Duration::from_secs(20));

        assert_eq!(store.len(), 9);
        assert!(store.get_chunk(10, 10).is_none());
        assert!(store.get_chunk(-1, 1).is_some());
    }

    #[test]
    fn test_deferred_unload_dropped_when_zone_returns() {
        let mut store = store(None);
        store.insert_chunk(Chunk::new(0, 0));
        let ticket = store.acquire_ticket(IVec2::ZERO).unwrap();

        store.set_load_zone(IVec2::new(10, 10), 0, false);
        assert_eq!(store.deferred_unloads(), &[IVec2::ZERO]);
        store.wait_for_loads(Duration::from_secs(10));

        store.set_load_zone(IVec2::ZERO, 0, false);
        assert!(!store.deferred_unloads().contains(&IVec2::ZERO));
        store.release_ticket(ticket);
        store.process_deferred_unloads();

        assert!(store.contains(IVec2::ZERO), "chunk inside load zone was unloaded");
        assert_eq!(store.unload(0, 0), UnloadStatus::Retained);
        assert_eq!(store.load_zone(), Some((IVec2::ZERO, 1)));
    }

    #[test]
    fn test_deferred_unload_skips_retained_coords() {
        let mut store = store(None);
        store.insert_chunk(Chunk::new(0, 0));
        let ticket = store.acquire_ticket(IVec2::ZERO).unwrap();
        assert_eq!(store.unload(0, 0), UnloadStatus::Deferred);

        // Zone set while the unload is still pending
        store.zone = Some(LoadZone {
            center: IVec2::ZERO,
            retain: 0,
        });
        store.release_ticket(ticket);

        assert_eq!(store.process_deferred_unloads(), 0);
        assert!(store.contains(IVec2::ZERO));
        assert!(store.deferred_unloads().is_empty());
    }

    struct Exploding;

    impl crate::world::populators::Populator for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn phase(&self) -> u32 {
            0
        }

        fn apply(&self, hood: &mut crate::world::populators::Neighborhood) -> Vec<PlacedStructure> {
            if hood.coord() == IVec2::new(7, 7) {
                panic!("populator blew up");
            }
            Vec::new()
        }
    }

    #[test]
    fn test_failed_load_clears_in_flight() {
        let registry = Arc::new(MaterialRegistry::with_defaults());
        let mut context = LoadContext::new(registry, 42, None);
        context.pipeline = PopulatorPipeline::new();
        context.pipeline.register(Box::new(Exploding));
        let mut store = ChunkStore::new(context, 1, 1, 1).unwrap();

        store.request_load(7, 7, true, false);
        store.request_load(0, 0, true, false);
        let loaded = store.wait_for_loads(Duration::from_secs(10));

        assert_eq!(loaded, vec![IVec2::ZERO]);
        assert!(!store.is_loading(IVec2::new(7, 7)));
        assert!(!store.contains(IVec2::new(7, 7)));
        assert_eq!(store.unload(7, 7), UnloadStatus::NotResident);
        assert!(matches!(
            store.request_load(7, 7, false, false),
            LoadStatus::Dispatched | LoadStatus::Queued
        ));
    }

    #[test]
    fn test_save_all_persists_generated_chunks() {
        let registry = Arc::new(MaterialRegistry::with_defaults());
        let dir = std::env::temp_dir().join(format!("sunaba_engine_save_all_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let persistence = ChunkPersistence::new(&dir, false).unwrap();

        let mut first = ChunkStore::new(LoadContext::new(Arc::clone(&registry), 42, Some(persistence.clone())), 1, 1, 1)
            .unwrap();
        first.request_load(1, -1, true, false);
        first.request_load(2, -1, true, false);
        first.wait_for_loads(Duration::from_secs(10));
        assert_eq!(first.save_all().unwrap(), 2);
        assert_eq!(first.save_all().unwrap(), 0);
        let checksums: Vec<u64> = [(1, -1), (2, -1)]
            .iter()
            .map(|&(x, y)| first.get_chunk(x, y).unwrap().checksum())
            .collect();
        drop(first);

        let mut second = ChunkStore::new(LoadContext::new(registry, 42, Some(persistence)), 1, 1, 1).unwrap();
        second.request_load(2, -1, true, false);
        second.request_load(1, -1, true, false);
        second.wait_for_loads(Duration::from_secs(10));

        assert_eq!(second.get_chunk(1, -1).unwrap().checksum(), checksums[0]);
        assert_eq!(second.get_chunk(2, -1).unwrap().checksum(), checksums[1]);
        assert!(!second.get_chunk(1, -1).unwrap().is_dirty(DirtyFlags::PERSIST));

        ChunkPersistence::delete_world(&dir).unwrap();
    }
}
