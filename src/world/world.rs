//! World - the engine facade
//!
//! One [`World::step`] runs three stages back to back: generation (finished
//! loads enter the map, queued loads are dispatched), simulation, and
//! rigid-body sync (outlines rebuilt for mesh-dirty chunks and pushed to the
//! physics thread). Pixel objects are stamped into the grid just before the
//! simulation stage and picked up right after it.

use crate::config::EngineConfig;
use crate::physics::{chunk_outline, BodyDesc, BodyHandle, BodyKind, JobId, RigidBodyBridge};
use crate::simulation::{
    MaterialId, MaterialInstance, MaterialRegistry, Particle, PhysicsClass, ReactionEngine, ReactionRules,
};
use crate::world::chunk::{world_to_chunk_coords, DirtyFlags, DirtyRect};
use crate::world::chunk_store::{ChunkStore, LoadContext, TaskTicket};
use crate::world::hooks::WorldHooks;
use crate::world::objects::{
    find_island, scorched, Detachment, ExplosionReport, Island, ObjectSet, PixelGrid, CRUMBLE_SIZE,
};
use crate::world::persistence::{ChunkPersistence, WorldMeta};
use crate::world::rng_trait::{chunk_rng, WorldRng};
use crate::world::simulation_loop::{SimulationLoop, TickReport};
use crate::world::structure::PlacedStructure;
use anyhow::{anyhow, Context, Result};
use glam::{IVec2, Vec2};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fixed rigid-body step, one per world step
const PHYSICS_DT: f32 = 1.0 / 60.0;

/// Share of non-solid tiles inside the blast that vanish instead of flying
const VAPORIZE_CHANCE: f32 = 0.6;

/// Pixels a renderer has to re-upload for one chunk
#[derive(Clone, Debug, PartialEq)]
pub struct RenderUpdate {
    pub coord: IVec2,
    pub rect: DirtyRect,
    /// Primary-layer colors inside `rect`, row-major from `rect.min_y`
    pub colors: Vec<u32>,
    /// Whole layer2 grid, when it changed
    pub layer2: Option<Vec<u32>>,
}

pub struct World {
    config: EngineConfig,
    registry: Arc<MaterialRegistry>,
    store: ChunkStore,
    simulation: SimulationLoop,
    bridge: Option<RigidBodyBridge>,
    /// Hitbox rebuilds not yet acknowledged, each pinning its chunk
    hitbox_jobs: HashMap<JobId, TaskTicket>,
    chunk_bodies: HashMap<IVec2, BodyHandle>,
    objects: ObjectSet,
    persistence: Option<ChunkPersistence>,
    center: Option<IVec2>,
}

impl World {
    /// Open (or create) the configured world with the built-in materials and rules
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, MaterialRegistry::with_defaults(), &ReactionRules::defaults())
    }

    pub fn open_with(config: EngineConfig, registry: MaterialRegistry, rules: &ReactionRules) -> Result<Self> {
        let reactions = ReactionEngine::build(&registry, rules).context("Invalid reaction rules")?;
        let registry = Arc::new(registry);

        let persistence = if config.writes_to_disk() {
            let world_dir = config.world.world_dir();
            let persistence = ChunkPersistence::new(&world_dir, config.world.compress_packs)
                .with_context(|| format!("Failed to open world directory {:?}", world_dir))?;
            if let Some(meta) = persistence.load_meta() {
                log::info!(
                    "Opening world '{}' (last opened with {} at {})",
                    meta.world_name,
                    meta.last_opened_version,
                    meta.last_opened_timestamp
                );
            }
            persistence.save_meta(&WorldMeta::opened_now(&config.world.name))?;
            Some(persistence)
        } else {
            log::info!("Persistence disabled ({:?} mode)", config.network.mode);
            None
        };

        let context = LoadContext::new(Arc::clone(&registry), config.world.seed, persistence.clone());
        let store = ChunkStore::new(
            context,
            config.threads.load_workers,
            config.threads.max_in_flight,
            config.world.retain_margin,
        )
        .context("Failed to start load workers")?;

        let simulation = SimulationLoop::new(
            Arc::clone(&registry),
            Arc::new(reactions),
            config.world.seed,
            config.simulation_settings(),
        )
        .context("Failed to start simulation pool")?;

        let bridge = if config.simulation.tick_rigid_bodies {
            Some(RigidBodyBridge::spawn().context("Failed to start physics thread")?)
        } else {
            None
        };

        log::info!(
            "World '{}' ready (seed {}, {} materials)",
            config.world.name,
            config.world.seed,
            registry.len()
        );

        Ok(Self {
            config,
            registry,
            store,
            simulation,
            bridge,
            hitbox_jobs: HashMap::new(),
            chunk_bodies: HashMap::new(),
            objects: ObjectSet::new(),
            persistence,
            center: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MaterialRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChunkStore {
        &mut self.store
    }

    pub fn simulation(&self) -> &SimulationLoop {
        &self.simulation
    }

    pub fn bridge(&self) -> Option<&RigidBodyBridge> {
        self.bridge.as_ref()
    }

    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn WorldHooks>) {
        self.store.set_hooks(hooks);
    }

    /// Stream chunks around `center` and tick only those within the load radius
    pub fn set_center(&mut self, center: IVec2) {
        let radius = self.config.world.load_radius;
        self.center = Some(center);
        self.store.set_load_zone(center, radius, true);
        self.simulation.set_tick_zone(center, radius);
    }

    pub fn center(&self) -> Option<IVec2> {
        self.center
    }

    /// Block until every requested chunk is resident
    pub fn wait_for_loads(&mut self, timeout: Duration) -> usize {
        self.store.wait_for_loads(timeout).len()
    }

    /// Generation, then simulation, then rigid-body sync
    pub fn step(&mut self) -> TickReport {
        let loaded = self.store.process_loads();
        if !loaded.is_empty() {
            log::debug!("[LOAD] {} chunks became resident", loaded.len());
        }
        self.store.process_deferred_unloads();

        if let Some(bridge) = self.bridge.as_ref() {
            if !self.objects.is_empty() {
                let stamp = self.objects.stamp(bridge, &mut self.store, &self.registry);
                for particle in stamp.displaced {
                    self.simulation.spawn_particle(particle);
                }
                for coord in stamp.touched {
                    self.store.mark_disturbed(coord);
                }
            }
        }

        let report = self.simulation.tick(&mut self.store);

        if let Some(bridge) = self.bridge.as_mut() {
            if !self.objects.is_empty() {
                let lost = self.objects.pick_up(bridge, &mut self.store);
                if lost > 0 {
                    log::trace!("[OBJECT] {} pixels lost this step", lost);
                }
            }
        }
        self.store.hooks_mut().tick_finished(&report);

        self.sync_rigid_bodies();
        report
    }

    /// Rebuild outlines of mesh-dirty chunks and mirror them as static bodies
    pub fn sync_rigid_bodies(&mut self) {
        if let Some(bridge) = self.bridge.as_ref() {
            for job in bridge.poll_completions() {
                if let Some(ticket) = self.hitbox_jobs.remove(&job) {
                    self.store.release_ticket(ticket);
                }
            }
        }

        let stale: Vec<IVec2> = self
            .chunk_bodies
            .keys()
            .filter(|coord| !self.store.contains(**coord))
            .copied()
            .collect();
        for coord in stale {
            if let (Some(handle), Some(bridge)) = (self.chunk_bodies.remove(&coord), self.bridge.as_ref()) {
                if let Err(e) = bridge.destroy_body(handle) {
                    log::warn!("[PHYSICS] Failed to destroy body of chunk {:?}: {}", coord, e);
                }
            }
        }

        let dirty: Vec<IVec2> = self
            .store
            .chunks()
            .filter(|chunk| chunk.is_dirty(DirtyFlags::MESH))
            .map(|chunk| chunk.coord())
            .collect();

        for coord in dirty {
            let Some(chunk) = self.store.get_chunk_mut(coord.x, coord.y) else {
                continue;
            };
            let outline = chunk_outline(chunk, &self.registry);
            chunk.set_mesh(outline.clone());

            let Some(bridge) = self.bridge.as_mut() else {
                continue;
            };
            let pending_job = match chunk.rigid_body {
                Some(handle) => match bridge.update_hitbox(handle, outline) {
                    Ok(job) => Some(job),
                    Err(e) => {
                        log::warn!("[PHYSICS] Hitbox update for chunk {:?} failed: {}", coord, e);
                        None
                    }
                },
                None if !outline.is_empty() => {
                    let desc = BodyDesc::new(BodyKind::Static, chunk.origin().as_vec2(), outline);
                    match bridge.create_body(desc) {
                        Ok(handle) => {
                            chunk.rigid_body = Some(handle);
                            // A chunk reloaded between syncs leaves its old body behind
                            if let Some(old) = self.chunk_bodies.insert(coord, handle) {
                                if let Err(e) = bridge.destroy_body(old) {
                                    log::warn!("[PHYSICS] Failed to destroy body of chunk {:?}: {}", coord, e);
                                }
                            }
                        }
                        Err(e) => log::warn!("[PHYSICS] Body for chunk {:?} not created: {}", coord, e),
                    }
                    None
                }
                None => None,
            };

            if let Some(job) = pending_job {
                if let Some(ticket) = self.store.acquire_ticket(coord) {
                    self.hitbox_jobs.insert(job, ticket);
                }
            }
        }

        if self.config.simulation.tick_rigid_bodies {
            if let Some(bridge) = self.bridge.as_ref() {
                if let Err(e) = bridge.step(PHYSICS_DT) {
                    log::error!("[PHYSICS] Step failed: {}", e);
                }
            }
        }
    }

    /// Hitbox rebuilds still waiting for the physics thread
    pub fn pending_hitbox_jobs(&self) -> usize {
        self.hitbox_jobs.len()
    }

    /// Collect render-dirty chunks and clear their render flags
    pub fn drain_render_updates(&mut self) -> Vec<RenderUpdate> {
        let mut updates = Vec::new();
        for chunk in self.store.chunks_mut() {
            let layer2 = chunk.is_dirty(DirtyFlags::LAYER2).then(|| {
                chunk.clear_dirty(DirtyFlags::LAYER2);
                chunk.layer2().iter().map(|tile| tile.color).collect()
            });
            let Some(rect) = chunk.take_render_update() else {
                if layer2.is_some() {
                    updates.push(RenderUpdate {
                        coord: chunk.coord(),
                        rect: DirtyRect::full(),
                        colors: chunk.pixel_colors(),
                        layer2,
                    });
                }
                continue;
            };

            let colors = (rect.min_y..=rect.max_y)
                .flat_map(|y| (rect.min_x..=rect.max_x).map(move |x| (x, y)))
                .map(|(x, y)| chunk.tile(x, y).color)
                .collect();
            updates.push(RenderUpdate {
                coord: chunk.coord(),
                rect,
                colors,
                layer2,
            });
        }
        updates.sort_unstable_by_key(|update| (update.coord.y, update.coord.x));
        updates
    }

    /// Tile at world coordinates, `None` if its chunk is not resident
    pub fn tile(&self, world_x: i32, world_y: i32) -> Option<MaterialInstance> {
        let (coord, x, y) = world_to_chunk_coords(world_x, world_y);
        self.store.get_chunk(coord.x, coord.y).map(|chunk| *chunk.tile(x, y))
    }

    /// Replace the tile at world coordinates with a fresh `material` tile
    pub fn set_tile(&mut self, world_x: i32, world_y: i32, material: u16) -> bool {
        if !self.registry.contains(material) {
            debug_assert!(false, "unregistered material {}", material);
            return false;
        }
        let (coord, x, y) = world_to_chunk_coords(world_x, world_y);
        let instance = self.registry.instance(material);
        let Some(chunk) = self.store.get_chunk_mut(coord.x, coord.y) else {
            log::warn!("set_tile: chunk {:?} not loaded (world: {}, {})", coord, world_x, world_y);
            return false;
        };
        chunk.replace_tile(&self.registry, x, y, instance);
        self.store.mark_disturbed(coord);
        true
    }

    /// Remove the tile at `cell`, leaving air
    fn take_tile(&mut self, cell: IVec2) -> Option<MaterialInstance> {
        let (coord, x, y) = world_to_chunk_coords(cell.x, cell.y);
        let chunk = self.store.get_chunk_mut(coord.x, coord.y)?;
        let tile = *chunk.tile(x, y);
        chunk.replace_tile(&self.registry, x, y, MaterialInstance::air());
        self.store.mark_disturbed(coord);
        Some(tile)
    }

    pub fn spawn_particle(&mut self, particle: Particle) {
        self.simulation.spawn_particle(particle);
    }

    /// Turn `grid` into a dynamic pixel object
    pub fn spawn_object(&mut self, grid: PixelGrid) -> Result<BodyHandle> {
        let bridge = self
            .bridge
            .as_mut()
            .ok_or_else(|| anyhow!("Rigid bodies are disabled"))?;
        Ok(self.objects.spawn(bridge, grid)?)
    }

    /// Cut the solid island containing `at` loose from the terrain
    ///
    /// `None` when `at` is not solid. Small islands, and every island when
    /// rigid bodies are off, crumble into particles.
    pub fn detach_island(&mut self, at: IVec2) -> Option<Detachment> {
        let cells = match find_island(&self.store, &self.registry, at) {
            Island::Empty => return None,
            Island::Anchored => return Some(Detachment::Anchored),
            Island::Floating(cells) => cells,
        };

        if cells.len() <= CRUMBLE_SIZE || self.bridge.is_none() {
            for &cell in &cells {
                if let Some(tile) = self.take_tile(cell) {
                    let position = cell.as_vec2() + Vec2::splat(0.5);
                    self.simulation.spawn_particle(Particle::new(tile, position, Vec2::ZERO));
                }
            }
            log::debug!("[OBJECT] Island at {:?} crumbled into {} particles", at, cells.len());
            return Some(Detachment::Crumbled(cells.len()));
        }

        let grid = PixelGrid::from_cells(&cells, |cell| self.take_tile(cell))?;
        match self.spawn_object(grid.clone()) {
            Ok(handle) => Some(Detachment::Object(handle)),
            Err(e) => {
                log::error!("[OBJECT] Island at {:?} could not become an object: {:#}", at, e);
                self.restore(&grid);
                Some(Detachment::Anchored)
            }
        }
    }

    fn restore(&mut self, grid: &PixelGrid) {
        for y in 0..grid.height {
            for x in 0..grid.width {
                let Some(tile) = grid.get(x, y) else {
                    continue;
                };
                let cell = grid.origin + IVec2::new(x as i32, y as i32);
                let (coord, lx, ly) = world_to_chunk_coords(cell.x, cell.y);
                if let Some(chunk) = self.store.get_chunk_mut(coord.x, coord.y) {
                    chunk.replace_tile(&self.registry, lx, ly, *tile);
                }
            }
        }
    }

    /// Blast a crater of `radius` tiles around `center`
    ///
    /// Solids inside the radius vanish; other tiles there either vanish or
    /// fly out scorched. Loose tiles out to twice the radius are thrown
    /// too, then any solid island the crater cut off is detached. Bedrock
    /// and object pixels are untouched.
    pub fn explode(&mut self, center: IVec2, radius: i32) -> ExplosionReport {
        let mut report = ExplosionReport::default();
        let (coord, _, _) = world_to_chunk_coords(center.x, center.y);
        let mut rng = chunk_rng(self.config.world.seed, coord.x, coord.y, self.simulation.tick_count());
        let outer = radius * 2;
        let mut rim = Vec::new();

        for y in center.y - outer..=center.y + outer {
            for x in center.x - outer..=center.x + outer {
                let cell = IVec2::new(x, y);
                let Some(tile) = self.tile(x, y) else {
                    continue;
                };
                let class = self.registry.physics_class(tile.material);
                if matches!(class, PhysicsClass::Air | PhysicsClass::Object) || tile.material == MaterialId::BEDROCK {
                    continue;
                }

                let offset = cell - center;
                let distance = offset.length_squared();

                if distance < radius * radius {
                    if class == PhysicsClass::Solid || rng.chance(VAPORIZE_CHANCE) {
                        self.take_tile(cell);
                        report.cleared += 1;
                    } else {
                        let mut flying = tile;
                        flying.color = scorched(tile.color);
                        let velocity = fling(offset, &mut rng);
                        self.take_tile(cell);
                        let position = cell.as_vec2() + Vec2::new(0.5, 1.5);
                        self.simulation.spawn_particle(Particle::new(flying, position, velocity));
                        report.flung += 1;
                    }
                } else if distance < outer * outer && class != PhysicsClass::Solid {
                    let velocity = fling(offset, &mut rng);
                    self.take_tile(cell);
                    let position = cell.as_vec2() + Vec2::splat(0.5);
                    self.simulation.spawn_particle(Particle::new(tile, position, velocity));
                    report.flung += 1;
                } else if class == PhysicsClass::Solid && distance < (radius + 2) * (radius + 2) {
                    rim.push(cell);
                }
            }
        }

        for cell in rim {
            if let Some(detached @ (Detachment::Crumbled(_) | Detachment::Object(_))) = self.detach_island(cell) {
                report.detached.push(detached);
            }
        }

        log::debug!(
            "[WORLD] Explosion at {:?} r{}: {} cleared, {} flung, {} detached",
            center,
            radius,
            report.cleared,
            report.flung,
            report.detached.len()
        );
        report
    }

    pub fn place_structure(&mut self, structure: &PlacedStructure) -> usize {
        self.store.place_structure(structure)
    }

    /// Save point: dirty chunks plus world metadata
    pub fn save(&mut self) -> Result<usize> {
        let saved = self.store.save_all().context("Failed to save chunks")?;
        if let Some(persistence) = self.persistence.as_ref() {
            persistence.save_meta(&WorldMeta::opened_now(&self.config.world.name))?;
        }
        Ok(saved)
    }

    /// Finish loads, save, and stop the physics thread
    pub fn shutdown(mut self) -> Result<()> {
        self.store.wait_for_loads(Duration::from_secs(10));
        let saved = self.save()?;

        let pending = self.store.pending_splice_count();
        if pending > 0 {
            log::info!("[SAVE] Dropping {} splices for never-generated chunks", pending);
        }
        if let Some(mut bridge) = self.bridge.take() {
            self.objects.clear(&bridge);
            bridge.shutdown();
        }
        log::info!("World '{}' closed, {} chunks saved", self.config.world.name, saved);
        Ok(())
    }
}

/// Outward launch velocity for a tile `offset` from the blast center
fn fling(offset: IVec2, rng: &mut impl WorldRng) -> Vec2 {
    Vec2::new(
        offset.x as f32 / 10.0 + rng.jitter(0.5),
        offset.y as f32 / 6.0 + rng.jitter(0.5),
    )
}
