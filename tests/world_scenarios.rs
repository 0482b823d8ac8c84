//! End-to-end scenarios: settling, reactions, generation lifecycle, unloading
//!
//! These drive the store, the simulation loop and persistence together
//! through the public API only.

use glam::IVec2;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sunaba_engine::simulation::automaton::TickOptions;
use sunaba_engine::simulation::{
    MaterialId, MaterialInstance, MaterialRef, MaterialRegistry, ReactionCondition, ReactionEngine, ReactionRule,
    ReactionRules,
};
use sunaba_engine::world::{
    Chunk, ChunkPersistence, ChunkStore, GenerationState, LoadContext, SimulationLoop,
    SimulationSettings, UnloadStatus, WorldHooks, CHUNK_SIZE,
};

fn registry() -> Arc<MaterialRegistry> {
    Arc::new(MaterialRegistry::with_defaults())
}

fn store(registry: &Arc<MaterialRegistry>, persistence: Option<ChunkPersistence>) -> ChunkStore {
    ChunkStore::new(LoadContext::new(Arc::clone(registry), 12345, persistence), 2, 2, 1).unwrap()
}

fn simulation(registry: &Arc<MaterialRegistry>, options: TickOptions) -> SimulationLoop {
    let reactions = ReactionEngine::with_defaults(registry).unwrap();
    let settings = SimulationSettings {
        options,
        ..Default::default()
    };
    SimulationLoop::new(Arc::clone(registry), Arc::new(reactions), 12345, settings).unwrap()
}

fn temp_world(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sunaba_engine_scenario_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn count(chunk: &Chunk, material: u16) -> usize {
    chunk.tiles().iter().filter(|tile| tile.material == material).count()
}

// ============================================================================
// Scenario A: a sand column settles
// ============================================================================

#[test]
fn test_sand_column_settles_within_chunk_height() {
    let registry = registry();
    let mut store = store(&registry, None);
    let mut simulation = simulation(
        &registry,
        TickOptions {
            temperature: false,
            reactions: false,
        },
    );

    let mut chunk = Chunk::new(0, 0);
    for y in 40..50 {
        chunk.set_tile(32, y, registry.instance(MaterialId::SAND));
    }
    store.insert_chunk(chunk);

    for _ in 0..CHUNK_SIZE {
        simulation.tick(&mut store);
    }

    let report = simulation.tick(&mut store);
    assert_eq!(report.counters.tiles_moved, 0);

    let chunk = store.get_chunk(0, 0).unwrap();
    assert_eq!(count(chunk, MaterialId::SAND), 10);
    assert_eq!(chunk.material(32, 0), MaterialId::SAND);
    for y in 1..CHUNK_SIZE {
        for x in 0..CHUNK_SIZE {
            if chunk.material(x, y) == MaterialId::SAND {
                assert_ne!(chunk.material(x, y - 1), MaterialId::AIR, "floating sand at ({}, {})", x, y);
            }
        }
    }
}

// ============================================================================
// Scenario B: temperature thresholds
// ============================================================================

#[test]
fn test_water_boils_and_lava_cools_once() {
    let registry = registry();
    let mut store = store(&registry, None);
    let mut simulation = simulation(
        &registry,
        TickOptions {
            temperature: false,
            reactions: true,
        },
    );

    let mut chunk = Chunk::new(0, 0);
    for x in 0..CHUNK_SIZE {
        chunk.set_tile(x, 0, registry.instance(MaterialId::STONE));
    }
    chunk.set_tile(5, 1, MaterialInstance::new(MaterialId::WATER, 0, 200));
    chunk.set_tile(20, 1, MaterialInstance::new(MaterialId::WATER, 0, 100));
    chunk.set_tile(40, 1, MaterialInstance::new(MaterialId::LAVA, 0, 300));
    chunk.set_tile(55, 1, MaterialInstance::new(MaterialId::LAVA, 0, 900));
    store.insert_chunk(chunk);

    let report = simulation.tick(&mut store);
    assert_eq!(report.counters.reactions, 2);

    let chunk = store.get_chunk(0, 0).unwrap();
    assert_eq!(count(chunk, MaterialId::STEAM), 1);
    assert_eq!(count(chunk, MaterialId::WATER), 1);
    assert_eq!(count(chunk, MaterialId::OBSIDIAN), 1);
    assert_eq!(count(chunk, MaterialId::LAVA), 1);
}

#[test]
fn test_adjacent_water_and_lava_react_on_diffused_temperature() {
    let registry = registry();
    // Obsidian is born at 300, so this rule would fire on a second pass
    let mut rules = ReactionRules::defaults();
    rules.reactions.push(ReactionRule {
        name: "obsidian_remelt".to_string(),
        material: MaterialRef::Id(MaterialId::OBSIDIAN),
        condition: ReactionCondition::TemperatureAbove(250),
        result: MaterialRef::Id(MaterialId::LAVA),
    });
    let reactions = ReactionEngine::build(&registry, &rules).unwrap();
    let mut simulation = SimulationLoop::new(
        Arc::clone(&registry),
        Arc::new(reactions),
        12345,
        SimulationSettings::default(),
    )
    .unwrap();
    let mut store = store(&registry, None);

    // One-wide shaft: lava under water, stone all around
    let mut chunk = Chunk::new(0, 0);
    for x in 9..=11 {
        chunk.set_tile(x, 0, registry.instance(MaterialId::STONE));
        chunk.set_tile(x, 3, registry.instance(MaterialId::STONE));
    }
    for y in 1..=2 {
        chunk.set_tile(9, y, registry.instance(MaterialId::STONE));
        chunk.set_tile(11, y, registry.instance(MaterialId::STONE));
    }
    // Neither crosses its threshold alone: water boils above 128, lava sets below 512
    chunk.set_tile(10, 1, MaterialInstance::new(MaterialId::LAVA, 0, 520));
    chunk.set_tile(10, 2, MaterialInstance::new(MaterialId::WATER, 0, 100));
    store.insert_chunk(chunk);

    let report = simulation.tick(&mut store);

    assert_eq!(report.counters.reactions, 2);
    let chunk = store.get_chunk(0, 0).unwrap();
    assert_eq!(chunk.material(10, 2), MaterialId::STEAM);
    assert_eq!(chunk.material(10, 1), MaterialId::OBSIDIAN);
    assert_eq!(count(chunk, MaterialId::WATER), 0);
    assert_eq!(count(chunk, MaterialId::LAVA), 0);
    assert_eq!(chunk.tile(10, 1).temperature, 300);
}

// ============================================================================
// Scenario C: generation lifecycle as seen by hooks
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    State(IVec2, GenerationState),
    Phase(IVec2, u32),
    Loaded(IVec2, bool),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl WorldHooks for Recorder {
    fn chunk_loaded(&mut self, coord: IVec2, from_pack: bool) {
        self.0.lock().unwrap().push(Event::Loaded(coord, from_pack));
    }

    fn generation_state_changed(&mut self, coord: IVec2, state: GenerationState) {
        self.0.lock().unwrap().push(Event::State(coord, state));
    }

    fn phase_populated(&mut self, coord: IVec2, phase: u32) {
        self.0.lock().unwrap().push(Event::Phase(coord, phase));
    }
}

#[test]
fn test_fresh_chunk_walks_every_generation_state() {
    let registry = registry();
    let mut store = store(&registry, None);
    let recorder = Recorder::default();
    store.set_hooks(Box::new(recorder.clone()));

    store.request_load(0, 0, true, true);
    store.wait_for_loads(Duration::from_secs(10));

    let events = recorder.0.lock().unwrap().clone();
    let states: Vec<GenerationState> = events
        .iter()
        .filter_map(|event| match event {
            Event::State(_, state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![GenerationState::Generating, GenerationState::Generated]);

    let phases: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            Event::Phase(_, phase) => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![0, 1]);
    assert_eq!(events.last(), Some(&Event::Loaded(IVec2::ZERO, false)));

    let chunk = store.get_chunk(0, 0).unwrap();
    assert_eq!(chunk.generation_state(), GenerationState::Generated);
    assert_eq!(chunk.populated_mask(), 0b11);
}

#[test]
fn test_packed_chunk_skips_populated_phases() {
    let registry = registry();
    let dir = temp_world("repack");
    let persistence = ChunkPersistence::new(&dir, false).unwrap();

    {
        let mut store = store(&registry, Some(persistence.clone()));
        store.request_load(2, 1, true, true);
        store.wait_for_loads(Duration::from_secs(10));
        assert_eq!(store.unload(2, 1), UnloadStatus::Unloaded);
    }

    let mut store = store(&registry, Some(persistence));
    let recorder = Recorder::default();
    store.set_hooks(Box::new(recorder.clone()));
    store.request_load(2, 1, true, true);
    store.wait_for_loads(Duration::from_secs(10));

    let events = recorder.0.lock().unwrap().clone();
    assert!(events.iter().all(|event| !matches!(event, Event::Phase(..))));
    assert!(events.contains(&Event::Loaded(IVec2::new(2, 1), true)));

    ChunkPersistence::delete_world(&dir).unwrap();
}

// ============================================================================
// Scenario D: unloading while tasks hold chunks
// ============================================================================

#[test]
fn test_unload_under_load_loses_nothing() {
    let registry = registry();
    let dir = temp_world("unload");
    let persistence = ChunkPersistence::new(&dir, false).unwrap();
    let mut store = store(&registry, Some(persistence));

    store.set_load_zone(IVec2::ZERO, 1, true);
    store.wait_for_loads(Duration::from_secs(20));
    assert_eq!(store.len(), 9);

    // Edit the pinned chunk so its save has something to lose
    let edited = store.get_chunk_mut(0, 0).unwrap();
    edited.set_tile(10, 10, registry.instance(MaterialId::GOLD_ORE));
    let ticket = store.acquire_ticket(IVec2::ZERO).unwrap();

    let before: HashMap<IVec2, u64> = store
        .coords()
        .into_iter()
        .map(|coord| (coord, store.get_chunk(coord.x, coord.y).unwrap().checksum()))
        .collect();

    // Inside the zone nothing may go
    assert_eq!(store.unload(1, 1), UnloadStatus::Retained);

    let far = IVec2::new(10, 10);
    store.set_load_zone(far, 0, false);
    store.wait_for_loads(Duration::from_secs(20));
    assert_eq!(store.coords(), vec![IVec2::ZERO, far]);
    assert_eq!(store.deferred_unloads(), &[IVec2::ZERO]);

    store.release_ticket(ticket);
    assert_eq!(store.process_deferred_unloads(), 1);
    assert_eq!(store.coords(), vec![far]);

    let published = store.loads_published();
    store.set_load_zone(IVec2::ZERO, 1, true);
    store.set_load_zone(IVec2::ZERO, 1, true);
    store.wait_for_loads(Duration::from_secs(20));
    assert_eq!(store.loads_published(), published + 9);
    assert_eq!(store.len(), 9);
    assert!(!store.contains(far));

    for (coord, checksum) in before {
        let chunk = store.get_chunk(coord.x, coord.y).unwrap();
        assert_eq!(chunk.checksum(), checksum, "chunk {:?} changed across unload", coord);
    }
    assert_eq!(store.get_chunk(0, 0).unwrap().material(10, 10), MaterialId::GOLD_ORE);

    ChunkPersistence::delete_world(&dir).unwrap();
}
