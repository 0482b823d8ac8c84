//! World management - chunks, streaming, simulation, objects, saving

pub mod biome;
mod chunk;
pub mod chunk_store;
pub mod generation;
pub mod hooks;
pub mod objects;
pub mod pack;
pub mod persistence;
pub mod populators;
pub mod rng_trait;
pub mod simulation_loop;
pub mod stats;
pub mod structure;
#[allow(clippy::module_inception)]
mod world;

pub use biome::{Biome, BiomeRegistry};
pub use chunk::{
    pack_filename, tile_index, world_to_chunk_coords, Chunk, DirtyFlags, DirtyRect,
    GenerationState, Layer, CHUNK_AREA, CHUNK_SIZE,
};
pub use chunk_store::{ChunkStore, ChunkView, LoadContext, LoadStatus, TaskTicket, UnloadStatus};
pub use generation::WorldGenerator;
pub use hooks::{NoopHooks, WorldHooks};
pub use objects::{Detachment, ExplosionReport, Island, ObjectSet, PixelGrid};
pub use persistence::{ChunkPersistence, WorldMeta};
pub use populators::{Populator, PopulatorPipeline};
pub use rng_trait::{chunk_rng, WorldRng};
pub use simulation_loop::{Activity, SimulationLoop, SimulationSettings, TickReport};
pub use stats::{NoopStats, SimStats, TickCounters};
pub use structure::{PlacedStructure, Splice, Structure, StructureTile};
pub use world::{RenderUpdate, World};
