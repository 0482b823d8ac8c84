//! # Sunaba Engine - chunked falling-sand world simulation
//!
//! An unbounded grid of 64x64 chunks streamed around a center, ticked as a
//! cellular automaton on a worker pool, persisted as binary packs, and
//! mirrored into a rigid-body world through a message bridge.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod physics;
pub mod simulation;
pub mod world;

pub use config::EngineConfig;
pub use world::World;

/// Common imports for internal use
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::simulation::{MaterialId, MaterialInstance, MaterialRegistry, PhysicsClass};
    pub use crate::world::{Chunk, ChunkStore, DirtyFlags, World, CHUNK_SIZE};
    pub use glam::{IVec2, Vec2};
}
