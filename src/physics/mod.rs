//! Bridge between the tile world and the rigid-body engine

pub mod bridge;
pub mod outline;

pub use bridge::{BodyDesc, BodyHandle, BodyKind, CollisionFilter, FixtureInfo, JobId, RigidBodyBridge};
pub use outline::{chunk_outline, trace_outline, CollisionMask, Polygon};
