//! Simulation systems - materials, reactions, temperature, automaton, particles

mod materials;
pub mod automaton;
pub mod particles;
pub mod reactions;
pub mod temperature;

pub use materials::{
    Emission, MaterialDefinition, MaterialId, MaterialInstance, MaterialRegistry, PhysicsClass,
};
pub use particles::{Particle, ParticleStep, ParticleSystem};
pub use reactions::{
    Interaction, InteractionKind, InteractionRule, MaterialRef, ReactionCondition, ReactionEngine,
    ReactionRule, ReactionRules, UnaryReaction,
};
