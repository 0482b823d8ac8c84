//! Callback hooks for embedders (scripting, debug overlays)
//!
//! The engine never depends on what a hook does; every method defaults to a
//! no-op and hooks run on the thread driving the world.

use crate::world::chunk::GenerationState;
use crate::world::simulation_loop::TickReport;
use glam::IVec2;

pub trait WorldHooks: Send {
    /// A chunk entered the map
    fn chunk_loaded(&mut self, _coord: IVec2, _from_pack: bool) {}

    /// A chunk was saved and left the map
    fn chunk_unloaded(&mut self, _coord: IVec2) {}

    /// A load task moved a chunk's generation state forward
    fn generation_state_changed(&mut self, _coord: IVec2, _state: GenerationState) {}

    /// A load task finished a populator phase
    fn phase_populated(&mut self, _coord: IVec2, _phase: u32) {}

    fn tick_finished(&mut self, _report: &TickReport) {}
}

#[derive(Default)]
pub struct NoopHooks;

impl WorldHooks for NoopHooks {}
