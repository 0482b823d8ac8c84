//! Simulation statistics collection

/// Trait for collecting simulation statistics
pub trait SimStats {
    /// Record that a tile was moved during simulation
    fn record_tile_moved(&mut self);

    /// Record that a unary reaction changed a tile's material
    fn record_reaction(&mut self);

    /// Record that a pairwise interaction fired
    fn record_interaction(&mut self);

    /// Record that a tile's temperature changed
    fn record_temperature_change(&mut self);
}

/// A no-op implementation for when stats collection is not needed
#[derive(Default)]
pub struct NoopStats;

impl SimStats for NoopStats {
    fn record_tile_moved(&mut self) {}
    fn record_reaction(&mut self) {}
    fn record_interaction(&mut self) {}
    fn record_temperature_change(&mut self) {}
}

/// Per-chunk counters for one tick, summed into [`TickReport`](crate::world::TickReport)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickCounters {
    pub tiles_moved: u32,
    pub reactions: u32,
    pub interactions: u32,
    pub temperature_changes: u32,
}

impl TickCounters {
    /// Anything at all happened
    pub fn any_change(&self) -> bool {
        self.tiles_moved + self.reactions + self.interactions + self.temperature_changes > 0
    }

    pub fn merge(&mut self, other: &TickCounters) {
        self.tiles_moved += other.tiles_moved;
        self.reactions += other.reactions;
        self.interactions += other.interactions;
        self.temperature_changes += other.temperature_changes;
    }
}

impl SimStats for TickCounters {
    fn record_tile_moved(&mut self) {
        self.tiles_moved += 1;
    }

    fn record_reaction(&mut self) {
        self.reactions += 1;
    }

    fn record_interaction(&mut self) {
        self.interactions += 1;
    }

    fn record_temperature_change(&mut self) {
        self.temperature_changes += 1;
    }
}
