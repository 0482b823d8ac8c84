//! Engine configuration with layered loading
//!
//! Configuration is loaded from multiple sources (lowest to highest priority):
//! 1. Compiled defaults
//! 2. `engine.ron` file (if exists)
//! 3. Environment variables prefixed with `SUNABA_`
//!
//! Example environment variable: `SUNABA_WORLD__SEED=7`

use crate::simulation::automaton::TickOptions;
use crate::world::SimulationSettings;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub world: WorldConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub threads: ThreadConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// World identity and streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub name: String,
    /// Directory holding one subdirectory per world
    pub worlds_dir: PathBuf,
    pub seed: u64,
    /// Chunks loaded around the center (radius 2 = 5x5 chunks)
    pub load_radius: i32,
    /// Extra chunks kept resident beyond the load radius
    pub retain_margin: i32,
    /// Write chunk packs and world metadata
    pub persistence: bool,
    /// Wrap packs in an lz4 frame
    pub compress_packs: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            worlds_dir: PathBuf::from("worlds"),
            seed: 12345,
            load_radius: 2,
            retain_margin: 1,
            persistence: true,
            compress_packs: false,
        }
    }
}

impl WorldConfig {
    pub fn world_dir(&self) -> PathBuf {
        self.worlds_dir.join(&self.name)
    }
}

/// Per-tick toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub tick_temperature: bool,
    pub tick_reactions: bool,
    pub tick_rigid_bodies: bool,
    /// Quiet ticks before a chunk is skipped
    pub stability_window: u32,
    /// Passed through to the renderer; the engine computes no light
    pub lighting: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_temperature: true,
            tick_reactions: true,
            tick_rigid_bodies: true,
            stability_window: 30,
            lighting: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    pub load_workers: usize,
    /// Load jobs handed to one worker before surplus jobs queue
    pub max_in_flight: usize,
    /// Simulation threads; 0 = one per core
    pub tick_workers: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            load_workers: 2,
            max_in_flight: 2,
            tick_workers: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NetworkMode {
    #[default]
    Singleplayer,
    Host,
    /// The server owns the world; nothing is written locally
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
}

impl EngineConfig {
    /// Load configuration with layered priority:
    /// 1. Compiled defaults (lowest priority)
    /// 2. `engine.ron` file (if exists)
    /// 3. Environment variables prefixed with `SUNABA_` (highest priority)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`EngineConfig::load`], with an explicit (required) file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Ron).required(true),
            None => File::with_name("engine").format(FileFormat::Ron).required(false),
        };

        let builder = Config::builder()
            // Layer 1: Compiled defaults
            .set_default("world.name", "default")?
            .set_default("world.seed", 12345_i64)?
            .set_default("world.load_radius", 2_i64)?
            .set_default("simulation.stability_window", 30_i64)?
            .set_default("threads.load_workers", 2_i64)?
            // Layer 2: Config file
            .add_source(file)
            // Layer 3: Environment variables (SUNABA_WORLD__SEED, etc.)
            .add_source(
                Environment::with_prefix("SUNABA")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Whether this process may write the world to disk
    pub fn writes_to_disk(&self) -> bool {
        self.world.persistence && self.network.mode != NetworkMode::Client
    }

    pub fn simulation_settings(&self) -> SimulationSettings {
        SimulationSettings {
            options: TickOptions {
                temperature: self.simulation.tick_temperature,
                reactions: self.simulation.tick_reactions,
            },
            stability_window: self.simulation.stability_window,
            workers: self.threads.tick_workers,
        }
    }
}
