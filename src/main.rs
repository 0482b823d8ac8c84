//! Headless driver: open a world, stream around a point, run ticks, save

use clap::Parser;
use glam::IVec2;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sunaba_engine::world::{ChunkPersistence, TickCounters};
use sunaba_engine::{EngineConfig, World};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (RON); defaults to ./engine.ron when present
    #[arg(long)]
    config: Option<PathBuf>,

    /// World name under the worlds directory
    #[arg(long)]
    world: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Ticks to run before saving and exiting
    #[arg(long, default_value_t = 600)]
    ticks: u64,

    /// Load radius in chunks around the origin
    #[arg(long)]
    radius: Option<i32>,

    /// Delete existing world and generate fresh
    #[arg(long)]
    regenerate: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = EngineConfig::load_from(args.config.as_deref())?;
    if let Some(world) = args.world {
        config.world.name = world;
    }
    if let Some(seed) = args.seed {
        config.world.seed = seed;
    }
    if let Some(radius) = args.radius {
        config.world.load_radius = radius;
    }

    if args.regenerate {
        log::info!("--regenerate flag detected, deleting existing world");
        ChunkPersistence::delete_world(&config.world.world_dir())?;
    }

    log::info!("Starting Sunaba Engine");
    let mut world = World::open(config)?;
    world.set_center(IVec2::ZERO);
    let resident = world.wait_for_loads(Duration::from_secs(30));
    log::info!("{} chunks resident", resident);

    let started = Instant::now();
    let mut totals = TickCounters::default();
    for _ in 0..args.ticks {
        let report = world.step();
        totals.merge(&report.counters);
        if report.tick % 60 == 0 {
            log::info!(
                "tick {}: {} chunks ticked, {} settled, {} particles, {:?}",
                report.tick,
                report.chunks_ticked,
                report.chunks_settled,
                report.particles,
                report.duration
            );
        }
        world.drain_render_updates();
    }

    log::info!(
        "{} ticks in {:.2?}: {} moves, {} reactions, {} interactions",
        args.ticks,
        started.elapsed(),
        totals.tiles_moved,
        totals.reactions,
        totals.interactions
    );
    world.shutdown()
}
