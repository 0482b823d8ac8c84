use crate::error::PackError;
use crate::simulation::MaterialRegistry;
use crate::world::chunk::{pack_filename, Chunk};
use crate::world::pack;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// World metadata stored in world.meta file (RON format)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub world_name: String,
    pub last_opened_version: String,
    /// Unix seconds
    pub last_opened_timestamp: i64,
}

impl WorldMeta {
    /// Metadata stamped with this build's version and the current time
    pub fn opened_now(world_name: &str) -> Self {
        Self {
            world_name: world_name.to_string(),
            last_opened_version: env!("CARGO_PKG_VERSION").to_string(),
            last_opened_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Manages chunk pack and metadata files of one world directory
#[derive(Clone, Debug)]
pub struct ChunkPersistence {
    world_dir: PathBuf,
    compress: bool,
}

impl ChunkPersistence {
    /// Open (creating if needed) the world directory
    pub fn new(world_dir: impl Into<PathBuf>, compress: bool) -> Result<Self> {
        let world_dir = world_dir.into();

        std::fs::create_dir_all(world_dir.join("chunks"))
            .with_context(|| format!("Failed to create world directory {:?}", world_dir))?;

        Ok(Self {
            world_dir,
            compress,
        })
    }

    pub fn world_dir(&self) -> &Path {
        &self.world_dir
    }

    pub fn chunk_path(&self, x: i32, y: i32) -> PathBuf {
        let name = if self.compress {
            format!("{}.lz4", pack_filename(x, y))
        } else {
            pack_filename(x, y)
        };
        self.world_dir.join("chunks").join(name)
    }

    /// A pack exists, so the chunk was generated at some point
    pub fn has_pack(&self, x: i32, y: i32) -> bool {
        self.chunk_path(x, y).exists()
    }

    /// Encode and write a chunk's pack (temp file, then rename)
    pub fn save_chunk(&self, chunk: &Chunk) -> Result<()> {
        let path = self.chunk_path(chunk.x, chunk.y);

        let bytes = if self.compress {
            pack::encode_compressed(chunk)
        } else {
            pack::encode(chunk)
        }
        .with_context(|| format!("Failed to encode chunk ({}, {})", chunk.x, chunk.y))?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &bytes).context("Failed to write chunk temp file")?;
        std::fs::rename(&temp_path, &path).context("Failed to rename chunk file")?;

        log::debug!(
            "[SAVE] Chunk ({}, {}) - {} non-air tiles, {} bytes - {:?}",
            chunk.x,
            chunk.y,
            chunk.count_non_air(),
            bytes.len(),
            path
        );
        Ok(())
    }

    /// Load a chunk's pack
    ///
    /// `None` when no pack exists or the pack is unreadable; either way the
    /// caller regenerates the chunk.
    pub fn load_chunk(&self, registry: &MaterialRegistry, x: i32, y: i32) -> Option<Chunk> {
        let path = self.chunk_path(x, y);
        if !path.exists() {
            return None;
        }

        let decoded = std::fs::read(&path)
            .map_err(PackError::from)
            .and_then(|bytes| {
                if self.compress {
                    pack::decode_compressed(registry, x, y, &bytes)
                } else {
                    pack::decode(registry, x, y, &bytes)
                }
            });

        match decoded {
            Ok(chunk) => {
                log::debug!(
                    "[LOAD] Chunk ({}, {}) from disk - {} non-air tiles",
                    x,
                    y,
                    chunk.count_non_air()
                );
                Some(chunk)
            }
            Err(e) => {
                log::warn!(
                    "[LOAD] Failed to load chunk ({}, {}): {}, regenerating",
                    x,
                    y,
                    e
                );
                None
            }
        }
    }

    /// Remove a chunk's pack, if any
    pub fn delete_chunk(&self, x: i32, y: i32) -> Result<()> {
        let path = self.chunk_path(x, y);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("Failed to delete {:?}", path))?;
        }
        Ok(())
    }

    fn meta_path(&self) -> PathBuf {
        self.world_dir.join("world.meta")
    }

    /// Save world metadata to disk
    pub fn save_meta(&self, meta: &WorldMeta) -> Result<()> {
        let serialized = ron::ser::to_string_pretty(meta, Default::default())
            .context("Failed to serialize metadata")?;
        std::fs::write(self.meta_path(), serialized).context("Failed to write metadata file")?;
        log::debug!("[SAVE] World metadata for '{}'", meta.world_name);
        Ok(())
    }

    /// Load world metadata, `None` for a new or unreadable world
    pub fn load_meta(&self) -> Option<WorldMeta> {
        let path = self.meta_path();
        if !path.exists() {
            log::info!("No world metadata found, creating new world");
            return None;
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match ron::from_str(&contents) {
                Ok(meta) => {
                    log::info!("Loaded world metadata");
                    Some(meta)
                }
                Err(e) => {
                    log::warn!("Failed to parse metadata: {}, using defaults", e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read metadata: {}, using defaults", e);
                None
            }
        }
    }

    /// Delete all chunks and metadata (used by --regenerate)
    pub fn delete_world(world_dir: &Path) -> Result<()> {
        if world_dir.exists() {
            std::fs::remove_dir_all(world_dir).context("Failed to delete world directory")?;
            log::info!("Deleted world: {:?}", world_dir);
        }
        Ok(())
    }
}
