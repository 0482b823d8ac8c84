//! Chunk pack codec
//!
//! Layout (little-endian, fixed-width integers, no length prefixes):
//! header {width u16, height u16, populated u32}, then the primary grid and
//! the layer2 grid, each `width * height` records of
//! {material u16, color u32, temperature i32}. Tile identity is not stored.

use crate::error::PackError;
use crate::simulation::{MaterialInstance, MaterialRegistry};
use crate::world::chunk::{Chunk, CHUNK_AREA, CHUNK_SIZE};
use bincode_next::config::Config;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Size of an encoded pack in bytes
pub const PACK_SIZE: usize = HEADER_SIZE + 2 * CHUNK_AREA * RECORD_SIZE;

const HEADER_SIZE: usize = 2 + 2 + 4;
const RECORD_SIZE: usize = 2 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PackHeader {
    width: u16,
    height: u16,
    populated: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TileRecord {
    material: u16,
    color: u32,
    temperature: i32,
}

impl From<&MaterialInstance> for TileRecord {
    fn from(tile: &MaterialInstance) -> Self {
        Self {
            material: tile.material,
            color: tile.color,
            temperature: tile.temperature,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ChunkPack {
    header: PackHeader,
    #[serde(with = "BigArray")]
    tiles: [TileRecord; CHUNK_AREA],
    #[serde(with = "BigArray")]
    layer2: [TileRecord; CHUNK_AREA],
}

fn pack_config() -> impl Config {
    bincode_next::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn records(tiles: &[MaterialInstance]) -> [TileRecord; CHUNK_AREA] {
    let mut out = [TileRecord::default(); CHUNK_AREA];
    for (record, tile) in out.iter_mut().zip(tiles) {
        *record = TileRecord::from(tile);
    }
    out
}

fn instances(
    registry: &MaterialRegistry,
    records: &[TileRecord],
) -> Result<Vec<MaterialInstance>, PackError> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            if !registry.contains(record.material) {
                return Err(PackError::UnknownMaterial {
                    id: record.material,
                    index,
                });
            }
            Ok(MaterialInstance::new(
                record.material,
                record.color,
                record.temperature,
            ))
        })
        .collect()
}

fn decode_pack(bytes: &[u8]) -> Result<ChunkPack, PackError> {
    let config = pack_config();
    let (header, _): (PackHeader, usize) = bincode_next::serde::decode_from_slice(bytes, config)?;
    if header.width as usize != CHUNK_SIZE || header.height as usize != CHUNK_SIZE {
        return Err(PackError::Dimensions {
            width: header.width,
            height: header.height,
            expected: CHUNK_SIZE,
        });
    }

    let (pack, read): (ChunkPack, usize) = bincode_next::serde::decode_from_slice(bytes, config)?;
    if read != bytes.len() {
        return Err(PackError::TrailingBytes(bytes.len() - read));
    }
    Ok(pack)
}

/// Encode a chunk's tiles, layer2 and populated mask
pub fn encode(chunk: &Chunk) -> Result<Vec<u8>, PackError> {
    let pack = ChunkPack {
        header: PackHeader {
            width: CHUNK_SIZE as u16,
            height: CHUNK_SIZE as u16,
            populated: chunk.populated_mask(),
        },
        tiles: records(chunk.tiles()),
        layer2: records(chunk.layer2()),
    };
    Ok(bincode_next::serde::encode_to_vec(&pack, pack_config())?)
}

/// Decode a pack into a fresh chunk at `(x, y)`
///
/// The chunk comes back `NotGenerated` with clean dirty flags; the caller
/// decides how far generation still has to go.
pub fn decode(
    registry: &MaterialRegistry,
    x: i32,
    y: i32,
    bytes: &[u8],
) -> Result<Chunk, PackError> {
    let pack = decode_pack(bytes)?;
    let tiles = instances(registry, &pack.tiles)?;
    let layer2 = instances(registry, &pack.layer2)?;
    Ok(Chunk::from_parts(x, y, tiles, layer2, pack.header.populated))
}

/// Encode, then wrap in a size-prepended lz4 frame
pub fn encode_compressed(chunk: &Chunk) -> Result<Vec<u8>, PackError> {
    Ok(lz4_flex::compress_prepend_size(&encode(chunk)?))
}

pub fn decode_compressed(
    registry: &MaterialRegistry,
    x: i32,
    y: i32,
    bytes: &[u8],
) -> Result<Chunk, PackError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)?;
    decode(registry, x, y, &raw)
}
