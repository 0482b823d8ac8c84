use thiserror::Error;

/// Malformed material or reaction definitions, detected while building the
/// reaction tables. Fatal: the engine refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rule '{rule}' references unregistered material id {id}")]
    UnknownMaterialId { rule: String, id: u16 },

    #[error("rule '{rule}' references unknown material '{name}'")]
    UnknownMaterialName { rule: String, name: String },

    #[error("interaction '{rule}' has negative radius {radius}")]
    NegativeRadius { rule: String, radius: i32 },

    #[error("interaction '{rule}' has out-of-range tier {tier}")]
    TierOutOfRange { rule: String, tier: u32 },

    #[error("material registry is empty")]
    EmptyRegistry,

    #[error("material '{0}' is already registered")]
    DuplicateMaterial(String),

    #[error("material registry is full ({0} materials)")]
    RegistryFull(usize),
}

/// Unreadable or malformed chunk pack. The store treats the chunk as absent
/// and regenerates it.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("pack I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode pack: {0}")]
    Encode(#[from] bincode_next::error::EncodeError),

    #[error("failed to decode pack: {0}")]
    Decode(#[from] bincode_next::error::DecodeError),

    #[error("failed to decompress pack: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("pack is {width}x{height}, expected {expected}x{expected}")]
    Dimensions { width: u16, height: u16, expected: usize },

    #[error("pack has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("unknown material id {id} at tile {index}")]
    UnknownMaterial { id: u16, index: usize },
}

/// Failures talking to the physics owner thread
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("physics thread is gone")]
    Disconnected,

    #[error("unknown body handle {0}")]
    UnknownBody(u64),

    #[error("body has no shapes and no collision mask")]
    NoShape,
}
