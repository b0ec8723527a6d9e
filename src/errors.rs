//! Error types for the Zombiegram protocol stack.
//!
//! Split by layer: USMS text codec, Zombiegram wire codec, router/mesh and
//! the configuration datastore. The receive task and the maintenance worker
//! act as firewalls and never let any of these escape; only the public
//! synchronous APIs surface them to callers.

use thiserror::Error;

/// Failures of the 6-bit USMS text codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsmsError {
    /// Input character (encode side) outside the 6-bit alphabet.
    #[error("character {0:?} is not part of the USMS alphabet")]
    CharacterOutOfRange(char),

    /// Decoded 6-bit index (decode side) outside the alphabet.
    #[error("unknown character index [{0}]")]
    IndexOutOfRange(u8),

    /// Message longer than the 70-character USMS limit.
    #[error("{given} chars given, maximum of {max} allowed")]
    SizeTooLarge { given: usize, max: usize },
}

/// Failures of the Zombiegram wire codec, both parse and build side.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZombiegramError {
    /// Frame not larger than the 10-byte header, i.e. no payload attached.
    #[error("frame of [{len}] bytes is smaller than or equal to the 10-byte header")]
    TooShort { len: usize },

    /// Frame larger than the 64-byte protocol maximum.
    #[error("frame of [{len}] bytes exceeds the 64-byte maximum")]
    Oversize { len: usize },

    /// Payload area contains an opcode outside the opcode table.
    #[error("frame payload contains unknown opcode [{0}]")]
    UnknownOpcode(u8),

    /// Payload body shorter than its opcode demands.
    #[error("payload with opcode [{opcode}] is truncated")]
    Truncated { opcode: u8 },

    /// Adding the payload would push the frame past 64 bytes.
    #[error("payload of [{payload}] bytes exceeds the 64-byte maximum (current size [{current}])")]
    PayloadOverflow { current: usize, payload: usize },

    /// A non-combinable payload may never share a frame with another payload.
    #[error("frame contains a payload that does not allow piggybacking")]
    PiggybackProhibited,

    /// A header or payload field outside its protocol range.
    #[error("{field} out of range: [{value}]")]
    FieldOutOfRange { field: &'static str, value: u32 },

    #[error(transparent)]
    Usms(#[from] UsmsError),
}

/// Failures surfaced by the router's public API.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Mesh not connected or no neighbors reachable.
    #[error("LoRa zombie mesh is not yet available")]
    MeshNotReady,

    /// A sequence number collided inside a per-source retransmission cache.
    #[error("cache item with seq_num [{seq_num}] causes a collision; are items not being removed?")]
    AckCacheCollision { seq_num: u8 },

    #[error(transparent)]
    Protocol(#[from] ZombiegramError),
}

/// Failures of the JSON configuration datastore.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration datastore I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}
