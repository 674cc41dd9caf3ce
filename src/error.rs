use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::Rank;

/// Failure taxonomy for the mesh. "Nothing queued yet" is a negative probe
/// result, not an error, and never appears here.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid rank {rank} (group size {group_size})")]
    InvalidRank { rank: Rank, group_size: u32 },

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("size mismatch: expected {expected} bytes, wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
