//! Error types for the region syncer.

use thiserror::Error;

/// Main error type for syncer operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("mismatch cluster id, need {expected} but got {got}")]
    ClusterMismatch { expected: u64, got: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Watermark store is locked by another process")]
    Locked,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Coarse status code attached to every error, in the spirit of RPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request cannot be served in the current system state.
    FailedPrecondition,
    /// The peer or the local transport is gone.
    Unavailable,
    /// Persisted or received bytes are corrupt.
    DataLoss,
    /// Caller supplied bad input.
    InvalidArgument,
    Internal,
}

impl SyncError {
    /// Status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::ClusterMismatch { .. } | SyncError::Locked => ErrorCode::FailedPrecondition,
            SyncError::Io(_) | SyncError::Transport(_) => ErrorCode::Unavailable,
            SyncError::ChecksumMismatch { .. }
            | SyncError::InvalidFormat(_)
            | SyncError::Deserialization(_) => ErrorCode::DataLoss,
            SyncError::FrameTooLarge { .. } | SyncError::InvalidConfig(_) => {
                ErrorCode::InvalidArgument
            }
            SyncError::Serialization(_) | SyncError::Worker(_) => ErrorCode::Internal,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidConfig(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for syncer operations.
pub type Result<T> = std::result::Result<T, SyncError>;
