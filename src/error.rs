//! Error type shared by every fallible fzsync operation

use nix::errno::Errno;
use thiserror::Error;

/// Errors that can occur while configuring or driving a pair
#[derive(Error, Debug)]
pub enum FzsyncError {
    #[error("Invalid value for {field}: {value} (expected {expected})")]
    InvalidConfig {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to spawn thread B: {0}")]
    Spawn(Errno),

    #[error("Failed to read monotonic clock: {0}")]
    Clock(Errno),

    #[error("Failed to join thread B: {0}")]
    Join(Errno),

    #[error("Failed to cancel thread B: {0}")]
    Cancel(Errno),
}

/// Result type for fzsync operations
pub type Result<T> = std::result::Result<T, FzsyncError>;
