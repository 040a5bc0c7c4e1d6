//! Error types for the stream recorder

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors. All of these are fatal and reported before capture starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File name prefix is not set")]
    PrefixMissing,

    #[error("Prefix is longer than {max} characters ({len})")]
    PrefixTooLong { len: usize, max: usize },

    #[error("Rotation interval must be at least one second")]
    InvalidRotation,

    #[error("Input address is invalid: {0}")]
    InvalidInput(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Can not use output directory {path}: {reason}")]
    OutputDir { path: PathBuf, reason: String },

    #[error("Packet capacity {capacity} can not hold a {datagram} byte datagram")]
    PacketCapacity { capacity: usize, datagram: usize },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Network input errors
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Can not resolve {host}:{port}: {reason}")]
    Resolve { host: String, port: u16, reason: String },

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Multicast join failed: {0}")]
    JoinFailed(String),
}

/// Output file errors. Logged by the writer, never fatal.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Can't create output file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Can't append to output file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Can't create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Buffer pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Can't alloc {bytes} bytes")]
    Exhausted { bytes: usize },
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
