//! Error types for the multi-client PCM engine

use thiserror::Error;

use crate::audio::SampleFormat;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Mix buffer error: {0}")]
    Mix(#[from] MixError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Multi error: {0}")]
    Multi(#[from] MultiError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mix buffer errors
#[derive(Error, Debug)]
pub enum MixError {
    #[error("Unable to allocate {bytes} bytes for mix buffer")]
    Allocation { bytes: usize },

    #[error("Unsupported mix format: {0:?}")]
    UnsupportedFormat(SampleFormat),

    #[error("Invalid mix geometry: {0}")]
    InvalidGeometry(String),
}

/// Per-client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Unable to allocate client buffer of {0} bytes")]
    Allocation(usize),

    #[error("Event registration failed: {0}")]
    Register(std::io::Error),

    #[error("Drain timer creation failed: {0}")]
    Timer(std::io::Error),
}

/// Errors surfaced by the multi-client orchestrator
#[derive(Error, Debug)]
pub enum MultiError {
    #[error("Maximum clients reached: {0}")]
    TooManyClients(usize),

    #[error("Multi-client support is not initialized")]
    NotInitialized,

    #[error("Transport PCM signalling descriptor is closed")]
    BadDescriptor,

    #[error("Unable to start multi thread: {0}")]
    ThreadSpawn(std::io::Error),

    #[error("Event loop setup failed: {0}")]
    EventLoop(std::io::Error),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
