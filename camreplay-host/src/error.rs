//! Error types for the host side of record and replay.

use std::io;
use std::path::PathBuf;

use camreplay_core::{RecordType, ReplayError};
use thiserror::Error;

/// Errors from the MP4 writer and reader
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid container: {0}")]
    Invalid(String),

    #[error("Unsupported sample entry '{0}'")]
    UnsupportedCodec(String),

    #[error("Container already has a video track")]
    TrackExists,

    #[error("No track with id {0}")]
    NoSuchTrack(u32),
}

/// Errors from `VideoRecorder` and `ByteRecorder`
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recorder is already initialized")]
    AlreadyInitialized,

    #[error("Recorder is not initialized")]
    NotInitialized,

    #[error("Output path is empty")]
    EmptyPath,

    #[error("Invalid frame size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("Invalid frame rate {0}")]
    InvalidFps(u32),

    #[error("No image sequence writer available for raw frames: {0}")]
    RawWriterUnavailable(String),

    #[error("Raw frame is {actual} bytes, expected {expected}")]
    RawFrameSize { expected: usize, actual: usize },

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from `VideoPlayer` and `BytePlayer`
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Recording not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed metadata record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that end a replay session
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Neither a video nor a metadata source could be opened")]
    NoSources,

    #[error("{0} records need a video source, but none is open")]
    MissingVideoSource(RecordType),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("Source read failed: {0}")]
    Player(#[from] PlayerError),

    #[error("Replay task failed: {0}")]
    Task(String),
}

/// Errors from directory scans and recording management
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Cannot read recordings directory {}: {source}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("Recording not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors loading recording configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
