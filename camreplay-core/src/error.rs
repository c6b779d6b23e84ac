//! Error types for record parsing, message reconstruction and recording matching

use thiserror::Error;

use crate::schema::RecordType;

/// Errors that can occur when turning persisted records back into messages
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// Record type has no message representation
    #[error("Unsupported record type: {0}")]
    UnsupportedRecord(RecordType),

    /// Record is missing its `type` discriminant or it is not a known value
    #[error("Invalid record type discriminant: {0}")]
    InvalidRecordType(String),

    /// Record body doesn't match the schema of its declared type
    #[error("Record deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Decoded frame doesn't have the size its metadata describes
    #[error("Frame size mismatch: {width}x{height} expects {expected} bytes, got {actual}")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// Video record arrived without frame data
    #[error("Video record {sequence} has no frame data")]
    MissingFrame { sequence: u64 },

    /// More than one device matches the expected set of streams
    #[error("Multiple recordings match the pipeline configuration: {0:?}")]
    AmbiguousRecording(Vec<String>),
}

impl From<serde_json::Error> for ReplayError {
    fn from(e: serde_json::Error) -> Self {
        ReplayError::DeserializationFailed(e.to_string())
    }
}
