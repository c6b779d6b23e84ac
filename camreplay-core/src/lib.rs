//! # camreplay core
//!
//! Platform-independent logic for recording and replaying camera pipeline
//! sessions.
//!
//! This crate contains pure parsing and mapping logic with **no file, process
//! or async dependencies**. Everything that touches the filesystem (container
//! muxing, decoding, directory scans) lives in `camreplay-host`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  camreplay-core (pure, no I/O)                             │
//! │  ├── nal/          (Annex-B NAL unit scanning)             │
//! │  ├── schema/       (versioned metadata records)            │
//! │  ├── reconstruct/  (record + frame -> pipeline message)    │
//! │  └── matcher/      (recording set <-> device matching)     │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲
//!    ┌────────────┴────────────┐
//!    │  camreplay-host         │
//!    │  (MP4 mux/demux,        │
//!    │   players, replay task) │
//!    └─────────────────────────┘
//! ```
//!
//! ## Example: Scanning an Encoded Frame
//!
//! ```rust
//! use camreplay_core::nal::{NalScanner, NalType};
//!
//! let frame = [0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f, 0, 0, 0, 1, 0x65, 0x88];
//! let types: Vec<NalType> = NalScanner::new(&frame).map(|n| n.kind()).collect();
//! assert_eq!(types, vec![NalType::Sps, NalType::I]);
//! ```
//!
//! ## Example: Matching a Recording
//!
//! ```rust
//! use camreplay_core::matcher::match_recording_set;
//!
//! let device = match_recording_set(
//!     &["1844301"],
//!     &["1844301-cam.mp4", "1844301-cam.meta"],
//!     &["cam"],
//! ).unwrap();
//! assert_eq!(device.as_deref(), Some("1844301"));
//! ```

pub mod error;
pub mod matcher;
pub mod message;
pub mod nal;
pub mod reconstruct;
pub mod schema;

// Re-export commonly used types
pub use error::ReplayError;
pub use matcher::{match_recording_set, DeviceRecordingSet, METADATA_SUFFIX};
pub use message::{CameraState, ImgFrame, ImuData, ImuPacket, ImuReport, ReplayMessage};
pub use nal::{frame_type, FrameType, NalScanner, NalType, NalUnit};
pub use reconstruct::{image_message, imu_message, quaternion_to_euler, reconstruct};
pub use schema::{
    CameraSettings, ImuRecord, MetadataRecord, RecordType, Timestamp, VideoRecord, SCHEMA_VERSION,
};
