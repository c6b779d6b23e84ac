//! Camera session recording and replay.
//!
//! This module provides functionality to:
//! - Record encoded video into MP4 containers and metadata into `.meta` logs
//! - Replay a recorded session as a stream of pipeline messages
//! - Manage recording files (list, name, delete) and match them to devices
//!
//! ## Recording Set
//!
//! Each recorded node produces two files sharing a stem:
//!
//! ```text
//! <deviceId>-<nodeName>.mp4    ftyp | mdat (samples) | moov (sample tables)
//! <deviceId>-<nodeName>.meta   one JSON record per line
//! ```
//!
//! ## Replay
//!
//! ```text
//! .mp4 ──► VideoPlayer (ffmpeg) ──┐
//!                                 ├──► ReplayDriver ──► mpsc::Receiver<ReplayMessage>
//! .meta ─► BytePlayer ────────────┘
//! ```

pub mod ffmpeg;
pub mod file_format;
pub mod manager;
pub mod player;
pub mod recorder;
pub mod replay;
pub mod writer;

pub use file_format::{Mp4Reader, Mp4Writer, SampleInfo, Track, TrackCodec};
pub use manager::{
    find_recording_set, recordings_dir, RecordedStream, RecordingInfo, RecordingManager,
    RecordingSet,
};
pub use player::{BytePlayer, RecordSource, VideoPlayer, VideoSource};
pub use recorder::{
    start_recording, ActiveRecording, CapturedItem, RecordingState, RecordingStatus,
    RecordingTarget,
};
pub use replay::{
    start_replay, ActiveReplay, RecordedSession, ReplayDriver, ReplayOptions, ReplayPhase,
    ReplayProgress, ReplayState, ReplayStatus,
};
pub use writer::{ByteRecorder, MuxerConfig, RecorderStats, VideoCodec, VideoRecorder};
