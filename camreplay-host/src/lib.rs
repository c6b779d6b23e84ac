//! # camreplay host
//!
//! Records camera pipeline sessions to disk and replays them offline.
//!
//! This crate provides the file, process and task side of record/replay on
//! top of [`camreplay_core`]:
//! - Muxes H.264 and MJPEG streams into MP4 containers
//! - Writes metadata records to line-separated JSON logs
//! - Decodes recordings back to planar frames with ffmpeg
//! - Replays a recording set as typed pipeline messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    camreplay-host                       │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐ │
//! │  │VideoRecorder│  │ByteRecorder │  │ RecordingManager │ │
//! │  │ (Mp4Writer) │  │ (.meta)     │  │ (discovery)      │ │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘ │
//! │         │ recording task │                  │           │
//! │         ▼                ▼                  ▼           │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │  ReplayDriver (spawn_blocking)                      ││
//! │  │  - VideoPlayer (Mp4Reader + ffmpeg decoder)         ││
//! │  │  - BytePlayer (JSON record stream)                  ││
//! │  │  - camreplay_core::reconstruct                      ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example: Replaying a Recording Set
//!
//! ```rust,no_run
//! use camreplay_host::recording::{find_recording_set, start_replay, RecordedSession, ReplayOptions};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() {
//!     let set = find_recording_set(Path::new("/data/rec"), &["1844301"], &["cam"])
//!         .unwrap()
//!         .unwrap();
//!     let cam = set.stream("cam").unwrap();
//!     let session = RecordedSession::open(cam.video.as_deref(), cam.metadata.as_deref()).unwrap();
//!
//!     let (replay, mut messages) = start_replay(session, ReplayOptions::default());
//!     while let Some(message) = messages.recv().await {
//!         println!("{:?}", message.as_image().map(|f| f.sequence_num));
//!     }
//!     replay.wait().await.unwrap();
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Subcommands:
//!
//! - `record` - Mux an elementary stream (and a metadata log) into a recording
//! - `replay` - Replay a recording and print one line per message
//! - `list` - List the recordings in a directory
//! - `match` - Find the recording set of a device
//! - `export` - Write the H.264 samples of a recording as an Annex-B stream

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod config;
pub mod error;
pub mod recording;

pub use config::{check_record_config, RecordConfig};
pub use error::{ConfigError, ContainerError, DiscoveryError, DriverError, PlayerError, RecorderError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Record an encoded stream and its metadata as one recorded node
    Record(RecordArgs),
    /// Replay a recorded node
    Replay(ReplayArgs),
    /// List recordings
    List {
        /// Recordings directory (default: the user data directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Find the recording set matching a device and node names
    Match(MatchArgs),
    /// Export the video track of a recording as an Annex-B stream
    Export {
        /// Recorded MP4 container
        input: PathBuf,
        /// Output file, `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: String,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct RecordArgs {
    /// Encoded input: an Annex-B file (h264), a directory of .jpg files
    /// (mjpeg) or a file of concatenated planar frames (raw)
    pub input: PathBuf,

    /// Metadata records to record alongside, one JSON value per line
    #[arg(short, long)]
    pub metadata: Option<PathBuf>,

    /// Output directory, or a JSON record config with an `outputDir`
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Device the recording is attributed to
    #[arg(long, default_value = "local")]
    pub device_id: String,

    /// Node name of the recorded stream
    #[arg(long, default_value = "color")]
    pub node: String,

    #[arg(long)]
    pub width: u32,

    #[arg(long)]
    pub height: u32,

    /// Frame rate (default: from the record config, else 30)
    #[arg(long)]
    pub fps: Option<u32>,

    /// Input encoding (default: from the record config, else h264)
    #[arg(short, long, value_enum)]
    pub codec: Option<recording::VideoCodec>,
}

#[derive(clap::Args, Clone, Debug)]
pub struct ReplayArgs {
    /// Video container to replay
    #[arg(long)]
    pub video: Option<PathBuf>,

    /// Metadata log to replay
    #[arg(long)]
    pub metadata: Option<PathBuf>,

    /// Look the files up in this directory instead, see `match`
    #[arg(long, conflicts_with_all = ["video", "metadata"])]
    pub dir: Option<PathBuf>,

    /// Device id to match (repeatable)
    #[arg(long = "device-id", requires = "dir")]
    pub device_ids: Vec<String>,

    /// Node names the pipeline expects (repeatable); each one is replayed
    #[arg(long = "node", requires = "dir")]
    pub nodes: Vec<String>,

    /// Messages buffered between the replay thread and the printer
    #[arg(long, default_value_t = 8)]
    pub buffer: usize,
}

#[derive(clap::Args, Clone, Debug)]
pub struct MatchArgs {
    /// Recordings directory
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Visible device ids (repeatable)
    #[arg(long = "device-id", required = true)]
    pub device_ids: Vec<String>,

    /// Node names the pipeline expects (repeatable)
    #[arg(long = "node", required = true)]
    pub nodes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_replay_by_directory() {
        let cli = Cli::parse_from([
            "camreplay",
            "-v",
            "replay",
            "--dir",
            "/rec",
            "--device-id",
            "1844301",
            "--node",
            "cam",
        ]);
        let Command::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.dir, Some(PathBuf::from("/rec")));
        assert_eq!(args.device_ids, vec!["1844301"]);
        assert_eq!(args.nodes, vec!["cam"]);
        assert_eq!(args.buffer, 8);
    }

    #[test]
    fn test_cli_rejects_mixed_replay_sources() {
        assert!(Cli::try_parse_from([
            "camreplay",
            "replay",
            "--dir",
            "/rec",
            "--video",
            "a.mp4"
        ])
        .is_err());
    }

    #[test]
    fn test_cli_parses_record() {
        let cli = Cli::parse_from([
            "camreplay", "record", "in.h264", "--width", "640", "--height", "400", "-c", "mjpeg",
        ]);
        let Command::Record(args) = cli.command else {
            panic!("expected record");
        };
        assert_eq!(args.codec, Some(recording::VideoCodec::Mjpeg));
        assert_eq!(args.node, "color");
        assert!(args.fps.is_none());
    }
}
