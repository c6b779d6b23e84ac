//! Recording file manager.
//!
//! Handles listing, naming and deletion of recordings, and finds the
//! recording set that belongs to the devices of a running pipeline.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use camreplay_core::{match_recording_set, METADATA_SUFFIX};

use super::file_format::{Mp4Reader, TrackCodec};
use crate::config::default_recordings_dir;
use crate::error::DiscoveryError;

/// Extension of recorded video containers
pub const VIDEO_EXTENSION: &str = "mp4";

/// Get the recordings directory path
pub fn recordings_dir() -> PathBuf {
    default_recordings_dir()
}

/// Information about a recorded video file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    /// Filename (without path)
    pub filename: String,
    /// Full path to the file
    #[serde(skip_serializing)]
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// File modification time (Unix timestamp ms)
    pub modified_ms: u64,
    pub codec: TrackCodec,
    pub width: u32,
    pub height: u32,
    pub sample_count: usize,
    pub duration_ms: u64,
    /// A `.meta` log with the same stem exists
    pub has_metadata: bool,
}

/// Files of one recorded node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStream {
    pub node_name: String,
    pub video: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
}

/// Recording set matched to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSet {
    pub device_id: String,
    pub streams: Vec<RecordedStream>,
}

impl RecordingSet {
    pub fn stream(&self, node_name: &str) -> Option<&RecordedStream> {
        self.streams.iter().find(|s| s.node_name == node_name)
    }
}

fn file_names(dir: &Path) -> Result<Vec<String>, DiscoveryError> {
    let entries = fs::read_dir(dir).map_err(|source| DiscoveryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().to_str().map(String::from))
        .collect();
    names.sort();
    Ok(names)
}

/// Find the recordings in `dir` made by one of `device_ids` with exactly the
/// streams in `node_names`.
///
/// `Ok(None)` when no device matches; an error when several do.
pub fn find_recording_set<D, N>(
    dir: &Path,
    device_ids: &[D],
    node_names: &[N],
) -> Result<Option<RecordingSet>, DiscoveryError>
where
    D: AsRef<str>,
    N: AsRef<str>,
{
    let names = file_names(dir)?;
    let Some(device_id) = match_recording_set(device_ids, &names, node_names)? else {
        return Ok(None);
    };

    let streams = node_names
        .iter()
        .map(AsRef::as_ref)
        .map(|node| {
            let metadata_name = format!("{}-{}.{}", device_id, node, METADATA_SUFFIX);
            let stem = format!("{}-{}", device_id, node);
            let video = names
                .iter()
                .filter(|name| !name.ends_with(METADATA_SUFFIX))
                .find(|name| {
                    Path::new(name.as_str())
                        .file_stem()
                        .and_then(|s| s.to_str())
                        == Some(stem.as_str())
                })
                .map(|name| dir.join(name));
            let metadata = names
                .contains(&metadata_name)
                .then(|| dir.join(&metadata_name));
            RecordedStream {
                node_name: node.to_string(),
                video,
                metadata,
            }
        })
        .collect();

    info!("Replaying recordings of device {} from {}", device_id, dir.display());
    Ok(Some(RecordingSet { device_id, streams }))
}

/// Manager for recording files
pub struct RecordingManager {
    base_dir: PathBuf,
}

impl RecordingManager {
    /// Manager over the default recordings directory
    pub fn new() -> Self {
        Self::with_base_dir(recordings_dir())
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        // Ensure base directory exists
        if let Err(e) = fs::create_dir_all(&base_dir) {
            error!("Failed to create recordings directory: {}", e);
        } else {
            debug!("Recordings directory: {}", base_dir.display());
        }
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// List all readable video recordings, newest first
    pub fn list_recordings(&self) -> Vec<RecordingInfo> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };

        let mut recordings: Vec<RecordingInfo> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().is_some_and(|ext| ext == VIDEO_EXTENSION))
            .filter_map(|path| self.get_recording_info(&path))
            .collect();

        recordings.sort_by(|a, b| {
            b.modified_ms
                .cmp(&a.modified_ms)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        recordings
    }

    /// Read size and track information of one recording
    pub fn get_recording_info(&self, path: &Path) -> Option<RecordingInfo> {
        let filename = path.file_name()?.to_str()?.to_string();

        let metadata = fs::metadata(path).ok()?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let file = File::open(path).ok()?;
        let reader = match Mp4Reader::open(BufReader::new(file)) {
            Ok(reader) => reader,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                return None;
            }
        };
        let track = reader.track();

        Some(RecordingInfo {
            filename,
            path: path.to_path_buf(),
            size: metadata.len(),
            modified_ms,
            codec: track.codec,
            width: track.width,
            height: track.height,
            sample_count: reader.sample_count(),
            duration_ms: reader.duration().as_millis() as u64,
            has_metadata: path.with_extension(METADATA_SUFFIX).is_file(),
        })
    }

    pub fn get_recording_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    /// Delete a recording together with its metadata log
    pub fn delete_recording(&self, filename: &str) -> Result<(), DiscoveryError> {
        let path = self.get_recording_path(filename);

        if !path.exists() {
            return Err(DiscoveryError::NotFound(filename.to_string()));
        }

        // Ensure the path is within our base directory
        if !self.is_safe_path(&path) {
            return Err(DiscoveryError::InvalidPath(filename.to_string()));
        }

        fs::remove_file(&path)?;
        let metadata = path.with_extension(METADATA_SUFFIX);
        if metadata != path && metadata.is_file() {
            fs::remove_file(&metadata)?;
        }
        info!("Deleted recording: {}", path.display());
        Ok(())
    }

    /// Generate a unique `<prefix>_<timestamp>` stem for a new recording.
    /// Neither `<stem>.mp4` nor `<stem>.meta` exists yet.
    pub fn generate_filename(&self, prefix: Option<&str>) -> String {
        let now = chrono::Utc::now();
        let prefix = prefix.unwrap_or("recording");
        let base_name = format!("{}_{}", prefix, now.format("%Y%m%d_%H%M%S"));

        let taken = |stem: &str| {
            self.base_dir
                .join(format!("{}.{}", stem, VIDEO_EXTENSION))
                .exists()
                || self
                    .base_dir
                    .join(format!("{}.{}", stem, METADATA_SUFFIX))
                    .exists()
        };

        let mut name = base_name.clone();
        let mut counter = 1;
        while taken(&name) {
            name = format!("{}_{}", base_name, counter);
            counter += 1;
        }
        name
    }

    /// Check if a path is safely within our base directory
    fn is_safe_path(&self, path: &Path) -> bool {
        let Ok(base) = self.base_dir.canonicalize() else {
            return false;
        };
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&base),
            Err(_) => path
                .parent()
                .and_then(|parent| parent.canonicalize().ok())
                .is_some_and(|parent| parent.starts_with(&base)),
        }
    }
}

impl Default for RecordingManager {
    fn default() -> Self {
        Self::new()
    }
}
