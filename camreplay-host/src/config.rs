//! Recording configuration and default locations.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::recording::VideoCodec;

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "camreplay", "camreplay")
}

/// `<data_dir>/recordings`, or `./recordings` when no home directory exists
pub fn default_recordings_dir() -> PathBuf {
    get_project_dirs()
        .map(|dirs| dirs.data_dir().join("recordings"))
        .unwrap_or_else(|| PathBuf::from("./recordings"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoEncoding {
    pub enabled: bool,
    pub codec: VideoCodec,
    pub fps: u32,
}

impl Default for VideoEncoding {
    fn default() -> Self {
        Self {
            enabled: true,
            codec: VideoCodec::H264,
            fps: 30,
        }
    }
}

/// Where and how to record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordConfig {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub video_encoding: VideoEncoding,
}

impl RecordConfig {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            video_encoding: VideoEncoding::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Resolve a record path into a config. A directory is used as the output
/// directory as is; a `.json` file is loaded and its `outputDir` must be an
/// existing directory. Anything else disables recording.
pub fn check_record_config(path: &Path) -> Option<RecordConfig> {
    if !path.exists() {
        warn!("Record path {} does not exist, recording disabled", path.display());
        return None;
    }
    if path.is_dir() {
        return Some(RecordConfig::new(path.to_path_buf()));
    }

    if path.extension().map_or(true, |ext| ext != "json") {
        warn!(
            "Record path {} is neither a directory nor a json file, recording disabled",
            path.display()
        );
        return None;
    }

    let config = match RecordConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}, recording disabled", e);
            return None;
        }
    };
    if !config.output_dir.is_dir() {
        warn!(
            "outputDir {} is not a directory, recording disabled",
            config.output_dir.display()
        );
        return None;
    }
    debug!("Recording to {}", config.output_dir.display());
    Some(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_becomes_output_dir() {
        let temp = TempDir::new().unwrap();
        let config = check_record_config(temp.path()).unwrap();
        assert_eq!(config.output_dir, temp.path());
        assert_eq!(config.video_encoding, VideoEncoding::default());
    }

    #[test]
    fn test_json_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record.json");
        let json = serde_json::json!({
            "outputDir": temp.path(),
            "videoEncoding": {"enabled": true, "codec": "mjpeg", "fps": 15}
        });
        std::fs::write(&path, json.to_string()).unwrap();

        let config = check_record_config(&path).unwrap();
        assert_eq!(config.video_encoding.codec, VideoCodec::Mjpeg);
        assert_eq!(config.video_encoding.fps, 15);
    }

    #[test]
    fn test_invalid_paths_disable_recording() {
        let temp = TempDir::new().unwrap();
        assert!(check_record_config(&temp.path().join("missing")).is_none());

        let text = temp.path().join("record.txt");
        std::fs::write(&text, "{}").unwrap();
        assert!(check_record_config(&text).is_none());

        let broken = temp.path().join("broken.json");
        std::fs::write(&broken, "{\"outputDir\":").unwrap();
        assert!(check_record_config(&broken).is_none());

        let elsewhere = temp.path().join("elsewhere.json");
        std::fs::write(&elsewhere, r#"{"outputDir": "/nonexistent/camreplay"}"#).unwrap();
        assert!(check_record_config(&elsewhere).is_none());
    }
}
