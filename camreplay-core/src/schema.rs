//! Versioned JSON schema of the metadata log.
//!
//! Every value in a metadata log carries an integer `type` discriminant and a
//! `version`. The body layout depends on the type:
//!
//! ```json
//! {"type":1,"version":1,"width":640,"height":400,
//!  "timestamp":{"seconds":12,"nanoseconds":500000},
//!  "sequenceNumber":7,"instanceNumber":0,
//!  "cameraSettings":{"wbColorTemp":5600,"lensPosition":120,
//!                    "lensPositionRaw":0.47,"exposure":8000,"sensitivity":100}}
//!
//! {"type":2,"version":1,"packets":[
//!   {"acceleration":{"x":0.1,"y":9.8,"z":0.0,"timestamp":{...},"sequenceNumber":3},
//!    "orientation":{"w":1.0,"x":0.0,"y":0.0,"z":0.0,"timestamp":{...},"sequenceNumber":3}}]}
//! ```
//!
//! The set of record kinds is closed: adding one means extending [`RecordType`]
//! and every exhaustive match on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::time::Duration;

use crate::error::ReplayError;
use crate::message::ImgFrame;

/// Schema version written by this crate
pub const SCHEMA_VERSION: u32 = 1;

/// Discriminant stored in the `type` field of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum RecordType {
    Other = 0,
    Video = 1,
    Imu = 2,
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordType::Other => write!(f, "Other"),
            RecordType::Video => write!(f, "Video"),
            RecordType::Imu => write!(f, "Imu"),
        }
    }
}

impl RecordType {
    /// Read the discriminant of a raw record without parsing its body
    pub fn of(value: &Value) -> Result<Self, ReplayError> {
        let field = value
            .get("type")
            .ok_or_else(|| ReplayError::InvalidRecordType("missing `type` field".to_string()))?;
        serde_json::from_value(field.clone())
            .map_err(|_| ReplayError::InvalidRecordType(field.to_string()))
    }
}

/// Seconds + nanoseconds pair used for all persisted timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl Timestamp {
    pub fn new(seconds: i64, nanoseconds: i64) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self {
            seconds: d.as_secs() as i64,
            nanoseconds: d.subsec_nanos() as i64,
        }
    }

    /// Convert to a duration, saturating negative values at zero
    pub fn to_duration(&self) -> Duration {
        let total = self.seconds as i128 * 1_000_000_000 + self.nanoseconds as i128;
        if total <= 0 {
            return Duration::ZERO;
        }
        let total = total.min(u64::MAX as i128 * 1_000_000_000) as u128;
        Duration::new(
            (total / 1_000_000_000) as u64,
            (total % 1_000_000_000) as u32,
        )
    }
}

/// Camera 3A state attached to every video record
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraSettings {
    /// White balance color temperature in Kelvin
    pub wb_color_temp: i32,
    /// Lens position (0..255)
    pub lens_position: i32,
    /// Lens position as reported by the actuator (0.0..1.0)
    pub lens_position_raw: f32,
    /// Exposure time in microseconds
    pub exposure: i32,
    /// Sensitivity as ISO value
    pub sensitivity: i32,
}

/// Metadata of one recorded video frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    #[serde(default)]
    pub version: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default)]
    pub instance_number: u32,
    #[serde(default)]
    pub camera_settings: CameraSettings,
}

impl VideoRecord {
    /// Record for a frame that has no persisted metadata
    pub fn synthesized(width: u32, height: u32, sequence_number: u64, elapsed: Duration) -> Self {
        Self {
            version: SCHEMA_VERSION,
            width,
            height,
            timestamp: Timestamp::from_duration(elapsed),
            sequence_number,
            instance_number: 0,
            camera_settings: CameraSettings::default(),
        }
    }

    /// Metadata of a captured frame, as persisted while recording
    pub fn from_image(frame: &ImgFrame) -> Self {
        Self {
            version: SCHEMA_VERSION,
            width: frame.width,
            height: frame.height,
            timestamp: Timestamp::from_duration(frame.timestamp),
            sequence_number: frame.sequence_num,
            instance_number: frame.instance_num,
            camera_settings: CameraSettings {
                wb_color_temp: frame.cam.wb_color_temp,
                lens_position: frame.cam.lens_position,
                lens_position_raw: frame.cam.lens_position_raw,
                exposure: frame.cam.exposure_time_us,
                sensitivity: frame.cam.sensitivity_iso,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccelerationSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub sequence_number: u64,
}

/// Rotation vector sample as a unit quaternion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrientationSample {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub sequence_number: u64,
}

impl Default for OrientationSample {
    fn default() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            timestamp: Timestamp::default(),
            sequence_number: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuPacketRecord {
    pub acceleration: AccelerationSample,
    pub orientation: OrientationSample,
}

/// A batch of IMU packets as delivered by the device in one message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuRecord {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub packets: Vec<ImuPacketRecord>,
}

/// One parsed value of the metadata log
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataRecord {
    Video(VideoRecord),
    Imu(ImuRecord),
    /// Kept verbatim; there is no message representation for it
    Other(Value),
}

impl MetadataRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            MetadataRecord::Video(_) => RecordType::Video,
            MetadataRecord::Imu(_) => RecordType::Imu,
            MetadataRecord::Other(_) => RecordType::Other,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            MetadataRecord::Video(r) => r.version,
            MetadataRecord::Imu(r) => r.version,
            MetadataRecord::Other(v) => v.get("version").and_then(Value::as_u64).unwrap_or(0) as u32,
        }
    }

    /// Parse a raw record, dispatching on its own `type` field
    pub fn from_value(value: Value) -> Result<Self, ReplayError> {
        let record_type = RecordType::of(&value)?;
        Self::parse_as(record_type, value)
    }

    /// Parse a raw record body as the given type, ignoring its `type` field
    pub fn parse_as(record_type: RecordType, value: Value) -> Result<Self, ReplayError> {
        let record = match record_type {
            RecordType::Video => MetadataRecord::Video(serde_json::from_value(value)?),
            RecordType::Imu => MetadataRecord::Imu(serde_json::from_value(value)?),
            RecordType::Other => MetadataRecord::Other(value),
        };
        if record.version() > SCHEMA_VERSION {
            log::warn!(
                "{} record has schema version {} (newer than {}), parsing known fields only",
                record_type,
                record.version(),
                SCHEMA_VERSION
            );
        }
        Ok(record)
    }

    /// Serialize with `type` and `version` fields filled in
    pub fn to_value(&self) -> Value {
        let (record_type, body) = match self {
            MetadataRecord::Video(r) => (RecordType::Video, serde_json::to_value(r)),
            MetadataRecord::Imu(r) => (RecordType::Imu, serde_json::to_value(r)),
            MetadataRecord::Other(v) => (RecordType::Other, Ok(v.clone())),
        };
        let mut body = body.unwrap_or(Value::Null);
        if let Value::Object(map) = &mut body {
            map.insert("type".to_string(), Value::from(record_type as u8));
            if !map.contains_key("version") {
                map.insert("version".to_string(), Value::from(SCHEMA_VERSION));
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_type_discriminant() {
        assert_eq!(RecordType::of(&json!({"type": 1})).unwrap(), RecordType::Video);
        assert_eq!(RecordType::of(&json!({"type": 2})).unwrap(), RecordType::Imu);
        assert_eq!(RecordType::of(&json!({"type": 0})).unwrap(), RecordType::Other);
        assert!(matches!(
            RecordType::of(&json!({"type": 9})),
            Err(ReplayError::InvalidRecordType(_))
        ));
        assert!(matches!(
            RecordType::of(&json!({"width": 4})),
            Err(ReplayError::InvalidRecordType(_))
        ));
    }

    #[test]
    fn test_parse_video_record() {
        let value = json!({
            "type": 1,
            "version": 1,
            "width": 640,
            "height": 400,
            "timestamp": {"seconds": 12, "nanoseconds": 500},
            "sequenceNumber": 7,
            "instanceNumber": 2,
            "cameraSettings": {
                "wbColorTemp": 5600,
                "lensPosition": 120,
                "lensPositionRaw": 0.5,
                "exposure": 8000,
                "sensitivity": 100
            }
        });
        let record = MetadataRecord::from_value(value).unwrap();
        let MetadataRecord::Video(video) = record else {
            panic!("expected a video record");
        };
        assert_eq!(video.width, 640);
        assert_eq!(video.sequence_number, 7);
        assert_eq!(video.instance_number, 2);
        assert_eq!(video.timestamp, Timestamp::new(12, 500));
        assert_eq!(video.camera_settings.wb_color_temp, 5600);
        assert_eq!(video.camera_settings.lens_position_raw, 0.5);
    }

    #[test]
    fn test_to_value_adds_type_and_version() {
        let record = MetadataRecord::Imu(ImuRecord {
            version: SCHEMA_VERSION,
            packets: vec![ImuPacketRecord::default()],
        });
        let value = record.to_value();
        assert_eq!(value["type"], json!(2));
        assert_eq!(value["version"], json!(1));
        assert_eq!(value["packets"].as_array().unwrap().len(), 1);
        assert_eq!(MetadataRecord::from_value(value).unwrap(), record);
    }

    #[test]
    fn test_missing_version_is_zero() {
        let record = MetadataRecord::from_value(json!({"type": 2, "packets": []})).unwrap();
        assert_eq!(record.version(), 0);
    }

    #[test]
    fn test_newer_version_still_parses() {
        let record =
            MetadataRecord::from_value(json!({"type": 1, "version": 7, "width": 2, "height": 2, "extra": true}))
                .unwrap();
        assert_eq!(record.record_type(), RecordType::Video);
        assert_eq!(record.version(), 7);
    }

    #[test]
    fn test_video_record_from_image() {
        let record = json!({
            "type": 1, "width": 2, "height": 1, "sequenceNumber": 41, "instanceNumber": 1,
            "timestamp": {"seconds": 5, "nanoseconds": 20},
            "cameraSettings": {"wbColorTemp": 4000, "lensPosition": 3, "lensPositionRaw": 0.25,
                               "exposure": 900, "sensitivity": 200}
        });
        let parsed: VideoRecord = serde_json::from_value(record).unwrap();
        let frame = crate::reconstruct::image_message(&parsed, vec![0; 6]).unwrap();

        let rebuilt = VideoRecord::from_image(&frame);
        assert_eq!(rebuilt.version, SCHEMA_VERSION);
        assert_eq!(rebuilt.sequence_number, 41);
        assert_eq!(rebuilt.timestamp, Timestamp::new(5, 20));
        assert_eq!(rebuilt.camera_settings, parsed.camera_settings);
    }

    #[test]
    fn test_timestamp_duration_conversion() {
        let ts = Timestamp::from_duration(Duration::new(3, 250));
        assert_eq!(ts, Timestamp::new(3, 250));
        assert_eq!(ts.to_duration(), Duration::new(3, 250));
        assert_eq!(Timestamp::new(-1, 0).to_duration(), Duration::ZERO);
    }
}
