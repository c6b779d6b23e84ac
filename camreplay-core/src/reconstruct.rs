//! Rebuilds pipeline messages from persisted records.
//!
//! This is a pure mapping: a record type, the record's JSON body and (for
//! video) the decoded frame go in, exactly one [`ReplayMessage`] comes out.
//! `Other` records have no message form and fail the replay.

use serde_json::Value;
use std::f64::consts::FRAC_PI_2;

use crate::error::ReplayError;
use crate::message::{
    CameraState, ImgFrame, ImuData, ImuPacket, ImuReport, ReplayMessage, BYTES_PER_PIXEL,
};
use crate::schema::{ImuRecord, OrientationSample, RecordType, VideoRecord};

/// Reconstruct one message from a record body interpreted as `record_type`.
pub fn reconstruct(
    record_type: RecordType,
    metadata: Value,
    frame: Option<Vec<u8>>,
) -> Result<ReplayMessage, ReplayError> {
    match record_type {
        RecordType::Other => Err(ReplayError::UnsupportedRecord(record_type)),
        RecordType::Video => {
            let record: VideoRecord = serde_json::from_value(metadata)?;
            let frame = frame.ok_or(ReplayError::MissingFrame {
                sequence: record.sequence_number,
            })?;
            image_message(&record, frame).map(ReplayMessage::Image)
        }
        RecordType::Imu => {
            let record: ImuRecord = serde_json::from_value(metadata)?;
            Ok(ReplayMessage::Imu(imu_message(&record)))
        }
    }
}

/// Build an image message, taking ownership of the frame buffer.
pub fn image_message(record: &VideoRecord, frame: Vec<u8>) -> Result<ImgFrame, ReplayError> {
    let expected = record.width as usize * record.height as usize * BYTES_PER_PIXEL;
    if frame.len() != expected {
        return Err(ReplayError::FrameSizeMismatch {
            width: record.width,
            height: record.height,
            expected,
            actual: frame.len(),
        });
    }

    let settings = &record.camera_settings;
    let cam = CameraState {
        wb_color_temp: settings.wb_color_temp,
        lens_position: settings.lens_position,
        lens_position_raw: settings.lens_position_raw,
        exposure_time_us: settings.exposure,
        sensitivity_iso: settings.sensitivity,
    };

    Ok(ImgFrame::new(
        record.width,
        record.height,
        record.timestamp.to_duration(),
        record.sequence_number,
        record.instance_number,
        cam,
        frame,
    ))
}

/// Build an IMU message with one packet per recorded packet.
pub fn imu_message(record: &ImuRecord) -> ImuData {
    let packets = record
        .packets
        .iter()
        .map(|packet| {
            let acc = &packet.acceleration;
            let orientation = &packet.orientation;
            let (roll, pitch, yaw) = quaternion_to_euler(orientation);
            ImuPacket {
                accelerometer: ImuReport {
                    x: acc.x,
                    y: acc.y,
                    z: acc.z,
                    timestamp: acc.timestamp,
                    sequence: acc.sequence_number,
                },
                gyroscope: ImuReport {
                    x: roll,
                    y: pitch,
                    z: yaw,
                    timestamp: orientation.timestamp,
                    sequence: orientation.sequence_number,
                },
            }
        })
        .collect();

    ImuData { packets }
}

/// Convert a rotation quaternion to (roll, pitch, yaw) in radians.
///
/// The pitch term `2(wy - xz)` is clamped to [-1, 1] so that slightly
/// denormalized quaternions still give a finite angle.
pub fn quaternion_to_euler(q: &OrientationSample) -> (f32, f32, f32) {
    let (w, x, y, z) = (q.w as f64, q.x as f64, q.y as f64, q.z as f64);

    let sinr_cosp = 2.0 * (w * x + y * z);
    let cosr_cosp = 1.0 - 2.0 * (x * x + y * y);
    let roll = sinr_cosp.atan2(cosr_cosp);

    let s = (2.0 * (w * y - x * z)).clamp(-1.0, 1.0);
    let sinp = (1.0 + s).sqrt();
    let cosp = (1.0 - s).sqrt();
    let pitch = 2.0 * sinp.atan2(cosp) - FRAC_PI_2;

    let siny_cosp = 2.0 * (w * z + x * y);
    let cosy_cosp = 1.0 - 2.0 * (y * y + z * z);
    let yaw = siny_cosp.atan2(cosy_cosp);

    (roll as f32, pitch as f32, yaw as f32)
}
