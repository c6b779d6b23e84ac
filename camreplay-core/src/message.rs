//! Typed messages handed to the pipeline during replay.

use std::time::Duration;

use crate::schema::Timestamp;

/// Pixel layout of replayed frames: three full-resolution planes, 8 bits each
pub const BYTES_PER_PIXEL: usize = 3;

/// Camera state at capture time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraState {
    pub wb_color_temp: i32,
    pub lens_position: i32,
    pub lens_position_raw: f32,
    pub exposure_time_us: i32,
    pub sensitivity_iso: i32,
}

/// A decoded image frame with its capture metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImgFrame {
    pub width: u32,
    pub height: u32,
    /// Capture time relative to the device clock
    pub timestamp: Duration,
    pub sequence_num: u64,
    pub instance_num: u32,
    pub cam: CameraState,
    data: Vec<u8>,
}

impl ImgFrame {
    /// Wrap planar pixel data; the buffer is taken over, not copied.
    pub(crate) fn new(
        width: u32,
        height: u32,
        timestamp: Duration,
        sequence_num: u64,
        instance_num: u32,
        cam: CameraState,
        data: Vec<u8>,
    ) -> Self {
        Self {
            width,
            height,
            timestamp,
            sequence_num,
            instance_num,
            cam,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Plane `index` (0..3) of the frame
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let plane_len = self.width as usize * self.height as usize;
        self.data.get(index * plane_len..(index + 1) * plane_len)
    }
}

/// One sensor reading inside an IMU packet
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuReport {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub timestamp: Timestamp,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuPacket {
    pub accelerometer: ImuReport,
    /// Orientation as (roll, pitch, yaw) in radians
    pub gyroscope: ImuReport,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImuData {
    pub packets: Vec<ImuPacket>,
}

/// Anything the replay driver can emit
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayMessage {
    Image(ImgFrame),
    Imu(ImuData),
}

impl ReplayMessage {
    pub fn as_image(&self) -> Option<&ImgFrame> {
        match self {
            ReplayMessage::Image(frame) => Some(frame),
            ReplayMessage::Imu(_) => None,
        }
    }

    pub fn as_imu(&self) -> Option<&ImuData> {
        match self {
            ReplayMessage::Imu(imu) => Some(imu),
            ReplayMessage::Image(_) => None,
        }
    }
}
