//! Replay driver behavior over in-memory and on-disk sources.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use tokio::sync::mpsc;

use camreplay_core::{RecordType, ReplayError, ReplayMessage};
use camreplay_host::error::{DriverError, PlayerError};
use camreplay_host::recording::{
    start_replay, ByteRecorder, RecordSource, RecordedSession, ReplayDriver, ReplayOptions,
    ReplayState, VideoSource,
};
use tempfile::TempDir;

const WIDTH: u32 = 4;
const HEIGHT: u32 = 2;

struct Frames {
    remaining: VecDeque<Vec<u8>>,
}

impl Frames {
    fn boxed(count: usize) -> Box<dyn VideoSource> {
        let len = (WIDTH * HEIGHT * 3) as usize;
        Box::new(Self {
            remaining: (0..count).map(|i| vec![i as u8; len]).collect(),
        })
    }
}

impl VideoSource for Frames {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, PlayerError> {
        Ok(self.remaining.pop_front())
    }

    fn size(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

struct Records(VecDeque<Value>);

impl Records {
    fn boxed(records: Vec<Value>) -> Box<dyn RecordSource> {
        Box::new(Self(records.into()))
    }
}

impl RecordSource for Records {
    fn next_record(&mut self) -> Result<Option<Value>, PlayerError> {
        Ok(self.0.pop_front())
    }
}

fn video_record(seq: u64) -> Value {
    json!({
        "type": 1,
        "version": 1,
        "width": WIDTH,
        "height": HEIGHT,
        "timestamp": {"seconds": 1, "nanoseconds": seq * 1000},
        "sequenceNumber": seq,
        "instanceNumber": 0,
        "cameraSettings": {
            "wbColorTemp": 5000, "lensPosition": 10, "lensPositionRaw": 0.1,
            "exposure": 1000, "sensitivity": 100
        }
    })
}

fn replay(session: RecordedSession) -> (Result<ReplayState, DriverError>, Vec<ReplayMessage>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let result = ReplayDriver::new(session).run(&tx, &AtomicBool::new(true));
    drop(tx);
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    (result, messages)
}

#[test]
fn test_video_only_session_emits_every_frame() {
    let session = RecordedSession::from_sources(Some(Frames::boxed(6)), None).unwrap();
    let (result, messages) = replay(session);

    let state = result.unwrap();
    assert_eq!(state.emitted, 6);
    let frames: Vec<_> = messages.iter().map(|m| m.as_image().unwrap()).collect();
    assert_eq!(
        frames.iter().map(|f| f.sequence_num).collect::<Vec<_>>(),
        (0..6).collect::<Vec<_>>()
    );
    assert!(frames.iter().all(|f| (f.width, f.height) == (WIDTH, HEIGHT)));
    assert!(frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn test_fewer_records_than_frames() {
    let session = RecordedSession::from_sources(
        Some(Frames::boxed(10)),
        Some(Records::boxed((0..4).map(video_record).collect())),
    )
    .unwrap();
    let (result, messages) = replay(session);

    let state = result.unwrap();
    assert_eq!(messages.len(), 4);
    assert!(state.metadata_eos);
    let last = messages[3].as_image().unwrap();
    assert_eq!(last.sequence_num, 3);
    assert_eq!(last.cam.wb_color_temp, 5000);
    assert_eq!(last.data(), &[3u8; (WIDTH * HEIGHT * 3) as usize][..]);
}

#[test]
fn test_no_sources_is_an_error() {
    assert!(matches!(
        RecordedSession::from_sources(None, None),
        Err(DriverError::NoSources)
    ));

    let temp = TempDir::new().unwrap();
    let missing_video = temp.path().join("missing.mp4");
    let missing_meta = temp.path().join("missing.meta");
    assert!(matches!(
        RecordedSession::open(Some(&missing_video), Some(&missing_meta)),
        Err(DriverError::NoSources)
    ));
}

#[test]
fn test_video_records_without_video_fail() {
    let session =
        RecordedSession::from_sources(None, Some(Records::boxed(vec![video_record(0)]))).unwrap();
    let (result, messages) = replay(session);
    assert!(matches!(
        result,
        Err(DriverError::MissingVideoSource(RecordType::Video))
    ));
    assert!(messages.is_empty());
}

#[test]
fn test_other_record_is_fatal() {
    let session = RecordedSession::from_sources(
        Some(Frames::boxed(2)),
        Some(Records::boxed(vec![json!({"type": 0, "version": 1, "blob": "x"})])),
    )
    .unwrap();
    let (result, _) = replay(session);
    assert!(matches!(
        result,
        Err(DriverError::Replay(ReplayError::UnsupportedRecord(RecordType::Other)))
    ));
}

#[test]
fn test_imu_log_from_disk() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("1844301-imu.meta");

    let mut recorder = ByteRecorder::new();
    recorder.initialize(&path).unwrap();
    for seq in 0..3u64 {
        recorder
            .write_value(&json!({
                "type": 2,
                "version": 1,
                "packets": [{
                    "acceleration": {"x": 0.0, "y": 9.81, "z": 0.0,
                                     "timestamp": {"seconds": 0, "nanoseconds": seq}, "sequenceNumber": seq},
                    "orientation": {"w": 1.0, "x": 0.0, "y": 0.0, "z": 0.0,
                                    "timestamp": {"seconds": 0, "nanoseconds": seq}, "sequenceNumber": seq}
                }]
            }))
            .unwrap();
    }
    recorder.close().unwrap();

    let session = RecordedSession::open(None, Some(&path)).unwrap();
    assert!(!session.has_video());
    let (result, messages) = replay(session);

    assert_eq!(result.unwrap().record_type, Some(RecordType::Imu));
    assert_eq!(messages.len(), 3);
    for (seq, message) in messages.iter().enumerate() {
        let packet = message.as_imu().unwrap().packets[0];
        assert_eq!(packet.accelerometer.y, 9.81);
        assert_eq!(packet.accelerometer.sequence, seq as u64);
        let gyro = packet.gyroscope;
        assert!(gyro.x.abs() < 1e-6 && gyro.y.abs() < 1e-6 && gyro.z.abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_background_replay_with_slow_consumer() {
    let session = RecordedSession::from_sources(
        Some(Frames::boxed(5)),
        Some(Records::boxed((0..5).map(video_record).collect())),
    )
    .unwrap();
    let (active, mut messages) = start_replay(session, ReplayOptions { channel_capacity: 1 });

    let mut sequence = Vec::new();
    while let Some(message) = messages.recv().await {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        sequence.push(message.as_image().unwrap().sequence_num);
    }
    assert_eq!(sequence, vec![0, 1, 2, 3, 4]);

    let state = active.wait().await.unwrap();
    assert_eq!(state.emitted, 5);
    assert!(state.video_eos || state.metadata_eos);
}
