//! Recording a set with the recording task, then finding it again.

use std::path::Path;
use tokio::sync::mpsc;

use camreplay_core::{ImuRecord, MetadataRecord, VideoRecord};
use camreplay_host::recording::{
    find_recording_set, start_recording, CapturedItem, MuxerConfig, RecordingManager,
    RecordingTarget, TrackCodec, VideoCodec,
};
use tempfile::TempDir;

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

async fn record_node(dir: &Path, device: &str, node: &str, frames: u64, video: bool) {
    let stem = format!("{}-{}", device, node);
    let target = RecordingTarget {
        video_path: video.then(|| dir.join(format!("{}.mp4", stem))),
        metadata_path: Some(dir.join(format!("{}.meta", stem))),
        width: 64,
        height: 48,
        fps: 10,
        codec: VideoCodec::Mjpeg,
    };
    let (tx, rx) = mpsc::channel(8);
    let active = start_recording(target, MuxerConfig::default(), rx).unwrap();

    for seq in 0..frames {
        if video {
            tx.send(CapturedItem::Video(JPEG.to_vec())).await.unwrap();
            let record = VideoRecord::synthesized(64, 48, seq, std::time::Duration::ZERO);
            tx.send(CapturedItem::Record(MetadataRecord::Video(record)))
                .await
                .unwrap();
        } else {
            tx.send(CapturedItem::Record(MetadataRecord::Imu(ImuRecord::default())))
                .await
                .unwrap();
        }
    }
    drop(tx);

    let status = active.finish().await;
    assert_eq!(status.error_count, 0);
    assert_eq!(status.record_count, frames);
}

#[tokio::test]
async fn test_recorded_set_is_found_and_listed() {
    let temp = TempDir::new().unwrap();
    record_node(temp.path(), "1844301", "color", 5, true).await;
    record_node(temp.path(), "1844301", "imu", 3, false).await;
    record_node(temp.path(), "1944302", "color", 2, true).await;

    // The imu node only has a metadata log, which is not a stream file
    let set = find_recording_set(temp.path(), &["1844301", "1944302"], &["color"]);
    assert!(set.is_err(), "both devices recorded exactly one color stream");

    let set = find_recording_set(temp.path(), &["1844301"], &["color"])
        .unwrap()
        .unwrap();
    let color = set.stream("color").unwrap();
    assert!(color.video.as_ref().unwrap().ends_with("1844301-color.mp4"));
    assert!(color.metadata.as_ref().unwrap().ends_with("1844301-color.meta"));

    assert!(find_recording_set(temp.path(), &["1844301"], &["color", "left"])
        .unwrap()
        .is_none());

    let manager = RecordingManager::with_base_dir(temp.path().to_path_buf());
    let mut recordings = manager.list_recordings();
    recordings.sort_by(|a, b| a.filename.cmp(&b.filename));
    assert_eq!(recordings.len(), 2);
    assert_eq!(recordings[0].filename, "1844301-color.mp4");
    assert_eq!(recordings[0].codec, TrackCodec::Jpeg);
    assert_eq!(recordings[0].sample_count, 5);
    assert_eq!(recordings[0].duration_ms, 500);
    assert!(recordings[0].has_metadata);
    assert_eq!(recordings[1].sample_count, 2);
}

#[test]
fn test_empty_directory_matches_nothing() {
    let temp = TempDir::new().unwrap();
    assert!(find_recording_set(temp.path(), &["1844301"], &["color"])
        .unwrap()
        .is_none());
}
