//! Recording task - drains captured items from the pipeline into a video
//! container and a metadata log.

use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use camreplay_core::MetadataRecord;

use super::writer::{ffmpeg_raw_writer, ByteRecorder, MuxerConfig, VideoCodec, VideoRecorder};
use crate::error::RecorderError;

/// Something the pipeline produced for one recorded node
#[derive(Debug, Clone)]
pub enum CapturedItem {
    /// One encoded payload in the target codec
    Video(Vec<u8>),
    /// One metadata record
    Record(MetadataRecord),
}

/// Where and how one node is recorded
#[derive(Debug, Clone)]
pub struct RecordingTarget {
    /// Video container; `None` records metadata only
    pub video_path: Option<PathBuf>,
    /// Metadata log; `None` records video only
    pub metadata_path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: VideoCodec,
}

/// Recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Stopping,
}

impl RecordingState {
    fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Stopping => "stopping",
        }
    }
}

/// Recording status information
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub state: String,
    pub video_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    /// Video payloads written
    pub payload_count: u64,
    /// Metadata records written
    pub record_count: u64,
    pub duration_ms: u64,
    /// Bytes handed to the writers
    pub size_bytes: u64,
    /// Failed writes; the recording carries on past them
    pub error_count: u64,
    /// Recording start time (Unix timestamp ms)
    pub start_time_ms: i64,
}

#[derive(Debug, Default)]
struct Counters {
    payloads: AtomicU64,
    records: AtomicU64,
    duration_ms: AtomicU64,
    size_bytes: AtomicU64,
    errors: AtomicU64,
}

/// Active recording handle
pub struct ActiveRecording {
    stop_flag: Arc<AtomicBool>,
    counters: Arc<Counters>,
    video_path: Option<PathBuf>,
    metadata_path: Option<PathBuf>,
    start_time_ms: i64,
    handle: JoinHandle<()>,
}

impl ActiveRecording {
    /// Signal the recording to stop
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Check if recording is still running
    pub fn is_running(&self) -> bool {
        !self.stop_flag.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    pub fn status(&self) -> RecordingStatus {
        let state = if self.handle.is_finished() {
            RecordingState::Idle
        } else if self.stop_flag.load(Ordering::SeqCst) {
            RecordingState::Stopping
        } else {
            RecordingState::Recording
        };
        RecordingStatus {
            state: state.as_str().to_string(),
            video_path: self.video_path.clone(),
            metadata_path: self.metadata_path.clone(),
            payload_count: self.counters.payloads.load(Ordering::Relaxed),
            record_count: self.counters.records.load(Ordering::Relaxed),
            duration_ms: self.counters.duration_ms.load(Ordering::Relaxed),
            size_bytes: self.counters.size_bytes.load(Ordering::Relaxed),
            error_count: self.counters.errors.load(Ordering::Relaxed),
            start_time_ms: self.start_time_ms,
        }
    }

    /// Wait for the task to drain and close both files. Without `stop` this
    /// returns once the capture channel is closed.
    pub async fn finish(mut self) -> RecordingStatus {
        if let Err(e) = (&mut self.handle).await {
            error!("Recording task failed: {}", e);
        }
        self.status()
    }
}

/// Open the writers for `target` and record everything received on `items`
/// in the background.
pub fn start_recording(
    target: RecordingTarget,
    config: MuxerConfig,
    items: mpsc::Receiver<CapturedItem>,
) -> Result<ActiveRecording, RecorderError> {
    let mut video = None;
    if let Some(path) = &target.video_path {
        let mut recorder = VideoRecorder::new(config).with_raw_writer(ffmpeg_raw_writer());
        recorder.initialize(path, target.width, target.height, target.fps, target.codec)?;
        video = Some(recorder);
    }

    let mut metadata = None;
    if let Some(path) = &target.metadata_path {
        let mut recorder = ByteRecorder::new();
        recorder.initialize(path)?;
        metadata = Some(recorder);
    }

    info!(
        "Starting recording (video: {:?}, metadata: {:?})",
        target.video_path, target.metadata_path
    );

    let stop_flag = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(Counters::default());
    let task = RecordingTask {
        video,
        metadata,
        items,
        stop_flag: stop_flag.clone(),
        counters: counters.clone(),
    };
    let handle = tokio::spawn(task.run());

    Ok(ActiveRecording {
        stop_flag,
        counters,
        video_path: target.video_path,
        metadata_path: target.metadata_path,
        start_time_ms: chrono::Utc::now().timestamp_millis(),
        handle,
    })
}

struct RecordingTask {
    video: Option<VideoRecorder>,
    metadata: Option<ByteRecorder>,
    items: mpsc::Receiver<CapturedItem>,
    stop_flag: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl RecordingTask {
    async fn run(mut self) {
        let start = std::time::Instant::now();
        debug!("Recording task started");

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                debug!("Recording stop flag detected");
                break;
            }

            // Use a timeout to periodically check the stop flag
            match tokio::time::timeout(Duration::from_millis(100), self.items.recv()).await {
                Ok(Some(item)) => {
                    self.write(item);
                    self.counters
                        .duration_ms
                        .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
                Ok(None) => {
                    info!("Capture channel closed");
                    break;
                }
                Err(_) => {
                    // Timeout - just continue and check stop flag
                }
            }
        }

        self.drain();
        self.counters
            .duration_ms
            .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.close();
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Write whatever is still queued once the loop has ended. The channel
    /// is closed first so no new items arrive behind the drain.
    fn drain(&mut self) {
        self.items.close();
        let mut drained = 0u64;
        while let Ok(item) = self.items.try_recv() {
            self.write(item);
            drained += 1;
        }
        if drained > 0 {
            info!("Wrote {} items queued before stop", drained);
        }
    }

    fn write(&mut self, item: CapturedItem) {
        let c = &self.counters;
        match item {
            CapturedItem::Video(payload) => {
                let Some(video) = self.video.as_mut() else {
                    warn!("Video payload without a video output, dropped");
                    return;
                };
                match video.write(&payload) {
                    Ok(()) => {
                        c.payloads.fetch_add(1, Ordering::Relaxed);
                        c.size_bytes
                            .fetch_add(payload.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!("Failed to write video payload: {}", e);
                        c.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            CapturedItem::Record(record) => {
                let Some(metadata) = self.metadata.as_mut() else {
                    warn!("{} record without a metadata output, dropped", record.record_type());
                    return;
                };
                match metadata.write(&record) {
                    Ok(()) => {
                        c.records.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!("Failed to write metadata record: {}", e);
                        c.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut video) = self.video.take() {
            let stats = video.stats();
            self.counters
                .errors
                .fetch_add(stats.write_errors, Ordering::Relaxed);
            if let Err(e) = video.close() {
                error!("Failed to finish video recording: {}", e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(mut metadata) = self.metadata.take() {
            if let Err(e) = metadata.close() {
                error!("Failed to finish metadata log: {}", e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        info!(
            "Recording finished: {} payloads, {} records, {}ms",
            self.counters.payloads.load(Ordering::Relaxed),
            self.counters.records.load(Ordering::Relaxed),
            self.counters.duration_ms.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::file_format::Mp4Reader;
    use camreplay_core::{ImuRecord, VideoRecord};
    use std::fs::File;
    use tempfile::TempDir;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f, 0xac];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xee, 0x3c, 0x80];

    fn target(dir: &TempDir, codec: VideoCodec) -> RecordingTarget {
        RecordingTarget {
            video_path: Some(dir.path().join("1844301-cam.mp4")),
            metadata_path: Some(dir.path().join("1844301-cam.meta")),
            width: 16,
            height: 16,
            fps: 30,
            codec,
        }
    }

    #[tokio::test]
    async fn test_records_video_and_metadata() {
        let temp = TempDir::new().unwrap();
        let target = target(&temp, VideoCodec::H264);
        let (tx, rx) = mpsc::channel(16);
        let active = start_recording(target.clone(), MuxerConfig::default(), rx).unwrap();

        let mut first = SPS.to_vec();
        first.extend_from_slice(PPS);
        first.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);
        tx.send(CapturedItem::Video(first)).await.unwrap();
        tx.send(CapturedItem::Video(vec![0, 0, 0, 1, 0x41, 0x9a]))
            .await
            .unwrap();
        for seq in 0..2 {
            let record = VideoRecord::synthesized(16, 16, seq, Duration::ZERO);
            tx.send(CapturedItem::Record(MetadataRecord::Video(record)))
                .await
                .unwrap();
        }
        drop(tx);

        let status = active.finish().await;
        assert_eq!(status.state, "idle");
        assert_eq!(status.payload_count, 2);
        assert_eq!(status.record_count, 2);
        assert_eq!(status.error_count, 0);

        let file = File::open(target.video_path.unwrap()).unwrap();
        let reader = Mp4Reader::open(std::io::BufReader::new(file)).unwrap();
        assert_eq!(reader.sample_count(), 2);

        let log = std::fs::read_to_string(target.metadata_path.unwrap()).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_stop_closes_files() {
        let temp = TempDir::new().unwrap();
        let target = target(&temp, VideoCodec::Mjpeg);
        let (tx, rx) = mpsc::channel(4);
        let active = start_recording(target.clone(), MuxerConfig::default(), rx).unwrap();
        assert!(active.is_running());

        tx.send(CapturedItem::Video(vec![0xFF, 0xD8, 0xFF, 0xD9]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        active.stop();
        let status = active.finish().await;
        assert_eq!(status.payload_count, 1);

        // Sender still alive; the container was finalized anyway
        let file = File::open(target.video_path.unwrap()).unwrap();
        assert!(Mp4Reader::open(file).is_ok());
        drop(tx);
    }

    #[tokio::test]
    async fn test_stop_writes_queued_items() {
        let temp = TempDir::new().unwrap();
        let target = target(&temp, VideoCodec::Mjpeg);
        let (tx, rx) = mpsc::channel(16);
        let active = start_recording(target.clone(), MuxerConfig::default(), rx).unwrap();

        // Queue everything before the task gets to run, then stop it
        for seq in 0..5 {
            tx.try_send(CapturedItem::Video(vec![0xFF, 0xD8, seq, 0xFF, 0xD9]))
                .unwrap();
            let record = VideoRecord::synthesized(16, 16, seq as u64, Duration::ZERO);
            tx.try_send(CapturedItem::Record(MetadataRecord::Video(record)))
                .unwrap();
        }
        active.stop();
        let status = active.finish().await;

        assert_eq!(status.payload_count, 5);
        assert_eq!(status.record_count, 5);
        assert_eq!(status.error_count, 0);
        assert!(tx.is_closed());

        let file = File::open(target.video_path.unwrap()).unwrap();
        assert_eq!(Mp4Reader::open(file).unwrap().sample_count(), 5);
        let log = std::fs::read_to_string(target.metadata_path.unwrap()).unwrap();
        assert_eq!(log.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_metadata_only_drops_video() {
        let temp = TempDir::new().unwrap();
        let mut target = target(&temp, VideoCodec::H264);
        target.video_path = None;
        let (tx, rx) = mpsc::channel(4);
        let active = start_recording(target.clone(), MuxerConfig::default(), rx).unwrap();

        tx.send(CapturedItem::Video(SPS.to_vec())).await.unwrap();
        tx.send(CapturedItem::Record(MetadataRecord::Imu(ImuRecord::default())))
            .await
            .unwrap();
        drop(tx);

        let status = active.finish().await;
        assert_eq!(status.payload_count, 0);
        assert_eq!(status.record_count, 1);
    }

    #[test]
    fn test_invalid_target_fails_to_start() {
        let temp = TempDir::new().unwrap();
        let mut target = target(&temp, VideoCodec::H264);
        target.fps = 0;
        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(
            start_recording(target, MuxerConfig::default(), rx),
            Err(RecorderError::InvalidFps(0))
        ));
    }
}
