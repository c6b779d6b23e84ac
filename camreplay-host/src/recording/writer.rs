//! Stream writers used while recording: the video container muxer and the
//! metadata log.

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use camreplay_core::message::BYTES_PER_PIXEL;
use camreplay_core::nal::{NalScanner, NalType, NalUnit};
use camreplay_core::MetadataRecord;

use super::ffmpeg::{FfmpegSequenceWriter, ImageSequenceWriter};
use super::file_format::{Mp4Writer, DEFAULT_TIMESCALE, VIDEO_PROFILE_LEVEL};
use crate::error::RecorderError;

/// Encoding of the payloads handed to `VideoRecorder::write`
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VideoCodec {
    /// Annex-B H.264 access units
    H264,
    /// One complete JPEG image per payload
    Mjpeg,
    /// Decoded planar frames, width * height * 3 bytes
    Raw,
}

/// Container settings fixed for the lifetime of a recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MuxerConfig {
    pub timescale: u32,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            timescale: DEFAULT_TIMESCALE,
        }
    }
}

/// Creates the image sequence writer for `Raw` recordings:
/// `(path, width, height, fps)`
pub type RawWriterFactory =
    Box<dyn Fn(&Path, u32, u32, u32) -> std::io::Result<Box<dyn ImageSequenceWriter>> + Send>;

/// Raw frames encoded by an ffmpeg subprocess
pub fn ffmpeg_raw_writer() -> RawWriterFactory {
    Box::new(|path, width, height, fps| {
        let writer = FfmpegSequenceWriter::spawn(path, width, height, fps)?;
        Ok(Box::new(writer) as Box<dyn ImageSequenceWriter>)
    })
}

/// Counters for one recording
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStats {
    /// Calls to `write`
    pub payloads: u64,
    /// Samples (or raw frames) persisted
    pub samples: u64,
    /// Units dropped because no track existed yet
    pub dropped: u64,
    /// Failed container or encoder writes
    pub write_errors: u64,
    /// Sample bytes persisted
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Uninitialized,
    Created(u32),
}

/// MP4 output plus the track bookkeeping for it
struct ContainerSink {
    writer: Mp4Writer<BufWriter<File>>,
    track: TrackState,
    width: u32,
    height: u32,
    sample_duration: u32,
    sample_buf: Vec<u8>,
}

impl ContainerSink {
    fn write_h264(&mut self, payload: &[u8], stats: &mut RecorderStats) {
        for nal in NalScanner::new(payload) {
            match nal.kind() {
                NalType::Sps => self.on_sps(&nal),
                NalType::Pps => match self.track {
                    TrackState::Created(id) => {
                        match self.writer.add_picture_parameter_set(id, nal.payload()) {
                            Ok(true) => debug!("Added PPS ({} bytes)", nal.payload_len()),
                            Ok(false) => trace!("Duplicate PPS ignored"),
                            Err(e) => error!("Failed to add PPS: {}", e),
                        }
                    }
                    TrackState::Uninitialized => {
                        warn!("PPS arrived before any SPS, dropped");
                    }
                },
                NalType::I | NalType::P => match self.track {
                    TrackState::Created(id) => {
                        self.sample_buf.clear();
                        self.sample_buf
                            .extend_from_slice(&(nal.payload_len() as u32).to_be_bytes());
                        self.sample_buf.extend_from_slice(nal.payload());
                        let sync = nal.kind() == NalType::I;
                        append(&mut self.writer, id, &self.sample_buf, sync, stats);
                    }
                    TrackState::Uninitialized => {
                        warn!("{} slice arrived before any SPS, dropped", nal.kind());
                        stats.dropped += 1;
                    }
                },
                NalType::Invalid => trace!("Skipping NAL unit type {}", nal.code()),
            }
        }
    }

    fn on_sps(&mut self, nal: &NalUnit<'_>) {
        if let TrackState::Created(_) = self.track {
            trace!("Track exists, later SPS ignored");
            return;
        }
        let sps = nal.payload();
        if sps.len() < 4 {
            warn!("SPS of {} bytes has no profile, dropped", sps.len());
            return;
        }
        let profile = [sps[1], sps[2], sps[3]];

        let id = match self.writer.add_h264_track(
            self.width,
            self.height,
            self.sample_duration,
            profile,
        ) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create H.264 track: {}", e);
                return;
            }
        };
        self.writer.set_video_profile_level(VIDEO_PROFILE_LEVEL);
        if let Err(e) = self.writer.add_sequence_parameter_set(id, sps) {
            error!("Failed to add SPS: {}", e);
        }
        self.track = TrackState::Created(id);
        info!(
            "Created H.264 track {} ({}x{}, profile {:02x} level {:02x})",
            id, self.width, self.height, profile[0], profile[2]
        );
    }

    fn write_mjpeg(&mut self, payload: &[u8], stats: &mut RecorderStats) {
        let id = match self.track {
            TrackState::Created(id) => id,
            TrackState::Uninitialized => {
                match self
                    .writer
                    .add_jpeg_track(self.width, self.height, self.sample_duration)
                {
                    Ok(id) => {
                        self.writer.set_video_profile_level(VIDEO_PROFILE_LEVEL);
                        self.track = TrackState::Created(id);
                        info!("Created MJPEG track {} ({}x{})", id, self.width, self.height);
                        id
                    }
                    Err(e) => {
                        error!("Failed to create MJPEG track: {}", e);
                        stats.dropped += 1;
                        return;
                    }
                }
            }
        };

        append(&mut self.writer, id, payload, true, stats);
    }

    fn finish(self) -> Result<(), RecorderError> {
        if self.track == TrackState::Uninitialized {
            warn!("Closing container without a video track");
        }
        self.writer.finish()?;
        Ok(())
    }
}

/// Write one sample. Failures are logged, not retried.
fn append(
    writer: &mut Mp4Writer<BufWriter<File>>,
    track_id: u32,
    sample: &[u8],
    sync: bool,
    stats: &mut RecorderStats,
) {
    match writer.write_sample(track_id, sample, sync) {
        Ok(()) => {
            stats.samples += 1;
            stats.bytes += sample.len() as u64;
        }
        Err(e) => {
            error!("Failed to write sample: {}", e);
            stats.write_errors += 1;
        }
    }
}

enum Output {
    H264(ContainerSink),
    Mjpeg(ContainerSink),
    Raw(Box<dyn ImageSequenceWriter>),
}

struct Session {
    path: PathBuf,
    frame_len: usize,
    output: Output,
    stats: RecorderStats,
}

impl Session {
    fn write(&mut self, payload: &[u8]) -> Result<(), RecorderError> {
        self.stats.payloads += 1;
        match &mut self.output {
            Output::H264(sink) => sink.write_h264(payload, &mut self.stats),
            Output::Mjpeg(sink) => sink.write_mjpeg(payload, &mut self.stats),
            Output::Raw(writer) => {
                if payload.len() != self.frame_len {
                    return Err(RecorderError::RawFrameSize {
                        expected: self.frame_len,
                        actual: payload.len(),
                    });
                }
                match writer.write_frame(payload) {
                    Ok(()) => {
                        self.stats.samples += 1;
                        self.stats.bytes += payload.len() as u64;
                    }
                    Err(e) => {
                        error!("Failed to write raw frame: {}", e);
                        self.stats.write_errors += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<RecorderStats, RecorderError> {
        match self.output {
            Output::H264(sink) | Output::Mjpeg(sink) => sink.finish()?,
            Output::Raw(mut writer) => writer.close()?,
        }
        info!(
            "Recording {} closed: {} samples, {} dropped, {} write errors, {} bytes",
            self.path.display(),
            self.stats.samples,
            self.stats.dropped,
            self.stats.write_errors,
            self.stats.bytes
        );
        Ok(self.stats)
    }
}

enum Lifecycle {
    Idle,
    Recording(Session),
    Closed,
}

/// Writes one video stream to a file.
///
/// H.264 and MJPEG payloads are muxed into an MP4 container with a single
/// video track that is created lazily: on the first SPS for H.264 and on the
/// first payload for MJPEG. Raw frames go to an [`ImageSequenceWriter`].
pub struct VideoRecorder {
    config: MuxerConfig,
    raw_writer: Option<RawWriterFactory>,
    state: Lifecycle,
    last_stats: RecorderStats,
}

impl VideoRecorder {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            config,
            raw_writer: None,
            state: Lifecycle::Idle,
            last_stats: RecorderStats::default(),
        }
    }

    /// Use `factory` for `Raw` recordings
    pub fn with_raw_writer(mut self, factory: RawWriterFactory) -> Self {
        self.raw_writer = Some(factory);
        self
    }

    pub fn config(&self) -> &MuxerConfig {
        &self.config
    }

    /// Open `path` for writing.
    pub fn initialize(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
        codec: VideoCodec,
    ) -> Result<(), RecorderError> {
        if !matches!(self.state, Lifecycle::Idle) {
            return Err(RecorderError::AlreadyInitialized);
        }
        if path.as_os_str().is_empty() {
            return Err(RecorderError::EmptyPath);
        }
        if width == 0 || height == 0 {
            return Err(RecorderError::InvalidSize { width, height });
        }
        if fps == 0 {
            return Err(RecorderError::InvalidFps(fps));
        }

        let output = match codec {
            VideoCodec::Raw => {
                let factory = self.raw_writer.as_ref().ok_or_else(|| {
                    RecorderError::RawWriterUnavailable("none configured".to_string())
                })?;
                let writer = factory(path, width, height, fps)
                    .map_err(|e| RecorderError::RawWriterUnavailable(e.to_string()))?;
                Output::Raw(writer)
            }
            VideoCodec::H264 | VideoCodec::Mjpeg => {
                let file = File::create(path)?;
                let writer = Mp4Writer::new(BufWriter::new(file), self.config.timescale)?;
                let sink = ContainerSink {
                    writer,
                    track: TrackState::Uninitialized,
                    width,
                    height,
                    sample_duration: (self.config.timescale / fps).max(1),
                    sample_buf: Vec::new(),
                };
                if codec == VideoCodec::H264 {
                    Output::H264(sink)
                } else {
                    Output::Mjpeg(sink)
                }
            }
        };

        info!(
            "Recording {} video {}x{} @ {} fps to {}",
            codec,
            width,
            height,
            fps,
            path.display()
        );
        self.state = Lifecycle::Recording(Session {
            path: path.to_path_buf(),
            frame_len: width as usize * height as usize * BYTES_PER_PIXEL,
            output,
            stats: RecorderStats::default(),
        });
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, Lifecycle::Recording(_))
    }

    pub fn stats(&self) -> RecorderStats {
        match &self.state {
            Lifecycle::Recording(session) => session.stats,
            _ => self.last_stats,
        }
    }

    /// Write one payload in the codec given to `initialize`
    pub fn write(&mut self, payload: &[u8]) -> Result<(), RecorderError> {
        match &mut self.state {
            Lifecycle::Recording(session) => session.write(payload),
            _ => Err(RecorderError::NotInitialized),
        }
    }

    /// Finalize the file. Calling it again, or on a recorder that was never
    /// initialized, does nothing.
    pub fn close(&mut self) -> Result<(), RecorderError> {
        match std::mem::replace(&mut self.state, Lifecycle::Closed) {
            Lifecycle::Recording(session) => {
                self.last_stats = session.stats;
                session.finish()?;
                Ok(())
            }
            Lifecycle::Idle => {
                self.state = Lifecycle::Idle;
                Ok(())
            }
            Lifecycle::Closed => Ok(()),
        }
    }
}

impl Default for VideoRecorder {
    fn default() -> Self {
        Self::new(MuxerConfig::default())
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close video recording: {}", e);
        }
    }
}

/// Appends metadata records to a log, one JSON value per line.
#[derive(Default)]
pub struct ByteRecorder {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    records: u64,
    closed: bool,
}

impl ByteRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, path: &Path) -> Result<(), RecorderError> {
        if self.writer.is_some() || self.closed {
            return Err(RecorderError::AlreadyInitialized);
        }
        if path.as_os_str().is_empty() {
            return Err(RecorderError::EmptyPath);
        }
        let file = File::create(path)?;
        self.writer = Some(BufWriter::new(file));
        self.path = Some(path.to_path_buf());
        debug!("Writing metadata to {}", path.display());
        Ok(())
    }

    /// Append a record with its `type` and `version` fields filled in
    pub fn write(&mut self, record: &MetadataRecord) -> Result<(), RecorderError> {
        self.write_value(&record.to_value())
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), RecorderError> {
        let writer = self.writer.as_mut().ok_or(RecorderError::NotInitialized)?;
        serde_json::to_writer(&mut *writer, value)?;
        writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush and release the file; later calls do nothing
    pub fn close(&mut self) -> Result<(), RecorderError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        self.closed = true;
        writer.flush()?;
        if let Some(path) = &self.path {
            info!("Metadata log {} closed: {} records", path.display(), self.records);
        }
        Ok(())
    }
}

impl Drop for ByteRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close metadata log: {}", e);
        }
    }
}
