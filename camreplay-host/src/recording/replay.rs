//! Replay driver - turns a recorded session back into pipeline messages.
//!
//! The driver owns both sources and advances them in lock-step ticks. Each
//! tick reads at most one metadata record and one frame, rebuilds one message
//! and hands it downstream before the next tick starts.
//!
//! ```text
//!  Probing ──► Streaming ──► Draining ──► Done
//!     │            │ first source at end of stream,
//!     │            │ cancellation or receiver gone
//!     └── error ───┴──────────────► Draining ──► Done
//! ```

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use camreplay_core::{reconstruct, RecordType, ReplayError, ReplayMessage, VideoRecord};

use super::player::{BytePlayer, RecordSource, VideoPlayer, VideoSource};
use crate::error::DriverError;

/// Replay driver phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPhase {
    Probing,
    Streaming,
    Draining,
    Done,
}

impl ReplayPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReplayPhase::Probing,
            1 => ReplayPhase::Streaming,
            2 => ReplayPhase::Draining,
            _ => ReplayPhase::Done,
        }
    }
}

impl std::fmt::Display for ReplayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayPhase::Probing => write!(f, "probing"),
            ReplayPhase::Streaming => write!(f, "streaming"),
            ReplayPhase::Draining => write!(f, "draining"),
            ReplayPhase::Done => write!(f, "done"),
        }
    }
}

/// Where the driver is; only moves forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayState {
    pub phase: ReplayPhase,
    /// Completed ticks
    pub tick: u64,
    /// Messages accepted by the receiver
    pub emitted: u64,
    pub video_eos: bool,
    pub metadata_eos: bool,
    pub record_type: Option<RecordType>,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            phase: ReplayPhase::Probing,
            tick: 0,
            emitted: 0,
            video_eos: false,
            metadata_eos: false,
            record_type: None,
        }
    }
}

/// Counters readable while the driver runs on another thread
#[derive(Debug, Default)]
pub struct ReplayProgress {
    emitted: AtomicU64,
    phase: AtomicU8,
}

impl ReplayProgress {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> ReplayPhase {
        ReplayPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }
}

/// The two optional sources of one recorded stream. At least one is open.
pub struct RecordedSession {
    video: Option<Box<dyn VideoSource>>,
    metadata: Option<Box<dyn RecordSource>>,
}

impl RecordedSession {
    /// Open whichever of the two files can be opened
    pub fn open(video: Option<&Path>, metadata: Option<&Path>) -> Result<Self, DriverError> {
        let video = video.and_then(|path| match VideoPlayer::init(path) {
            Ok(player) => Some(Box::new(player) as Box<dyn VideoSource>),
            Err(e) => {
                warn!("Video source {} unavailable: {}", path.display(), e);
                None
            }
        });
        let metadata = metadata.and_then(|path| match BytePlayer::init(path) {
            Ok(player) => Some(Box::new(player) as Box<dyn RecordSource>),
            Err(e) => {
                warn!("Metadata source {} unavailable: {}", path.display(), e);
                None
            }
        });
        Self::from_sources(video, metadata)
    }

    pub fn from_sources(
        video: Option<Box<dyn VideoSource>>,
        metadata: Option<Box<dyn RecordSource>>,
    ) -> Result<Self, DriverError> {
        if video.is_none() && metadata.is_none() {
            return Err(DriverError::NoSources);
        }
        Ok(Self { video, metadata })
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }
}

/// Drives one recorded session to completion. Consumed by `run`.
pub struct ReplayDriver {
    session: RecordedSession,
    state: ReplayState,
    /// First record, read while probing the record type
    pending: Option<Value>,
    started: Instant,
    progress: Arc<ReplayProgress>,
}

impl ReplayDriver {
    pub fn new(session: RecordedSession) -> Self {
        Self {
            session,
            state: ReplayState::default(),
            pending: None,
            started: Instant::now(),
            progress: Arc::new(ReplayProgress::default()),
        }
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn progress(&self) -> Arc<ReplayProgress> {
        self.progress.clone()
    }

    /// Replay until a source runs out, `running` is cleared or the receiver
    /// goes away. Blocks on the channel; call from a blocking thread.
    pub fn run(
        mut self,
        output: &mpsc::Sender<ReplayMessage>,
        running: &AtomicBool,
    ) -> Result<ReplayState, DriverError> {
        self.started = Instant::now();
        let result = self.stream(output, running);
        self.release();
        result.map(|()| self.state)
    }

    fn stream(
        &mut self,
        output: &mpsc::Sender<ReplayMessage>,
        running: &AtomicBool,
    ) -> Result<(), DriverError> {
        let record_type = self.probe()?;
        self.state.record_type = Some(record_type);
        self.set_phase(ReplayPhase::Streaming);
        info!(
            "Replaying {} records (video: {}, metadata: {})",
            record_type,
            self.session.has_video(),
            self.session.has_metadata()
        );

        loop {
            if !running.load(Ordering::SeqCst) {
                info!("Replay cancelled after {} ticks", self.state.tick);
                break;
            }
            let Some(message) = self.tick(record_type)? else {
                break;
            };
            if output.blocking_send(message).is_err() {
                info!("Replay receiver closed after {} messages", self.state.emitted);
                break;
            }
            self.state.emitted += 1;
            self.progress
                .emitted
                .store(self.state.emitted, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Settle the record type from the first metadata record, or from the
    /// video source alone.
    fn probe(&mut self) -> Result<RecordType, DriverError> {
        let first = match self.session.metadata.as_mut() {
            Some(metadata) => metadata.next_record()?,
            None => None,
        };

        let record_type = match first {
            Some(first) => {
                let record_type = RecordType::of(&first)?;
                self.pending = Some(first);
                record_type
            }
            None => {
                if self.session.metadata.take().is_some() {
                    warn!("Metadata log is empty, treating it as absent");
                    self.state.metadata_eos = true;
                }
                if self.session.video.is_none() {
                    return Err(DriverError::NoSources);
                }
                debug!("No metadata, synthesizing video records");
                RecordType::Video
            }
        };

        match record_type {
            RecordType::Video if self.session.video.is_none() => {
                Err(DriverError::MissingVideoSource(record_type))
            }
            RecordType::Video => Ok(record_type),
            other => {
                if self.session.video.take().is_some() {
                    info!("{} records carry no frames, video source closed", other);
                }
                Ok(other)
            }
        }
    }

    /// One lock-step read. `None` when a source has reached end of stream.
    fn tick(&mut self, record_type: RecordType) -> Result<Option<ReplayMessage>, DriverError> {
        let mut metadata = self.pending.take();
        if metadata.is_none() {
            if let Some(source) = self.session.metadata.as_mut() {
                match source.next_record()? {
                    Some(record) => metadata = Some(record),
                    None => {
                        debug!("Metadata at end of stream after {} ticks", self.state.tick);
                        self.state.metadata_eos = true;
                        return Ok(None);
                    }
                }
            }
        }

        let mut frame = None;
        if record_type == RecordType::Video {
            if let Some(video) = self.session.video.as_mut() {
                match video.next_frame()? {
                    Some(data) => frame = Some(data),
                    None => {
                        debug!("Video at end of stream after {} ticks", self.state.tick);
                        self.state.video_eos = true;
                        return Ok(None);
                    }
                }
            }
        }

        let metadata = match metadata {
            Some(metadata) => metadata,
            None => self.synthesize()?,
        };
        let message = reconstruct(record_type, metadata, frame)?;
        self.state.tick += 1;
        Ok(Some(message))
    }

    /// Video record for a tick with no persisted metadata
    fn synthesize(&self) -> Result<Value, ReplayError> {
        let (width, height) = self
            .session
            .video
            .as_ref()
            .map_or((0, 0), |video| video.size());
        let record =
            VideoRecord::synthesized(width, height, self.state.tick, self.started.elapsed());
        Ok(serde_json::to_value(record)?)
    }

    fn set_phase(&mut self, phase: ReplayPhase) {
        self.state.phase = phase;
        self.progress.phase.store(phase as u8, Ordering::Relaxed);
    }

    fn release(&mut self) {
        self.set_phase(ReplayPhase::Draining);
        self.pending = None;
        self.session.video = None;
        self.session.metadata = None;
        self.set_phase(ReplayPhase::Done);
        info!(
            "Replay done: {} ticks, {} messages in {:.1}s",
            self.state.tick,
            self.state.emitted,
            self.started.elapsed().as_secs_f64()
        );
    }
}

/// Settings for a background replay
#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Messages buffered between the driver and the receiver
    pub channel_capacity: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 8,
        }
    }
}

/// Replay status information
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatus {
    pub state: String,
    pub messages_emitted: u64,
    pub running: bool,
}

/// Handle to a replay running on a blocking thread
pub struct ActiveReplay {
    running: Arc<AtomicBool>,
    progress: Arc<ReplayProgress>,
    handle: JoinHandle<Result<ReplayState, DriverError>>,
}

impl ActiveReplay {
    /// Ask the driver to stop at the next tick boundary
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    pub fn status(&self) -> ReplayStatus {
        ReplayStatus {
            state: self.progress.phase().to_string(),
            messages_emitted: self.progress.emitted(),
            running: self.is_running(),
        }
    }

    /// Wait for the driver to finish
    pub async fn wait(self) -> Result<ReplayState, DriverError> {
        self.handle
            .await
            .map_err(|e| DriverError::Task(e.to_string()))?
    }
}

/// Run `session` on a blocking thread, delivering messages on the returned
/// receiver. Must be called from within a tokio runtime.
pub fn start_replay(
    session: RecordedSession,
    options: ReplayOptions,
) -> (ActiveReplay, mpsc::Receiver<ReplayMessage>) {
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
    let driver = ReplayDriver::new(session);
    let progress = driver.progress();
    let running = Arc::new(AtomicBool::new(true));

    let flag = running.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let result = driver.run(&tx, &flag);
        if let Err(e) = &result {
            error!("Replay failed: {}", e);
        }
        flag.store(false, Ordering::SeqCst);
        result
    });

    let active = ActiveReplay {
        running,
        progress,
        handle,
    };
    (active, rx)
}
