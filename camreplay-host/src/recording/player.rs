//! Replay sources: decoded frames from a video container and records from a
//! metadata log.
//!
//! Opening either source can fail without ending the replay; the driver
//! decides what a missing source means.

use log::{debug, info, warn};
use serde_json::de::IoRead;
use serde_json::{StreamDeserializer, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use super::ffmpeg::FrameDecoder;
use super::file_format::{Mp4Reader, Track};
use crate::error::PlayerError;

/// Yields decoded planar frames in presentation order
pub trait VideoSource: Send {
    /// Next frame, `None` at end of stream
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, PlayerError>;

    /// (width, height) of every frame
    fn size(&self) -> (u32, u32);
}

/// Yields raw metadata records in file order
pub trait RecordSource: Send {
    /// Next record, `None` at end of stream
    fn next_record(&mut self) -> Result<Option<Value>, PlayerError>;
}

/// Decodes the video track of a recorded container
pub struct VideoPlayer {
    path: PathBuf,
    track: Track,
    sample_count: usize,
    decoder: Option<FrameDecoder>,
}

impl VideoPlayer {
    /// Open and validate the container, then start decoding it
    pub fn init(path: &Path) -> Result<Self, PlayerError> {
        if !path.exists() {
            return Err(PlayerError::NotFound(path.to_path_buf()));
        }

        let reader = Mp4Reader::open(BufReader::new(File::open(path)?))?;
        let track = reader.track().clone();
        let sample_count = reader.sample_count();
        let duration = reader.duration();

        let decoder = FrameDecoder::spawn(path, track.width, track.height)
            .map_err(|e| PlayerError::Decoder(format!("cannot start decoder: {}", e)))?;

        info!(
            "Opened video {}: {} {}x{}, {} samples ({:.1}s)",
            path.display(),
            track.codec,
            track.width,
            track.height,
            sample_count,
            duration.as_secs_f64()
        );

        Ok(Self {
            path: path.to_path_buf(),
            track,
            sample_count,
            decoder: Some(decoder),
        })
    }

    /// Next decoded frame, `None` once the stream is exhausted or closed
    pub fn next(&mut self) -> Result<Option<Vec<u8>>, PlayerError> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder
                .read_frame()
                .map_err(|e| PlayerError::Decoder(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.track.width, self.track.height)
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn frames_read(&self) -> u64 {
        self.decoder.as_ref().map_or(0, FrameDecoder::frames_read)
    }

    /// Stop the decoder; later `next` calls return `None`
    pub fn close(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            debug!(
                "Closing video {} after {} of {} frames",
                self.path.display(),
                decoder.frames_read(),
                self.sample_count
            );
        }
    }
}

impl VideoSource for VideoPlayer {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, PlayerError> {
        self.next()
    }

    fn size(&self) -> (u32, u32) {
        VideoPlayer::size(self)
    }
}

type RecordStream = StreamDeserializer<'static, IoRead<Box<dyn Read + Send>>, Value>;

/// Reads a metadata log: a sequence of JSON values, usually one per line
pub struct BytePlayer {
    records: RecordStream,
    records_read: u64,
    finished: bool,
}

impl BytePlayer {
    pub fn init(path: &Path) -> Result<Self, PlayerError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PlayerError::NotFound(path.to_path_buf()),
            _ => PlayerError::Io(e),
        })?;
        debug!("Opened metadata log {}", path.display());
        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        let reader: Box<dyn Read + Send> = Box::new(reader);
        Self {
            records: serde_json::Deserializer::from_reader(reader).into_iter::<Value>(),
            records_read: 0,
            finished: false,
        }
    }

    /// Next record. A record cut off by the end of the file ends the stream.
    pub fn next(&mut self) -> Result<Option<Value>, PlayerError> {
        if self.finished {
            return Ok(None);
        }
        match self.records.next() {
            Some(Ok(value)) => {
                self.records_read += 1;
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                warn!(
                    "Metadata log ends in a truncated record after {} records",
                    self.records_read
                );
                self.finished = true;
                Ok(None)
            }
            Some(Err(e)) => {
                self.finished = true;
                Err(e.into())
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }
}

impl RecordSource for BytePlayer {
    fn next_record(&mut self) -> Result<Option<Value>, PlayerError> {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn player(text: &str) -> BytePlayer {
        BytePlayer::from_reader(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn test_reads_records_in_order() {
        let mut p = player("{\"type\":2,\"packets\":[]}\n{\"type\":2,\"packets\":[{}]}\n");
        assert_eq!(p.next().unwrap().unwrap()["packets"].as_array().unwrap().len(), 0);
        assert_eq!(p.next().unwrap().unwrap()["packets"].as_array().unwrap().len(), 1);
        assert!(p.next().unwrap().is_none());
        assert!(p.next().unwrap().is_none());
        assert_eq!(p.records_read(), 2);
    }

    #[test]
    fn test_values_need_not_be_line_separated() {
        let mut p = player("{\"type\":1} {\"type\":1}{\"type\":0}");
        let mut count = 0;
        while p.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_truncated_tail_ends_stream() {
        let mut p = player("{\"type\":1,\"width\":4}\n{\"type\":1,\"wid");
        assert!(p.next().unwrap().is_some());
        assert!(p.next().unwrap().is_none());
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        let mut p = player("{\"type\":1}\nnot json\n");
        assert!(p.next().unwrap().is_some());
        assert!(matches!(p.next(), Err(PlayerError::Json(_))));
        assert!(p.next().unwrap().is_none());
    }

    #[test]
    fn test_empty_log_has_no_records() {
        assert!(player("").next().unwrap().is_none());
        assert!(player("\n  \n").next().unwrap().is_none());
    }

    #[test]
    fn test_missing_files_are_not_found() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("none.meta");
        assert!(matches!(
            BytePlayer::init(&missing),
            Err(PlayerError::NotFound(_))
        ));
        assert!(matches!(
            VideoPlayer::init(&temp.path().join("none.mp4")),
            Err(PlayerError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_video_fails_to_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.mp4");
        std::fs::write(&path, b"\x00\x00\x00\x10ftypisom garbage").unwrap();
        assert!(matches!(
            VideoPlayer::init(&path),
            Err(PlayerError::Container(_))
        ));
    }
}
