//! ffmpeg subprocess wrappers.
//!
//! Decoding recorded containers back to planar frames, and encoding raw
//! planar frames into an image sequence container, both go through an
//! `ffmpeg` process with raw video on a pipe.

use log::{debug, info, warn};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use camreplay_core::message::BYTES_PER_PIXEL;

/// ffmpeg binary, looked up on PATH
pub const FFMPEG: &str = "ffmpeg";

/// Planar 8-bit pixel format of decoded frames: three full-size planes
pub const PLANAR_PIX_FMT: &str = "gbrp";

fn frame_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// Decodes a video file into planar frames of a fixed size
pub struct FrameDecoder {
    process: Child,
    stdout: BufReader<ChildStdout>,
    frame_size: usize,
    frames_read: u64,
}

impl FrameDecoder {
    /// Start decoding `path`, scaled to `width`x`height` if it differs
    pub fn spawn(path: &Path, width: u32, height: u32) -> std::io::Result<Self> {
        let size = format!("{}x{}", width, height);
        let mut process = Command::new(FFMPEG)
            .args(["-nostdin", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", PLANAR_PIX_FMT, "-s", &size, "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = process.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ffmpeg stdout not captured")
        })?;

        let frame_size = frame_size(width, height);
        debug!(
            "Started decoder for {} ({}, {} bytes per frame)",
            path.display(),
            size,
            frame_size
        );

        Ok(Self {
            process,
            stdout: BufReader::with_capacity(frame_size * 2, stdout),
            frame_size,
            frames_read: 0,
        })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Next frame, or `None` once the decoder has no more output
    pub fn read_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut buffer = vec![0u8; self.frame_size];
        match self.stdout.read_exact(&mut buffer) {
            Ok(()) => {
                self.frames_read += 1;
                Ok(Some(buffer))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// Receives one raw planar frame per call and persists them as a sequence
pub trait ImageSequenceWriter: Send {
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Flush and finalize; called once
    fn close(&mut self) -> std::io::Result<()>;
}

/// Encodes raw planar frames with ffmpeg (H.264 in the output container)
pub struct FfmpegSequenceWriter {
    process: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    frame_count: u64,
}

/// Collect a child's stderr on its own thread so the pipe never fills up
fn collect_stderr(mut pipe: ChildStderr) -> std::io::Result<JoinHandle<String>> {
    std::thread::Builder::new()
        .name("ffmpeg-stderr".into())
        .spawn(move || {
            let mut output = String::new();
            if let Err(e) = pipe.read_to_string(&mut output) {
                debug!("Reading ffmpeg stderr failed: {}", e);
            }
            output
        })
}

impl FfmpegSequenceWriter {
    pub fn spawn(path: &Path, width: u32, height: u32, fps: u32) -> std::io::Result<Self> {
        let size = format!("{}x{}", width, height);
        let rate = fps.to_string();
        let mut process = Command::new(FFMPEG)
            .args(["-y", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", PLANAR_PIX_FMT])
            .args(["-s", &size, "-r", &rate, "-i", "-"])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = process.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ffmpeg stdin not captured")
        })?;
        let stderr = process.stderr.take().map(collect_stderr).transpose()?;

        info!("Encoding raw frames ({} @ {} fps) to {}", size, fps, path.display());
        Ok(Self {
            process,
            stdin: Some(stdin),
            stderr,
            frame_count: 0,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl ImageSequenceWriter for FfmpegSequenceWriter {
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "encoder already closed")
        })?;
        stdin.write_all(frame)?;
        self.frame_count += 1;
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        // EOF on stdin ends the encode
        let Some(stdin) = self.stdin.take() else {
            return Ok(());
        };
        drop(stdin);

        let status = self.process.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        if !status.success() {
            warn!("ffmpeg encoder exited with {}: {}", status, stderr.trim());
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("ffmpeg exited with {}", status),
            ));
        }

        info!("Encoder finished: {} frames written", self.frame_count);
        Ok(())
    }
}

impl Drop for FfmpegSequenceWriter {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            let _ = self.close();
        }
    }
}
