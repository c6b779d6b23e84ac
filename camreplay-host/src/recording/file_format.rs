//! MP4 (ISO base media file) container writing and reading.
//!
//! Recordings hold a single video track. The writer streams samples straight
//! into `mdat` and writes the sample tables in `moov` when finished:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ ftyp                     │  isom, iso2, avc1, mp41
//! ├──────────────────────────┤
//! │ mdat (64-bit size)       │  size patched by finish()
//! │   sample 0               │  length-prefixed NAL units or one JPEG
//! │   sample 1               │
//! │   ...                    │
//! ├──────────────────────────┤
//! │ moov                     │  mvhd, iods, trak/mdia/minf/stbl
//! └──────────────────────────┘
//! ```

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Duration;

use camreplay_core::nal::START_CODE;
use serde::{Deserialize, Serialize};

use crate::error::ContainerError;

/// Movie and media timescale used unless configured otherwise
pub const DEFAULT_TIMESCALE: u32 = 90_000;

/// Video profile level indication written to `iods` once a track exists
pub const VIDEO_PROFILE_LEVEL: u8 = 0x7F;

/// "No capability required" profile level
const NO_PROFILE_LEVEL: u8 = 0xFF;

/// Track id of the one video track
pub const VIDEO_TRACK_ID: u32 = 1;

/// Bytes in each NAL unit length prefix
pub const NAL_LENGTH_SIZE: usize = 4;

/// mdat header: 32-bit size of 1, type, 64-bit size
const MDAT_HEADER_SIZE: u64 = 16;

/// Largest moov accepted by the reader
const MAX_MOOV_SIZE: u64 = 256 * 1024 * 1024;

/// Offset of child boxes inside a visual sample entry body
const VISUAL_SAMPLE_ENTRY_SIZE: usize = 78;

/// Sample entry type of the video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrackCodec {
    /// H.264 with an `avcC` configuration record
    Avc1,
    /// Motion JPEG, one complete JPEG per sample
    Jpeg,
}

impl TrackCodec {
    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            TrackCodec::Avc1 => b"avc1",
            TrackCodec::Jpeg => b"jpeg",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"avc1" => Some(TrackCodec::Avc1),
            b"jpeg" => Some(TrackCodec::Jpeg),
            _ => None,
        }
    }
}

/// Video track description shared by writer and reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub track_id: u32,
    pub codec: TrackCodec,
    pub timescale: u32,
    /// Duration of every sample in timescale units
    pub sample_duration: u32,
    pub width: u32,
    pub height: u32,
    /// profile_idc, constraint flags, level_idc (H.264 only)
    pub profile: [u8; 3],
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

/// Location of one sample in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub offset: u64,
    pub size: u32,
    /// Sync sample (keyframe)
    pub sync: bool,
}

/// Streaming MP4 writer for a single video track.
pub struct Mp4Writer<W: Write + Seek> {
    writer: W,
    timescale: u32,
    /// Current end of written data
    position: u64,
    mdat_offset: u64,
    video_profile_level: u8,
    track: Option<Track>,
    samples: Vec<SampleInfo>,
}

impl<W: Write + Seek> Mp4Writer<W> {
    /// Write `ftyp` and an open `mdat` header.
    pub fn new(mut writer: W, timescale: u32) -> Result<Self, ContainerError> {
        if timescale == 0 {
            return Err(ContainerError::Invalid("timescale must be positive".into()));
        }
        let start = writer.stream_position()?;

        let mut head = Vec::with_capacity(64);
        write_ftyp(&mut head);
        let mdat_offset = start + head.len() as u64;
        head.extend_from_slice(&1u32.to_be_bytes());
        head.extend_from_slice(b"mdat");
        head.extend_from_slice(&MDAT_HEADER_SIZE.to_be_bytes()); // patched by finish()
        writer.write_all(&head)?;

        Ok(Self {
            writer,
            timescale,
            position: start + head.len() as u64,
            mdat_offset,
            video_profile_level: NO_PROFILE_LEVEL,
            track: None,
            samples: Vec::new(),
        })
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    pub fn samples(&self) -> &[SampleInfo] {
        &self.samples
    }

    /// Create the H.264 track. Fails if a track already exists.
    pub fn add_h264_track(
        &mut self,
        width: u32,
        height: u32,
        sample_duration: u32,
        profile: [u8; 3],
    ) -> Result<u32, ContainerError> {
        self.add_track(TrackCodec::Avc1, width, height, sample_duration, profile)
    }

    /// Create the MJPEG track. Fails if a track already exists.
    pub fn add_jpeg_track(
        &mut self,
        width: u32,
        height: u32,
        sample_duration: u32,
    ) -> Result<u32, ContainerError> {
        self.add_track(TrackCodec::Jpeg, width, height, sample_duration, [0; 3])
    }

    fn add_track(
        &mut self,
        codec: TrackCodec,
        width: u32,
        height: u32,
        sample_duration: u32,
        profile: [u8; 3],
    ) -> Result<u32, ContainerError> {
        if self.track.is_some() {
            return Err(ContainerError::TrackExists);
        }
        self.track = Some(Track {
            track_id: VIDEO_TRACK_ID,
            codec,
            timescale: self.timescale,
            sample_duration,
            width,
            height,
            profile,
            sps: Vec::new(),
            pps: Vec::new(),
        });
        Ok(VIDEO_TRACK_ID)
    }

    pub fn set_video_profile_level(&mut self, level: u8) {
        self.video_profile_level = level;
    }

    /// Attach a sequence parameter set (without start code). Returns false
    /// for a duplicate.
    pub fn add_sequence_parameter_set(
        &mut self,
        track_id: u32,
        sps: &[u8],
    ) -> Result<bool, ContainerError> {
        let track = self.track_mut(track_id)?;
        Ok(push_unique(&mut track.sps, sps))
    }

    /// Attach a picture parameter set (without start code). Returns false
    /// for a duplicate.
    pub fn add_picture_parameter_set(
        &mut self,
        track_id: u32,
        pps: &[u8],
    ) -> Result<bool, ContainerError> {
        let track = self.track_mut(track_id)?;
        Ok(push_unique(&mut track.pps, pps))
    }

    fn track_mut(&mut self, track_id: u32) -> Result<&mut Track, ContainerError> {
        match self.track.as_mut() {
            Some(track) if track.track_id == track_id => Ok(track),
            _ => Err(ContainerError::NoSuchTrack(track_id)),
        }
    }

    /// Append one sample to `mdat`.
    ///
    /// A failed write leaves the sample out of the sample tables; any bytes
    /// already written stay unreferenced in `mdat`.
    pub fn write_sample(
        &mut self,
        track_id: u32,
        data: &[u8],
        sync: bool,
    ) -> Result<(), ContainerError> {
        self.track_mut(track_id)?;
        let size = u32::try_from(data.len())
            .map_err(|_| ContainerError::Invalid(format!("sample of {} bytes", data.len())))?;

        let offset = self.position;
        if let Err(e) = self.writer.write_all(data) {
            self.position = self.writer.stream_position()?;
            return Err(e.into());
        }
        self.position += data.len() as u64;
        self.samples.push(SampleInfo { offset, size, sync });
        Ok(())
    }

    /// Total duration in timescale units
    pub fn duration(&self) -> u64 {
        self.track
            .as_ref()
            .map(|t| self.samples.len() as u64 * t.sample_duration as u64)
            .unwrap_or(0)
    }

    /// Write `moov`, patch the `mdat` size and flush.
    pub fn finish(mut self) -> Result<W, ContainerError> {
        let moov = self.build_moov();
        let moov_offset = self.position;
        self.writer.write_all(&moov)?;

        let mdat_size = moov_offset - self.mdat_offset;
        self.writer.seek(SeekFrom::Start(self.mdat_offset + 8))?;
        self.writer.write_all(&mdat_size.to_be_bytes())?;
        self.writer
            .seek(SeekFrom::Start(moov_offset + moov.len() as u64))?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn build_moov(&self) -> Vec<u8> {
        let duration = self.duration();
        let mut buf = Vec::with_capacity(1024 + self.samples.len() * 16);
        write_box(&mut buf, b"moov", |buf| {
            write_mvhd(buf, self.timescale, duration);
            write_iods(buf, self.video_profile_level);
            if let Some(track) = &self.track {
                write_trak(buf, track, &self.samples, duration);
            }
        });
        buf
    }
}

fn push_unique(sets: &mut Vec<Vec<u8>>, set: &[u8]) -> bool {
    if sets.iter().any(|s| s == set) {
        return false;
    }
    sets.push(set.to_vec());
    true
}

// Box writing

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Append a box, sizing it after `body` has written its content.
fn write_box(buf: &mut Vec<u8>, kind: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(kind);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(
    buf: &mut Vec<u8>,
    kind: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut Vec<u8>),
) {
    write_box(buf, kind, |buf| {
        buf.push(version);
        buf.extend_from_slice(&flags.to_be_bytes()[1..]);
        body(buf);
    });
}

/// Creation time, modification time, `middle`, duration; 64-bit times when
/// `wide` (version 1).
fn put_times(buf: &mut Vec<u8>, wide: bool, middle: &[u8], duration: u64) {
    if wide {
        put_u64(buf, 0);
        put_u64(buf, 0);
        buf.extend_from_slice(middle);
        put_u64(buf, duration);
    } else {
        put_u32(buf, 0);
        put_u32(buf, 0);
        buf.extend_from_slice(middle);
        put_u32(buf, duration as u32);
    }
}

fn put_matrix(buf: &mut Vec<u8>) {
    for m in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        put_u32(buf, m);
    }
}

fn write_ftyp(buf: &mut Vec<u8>) {
    write_box(buf, b"ftyp", |buf| {
        buf.extend_from_slice(b"isom"); // major brand
        put_u32(buf, 0x200); // minor version
        for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
            buf.extend_from_slice(brand);
        }
    });
}

fn write_mvhd(buf: &mut Vec<u8>, timescale: u32, duration: u64) {
    let wide = duration > u32::MAX as u64;
    write_full_box(buf, b"mvhd", wide as u8, 0, |buf| {
        put_times(buf, wide, &timescale.to_be_bytes(), duration);
        put_u32(buf, 0x0001_0000); // rate 1.0
        put_u16(buf, 0x0100); // volume 1.0
        buf.extend_from_slice(&[0; 10]);
        put_matrix(buf);
        buf.extend_from_slice(&[0; 24]); // pre_defined
        put_u32(buf, VIDEO_TRACK_ID + 1); // next_track_id
    });
}

fn write_iods(buf: &mut Vec<u8>, video_profile_level: u8) {
    write_full_box(buf, b"iods", 0, 0, |buf| {
        // MP4_IOD_Tag, 7 byte payload
        buf.extend_from_slice(&[0x10, 0x07]);
        // ObjectDescriptorID 1, no URL, no inline profiles
        buf.extend_from_slice(&[0x00, 0x4F]);
        buf.extend_from_slice(&[
            NO_PROFILE_LEVEL, // OD
            NO_PROFILE_LEVEL, // scene
            NO_PROFILE_LEVEL, // audio
            video_profile_level,
            NO_PROFILE_LEVEL, // graphics
        ]);
    });
}

fn write_trak(buf: &mut Vec<u8>, track: &Track, samples: &[SampleInfo], duration: u64) {
    let wide = duration > u32::MAX as u64;
    write_box(buf, b"trak", |buf| {
        // flags: enabled | in movie
        write_full_box(buf, b"tkhd", wide as u8, 0x3, |buf| {
            let mut middle = Vec::with_capacity(8);
            put_u32(&mut middle, track.track_id);
            put_u32(&mut middle, 0);
            put_times(buf, wide, &middle, duration);
            buf.extend_from_slice(&[0; 8]);
            put_u16(buf, 0); // layer
            put_u16(buf, 0); // alternate group
            put_u16(buf, 0); // volume
            put_u16(buf, 0);
            put_matrix(buf);
            put_u32(buf, track.width << 16);
            put_u32(buf, track.height << 16);
        });

        write_box(buf, b"mdia", |buf| {
            write_full_box(buf, b"mdhd", wide as u8, 0, |buf| {
                put_times(buf, wide, &track.timescale.to_be_bytes(), duration);
                put_u16(buf, 0x55C4); // "und"
                put_u16(buf, 0);
            });
            write_full_box(buf, b"hdlr", 0, 0, |buf| {
                put_u32(buf, 0);
                buf.extend_from_slice(b"vide");
                buf.extend_from_slice(&[0; 12]);
                buf.extend_from_slice(b"VideoHandler\0");
            });
            write_box(buf, b"minf", |buf| {
                write_full_box(buf, b"vmhd", 0, 1, |buf| {
                    buf.extend_from_slice(&[0; 8]);
                });
                write_box(buf, b"dinf", |buf| {
                    write_full_box(buf, b"dref", 0, 0, |buf| {
                        put_u32(buf, 1);
                        // self-contained
                        write_full_box(buf, b"url ", 0, 1, |_| {});
                    });
                });
                write_stbl(buf, track, samples);
            });
        });
    });
}

fn write_stbl(buf: &mut Vec<u8>, track: &Track, samples: &[SampleInfo]) {
    write_box(buf, b"stbl", |buf| {
        write_full_box(buf, b"stsd", 0, 0, |buf| {
            put_u32(buf, 1);
            write_sample_entry(buf, track);
        });

        write_full_box(buf, b"stts", 0, 0, |buf| {
            if samples.is_empty() {
                put_u32(buf, 0);
            } else {
                put_u32(buf, 1);
                put_u32(buf, samples.len() as u32);
                put_u32(buf, track.sample_duration);
            }
        });

        // Without stss every sample is a sync sample, which is right for JPEG
        if track.codec == TrackCodec::Avc1 {
            write_full_box(buf, b"stss", 0, 0, |buf| {
                let sync: Vec<u32> = samples
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.sync)
                    .map(|(i, _)| i as u32 + 1)
                    .collect();
                put_u32(buf, sync.len() as u32);
                for number in sync {
                    put_u32(buf, number);
                }
            });
        }

        // One sample per chunk
        write_full_box(buf, b"stsc", 0, 0, |buf| {
            if samples.is_empty() {
                put_u32(buf, 0);
            } else {
                put_u32(buf, 1);
                put_u32(buf, 1);
                put_u32(buf, 1);
                put_u32(buf, 1);
            }
        });

        write_full_box(buf, b"stsz", 0, 0, |buf| {
            put_u32(buf, 0);
            put_u32(buf, samples.len() as u32);
            for sample in samples {
                put_u32(buf, sample.size);
            }
        });

        let wide = samples
            .last()
            .is_some_and(|s| s.offset > u32::MAX as u64);
        if wide {
            write_full_box(buf, b"co64", 0, 0, |buf| {
                put_u32(buf, samples.len() as u32);
                for sample in samples {
                    put_u64(buf, sample.offset);
                }
            });
        } else {
            write_full_box(buf, b"stco", 0, 0, |buf| {
                put_u32(buf, samples.len() as u32);
                for sample in samples {
                    put_u32(buf, sample.offset as u32);
                }
            });
        }
    });
}

fn write_sample_entry(buf: &mut Vec<u8>, track: &Track) {
    write_box(buf, track.codec.fourcc(), |buf| {
        buf.extend_from_slice(&[0; 6]);
        put_u16(buf, 1); // data_reference_index
        buf.extend_from_slice(&[0; 16]);
        put_u16(buf, track.width.min(u16::MAX as u32) as u16);
        put_u16(buf, track.height.min(u16::MAX as u32) as u16);
        put_u32(buf, 0x0048_0000); // 72 dpi
        put_u32(buf, 0x0048_0000);
        put_u32(buf, 0);
        put_u16(buf, 1); // frame_count

        let mut compressor = [0u8; 32];
        let name = b"camreplay";
        compressor[0] = name.len() as u8;
        compressor[1..1 + name.len()].copy_from_slice(name);
        buf.extend_from_slice(&compressor);

        put_u16(buf, 0x0018); // depth
        buf.extend_from_slice(&(-1i16).to_be_bytes());

        if track.codec == TrackCodec::Avc1 {
            write_avcc(buf, track);
        }
    });
}

fn write_avcc(buf: &mut Vec<u8>, track: &Track) {
    write_box(buf, b"avcC", |buf| {
        buf.push(1); // configuration_version
        buf.extend_from_slice(&track.profile);
        buf.push(0xFC | (NAL_LENGTH_SIZE as u8 - 1));
        buf.push(0xE0 | (track.sps.len() as u8 & 0x1F));
        for sps in &track.sps {
            put_u16(buf, sps.len() as u16);
            buf.extend_from_slice(sps);
        }
        buf.push(track.pps.len() as u8);
        for pps in &track.pps {
            put_u16(buf, pps.len() as u16);
            buf.extend_from_slice(pps);
        }
    });
}

// Box reading

/// Big-endian cursor over a box body
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ContainerError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ContainerError::Invalid("truncated box".into()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), ContainerError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ContainerError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ContainerError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ContainerError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ContainerError> {
        let b = self.bytes(8)?;
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        Ok(u64::from_be_bytes(v))
    }

    /// Version byte of a full box; the flags are skipped
    fn version(&mut self) -> Result<u8, ContainerError> {
        let version = self.u8()?;
        self.skip(3)?;
        Ok(version)
    }

    /// Entry count of a table whose entries are `entry_size` bytes each.
    /// Counts that cannot fit in the rest of the box are rejected.
    fn table_len(&mut self, table: &str, entry_size: usize) -> Result<usize, ContainerError> {
        let count = self.u32()? as usize;
        let remaining = self.data.len() - self.pos;
        if count > remaining / entry_size {
            return Err(ContainerError::Invalid(format!(
                "{} claims {} entries in {} bytes",
                table, count, remaining
            )));
        }
        Ok(count)
    }
}

/// Iterator over the (type, body) pairs of consecutive boxes.
/// Stops at the first malformed header.
struct Boxes<'a> {
    data: &'a [u8],
    pos: usize,
}

fn boxes(data: &[u8]) -> Boxes<'_> {
    Boxes { data, pos: 0 }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = ([u8; 4], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.pos..)?;
        if rest.len() < 8 {
            return None;
        }
        let size32 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as u64;
        let kind = [rest[4], rest[5], rest[6], rest[7]];
        let (size, header) = match size32 {
            0 => (rest.len() as u64, 8),
            1 => {
                let large = rest.get(8..16)?;
                let mut v = [0u8; 8];
                v.copy_from_slice(large);
                (u64::from_be_bytes(v), 16)
            }
            n => (n, 8),
        };
        if size < header as u64 || size > rest.len() as u64 {
            self.pos = self.data.len();
            return None;
        }
        self.pos += size as usize;
        Some((kind, &rest[header..size as usize]))
    }
}

fn find_box<'a>(data: &'a [u8], kind: &[u8; 4]) -> Option<&'a [u8]> {
    boxes(data).find(|(k, _)| k == kind).map(|(_, body)| body)
}

fn find_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    path.iter().try_fold(data, |data, kind| find_box(data, kind))
}

fn require<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Result<&'a [u8], ContainerError> {
    find_path(data, path).ok_or_else(|| {
        let names: Vec<String> = path
            .iter()
            .map(|k| String::from_utf8_lossy(&k[..]).into_owned())
            .collect();
        ContainerError::Invalid(format!("missing {} box", names.join("/")))
    })
}

/// Read the body of the top-level `moov` box, along with the file length.
fn read_moov<R: Read + Seek>(reader: &mut R) -> Result<(Vec<u8>, u64), ContainerError> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let mut pos = reader.seek(SeekFrom::Start(0))?;

    while pos + 8 <= file_len {
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let kind = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            0 => (file_len - pos, 8),
            1 => {
                let mut large = [0u8; 8];
                reader.read_exact(&mut large)?;
                (u64::from_be_bytes(large), 16)
            }
            n => (n, 8),
        };
        if size < header_len || size > file_len - pos {
            return Err(ContainerError::Invalid(format!(
                "box '{}' at {} has bad size {}",
                String::from_utf8_lossy(&kind),
                pos,
                size
            )));
        }

        if &kind == b"moov" {
            let body_len = size - header_len;
            if body_len > MAX_MOOV_SIZE {
                return Err(ContainerError::Invalid(format!("moov of {} bytes", body_len)));
            }
            let mut body = vec![0u8; body_len as usize];
            reader.read_exact(&mut body)?;
            return Ok((body, file_len));
        }

        pos = reader.seek(SeekFrom::Start(pos + size))?;
    }

    Err(ContainerError::Invalid("no moov box".into()))
}

fn parse_iods(body: &[u8]) -> Option<u8> {
    // version/flags, tag, length, OD id (2), OD, scene, audio, video
    let mut r = ByteReader::new(body);
    r.version().ok()?;
    if r.u8().ok()? != 0x10 {
        return None;
    }
    // Descriptor length may use the 4-byte extended form
    let mut len = r.u8().ok()?;
    while len & 0x80 != 0 {
        len = r.u8().ok()?;
    }
    r.skip(5).ok()?;
    r.u8().ok()
}

fn is_video_trak(trak: &[u8]) -> bool {
    find_path(trak, &[b"mdia", b"hdlr"])
        .and_then(|hdlr| hdlr.get(8..12))
        .is_some_and(|handler| handler == b"vide")
}

struct AvcConfig {
    profile: [u8; 3],
    sps: Vec<Vec<u8>>,
    pps: Vec<Vec<u8>>,
}

fn parse_avcc(body: &[u8]) -> Result<AvcConfig, ContainerError> {
    let mut r = ByteReader::new(body);
    r.skip(1)?;
    let profile = [r.u8()?, r.u8()?, r.u8()?];
    let length_size = (r.u8()? & 0x03) as usize + 1;
    if length_size != NAL_LENGTH_SIZE {
        return Err(ContainerError::Invalid(format!(
            "{}-byte NAL length prefixes",
            length_size
        )));
    }

    let sps_count = r.u8()? & 0x1F;
    let mut sps = Vec::with_capacity(sps_count as usize);
    for _ in 0..sps_count {
        let len = r.u16()? as usize;
        sps.push(r.bytes(len)?.to_vec());
    }
    let pps_count = r.u8()?;
    let mut pps = Vec::with_capacity(pps_count as usize);
    for _ in 0..pps_count {
        let len = r.u16()? as usize;
        pps.push(r.bytes(len)?.to_vec());
    }

    Ok(AvcConfig { profile, sps, pps })
}

fn parse_track(trak: &[u8], file_len: u64) -> Result<(Track, Vec<SampleInfo>), ContainerError> {
    let tkhd = require(trak, &[b"tkhd"])?;
    let mut r = ByteReader::new(tkhd);
    let track_id = if r.version()? == 1 {
        r.skip(16)?;
        r.u32()?
    } else {
        r.skip(8)?;
        r.u32()?
    };

    let mdhd = require(trak, &[b"mdia", b"mdhd"])?;
    let mut r = ByteReader::new(mdhd);
    let timescale = if r.version()? == 1 {
        r.skip(16)?;
        r.u32()?
    } else {
        r.skip(8)?;
        r.u32()?
    };

    let stbl = require(trak, &[b"mdia", b"minf", b"stbl"])?;

    // Sample description: first entry only
    let stsd = require(stbl, &[b"stsd"])?;
    let (fourcc, entry) = stsd
        .get(8..)
        .and_then(|entries| boxes(entries).next())
        .ok_or_else(|| ContainerError::Invalid("empty stsd".into()))?;
    let codec = TrackCodec::from_fourcc(&fourcc).ok_or_else(|| {
        ContainerError::UnsupportedCodec(String::from_utf8_lossy(&fourcc).into_owned())
    })?;
    let mut r = ByteReader::new(entry);
    r.skip(24)?;
    let width = r.u16()? as u32;
    let height = r.u16()? as u32;

    let (profile, sps, pps) = match codec {
        TrackCodec::Avc1 => {
            let children = entry.get(VISUAL_SAMPLE_ENTRY_SIZE..).unwrap_or(&[]);
            let avcc = find_box(children, b"avcC")
                .ok_or_else(|| ContainerError::Invalid("avc1 without avcC".into()))?;
            let config = parse_avcc(avcc)?;
            (config.profile, config.sps, config.pps)
        }
        TrackCodec::Jpeg => ([0; 3], Vec::new(), Vec::new()),
    };

    // Sample durations; every writer we accept uses a constant duration,
    // the first run's duration is taken for the track
    let stts = require(stbl, &[b"stts"])?;
    let mut r = ByteReader::new(stts);
    r.version()?;
    let runs = r.table_len("stts", 8)?;
    let mut timed_samples = 0usize;
    let mut sample_duration = 0;
    for run in 0..runs {
        let count = r.u32()? as usize;
        let delta = r.u32()?;
        if run == 0 {
            sample_duration = delta;
        }
        timed_samples = timed_samples
            .checked_add(count)
            .ok_or_else(|| ContainerError::Invalid("stts sample count overflows".into()))?;
    }

    // Sample sizes
    let stsz = require(stbl, &[b"stsz"])?;
    let mut r = ByteReader::new(stsz);
    r.version()?;
    let fixed_size = r.u32()?;
    let count = if fixed_size != 0 {
        r.u32()? as usize
    } else {
        r.table_len("stsz", 4)?
    };
    if count != timed_samples {
        return Err(ContainerError::Invalid(format!(
            "stsz lists {} samples, stts times {}",
            count, timed_samples
        )));
    }
    let sizes: Vec<u32> = if fixed_size != 0 {
        if (count as u64).saturating_mul(fixed_size as u64) > file_len {
            return Err(ContainerError::Invalid(format!(
                "{} samples of {} bytes exceed the {} byte file",
                count, fixed_size, file_len
            )));
        }
        vec![fixed_size; count]
    } else {
        (0..count).map(|_| r.u32()).collect::<Result<_, _>>()?
    };

    // Chunk offsets
    let chunk_offsets: Vec<u64> = if let Some(stco) = find_box(stbl, b"stco") {
        let mut r = ByteReader::new(stco);
        r.version()?;
        let n = r.table_len("stco", 4)?;
        (0..n).map(|_| r.u32().map(u64::from)).collect::<Result<_, _>>()?
    } else {
        let co64 = require(stbl, &[b"co64"])?;
        let mut r = ByteReader::new(co64);
        r.version()?;
        let n = r.table_len("co64", 8)?;
        (0..n).map(|_| r.u64()).collect::<Result<_, _>>()?
    };

    // Sample to chunk runs: (first_chunk, samples_per_chunk)
    let stsc = require(stbl, &[b"stsc"])?;
    let mut r = ByteReader::new(stsc);
    r.version()?;
    let n = r.table_len("stsc", 12)?;
    let mut runs = Vec::with_capacity(n);
    for _ in 0..n {
        let first_chunk = r.u32()?;
        let per_chunk = r.u32()?;
        r.skip(4)?;
        runs.push((first_chunk, per_chunk));
    }

    let sync_samples: Option<Vec<u32>> = match find_box(stbl, b"stss") {
        Some(stss) => {
            let mut r = ByteReader::new(stss);
            r.version()?;
            let n = r.table_len("stss", 4)?;
            Some((0..n).map(|_| r.u32()).collect::<Result<_, _>>()?)
        }
        None => None,
    };

    let mut samples = Vec::with_capacity(sizes.len());
    let mut next = 0usize;
    for (chunk_index, chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = chunk_index as u32 + 1;
        let per_chunk = runs
            .iter()
            .rev()
            .find(|(first, _)| *first <= chunk_number)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        let mut offset = *chunk_offset;
        for _ in 0..per_chunk {
            let Some(&size) = sizes.get(next) else { break };
            let number = next as u32 + 1;
            let sync = sync_samples
                .as_ref()
                .map_or(true, |s| s.binary_search(&number).is_ok());
            let end = offset
                .checked_add(size as u64)
                .filter(|end| *end <= file_len)
                .ok_or_else(|| {
                    ContainerError::Invalid(format!("sample {} runs past the end of the file", number))
                })?;
            samples.push(SampleInfo { offset, size, sync });
            offset = end;
            next += 1;
        }
    }
    if samples.len() != sizes.len() {
        return Err(ContainerError::Invalid(format!(
            "chunk tables cover {} of {} samples",
            samples.len(),
            sizes.len()
        )));
    }

    let track = Track {
        track_id,
        codec,
        timescale,
        sample_duration,
        width,
        height,
        profile,
        sps,
        pps,
    };
    Ok((track, samples))
}

/// Reader for containers with one video track (the first one is used).
pub struct Mp4Reader<R: Read + Seek> {
    reader: R,
    track: Track,
    samples: Vec<SampleInfo>,
    video_profile_level: Option<u8>,
    next_sample: usize,
}

impl<R: Read + Seek> Mp4Reader<R> {
    /// Parse `moov` and build the sample table
    pub fn open(mut reader: R) -> Result<Self, ContainerError> {
        let (moov, file_len) = read_moov(&mut reader)?;
        let video_profile_level = find_box(&moov, b"iods").and_then(parse_iods);

        let trak = boxes(&moov)
            .filter(|(kind, _)| kind == b"trak")
            .map(|(_, body)| body)
            .find(|trak| is_video_trak(trak))
            .ok_or_else(|| ContainerError::Invalid("no video track".into()))?;
        let (track, samples) = parse_track(trak, file_len)?;

        Ok(Self {
            reader,
            track,
            samples,
            video_profile_level,
            next_sample: 0,
        })
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn samples(&self) -> &[SampleInfo] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn video_profile_level(&self) -> Option<u8> {
        self.video_profile_level
    }

    /// Track duration
    pub fn duration(&self) -> Duration {
        if self.track.timescale == 0 {
            return Duration::ZERO;
        }
        let units = self.samples.len() as u64 * self.track.sample_duration as u64;
        Duration::from_nanos(
            (units as u128 * 1_000_000_000 / self.track.timescale as u128) as u64,
        )
    }

    /// Read sample `index` as stored (length-prefixed for H.264)
    pub fn read_sample_at(&mut self, index: usize) -> Result<Vec<u8>, ContainerError> {
        let info = *self
            .samples
            .get(index)
            .ok_or_else(|| ContainerError::Invalid(format!("no sample {}", index)))?;
        self.reader.seek(SeekFrom::Start(info.offset))?;
        let mut data = vec![0u8; info.size as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Next sample in decode order
    pub fn read_sample(&mut self) -> Result<Option<Vec<u8>>, ContainerError> {
        if self.next_sample >= self.samples.len() {
            return Ok(None);
        }
        let data = self.read_sample_at(self.next_sample)?;
        self.next_sample += 1;
        Ok(Some(data))
    }

    /// Next sample as an Annex-B access unit. Sync samples get the track's
    /// parameter sets in front. JPEG samples are returned unchanged.
    pub fn read_annex_b_sample(&mut self) -> Result<Option<Vec<u8>>, ContainerError> {
        let index = self.next_sample;
        let Some(sample) = self.read_sample()? else {
            return Ok(None);
        };
        if self.track.codec != TrackCodec::Avc1 {
            return Ok(Some(sample));
        }

        let mut out = Vec::with_capacity(sample.len() + 64);
        if self.samples[index].sync {
            for set in self.track.sps.iter().chain(self.track.pps.iter()) {
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(set);
            }
        }

        let mut r = ByteReader::new(&sample);
        while r.pos < sample.len() {
            let len = r.u32()? as usize;
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(r.bytes(len)?);
        }
        Ok(Some(out))
    }

    /// All remaining samples as Annex-B access units
    pub fn annex_b_samples(
        &mut self,
    ) -> impl Iterator<Item = Result<Vec<u8>, ContainerError>> + '_ {
        std::iter::from_fn(move || self.read_annex_b_sample().transpose())
    }

    pub fn rewind(&mut self) {
        self.next_sample = 0;
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9];
    const PPS: &[u8] = &[0x68, 0xeb, 0xe3, 0xcb];

    fn length_prefixed(nal: &[u8]) -> Vec<u8> {
        let mut out = (nal.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(nal);
        out
    }

    fn h264_file(samples: &[(&[u8], bool)]) -> Vec<u8> {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), DEFAULT_TIMESCALE).unwrap();
        let id = writer
            .add_h264_track(640, 480, 3000, [0x64, 0x00, 0x1f])
            .unwrap();
        writer.set_video_profile_level(VIDEO_PROFILE_LEVEL);
        writer.add_sequence_parameter_set(id, SPS).unwrap();
        writer.add_picture_parameter_set(id, PPS).unwrap();
        for (nal, sync) in samples {
            writer.write_sample(id, &length_prefixed(nal), *sync).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_h264_track_roundtrip() {
        let idr: &[u8] = &[0x65, 0x88, 0x84, 0x00];
        let p: &[u8] = &[0x41, 0x9a, 0x02];
        let bytes = h264_file(&[(idr, true), (p, false), (p, false)]);

        let mut reader = Mp4Reader::open(Cursor::new(bytes)).unwrap();
        let track = reader.track().clone();
        assert_eq!(track.codec, TrackCodec::Avc1);
        assert_eq!((track.width, track.height), (640, 480));
        assert_eq!(track.timescale, DEFAULT_TIMESCALE);
        assert_eq!(track.sample_duration, 3000);
        assert_eq!(track.profile, [0x64, 0x00, 0x1f]);
        assert_eq!(track.sps, vec![SPS.to_vec()]);
        assert_eq!(track.pps, vec![PPS.to_vec()]);
        assert_eq!(reader.video_profile_level(), Some(VIDEO_PROFILE_LEVEL));

        let sync: Vec<bool> = reader.samples().iter().map(|s| s.sync).collect();
        assert_eq!(sync, vec![true, false, false]);
        assert_eq!(reader.duration(), Duration::from_millis(100));

        assert_eq!(reader.read_sample().unwrap().unwrap(), length_prefixed(idr));
        assert_eq!(reader.read_sample().unwrap().unwrap(), length_prefixed(p));
    }

    #[test]
    fn test_annex_b_export_prepends_parameter_sets() {
        let idr: &[u8] = &[0x65, 0x10];
        let p: &[u8] = &[0x41, 0x20];
        let bytes = h264_file(&[(idr, true), (p, false)]);
        let mut reader = Mp4Reader::open(Cursor::new(bytes)).unwrap();

        let units: Vec<Vec<u8>> = reader.annex_b_samples().collect::<Result<_, _>>().unwrap();
        assert_eq!(units.len(), 2);

        let mut key = Vec::new();
        for nal in [SPS, PPS, idr] {
            key.extend_from_slice(&START_CODE);
            key.extend_from_slice(nal);
        }
        assert_eq!(units[0], key);
        assert_eq!(units[1], [&START_CODE[..], p].concat());
    }

    #[test]
    fn test_mdat_size_is_patched() {
        let bytes = h264_file(&[(&[0x65, 1, 2, 3], true)]);
        let ftyp_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(&bytes[ftyp_len + 4..ftyp_len + 8], b"mdat");
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[ftyp_len + 8..ftyp_len + 16]);
        // header + one sample of 4 + 4 bytes
        assert_eq!(u64::from_be_bytes(size), MDAT_HEADER_SIZE + 8);
        assert_eq!(&bytes[ftyp_len + 28..ftyp_len + 32], b"moov");
    }

    #[test]
    fn test_jpeg_track_has_no_stss() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), DEFAULT_TIMESCALE).unwrap();
        let id = writer.add_jpeg_track(320, 240, 3000).unwrap();
        writer.write_sample(id, &[0xFF, 0xD8, 0xFF, 0xD9], true).unwrap();
        writer.write_sample(id, &[0xFF, 0xD8, 0x00, 0xFF, 0xD9], true).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let mut reader = Mp4Reader::open(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.track().codec, TrackCodec::Jpeg);
        assert_eq!(reader.sample_count(), 2);
        assert!(reader.samples().iter().all(|s| s.sync));
        assert_eq!(reader.read_sample_at(1).unwrap(), vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9]);
    }

    #[test]
    fn test_second_track_rejected() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), DEFAULT_TIMESCALE).unwrap();
        writer.add_jpeg_track(320, 240, 3000).unwrap();
        assert!(matches!(
            writer.add_h264_track(320, 240, 3000, [0; 3]),
            Err(ContainerError::TrackExists)
        ));
    }

    #[test]
    fn test_parameter_sets_are_deduplicated() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), DEFAULT_TIMESCALE).unwrap();
        let id = writer.add_h264_track(16, 16, 3000, [0x42, 0, 0x1e]).unwrap();
        assert!(writer.add_picture_parameter_set(id, PPS).unwrap());
        assert!(!writer.add_picture_parameter_set(id, PPS).unwrap());
        assert_eq!(writer.track().unwrap().pps.len(), 1);
    }

    #[test]
    fn test_sample_without_track_fails() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), DEFAULT_TIMESCALE).unwrap();
        assert!(matches!(
            writer.write_sample(VIDEO_TRACK_ID, &[1, 2, 3], true),
            Err(ContainerError::NoSuchTrack(VIDEO_TRACK_ID))
        ));
        assert!(writer.samples().is_empty());
    }

    #[test]
    fn test_container_without_track_has_no_video() {
        let writer = Mp4Writer::new(Cursor::new(Vec::new()), DEFAULT_TIMESCALE).unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(matches!(
            Mp4Reader::open(Cursor::new(bytes)),
            Err(ContainerError::Invalid(_))
        ));
    }

    #[test]
    fn test_unfinished_file_is_rejected() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()), DEFAULT_TIMESCALE).unwrap();
        let id = writer.add_jpeg_track(8, 8, 3000).unwrap();
        writer.write_sample(id, &[0xAB; 64], true).unwrap();
        // Dropped without finish(): mdat size is still the placeholder
        let Mp4Writer { writer, .. } = writer;
        assert!(Mp4Reader::open(Cursor::new(writer.into_inner())).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Mp4Reader::open(Cursor::new(vec![0u8; 3])).is_err());
        assert!(Mp4Reader::open(Cursor::new(b"not an mp4 file at all".to_vec())).is_err());
    }
}
