//! Annex-B NAL unit scanning for H.264 elementary streams.
//!
//! Encoded frames coming off the device are Annex-B byte streams: every NAL
//! unit is preceded by the 4-byte start code `00 00 00 01`. The scanner walks
//! one complete buffer and yields borrowed views of each unit, classified by
//! the low 5 bits of the first byte following the start code.
//!
//! ```text
//! 00 00 00 01 67 ...  00 00 00 01 68 ...  00 00 00 01 65 ...
//! └── start ──┘└SPS┘  └── start ──┘└PPS┘  └── start ──┘└ I ┘
//! ```
//!
//! The scanner owns no data and cannot be rewound; scanning the same buffer
//! twice needs two scanners.

/// Annex-B start code that delimits NAL units.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// H.264 NAL unit type codes the recorder cares about.
pub mod nal_unit_type {
    /// Non-IDR slice (P frame)
    pub const NON_IDR_SLICE: u8 = 1;
    /// IDR slice (keyframe)
    pub const IDR_SLICE: u8 = 5;
    /// Sequence parameter set
    pub const SPS: u8 = 7;
    /// Picture parameter set
    pub const PPS: u8 = 8;
}

/// Classified NAL unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalType {
    P,
    I,
    Sps,
    Pps,
    /// Anything else (SEI, AUD, filler, ...), not written to the container
    Invalid,
}

impl NalType {
    /// Classify from a NAL header byte (only the low 5 bits are used).
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            nal_unit_type::NON_IDR_SLICE => NalType::P,
            nal_unit_type::IDR_SLICE => NalType::I,
            nal_unit_type::SPS => NalType::Sps,
            nal_unit_type::PPS => NalType::Pps,
            _ => NalType::Invalid,
        }
    }

    /// True for picture data (I or P slices)
    pub fn is_slice(&self) -> bool {
        matches!(self, NalType::I | NalType::P)
    }

    /// True for parameter sets (SPS or PPS)
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalType::Sps | NalType::Pps)
    }
}

impl std::fmt::Display for NalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NalType::P => write!(f, "P"),
            NalType::I => write!(f, "I"),
            NalType::Sps => write!(f, "SPS"),
            NalType::Pps => write!(f, "PPS"),
            NalType::Invalid => write!(f, "Invalid"),
        }
    }
}

/// A single NAL unit, borrowed from the scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    offset: usize,
    code: u8,
    kind: NalType,
    data: &'a [u8],
}

impl<'a> NalUnit<'a> {
    /// Byte offset of the start code within the scanned buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Raw 5-bit type code
    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn kind(&self) -> NalType {
        self.kind
    }

    /// Unit including its leading start code
    pub fn with_start_code(&self) -> &'a [u8] {
        self.data
    }

    /// Unit without the start code, starting at the NAL header byte
    pub fn payload(&self) -> &'a [u8] {
        &self.data[START_CODE.len()..]
    }

    /// Size of the payload (what a length prefix must describe)
    pub fn payload_len(&self) -> usize {
        self.data.len() - START_CODE.len()
    }
}

/// Forward-only iterator over the NAL units of one Annex-B buffer.
#[derive(Debug, Clone)]
pub struct NalScanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NalScanner<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for NalScanner<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < START_CODE.len() || self.pos >= self.data.len() {
            return None;
        }

        let start = match find_start_code(self.data, self.pos) {
            Some(start) => start,
            None => {
                self.pos = self.data.len();
                return None;
            }
        };

        // A start code needs at least the header byte behind it
        let header = start + START_CODE.len();
        if header >= self.data.len() {
            self.pos = self.data.len();
            return None;
        }

        let end = find_start_code(self.data, header).unwrap_or(self.data.len());
        self.pos = end;

        let code = self.data[header] & 0x1F;
        Some(NalUnit {
            offset: start,
            code,
            kind: NalType::from_header(code),
            data: &self.data[start..end],
        })
    }
}

impl std::iter::FusedIterator for NalScanner<'_> {}

/// Position of the next start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(START_CODE.len())
        .position(|w| w == START_CODE)
        .map(|p| p + from)
}

/// Picture type of an encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    Unknown,
}

/// Picture type of an Annex-B access unit, taken from its first slice.
pub fn frame_type(data: &[u8]) -> FrameType {
    NalScanner::new(data)
        .find(|nal| nal.kind().is_slice())
        .map(|nal| match nal.kind() {
            NalType::I => FrameType::I,
            _ => FrameType::P,
        })
        .unwrap_or(FrameType::Unknown)
}
