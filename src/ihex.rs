//! Intel HEX firmware image loading.
//!
//! Only data (00) and end of file (01) records are understood, and data
//! records must be address contiguous. Other record types are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Record start code
pub const START_CODE: char = ':';

/// Data record type
pub const RECORD_DATA: u8 = 0x00;
/// End of file record type
pub const RECORD_EOF: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line} doesn't start with ':', not Intel hex? {text:?}")]
    NotIntelHex { line: usize, text: String },

    #[error("line {line} is not a valid record: {text:?}")]
    Malformed { line: usize, text: String },

    #[error("line {line}: data should contain {expected} bytes, but was length {actual}")]
    LengthMismatch { line: usize, expected: usize, actual: usize },

    #[error("input data is not contiguous: hole from {expected:04X}..{actual:04X}")]
    Discontiguous { expected: u32, actual: u32 },

    #[error("line {line}: checksum {actual:02X} does not match computed {expected:02X}")]
    Checksum { line: usize, expected: u8, actual: u8 },

    #[error("image contains no data records")]
    NoData,
}

/// Record checksum handling
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Checksum {
    /// Accept records regardless of their checksum
    Ignore,
    /// Reject records whose checksum does not match their contents
    Verify,
}

impl Default for Checksum {
    fn default() -> Self {
        Checksum::Ignore
    }
}

/// A single parsed record
#[derive(Clone, PartialEq, Debug)]
pub struct Record {
    pub kind: u8,
    pub addr: u16,
    pub data: Vec<u8>,
}

impl Record {
    /// Parse one line (1-based `line` number for reporting) into a record
    pub fn parse(text: &str, line: usize, checksum: Checksum) -> Result<Self, HexError> {
        let text = text.trim_end();

        let body = text.strip_prefix(START_CODE)
            .ok_or_else(|| HexError::NotIntelHex{ line, text: text.to_string() })?;

        let malformed = || HexError::Malformed{ line, text: text.to_string() };

        // Length (2), address (4) and type (2) precede the data
        if body.len() < 8 || !body.is_ascii() {
            return Err(malformed());
        }

        let header = hex::decode(&body[..8]).map_err(|_| malformed())?;
        let len = header[0] as usize;
        let addr = u16::from_be_bytes([header[1], header[2]]);
        let kind = header[3];

        if checksum == Checksum::Verify {
            // At least one checksum byte must follow the header
            if body.len() < 10 {
                return Err(malformed());
            }

            let (content, digits) = body.split_at(body.len() - 2);
            let content = hex::decode(content).map_err(|_| malformed())?;
            let actual = hex::decode(digits).map_err(|_| malformed())?[0];
            let expected = content.iter().fold(0u8, |a, b| a.wrapping_add(*b)).wrapping_neg();

            if actual != expected {
                return Err(HexError::Checksum{ line, expected, actual });
            }
        }

        // End of file and unsupported records carry nothing we use
        if kind != RECORD_DATA {
            return Ok(Self{ kind, addr, data: vec![] });
        }

        // The final two digits are the checksum
        let field = body.get(8..body.len().saturating_sub(2)).unwrap_or("");
        if field.len() != 2 * len {
            return Err(HexError::LengthMismatch{ line, expected: len, actual: field.len() });
        }

        let data = hex::decode(field).map_err(|_| malformed())?;

        Ok(Self{ kind, addr, data })
    }
}

/// Image accumulator carried across data records
#[derive(Default)]
struct Accumulator {
    base: Option<u32>,
    next: u32,
    data: Vec<u8>,
}

impl Accumulator {
    fn push(mut self, record: Record) -> Result<Self, HexError> {
        let addr = record.addr as u32;

        match self.base {
            None => self.base = Some(addr),
            Some(_) if addr != self.next => {
                return Err(HexError::Discontiguous{ expected: self.next, actual: addr })
            },
            Some(_) => (),
        }

        self.next = addr + record.data.len() as u32;
        self.data.extend_from_slice(&record.data);

        Ok(self)
    }
}

/// Firmware image, a contiguous block of bytes at a base address
#[derive(Clone, PartialEq, Debug)]
pub struct Image {
    pub base: u32,
    pub data: Vec<u8>,
}

impl Image {
    /// Load an image from an Intel HEX file
    pub fn load<P: AsRef<Path>>(path: P, checksum: Checksum) -> Result<Self, HexError> {
        let f = File::open(path)?;
        Self::parse(BufReader::new(f), checksum)
    }

    /// Parse an image from Intel HEX text
    pub fn parse<B: BufRead>(reader: B, checksum: Checksum) -> Result<Self, HexError> {
        let mut acc = Accumulator::default();

        for (i, line) in reader.lines().enumerate() {
            let record = Record::parse(&line?, i + 1, checksum)?;

            match record.kind {
                RECORD_EOF => break,
                RECORD_DATA => acc = acc.push(record)?,
                kind => warn!("Ignoring record type {:02X} in file", kind),
            }
        }

        match acc.base {
            Some(base) => Ok(Self{ base, data: acc.data }),
            None => Err(HexError::NoData),
        }
    }

    /// Image length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address one past the final byte
    pub fn end(&self) -> u32 {
        self.base + self.data.len() as u32
    }
}
