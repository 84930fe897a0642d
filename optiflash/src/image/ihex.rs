//! Intel-HEX import and export for flash images.
//!
//! ## Record Format
//!
//! ```text
//! +---+-----+---------+------+-----------------+----------+
//! | : | len | address | type |      data       | checksum |
//! +---+-----+---------+------+-----------------+----------+
//! | 1 |  2  |    4    |  2   |    2 * len      |    2     |
//! +---+-----+---------+------+-----------------+----------+
//! ```
//!
//! All fields are hex digits. The checksum is the two's complement of the
//! byte sum of length, address, type and data. Only 16-bit addresses and
//! records of at most 16 data bytes are accepted; only data records (type 0)
//! touch the image.
//!
//! Decoding is all-or-nothing: records are staged and applied only once the
//! whole stream parsed cleanly.

use std::io::{self, BufRead, BufReader, Read, Write};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::image::flash::FlashImage;
use crate::protocol::stk::Strictness;

/// Longest record accepted and the chunk size used for export.
pub const MAX_RECORD_LEN: usize = 16;

/// Highest address (exclusive end) a record may reach.
const ADDRESS_LIMIT: usize = 0xFFFF;

/// Most bytes discarded from the input after a decode error.
pub const DRAIN_LIMIT: u64 = 1 << 20;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Nibble returned for a non-hex character in lenient decoding.
pub const INVALID_NIBBLE: u8 = 0xF;

/// Intel-HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Data record (00).
    Data,
    /// End of file (01).
    EndOfFile,
    /// Extended segment address (02).
    ExtendedSegmentAddress,
    /// Start segment address (03).
    StartSegmentAddress,
    /// Extended linear address (04).
    ExtendedLinearAddress,
    /// Start linear address (05).
    StartLinearAddress,
    /// Anything else.
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x02 => Self::ExtendedSegmentAddress,
            0x03 => Self::StartSegmentAddress,
            0x04 => Self::ExtendedLinearAddress,
            0x05 => Self::StartLinearAddress,
            other => Self::Unknown(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
            RecordType::ExtendedSegmentAddress => 0x02,
            RecordType::StartSegmentAddress => 0x03,
            RecordType::ExtendedLinearAddress => 0x04,
            RecordType::StartLinearAddress => 0x05,
            RecordType::Unknown(other) => other,
        }
    }
}

/// One Intel-HEX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Load address.
    pub address: u16,
    /// Record type.
    pub record_type: RecordType,
    /// Data bytes.
    pub data: Vec<u8>,
}

impl HexRecord {
    /// Create a data record.
    pub fn data(address: u16, data: &[u8]) -> Self {
        Self {
            address,
            record_type: RecordType::Data,
            data: data.to_vec(),
        }
    }

    /// The end-of-file record.
    pub fn end_of_file() -> Self {
        Self {
            address: 0,
            record_type: RecordType::EndOfFile,
            data: Vec::new(),
        }
    }

    /// Checksum of the record as written in its last field.
    pub fn checksum(&self) -> u8 {
        let [hi, lo] = self.address.to_be_bytes();
        let sum = self
            .data
            .iter()
            .fold(
                (self.data.len() as u8)
                    .wrapping_add(hi)
                    .wrapping_add(lo)
                    .wrapping_add(self.record_type.into()),
                |acc, &b| acc.wrapping_add(b),
            );
        sum.wrapping_neg()
    }

    /// Render the record as one line (without line terminator).
    pub fn to_line(&self) -> String {
        let [hi, lo] = self.address.to_be_bytes();
        let mut line = String::with_capacity(11 + 2 * self.data.len());
        line.push(':');
        push_hex(&mut line, self.data.len() as u8);
        push_hex(&mut line, hi);
        push_hex(&mut line, lo);
        push_hex(&mut line, self.record_type.into());
        for &b in &self.data {
            push_hex(&mut line, b);
        }
        push_hex(&mut line, self.checksum());
        line
    }

    /// Parse a single record line.
    pub fn parse(line: &str, strictness: Strictness) -> Result<Self> {
        let mut reader = RecordReader::new(line.trim_end().as_bytes(), strictness);
        match reader.next_record(usize::MAX)? {
            Some(record) => Ok(record),
            None => Err(Error::TruncatedRecord { line: 1 }),
        }
    }
}

/// Outcome of a successful decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Records read, of any type.
    pub records: usize,
    /// Data records applied to the image.
    pub data_records: usize,
    /// Data bytes written to the image.
    pub bytes: usize,
    /// Whether an end-of-file record was seen.
    pub end_of_file: bool,
}

/// Decode Intel-HEX records from `reader` into `image`.
///
/// Reading stops at the first byte (after line breaks) that does not start a
/// record, or at end of input. On any error nothing is written to `image`
/// and the specific error is returned after draining the rest of the input,
/// up to [`DRAIN_LIMIT`] bytes. Draining blocks until that many bytes or end
/// of input arrive, so `reader` should be a file or another finite source.
pub fn decode_stream<R: Read>(
    reader: R,
    image: &mut FlashImage,
    strictness: Strictness,
) -> Result<DecodeSummary> {
    let mut reader = RecordReader::new(BufReader::new(reader), strictness);

    match stage_records(&mut reader, image.len()) {
        Ok((staged, summary)) => {
            for (address, data) in &staged {
                image.write(usize::from(*address), data)?;
            }
            debug!(
                "Decoded {} records ({} data bytes)",
                summary.records, summary.bytes
            );
            Ok(summary)
        },
        Err(e) => {
            warn!("HEX decode aborted: {e}");
            reader.drain();
            Err(e)
        },
    }
}

fn stage_records<R: BufRead>(
    reader: &mut RecordReader<R>,
    capacity: usize,
) -> Result<(Vec<(u16, Vec<u8>)>, DecodeSummary)> {
    let mut staged = Vec::new();
    let mut summary = DecodeSummary::default();

    while let Some(record) = reader.next_record(capacity)? {
        summary.records += 1;
        match record.record_type {
            RecordType::Data => {
                summary.data_records += 1;
                summary.bytes += record.data.len();
                staged.push((record.address, record.data));
            },
            RecordType::EndOfFile => summary.end_of_file = true,
            other => debug!("Ignoring {other:?} record at line {}", summary.records),
        }
    }

    Ok((staged, summary))
}

/// Byte-level record parser.
struct RecordReader<R> {
    inner: R,
    strictness: Strictness,
    line: usize,
}

impl<R: BufRead> RecordReader<R> {
    fn new(inner: R, strictness: Strictness) -> Self {
        Self {
            inner,
            strictness,
            line: 0,
        }
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let buf = self.inner.fill_buf()?;
        let Some(&b) = buf.first() else {
            return Ok(None);
        };
        self.inner.consume(1);
        Ok(Some(b))
    }

    fn hex_digit(&mut self) -> Result<u8> {
        let c = self
            .next_byte()?
            .ok_or(Error::TruncatedRecord { line: self.line })?;
        match hex_decode_nibble(c) {
            Some(n) => Ok(n),
            None if self.strictness.is_strict() => Err(Error::InvalidHexDigit {
                line: self.line,
                digit: char::from(c),
            }),
            None => Ok(INVALID_NIBBLE),
        }
    }

    fn hex_byte(&mut self) -> Result<u8> {
        let hi = self.hex_digit()?;
        let lo = self.hex_digit()?;
        Ok((hi << 4) | lo)
    }

    /// Parse the next record, or `None` at the end of the record stream.
    fn next_record(&mut self, capacity: usize) -> Result<Option<HexRecord>> {
        let start = loop {
            match self.next_byte()? {
                Some(b'\r' | b'\n') => {},
                other => break other,
            }
        };
        if start != Some(b':') {
            return Ok(None);
        }
        self.line += 1;

        let length = self.hex_byte()?;
        if usize::from(length) > MAX_RECORD_LEN {
            return Err(Error::RecordTooLong {
                line: self.line,
                length,
            });
        }

        let address = u16::from_be_bytes([self.hex_byte()?, self.hex_byte()?]);
        if usize::from(address) + usize::from(length) > ADDRESS_LIMIT {
            return Err(Error::AddressOverflow {
                line: self.line,
                address,
                length,
            });
        }

        let record_type = RecordType::from(self.hex_byte()?);
        if record_type == RecordType::Data
            && usize::from(address) + usize::from(length) > capacity
        {
            return Err(Error::AddressOverflow {
                line: self.line,
                address,
                length,
            });
        }

        let mut data = Vec::with_capacity(usize::from(length));
        for _ in 0..length {
            data.push(self.hex_byte()?);
        }

        let record = HexRecord {
            address,
            record_type,
            data,
        };
        let actual = self.hex_byte()?;
        let expected = record.checksum();
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                line: self.line,
                expected,
                actual,
            });
        }

        Ok(Some(record))
    }

    /// Discard what remains of the input, up to [`DRAIN_LIMIT`] bytes.
    fn drain(&mut self) {
        match io::copy(&mut (&mut self.inner).take(DRAIN_LIMIT), &mut io::sink()) {
            Ok(n) => debug!("Drained {n} bytes after decode error"),
            Err(e) => debug!("Drain stopped early: {e}"),
        }
    }
}

/// Lazy sequence of data-record lines for the non-erased parts of an image.
///
/// Each page is cut into 16-byte chunks; chunks that are entirely erased are
/// skipped.
#[derive(Debug, Clone)]
pub struct HexLines<'a> {
    image: &'a FlashImage,
    offset: usize,
}

impl Iterator for HexLines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let page_size = self.image.geometry().page_size();
        while self.offset < self.image.len() {
            let start = self.offset;
            let page_end = (start / page_size + 1) * page_size;
            let end = (start + MAX_RECORD_LEN).min(page_end);
            self.offset = end;

            if self.image.is_range_erased(start..end) {
                continue;
            }
            let record = HexRecord::data(start as u16, &self.image.as_bytes()[start..end]);
            return Some(record.to_line());
        }
        None
    }
}

/// Encode the non-erased contents of `image` as data-record lines.
pub fn encode_image(image: &FlashImage) -> HexLines<'_> {
    HexLines { image, offset: 0 }
}

/// Address of the first exported record that [`decode_stream`] would reject.
///
/// Only a non-erased chunk reaching past 0xFFFF qualifies, which on a
/// 64 KiB part is the last 16 bytes of flash.
pub fn first_unreadable_record(image: &FlashImage) -> Option<u16> {
    let page_size = image.geometry().page_size();
    let mut start = ADDRESS_LIMIT.saturating_sub(MAX_RECORD_LEN) / page_size * page_size;
    while start < image.len() {
        let page_end = (start / page_size + 1) * page_size;
        let end = (start + MAX_RECORD_LEN).min(page_end);
        if end > ADDRESS_LIMIT && !image.is_range_erased(start..end) {
            return Some(start as u16);
        }
        start = end;
    }
    None
}

/// Write `image` as Intel-HEX text, one record per line.
///
/// Returns the number of data records written.
pub fn write_hex<W: Write>(image: &FlashImage, mut writer: W, eof_record: bool) -> Result<usize> {
    let mut count = 0;
    for line in encode_image(image) {
        writeln!(writer, "{line}")?;
        count += 1;
    }
    if eof_record {
        writeln!(writer, "{}", HexRecord::end_of_file().to_line())?;
    }
    writer.flush()?;
    Ok(count)
}

fn push_hex(out: &mut String, byte: u8) {
    out.push(char::from(HEX_DIGITS[usize::from(byte >> 4)]));
    out.push(char::from(HEX_DIGITS[usize::from(byte & 0xF)]));
}

/// Encode bytes as uppercase hex digits.
pub fn hex_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        push_hex(&mut out, b);
    }
    out
}

/// Decode one hex digit (either case).
pub fn hex_decode_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode two hex digits; a non-hex digit decodes as `0xF`.
pub fn hex_decode_byte(hi: u8, lo: u8) -> u8 {
    let nibble = |c| hex_decode_nibble(c).unwrap_or(INVALID_NIBBLE);
    (nibble(hi) << 4) | nibble(lo)
}
