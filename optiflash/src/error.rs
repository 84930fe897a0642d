//! Error types for optiflash.

use std::io;
use thiserror::Error;

use crate::protocol::stk::Command;
use crate::target::Signature;

/// Result type for optiflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for optiflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No byte arrived within the read bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The bootloader never acknowledged the end of a frame.
    #[error("Bootloader did not answer with in-sync after {command:?}")]
    NotInSync {
        /// Command whose frame was not acknowledged.
        command: Command,
    },

    /// Status byte other than OK (strict mode only).
    #[error("{command:?} returned status {status:#04x}")]
    BadStatus {
        /// Command that produced the status.
        command: Command,
        /// Raw status byte.
        status: u8,
    },

    /// Intel-HEX record checksum does not match its contents.
    #[error("HEX line {line}: checksum mismatch, expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// 1-based record number.
        line: usize,
        /// Checksum computed from the record.
        expected: u8,
        /// Checksum found in the record.
        actual: u8,
    },

    /// Intel-HEX record carries more than 16 data bytes.
    #[error("HEX line {line}: record length {length} exceeds 16 bytes")]
    RecordTooLong {
        /// 1-based record number.
        line: usize,
        /// Length field of the record.
        length: u8,
    },

    /// Intel-HEX record reaches past the flash address space.
    #[error("HEX line {line}: {length} bytes at {address:#06x} exceed the flash address space")]
    AddressOverflow {
        /// 1-based record number.
        line: usize,
        /// Load address of the record.
        address: u16,
        /// Length of the record data.
        length: u8,
    },

    /// Non-hex character inside a record (strict mode only).
    #[error("HEX line {line}: invalid hex digit {digit:?}")]
    InvalidHexDigit {
        /// 1-based record number.
        line: usize,
        /// Offending character.
        digit: char,
    },

    /// Input ended in the middle of a record.
    #[error("HEX line {line}: record truncated")]
    TruncatedRecord {
        /// 1-based record number.
        line: usize,
    },

    /// Device reported a signature other than the target's.
    #[error("Signature mismatch: expected {expected}, got {actual}")]
    SignatureMismatch {
        /// Signature of the configured target.
        expected: Signature,
        /// Signature reported by the device.
        actual: Signature,
    },

    /// Bootloader did not answer the version queries.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Readback still differs from the image after all program attempts.
    #[error("Verify failed after {attempts} attempts ({mismatches} mismatching bytes)")]
    VerifyFailed {
        /// Number of program+verify cycles performed.
        attempts: usize,
        /// Mismatching bytes in the final cycle.
        mismatches: usize,
    },

    /// Device could not be re-identified after a failed verify.
    #[error("Could not re-identify device after {attempts} resets")]
    ReconnectExhausted {
        /// Number of reset attempts made.
        attempts: usize,
    },

    /// No serial port available for auto-selection.
    #[error("No serial port found")]
    DeviceNotFound,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error came from the link timing out or losing framing.
    ///
    /// These are the faults the programmer absorbs into its retry loop.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::NotInSync { .. } | Self::BadStatus { .. }
        )
    }
}
