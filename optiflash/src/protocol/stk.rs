//! STK500v1 command subset spoken by optiboot-style bootloaders.
//!
//! ## Frame Format
//!
//! Every request is an opcode, an optional payload, and the end-of-frame
//! marker. The device answers with in-sync, the response payload, and a
//! status byte:
//!
//! ```text
//! host:   | opcode | payload ... | CRC_EOP (0x20) |
//! device: | INSYNC (0x14) | response ... | OK (0x10) |
//! ```
//!
//! Page transfers carry a big-endian 16-bit length and a memory-type tag:
//!
//! ```text
//! +--------+----------+----------+-----+-------------------+
//! | opcode | len high | len low  | 'F' | data (program)    |
//! +--------+----------+----------+-----+-------------------+
//! ```
//!
//! Load-address carries the address little-endian.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

/// End-of-frame marker sent by the host.
pub const CRC_EOP: u8 = 0x20;

/// In-sync marker sent by the device after an end-of-frame.
pub const STK_INSYNC: u8 = 0x14;

/// Status byte for a successful command.
pub const STK_OK: u8 = 0x10;

/// Memory-type tag for flash page transfers.
pub const MEMTYPE_FLASH: u8 = b'F';

/// Parameter id of the bootloader major version.
pub const PARAM_SW_MAJOR: u8 = 0x81;

/// Parameter id of the bootloader minor version.
pub const PARAM_SW_MINOR: u8 = 0x82;

/// Commands issued to the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Read a bootloader parameter (0x41, 'A').
    GetParameter = 0x41,
    /// Set the address for the next page command (0x55, 'U').
    LoadAddress = 0x55,
    /// Program a page (0x64, 'd').
    ProgramPage = 0x64,
    /// Read a page (0x74, 't').
    ReadPage = 0x74,
    /// Read the 3-byte device signature (0x75, 'u').
    ReadSignature = 0x75,
}

impl Command {
    /// Opcode byte on the wire.
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Decode an opcode byte.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x41 => Some(Self::GetParameter),
            0x55 => Some(Self::LoadAddress),
            0x64 => Some(Self::ProgramPage),
            0x74 => Some(Self::ReadPage),
            0x75 => Some(Self::ReadSignature),
            _ => None,
        }
    }
}

/// How strictly protocol noise is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Strictness {
    /// Log and continue: missing in-sync and non-OK status are advisory,
    /// timed-out payload bytes read as 0xFF, bad hex digits decode as 0xF.
    #[default]
    Lenient,
    /// Every deviation is an error.
    Strict,
}

impl Strictness {
    /// Whether this is strict mode.
    pub fn is_strict(self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// Final status byte of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The device sent `STK_OK`.
    Ok,
    /// The device sent some other byte.
    Other(u8),
    /// Nothing arrived before the status timeout.
    Missing,
}

impl Status {
    /// Classify a received status byte.
    pub fn from_byte(byte: u8) -> Self {
        if byte == STK_OK {
            Self::Ok
        } else {
            Self::Other(byte)
        }
    }

    /// Whether the device reported success.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Raw status byte, 0xFF when none arrived.
    pub fn raw(self) -> u8 {
        match self {
            Self::Ok => STK_OK,
            Self::Other(b) => b,
            Self::Missing => 0xFF,
        }
    }
}

/// Response of one command: its payload plus the status byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T> {
    /// Response payload.
    pub data: T,
    /// Status byte that ended the response.
    pub status: Status,
    /// Whether the device acknowledged the frame with in-sync.
    pub in_sync: bool,
}

impl<T> Reply<T> {
    /// Whether the command was acknowledged and ended with OK.
    pub fn is_ok(&self) -> bool {
        self.in_sync && self.status.is_ok()
    }
}

/// Request frame builder (everything before the end-of-frame marker).
#[derive(Debug)]
pub struct CommandFrame {
    command: Command,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame carrying only the opcode.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            data: Vec::new(),
        }
    }

    /// Build a read-signature frame.
    pub fn read_signature() -> Self {
        Self::new(Command::ReadSignature)
    }

    /// Build a get-parameter frame.
    pub fn get_parameter(param: u8) -> Self {
        let mut frame = Self::new(Command::GetParameter);
        frame.data.push(param);
        frame
    }

    /// Build a load-address frame (address little-endian).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn load_address(address: u16) -> Self {
        let mut frame = Self::new(Command::LoadAddress);
        frame.data.write_u16::<LittleEndian>(address).unwrap();
        frame
    }

    /// Build a read-page frame (length big-endian, flash tag).
    pub fn read_page(length: u16) -> Self {
        Self::page_header(Command::ReadPage, length)
    }

    /// Build a program-page frame followed by its payload.
    pub fn program_page(data: &[u8]) -> Self {
        let mut frame = Self::page_header(Command::ProgramPage, data.len() as u16);
        frame.data.extend_from_slice(data);
        frame
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn page_header(command: Command, length: u16) -> Self {
        let mut frame = Self::new(command);
        frame.data.write_u16::<BigEndian>(length).unwrap();
        frame.data.push(MEMTYPE_FLASH);
        frame
    }

    /// Command carried by this frame.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Serialize the frame (without the end-of-frame marker).
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.command.opcode());
        out.extend_from_slice(&self.data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_address_is_little_endian() {
        let frame = CommandFrame::load_address(0x1234).build();
        assert_eq!(frame, vec![0x55, 0x34, 0x12]);
    }

    #[test]
    fn test_read_page_length_is_big_endian() {
        let frame = CommandFrame::read_page(512).build();
        assert_eq!(frame, vec![0x74, 0x02, 0x00, b'F']);
    }

    #[test]
    fn test_program_page_carries_payload() {
        let frame = CommandFrame::program_page(&[0xAA, 0xBB]).build();
        assert_eq!(frame, vec![0x64, 0x00, 0x02, b'F', 0xAA, 0xBB]);
    }

    #[test]
    fn test_get_parameter() {
        let frame = CommandFrame::get_parameter(PARAM_SW_MAJOR);
        assert_eq!(frame.command(), Command::GetParameter);
        assert_eq!(frame.build(), vec![0x41, 0x81]);
    }

    #[test]
    fn test_command_opcodes_round_trip() {
        for cmd in [
            Command::GetParameter,
            Command::LoadAddress,
            Command::ProgramPage,
            Command::ReadPage,
            Command::ReadSignature,
        ] {
            assert_eq!(Command::from_opcode(cmd.opcode()), Some(cmd));
        }
        assert_eq!(Command::from_opcode(0x30), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(Status::from_byte(STK_OK).is_ok());
        assert_eq!(Status::from_byte(0x11), Status::Other(0x11));
        assert_eq!(Status::Missing.raw(), 0xFF);
    }
}
