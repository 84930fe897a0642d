//! # optiflash
//!
//! A library for reading and programming AVR flash through an optiboot-style
//! (STK500v1 subset) serial bootloader.
//!
//! This crate provides:
//!
//! - The framed command/response link with timeout-based resynchronization
//! - Whole-flash read, program and verify with bounded retries and reset
//!   recovery
//! - Intel-HEX import and export of the in-memory flash image
//!
//! ## Supported Targets
//!
//! - AVR64DB32 (built in)
//! - Any part with 16-bit flash addressing, described as a custom [`Target`]
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use optiflash::image::ihex;
//! use optiflash::{FlashImage, Strictness, Target};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let target = Target::avr64db32();
//!     let mut image = FlashImage::new(target.geometry);
//!
//!     let summary = ihex::decode_stream(
//!         std::fs::File::open("app.hex")?,
//!         &mut image,
//!         Strictness::Lenient,
//!     )?;
//!     println!("{} bytes loaded", summary.bytes);
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use optiflash::{BootloaderLink, FlashProgrammer, ModemLineReset, NativePort};
//!
//!         let port = NativePort::open_simple("/dev/ttyUSB0", 115_200)?;
//!         let mut programmer =
//!             FlashProgrammer::new(BootloaderLink::new(port), ModemLineReset::default(), target);
//!         programmer
//!             .program_flash(&image, |phase, page, total| {
//!                 println!("{phase} {page}/{total}");
//!             })?
//!             .into_result()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod reset;
pub mod target;

// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{DetectedPort, DeviceKind, detect_ports, format_port_list, select_port},
    error::{Error, Result},
    image::{
        DecodeSummary, FlashGeometry, FlashImage, HexRecord, RecordType, decode_stream,
        encode_image, first_unreadable_record, write_hex,
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{BootloaderLink, Command, LinkConfig, Strictness},
    reset::{ModemLineReset, NoReset, ResetControl, ResetLine},
    target::{
        DeviceIdentity, Fingerprint, FlashProgrammer, Phase, ProgramReport, ProgramStatus,
        ProgrammerConfig, Signature, Target,
    },
};

#[cfg(feature = "native")]
pub use device::auto_detect_port;
