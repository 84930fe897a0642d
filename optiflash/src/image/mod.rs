//! Flash images and their file formats.

pub mod flash;
pub mod ihex;

pub use flash::{ERASED_BYTE, FlashGeometry, FlashImage};
pub use ihex::{
    DecodeSummary, HexRecord, RecordType, decode_stream, encode_image, first_unreadable_record,
    write_hex,
};
