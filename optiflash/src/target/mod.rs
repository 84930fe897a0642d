//! Target devices and whole-flash operations.
//!
//! A [`Target`] describes what the host expects on the other end of the
//! link: the 3-byte device signature, the flash layout, and how many pages
//! at the start of flash belong to the bootloader. The built-in profile is
//! the AVR64DB32; other parts can be described from configuration.

mod programmer;

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::image::flash::FlashGeometry;

pub use crate::image::flash::Fingerprint;
pub use programmer::{FlashProgrammer, Phase, ProgramReport, ProgramStatus, ProgrammerConfig};

/// 3-byte device signature, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 3]);

impl Signature {
    /// AVR64DB32 (`0x1E9618`).
    pub const AVR64DB32: Self = Self([0x1E, 0x96, 0x18]);

    /// Build a signature from the low 24 bits of `value`.
    pub fn from_u32(value: u32) -> Self {
        let [_, a, b, c] = value.to_be_bytes();
        Self([a, b, c])
    }

    /// Signature as a 24-bit number.
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }

    /// Raw signature bytes.
    pub fn bytes(&self) -> [u8; 3] {
        self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for Signature {
    type Err = Error;

    /// Parse `1E9618` or `0x1E9618`.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .trim()
            .strip_prefix("0x")
            .or_else(|| s.trim().strip_prefix("0X"))
            .unwrap_or(s.trim());
        if digits.len() != 6 {
            return Err(Error::Config(format!(
                "signature '{s}' must be 6 hex digits"
            )));
        }
        u32::from_str_radix(digits, 16)
            .map(Self::from_u32)
            .map_err(|_| Error::Config(format!("signature '{s}' is not hexadecimal")))
    }
}

/// What the bootloader reported about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device signature.
    pub signature: Signature,
    /// Bootloader major version.
    pub major: u8,
    /// Bootloader minor version.
    pub minor: u8,
}

impl DeviceIdentity {
    /// Whether this device is the expected target.
    pub fn matches(&self, target: &Target) -> bool {
        self.signature == target.signature
    }

    /// Bootloader version as `major.minor`.
    pub fn version(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

/// Expected device and its flash layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Display name.
    pub name: String,
    /// Signature the device must report.
    pub signature: Signature,
    /// Flash size and page layout.
    pub geometry: FlashGeometry,
    /// Leading pages holding the bootloader; never programmed.
    pub protected_pages: usize,
}

impl Target {
    /// Names of the built-in profiles.
    pub const BUILTIN: &'static [&'static str] = &["avr64db32"];

    /// The AVR64DB32 profile.
    pub fn avr64db32() -> Self {
        Self {
            name: "AVR64DB32".to_string(),
            signature: Signature::AVR64DB32,
            geometry: FlashGeometry::AVR64DB32,
            protected_pages: 1,
        }
    }

    /// Look up a built-in profile by name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "avr64db32" | "avr64db" => Some(Self::avr64db32()),
            _ => None,
        }
    }

    /// Describe a custom target.
    pub fn custom(name: impl Into<String>, signature: Signature, geometry: FlashGeometry) -> Self {
        Self {
            name: name.into(),
            signature,
            geometry,
            protected_pages: 1,
        }
    }

    /// Set the number of bootloader pages. Page 0 stays protected regardless.
    #[must_use]
    pub fn with_protected_pages(mut self, pages: usize) -> Self {
        self.protected_pages = pages;
        self
    }

    /// First page the programmer may write.
    pub fn first_programmable_page(&self) -> usize {
        self.protected_pages.max(1)
    }

    /// Pages the programmer writes and verifies.
    pub fn programmable_pages(&self) -> std::ops::Range<usize> {
        self.first_programmable_page()..self.geometry.page_count()
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::avr64db32()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (signature {}, {} KiB flash, {}-byte pages)",
            self.name,
            self.signature,
            self.geometry.size() / 1024,
            self.geometry.page_size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_display_and_value() {
        let sig = Signature::AVR64DB32;
        assert_eq!(sig.to_string(), "1E9618");
        assert_eq!(sig.as_u32(), 0x1E_9618);
        assert_eq!(Signature::from_u32(0x1E_9618), sig);
    }

    #[test]
    fn test_signature_from_str() {
        assert_eq!("0x1E9618".parse::<Signature>().unwrap(), Signature::AVR64DB32);
        assert_eq!("1e9618".parse::<Signature>().unwrap(), Signature::AVR64DB32);
        assert!("1E96".parse::<Signature>().is_err());
        assert!("1E96ZZ".parse::<Signature>().is_err());
    }

    #[test]
    fn test_target_from_name() {
        let target = Target::from_name("AVR64DB32").unwrap();
        assert_eq!(target.geometry.page_count(), 128);
        assert_eq!(target.programmable_pages(), 1..128);
        assert!(Target::from_name("atmega328p").is_none());
    }

    #[test]
    fn test_page_zero_always_protected() {
        let target = Target::avr64db32().with_protected_pages(0);
        assert_eq!(target.first_programmable_page(), 1);

        let target = Target::avr64db32().with_protected_pages(4);
        assert_eq!(target.programmable_pages(), 4..128);
    }

    #[test]
    fn test_identity_matches_target() {
        let identity = DeviceIdentity {
            signature: Signature::AVR64DB32,
            major: 8,
            minor: 3,
        };
        assert!(identity.matches(&Target::avr64db32()));
        assert_eq!(identity.version(), "8.3");

        let other = DeviceIdentity {
            signature: Signature([0, 0, 0]),
            ..identity
        };
        assert!(!other.matches(&Target::avr64db32()));
    }
}
