//! In-memory flash image.
//!
//! A `FlashImage` always holds the full flash of the target: every byte is
//! defined, and bytes nobody wrote hold the erased value (0xFF). HEX import
//! writes sparse ranges into it; device readback replaces it wholesale.

use std::ops::Range;

use crate::error::{Error, Result};

/// Value of an unprogrammed flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Largest flash reachable with the protocol's 16-bit addresses.
pub const MAX_FLASH_SIZE: usize = 0x10000;

/// Size and page layout of a target's flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    size: usize,
    page_size: usize,
}

impl FlashGeometry {
    /// 64 KiB in 512-byte pages (AVR64DB32).
    pub const AVR64DB32: Self = Self {
        size: 0x10000,
        page_size: 512,
    };

    /// Validate and create a geometry.
    ///
    /// `size` must be a non-zero multiple of `page_size` and fit the 16-bit
    /// address space.
    pub fn new(size: usize, page_size: usize) -> Result<Self> {
        if page_size == 0 || size == 0 {
            return Err(Error::Config("flash and page size must be non-zero".into()));
        }
        if size % page_size != 0 {
            return Err(Error::Config(format!(
                "flash size {size} is not a multiple of page size {page_size}"
            )));
        }
        if size > MAX_FLASH_SIZE {
            return Err(Error::Config(format!(
                "flash size {size} exceeds the 16-bit address space"
            )));
        }
        Ok(Self { size, page_size })
    }

    /// Flash capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.size / self.page_size
    }

    /// Byte address of the first byte of `page`.
    pub fn page_address(&self, page: usize) -> u16 {
        (page * self.page_size) as u16
    }

    /// Byte range covered by `page`.
    pub fn page_range(&self, page: usize) -> Range<usize> {
        let start = page * self.page_size;
        start..start + self.page_size
    }
}

impl Default for FlashGeometry {
    fn default() -> Self {
        Self::AVR64DB32
    }
}

/// Hash primitive used to fingerprint an image for operator confirmation.
pub trait Fingerprint {
    /// Compute a 32-byte digest of `data`.
    fn digest(&self, data: &[u8]) -> [u8; 32];
}

/// Full copy of a target's flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    geometry: FlashGeometry,
    data: Vec<u8>,
}

impl FlashImage {
    /// Create an all-erased image.
    pub fn new(geometry: FlashGeometry) -> Self {
        Self {
            geometry,
            data: vec![ERASED_BYTE; geometry.size()],
        }
    }

    /// Create an image from a raw binary; a shorter binary is padded with
    /// erased bytes.
    pub fn from_bytes(geometry: FlashGeometry, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > geometry.size() {
            return Err(Error::Config(format!(
                "binary of {} bytes exceeds flash size {}",
                bytes.len(),
                geometry.size()
            )));
        }
        let mut image = Self::new(geometry);
        image.data[..bytes.len()].copy_from_slice(bytes);
        Ok(image)
    }

    /// Reset every byte to the erased value.
    pub fn erase(&mut self) {
        self.data.fill(ERASED_BYTE);
    }

    /// Flash geometry of this image.
    pub fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no bytes; never true for a valid geometry.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Contents of one page.
    pub fn page(&self, page: usize) -> &[u8] {
        &self.data[self.geometry.page_range(page)]
    }

    /// Overwrite one page.
    pub fn set_page(&mut self, page: usize, data: &[u8]) -> Result<()> {
        if page >= self.geometry.page_count() || data.len() != self.geometry.page_size() {
            return Err(Error::Config(format!(
                "page {page} with {} bytes does not fit the flash layout",
                data.len()
            )));
        }
        let range = self.geometry.page_range(page);
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    /// Write `data` starting at `address`.
    pub fn write(&mut self, address: usize, data: &[u8]) -> Result<()> {
        let end = address + data.len();
        if end > self.data.len() {
            return Err(Error::Config(format!(
                "{} bytes at {address:#06x} exceed flash size {}",
                data.len(),
                self.data.len()
            )));
        }
        self.data[address..end].copy_from_slice(data);
        Ok(())
    }

    /// Whether every byte of `range` is erased.
    pub fn is_range_erased(&self, range: Range<usize>) -> bool {
        self.data[range].iter().all(|&b| b == ERASED_BYTE)
    }

    /// Whether the whole image is erased.
    pub fn is_erased(&self) -> bool {
        self.is_range_erased(0..self.data.len())
    }

    /// Digest of the whole image.
    pub fn fingerprint(&self, hasher: &dyn Fingerprint) -> [u8; 32] {
        hasher.digest(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorFold;

    impl Fingerprint for XorFold {
        fn digest(&self, data: &[u8]) -> [u8; 32] {
            let mut out = [0u8; 32];
            for (i, b) in data.iter().enumerate() {
                out[i % 32] ^= b;
            }
            out
        }
    }

    #[test]
    fn test_geometry_validation() {
        assert!(FlashGeometry::new(0x10000, 512).is_ok());
        assert!(FlashGeometry::new(0x8000, 128).is_ok());
        assert!(FlashGeometry::new(1000, 512).is_err());
        assert!(FlashGeometry::new(0x20000, 512).is_err());
        assert!(FlashGeometry::new(0x10000, 0).is_err());
    }

    #[test]
    fn test_avr64db32_layout() {
        let geometry = FlashGeometry::AVR64DB32;
        assert_eq!(geometry.page_count(), 128);
        assert_eq!(geometry.page_address(127), 0xFE00);
        assert_eq!(geometry.page_range(1), 512..1024);
    }

    #[test]
    fn test_new_image_is_erased() {
        let image = FlashImage::new(FlashGeometry::AVR64DB32);
        assert_eq!(image.len(), 0x10000);
        assert!(image.is_erased());
    }

    #[test]
    fn test_write_and_erase() {
        let mut image = FlashImage::new(FlashGeometry::AVR64DB32);
        image.write(0x200, &[1, 2, 3]).unwrap();

        assert_eq!(&image.page(1)[..3], &[1, 2, 3]);
        assert!(!image.is_range_erased(0x200..0x210));
        assert!(image.is_range_erased(0..0x200));

        image.erase();
        assert!(image.is_erased());
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let mut image = FlashImage::new(FlashGeometry::AVR64DB32);
        assert!(image.write(0xFFFF, &[1, 2]).is_err());
        assert!(image.is_erased());
    }

    #[test]
    fn test_from_bytes_pads_with_erased() {
        let geometry = FlashGeometry::new(1024, 512).unwrap();
        let image = FlashImage::from_bytes(geometry, &[0x0C, 0x94]).unwrap();

        assert_eq!(&image.as_bytes()[..2], &[0x0C, 0x94]);
        assert!(image.is_range_erased(2..1024));
        assert!(FlashImage::from_bytes(geometry, &[0; 1025]).is_err());
    }

    #[test]
    fn test_set_page_checks_layout() {
        let geometry = FlashGeometry::new(1024, 512).unwrap();
        let mut image = FlashImage::new(geometry);

        image.set_page(1, &[0xAB; 512]).unwrap();
        assert!(image.page(1).iter().all(|&b| b == 0xAB));
        assert!(image.set_page(2, &[0; 512]).is_err());
        assert!(image.set_page(0, &[0; 100]).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let a = FlashImage::new(FlashGeometry::AVR64DB32);
        let mut b = a.clone();
        b.write(0x1234, &[0x00]).unwrap();

        assert_ne!(a.fingerprint(&XorFold), b.fingerprint(&XorFold));
        assert_eq!(a.fingerprint(&XorFold), a.clone().fingerprint(&XorFold));
    }
}
