//! Image file loading and the `hash` command.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use log::debug;
use optiflash::image::ihex::hex_encode_bytes;
use optiflash::{
    FlashImage, Fingerprint, Strictness, Target, decode_stream, first_unreadable_record, write_hex,
};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::{Cli, ImageFormat};

/// SHA-256 fingerprint of a flash image.
pub(crate) struct Sha256Fingerprint;

impl Fingerprint for Sha256Fingerprint {
    fn digest(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }
}

/// Uppercase SHA-256 of the whole image.
pub(crate) fn fingerprint_hex(image: &FlashImage) -> String {
    hex_encode_bytes(&image.fingerprint(&Sha256Fingerprint))
}

fn is_binary(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"))
}

/// Load a file into an erased image of `target`'s geometry.
///
/// `.bin` files are raw binaries; anything else is decoded as Intel-HEX.
pub(crate) fn load_image(path: &Path, target: &Target, strictness: Strictness) -> Result<FlashImage> {
    if is_binary(path) {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return FlashImage::from_bytes(target.geometry, &bytes)
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut image = FlashImage::new(target.geometry);
    let summary = decode_stream(file, &mut image, strictness)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    debug!(
        "{}: {} records, {} data bytes, EOF record {}",
        path.display(),
        summary.records,
        summary.bytes,
        if summary.end_of_file { "present" } else { "missing" }
    );
    Ok(image)
}

/// Write `image` to `path` as Intel-HEX (with EOF record) or raw binary.
pub(crate) fn save_image(image: &FlashImage, path: &Path, format: ImageFormat) -> Result<()> {
    match format {
        ImageFormat::Bin => std::fs::write(path, image.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?,
        ImageFormat::Hex => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let lines = write_hex(image, BufWriter::new(file), true)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            debug!("Wrote {lines} HEX records to {}", path.display());
        },
    }
    Ok(())
}

/// Warning for a HEX export that this tool could not load again.
pub(crate) fn hex_export_warning(image: &FlashImage, format: ImageFormat) -> Option<String> {
    if format != ImageFormat::Hex {
        return None;
    }
    let address = first_unreadable_record(image)?;
    Some(format!(
        "data at 0x{address:04X} reaches past 0xFFFF; the HEX file cannot be read back, use --format bin to keep it"
    ))
}

/// Hash command implementation.
pub(crate) fn cmd_hash(cli: &Cli, config: &Config, input: &Path) -> Result<()> {
    let target = config.resolve_target(cli.target.as_deref())?;
    let image = load_image(input, &target, config.strictness(cli.strict))?;

    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes, {})",
            style("ℹ").blue(),
            input.display(),
            image.len(),
            target
        );
    }
    println!("{}", fingerprint_hex(&image));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_of_erased_image() {
        let image = FlashImage::new(Target::avr64db32().geometry);
        let expected: [u8; 32] = Sha256::digest(vec![0xFF; 0x10000]).into();
        assert_eq!(fingerprint_hex(&image), hex_encode_bytes(&expected));
        assert_eq!(fingerprint_hex(&image).len(), 64);
    }

    #[test]
    fn test_load_hex_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.hex");
        std::fs::write(&path, ":020020000A0BC9\n:00000001FF\n").unwrap();

        let image = load_image(&path, &Target::avr64db32(), Strictness::Lenient).unwrap();
        assert_eq!(&image.as_bytes()[0x20..0x22], &[0x0A, 0x0B]);
        assert_eq!(image.as_bytes()[0x22], 0xFF);
    }

    #[test]
    fn test_load_bin_file_is_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.BIN");
        std::fs::write(&path, [1, 2, 3]).unwrap();

        let image = load_image(&path, &Target::avr64db32(), Strictness::Lenient).unwrap();
        assert_eq!(&image.as_bytes()[..4], &[1, 2, 3, 0xFF]);
        assert_eq!(image.len(), 0x10000);
    }

    #[test]
    fn test_load_bad_hex_reports_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.hex");
        std::fs::write(&path, ":020020000A0BC8\n").unwrap();

        let err = load_image(&path, &Target::avr64db32(), Strictness::Lenient).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<optiflash::Error>(),
            Some(optiflash::Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_hex_export_warning_for_last_chunk() {
        let target = Target::avr64db32();
        let mut image = FlashImage::new(target.geometry);
        assert!(hex_export_warning(&image, ImageFormat::Hex).is_none());

        image.write(0xFFF8, &[0x00]).unwrap();
        let warning = hex_export_warning(&image, ImageFormat::Hex).unwrap();
        assert!(warning.contains("0xFFF0"));
        assert!(warning.contains("--format bin"));
        assert!(hex_export_warning(&image, ImageFormat::Bin).is_none());
    }

    #[test]
    fn test_save_and_reload_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.hex");
        let target = Target::avr64db32();
        let mut image = FlashImage::new(target.geometry);
        image.write(0x200, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        save_image(&image, &path, ImageFormat::Hex).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with(":00000001FF\n"));

        let reloaded = load_image(&path, &target, Strictness::Strict).unwrap();
        assert_eq!(reloaded, image);
    }
}
