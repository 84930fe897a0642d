//! Whole-flash read, program and verify.
//!
//! ## Program Cycle
//!
//! ```text
//! reset + identify ──► program pages 1..N ──► read back + compare ──► ok
//!        ▲                                            │
//!        └──── reconnect (reset + identify, bounded) ◄┘ mismatch
//! ```
//!
//! Page 0 holds the bootloader and is never programmed. Nothing is written
//! before the device has identified as the expected target.
//!
//! ## Example
//!
//! ```rust,no_run
//! use optiflash::image::ihex;
//! use optiflash::{
//!     BootloaderLink, FlashImage, FlashProgrammer, ModemLineReset, NativePort, ResetLine,
//!     SerialConfig, Strictness, Target,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let target = Target::avr64db32();
//!     let mut image = FlashImage::new(target.geometry);
//!     let file = std::fs::File::open("app.hex")?;
//!     ihex::decode_stream(file, &mut image, Strictness::Lenient)?;
//!
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!     let mut programmer = FlashProgrammer::new(
//!         BootloaderLink::new(port),
//!         ModemLineReset::new(ResetLine::Dtr),
//!         target,
//!     );
//!     let report = programmer.program_flash(&image, |_, _, _| {})?;
//!     println!("{:?} after {} attempt(s)", report.status, report.attempts);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::flash::FlashImage;
use crate::protocol::link::BootloaderLink;
use crate::protocol::stk::{PARAM_SW_MAJOR, PARAM_SW_MINOR};
use crate::port::Port;
use crate::reset::ResetControl;
use crate::target::{DeviceIdentity, Signature, Target};

/// Retry budget and reset timing.
#[derive(Debug, Clone)]
pub struct ProgrammerConfig {
    /// Program+verify cycles before giving up.
    pub attempts: usize,
    /// Reset+identify attempts between cycles.
    pub reconnect_attempts: usize,
    /// How long reset is held asserted.
    pub reset_assert: Duration,
    /// Wait after releasing reset for the bootloader to start.
    pub reset_settle: Duration,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            reconnect_attempts: 5,
            reset_assert: Duration::from_millis(10),
            reset_settle: Duration::from_millis(10),
        }
    }
}

impl ProgrammerConfig {
    /// Set the number of program+verify cycles (at least 1).
    #[must_use]
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the number of reconnect attempts between cycles (at least 1).
    #[must_use]
    pub fn with_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.reconnect_attempts = attempts.max(1);
        self
    }

    /// Set the reset pulse timing.
    #[must_use]
    pub fn with_reset_delays(mut self, assert: Duration, settle: Duration) -> Self {
        self.reset_assert = assert;
        self.reset_settle = settle;
        self
    }
}

/// Stage reported to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading flash.
    Reading,
    /// Programming pages.
    Programming,
    /// Reading back and comparing.
    Verifying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reading => write!(f, "Reading"),
            Self::Programming => write!(f, "Programming"),
            Self::Verifying => write!(f, "Verifying"),
        }
    }
}

/// Final status of [`FlashProgrammer::program_flash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStatus {
    /// Flash matches the image.
    Ok,
    /// Readback never matched within the retry budget.
    VerifyFailed,
    /// The device could not be identified; nothing was written.
    NoConnection,
}

/// Outcome of a program run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramReport {
    /// Final status.
    pub status: ProgramStatus,
    /// Program+verify cycles performed.
    pub attempts: usize,
    /// Mismatching addresses of the last verify.
    pub mismatches: Vec<usize>,
}

impl ProgramReport {
    fn no_connection() -> Self {
        Self {
            status: ProgramStatus::NoConnection,
            attempts: 0,
            mismatches: Vec::new(),
        }
    }

    /// Whether programming succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == ProgramStatus::Ok
    }

    /// Convert a failed status into an error.
    pub fn into_result(self) -> Result<()> {
        match self.status {
            ProgramStatus::Ok => Ok(()),
            ProgramStatus::VerifyFailed => Err(Error::VerifyFailed {
                attempts: self.attempts,
                mismatches: self.mismatches.len(),
            }),
            ProgramStatus::NoConnection => Err(Error::ConnectFailed(
                "device did not identify as the expected target".into(),
            )),
        }
    }
}

/// Read, program and verify a target's flash through its bootloader.
///
/// Generic over the port type `P` and the reset mechanism `R`.
pub struct FlashProgrammer<P: Port, R: ResetControl> {
    link: BootloaderLink<P>,
    reset: R,
    target: Target,
    config: ProgrammerConfig,
}

impl<P: Port, R: ResetControl> FlashProgrammer<P, R> {
    /// Create a programmer with the default retry budget.
    pub fn new(link: BootloaderLink<P>, reset: R, target: Target) -> Self {
        Self {
            link,
            reset,
            target,
            config: ProgrammerConfig::default(),
        }
    }

    /// Replace the retry and reset configuration.
    #[must_use]
    pub fn with_config(mut self, config: ProgrammerConfig) -> Self {
        self.config = config;
        self
    }

    /// Expected target.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Get a reference to the underlying link.
    pub fn link(&self) -> &BootloaderLink<P> {
        &self.link
    }

    /// Get a mutable reference to the underlying link.
    pub fn link_mut(&mut self) -> &mut BootloaderLink<P> {
        &mut self.link
    }

    /// Consume the programmer and return the link.
    pub fn into_link(self) -> BootloaderLink<P> {
        self.link
    }

    /// Pulse reset so the bootloader starts listening.
    pub fn reset(&mut self) -> Result<()> {
        debug!("Resetting target on {}", self.link.port().name());
        self.reset.assert_reset(self.link.port_mut())?;
        thread::sleep(self.config.reset_assert);
        self.reset.release_reset(self.link.port_mut())?;
        thread::sleep(self.config.reset_settle);
        self.link.flush();
        Ok(())
    }

    /// Reset the target and read its version and signature.
    ///
    /// Fails with [`Error::ConnectFailed`] if a version query does not end
    /// with OK, or if a link fault interrupts any of the three queries. The
    /// signature is returned as read; see [`DeviceIdentity::matches`].
    pub fn connect_and_identify(&mut self) -> Result<DeviceIdentity> {
        self.reset()?;

        let major = self.query_version(PARAM_SW_MAJOR, "major")?;
        let minor = self.query_version(PARAM_SW_MINOR, "minor")?;
        let signature = match self.link.read_signature() {
            Ok(reply) => Signature(reply.data),
            Err(e) if e.is_link_fault() => {
                return Err(Error::ConnectFailed(format!("signature read failed: {e}")));
            },
            Err(e) => return Err(e),
        };

        let identity = DeviceIdentity {
            signature,
            major,
            minor,
        };
        info!(
            "Found device {} (bootloader {})",
            identity.signature,
            identity.version()
        );
        Ok(identity)
    }

    fn query_version(&mut self, param: u8, which: &str) -> Result<u8> {
        match self.link.get_parameter(param) {
            // A missing in-sync already failed the query when strict.
            Ok(reply) if reply.status.is_ok() => Ok(reply.data),
            Ok(reply) => Err(Error::ConnectFailed(format!(
                "{which} version query failed ({:?}, in-sync: {})",
                reply.status, reply.in_sync
            ))),
            Err(e) if e.is_link_fault() => Err(Error::ConnectFailed(format!(
                "{which} version query failed: {e}"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Identify the device and require it to be the expected target.
    fn identify_target(&mut self) -> Result<DeviceIdentity> {
        let identity = self.connect_and_identify()?;
        if !identity.matches(&self.target) {
            return Err(Error::SignatureMismatch {
                expected: self.target.signature,
                actual: identity.signature,
            });
        }
        Ok(identity)
    }

    fn check_geometry(&self, image: &FlashImage) -> Result<()> {
        if image.geometry() != self.target.geometry {
            return Err(Error::Config(format!(
                "image layout {:?} does not match {}",
                image.geometry(),
                self.target.name
            )));
        }
        Ok(())
    }

    fn page_len(&self) -> Result<u16> {
        u16::try_from(self.target.geometry.page_size()).map_err(|_| {
            Error::Config(format!(
                "page size {} does not fit a 16-bit length",
                self.target.geometry.page_size()
            ))
        })
    }

    /// Read the whole flash into a new image.
    ///
    /// Fails with [`Error::SignatureMismatch`] if the device is not the
    /// expected target. In lenient mode a stalled page reads as erased
    /// bytes; in strict mode it fails the whole read.
    pub fn read_flash<F>(&mut self, mut progress: F) -> Result<FlashImage>
    where
        F: FnMut(Phase, usize, usize),
    {
        self.identify_target()?;

        let geometry = self.target.geometry;
        let page_len = self.page_len()?;
        let total = geometry.page_count();
        let mut image = FlashImage::new(geometry);
        info!("Reading {} pages", total);

        for page in 0..total {
            self.link.load_address(geometry.page_address(page))?;
            let reply = self.link.read_page(page_len)?;
            if !reply.is_ok() {
                warn!("Page {page} read ended with {:?}", reply.status);
            }
            image.set_page(page, &reply.data)?;
            progress(Phase::Reading, page + 1, total);
        }

        info!("Read complete");
        Ok(image)
    }

    /// Compare device flash against `image` without programming.
    ///
    /// Returns every mismatching address of the programmable pages.
    pub fn verify<F>(&mut self, image: &FlashImage, mut progress: F) -> Result<Vec<usize>>
    where
        F: FnMut(Phase, usize, usize),
    {
        self.check_geometry(image)?;
        self.identify_target()?;
        let mismatches = self.verify_pages(image, &mut progress)?;
        if mismatches.is_empty() {
            info!("Flash matches image");
        } else {
            warn!("{} bytes differ", mismatches.len());
        }
        Ok(mismatches)
    }

    /// Program `image` with read-back verification and bounded retries.
    ///
    /// The device must identify as the expected target first; otherwise the
    /// report says [`ProgramStatus::NoConnection`] and nothing is written.
    pub fn program_flash<F>(&mut self, image: &FlashImage, mut progress: F) -> Result<ProgramReport>
    where
        F: FnMut(Phase, usize, usize),
    {
        self.check_geometry(image)?;

        match self.identify_target() {
            Ok(_) => {},
            Err(e @ (Error::SignatureMismatch { .. } | Error::ConnectFailed(_))) => {
                warn!("Not programming: {e}");
                return Ok(ProgramReport::no_connection());
            },
            Err(e) => return Err(e),
        }

        let attempts = self.config.attempts.max(1);
        let mut mismatches = Vec::new();

        for attempt in 1..=attempts {
            info!("Programming (attempt {attempt}/{attempts})");

            let outcome = self
                .program_pages(image, &mut progress)
                .and_then(|()| self.verify_pages(image, &mut progress));

            match outcome {
                Ok(found) if found.is_empty() => {
                    info!("Verify OK");
                    return Ok(ProgramReport {
                        status: ProgramStatus::Ok,
                        attempts: attempt,
                        mismatches: found,
                    });
                },
                Ok(found) => {
                    warn!("Verify failed: {} bytes differ", found.len());
                    mismatches = found;
                },
                Err(e) if e.is_link_fault() => {
                    warn!("Attempt {attempt} aborted: {e}");
                    mismatches.clear();
                },
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                match self.reconnect() {
                    Ok(()) => {},
                    Err(e @ Error::ReconnectExhausted { .. }) => {
                        warn!("{e}");
                        return Ok(ProgramReport {
                            status: ProgramStatus::VerifyFailed,
                            attempts: attempt,
                            mismatches,
                        });
                    },
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(ProgramReport {
            status: ProgramStatus::VerifyFailed,
            attempts,
            mismatches,
        })
    }

    /// Reset and re-identify until the target answers or the budget runs out.
    fn reconnect(&mut self) -> Result<()> {
        let attempts = self.config.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.identify_target() {
                Ok(_) => return Ok(()),
                Err(e)
                    if e.is_link_fault()
                        || matches!(
                            e,
                            Error::SignatureMismatch { .. } | Error::ConnectFailed(_)
                        ) =>
                {
                    warn!("Reconnect attempt {attempt}/{attempts} failed: {e}");
                },
                Err(e) => return Err(e),
            }
        }
        Err(Error::ReconnectExhausted { attempts })
    }

    fn program_pages<F>(&mut self, image: &FlashImage, progress: &mut F) -> Result<()>
    where
        F: FnMut(Phase, usize, usize),
    {
        let geometry = self.target.geometry;
        let pages = self.target.programmable_pages();
        let total = pages.len();

        for (done, page) in pages.enumerate() {
            self.link.load_address(geometry.page_address(page))?;
            let reply = self.link.write_page(image.page(page))?;
            if !reply.is_ok() {
                warn!("Page {page} program ended with {:?}", reply.status);
            }
            progress(Phase::Programming, done + 1, total);
        }
        Ok(())
    }

    /// Read back every programmable page and collect all differing addresses.
    fn verify_pages<F>(&mut self, image: &FlashImage, progress: &mut F) -> Result<Vec<usize>>
    where
        F: FnMut(Phase, usize, usize),
    {
        let geometry = self.target.geometry;
        let page_len = self.page_len()?;
        let pages = self.target.programmable_pages();
        let total = pages.len();
        let mut mismatches = Vec::new();

        for (done, page) in pages.enumerate() {
            self.link.load_address(geometry.page_address(page))?;
            let reply = self.link.read_page(page_len)?;
            let base = geometry.page_range(page).start;
            for (offset, (expected, actual)) in image.page(page).iter().zip(&reply.data).enumerate()
            {
                if expected != actual {
                    debug!(
                        "Mismatch at 0x{:04X}: expected 0x{expected:02X}, read 0x{actual:02X}",
                        base + offset
                    );
                    mismatches.push(base + offset);
                }
            }
            progress(Phase::Verifying, done + 1, total);
        }
        Ok(mismatches)
    }
}
