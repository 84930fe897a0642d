//! Framed command/response exchange with the bootloader.
//!
//! Every command runs the same sequence:
//!
//! 1. flush stale output and discard unread input,
//! 2. write the opcode and its payload,
//! 3. write `CRC_EOP` and poll for `STK_INSYNC`,
//! 4. read the fixed-length response payload,
//! 5. read the final status byte.
//!
//! Whether a missing in-sync, a timed-out payload byte or a non-OK status is
//! fatal depends on the link's [`Strictness`]. In lenient mode they are
//! logged and surfaced through [`Reply`], leaving the decision to the caller.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::stk::{CRC_EOP, Command, CommandFrame, Reply, STK_INSYNC, Status, Strictness};
use log::{debug, trace, warn};
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Default page length for read-page.
pub const DEFAULT_PAGE_LEN: u16 = 512;

/// Timeouts and strictness of the link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Timeout for each response payload byte.
    pub byte_timeout: Duration,
    /// Timeout for the final status byte.
    pub status_timeout: Duration,
    /// Overall bound for waiting on in-sync after an end-of-frame.
    pub sync_timeout: Duration,
    /// Timeout of a single in-sync poll.
    pub sync_poll: Duration,
    /// How protocol deviations are treated.
    pub strictness: Strictness,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            byte_timeout: Duration::from_millis(250),
            status_timeout: Duration::from_millis(1000),
            sync_timeout: Duration::from_millis(1000),
            sync_poll: Duration::from_millis(250),
            strictness: Strictness::Lenient,
        }
    }
}

impl LinkConfig {
    /// Set the strictness policy.
    #[must_use]
    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    /// Set the in-sync wait bound and poll interval.
    #[must_use]
    pub fn with_sync(mut self, timeout: Duration, poll: Duration) -> Self {
        self.sync_timeout = timeout;
        self.sync_poll = poll;
        self
    }

    /// Number of silent polls that exhaust the in-sync bound.
    fn sync_polls(&self) -> u32 {
        let poll = self.sync_poll.as_millis().max(1);
        let polls = self.sync_timeout.as_millis().div_ceil(poll);
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }
}

/// Command/response link to an optiboot-style bootloader.
pub struct BootloaderLink<P: Port> {
    port: P,
    config: LinkConfig,
}

impl<P: Port> BootloaderLink<P> {
    /// Create a link with default timeouts.
    pub fn new(port: P) -> Self {
        Self::with_config(port, LinkConfig::default())
    }

    /// Create a link with custom timeouts and strictness.
    pub fn with_config(port: P, config: LinkConfig) -> Self {
        Self { port, config }
    }

    /// Link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the link and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Read one byte, waiting at most `timeout` from now.
    pub fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        if self.port.timeout() != timeout {
            self.port.set_timeout(timeout)?;
        }

        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => {
                trace!("<- 0x{:02X}", buf[0]);
                Ok(buf[0])
            },
            Ok(_) => Err(Error::Timeout(format!(
                "no byte within {} ms",
                timeout.as_millis()
            ))),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Err(
                Error::Timeout(format!("no byte within {} ms", timeout.as_millis())),
            ),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write one byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        trace!("-> 0x{byte:02X}");
        self.port.write_all_bytes(&[byte])
    }

    /// Drain pending output and discard unread input.
    ///
    /// Best effort: failures are only traced.
    pub fn flush(&mut self) {
        if let Err(e) = self.port.flush() {
            trace!("Output flush failed (ignoring): {e}");
        }
        if let Err(e) = self.port.clear_input() {
            trace!("Input discard failed (ignoring): {e}");
        }
    }

    /// Send the end-of-frame marker and wait for in-sync.
    ///
    /// Returns whether in-sync arrived within the configured bound. Bytes
    /// other than in-sync are discarded while waiting.
    pub fn end_of_frame(&mut self) -> Result<bool> {
        self.write_byte(CRC_EOP)?;

        let start = Instant::now();
        let max_idle = self.config.sync_polls();
        let mut idle = 0;

        while idle < max_idle {
            let remaining = self.config.sync_timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match self.read_byte(self.config.sync_poll.min(remaining)) {
                Ok(STK_INSYNC) => return Ok(true),
                Ok(b) => trace!("Discarding 0x{b:02X} while waiting for in-sync"),
                Err(Error::Timeout(_)) => idle += 1,
                Err(e) => return Err(e),
            }
        }

        Ok(false)
    }

    /// Read the device signature.
    pub fn read_signature(&mut self) -> Result<Reply<[u8; 3]>> {
        let in_sync = self.send(&CommandFrame::read_signature())?;
        let mut sig = [0u8; 3];
        for b in &mut sig {
            *b = self.read_payload_byte()?;
        }
        let status = self.read_status(Command::ReadSignature)?;
        debug!("Signature {sig:02X?} ({status:?})");
        Ok(Reply {
            data: sig,
            status,
            in_sync,
        })
    }

    /// Set the address used by the next page command.
    pub fn load_address(&mut self, address: u16) -> Result<Reply<()>> {
        let in_sync = self.send(&CommandFrame::load_address(address))?;
        let status = self.read_status(Command::LoadAddress)?;
        trace!("Address 0x{address:04X} loaded ({status:?})");
        Ok(Reply {
            data: (),
            status,
            in_sync,
        })
    }

    /// Read `length` bytes of flash from the loaded address.
    pub fn read_page(&mut self, length: u16) -> Result<Reply<Vec<u8>>> {
        let in_sync = self.send(&CommandFrame::read_page(length))?;
        let mut data = Vec::with_capacity(usize::from(length));
        for _ in 0..length {
            data.push(self.read_payload_byte()?);
        }
        let status = self.read_status(Command::ReadPage)?;
        Ok(Reply {
            data,
            status,
            in_sync,
        })
    }

    /// Program `data` at the loaded address.
    pub fn write_page(&mut self, data: &[u8]) -> Result<Reply<()>> {
        if data.len() > usize::from(u16::MAX) {
            return Err(Error::Config(format!(
                "page of {} bytes does not fit a 16-bit length",
                data.len()
            )));
        }
        let in_sync = self.send(&CommandFrame::program_page(data))?;
        let status = self.read_status(Command::ProgramPage)?;
        Ok(Reply {
            data: (),
            status,
            in_sync,
        })
    }

    /// Read a bootloader parameter (e.g. software version).
    pub fn get_parameter(&mut self, param: u8) -> Result<Reply<u8>> {
        let in_sync = self.send(&CommandFrame::get_parameter(param))?;
        let value = self.read_payload_byte_with(self.config.status_timeout)?;
        let status = self.read_status(Command::GetParameter)?;
        debug!("Parameter 0x{param:02X} = {value} ({status:?})");
        Ok(Reply {
            data: value,
            status,
            in_sync,
        })
    }

    /// Flush, write the frame and close it with end-of-frame.
    fn send(&mut self, frame: &CommandFrame) -> Result<bool> {
        self.flush();

        let data = frame.build();
        trace!("Sending {:?}: {} bytes", frame.command(), data.len());
        self.port.write_all_bytes(&data)?;

        let in_sync = self.end_of_frame()?;
        if !in_sync {
            if self.config.strictness.is_strict() {
                return Err(Error::NotInSync {
                    command: frame.command(),
                });
            }
            warn!("No in-sync after {:?}", frame.command());
        }
        Ok(in_sync)
    }

    fn read_payload_byte(&mut self) -> Result<u8> {
        self.read_payload_byte_with(self.config.byte_timeout)
    }

    /// A timed-out payload byte reads as 0xFF unless strict.
    fn read_payload_byte_with(&mut self, timeout: Duration) -> Result<u8> {
        match self.read_byte(timeout) {
            Err(Error::Timeout(_)) if !self.config.strictness.is_strict() => Ok(0xFF),
            other => other,
        }
    }

    fn read_status(&mut self, command: Command) -> Result<Status> {
        let status = match self.read_byte(self.config.status_timeout) {
            Ok(b) => Status::from_byte(b),
            Err(Error::Timeout(_)) => Status::Missing,
            Err(e) => return Err(e),
        };

        if !status.is_ok() {
            if self.config.strictness.is_strict() {
                return Err(Error::BadStatus {
                    command,
                    status: status.raw(),
                });
            }
            debug!("{command:?} ended with {status:?}");
        }
        Ok(status)
    }
}
