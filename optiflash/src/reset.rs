//! Reset-line control.
//!
//! Optiboot only listens for a short window after the target comes out of
//! reset, so every session starts with a reset pulse. Boards usually wire
//! DTR (sometimes RTS) through a capacitor to the reset pin; other setups
//! drive it from a GPIO. The `ResetControl` trait covers both: it receives
//! the port so modem-line implementations can toggle it, and GPIO-based
//! implementations simply ignore it.

use log::trace;

use crate::error::Result;
use crate::port::Port;

/// Assert/release access to the target's reset signal.
pub trait ResetControl {
    /// Drive the target into reset.
    fn assert_reset(&mut self, port: &mut dyn Port) -> Result<()>;

    /// Let the target run (into its bootloader).
    fn release_reset(&mut self, port: &mut dyn Port) -> Result<()>;
}

/// Modem line(s) wired to the reset pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ResetLine {
    /// DTR only (Arduino-style auto-reset).
    #[default]
    Dtr,
    /// RTS only.
    Rts,
    /// DTR and RTS together.
    Both,
}

impl ResetLine {
    /// Parse a line name (`dtr`, `rts`, `both`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "dtr" => Some(Self::Dtr),
            "rts" => Some(Self::Rts),
            "both" | "dtr+rts" => Some(Self::Both),
            _ => None,
        }
    }
}

/// Reset through the serial port's modem control lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModemLineReset {
    line: ResetLine,
}

impl ModemLineReset {
    /// Create a reset controller using the given line(s).
    pub fn new(line: ResetLine) -> Self {
        Self { line }
    }

    fn drive(&self, port: &mut dyn Port, level: bool) -> Result<()> {
        trace!("Driving {:?} reset line to {level}", self.line);
        match self.line {
            ResetLine::Dtr => port.set_dtr(level),
            ResetLine::Rts => port.set_rts(level),
            ResetLine::Both => {
                port.set_dtr(level)?;
                port.set_rts(level)
            },
        }
    }
}

impl ResetControl for ModemLineReset {
    fn assert_reset(&mut self, port: &mut dyn Port) -> Result<()> {
        self.drive(port, true)
    }

    fn release_reset(&mut self, port: &mut dyn Port) -> Result<()> {
        self.drive(port, false)
    }
}

/// No reset wiring; the operator resets the target by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReset;

impl ResetControl for NoReset {
    fn assert_reset(&mut self, _port: &mut dyn Port) -> Result<()> {
        Ok(())
    }

    fn release_reset(&mut self, _port: &mut dyn Port) -> Result<()> {
        Ok(())
    }
}

impl<R: ResetControl + ?Sized> ResetControl for Box<R> {
    fn assert_reset(&mut self, port: &mut dyn Port) -> Result<()> {
        (**self).assert_reset(port)
    }

    fn release_reset(&mut self, port: &mut dyn Port) -> Result<()> {
        (**self).release_reset(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockBootloader;

    #[test]
    fn test_reset_line_from_name() {
        assert_eq!(ResetLine::from_name("DTR"), Some(ResetLine::Dtr));
        assert_eq!(ResetLine::from_name("rts"), Some(ResetLine::Rts));
        assert_eq!(ResetLine::from_name("both"), Some(ResetLine::Both));
        assert_eq!(ResetLine::from_name("gpio"), None);
    }

    #[test]
    fn test_modem_line_pulse_resets_target() {
        let mut port = MockBootloader::new(1024);
        let mut reset = ModemLineReset::new(ResetLine::Both);

        reset.assert_reset(&mut port).unwrap();
        reset.release_reset(&mut port).unwrap();

        assert_eq!(port.resets, 1);
    }

    #[test]
    fn test_no_reset_leaves_lines_alone() {
        let mut port = MockBootloader::new(1024);
        let mut reset = NoReset;

        reset.assert_reset(&mut port).unwrap();
        reset.release_reset(&mut port).unwrap();

        assert_eq!(port.resets, 0);
    }
}
