//! Simulated bootloader for unit tests.
//!
//! Parses the frames the host writes and answers the way an optiboot target
//! would, with knobs for the faults the programmer has to survive.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;
use crate::protocol::stk::{CRC_EOP, Command, STK_INSYNC, STK_OK};

pub(crate) const AVR64DB32_SIGNATURE: [u8; 3] = [0x1E, 0x96, 0x18];

/// In-memory bootloader speaking the STK500v1 subset.
pub(crate) struct MockBootloader {
    /// Flash contents of the simulated device.
    pub flash: Vec<u8>,
    /// Signature returned by read-signature.
    pub signature: [u8; 3],
    /// Signatures by reset count (last entry repeats); overrides `signature`.
    pub signature_after_reset: Vec<[u8; 3]>,
    /// Major and minor version.
    pub version: (u8, u8),
    /// Status byte sent after a get-parameter.
    pub version_status: u8,
    /// Number of program-page commands whose data gets corrupted.
    pub corrupt_programs: usize,
    /// Never answer with in-sync.
    pub drop_insync: bool,
    /// Stop answering after this many bytes of a page read.
    pub truncate_reads: Option<usize>,
    /// Ignore read-signature frames entirely.
    pub silent_signature: bool,
    /// Timed-out reads reported before each response becomes readable.
    pub stall_polls: usize,
    /// Reset pulses seen on DTR/RTS.
    pub resets: usize,
    /// Addresses targeted by every program-page command.
    pub programmed: Vec<u16>,
    /// Opcodes of all complete frames received.
    pub commands: Vec<Command>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    address: u16,
    line_asserted: bool,
    stalled: usize,
    timeout: Duration,
}

impl MockBootloader {
    pub(crate) fn new(flash_size: usize) -> Self {
        Self {
            flash: vec![0xFF; flash_size],
            signature: AVR64DB32_SIGNATURE,
            signature_after_reset: Vec::new(),
            version: (8, 3),
            version_status: STK_OK,
            corrupt_programs: 0,
            drop_insync: false,
            truncate_reads: None,
            silent_signature: false,
            stall_polls: 0,
            resets: 0,
            programmed: Vec::new(),
            commands: Vec::new(),
            rx: Vec::new(),
            tx: VecDeque::new(),
            address: 0,
            line_asserted: false,
            stalled: 0,
            timeout: Duration::from_millis(1),
        }
    }

    /// Queue bytes as if the device had sent them unprompted.
    pub(crate) fn inject(&mut self, bytes: &[u8]) {
        self.tx.extend(bytes);
    }

    pub(crate) fn count(&self, command: Command) -> usize {
        self.commands.iter().filter(|c| **c == command).count()
    }

    fn current_signature(&self) -> [u8; 3] {
        if self.signature_after_reset.is_empty() {
            return self.signature;
        }
        let idx = self
            .resets
            .saturating_sub(1)
            .min(self.signature_after_reset.len() - 1);
        self.signature_after_reset[idx]
    }

    /// Expected frame length (including the end-of-frame marker) for the
    /// bytes received so far, if it can be known yet.
    fn frame_len(&self) -> Option<usize> {
        let opcode = *self.rx.first()?;
        match Command::from_opcode(opcode)? {
            Command::ReadSignature => Some(2),
            Command::GetParameter => Some(3),
            Command::LoadAddress => Some(4),
            Command::ReadPage => Some(5),
            Command::ProgramPage => {
                if self.rx.len() < 3 {
                    return None;
                }
                let len = usize::from(u16::from_be_bytes([self.rx[1], self.rx[2]]));
                Some(5 + len)
            },
        }
    }

    fn process(&mut self) {
        loop {
            let Some(first) = self.rx.first().copied() else {
                return;
            };
            let Some(command) = Command::from_opcode(first) else {
                // Out of sync: drop the byte like the real loader would.
                self.rx.remove(0);
                continue;
            };
            let Some(len) = self.frame_len() else {
                return;
            };
            if self.rx.len() < len {
                return;
            }
            let frame: Vec<u8> = self.rx.drain(..len).collect();
            if frame[len - 1] != CRC_EOP {
                continue;
            }
            self.commands.push(command);
            self.respond(command, &frame[1..len - 1]);
        }
    }

    fn respond(&mut self, command: Command, payload: &[u8]) {
        if command == Command::ReadSignature && self.silent_signature {
            return;
        }
        self.stalled = self.stall_polls;
        if !self.drop_insync {
            self.tx.push_back(STK_INSYNC);
        }
        match command {
            Command::ReadSignature => {
                let sig = self.current_signature();
                self.tx.extend(sig);
                self.tx.push_back(STK_OK);
            },
            Command::GetParameter => {
                let value = match payload[0] {
                    0x81 => self.version.0,
                    0x82 => self.version.1,
                    _ => 0,
                };
                self.tx.push_back(value);
                self.tx.push_back(self.version_status);
            },
            Command::LoadAddress => {
                self.address = u16::from_le_bytes([payload[0], payload[1]]);
                self.tx.push_back(STK_OK);
            },
            Command::ReadPage => {
                let len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
                let start = usize::from(self.address);
                let end = (start + len).min(self.flash.len());
                let data = self.flash[start..end].to_vec();
                if let Some(limit) = self.truncate_reads {
                    self.tx.extend(data.iter().take(limit));
                    return;
                }
                self.tx.extend(data);
                self.tx.push_back(STK_OK);
            },
            Command::ProgramPage => {
                let data = &payload[3..];
                let start = usize::from(self.address);
                self.programmed.push(self.address);
                let end = (start + data.len()).min(self.flash.len());
                self.flash[start..end].copy_from_slice(&data[..end - start]);
                if self.corrupt_programs > 0 {
                    self.corrupt_programs -= 1;
                    self.flash[start] ^= 0x5A;
                }
                self.tx.push_back(STK_OK);
            },
        }
    }

    fn line(&mut self, level: bool) {
        if level {
            self.line_asserted = true;
        } else if self.line_asserted {
            self.line_asserted = false;
            self.resets += 1;
            self.rx.clear();
            self.tx.clear();
            self.address = 0;
        }
    }
}

impl Read for MockBootloader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.stalled > 0 {
            self.stalled -= 1;
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled"));
        }
        if self.tx.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockBootloader {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rx.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockBootloader {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_input(&mut self) -> Result<()> {
        self.tx.clear();
        self.stalled = 0;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.line(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.line(level);
        Ok(())
    }
}
