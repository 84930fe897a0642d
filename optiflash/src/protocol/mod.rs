//! Bootloader wire protocol.

pub mod link;
pub mod stk;

pub use link::{BootloaderLink, LinkConfig};
pub use stk::{Command, CommandFrame, Reply, Status, Strictness};
