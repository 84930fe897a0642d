//! Command implementations.
//!
//! Device commands share one connection path in `device`; file-only
//! commands live in `image`.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod image;
pub(crate) mod ports;
