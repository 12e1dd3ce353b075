//! Platform device-I/O abstraction for buslink.
//!
//! Provides a unified async interface over the bus-specific mechanics of
//! finding, opening and talking to a multiplexing-capable device:
//! - Linux USB via `nusb`
//! - A scriptable in-memory mock for tests
//!
//! This is the lowest layer of buslink. The multiplex engine above it never
//! depends on which backend is active.

pub mod context;
pub mod error;
pub mod traits;

#[cfg(target_os = "linux")]
pub mod usb;

#[doc(hidden)]
pub mod mock;

pub use context::BackendContext;
pub use error::{BackendError, Result};
pub use traits::{CandidateDevice, ControlRequest, DeviceBackend, DeviceIo, PipeInfo, PipePair};

#[cfg(target_os = "linux")]
pub use usb::UsbBackend;
