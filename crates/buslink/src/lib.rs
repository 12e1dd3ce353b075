//! Multiplexed logical byte streams over one claimed physical device channel.
//!
//! A physical device (USB today; the backend trait leaves room for PCI and
//! Bluetooth analogues) exposes one shared control endpoint and one bulk
//! in/out pipe pair. buslink claims the device exclusively and multiplexes
//! many independent, concurrent, ordered byte streams over that single
//! channel: application bytes are framed into id-tagged subpackets, writes
//! are scheduled fairly, and out-of-order read completions are re-ordered so
//! each stream's consumer sees its bytes exactly as the peer produced them.
//!
//! The layering, bottom up:
//! - [`buslink_backend`]: how to find, open and talk to a device
//! - [`buslink_frame`]: the subpacket wire format
//! - this crate: device initialization, the claim state machine, the
//!   multiplex/demultiplex engine, stream handles and connection routing

pub mod claim;
pub mod descriptor;
pub mod error;
pub mod initializer;
pub mod manager;
pub mod reorder;
pub mod retry;
pub mod settings;
pub mod stream;

pub use claim::{ClaimConfig, DeviceClaim};
pub use error::{ClaimError, Result};
pub use initializer::DeviceInitializer;
pub use manager::{DeviceManager, DeviceView};
pub use reorder::SequenceReorderer;
pub use retry::RetryPolicy;
pub use settings::{DeviceSettings, DeviceStatus, PipeSettings, TargetIdentity};
pub use stream::StreamConnection;
