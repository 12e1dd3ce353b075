//! Subpacket framing for multiplexing logical streams over a shared device pipe.
//!
//! A physical device exposes one bulk in/out pipe pair; every logical stream's
//! bytes are carried inside subpackets framed with:
//! - A 2-byte little-endian total length (header included)
//! - A 2-byte little-endian flags word (data / command / notification)
//! - A 4-byte little-endian stream id
//!
//! The codec here is platform-independent; it never touches a device.

pub mod codec;
pub mod command;
pub mod error;

pub use codec::{
    decode_subpacket, encode_subpacket, Subpacket, FLAG_COMMAND, FLAG_DATA, FLAG_NOTIFICATION,
    HEADER_SIZE, MAX_SUBPACKET_SIZE,
};
pub use command::{
    command_name, Notification, CMD_CLOSE_STREAM, CMD_OPEN_STREAM, CMD_PAUSE_ALL, CMD_RESET_ALL,
    CMD_RESUME_ALL, CMD_SET_PROTOCOL,
};
pub use error::{Result, SubpacketError};
