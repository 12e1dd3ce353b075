//! Device control-command opcodes and in-band notification codes.
//!
//! Commands are issued over the shared control endpoint; notifications arrive
//! in-band as subpackets with [`FLAG_NOTIFICATION`](crate::FLAG_NOTIFICATION)
//! set and a 2-byte code after the header.

use bytes::Bytes;

use crate::error::{Result, SubpacketError};

/// Open a new logical stream. IN transfer; returns a 4-byte `i32 LE` stream id.
pub const CMD_OPEN_STREAM: u8 = 1;

/// Close one logical stream. `value` carries the stream id.
pub const CMD_CLOSE_STREAM: u8 = 2;

/// Reset every stream and abort in-flight transfers on the device side.
pub const CMD_RESET_ALL: u8 = 3;

/// Pause delivery on all streams.
pub const CMD_PAUSE_ALL: u8 = 4;

/// Resume delivery on all streams.
pub const CMD_RESUME_ALL: u8 = 5;

/// Announce the protocol version the host will speak. `value` carries the version.
pub const CMD_SET_PROTOCOL: u8 = 6;

/// Returns a human-readable name for a control-command opcode.
pub fn command_name(opcode: u8) -> &'static str {
    match opcode {
        CMD_OPEN_STREAM => "open-stream",
        CMD_CLOSE_STREAM => "close-stream",
        CMD_RESET_ALL => "reset-all-streams",
        CMD_PAUSE_ALL => "pause-all",
        CMD_RESUME_ALL => "resume-all",
        CMD_SET_PROTOCOL => "set-current-protocol",
        _ => "unknown",
    }
}

/// An in-band notification for one stream.
///
/// The affected stream is named by the subpacket header's `id` field; the
/// payload is just the 2-byte little-endian code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The peer closed its end of the stream.
    SocketClosed,
    /// The peer asks the host to stop sending on this stream.
    PauseRequest,
    /// The peer asks the host to resume sending on this stream.
    ResumeRequest,
}

impl Notification {
    /// The wire code for this notification.
    pub fn code(self) -> u16 {
        match self {
            Notification::SocketClosed => 1,
            Notification::PauseRequest => 2,
            Notification::ResumeRequest => 3,
        }
    }

    /// Decode a notification from a subpacket payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(SubpacketError::NotificationTruncated {
                size: payload.len(),
            });
        }
        match u16::from_le_bytes([payload[0], payload[1]]) {
            1 => Ok(Notification::SocketClosed),
            2 => Ok(Notification::PauseRequest),
            3 => Ok(Notification::ResumeRequest),
            other => Err(SubpacketError::UnknownNotification(other)),
        }
    }

    /// Encode this notification as a subpacket payload.
    pub fn encode(self) -> Bytes {
        Bytes::copy_from_slice(&self.code().to_le_bytes())
    }
}
