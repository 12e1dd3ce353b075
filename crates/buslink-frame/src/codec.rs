use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SubpacketError};

/// Subpacket header: length (2) + flags (2) + stream id (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest encodable subpacket. The length field is a u16 and counts the header.
pub const MAX_SUBPACKET_SIZE: usize = u16::MAX as usize;

/// Flags word for application data.
pub const FLAG_DATA: u16 = 0;

/// Flags bit marking a command subpacket. A command from the device is a fatal
/// protocol violation and forces the whole claim closed.
pub const FLAG_COMMAND: u16 = 0x0001;

/// Flags bit marking a notification subpacket (2-byte code follows the header).
pub const FLAG_NOTIFICATION: u16 = 0x0002;

/// A framed unit of the multiplex protocol.
#[derive(Debug, Clone)]
pub struct Subpacket {
    /// Flags word (data / command / notification).
    pub flags: u16,
    /// Target/source stream id.
    pub id: i32,
    /// The bytes after the header.
    pub payload: Bytes,
}

impl Subpacket {
    /// Create a data subpacket for one stream's next chunk.
    pub fn data(id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            flags: FLAG_DATA,
            id,
            payload: payload.into(),
        }
    }

    /// The total wire size of this subpacket (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// True if the command bit is set.
    pub fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }

    /// True if the notification bit is set.
    pub fn is_notification(&self) -> bool {
        self.flags & FLAG_NOTIFICATION != 0
    }
}

/// Encode a subpacket into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────┬───────────┬───────────┬─────────────────┐
/// │ Length    │ Flags     │ Stream id │ Payload          │
/// │ (2B LE)   │ (2B LE)   │ (4B LE)   │ (Length-8 bytes) │
/// └───────────┴───────────┴───────────┴─────────────────┘
/// ```
/// Length counts the header, so an empty payload encodes as length 8.
pub fn encode_subpacket(flags: u16, id: i32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let total = HEADER_SIZE + payload.len();
    if total > MAX_SUBPACKET_SIZE {
        return Err(SubpacketError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_SUBPACKET_SIZE - HEADER_SIZE,
        });
    }
    dst.reserve(total);
    dst.put_u16_le(total as u16);
    dst.put_u16_le(flags);
    dst.put_i32_le(id);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one subpacket from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete subpacket yet.
/// On success, consumes the subpacket bytes from the buffer. A bulk completion
/// may carry several subpackets back to back; call in a loop until `None`.
pub fn decode_subpacket(src: &mut BytesMut) -> Result<Option<Subpacket>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let len = u16::from_le_bytes([src[0], src[1]]);
    if (len as usize) < HEADER_SIZE {
        return Err(SubpacketError::LengthTooShort { len });
    }
    if src.len() < len as usize {
        return Ok(None);
    }

    let flags = u16::from_le_bytes([src[2], src[3]]);
    let id = i32::from_le_bytes([src[4], src[5], src[6], src[7]]);

    src.advance(HEADER_SIZE);
    let payload = src.split_to(len as usize - HEADER_SIZE).freeze();

    Ok(Some(Subpacket { flags, id, payload }))
}
