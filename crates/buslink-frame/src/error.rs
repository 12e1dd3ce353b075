/// Errors that can occur during subpacket encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum SubpacketError {
    /// The header declares a length shorter than the header itself.
    #[error("subpacket length {len} shorter than header (8 bytes)")]
    LengthTooShort { len: u16 },

    /// The payload exceeds what a subpacket can carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A notification subpacket is missing its 2-byte code.
    #[error("notification payload truncated ({size} bytes, need 2)")]
    NotificationTruncated { size: usize },

    /// A notification subpacket carries a code this implementation does not know.
    #[error("unknown notification code {0}")]
    UnknownNotification(u16),
}

pub type Result<T> = std::result::Result<T, SubpacketError>;
