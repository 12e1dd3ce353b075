use buslink_backend::BackendError;
use buslink_frame::SubpacketError;

/// Errors surfaced by device initialization, claiming and stream operations.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    /// The device is exclusively locked by another claimant and the retry
    /// budget is exhausted.
    #[error("device busy")]
    Busy,

    /// Opening the device was denied by the operating system. Never retried.
    #[error("device access unauthorized")]
    Unauthorized,

    /// The device does not advertise the expected protocol, or violated it.
    #[error("invalid device: {0}")]
    Invalid(String),

    /// A transport-level device failure. Fatal for the whole claim.
    #[error("device error: {0}")]
    Device(String),

    /// The peer received a malformed subpacket.
    #[error("protocol violation: {0}")]
    Protocol(#[from] SubpacketError),

    /// The stream or its claim is gone; reads and writes can never complete.
    #[error("broken pipe: stream closed")]
    BrokenPipe,

    /// The operation was cancelled by claim teardown.
    #[error("operation aborted")]
    Aborted,

    /// No known device matches the requested identity, or all matches are
    /// busy.
    #[error("no matching device or device busy")]
    NoMatchingDevice,

    /// Process-wide teardown is in progress.
    #[error("shutting down")]
    Shutdown,
}

impl ClaimError {
    /// True for the one transient variant worth retrying.
    pub fn is_busy(&self) -> bool {
        matches!(self, ClaimError::Busy)
    }

    /// Duplicate this error for delivery to several queued waiters.
    pub(crate) fn duplicate(&self) -> ClaimError {
        match self {
            ClaimError::Busy => ClaimError::Busy,
            ClaimError::Unauthorized => ClaimError::Unauthorized,
            ClaimError::Invalid(s) => ClaimError::Invalid(s.clone()),
            ClaimError::Device(s) => ClaimError::Device(s.clone()),
            ClaimError::Protocol(e) => ClaimError::Device(e.to_string()),
            ClaimError::BrokenPipe => ClaimError::BrokenPipe,
            ClaimError::Aborted => ClaimError::Aborted,
            ClaimError::NoMatchingDevice => ClaimError::NoMatchingDevice,
            ClaimError::Shutdown => ClaimError::Shutdown,
        }
    }
}

impl From<BackendError> for ClaimError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Busy => ClaimError::Busy,
            BackendError::Unauthorized => ClaimError::Unauthorized,
            BackendError::Shutdown => ClaimError::Shutdown,
            other => ClaimError::Device(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClaimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_taxonomy() {
        assert!(ClaimError::from(BackendError::Busy).is_busy());
        assert!(matches!(
            ClaimError::from(BackendError::Unauthorized),
            ClaimError::Unauthorized
        ));
        assert!(matches!(
            ClaimError::from(BackendError::Shutdown),
            ClaimError::Shutdown
        ));
        assert!(matches!(
            ClaimError::from(BackendError::Transfer("stall".into())),
            ClaimError::Device(_)
        ));
    }

    #[test]
    fn duplicate_preserves_variant() {
        let original = ClaimError::Invalid("bad descriptor".into());
        assert!(matches!(
            original.duplicate(),
            ClaimError::Invalid(s) if s == "bad descriptor"
        ));
        assert!(ClaimError::Busy.duplicate().is_busy());
    }
}
