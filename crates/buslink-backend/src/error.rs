/// Errors that can occur in device backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The device is exclusively locked by another claimant. Callers retry
    /// this with bounded backoff; every other variant is surfaced as-is.
    #[error("device busy (exclusively locked by another claimant)")]
    Busy,

    /// Opening the device was denied by the operating system.
    #[error("permission denied opening device")]
    Unauthorized,

    /// No device exists at the given path.
    #[error("no device at {0}")]
    NotFound(String),

    /// Process-wide teardown is in progress; the hardware was not touched.
    #[error("backend shut down")]
    Shutdown,

    /// A control or bulk transfer failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Any other I/O error from the platform layer.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// True for the one transient variant worth retrying.
    pub fn is_busy(&self) -> bool {
        matches!(self, BackendError::Busy)
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
