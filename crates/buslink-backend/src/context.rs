use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BackendError, Result};

/// Shared context passed into backend constructors.
///
/// Replaces process-wide hardware-event singletons: everything a backend needs
/// from its environment comes through here. The one piece of state today is the
/// process-wide shutdown flag; once set, backend operations fail fast with
/// [`BackendError::Shutdown`] without touching hardware.
#[derive(Debug, Default)]
pub struct BackendContext {
    shutdown: AtomicBool,
}

impl BackendContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Begin process-wide teardown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fail fast when teardown has begun.
    pub fn check(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(BackendError::Shutdown)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_until_shutdown() {
        let ctx = BackendContext::new();
        assert!(ctx.check().is_ok());
        assert!(!ctx.is_shutdown());

        ctx.shutdown();
        assert!(ctx.is_shutdown());
        assert!(matches!(ctx.check(), Err(BackendError::Shutdown)));
    }
}
