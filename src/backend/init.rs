//! Process-wide, one-time driver initialization
//!
//! The first caller runs the initializer; its outcome is cached for the
//! life of the process. A failed initialization is never retried and the
//! driver is never torn down.

use std::sync::OnceLock;

use crate::error::BackendError;

pub struct DriverInit {
    status: OnceLock<Result<(), String>>,
}

impl DriverInit {
    pub const fn new() -> Self {
        Self {
            status: OnceLock::new(),
        }
    }

    /// Run `init` on first use, then return the cached outcome
    pub fn ensure<F>(&self, init: F) -> Result<(), BackendError>
    where
        F: FnOnce() -> Result<(), String>,
    {
        match self.status.get_or_init(|| {
            let status = init();
            match &status {
                Ok(()) => log::info!("Compute driver initialized"),
                Err(e) => log::warn!("Compute driver initialization failed: {}", e),
            }
            status
        }) {
            Ok(()) => Ok(()),
            Err(message) => Err(BackendError::new("driver init", message.clone())),
        }
    }

    /// `None` before the first attempt, otherwise whether it succeeded
    pub fn status(&self) -> Option<bool> {
        self.status.get().map(Result::is_ok)
    }
}

impl Default for DriverInit {
    fn default() -> Self {
        Self::new()
    }
}
