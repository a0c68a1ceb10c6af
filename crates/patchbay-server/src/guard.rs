//! Pre-dispatch authorization hook.
//!
//! A [`DispatchGuard`] sees every resolved connection before any parameter
//! binding or session construction happens. A veto terminates the handshake
//! with a policy-violation close frame and leaves no trace in the session
//! registry.

use async_trait::async_trait;
use patchbay_core::RequestMeta;
use thiserror::Error;

use crate::routes::Registration;

/// Rejection returned by a [`DispatchGuard`].
#[derive(Debug, Clone, Error)]
#[error("dispatch vetoed: {reason}")]
pub struct DispatchVeto {
    reason: String,
}

impl DispatchVeto {
    /// Creates a veto with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason this connection was refused.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Authorization hook consulted after route resolution and before
/// parameter binding.
#[async_trait]
pub trait DispatchGuard: Send + Sync {
    /// Returns `Ok(())` to let the connection proceed to binding, or a
    /// [`DispatchVeto`] to refuse it.
    async fn authorize(
        &self,
        registration: &Registration,
        meta: &RequestMeta,
    ) -> Result<(), DispatchVeto>;
}

/// Guard that admits every connection. Used when no guard is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl DispatchGuard for AllowAll {
    async fn authorize(
        &self,
        _registration: &Registration,
        _meta: &RequestMeta,
    ) -> Result<(), DispatchVeto> {
        Ok(())
    }
}
