//! User-presence gate for keystores that do not enforce one in hardware

use crate::error::{KeygateError, Result};

/// Asked before every use of a presence-gated private key.
///
/// Returning `Err(KeygateError::AuthenticationDenied)` refuses the operation.
/// Implementations may block for as long as the user takes to answer.
pub trait PresenceCheck: Send + Sync {
    fn confirm(&self, prompt: &str) -> Result<()>;
}

/// Approves every request without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl PresenceCheck for AutoApprove {
    fn confirm(&self, _prompt: &str) -> Result<()> {
        Ok(())
    }
}

/// Refuses every request, as if the user cancelled the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDeny;

impl PresenceCheck for AlwaysDeny {
    fn confirm(&self, prompt: &str) -> Result<()> {
        Err(KeygateError::AuthenticationDenied(format!(
            "presence check refused: {}",
            prompt
        )))
    }
}

impl<F> PresenceCheck for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn confirm(&self, prompt: &str) -> Result<()> {
        self(prompt)
    }
}
