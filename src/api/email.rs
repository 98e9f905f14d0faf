//! Verification-code delivery.
//!
//! Sign-in hands each freshly generated code to a [`CodeSender`] exactly once; the code
//! itself is never persisted. The default sender for local development logs the
//! delivery without the code.

use anyhow::Result;
use tracing::info;

#[derive(Clone, PartialEq, Eq)]
pub struct VerificationCode {
    pub to_email: String,
    pub challenge_id: String,
    pub code: String,
}

impl std::fmt::Debug for VerificationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationCode")
            .field("to_email", &self.to_email)
            .field("challenge_id", &self.challenge_id)
            .field("code", &"***")
            .finish()
    }
}

/// Delivery abstraction for one-time codes.
pub trait CodeSender: Send + Sync {
    /// Deliver a code or return an error to abort the sign-in attempt.
    fn send(&self, message: &VerificationCode) -> Result<()>;
}

/// Local dev sender that only logs.
#[derive(Clone, Debug)]
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send(&self, message: &VerificationCode) -> Result<()> {
        info!(
            to_email = %message.to_email,
            challenge_id = %message.challenge_id,
            "verification code send stub"
        );
        Ok(())
    }
}
