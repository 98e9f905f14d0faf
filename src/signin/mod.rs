//! Progressive sign-in.
//!
//! `start` turns an email into an intermediate session, issuing an email challenge when
//! the address is not yet verified for the project. Completing the challenge marks the
//! intermediate session verified, which is what [`crate::session::SessionIssuer`] later
//! requires. An intermediate session is never a session: its tokens are signed with a
//! separate key class and carry a separate audience.

pub mod challenge;
pub mod flow;

pub use challenge::ChallengeError;
pub use flow::{IntermediateClaims, SignInFlow, SignInState, StartOutcome};

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignInError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("login method disabled")]
    Forbidden,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error(transparent)]
    Challenge(ChallengeError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ChallengeError> for SignInError {
    fn from(err: ChallengeError) -> Self {
        match err {
            ChallengeError::Internal(err) => Self::Internal(err),
            other => Self::Challenge(other),
        }
    }
}

/// Normalize an email for lookup and uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn email_validation() {
        assert!(valid_email("alice@example.com"));
        assert!(!valid_email("alice"));
        assert!(!valid_email("alice@example"));
        assert!(!valid_email("al ice@example.com"));
        assert!(!valid_email(""));
    }

    #[test]
    fn internal_challenge_errors_stay_internal() {
        let err = SignInError::from(ChallengeError::Internal(anyhow::anyhow!("db down")));
        assert!(matches!(err, SignInError::Internal(_)));
        let err = SignInError::from(ChallengeError::Expired);
        assert!(matches!(err, SignInError::Challenge(ChallengeError::Expired)));
    }
}
