//! One-time email codes.

use crate::store::EmailVerificationChallenge;
use chrono::{DateTime, Utc};
use rand::{Rng, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

const CODE_MIN: u32 = 100_000;
const CODE_MAX: u32 = 999_999;

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("challenge not found")]
    NotFound,
    #[error("challenge already completed")]
    AlreadyCompleted,
    #[error("challenge expired")]
    Expired,
    #[error("code does not match")]
    Mismatch,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A uniformly drawn six-digit code.
#[must_use]
pub fn generate_code() -> String {
    OsRng.gen_range(CODE_MIN..=CODE_MAX).to_string()
}

#[must_use]
pub fn hash_code(code: &str) -> Vec<u8> {
    Sha256::digest(code.as_bytes()).to_vec()
}

/// Decide whether `code` completes `challenge` at `now`.
///
/// Order matters: a completed challenge reports `AlreadyCompleted` even with a wrong
/// code, and an expired one reports `Expired` before the code is looked at.
///
/// # Errors
/// `AlreadyCompleted`, `Expired` or `Mismatch`.
pub fn evaluate(
    challenge: &EmailVerificationChallenge,
    code: &str,
    now: DateTime<Utc>,
) -> Result<(), ChallengeError> {
    if challenge.complete_time.is_some() {
        return Err(ChallengeError::AlreadyCompleted);
    }
    if now >= challenge.expire_time {
        return Err(ChallengeError::Expired);
    }
    let submitted = hash_code(code.trim());
    if !bool::from(submitted.as_slice().ct_eq(challenge.challenge_sha256.as_slice())) {
        return Err(ChallengeError::Mismatch);
    }
    Ok(())
}
