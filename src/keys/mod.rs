//! Per-project signing keys.
//!
//! Each project holds two independent key sets, one per [`TokenClass`]. New tokens are
//! signed with the newest unexpired key of the class; every unexpired key of the class
//! verifies. A key expires an hour after the rotation interval, so tokens signed just
//! before a rotation outlive it.

pub mod cache;
pub mod store;

pub use cache::VerificationKeyCache;
pub use store::{Signer, SigningKeyStore};

use crate::ids::{self, IdKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use p256::ecdsa::VerifyingKey;
use uuid::Uuid;

/// Which kind of token a key signs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenClass {
    Session,
    IntermediateSession,
}

impl TokenClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::IntermediateSession => "intermediate_session",
        }
    }

    #[must_use]
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "session" => Some(Self::Session),
            "intermediate_session" => Some(Self::IntermediateSession),
            _ => None,
        }
    }

    /// The id kind of this class's keys, and so the prefix of their `kid`.
    #[must_use]
    pub const fn key_kind(self) -> IdKind {
        match self {
            Self::Session => IdKind::SessionSigningKey,
            Self::IntermediateSession => IdKind::IntermediateSessionSigningKey,
        }
    }

    #[must_use]
    pub const fn from_key_kind(kind: IdKind) -> Option<Self> {
        match kind {
            IdKind::SessionSigningKey => Some(Self::Session),
            IdKind::IntermediateSessionSigningKey => Some(Self::IntermediateSession),
            _ => None,
        }
    }

    /// The `aud` claim tokens of this class carry for `project_id`.
    #[must_use]
    pub fn audience(self, project_id: Uuid) -> String {
        let project = ids::format(IdKind::Project, project_id);
        match self {
            Self::Session => project,
            Self::IntermediateSession => format!("{project}/intermediate"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyPolicy {
    /// Age after which a new key should become current.
    pub rotate_after: Duration,
    /// Age at which a key stops verifying.
    pub lifetime: Duration,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            rotate_after: Duration::hours(6),
            lifetime: Duration::hours(7),
        }
    }
}

/// The public half of a signing key together with what it may verify.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationKey {
    pub kid: String,
    pub project_id: Uuid,
    pub class: TokenClass,
    pub key: VerifyingKey,
    pub expire_time: DateTime<Utc>,
}

impl VerificationKey {
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_time
    }
}

/// Lookup of a verification key by `kid`.
///
/// Implementations return `Ok(None)` for unknown, malformed or expired ids and reserve
/// `Err` for backend failures.
#[async_trait]
pub trait VerificationKeySource: Send + Sync {
    async fn verification_key(&self, kid: &str, now: DateTime<Utc>)
    -> Result<Option<VerificationKey>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audiences_differ_per_class() {
        let project = Uuid::from_u128(42);
        let session = TokenClass::Session.audience(project);
        let intermediate = TokenClass::IntermediateSession.audience(project);
        assert!(session.starts_with("project_"));
        assert_eq!(intermediate, format!("{session}/intermediate"));
    }

    #[test]
    fn class_round_trips_through_storage_and_kid() {
        for class in [TokenClass::Session, TokenClass::IntermediateSession] {
            assert_eq!(TokenClass::from_db(class.as_str()), Some(class));
            assert_eq!(TokenClass::from_key_kind(class.key_kind()), Some(class));
        }
        assert_eq!(TokenClass::from_db("rsa"), None);
        assert_eq!(TokenClass::from_key_kind(IdKind::User), None);
    }

    #[test]
    fn keys_outlive_rotation() {
        let policy = KeyPolicy::default();
        assert!(policy.lifetime > policy.rotate_after);
    }
}
