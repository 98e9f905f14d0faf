//! Persistence seams.
//!
//! Components depend on the narrow repository traits below, never on a backend. Every
//! method is one logical operation: backends open a transaction where more than one
//! statement is involved and roll it back on every early return.

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

use crate::{auth::credential::ApiKeyFamily, keys::TokenClass};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait SigningKeyRepository: Send + Sync {
    async fn insert_signing_key(&self, key: &SigningKeyRecord) -> Result<()>;

    async fn get_signing_key(&self, id: Uuid) -> Result<Option<SigningKeyRecord>>;

    /// The most recently created key of `class` for the project that has not expired.
    async fn get_current_signing_key(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Option<SigningKeyRecord>>;

    /// All keys of `class` for the project that have not expired, newest first.
    async fn list_verification_keys(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<SigningKeyRecord>>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Look up a non-revoked API key by the digest of its secret.
    async fn find_api_key(
        &self,
        family: ApiKeyFamily,
        secret_sha256: &[u8],
    ) -> Result<Option<ApiKeyRecord>>;

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> Result<()>;

    /// Persist a session, creating its user first when `new_user` is given.
    async fn create_session(&self, new_user: Option<&User>, session: &Session) -> Result<()>;

    /// Resolve a live, non-revoked session by refresh-token digest together with its
    /// user and organization.
    async fn resolve_refresh_token(
        &self,
        refresh_token_sha256: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshContext>>;
}

#[async_trait]
pub trait SignInRepository: Send + Sync {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>>;

    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>>;

    /// Whether `email` was verified for the project; external IdP ids narrow the match
    /// when given.
    async fn is_email_verified(
        &self,
        project_id: Uuid,
        email: &str,
        google_user_id: Option<&str>,
        microsoft_user_id: Option<&str>,
    ) -> Result<bool>;

    /// Whether any organization of the project has a user with this email.
    async fn user_exists_for_email(&self, project_id: Uuid, email: &str) -> Result<bool>;

    async fn find_user_by_email(&self, organization_id: Uuid, email: &str)
    -> Result<Option<User>>;

    async fn insert_intermediate_session(&self, session: &IntermediateSession) -> Result<()>;

    async fn get_intermediate_session(&self, id: Uuid) -> Result<Option<IntermediateSession>>;

    async fn insert_email_challenge(&self, challenge: &EmailVerificationChallenge)
    -> Result<()>;

    async fn get_email_challenge(&self, id: Uuid) -> Result<Option<EmailVerificationChallenge>>;

    /// Set `complete_time` if it is still unset, mark the owning intermediate session's
    /// email verified and record the email as verified for the project, atomically.
    /// Returns `false` when the challenge was already completed.
    async fn complete_email_challenge(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;
}

/// Liveness of the backing store, for the health endpoint.
#[async_trait]
pub trait Ping: Send + Sync {
    async fn ping(&self) -> Result<()>;
}
