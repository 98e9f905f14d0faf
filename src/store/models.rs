//! Persisted entities.
//!
//! Digest and ciphertext columns are `#[serde(skip)]`: these structs are embedded in
//! access-token claims and API responses, and a secret digest has no business in either.

use crate::{auth::credential::ApiKeyFamily, keys::TokenClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub display_name: String,
    pub log_in_with_email: bool,
    pub log_in_with_google: bool,
    pub log_in_with_microsoft: bool,
    pub google_oauth_client_id: Option<String>,
    pub microsoft_oauth_client_id: Option<String>,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub project_id: Uuid,
    pub display_name: String,
    pub log_in_with_email: bool,
    pub log_in_with_google: bool,
    pub log_in_with_microsoft: bool,
    pub log_in_with_password: bool,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub google_user_id: Option<String>,
    pub microsoft_user_id: Option<String>,
    pub is_owner: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip)]
    pub refresh_token_sha256: Vec<u8>,
    pub revoked: bool,
    pub create_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
}

/// A sign-in attempt that has not produced a session yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateSession {
    pub id: Uuid,
    pub project_id: Uuid,
    pub email: String,
    pub token_sha256: Vec<u8>,
    pub email_verified: bool,
    pub google_user_id: Option<String>,
    pub microsoft_user_id: Option<String>,
    pub create_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailVerificationChallenge {
    pub id: Uuid,
    pub intermediate_session_id: Uuid,
    pub challenge_sha256: Vec<u8>,
    pub create_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
}

/// A signing key as stored: SPKI DER public key, KMS-wrapped PKCS#8 DER private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeyRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub class: TokenClass,
    pub public_key: Vec<u8>,
    pub private_key_ciphertext: Vec<u8>,
    pub kms_key_id: String,
    pub create_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub family: ApiKeyFamily,
    pub secret_sha256: Vec<u8>,
    pub revoked: bool,
    pub create_time: DateTime<Utc>,
}

/// Everything an access token is minted from, read together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshContext {
    pub session: Session,
    pub user: User,
    pub organization: Organization,
}
