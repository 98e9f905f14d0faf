//! # Portcullis (credential core)
//!
//! `portcullis` issues, verifies and rotates the credentials of a multi-tenant
//! authentication platform: organizations live inside projects, users inside
//! organizations, and every inbound call carries either an opaque API key or a
//! short-lived signed session token.
//!
//! ## Pieces
//!
//! - [`token`]: a compact ES256 token format (JWT subset, raw `r || s` signatures).
//! - [`keys`]: per-project signing keys whose private halves are only ever stored
//!   wrapped by a [`kms::Kms`] (Vault transit in production).
//! - [`auth`]: the request-time dispatcher that classifies the bearer credential and
//!   produces an [`auth::AuthContext`] for handlers.
//! - [`signin`]: the progressive sign-in flow (email challenge, intermediate session).
//! - [`session`]: session issuance and access-token minting.
//! - [`store`]: repository traits with `PostgreSQL` and in-memory backends.
//!
//! ## Secrets at rest
//!
//! Refresh tokens, API keys, intermediate-session tokens and verification codes are
//! stored as SHA-256 digests only. Private keys are stored as KMS ciphertext and are
//! decrypted per call, never cached.
//!
//! The schema lives in `sql/schema.sql`.

pub mod api;
pub mod auth;
pub mod cli;
pub mod ids;
pub mod keys;
pub mod kms;
pub mod session;
pub mod signin;
pub mod store;
pub mod token;
pub mod vault;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
