//! Sessions and their short-lived access tokens.

pub mod access_token;
pub mod issuer;

pub use access_token::{AccessTokenClaims, AccessTokenMinter};
pub use issuer::{IssuedSession, SessionIssuer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
