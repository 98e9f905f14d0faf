//! Access-token minting.
//!
//! Every mint reads the session, user and organization afresh, so a change to any of
//! them shows up in the next token, at most one token lifetime later.

use super::SessionError;
use crate::{
    auth::credential::{REFRESH_TOKEN_PREFIX, hash_prefixed_secret},
    ids::{self, IdKind},
    keys::{SigningKeyStore, TokenClass},
    store::{CredentialRepository, Organization, Session, User},
};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    /// Formatted user id.
    pub sub: String,
    /// Formatted project id.
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub session: Session,
    pub user: User,
    pub organization: Organization,
}

pub struct AccessTokenMinter {
    repo: Arc<dyn CredentialRepository>,
    keys: Arc<SigningKeyStore>,
    issuer: String,
    ttl: Duration,
}

impl AccessTokenMinter {
    #[must_use]
    pub fn new(
        repo: Arc<dyn CredentialRepository>,
        keys: Arc<SigningKeyStore>,
        issuer: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            repo,
            keys,
            issuer: issuer.into(),
            ttl,
        }
    }

    /// Mint an access token for the session owning `refresh_token`.
    ///
    /// # Errors
    /// `Unauthenticated` if the refresh token is malformed, unknown, revoked or expired;
    /// `Internal` if the store, the KMS or signing fails.
    #[instrument(skip(self, refresh_token))]
    pub async fn mint(&self, refresh_token: &str, now: DateTime<Utc>) -> Result<String, SessionError> {
        let digest = hash_prefixed_secret(REFRESH_TOKEN_PREFIX, refresh_token)
            .ok_or(SessionError::Unauthenticated)?;
        let Some(context) = self.repo.resolve_refresh_token(&digest, now).await? else {
            debug!("Refresh token did not resolve to a live session");
            return Err(SessionError::Unauthenticated);
        };

        let project_id = context.organization.project_id;
        let signer = self
            .keys
            .signer_for(project_id, TokenClass::Session, now)
            .await?;

        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: ids::format(IdKind::User, context.user.id),
            aud: TokenClass::Session.audience(project_id),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            session: context.session,
            user: context.user,
            organization: context.organization,
        };
        let token = signer
            .sign(&claims)
            .context("failed to sign access token")?;
        Ok(token)
    }
}
