//! The request-time credential gate.
//!
//! Stages run in order: host allow-list, skip list, bearer extraction, classification,
//! then exactly one of API-key lookup or session-token verification. The gate performs
//! no writes.

use super::{
    context::AuthContext,
    credential::{ApiKeyFamily, Credential, hash_prefixed_secret},
};
use crate::{
    ids::{self, IdKind},
    keys::{TokenClass, VerificationKeySource},
    session::AccessTokenClaims,
    store::CredentialRepository,
    token,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

const BEARER: &str = "Bearer ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnauthenticatedCause {
    MissingCredential,
    BadApiKey,
    BadSessionToken,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not found")]
    NotFound,
    #[error("unauthenticated")]
    Unauthenticated(UnauthenticatedCause),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone, Debug, Default)]
pub struct AuthenticatorConfig {
    /// Accepted `Host` values; empty accepts any host.
    pub allowed_hosts: Vec<String>,
    /// Matched routes that proceed without a credential.
    pub skip_routes: Vec<String>,
}

pub struct Authenticator {
    api_keys: Arc<dyn CredentialRepository>,
    keys: Arc<dyn VerificationKeySource>,
    config: AuthenticatorConfig,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        api_keys: Arc<dyn CredentialRepository>,
        keys: Arc<dyn VerificationKeySource>,
        config: AuthenticatorConfig,
    ) -> Self {
        Self {
            api_keys,
            keys,
            config,
        }
    }

    /// Authenticate one request.
    ///
    /// Returns `Ok(None)` for skipped routes.
    ///
    /// # Errors
    /// `NotFound` for a host outside the allow-list, `Unauthenticated` for any credential
    /// problem, `Internal` when a backend fails.
    #[instrument(skip(self, authorization))]
    pub async fn authenticate(
        &self,
        host: Option<&str>,
        route: &str,
        authorization: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthContext>, AuthError> {
        if !self.config.allowed_hosts.is_empty() {
            let allowed = host.is_some_and(|host| {
                self.config
                    .allowed_hosts
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(host))
            });
            if !allowed {
                debug!("Host not in allow-list");
                return Err(AuthError::NotFound);
            }
        }

        if self.config.skip_routes.iter().any(|skip| skip == route) {
            return Ok(None);
        }

        let bearer = bearer(authorization)
            .ok_or(AuthError::Unauthenticated(UnauthenticatedCause::MissingCredential))?;

        let context = match Credential::classify(bearer) {
            Credential::ApiKey { family, secret } => self.api_key(family, secret).await?,
            Credential::SessionToken(token) => self.session_token(token, now).await?,
        };
        Ok(Some(context))
    }

    async fn api_key(&self, family: ApiKeyFamily, secret: &str) -> Result<AuthContext, AuthError> {
        let bad = AuthError::Unauthenticated(UnauthenticatedCause::BadApiKey);
        let Some(digest) = hash_prefixed_secret(family.prefix(), secret) else {
            return Err(bad);
        };
        let Some(key) = self.api_keys.find_api_key(family, &digest).await? else {
            debug!(family = family.as_str(), "Unknown API key");
            return Err(bad);
        };

        Ok(AuthContext::ApiKey {
            api_key_id: ids::format(family.id_kind(), key.id),
            project_id: ids::format(IdKind::Project, key.project_id),
            organization_id: key
                .organization_id
                .map(|id| ids::format(IdKind::Organization, id)),
            family,
        })
    }

    async fn session_token(&self, token: &str, now: DateTime<Utc>) -> Result<AuthContext, AuthError> {
        let bad = || AuthError::Unauthenticated(UnauthenticatedCause::BadSessionToken);

        let kid = token::key_id(token).map_err(|_| bad())?;
        // Intermediate-session keys never authenticate a full session.
        if ids::parse_as(IdKind::SessionSigningKey, &kid).is_err() {
            return Err(bad());
        }
        let Some(key) = self.keys.verification_key(&kid, now).await? else {
            debug!(kid, "No live verification key");
            return Err(bad());
        };
        if key.class != TokenClass::Session {
            return Err(bad());
        }

        let audience = TokenClass::Session.audience(key.project_id);
        let claims: AccessTokenClaims =
            token::verify(&key.key, &audience, now.timestamp(), token).map_err(|_| bad())?;
        if claims.organization.project_id != key.project_id
            || claims.user.organization_id != claims.organization.id
            || claims.session.user_id != claims.user.id
        {
            return Err(bad());
        }

        Ok(AuthContext::Session {
            session_id: ids::format(IdKind::Session, claims.session.id),
            user_id: ids::format(IdKind::User, claims.user.id),
            organization_id: ids::format(IdKind::Organization, claims.organization.id),
            project_id: ids::format(IdKind::Project, key.project_id),
        })
    }
}

/// The value of an `Authorization: Bearer <value>` header.
pub(crate) fn bearer(authorization: Option<&str>) -> Option<&str> {
    authorization?
        .strip_prefix(BEARER)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
