use super::{AccessTokenMinter, SessionError};
use crate::{
    auth::credential::{REFRESH_TOKEN_PREFIX, generate_secret},
    ids::{self, IdKind},
    store::{CredentialRepository, IntermediateSession, Session, SignInRepository, User},
};
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug)]
pub struct IssuedSession {
    pub session_id: Uuid,
    pub refresh_token: SecretString,
    pub access_token: String,
}

/// Promotes a verified intermediate session to a full session.
pub struct SessionIssuer {
    signin: Arc<dyn SignInRepository>,
    credentials: Arc<dyn CredentialRepository>,
    minter: Arc<AccessTokenMinter>,
    ttl: Duration,
}

impl SessionIssuer {
    #[must_use]
    pub fn new(
        signin: Arc<dyn SignInRepository>,
        credentials: Arc<dyn CredentialRepository>,
        minter: Arc<AccessTokenMinter>,
        ttl: Duration,
    ) -> Self {
        Self {
            signin,
            credentials,
            minter,
            ttl,
        }
    }

    /// Issue a session in `organization_id` for the email of `intermediate`.
    ///
    /// The user is created on first sign-in to the organization.
    ///
    /// # Errors
    /// `Forbidden` if the email was not verified in this intermediate session or email
    /// login is disabled for the project or organization, `NotFound` if the
    /// organization is not in the intermediate session's project, `Internal` otherwise.
    #[instrument(skip(self, intermediate), fields(intermediate_session_id = %intermediate.id))]
    pub async fn exchange(
        &self,
        intermediate: &IntermediateSession,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession, SessionError> {
        if !intermediate.email_verified {
            return Err(SessionError::Forbidden("email not verified"));
        }

        let organization = self
            .signin
            .get_organization(organization_id)
            .await?
            .filter(|org| org.project_id == intermediate.project_id)
            .ok_or(SessionError::NotFound)?;
        let project = self
            .signin
            .get_project(intermediate.project_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        if !project.log_in_with_email || !organization.log_in_with_email {
            return Err(SessionError::Forbidden("email login disabled"));
        }

        let existing = self
            .signin
            .find_user_by_email(organization.id, &intermediate.email)
            .await?;
        let new_user = match existing {
            Some(_) => None,
            None => Some(User {
                id: Uuid::new_v4(),
                organization_id: organization.id,
                email: intermediate.email.clone(),
                password_hash: None,
                google_user_id: intermediate.google_user_id.clone(),
                microsoft_user_id: intermediate.microsoft_user_id.clone(),
                is_owner: false,
                create_time: now,
                update_time: now,
            }),
        };
        let user_id = existing
            .as_ref()
            .or(new_user.as_ref())
            .map(|user| user.id)
            .ok_or(SessionError::NotFound)?;

        let (refresh_token, digest) = generate_secret(REFRESH_TOKEN_PREFIX)?;
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            refresh_token_sha256: digest,
            revoked: false,
            create_time: now,
            expire_time: now + self.ttl,
        };
        self.credentials
            .create_session(new_user.as_ref(), &session)
            .await?;

        info!(
            session_id = %ids::format(IdKind::Session, session.id),
            new_user = new_user.is_some(),
            "Issued session"
        );

        let refresh_token = SecretString::from(refresh_token);
        let access_token = self
            .minter
            .mint(refresh_token.expose_secret(), now)
            .await?;

        Ok(IssuedSession {
            session_id: session.id,
            refresh_token,
            access_token,
        })
    }
}
