use super::{
    SignInError, normalize_email, valid_email,
    challenge::{self, ChallengeError},
};
use crate::{
    api::email::{CodeSender, VerificationCode},
    ids::{self, IdKind},
    keys::{SigningKeyStore, TokenClass, VerificationKeySource},
    store::{EmailVerificationChallenge, IntermediateSession, SignInRepository},
    token,
};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignInState {
    /// A code was sent; complete the challenge to verify the email.
    EmailChallengeIssued,
    /// The email is verified and belongs to a user; a second factor has to be checked
    /// before a session can be issued.
    ExistingUserFactorCheck,
}

/// Claims of an intermediate-session bearer token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateClaims {
    /// Formatted intermediate session id.
    pub sub: String,
    pub aud: String,
    pub email: String,
    /// Formatted project id.
    pub project_id: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

#[derive(Debug)]
pub struct StartOutcome {
    pub state: SignInState,
    pub intermediate_session_id: Uuid,
    pub intermediate_session_token: SecretString,
    pub challenge_id: Option<Uuid>,
    pub expire_time: DateTime<Utc>,
}

pub struct SignInFlow {
    repo: Arc<dyn SignInRepository>,
    keys: Arc<SigningKeyStore>,
    codes: Arc<dyn CodeSender>,
    ttl: Duration,
}

impl SignInFlow {
    #[must_use]
    pub fn new(
        repo: Arc<dyn SignInRepository>,
        keys: Arc<SigningKeyStore>,
        codes: Arc<dyn CodeSender>,
        ttl: Duration,
    ) -> Self {
        Self {
            repo,
            keys,
            codes,
            ttl,
        }
    }

    /// Begin signing in `email` to a project.
    ///
    /// # Errors
    /// `BadRequest` for a malformed email, `NotFound` for an unknown project,
    /// `Forbidden` when the project disables email login, `Internal` otherwise.
    #[instrument(skip(self, email))]
    pub async fn start(
        &self,
        project_id: Uuid,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, SignInError> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(SignInError::BadRequest("invalid email"));
        }

        let project = self
            .repo
            .get_project(project_id)
            .await?
            .ok_or(SignInError::NotFound)?;
        if !project.log_in_with_email {
            return Err(SignInError::Forbidden);
        }

        let verified = self
            .repo
            .is_email_verified(project_id, &email, None, None)
            .await?;
        let existing_user = verified && self.repo.user_exists_for_email(project_id, &email).await?;

        let expire_time = now + self.ttl;
        let session_id = Uuid::new_v4();
        let token = self
            .sign_intermediate(project_id, session_id, &email, now, expire_time)
            .await?;

        let session = IntermediateSession {
            id: session_id,
            project_id,
            email: email.clone(),
            token_sha256: Sha256::digest(token.as_bytes()).to_vec(),
            email_verified: false,
            google_user_id: None,
            microsoft_user_id: None,
            create_time: now,
            expire_time,
        };
        self.repo.insert_intermediate_session(&session).await?;

        if existing_user {
            debug!("Email verified for an existing user");
            return Ok(StartOutcome {
                state: SignInState::ExistingUserFactorCheck,
                intermediate_session_id: session_id,
                intermediate_session_token: SecretString::from(token),
                challenge_id: None,
                expire_time,
            });
        }

        let code = challenge::generate_code();
        let challenge = EmailVerificationChallenge {
            id: Uuid::new_v4(),
            intermediate_session_id: session_id,
            challenge_sha256: challenge::hash_code(&code),
            create_time: now,
            expire_time,
            complete_time: None,
        };
        self.repo.insert_email_challenge(&challenge).await?;

        self.codes
            .send(&VerificationCode {
                to_email: email,
                challenge_id: ids::format(IdKind::EmailVerificationChallenge, challenge.id),
                code,
            })
            .context("failed to send verification code")?;

        info!(
            intermediate_session_id = %ids::format(IdKind::IntermediateSession, session_id),
            "Issued email verification challenge"
        );

        Ok(StartOutcome {
            state: SignInState::EmailChallengeIssued,
            intermediate_session_id: session_id,
            intermediate_session_token: SecretString::from(token),
            challenge_id: Some(challenge.id),
            expire_time,
        })
    }

    async fn sign_intermediate(
        &self,
        project_id: Uuid,
        session_id: Uuid,
        email: &str,
        now: DateTime<Utc>,
        expire_time: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let signer = self
            .keys
            .signer_for(project_id, TokenClass::IntermediateSession, now)
            .await?;
        let claims = IntermediateClaims {
            sub: ids::format(IdKind::IntermediateSession, session_id),
            aud: TokenClass::IntermediateSession.audience(project_id),
            email: email.to_string(),
            project_id: ids::format(IdKind::Project, project_id),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expire_time.timestamp(),
        };
        signer
            .sign(&claims)
            .context("failed to sign intermediate session token")
    }

    /// Resolve an intermediate-session bearer token to its live row.
    ///
    /// # Errors
    /// `Unauthenticated` for anything but a valid, unexpired intermediate token whose row
    /// still matches it; `Internal` when a backend fails.
    #[instrument(skip(self, token))]
    pub async fn authenticate_intermediate(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<IntermediateSession, SignInError> {
        let kid = token::key_id(token).map_err(|_| SignInError::Unauthenticated)?;
        if ids::parse_as(IdKind::IntermediateSessionSigningKey, &kid).is_err() {
            return Err(SignInError::Unauthenticated);
        }
        let key = self
            .keys
            .verification_key(&kid, now)
            .await?
            .ok_or(SignInError::Unauthenticated)?;

        let audience = TokenClass::IntermediateSession.audience(key.project_id);
        let claims: IntermediateClaims = token::verify(&key.key, &audience, now.timestamp(), token)
            .map_err(|_| SignInError::Unauthenticated)?;
        let session_id = ids::parse_as(IdKind::IntermediateSession, &claims.sub)
            .map_err(|_| SignInError::Unauthenticated)?;

        let session = self
            .repo
            .get_intermediate_session(session_id)
            .await?
            .ok_or(SignInError::Unauthenticated)?;
        let digest = Sha256::digest(token.as_bytes());
        if !bool::from(digest.as_slice().ct_eq(session.token_sha256.as_slice()))
            || session.project_id != key.project_id
            || session.expire_time <= now
        {
            return Err(SignInError::Unauthenticated);
        }
        Ok(session)
    }

    /// Complete an email challenge owned by `session`.
    ///
    /// # Errors
    /// `Challenge(NotFound)` if the challenge does not exist or belongs to another
    /// intermediate session, `AlreadyCompleted`, `Expired` or `Mismatch` per the
    /// challenge, `Internal` when a backend fails.
    #[instrument(skip(self, session, code), fields(intermediate_session_id = %session.id))]
    pub async fn complete_email_challenge(
        &self,
        session: &IntermediateSession,
        challenge_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignInError> {
        let challenge = self
            .repo
            .get_email_challenge(challenge_id)
            .await?
            .filter(|c| c.intermediate_session_id == session.id)
            .ok_or(ChallengeError::NotFound)?;

        challenge::evaluate(&challenge, code, now)?;

        if !self.repo.complete_email_challenge(challenge.id, now).await? {
            return Err(ChallengeError::AlreadyCompleted.into());
        }
        info!("Email verification challenge completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keys::KeyPolicy,
        kms::LocalKms,
        store::{MemoryStore, Project},
    };
    use anyhow::{Result, anyhow};
    use chrono::TimeZone;
    use secrecy::ExposeSecret;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<VerificationCode>>);

    impl CodeSender for Outbox {
        fn send(&self, message: &VerificationCode) -> anyhow::Result<()> {
            self.0
                .lock()
                .map_err(|_| anyhow!("Poisoned lock"))?
                .push(message.clone());
            Ok(())
        }
    }

    impl Outbox {
        fn last_code(&self) -> Option<String> {
            self.0.lock().ok()?.last().map(|m| m.code.clone())
        }
    }

    struct Fixture {
        flow: SignInFlow,
        store: Arc<MemoryStore>,
        outbox: Arc<Outbox>,
        project: Project,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    async fn fixture(log_in_with_email: bool) -> Result<Fixture> {
        let store = Arc::new(MemoryStore::new());
        let project = Project {
            id: Uuid::new_v4(),
            display_name: "Acme".to_string(),
            log_in_with_email,
            log_in_with_google: false,
            log_in_with_microsoft: false,
            google_oauth_client_id: None,
            microsoft_oauth_client_id: None,
            create_time: t0(),
        };
        store.insert_project(project.clone())?;

        let keys = Arc::new(SigningKeyStore::new(
            store.clone(),
            Arc::new(LocalKms::new(&[3; 32])),
            "signing",
            KeyPolicy::default(),
        ));
        keys.create_signing_key(project.id, TokenClass::IntermediateSession, t0())
            .await?;

        let outbox = Arc::new(Outbox::default());
        let flow = SignInFlow::new(store.clone(), keys, outbox.clone(), Duration::minutes(15));
        Ok(Fixture {
            flow,
            store,
            outbox,
            project,
        })
    }

    #[tokio::test]
    async fn start_rejects_bad_input() -> Result<()> {
        let f = fixture(true).await?;
        assert!(matches!(
            f.flow.start(f.project.id, "nope", t0()).await,
            Err(SignInError::BadRequest(_))
        ));
        assert!(matches!(
            f.flow.start(Uuid::new_v4(), "alice@example.com", t0()).await,
            Err(SignInError::NotFound)
        ));

        let disabled = fixture(false).await?;
        assert!(matches!(
            disabled
                .flow
                .start(disabled.project.id, "alice@example.com", t0())
                .await,
            Err(SignInError::Forbidden)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn intermediate_token_authenticates_its_session() -> Result<()> {
        let f = fixture(true).await?;
        let outcome = f.flow.start(f.project.id, "Alice@Example.com", t0()).await?;
        assert_eq!(outcome.state, SignInState::EmailChallengeIssued);
        assert_eq!(outcome.expire_time - t0(), Duration::minutes(15));

        let token = outcome.intermediate_session_token.expose_secret();
        let session = f.flow.authenticate_intermediate(token, t0()).await?;
        assert_eq!(session.id, outcome.intermediate_session_id);
        assert_eq!(session.email, "alice@example.com");
        assert!(!session.email_verified);

        assert!(matches!(
            f.flow
                .authenticate_intermediate(token, outcome.expire_time)
                .await,
            Err(SignInError::Unauthenticated)
        ));
        assert!(matches!(
            f.flow.authenticate_intermediate("a.b.c", t0()).await,
            Err(SignInError::Unauthenticated)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn challenge_belongs_to_its_session() -> Result<()> {
        let f = fixture(true).await?;
        let first = f.flow.start(f.project.id, "alice@example.com", t0()).await?;
        let first_code = f.outbox.last_code().ok_or_else(|| anyhow!("no code"))?;
        let second = f.flow.start(f.project.id, "bob@example.com", t0()).await?;

        let bob = f
            .flow
            .authenticate_intermediate(second.intermediate_session_token.expose_secret(), t0())
            .await?;
        let alice_challenge = first.challenge_id.ok_or_else(|| anyhow!("no challenge"))?;
        assert!(matches!(
            f.flow
                .complete_email_challenge(&bob, alice_challenge, &first_code, t0())
                .await,
            Err(SignInError::Challenge(ChallengeError::NotFound))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn verified_existing_user_skips_the_challenge() -> Result<()> {
        let f = fixture(true).await?;
        let org = crate::store::Organization {
            id: Uuid::new_v4(),
            project_id: f.project.id,
            display_name: "Acme".to_string(),
            log_in_with_email: true,
            log_in_with_google: false,
            log_in_with_microsoft: false,
            log_in_with_password: false,
            create_time: t0(),
        };
        f.store.insert_organization(org.clone())?;
        f.store.insert_user(crate::store::User {
            id: Uuid::new_v4(),
            organization_id: org.id,
            email: "carol@example.com".to_string(),
            password_hash: None,
            google_user_id: None,
            microsoft_user_id: None,
            is_owner: false,
            create_time: t0(),
            update_time: t0(),
        })?;
        f.store
            .insert_verified_email(f.project.id, "carol@example.com")?;

        let outcome = f.flow.start(f.project.id, "carol@example.com", t0()).await?;
        assert_eq!(outcome.state, SignInState::ExistingUserFactorCheck);
        assert!(outcome.challenge_id.is_none());
        assert!(f.outbox.last_code().is_none());
        Ok(())
    }
}
