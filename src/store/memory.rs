//! In-memory backend for tests and local runs without a database.
//!
//! One `RwLock` guards all tables, so each trait method is trivially atomic. Uniqueness
//! mirrors the `UNIQUE` constraints of `sql/schema.sql`.

use super::{
    ApiKeyRecord, CredentialRepository, EmailVerificationChallenge, IntermediateSession,
    Organization, Ping, Project, RefreshContext, Session, SignInRepository,
    SigningKeyRecord, SigningKeyRepository, User,
};
use crate::{auth::credential::ApiKeyFamily, keys::TokenClass};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
struct VerifiedEmail {
    project_id: Uuid,
    email: String,
    google_user_id: Option<String>,
    microsoft_user_id: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    projects: HashMap<Uuid, Project>,
    organizations: HashMap<Uuid, Organization>,
    users: HashMap<Uuid, User>,
    verified_emails: Vec<VerifiedEmail>,
    sessions: HashMap<Uuid, Session>,
    intermediate_sessions: HashMap<Uuid, IntermediateSession>,
    email_challenges: HashMap<Uuid, EmailVerificationChallenge>,
    signing_keys: HashMap<Uuid, SigningKeyRecord>,
    api_keys: HashMap<Uuid, ApiKeyRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("Poisoned lock"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("Poisoned lock"))
    }

    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn insert_project(&self, project: Project) -> Result<()> {
        self.write()?.projects.insert(project.id, project);
        Ok(())
    }

    /// # Errors
    /// Returns an error if the project does not exist or the lock is poisoned.
    pub fn insert_organization(&self, organization: Organization) -> Result<()> {
        let mut tables = self.write()?;
        if !tables.projects.contains_key(&organization.project_id) {
            bail!("unknown project {}", organization.project_id);
        }
        tables.organizations.insert(organization.id, organization);
        Ok(())
    }

    /// # Errors
    /// Returns an error if the organization does not exist or the lock is poisoned.
    pub fn insert_user(&self, user: User) -> Result<()> {
        let mut tables = self.write()?;
        insert_user(&mut tables, &user)
    }

    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn insert_verified_email(&self, project_id: Uuid, email: &str) -> Result<()> {
        let mut tables = self.write()?;
        record_verified_email(
            &mut tables,
            VerifiedEmail {
                project_id,
                email: email.to_string(),
                google_user_id: None,
                microsoft_user_id: None,
            },
        );
        Ok(())
    }

    /// Mark an API key revoked.
    ///
    /// # Errors
    /// Returns an error if the key does not exist or the lock is poisoned.
    pub fn revoke_api_key(&self, id: Uuid) -> Result<()> {
        let mut tables = self.write()?;
        let key = tables
            .api_keys
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown api key {id}"))?;
        key.revoked = true;
        Ok(())
    }

    /// Mark a session revoked.
    ///
    /// # Errors
    /// Returns an error if the session does not exist or the lock is poisoned.
    pub fn revoke_session(&self, id: Uuid) -> Result<()> {
        let mut tables = self.write()?;
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        session.revoked = true;
        Ok(())
    }

    /// Replace an organization's display name, as an out-of-band admin edit would.
    ///
    /// # Errors
    /// Returns an error if the organization does not exist or the lock is poisoned.
    pub fn rename_organization(&self, id: Uuid, display_name: &str) -> Result<()> {
        let mut tables = self.write()?;
        let organization = tables
            .organizations
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown organization {id}"))?;
        organization.display_name = display_name.to_string();
        Ok(())
    }

    /// `Debug` rendering of every table, for inspecting what is actually at rest.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn dump(&self) -> Result<String> {
        Ok(format!("{:#?}", *self.read()?))
    }
}

fn insert_user(tables: &mut Tables, user: &User) -> Result<()> {
    if !tables.organizations.contains_key(&user.organization_id) {
        bail!("unknown organization {}", user.organization_id);
    }
    if tables
        .users
        .values()
        .any(|u| u.organization_id == user.organization_id && u.email == user.email)
    {
        bail!("duplicate user email in organization");
    }
    tables.users.insert(user.id, user.clone());
    Ok(())
}

fn record_verified_email(tables: &mut Tables, verified: VerifiedEmail) {
    if !tables.verified_emails.contains(&verified) {
        tables.verified_emails.push(verified);
    }
}

#[async_trait]
impl SigningKeyRepository for MemoryStore {
    async fn insert_signing_key(&self, key: &SigningKeyRecord) -> Result<()> {
        let mut tables = self.write()?;
        if tables.signing_keys.contains_key(&key.id) {
            bail!("duplicate signing key id");
        }
        tables.signing_keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn get_signing_key(&self, id: Uuid) -> Result<Option<SigningKeyRecord>> {
        Ok(self.read()?.signing_keys.get(&id).cloned())
    }

    async fn get_current_signing_key(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Option<SigningKeyRecord>> {
        Ok(self
            .list_verification_keys(project_id, class, now)
            .await?
            .into_iter()
            .next())
    }

    async fn list_verification_keys(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<SigningKeyRecord>> {
        let tables = self.read()?;
        let mut keys: Vec<SigningKeyRecord> = tables
            .signing_keys
            .values()
            .filter(|k| k.project_id == project_id && k.class == class && k.expire_time > now)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        Ok(keys)
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn find_api_key(
        &self,
        family: ApiKeyFamily,
        secret_sha256: &[u8],
    ) -> Result<Option<ApiKeyRecord>> {
        Ok(self
            .read()?
            .api_keys
            .values()
            .find(|k| k.family == family && !k.revoked && k.secret_sha256 == secret_sha256)
            .cloned())
    }

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> Result<()> {
        let mut tables = self.write()?;
        if tables
            .api_keys
            .values()
            .any(|k| k.id == key.id || k.secret_sha256 == key.secret_sha256)
        {
            bail!("duplicate api key");
        }
        tables.api_keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn create_session(&self, new_user: Option<&User>, session: &Session) -> Result<()> {
        let mut tables = self.write()?;
        if tables
            .sessions
            .values()
            .any(|s| s.id == session.id || s.refresh_token_sha256 == session.refresh_token_sha256)
        {
            bail!("duplicate session");
        }
        if let Some(user) = new_user {
            insert_user(&mut tables, user)?;
        }
        if !tables.users.contains_key(&session.user_id) {
            if let Some(user) = new_user {
                tables.users.remove(&user.id);
            }
            bail!("unknown user {}", session.user_id);
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn resolve_refresh_token(
        &self,
        refresh_token_sha256: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshContext>> {
        let tables = self.read()?;
        let Some(session) = tables.sessions.values().find(|s| {
            s.refresh_token_sha256 == refresh_token_sha256 && !s.revoked && s.expire_time > now
        }) else {
            return Ok(None);
        };
        let user = tables
            .users
            .get(&session.user_id)
            .ok_or_else(|| anyhow!("session without user"))?;
        let organization = tables
            .organizations
            .get(&user.organization_id)
            .ok_or_else(|| anyhow!("user without organization"))?;
        Ok(Some(RefreshContext {
            session: session.clone(),
            user: user.clone(),
            organization: organization.clone(),
        }))
    }
}

#[async_trait]
impl SignInRepository for MemoryStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.read()?.projects.get(&id).cloned())
    }

    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self.read()?.organizations.get(&id).cloned())
    }

    async fn is_email_verified(
        &self,
        project_id: Uuid,
        email: &str,
        google_user_id: Option<&str>,
        microsoft_user_id: Option<&str>,
    ) -> Result<bool> {
        Ok(self.read()?.verified_emails.iter().any(|v| {
            v.project_id == project_id
                && v.email == email
                && google_user_id.map_or(true, |id| v.google_user_id.as_deref() == Some(id))
                && microsoft_user_id
                    .map_or(true, |id| v.microsoft_user_id.as_deref() == Some(id))
        }))
    }

    async fn user_exists_for_email(&self, project_id: Uuid, email: &str) -> Result<bool> {
        let tables = self.read()?;
        Ok(tables.users.values().any(|u| {
            u.email == email
                && tables
                    .organizations
                    .get(&u.organization_id)
                    .is_some_and(|o| o.project_id == project_id)
        }))
    }

    async fn find_user_by_email(
        &self,
        organization_id: Uuid,
        email: &str,
    ) -> Result<Option<User>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.organization_id == organization_id && u.email == email)
            .cloned())
    }

    async fn insert_intermediate_session(&self, session: &IntermediateSession) -> Result<()> {
        let mut tables = self.write()?;
        if tables
            .intermediate_sessions
            .values()
            .any(|s| s.id == session.id || s.token_sha256 == session.token_sha256)
        {
            bail!("duplicate intermediate session");
        }
        tables
            .intermediate_sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_intermediate_session(&self, id: Uuid) -> Result<Option<IntermediateSession>> {
        Ok(self.read()?.intermediate_sessions.get(&id).cloned())
    }

    async fn insert_email_challenge(
        &self,
        challenge: &EmailVerificationChallenge,
    ) -> Result<()> {
        let mut tables = self.write()?;
        if !tables
            .intermediate_sessions
            .contains_key(&challenge.intermediate_session_id)
        {
            bail!("unknown intermediate session");
        }
        if tables.email_challenges.contains_key(&challenge.id) {
            bail!("duplicate email verification challenge");
        }
        tables
            .email_challenges
            .insert(challenge.id, challenge.clone());
        Ok(())
    }

    async fn get_email_challenge(&self, id: Uuid) -> Result<Option<EmailVerificationChallenge>> {
        Ok(self.read()?.email_challenges.get(&id).cloned())
    }

    async fn complete_email_challenge(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.write()?;

        let challenge = tables
            .email_challenges
            .get(&id)
            .ok_or_else(|| anyhow!("unknown email verification challenge"))?;
        if challenge.complete_time.is_some() {
            return Ok(false);
        }
        let session_id = challenge.intermediate_session_id;

        let session = tables
            .intermediate_sessions
            .get_mut(&session_id)
            .ok_or_else(|| anyhow!("challenge without intermediate session"))?;
        session.email_verified = true;
        let verified = VerifiedEmail {
            project_id: session.project_id,
            email: session.email.clone(),
            google_user_id: session.google_user_id.clone(),
            microsoft_user_id: session.microsoft_user_id.clone(),
        };

        if let Some(challenge) = tables.email_challenges.get_mut(&id) {
            challenge.complete_time = Some(now);
        }
        record_verified_email(&mut tables, verified);
        Ok(true)
    }
}

#[async_trait]
impl Ping for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }
}
