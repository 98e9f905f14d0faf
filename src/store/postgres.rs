//! Postgres backend. Table layout lives in `sql/schema.sql`.

use super::{
    ApiKeyRecord, CredentialRepository, EmailVerificationChallenge, IntermediateSession,
    Organization, Ping, Project, RefreshContext, Session, SignInRepository,
    SigningKeyRecord, SigningKeyRepository, User,
};
use crate::{auth::credential::ApiKeyFamily, keys::TokenClass};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn span(operation: &'static str, statement: &'static str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn signing_key_from_row(row: &PgRow) -> Result<SigningKeyRecord> {
    let class: String = row.try_get("class")?;
    Ok(SigningKeyRecord {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        class: TokenClass::from_db(&class)
            .ok_or_else(|| anyhow!("unknown signing key class {class}"))?,
        public_key: row.try_get("public_key")?,
        private_key_ciphertext: row.try_get("private_key_ciphertext")?,
        kms_key_id: row.try_get("kms_key_id")?,
        create_time: row.try_get("create_time")?,
        expire_time: row.try_get("expire_time")?,
    })
}

fn api_key_from_row(row: &PgRow) -> Result<ApiKeyRecord> {
    let family: String = row.try_get("family")?;
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        organization_id: row.try_get("organization_id")?,
        family: ApiKeyFamily::from_db(&family)
            .ok_or_else(|| anyhow!("unknown api key family {family}"))?,
        secret_sha256: row.try_get("secret_sha256")?,
        revoked: row.try_get("revoked")?,
        create_time: row.try_get("create_time")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        log_in_with_email: row.try_get("log_in_with_email")?,
        log_in_with_google: row.try_get("log_in_with_google")?,
        log_in_with_microsoft: row.try_get("log_in_with_microsoft")?,
        google_oauth_client_id: row.try_get("google_oauth_client_id")?,
        microsoft_oauth_client_id: row.try_get("microsoft_oauth_client_id")?,
        create_time: row.try_get("create_time")?,
    })
}

fn organization_from_row(row: &PgRow, prefix: &str) -> Result<Organization> {
    let col = |name: &str| format!("{prefix}{name}");
    Ok(Organization {
        id: row.try_get(col("id").as_str())?,
        project_id: row.try_get(col("project_id").as_str())?,
        display_name: row.try_get(col("display_name").as_str())?,
        log_in_with_email: row.try_get(col("log_in_with_email").as_str())?,
        log_in_with_google: row.try_get(col("log_in_with_google").as_str())?,
        log_in_with_microsoft: row.try_get(col("log_in_with_microsoft").as_str())?,
        log_in_with_password: row.try_get(col("log_in_with_password").as_str())?,
        create_time: row.try_get(col("create_time").as_str())?,
    })
}

fn user_from_row(row: &PgRow, prefix: &str) -> Result<User> {
    let col = |name: &str| format!("{prefix}{name}");
    Ok(User {
        id: row.try_get(col("id").as_str())?,
        organization_id: row.try_get(col("organization_id").as_str())?,
        email: row.try_get(col("email").as_str())?,
        password_hash: row.try_get(col("password_hash").as_str())?,
        google_user_id: row.try_get(col("google_user_id").as_str())?,
        microsoft_user_id: row.try_get(col("microsoft_user_id").as_str())?,
        is_owner: row.try_get(col("is_owner").as_str())?,
        create_time: row.try_get(col("create_time").as_str())?,
        update_time: row.try_get(col("update_time").as_str())?,
    })
}

fn intermediate_session_from_row(row: &PgRow) -> Result<IntermediateSession> {
    Ok(IntermediateSession {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        email: row.try_get("email")?,
        token_sha256: row.try_get("token_sha256")?,
        email_verified: row.try_get("email_verified")?,
        google_user_id: row.try_get("google_user_id")?,
        microsoft_user_id: row.try_get("microsoft_user_id")?,
        create_time: row.try_get("create_time")?,
        expire_time: row.try_get("expire_time")?,
    })
}

fn challenge_from_row(row: &PgRow) -> Result<EmailVerificationChallenge> {
    Ok(EmailVerificationChallenge {
        id: row.try_get("id")?,
        intermediate_session_id: row.try_get("intermediate_session_id")?,
        challenge_sha256: row.try_get("challenge_sha256")?,
        create_time: row.try_get("create_time")?,
        expire_time: row.try_get("expire_time")?,
        complete_time: row.try_get("complete_time")?,
    })
}

#[async_trait]
impl SigningKeyRepository for PgStore {
    async fn insert_signing_key(&self, key: &SigningKeyRecord) -> Result<()> {
        let query = r"
            INSERT INTO signing_keys
                (id, project_id, class, public_key, private_key_ciphertext, kms_key_id, create_time, expire_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        sqlx::query(query)
            .bind(key.id)
            .bind(key.project_id)
            .bind(key.class.as_str())
            .bind(&key.public_key)
            .bind(&key.private_key_ciphertext)
            .bind(&key.kms_key_id)
            .bind(key.create_time)
            .bind(key.expire_time)
            .execute(&self.pool)
            .instrument(span("INSERT", query))
            .await
            .context("failed to insert signing key")?;
        Ok(())
    }

    async fn get_signing_key(&self, id: Uuid) -> Result<Option<SigningKeyRecord>> {
        let query = "SELECT id, project_id, class, public_key, private_key_ciphertext, kms_key_id, create_time, expire_time FROM signing_keys WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to get signing key")?;
        row.as_ref().map(signing_key_from_row).transpose()
    }

    async fn get_current_signing_key(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Option<SigningKeyRecord>> {
        let query = r"
            SELECT id, project_id, class, public_key, private_key_ciphertext, kms_key_id, create_time, expire_time
            FROM signing_keys
            WHERE project_id = $1 AND class = $2 AND expire_time > $3
            ORDER BY create_time DESC
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(project_id)
            .bind(class.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to get current signing key")?;
        row.as_ref().map(signing_key_from_row).transpose()
    }

    async fn list_verification_keys(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<SigningKeyRecord>> {
        let query = r"
            SELECT id, project_id, class, public_key, private_key_ciphertext, kms_key_id, create_time, expire_time
            FROM signing_keys
            WHERE project_id = $1 AND class = $2 AND expire_time > $3
            ORDER BY create_time DESC
        ";
        let rows = sqlx::query(query)
            .bind(project_id)
            .bind(class.as_str())
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to list verification keys")?;
        rows.iter().map(signing_key_from_row).collect()
    }
}

#[async_trait]
impl CredentialRepository for PgStore {
    async fn find_api_key(
        &self,
        family: ApiKeyFamily,
        secret_sha256: &[u8],
    ) -> Result<Option<ApiKeyRecord>> {
        let query = r"
            SELECT id, project_id, organization_id, family, secret_sha256, revoked, create_time
            FROM api_keys
            WHERE family = $1 AND secret_sha256 = $2 AND revoked = false
        ";
        let row = sqlx::query(query)
            .bind(family.as_str())
            .bind(secret_sha256)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to find api key")?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> Result<()> {
        let query = r"
            INSERT INTO api_keys
                (id, project_id, organization_id, family, secret_sha256, revoked, create_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        let result = sqlx::query(query)
            .bind(key.id)
            .bind(key.project_id)
            .bind(key.organization_id)
            .bind(key.family.as_str())
            .bind(&key.secret_sha256)
            .bind(key.revoked)
            .bind(key.create_time)
            .execute(&self.pool)
            .instrument(span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(anyhow!("duplicate api key")),
            Err(err) => Err(err).context("failed to insert api key"),
        }
    }

    async fn create_session(&self, new_user: Option<&User>, session: &Session) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin session transaction")?;

        if let Some(user) = new_user {
            let query = r"
                INSERT INTO users
                    (id, organization_id, email, password_hash, google_user_id, microsoft_user_id, is_owner, create_time, update_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ";
            sqlx::query(query)
                .bind(user.id)
                .bind(user.organization_id)
                .bind(&user.email)
                .bind(&user.password_hash)
                .bind(&user.google_user_id)
                .bind(&user.microsoft_user_id)
                .bind(user.is_owner)
                .bind(user.create_time)
                .bind(user.update_time)
                .execute(&mut *tx)
                .instrument(span("INSERT", query))
                .await
                .context("failed to insert user")?;
        }

        let query = r"
            INSERT INTO sessions
                (id, user_id, refresh_token_sha256, revoked, create_time, expire_time)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.refresh_token_sha256)
            .bind(session.revoked)
            .bind(session.create_time)
            .bind(session.expire_time)
            .execute(&mut *tx)
            .instrument(span("INSERT", query))
            .await
            .context("failed to insert session")?;

        tx.commit().await.context("commit session transaction")?;
        Ok(())
    }

    async fn resolve_refresh_token(
        &self,
        refresh_token_sha256: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshContext>> {
        let query = r"
            SELECT
                s.id AS s_id, s.user_id AS s_user_id, s.refresh_token_sha256 AS s_refresh_token_sha256,
                s.revoked AS s_revoked, s.create_time AS s_create_time, s.expire_time AS s_expire_time,
                u.id AS u_id, u.organization_id AS u_organization_id, u.email AS u_email,
                u.password_hash AS u_password_hash, u.google_user_id AS u_google_user_id,
                u.microsoft_user_id AS u_microsoft_user_id, u.is_owner AS u_is_owner,
                u.create_time AS u_create_time, u.update_time AS u_update_time,
                o.id AS o_id, o.project_id AS o_project_id, o.display_name AS o_display_name,
                o.log_in_with_email AS o_log_in_with_email, o.log_in_with_google AS o_log_in_with_google,
                o.log_in_with_microsoft AS o_log_in_with_microsoft,
                o.log_in_with_password AS o_log_in_with_password, o.create_time AS o_create_time
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            JOIN organizations o ON o.id = u.organization_id
            WHERE s.refresh_token_sha256 = $1 AND s.revoked = false AND s.expire_time > $2
        ";
        let row = sqlx::query(query)
            .bind(refresh_token_sha256)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to resolve refresh token")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(RefreshContext {
            session: Session {
                id: row.try_get("s_id")?,
                user_id: row.try_get("s_user_id")?,
                refresh_token_sha256: row.try_get("s_refresh_token_sha256")?,
                revoked: row.try_get("s_revoked")?,
                create_time: row.try_get("s_create_time")?,
                expire_time: row.try_get("s_expire_time")?,
            },
            user: user_from_row(&row, "u_")?,
            organization: organization_from_row(&row, "o_")?,
        }))
    }
}

#[async_trait]
impl SignInRepository for PgStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let query = r"
            SELECT id, display_name, log_in_with_email, log_in_with_google, log_in_with_microsoft,
                google_oauth_client_id, microsoft_oauth_client_id, create_time
            FROM projects
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to get project")?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let query = r"
            SELECT id, project_id, display_name, log_in_with_email, log_in_with_google,
                log_in_with_microsoft, log_in_with_password, create_time
            FROM organizations
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to get organization")?;
        row.as_ref()
            .map(|row| organization_from_row(row, ""))
            .transpose()
    }

    async fn is_email_verified(
        &self,
        project_id: Uuid,
        email: &str,
        google_user_id: Option<&str>,
        microsoft_user_id: Option<&str>,
    ) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM verified_emails
                WHERE project_id = $1
                    AND email = $2
                    AND ($3::text IS NULL OR google_user_id = $3)
                    AND ($4::text IS NULL OR microsoft_user_id = $4)
            ) AS verified
        ";
        let row = sqlx::query(query)
            .bind(project_id)
            .bind(email)
            .bind(google_user_id)
            .bind(microsoft_user_id)
            .fetch_one(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to check verified email")?;
        Ok(row.try_get("verified")?)
    }

    async fn user_exists_for_email(&self, project_id: Uuid, email: &str) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM users u
                JOIN organizations o ON o.id = u.organization_id
                WHERE o.project_id = $1 AND u.email = $2
            ) AS found
        ";
        let row = sqlx::query(query)
            .bind(project_id)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to check user email")?;
        Ok(row.try_get("found")?)
    }

    async fn find_user_by_email(
        &self,
        organization_id: Uuid,
        email: &str,
    ) -> Result<Option<User>> {
        let query = r"
            SELECT id, organization_id, email, password_hash, google_user_id, microsoft_user_id,
                is_owner, create_time, update_time
            FROM users
            WHERE organization_id = $1 AND email = $2
        ";
        let row = sqlx::query(query)
            .bind(organization_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to find user by email")?;
        row.as_ref().map(|row| user_from_row(row, "")).transpose()
    }

    async fn insert_intermediate_session(&self, session: &IntermediateSession) -> Result<()> {
        let query = r"
            INSERT INTO intermediate_sessions
                (id, project_id, email, token_sha256, email_verified, google_user_id, microsoft_user_id, create_time, expire_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(session.project_id)
            .bind(&session.email)
            .bind(&session.token_sha256)
            .bind(session.email_verified)
            .bind(&session.google_user_id)
            .bind(&session.microsoft_user_id)
            .bind(session.create_time)
            .bind(session.expire_time)
            .execute(&self.pool)
            .instrument(span("INSERT", query))
            .await
            .context("failed to insert intermediate session")?;
        Ok(())
    }

    async fn get_intermediate_session(&self, id: Uuid) -> Result<Option<IntermediateSession>> {
        let query = r"
            SELECT id, project_id, email, token_sha256, email_verified, google_user_id,
                microsoft_user_id, create_time, expire_time
            FROM intermediate_sessions
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to get intermediate session")?;
        row.as_ref().map(intermediate_session_from_row).transpose()
    }

    async fn insert_email_challenge(
        &self,
        challenge: &EmailVerificationChallenge,
    ) -> Result<()> {
        let query = r"
            INSERT INTO email_verification_challenges
                (id, intermediate_session_id, challenge_sha256, create_time, expire_time, complete_time)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(query)
            .bind(challenge.id)
            .bind(challenge.intermediate_session_id)
            .bind(&challenge.challenge_sha256)
            .bind(challenge.create_time)
            .bind(challenge.expire_time)
            .bind(challenge.complete_time)
            .execute(&self.pool)
            .instrument(span("INSERT", query))
            .await
            .context("failed to insert email verification challenge")?;
        Ok(())
    }

    async fn get_email_challenge(&self, id: Uuid) -> Result<Option<EmailVerificationChallenge>> {
        let query = r"
            SELECT id, intermediate_session_id, challenge_sha256, create_time, expire_time, complete_time
            FROM email_verification_challenges
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", query))
            .await
            .context("failed to get email verification challenge")?;
        row.as_ref().map(challenge_from_row).transpose()
    }

    async fn complete_email_challenge(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin challenge transaction")?;

        let query = r"
            UPDATE email_verification_challenges
            SET complete_time = $2
            WHERE id = $1 AND complete_time IS NULL
            RETURNING intermediate_session_id
        ";
        let row = sqlx::query(query)
            .bind(id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .instrument(span("UPDATE", query))
            .await
            .context("failed to complete email verification challenge")?;

        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Ok(false);
        };
        let session_id: Uuid = row.try_get("intermediate_session_id")?;

        let query = r"
            UPDATE intermediate_sessions
            SET email_verified = true
            WHERE id = $1
            RETURNING project_id, email, google_user_id, microsoft_user_id
        ";
        let row = sqlx::query(query)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .instrument(span("UPDATE", query))
            .await
            .context("failed to mark intermediate session verified")?;

        let query = r"
            INSERT INTO verified_emails
                (id, project_id, email, google_user_id, microsoft_user_id, create_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
        ";
        sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(row.try_get::<Uuid, _>("project_id")?)
            .bind(row.try_get::<String, _>("email")?)
            .bind(row.try_get::<Option<String>, _>("google_user_id")?)
            .bind(row.try_get::<Option<String>, _>("microsoft_user_id")?)
            .bind(now)
            .execute(&mut *tx)
            .instrument(span("INSERT", query))
            .await
            .context("failed to record verified email")?;

        tx.commit().await.context("commit challenge transaction")?;
        Ok(true)
    }
}

#[async_trait]
impl Ping for PgStore {
    async fn ping(&self) -> Result<()> {
        let acquire_span = tracing::info_span!("db.acquire", db.system = "postgresql");
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .context("failed to acquire database connection")?;

        let ping_span = tracing::info_span!(
            "db.ping",
            db.system = "postgresql",
            db.operation = "PING"
        );
        conn.ping()
            .instrument(ping_span)
            .await
            .context("failed to ping database")
    }
}
