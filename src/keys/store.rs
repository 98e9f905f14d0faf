//! Envelope-encrypted signing keys.
//!
//! Private keys are generated here, serialized as PKCS#8 DER, wrapped by the [`Kms`] and
//! persisted as ciphertext only. Unwrapping happens per call and the plaintext lives no
//! longer than the returned [`Signer`]. A KMS failure is returned to the caller; there is
//! no fallback.

use super::{KeyPolicy, TokenClass, VerificationKey, VerificationKeySource};
use crate::{
    ids,
    kms::Kms,
    store::{SigningKeyRecord, SigningKeyRepository},
    token,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use p256::{
    ecdsa::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
};
use rand::rngs::OsRng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A decrypted private key, scoped to the caller.
pub struct Signer {
    pub kid: String,
    pub expire_time: DateTime<Utc>,
    key: SigningKey,
}

impl Signer {
    /// # Errors
    /// Returns `token::Error::Encode` if `claims` cannot be serialized.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, token::Error> {
        token::sign(&self.kid, &self.key, claims)
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("kid", &self.kid)
            .field("expire_time", &self.expire_time)
            .field("key", &"***")
            .finish()
    }
}

pub struct SigningKeyStore {
    repo: Arc<dyn SigningKeyRepository>,
    kms: Arc<dyn Kms>,
    kms_key_id: String,
    policy: KeyPolicy,
}

impl SigningKeyStore {
    #[must_use]
    pub fn new(
        repo: Arc<dyn SigningKeyRepository>,
        kms: Arc<dyn Kms>,
        kms_key_id: impl Into<String>,
        policy: KeyPolicy,
    ) -> Self {
        Self {
            repo,
            kms,
            kms_key_id: kms_key_id.into(),
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    /// Generate a key pair, wrap the private half and persist it.
    ///
    /// # Errors
    /// Returns an error if encoding, the KMS or the repository fails; nothing is
    /// persisted in that case.
    #[instrument(skip(self), fields(class = class.as_str()))]
    pub async fn create_signing_key(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<SigningKeyRecord> {
        let key = SigningKey::random(&mut OsRng);
        let private_der = key
            .to_pkcs8_der()
            .map_err(|e| anyhow!("failed to encode private key: {e}"))?;
        let public_der = key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| anyhow!("failed to encode public key: {e}"))?;

        let ciphertext = self
            .kms
            .encrypt(&self.kms_key_id, private_der.as_bytes())
            .await
            .context("failed to wrap signing key")?;

        let record = SigningKeyRecord {
            id: Uuid::new_v4(),
            project_id,
            class,
            public_key: public_der.as_bytes().to_vec(),
            private_key_ciphertext: ciphertext,
            kms_key_id: self.kms_key_id.clone(),
            create_time: now,
            expire_time: now + self.policy.lifetime,
        };
        self.repo.insert_signing_key(&record).await?;

        info!(
            kid = %ids::format(class.key_kind(), record.id),
            "Created signing key"
        );
        Ok(record)
    }

    /// Fetch a key and unwrap its private half.
    ///
    /// # Errors
    /// Returns an error if the key does not exist, the KMS refuses to unwrap it, or the
    /// unwrapped key does not match the stored public key.
    #[instrument(skip(self))]
    pub async fn get_signing_key_by_id(&self, id: Uuid) -> Result<Signer> {
        let record = self
            .repo
            .get_signing_key(id)
            .await?
            .ok_or_else(|| anyhow!("signing key {id} not found"))?;
        self.unwrap(&record).await
    }

    /// The newest unexpired key of `class` for the project, without its private half.
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub async fn get_current_signing_key(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Option<SigningKeyRecord>> {
        self.repo
            .get_current_signing_key(project_id, class, now)
            .await
    }

    /// Unwrap the current key of `class` for signing.
    ///
    /// # Errors
    /// Returns an error if the project has no current key of `class` or unwrapping fails.
    #[instrument(skip(self), fields(class = class.as_str()))]
    pub async fn signer_for(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Signer> {
        let record = self
            .get_current_signing_key(project_id, class, now)
            .await?
            .ok_or_else(|| anyhow!("no current {} signing key", class.as_str()))?;
        self.unwrap(&record).await
    }

    /// Public halves of every unexpired key of `class`, newest first.
    ///
    /// # Errors
    /// Returns an error if the repository fails or a stored public key is corrupt.
    pub async fn get_verification_keys(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<VerificationKey>> {
        self.repo
            .list_verification_keys(project_id, class, now)
            .await?
            .iter()
            .map(verification_key)
            .collect()
    }

    /// Create a new current key when there is none or the current one is older than the
    /// rotation interval. Older keys stay valid for verification until they expire.
    ///
    /// # Errors
    /// Returns an error if the lookup or the creation fails.
    #[instrument(skip(self), fields(class = class.as_str()))]
    pub async fn rotate_if_due(
        &self,
        project_id: Uuid,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<Option<SigningKeyRecord>> {
        if let Some(current) = self.get_current_signing_key(project_id, class, now).await? {
            if now - current.create_time < self.policy.rotate_after {
                debug!("Current signing key is fresh, not rotating");
                return Ok(None);
            }
        }
        self.create_signing_key(project_id, class, now)
            .await
            .map(Some)
    }

    async fn unwrap(&self, record: &SigningKeyRecord) -> Result<Signer> {
        let der = self
            .kms
            .decrypt(&record.kms_key_id, &record.private_key_ciphertext)
            .await
            .context("failed to unwrap signing key")?;
        let key = SigningKey::from_pkcs8_der(&der)
            .map_err(|e| anyhow!("failed to decode private key: {e}"))?;

        let public = VerifyingKey::from_public_key_der(&record.public_key)
            .map_err(|e| anyhow!("failed to decode public key: {e}"))?;
        if *key.verifying_key() != public {
            return Err(anyhow!("signing key {} does not match its public key", record.id));
        }

        Ok(Signer {
            kid: ids::format(record.class.key_kind(), record.id),
            expire_time: record.expire_time,
            key,
        })
    }
}

fn verification_key(record: &SigningKeyRecord) -> Result<VerificationKey> {
    let key = VerifyingKey::from_public_key_der(&record.public_key)
        .map_err(|e| anyhow!("failed to decode public key: {e}"))?;
    Ok(VerificationKey {
        kid: ids::format(record.class.key_kind(), record.id),
        project_id: record.project_id,
        class: record.class,
        key,
        expire_time: record.expire_time,
    })
}

#[async_trait]
impl VerificationKeySource for SigningKeyStore {
    async fn verification_key(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationKey>> {
        let Ok((kind, id)) = ids::parse(kid) else {
            return Ok(None);
        };
        let Some(class) = TokenClass::from_key_kind(kind) else {
            return Ok(None);
        };
        let Some(record) = self.repo.get_signing_key(id).await? else {
            return Ok(None);
        };
        if record.class != class || record.expire_time <= now {
            return Ok(None);
        }
        verification_key(&record).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kms::LocalKms, store::MemoryStore};
    use chrono::{Duration, TimeZone};
    use serde::Deserialize;
    use zeroize::Zeroizing;

    struct DownKms;

    #[async_trait]
    impl Kms for DownKms {
        async fn encrypt(&self, _key_id: &str, _plaintext: &[u8]) -> Result<Vec<u8>> {
            Err(anyhow!("kms unavailable"))
        }

        async fn decrypt(&self, _key_id: &str, _ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
            Err(anyhow!("kms unavailable"))
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Claims {
        aud: String,
        exp: i64,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    fn store(repo: Arc<MemoryStore>) -> SigningKeyStore {
        SigningKeyStore::new(
            repo,
            Arc::new(LocalKms::new(&[7; 32])),
            "signing",
            KeyPolicy::default(),
        )
    }

    #[tokio::test]
    async fn private_keys_are_stored_wrapped() -> Result<()> {
        let repo = Arc::new(MemoryStore::new());
        let keys = store(repo.clone());
        let project = Uuid::new_v4();

        let record = keys
            .create_signing_key(project, TokenClass::Session, t0())
            .await?;
        let signer = keys.get_signing_key_by_id(record.id).await?;
        let der = signer
            .key
            .to_pkcs8_der()
            .map_err(|e| anyhow!("{e}"))?;

        assert_ne!(record.private_key_ciphertext.as_slice(), der.as_bytes());
        let windows = record
            .private_key_ciphertext
            .windows(32)
            .any(|w| w == signer.key.to_bytes().as_slice());
        assert!(!windows, "ciphertext embeds the raw scalar");
        assert_eq!(record.expire_time - record.create_time, Duration::hours(7));
        assert!(signer.kid.starts_with("session_signing_key_"));
        Ok(())
    }

    #[tokio::test]
    async fn kms_failure_fails_closed() -> Result<()> {
        let repo = Arc::new(MemoryStore::new());
        let project = Uuid::new_v4();

        let down = SigningKeyStore::new(
            repo.clone(),
            Arc::new(DownKms),
            "signing",
            KeyPolicy::default(),
        );
        assert!(
            down.create_signing_key(project, TokenClass::Session, t0())
                .await
                .is_err()
        );
        assert!(
            repo.list_verification_keys(project, TokenClass::Session, t0())
                .await?
                .is_empty()
        );

        let record = store(repo.clone())
            .create_signing_key(project, TokenClass::Session, t0())
            .await?;
        assert!(down.get_signing_key_by_id(record.id).await.is_err());

        let other_master = SigningKeyStore::new(
            repo,
            Arc::new(LocalKms::new(&[8; 32])),
            "signing",
            KeyPolicy::default(),
        );
        assert!(other_master.get_signing_key_by_id(record.id).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn rotation_keeps_old_tokens_verifiable_until_expiry() -> Result<()> {
        let repo = Arc::new(MemoryStore::new());
        let keys = store(repo);
        let project = Uuid::new_v4();
        let audience = TokenClass::Session.audience(project);

        let a = keys
            .rotate_if_due(project, TokenClass::Session, t0())
            .await?
            .ok_or_else(|| anyhow!("no initial key"))?;
        let claims = Claims {
            aud: audience.clone(),
            exp: (t0() + Duration::hours(10)).timestamp(),
        };
        let token = keys
            .signer_for(project, TokenClass::Session, t0())
            .await?
            .sign(&claims)?;

        let not_due = t0() + Duration::hours(5);
        assert!(
            keys.rotate_if_due(project, TokenClass::Session, not_due)
                .await?
                .is_none()
        );

        let rotated_at = t0() + Duration::hours(6);
        let b = keys
            .rotate_if_due(project, TokenClass::Session, rotated_at)
            .await?
            .ok_or_else(|| anyhow!("rotation did not happen"))?;
        let current = keys
            .get_current_signing_key(project, TokenClass::Session, rotated_at)
            .await?;
        assert_eq!(current.map(|k| k.id), Some(b.id));

        let kid = token::key_id(&token)?;
        let later = t0() + Duration::minutes(6 * 60 + 30);
        let key = keys
            .verification_key(&kid, later)
            .await?
            .ok_or_else(|| anyhow!("old key no longer served"))?;
        let decoded: Claims = token::verify(&key.key, &audience, later.timestamp(), &token)?;
        assert_eq!(decoded.aud, audience);

        let listed = keys
            .get_verification_keys(project, TokenClass::Session, later)
            .await?;
        assert_eq!(listed.len(), 2);

        let expired = a.expire_time;
        assert!(keys.verification_key(&kid, expired).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn verification_key_checks_class_of_kid() -> Result<()> {
        let repo = Arc::new(MemoryStore::new());
        let keys = store(repo);
        let project = Uuid::new_v4();

        let record = keys
            .create_signing_key(project, TokenClass::IntermediateSession, t0())
            .await?;
        let forged = ids::format(ids::IdKind::SessionSigningKey, record.id);
        assert!(keys.verification_key(&forged, t0()).await?.is_none());

        let genuine = ids::format(ids::IdKind::IntermediateSessionSigningKey, record.id);
        let key = keys.verification_key(&genuine, t0()).await?;
        assert_eq!(key.map(|k| k.class), Some(TokenClass::IntermediateSession));

        assert!(keys.verification_key("garbage", t0()).await?.is_none());
        Ok(())
    }
}
