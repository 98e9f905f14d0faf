//! Opaque credentials and bearer classification.
//!
//! Opaque secrets are 32 random bytes rendered as `<prefix><base64url>`. Only the
//! SHA-256 of the decoded bytes is ever handed to storage.

use crate::{
    ids::IdKind,
    store::ApiKeyRecord,
};
use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

const SECRET_LEN: usize = 32;

pub const REFRESH_TOKEN_PREFIX: &str = "portcullis_refresh_token_";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyFamily {
    Backend,
    Scim,
}

impl ApiKeyFamily {
    const ALL: [Self; 2] = [Self::Backend, Self::Scim];

    /// Literal prefix of the bearer value.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Backend => "portcullis_secret_key_",
            Self::Scim => "portcullis_scim_api_key_",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Scim => "scim",
        }
    }

    #[must_use]
    pub fn from_db(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.as_str() == value)
    }

    #[must_use]
    pub const fn id_kind(self) -> IdKind {
        match self {
            Self::Backend => IdKind::BackendApiKey,
            Self::Scim => IdKind::ScimApiKey,
        }
    }
}

/// What a bearer value is, decided by its literal prefix alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Credential<'a> {
    ApiKey {
        family: ApiKeyFamily,
        secret: &'a str,
    },
    SessionToken(&'a str),
}

impl<'a> Credential<'a> {
    #[must_use]
    pub fn classify(bearer: &'a str) -> Self {
        ApiKeyFamily::ALL
            .into_iter()
            .find(|family| bearer.starts_with(family.prefix()))
            .map_or(Self::SessionToken(bearer), |family| Self::ApiKey {
                family,
                secret: bearer,
            })
    }
}

/// Generate a prefixed secret; returns the bearer value and the digest to store.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_secret(prefix: &str) -> Result<(String, Vec<u8>)> {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate secret")?;
    let value = format!("{prefix}{}", Base64UrlUnpadded::encode_string(&bytes));
    Ok((value, Sha256::digest(bytes).to_vec()))
}

/// Digest of a prefixed secret, or `None` if the value is not one.
#[must_use]
pub fn hash_prefixed_secret(prefix: &str, value: &str) -> Option<Vec<u8>> {
    let encoded = value.strip_prefix(prefix)?;
    let bytes = Base64UrlUnpadded::decode_vec(encoded).ok()?;
    if bytes.len() != SECRET_LEN {
        return None;
    }
    Some(Sha256::digest(&bytes).to_vec())
}

#[derive(Debug)]
pub struct GeneratedApiKey {
    pub record: ApiKeyRecord,
    /// Shown once; only its digest is in `record`.
    pub secret: SecretString,
}

/// Create a backend or SCIM API key for a project, optionally scoped to an organization.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_api_key(
    project_id: Uuid,
    organization_id: Option<Uuid>,
    family: ApiKeyFamily,
    now: DateTime<Utc>,
) -> Result<GeneratedApiKey> {
    let (secret, digest) = generate_secret(family.prefix())?;
    Ok(GeneratedApiKey {
        record: ApiKeyRecord {
            id: Uuid::new_v4(),
            project_id,
            organization_id,
            family,
            secret_sha256: digest,
            revoked: false,
            create_time: now,
        },
        secret: SecretString::from(secret),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn classification_is_by_prefix() {
        assert_eq!(
            Credential::classify("portcullis_secret_key_abc"),
            Credential::ApiKey {
                family: ApiKeyFamily::Backend,
                secret: "portcullis_secret_key_abc",
            }
        );
        assert_eq!(
            Credential::classify("portcullis_scim_api_key_abc"),
            Credential::ApiKey {
                family: ApiKeyFamily::Scim,
                secret: "portcullis_scim_api_key_abc",
            }
        );
        assert_eq!(
            Credential::classify("eyJhbGciOi.x.y"),
            Credential::SessionToken("eyJhbGciOi.x.y")
        );
        assert_eq!(
            Credential::classify("portcullis_refresh_token_abc"),
            Credential::SessionToken("portcullis_refresh_token_abc")
        );
    }

    #[test]
    fn generated_keys_hash_back_to_their_record() -> Result<()> {
        let generated = generate_api_key(
            Uuid::new_v4(),
            None,
            ApiKeyFamily::Scim,
            Utc::now(),
        )?;
        let secret = generated.secret.expose_secret();
        assert!(secret.starts_with("portcullis_scim_api_key_"));
        assert_eq!(
            hash_prefixed_secret(ApiKeyFamily::Scim.prefix(), secret),
            Some(generated.record.secret_sha256.clone())
        );
        assert_eq!(generated.record.secret_sha256.len(), 32);
        assert!(!format!("{:?}", generated.record).contains(&secret[24..]));
        Ok(())
    }

    #[test]
    fn malformed_secrets_have_no_digest() {
        let prefix = ApiKeyFamily::Backend.prefix();
        assert_eq!(hash_prefixed_secret(prefix, "portcullis_secret_key_"), None);
        assert_eq!(hash_prefixed_secret(prefix, "portcullis_secret_key_!!!"), None);
        assert_eq!(hash_prefixed_secret(prefix, "portcullis_secret_key_AAAA"), None);
        assert_eq!(hash_prefixed_secret(prefix, "other_AAAA"), None);
    }

    #[test]
    fn family_round_trips_through_storage() {
        for family in ApiKeyFamily::ALL {
            assert_eq!(ApiKeyFamily::from_db(family.as_str()), Some(family));
        }
        assert_eq!(ApiKeyFamily::from_db("publishable"), None);
    }
}
