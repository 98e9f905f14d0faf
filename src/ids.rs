//! Formatted identifiers.
//!
//! Every id leaves the process as `<kind prefix>_<25 base36 digits>`, where the digits
//! encode the 128 bits of the storage UUID. The prefix makes the kind of an id visible
//! without a lookup; signing-key ids double as token `kid` values, so the token class is
//! known from the header alone.

use thiserror::Error;
use uuid::Uuid;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
// 36^25 > 2^128, so 25 digits always fit a UUID.
const ENCODED_LEN: usize = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    Project,
    Organization,
    User,
    Session,
    IntermediateSession,
    EmailVerificationChallenge,
    SessionSigningKey,
    IntermediateSessionSigningKey,
    BackendApiKey,
    ScimApiKey,
}

impl IdKind {
    const ALL: [Self; 10] = [
        Self::Project,
        Self::Organization,
        Self::User,
        Self::Session,
        Self::IntermediateSession,
        Self::EmailVerificationChallenge,
        Self::SessionSigningKey,
        Self::IntermediateSessionSigningKey,
        Self::BackendApiKey,
        Self::ScimApiKey,
    ];

    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Organization => "org",
            Self::User => "user",
            Self::Session => "session",
            Self::IntermediateSession => "intermediate_session",
            Self::EmailVerificationChallenge => "email_verification_challenge",
            Self::SessionSigningKey => "session_signing_key",
            Self::IntermediateSessionSigningKey => "intermediate_session_signing_key",
            Self::BackendApiKey => "backend_api_key",
            Self::ScimApiKey => "scim_api_key",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("malformed identifier")]
    Malformed,
    #[error("expected a {expected} identifier")]
    WrongKind { expected: &'static str },
}

/// Render `id` with the prefix of `kind`.
#[must_use]
pub fn format(kind: IdKind, id: Uuid) -> String {
    let mut value = id.as_u128();
    let mut digits = [b'0'; ENCODED_LEN];
    for slot in digits.iter_mut().rev() {
        // value % 36 < 36, the cast cannot truncate
        #[allow(clippy::cast_possible_truncation)]
        let digit = (value % 36) as usize;
        *slot = ALPHABET[digit];
        value /= 36;
    }

    let mut out = String::with_capacity(kind.prefix().len() + 1 + ENCODED_LEN);
    out.push_str(kind.prefix());
    out.push('_');
    out.extend(digits.iter().map(|&b| char::from(b)));
    out
}

/// Parse a formatted id back into its kind and storage UUID.
///
/// # Errors
/// Returns `IdError::Malformed` for unknown prefixes, bad digits or overflow.
pub fn parse(value: &str) -> Result<(IdKind, Uuid), IdError> {
    let (prefix, encoded) = value.rsplit_once('_').ok_or(IdError::Malformed)?;
    let kind = IdKind::from_prefix(prefix).ok_or(IdError::Malformed)?;

    if encoded.len() != ENCODED_LEN {
        return Err(IdError::Malformed);
    }

    let mut acc: u128 = 0;
    for byte in encoded.bytes() {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'z' => byte - b'a' + 10,
            _ => return Err(IdError::Malformed),
        };
        acc = acc
            .checked_mul(36)
            .and_then(|acc| acc.checked_add(u128::from(digit)))
            .ok_or(IdError::Malformed)?;
    }

    Ok((kind, Uuid::from_u128(acc)))
}

/// Parse a formatted id that must be of `kind`.
///
/// # Errors
/// Returns `IdError::Malformed` or `IdError::WrongKind`.
pub fn parse_as(kind: IdKind, value: &str) -> Result<Uuid, IdError> {
    let (parsed_kind, id) = parse(value)?;
    if parsed_kind != kind {
        return Err(IdError::WrongKind {
            expected: kind.prefix(),
        });
    }
    Ok(id)
}
