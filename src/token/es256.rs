use base64ct::{Base64UrlUnpadded, Encoding};
use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub const ALG: &str = "ES256";

// Field order is part of the wire format: {"kid":..,"alg":..}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    kid: String,
    alg: String,
}

// The registered claims every token must carry; everything else is opaque here.
#[derive(Deserialize)]
struct Registered {
    aud: String,
    exp: i64,
    #[serde(default)]
    nbf: Option<i64>,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Any structural, cryptographic or claim failure. Deliberately carries no detail.
    #[error("bad token")]
    BadToken,
    #[error("failed to encode token: {0}")]
    Encode(#[from] serde_json::Error),
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: DeserializeOwned>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::BadToken)?;
    serde_json::from_slice(&bytes).map_err(|_| Error::BadToken)
}

fn split(token: &str) -> Result<(&str, &str, &str), Error> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(Error::BadToken)?;
    let claims_b64 = parts.next().ok_or(Error::BadToken)?;
    let sig_b64 = parts.next().ok_or(Error::BadToken)?;
    if parts.next().is_some() {
        return Err(Error::BadToken);
    }
    Ok((header_b64, claims_b64, sig_b64))
}

fn decode_header(header_b64: &str) -> Result<Header, Error> {
    let header: Header = b64d_json(header_b64)?;
    if header.alg != ALG {
        return Err(Error::BadToken);
    }
    Ok(header)
}

/// Sign `claims` with `key`, announcing `kid` in the header.
///
/// ECDSA over SHA-256 of `header_b64.claims_b64`; the signature segment is the fixed
/// 64-byte `r || s` encoding, never DER.
///
/// # Errors
///
/// Returns `Error::Encode` if the header or claims cannot be serialized.
pub fn sign<T: Serialize>(kid: &str, key: &SigningKey, claims: &T) -> Result<String, Error> {
    let header = Header {
        kid: kid.to_string(),
        alg: ALG.to_string(),
    };
    let header_b64 = b64e_json(&header)?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signature: Signature = key.sign(signing_input.as_bytes());
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_bytes());

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Read the `kid` header of an unverified token.
///
/// The value is only good for picking a verification key; nothing else may be derived
/// from it.
///
/// # Errors
///
/// Returns `Error::BadToken` if the token is not three segments, the header is not
/// base64url JSON, or `alg` is not `ES256`.
pub fn key_id(token: &str) -> Result<String, Error> {
    let (header_b64, _, _) = split(token)?;
    Ok(decode_header(header_b64)?.kid)
}

/// Verify `token` against `key` and decode its claims.
///
/// The token is accepted when the signature is valid, `aud` equals `audience` and
/// `nbf <= now < exp` (a missing `nbf` is not checked).
///
/// # Errors
///
/// Returns `Error::BadToken` on any failure.
pub fn verify<T: DeserializeOwned>(
    key: &VerifyingKey,
    audience: &str,
    now: i64,
    token: &str,
) -> Result<T, Error> {
    let (header_b64, claims_b64, sig_b64) = split(token)?;
    decode_header(header_b64)?;

    let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::BadToken)?;
    // Only the canonical encoding of the 64 bytes is accepted.
    if Base64UrlUnpadded::encode_string(&signature_bytes) != sig_b64 {
        return Err(Error::BadToken);
    }
    let signature = Signature::from_slice(&signature_bytes).map_err(|_| Error::BadToken)?;

    let signing_input = format!("{header_b64}.{claims_b64}");
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| Error::BadToken)?;

    let claims_bytes = Base64UrlUnpadded::decode_vec(claims_b64).map_err(|_| Error::BadToken)?;
    let registered: Registered =
        serde_json::from_slice(&claims_bytes).map_err(|_| Error::BadToken)?;
    if registered.aud != audience {
        return Err(Error::BadToken);
    }
    if registered.exp <= now {
        return Err(Error::BadToken);
    }
    if registered.nbf.is_some_and(|nbf| nbf > now) {
        return Err(Error::BadToken);
    }

    serde_json::from_slice(&claims_bytes).map_err(|_| Error::BadToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use rand::rngs::OsRng;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    struct TestClaims {
        aud: String,
        sub: String,
        iat: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        nbf: Option<i64>,
        exp: i64,
        email: String,
    }

    fn claims(nbf: Option<i64>, exp: i64) -> TestClaims {
        TestClaims {
            aud: "project_0000000000000000000000001".to_string(),
            sub: "user_0000000000000000000000002".to_string(),
            iat: 1_000,
            nbf,
            exp,
            email: "alice@example.com".to_string(),
        }
    }

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::random(&mut OsRng);
        let verifying = *signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn sign_then_verify_returns_claims() -> Result<()> {
        let (signing, verifying) = keypair();
        let claims = claims(Some(1_000), 2_000);
        let token = sign("kid-1", &signing, &claims)?;

        for now in [1_000, 1_500, 1_999] {
            let decoded: TestClaims = verify(&verifying, &claims.aud, now, &token)?;
            assert_eq!(decoded, claims);
        }
        Ok(())
    }

    #[test]
    fn wire_format_is_unpadded_with_raw_signature() -> Result<()> {
        let (signing, _) = keypair();
        let token = sign("kid-1", &signing, &claims(None, 2_000))?;
        assert!(!token.contains('='));

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = Base64UrlUnpadded::decode_vec(parts[0]).map_err(|e| anyhow!("{e}"))?;
        assert_eq!(header, br#"{"kid":"kid-1","alg":"ES256"}"#);

        let signature = Base64UrlUnpadded::decode_vec(parts[2]).map_err(|e| anyhow!("{e}"))?;
        assert_eq!(signature.len(), 64);
        Ok(())
    }

    #[test]
    fn key_id_reads_header_without_verifying() -> Result<()> {
        let (signing, _) = keypair();
        let token = sign("session_signing_key_abc", &signing, &claims(None, 2_000))?;
        assert_eq!(key_id(&token)?, "session_signing_key_abc");
        Ok(())
    }

    #[test]
    fn key_id_rejects_malformed_tokens() {
        let other_alg = format!(
            "{}.e30.sig",
            Base64UrlUnpadded::encode_string(br#"{"kid":"k","alg":"RS256"}"#)
        );
        let not_json = format!("{}.e30.sig", Base64UrlUnpadded::encode_string(b"kid"));
        for token in [
            "",
            "a.b",
            "a.b.c.d",
            "!!!.e30.sig",
            other_alg.as_str(),
            not_json.as_str(),
        ] {
            assert!(matches!(key_id(token), Err(Error::BadToken)), "{token}");
        }
    }

    #[test]
    fn expiry_boundary() -> Result<()> {
        let (signing, verifying) = keypair();
        let claims = claims(None, 5_000);
        let token = sign("kid-1", &signing, &claims)?;

        assert!(verify::<TestClaims>(&verifying, &claims.aud, 4_999, &token).is_ok());
        assert!(verify::<TestClaims>(&verifying, &claims.aud, 5_000, &token).is_err());
        assert!(verify::<TestClaims>(&verifying, &claims.aud, 5_001, &token).is_err());
        Ok(())
    }

    #[test]
    fn not_before_is_enforced() -> Result<()> {
        let (signing, verifying) = keypair();
        let claims = claims(Some(3_000), 5_000);
        let token = sign("kid-1", &signing, &claims)?;

        assert!(verify::<TestClaims>(&verifying, &claims.aud, 2_999, &token).is_err());
        assert!(verify::<TestClaims>(&verifying, &claims.aud, 3_000, &token).is_ok());
        Ok(())
    }

    #[test]
    fn wrong_audience_or_key_fails() -> Result<()> {
        let (signing, verifying) = keypair();
        let (_, other) = keypair();
        let claims = claims(None, 5_000);
        let token = sign("kid-1", &signing, &claims)?;

        assert!(verify::<TestClaims>(&verifying, "project_other", 1_000, &token).is_err());
        assert!(verify::<TestClaims>(&other, &claims.aud, 1_000, &token).is_err());
        Ok(())
    }

    #[test]
    fn flipping_any_bit_in_any_segment_fails() -> Result<()> {
        let (signing, verifying) = keypair();
        let claims = claims(Some(1_000), 5_000);
        let token = sign("kid-1", &signing, &claims)?;
        let parts: Vec<String> = token.split('.').map(str::to_string).collect();

        for segment in 0..3 {
            let bytes =
                Base64UrlUnpadded::decode_vec(&parts[segment]).map_err(|e| anyhow!("{e}"))?;
            for index in 0..bytes.len() {
                for bit in 0..8 {
                    let mut tampered_bytes = bytes.clone();
                    tampered_bytes[index] ^= 1 << bit;
                    let mut tampered = parts.clone();
                    tampered[segment] = Base64UrlUnpadded::encode_string(&tampered_bytes);
                    let tampered = tampered.join(".");

                    assert!(
                        verify::<TestClaims>(&verifying, &claims.aud, 2_000, &tampered).is_err(),
                        "segment {segment} byte {index} bit {bit} still verifies"
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn non_canonical_signature_encoding_fails() -> Result<()> {
        let (signing, verifying) = keypair();
        let claims = claims(None, 5_000);
        let token = sign("kid-1", &signing, &claims)?;
        let (head, sig) = token
            .rsplit_once('.')
            .ok_or_else(|| anyhow!("token has no signature"))?;

        // 64 bytes leave four unused trailing bits in the last character.
        let mut chars: Vec<char> = sig.chars().collect();
        let last = chars.len() - 1;
        chars[last] = match chars[last] {
            'A' => 'B',
            'Q' => 'R',
            'g' => 'h',
            _ => 'x',
        };
        let tampered = format!("{head}.{}", chars.into_iter().collect::<String>());

        assert!(verify::<TestClaims>(&verifying, &claims.aud, 1_000, &tampered).is_err());
        Ok(())
    }
}
