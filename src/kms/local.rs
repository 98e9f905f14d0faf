//! In-process KMS for development and tests.
//!
//! ChaCha20-Poly1305 under a single 32-byte master key. The blob layout is
//! `nonce (12 bytes) || ciphertext || tag`, and the master-key id is bound as
//! associated data so a blob cannot be unwrapped under another key id.

use super::Kms;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

pub struct LocalKms {
    cipher: ChaCha20Poly1305,
}

impl LocalKms {
    #[must_use]
    pub fn new(master_key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(master_key)),
        }
    }

    /// Build from a standard base64 encoded 32-byte key.
    ///
    /// # Errors
    /// Returns an error if the value is not base64 or not 32 bytes long.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            Base64::decode_vec(encoded.trim()).map_err(|_| anyhow!("local KMS key is not base64"))?,
        );
        let key: &[u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("local KMS key must be 32 bytes"))?;
        Ok(Self::new(key))
    }
}

impl std::fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKms").field("key", &"***").finish()
    }
}

#[async_trait]
impl Kms for LocalKms {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("local KMS encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if ciphertext.len() <= NONCE_LEN {
            return Err(anyhow!("local KMS ciphertext is truncated"));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("local KMS decryption failed"))?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kms() -> LocalKms {
        LocalKms::new(&[7u8; 32])
    }

    #[tokio::test]
    async fn encrypt_then_decrypt() -> Result<()> {
        let kms = kms();
        let blob = kms.encrypt("signing", b"private key bytes").await?;
        assert_ne!(&blob[NONCE_LEN..], b"private key bytes".as_slice());
        let plaintext = kms.decrypt("signing", &blob).await?;
        assert_eq!(plaintext.as_slice(), b"private key bytes");
        Ok(())
    }

    #[tokio::test]
    async fn key_id_is_bound() -> Result<()> {
        let kms = kms();
        let blob = kms.encrypt("signing", b"secret").await?;
        assert!(kms.decrypt("other", &blob).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn tampered_or_truncated_blobs_fail() -> Result<()> {
        let kms = kms();
        let mut blob = kms.encrypt("signing", b"secret").await?;
        let last = blob.len() - 1;
        blob[last] ^= 1;
        assert!(kms.decrypt("signing", &blob).await.is_err());
        assert!(kms.decrypt("signing", &[0u8; NONCE_LEN]).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn other_master_key_cannot_decrypt() -> Result<()> {
        let blob = kms().encrypt("signing", b"secret").await?;
        let other = LocalKms::new(&[8u8; 32]);
        assert!(other.decrypt("signing", &blob).await.is_err());
        Ok(())
    }

    #[test]
    fn from_base64_validates_length() {
        assert!(LocalKms::from_base64(&Base64::encode_string(&[1u8; 32])).is_ok());
        assert!(LocalKms::from_base64(&Base64::encode_string(&[1u8; 16])).is_err());
        assert!(LocalKms::from_base64("not base64!").is_err());
    }

    #[test]
    fn debug_hides_key() {
        assert!(!format!("{:?}", kms()).contains('7'));
    }
}
