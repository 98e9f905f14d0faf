//! Envelope encryption capability.
//!
//! The signing-key store only ever sees this narrow interface: wrap a blob under a
//! master key, unwrap it again. Failures are returned as-is; callers fail closed.

pub mod local;
pub mod transit;

pub use local::LocalKms;
pub use transit::VaultTransit;

use anyhow::Result;
use async_trait::async_trait;
use zeroize::Zeroizing;

#[async_trait]
pub trait Kms: Send + Sync {
    /// Wrap `plaintext` under the master key `key_id`.
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Unwrap a blob produced by [`Kms::encrypt`] with the same `key_id`.
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}
