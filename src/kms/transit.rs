//! Vault transit engine as the envelope-encryption backend.
//!
//! `encrypt` sends the plaintext base64 encoded to `<mount>/encrypt/<key>` and stores the
//! returned `vault:vN:...` ciphertext string as bytes; `decrypt` reverses it.

use super::Kms;
use crate::{APP_USER_AGENT, vault};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{Instrument, error, info_span};
use zeroize::Zeroizing;

pub struct VaultTransit {
    client: Client,
    vault_url: String,
    mount: String,
    token: SecretString,
}

impl VaultTransit {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(vault_url: &str, mount: &str, token: SecretString) -> Result<Self> {
        Ok(Self {
            client: Client::builder().user_agent(APP_USER_AGENT).build()?,
            vault_url: vault_url.to_string(),
            mount: mount.trim_matches('/').to_string(),
            token,
        })
    }

    async fn post(&self, operation: &str, key_id: &str, payload: &Value) -> Result<Value> {
        let url = vault::endpoint_url(
            &self.vault_url,
            &format!("/v1/{}/{operation}/{key_id}", self.mount),
        )?;

        let span = info_span!(
            "vault.transit",
            http.method = "POST",
            vault.operation = operation,
            vault.key = key_id
        );
        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", self.token.expose_secret())
            .json(payload)
            .send()
            .instrument(span)
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let json_response: Value = response.json().await.unwrap_or(Value::Null);
            let error_message = vault::vault_error_message(&json_response);

            error!("Failed to {operation}: {error_message}");

            return Err(anyhow!("{status}, {error_message}"));
        }

        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for VaultTransit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultTransit")
            .field("vault_url", &self.vault_url)
            .field("mount", &self.mount)
            .field("token", &"***")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Kms for VaultTransit {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let payload = json!({ "plaintext": Base64::encode_string(plaintext) });
        let json_response = self.post("encrypt", key_id, &payload).await?;

        vault::get_required_str(&json_response, &["data", "ciphertext"])
            .map(|ciphertext| ciphertext.as_bytes().to_vec())
            .ok_or_else(|| {
                error!("Failed to encrypt, no ciphertext in response");
                anyhow!("Failed to encrypt")
            })
    }

    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let ciphertext =
            std::str::from_utf8(ciphertext).context("transit ciphertext is not UTF-8")?;
        let payload = json!({ "ciphertext": ciphertext });
        let json_response = self.post("decrypt", key_id, &payload).await?;

        let plaintext_b64 =
            vault::get_required_str(&json_response, &["data", "plaintext"]).ok_or_else(|| {
                error!("Failed to decrypt, no plaintext in response");
                anyhow!("Failed to decrypt")
            })?;

        Base64::decode_vec(plaintext_b64).map(Zeroizing::new).map_err(|e| {
            error!("Failed to decode plaintext: {}", e);
            anyhow!("Failed to decode plaintext")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn transit(server: &MockServer) -> Result<VaultTransit> {
        VaultTransit::new(
            &server.uri(),
            "/transit/",
            SecretString::from("vault-token".to_string()),
        )
    }

    #[tokio::test]
    async fn encrypt_returns_ciphertext_bytes() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/transit/encrypt/signing-keys"))
            .and(header("X-Vault-Token", "vault-token"))
            .and(body_json(json!({ "plaintext": Base64::encode_string(b"secret") })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"ciphertext": "vault:v1:abc"}
            })))
            .mount(&server)
            .await;

        let ciphertext = transit(&server)?.encrypt("signing-keys", b"secret").await?;
        assert_eq!(ciphertext, b"vault:v1:abc");
        Ok(())
    }

    #[tokio::test]
    async fn decrypt_returns_plaintext() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/transit/decrypt/signing-keys"))
            .and(body_json(json!({ "ciphertext": "vault:v1:abc" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"plaintext": Base64::encode_string(b"secret")}
            })))
            .mount(&server)
            .await;

        let plaintext = transit(&server)?
            .decrypt("signing-keys", b"vault:v1:abc")
            .await?;
        assert_eq!(plaintext.as_slice(), b"secret");
        Ok(())
    }

    #[tokio::test]
    async fn failure_status_is_an_error() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/transit/decrypt/signing-keys"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "errors": ["permission denied"]
            })))
            .mount(&server)
            .await;

        let err = transit(&server)?
            .decrypt("signing-keys", b"vault:v1:abc")
            .await
            .err()
            .ok_or_else(|| anyhow!("expected error"))?;
        assert!(err.to_string().contains("permission denied"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_ciphertext_is_an_error() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/transit/encrypt/signing-keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
            .mount(&server)
            .await;

        assert!(transit(&server)?
            .encrypt("signing-keys", b"secret")
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_vault_fails_closed() -> Result<()> {
        let transit = VaultTransit::new(
            "http://127.0.0.1:1",
            "transit",
            SecretString::from("vault-token".to_string()),
        )?;
        assert!(transit.decrypt("signing-keys", b"vault:v1:abc").await.is_err());
        Ok(())
    }
}
