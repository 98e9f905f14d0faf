//! KMS backend and database pool setup shared by every action.

use crate::{
    cli::{commands::vault::KmsOptions, globals::GlobalArgs},
    kms::{Kms, LocalKms, VaultTransit},
    vault,
};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// A connected KMS; `vault` carries the session to keep renewed.
pub struct Connected {
    pub kms: Arc<dyn Kms>,
    pub vault: Option<(GlobalArgs, u64)>,
}

/// Build the KMS backend, logging in to Vault when it is the backend.
///
/// # Errors
/// Returns an error if the local key is malformed or the Vault login fails.
pub async fn connect(options: &KmsOptions) -> Result<Connected> {
    match options {
        KmsOptions::Local(key) => {
            info!("Using the local KMS, signing keys are wrapped in-process");
            Ok(Connected {
                kms: Arc::new(LocalKms::from_base64(key.expose_secret())?),
                vault: None,
            })
        }
        KmsOptions::Vault(opts) => {
            let mut globals = GlobalArgs::new(opts.url.clone());
            let login_url = vault::approle_login_url(&globals.vault_url, &opts.approle_mount)?;

            // If vault wrapped token try to unwrap, otherwise use secret-id.
            let (token, lease_duration) = if let Some(wrapped) = &opts.wrapped_token {
                let secret_id = vault::unwrap(&globals.vault_url, wrapped.expose_secret()).await?;
                vault::approle_login(&login_url, &secret_id, &opts.role_id).await?
            } else {
                let secret_id = opts
                    .secret_id
                    .as_ref()
                    .context("Vault secret-id is required")?;
                vault::approle_login(&login_url, secret_id.expose_secret(), &opts.role_id).await?
            };

            globals.set_token(token.clone());
            debug!("Global args: {:?}", globals);

            let transit = VaultTransit::new(&globals.vault_url, &opts.transit_mount, token)?;
            Ok(Connected {
                kms: Arc::new(transit),
                vault: Some((globals, lease_duration)),
            })
        }
    }
}

/// # Errors
/// Returns an error if the database is unreachable.
pub async fn connect_pool(dsn: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")
}
