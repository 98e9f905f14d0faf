use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_VAULT_URL: &str = "vault-url";
pub const ARG_VAULT_ROLE_ID: &str = "vault-role-id";
pub const ARG_VAULT_SECRET_ID: &str = "vault-secret-id";
pub const ARG_VAULT_WRAPPED_TOKEN: &str = "vault-wrapped-token";
pub const ARG_VAULT_APPROLE_MOUNT: &str = "vault-approle-mount";
pub const ARG_VAULT_TRANSIT_MOUNT: &str = "vault-transit-mount";
pub const ARG_KMS_KEY_ID: &str = "kms-key-id";
pub const ARG_LOCAL_KMS_KEY: &str = "local-kms-key";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VAULT_URL)
                .long(ARG_VAULT_URL)
                .help("Vault base URL (http(s)://host:port)")
                .env("PORTCULLIS_VAULT_URL")
                .global(true),
        )
        .arg(
            Arg::new(ARG_VAULT_ROLE_ID)
                .long(ARG_VAULT_ROLE_ID)
                .help("Vault AppRole role id")
                .env("PORTCULLIS_VAULT_ROLE_ID")
                .global(true),
        )
        .arg(
            Arg::new(ARG_VAULT_SECRET_ID)
                .long(ARG_VAULT_SECRET_ID)
                .help("Vault AppRole secret id")
                .env("PORTCULLIS_VAULT_SECRET_ID")
                .conflicts_with(ARG_VAULT_WRAPPED_TOKEN)
                .global(true),
        )
        .arg(
            Arg::new(ARG_VAULT_WRAPPED_TOKEN)
                .long(ARG_VAULT_WRAPPED_TOKEN)
                .help("Vault wrapped token holding the AppRole secret id")
                .env("PORTCULLIS_VAULT_WRAPPED_TOKEN")
                .global(true),
        )
        .arg(
            Arg::new(ARG_VAULT_APPROLE_MOUNT)
                .long(ARG_VAULT_APPROLE_MOUNT)
                .help("Vault AppRole auth mount")
                .env("PORTCULLIS_VAULT_APPROLE_MOUNT")
                .default_value("approle")
                .global(true),
        )
        .arg(
            Arg::new(ARG_VAULT_TRANSIT_MOUNT)
                .long(ARG_VAULT_TRANSIT_MOUNT)
                .help("Vault transit engine mount used to wrap signing keys")
                .env("PORTCULLIS_VAULT_TRANSIT_MOUNT")
                .default_value("transit")
                .global(true),
        )
        .arg(
            Arg::new(ARG_KMS_KEY_ID)
                .long(ARG_KMS_KEY_ID)
                .help("Name of the master key signing keys are wrapped under")
                .env("PORTCULLIS_KMS_KEY_ID")
                .default_value("portcullis-signing")
                .global(true),
        )
        .arg(
            Arg::new(ARG_LOCAL_KMS_KEY)
                .long(ARG_LOCAL_KMS_KEY)
                .help("Base64 32-byte key for the in-process KMS (development only)")
                .env("PORTCULLIS_LOCAL_KMS_KEY")
                .hide_env_values(true)
                .conflicts_with(ARG_VAULT_URL)
                .global(true),
        )
}

/// Vault connection and `AppRole` credentials.
#[derive(Debug)]
pub struct Options {
    pub url: String,
    pub role_id: String,
    pub secret_id: Option<SecretString>,
    pub wrapped_token: Option<SecretString>,
    pub approle_mount: String,
    pub transit_mount: String,
}

/// Where signing keys get wrapped.
#[derive(Debug)]
pub enum KmsOptions {
    Local(SecretString),
    Vault(Options),
}

impl KmsOptions {
    /// # Errors
    /// Returns an error if neither a local key nor a complete set of Vault arguments is present.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        if let Some(key) = matches.get_one::<String>(ARG_LOCAL_KMS_KEY) {
            return Ok(Self::Local(SecretString::from(key.clone())));
        }

        let url = matches
            .get_one::<String>(ARG_VAULT_URL)
            .cloned()
            .context("missing required argument: --vault-url (or --local-kms-key)")?;
        let role_id = matches
            .get_one::<String>(ARG_VAULT_ROLE_ID)
            .cloned()
            .with_context(|| format!("missing required argument: --{ARG_VAULT_ROLE_ID}"))?;
        let secret_id = matches
            .get_one::<String>(ARG_VAULT_SECRET_ID)
            .map(|s| SecretString::from(s.clone()));
        let wrapped_token = matches
            .get_one::<String>(ARG_VAULT_WRAPPED_TOKEN)
            .map(|s| SecretString::from(s.clone()));
        if secret_id.is_none() && wrapped_token.is_none() {
            return Err(anyhow!(
                "missing required argument: --{ARG_VAULT_SECRET_ID} or --{ARG_VAULT_WRAPPED_TOKEN}"
            ));
        }

        Ok(Self::Vault(Options {
            url,
            role_id,
            secret_id,
            wrapped_token,
            approle_mount: string_or(matches, ARG_VAULT_APPROLE_MOUNT, "approle"),
            transit_mount: string_or(matches, ARG_VAULT_TRANSIT_MOUNT, "transit"),
        }))
    }
}

pub(crate) fn string_or(matches: &ArgMatches, id: &str, default: &str) -> String {
    matches
        .get_one::<String>(id)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}
