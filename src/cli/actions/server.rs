use crate::{
    api::{self, AuthConfig, email::LogCodeSender},
    cli::{actions::kms, commands::vault::KmsOptions},
    store::PgStore,
    vault,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub kms: KmsOptions,
    pub auth: AuthConfig,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the KMS login fails, the database is unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let (tx, rx) = mpsc::unbounded_channel::<()>();

    let connected = kms::connect(&args.kms).await?;

    // Renew vault token, gracefully shutdown if failed
    if let Some((globals, lease_duration)) = &connected.vault {
        vault::renew::try_renew(globals, *lease_duration, tx.clone()).await?;
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            let _ = tx.send(());
        }
    });

    let pool = kms::connect_pool(&args.dsn).await?;
    let services = api::Services::new(
        Arc::new(PgStore::new(pool)),
        connected.kms,
        &args.auth,
        Arc::new(LogCodeSender),
    );

    api::serve(args.port, &services, rx).await
}

fn log_startup_args(args: &Args) {
    let kms = match &args.kms {
        KmsOptions::Local(_) => "local".to_string(),
        KmsOptions::Vault(opts) => format!("vault {} ({})", opts.url, opts.transit_mount),
    };
    info!(
        port = args.port,
        dsn = %redact_dsn(&args.dsn),
        kms = %kms,
        kms_key_id = %args.auth.kms_key_id,
        issuer = %args.auth.issuer,
        allowed_hosts = ?args.auth.allowed_hosts,
        "Startup configuration"
    );
}

pub(crate) fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}
