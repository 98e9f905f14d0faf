use crate::{
    cli::{actions::kms, commands::vault::KmsOptions},
    ids::{self, IdKind},
    keys::{KeyPolicy, SigningKeyStore, TokenClass},
    store::{PgStore, SignInRepository},
};
use anyhow::{Result, anyhow};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub struct Args {
    pub project_id: Uuid,
    pub dsn: String,
    pub kms: KmsOptions,
    pub kms_key_id: String,
    pub key_policy: KeyPolicy,
}

/// Create a fresh signing key for each token class whose current key is due.
///
/// Meant to run on a schedule shorter than the rotation interval.
///
/// # Errors
/// Returns an error if the project does not exist, or the KMS or database fails.
pub async fn execute(args: Args) -> Result<()> {
    let connected = kms::connect(&args.kms).await?;
    let store = Arc::new(PgStore::new(kms::connect_pool(&args.dsn).await?));

    let project = ids::format(IdKind::Project, args.project_id);
    if store.get_project(args.project_id).await?.is_none() {
        return Err(anyhow!("project {project} not found"));
    }

    let keys = SigningKeyStore::new(store, connected.kms, args.kms_key_id, args.key_policy);
    let now = Utc::now();
    for class in [TokenClass::Session, TokenClass::IntermediateSession] {
        match keys.rotate_if_due(args.project_id, class, now).await? {
            Some(record) => info!(
                project_id = %project,
                class = class.as_str(),
                kid = %ids::format(class.key_kind(), record.id),
                expire_time = %record.expire_time,
                "Rotated signing key"
            ),
            None => info!(project_id = %project, class = class.as_str(), "Signing key is current"),
        }
    }
    Ok(())
}
