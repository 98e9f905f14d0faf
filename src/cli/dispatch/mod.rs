//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to a typed [`Action`]; nothing here touches the network.

use crate::cli::actions::{Action, rotate, server};
use crate::cli::commands::{ARG_DSN, ARG_PORT, ARG_PROJECT_ID, CMD_ROTATE_KEYS, CMD_SERVE};
use crate::cli::commands::{auth, vault};
use crate::ids::{self, IdKind};
use anyhow::{Context, Result, anyhow};
use clap::ArgMatches;

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("missing subcommand"))?;

    let dsn = sub
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let kms = vault::KmsOptions::parse(sub)?;
    let kms_key_id = vault::string_or(sub, vault::ARG_KMS_KEY_ID, "portcullis-signing");

    match name {
        CMD_SERVE => Ok(Action::Server(server::Args {
            port: sub.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080),
            dsn,
            kms,
            auth: auth::auth_config(sub, kms_key_id)?,
        })),
        CMD_ROTATE_KEYS => {
            let project = sub
                .get_one::<String>(ARG_PROJECT_ID)
                .context("missing required argument: --project-id")?;
            let project_id = ids::parse_as(IdKind::Project, project)
                .map_err(|_| anyhow!("invalid --{ARG_PROJECT_ID}: {project}"))?;
            Ok(Action::RotateKeys(rotate::Args {
                project_id,
                dsn,
                kms,
                kms_key_id,
                key_policy: auth::key_policy(sub)?,
            }))
        }
        other => Err(anyhow!("unknown subcommand: {other}")),
    }
}
