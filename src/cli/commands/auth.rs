use crate::{api::AuthConfig, keys::KeyPolicy};
use anyhow::{Result, anyhow};
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};

pub const ARG_ISSUER: &str = "issuer";
pub const ARG_ALLOWED_HOSTS: &str = "allowed-hosts";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_INTERMEDIATE_SESSION_TTL: &str = "intermediate-session-ttl-seconds";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_KEY_ROTATE_AFTER: &str = "key-rotate-after-seconds";
pub const ARG_KEY_LIFETIME: &str = "key-lifetime-seconds";

/// Issuance tunables, only meaningful to `serve`.
#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Issuer (iss) of access tokens")
                .env("PORTCULLIS_ISSUER")
                .default_value(env!("CARGO_PKG_NAME")),
        )
        .arg(
            Arg::new(ARG_ALLOWED_HOSTS)
                .long(ARG_ALLOWED_HOSTS)
                .help("Comma separated Host header values to accept (default: any)")
                .env("PORTCULLIS_ALLOWED_HOSTS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token TTL in seconds")
                .env("PORTCULLIS_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_INTERMEDIATE_SESSION_TTL)
                .long(ARG_INTERMEDIATE_SESSION_TTL)
                .help("Intermediate session and email challenge TTL in seconds")
                .env("PORTCULLIS_INTERMEDIATE_SESSION_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Session (refresh token) TTL in seconds")
                .env("PORTCULLIS_SESSION_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
}

/// Key rotation policy, shared by `serve` and `rotate-keys`.
#[must_use]
pub fn with_key_policy_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_KEY_ROTATE_AFTER)
                .long(ARG_KEY_ROTATE_AFTER)
                .help("Age in seconds after which a new signing key becomes current")
                .env("PORTCULLIS_KEY_ROTATE_AFTER_SECONDS")
                .default_value("21600")
                .value_parser(clap::value_parser!(i64))
                .global(true),
        )
        .arg(
            Arg::new(ARG_KEY_LIFETIME)
                .long(ARG_KEY_LIFETIME)
                .help("Age in seconds at which a signing key stops verifying")
                .env("PORTCULLIS_KEY_LIFETIME_SECONDS")
                .default_value("25200")
                .value_parser(clap::value_parser!(i64))
                .global(true),
        )
}

fn seconds(matches: &ArgMatches, id: &str, default: i64) -> Result<Duration> {
    let value = matches.get_one::<i64>(id).copied().unwrap_or(default);
    if value <= 0 {
        return Err(anyhow!("--{id} must be positive"));
    }
    Ok(Duration::seconds(value))
}

/// # Errors
/// Returns an error if a duration is not positive or keys would expire before rotation.
pub fn key_policy(matches: &ArgMatches) -> Result<KeyPolicy> {
    let policy = KeyPolicy {
        rotate_after: seconds(matches, ARG_KEY_ROTATE_AFTER, 21_600)?,
        lifetime: seconds(matches, ARG_KEY_LIFETIME, 25_200)?,
    };
    // The previous key must outlive the tokens it signed before rotation.
    if policy.lifetime <= policy.rotate_after {
        return Err(anyhow!(
            "--{ARG_KEY_LIFETIME} must be greater than --{ARG_KEY_ROTATE_AFTER}"
        ));
    }
    Ok(policy)
}

/// # Errors
/// Returns an error if any tunable is out of range.
pub fn auth_config(matches: &ArgMatches, kms_key_id: String) -> Result<AuthConfig> {
    let defaults = AuthConfig::default();
    Ok(AuthConfig {
        issuer: matches
            .get_one::<String>(ARG_ISSUER)
            .cloned()
            .unwrap_or(defaults.issuer),
        allowed_hosts: matches
            .get_many::<String>(ARG_ALLOWED_HOSTS)
            .map(|hosts| {
                hosts
                    .map(|host| host.trim().to_string())
                    .filter(|host| !host.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        kms_key_id,
        access_token_ttl: seconds(matches, ARG_ACCESS_TOKEN_TTL, 300)?,
        intermediate_session_ttl: seconds(matches, ARG_INTERMEDIATE_SESSION_TTL, 900)?,
        session_ttl: seconds(matches, ARG_SESSION_TTL, 604_800)?,
        key_policy: key_policy(matches)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        with_key_policy_args(with_args(Command::new("portcullis")))
    }

    #[test]
    fn defaults_match_auth_config() -> Result<()> {
        let matches = command().try_get_matches_from(["portcullis"])?;
        let config = auth_config(&matches, "signing".to_string())?;
        assert_eq!(config.access_token_ttl, Duration::seconds(300));
        assert_eq!(config.intermediate_session_ttl, Duration::seconds(900));
        assert_eq!(config.session_ttl, Duration::days(7));
        assert_eq!(config.key_policy, KeyPolicy::default());
        assert!(config.allowed_hosts.is_empty());
        Ok(())
    }

    #[test]
    fn allowed_hosts_split_on_commas() -> Result<()> {
        let matches = command().try_get_matches_from([
            "portcullis",
            "--allowed-hosts",
            "auth.example.com,api.example.com",
        ])?;
        let config = auth_config(&matches, "signing".to_string())?;
        assert_eq!(
            config.allowed_hosts,
            vec!["auth.example.com".to_string(), "api.example.com".to_string()]
        );
        Ok(())
    }

    #[test]
    fn lifetime_must_exceed_rotation() -> Result<()> {
        let matches = command().try_get_matches_from([
            "portcullis",
            "--key-rotate-after-seconds",
            "3600",
            "--key-lifetime-seconds",
            "3600",
        ])?;
        assert!(key_policy(&matches).is_err());

        let matches =
            command().try_get_matches_from(["portcullis", "--access-token-ttl-seconds", "0"])?;
        assert!(auth_config(&matches, "signing".to_string()).is_err());
        Ok(())
    }
}
