use crate::{cli::globals::GlobalArgs, vault};
use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
    sync::mpsc,
    time::{Duration, sleep},
};
use tracing::{debug, error, instrument, warn};

const MAX_ATTEMPTS: u32 = 3;

/// Renew the next lease at 70-90% of its duration.
fn jittered(lease_duration: u64, rng: &mut StdRng) -> Duration {
    let factor = rng.gen_range(70..90);
    Duration::from_secs(lease_duration * factor / 100)
}

/// Keep the Vault token alive in the background.
///
/// After three consecutive failed renewals the task sends on `tx`, which the server
/// treats as a request for graceful shutdown: without a live token the KMS is gone and
/// every signing operation would fail anyway.
///
/// # Errors
/// Returns an error if the renewal task cannot be set up.
#[instrument(skip(globals, tx))]
pub async fn try_renew(
    globals: &GlobalArgs,
    lease_duration: u64,
    tx: mpsc::UnboundedSender<()>,
) -> Result<()> {
    tokio::spawn({
        let mut rng = StdRng::from_entropy();
        let mut next_renewal = jittered(lease_duration, &mut rng);

        let url = globals.vault_url.clone();
        let token = globals.vault_token.clone();

        async move {
            loop {
                debug!("Will renew token in {} seconds", next_renewal.as_secs());

                sleep(next_renewal).await;

                for attempt in 1..=MAX_ATTEMPTS {
                    let backoff_time = 2u64.pow(attempt - 1);

                    if attempt > 1 {
                        warn!("Backing off for {} seconds", backoff_time);
                        sleep(Duration::from_secs(backoff_time)).await;
                    }

                    match vault::renew_token(&url, &token, None).await {
                        Ok(lease_duration) => {
                            next_renewal = jittered(lease_duration, &mut rng);
                            break;
                        }

                        Err(e) => {
                            error!("Failed to renew token: {}", e);

                            if attempt == MAX_ATTEMPTS {
                                error!("Failed to renew token after {MAX_ATTEMPTS} attempts: {e}");
                                let _ = tx.send(());
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let next = jittered(1000, &mut rng).as_secs();
            assert!((700..900).contains(&next), "{next}");
        }
    }

    #[tokio::test]
    async fn repeated_failures_request_shutdown() -> Result<()> {
        let mut globals = GlobalArgs::new("http://127.0.0.1:1".to_string());
        globals.set_token(SecretString::from("token".to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // A zero lease renews immediately; the two backoffs take three seconds.
        try_renew(&globals, 0, tx).await?;

        assert_eq!(rx.recv().await, Some(()));
        Ok(())
    }
}
