use super::{VerificationKey, VerificationKeySource};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::debug;

/// Read-through cache of verification keys by `kid`.
///
/// Public keys are immutable once written, so an entry only goes stale when its key
/// expires: entries at or past their expire time are evicted on lookup and never served.
/// Misses are not cached, a key created after a miss is found on the next call.
pub struct VerificationKeyCache {
    source: Arc<dyn VerificationKeySource>,
    entries: RwLock<HashMap<String, VerificationKey>>,
}

impl VerificationKeyCache {
    #[must_use]
    pub fn new(source: Arc<dyn VerificationKeySource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .map_err(|_| anyhow!("Poisoned lock"))?
            .len())
    }

    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    fn cached(&self, kid: &str, now: DateTime<Utc>) -> Result<Option<VerificationKey>> {
        let entries = self.entries.read().map_err(|_| anyhow!("Poisoned lock"))?;
        Ok(entries.get(kid).filter(|key| key.is_live(now)).cloned())
    }
}

#[async_trait]
impl VerificationKeySource for VerificationKeyCache {
    async fn verification_key(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationKey>> {
        if let Some(key) = self.cached(kid, now)? {
            return Ok(Some(key));
        }

        // Drop whatever is there; it is either absent or expired.
        {
            let mut entries = self.entries.write().map_err(|_| anyhow!("Poisoned lock"))?;
            if entries.remove(kid).is_some() {
                debug!(kid, "Evicted expired verification key");
            }
        }

        let key = self.source.verification_key(kid, now).await?;
        if let Some(key) = &key {
            if key.is_live(now) {
                let mut entries = self.entries.write().map_err(|_| anyhow!("Poisoned lock"))?;
                entries.insert(kid.to_string(), key.clone());
            }
        }
        Ok(key.filter(|key| key.is_live(now)))
    }
}
