#![allow(dead_code)]

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use portcullis::{
    api::{
        AuthConfig, Services,
        email::{CodeSender, VerificationCode},
    },
    keys::{SigningKeyStore, TokenClass},
    kms::LocalKms,
    store::{MemoryStore, Organization, Project},
};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const MASTER_KEY: [u8; 32] = [7; 32];

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Captures every code handed out.
#[derive(Default)]
pub struct Outbox(Mutex<Vec<VerificationCode>>);

impl CodeSender for Outbox {
    fn send(&self, message: &VerificationCode) -> Result<()> {
        self.0
            .lock()
            .map_err(|_| anyhow!("Poisoned lock"))?
            .push(message.clone());
        Ok(())
    }
}

impl Outbox {
    pub fn last(&self) -> Result<VerificationCode> {
        self.0
            .lock()
            .map_err(|_| anyhow!("Poisoned lock"))?
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("no code was sent"))
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|codes| codes.len()).unwrap_or_default()
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub outbox: Arc<Outbox>,
    pub config: AuthConfig,
    pub services: Services,
    pub project: Project,
    pub organization: Organization,
}

pub fn project(log_in_with_email: bool, now: DateTime<Utc>) -> Project {
    Project {
        id: Uuid::new_v4(),
        display_name: "Acme".to_string(),
        log_in_with_email,
        log_in_with_google: false,
        log_in_with_microsoft: false,
        google_oauth_client_id: None,
        microsoft_oauth_client_id: None,
        create_time: now,
    }
}

pub fn organization(project_id: Uuid, now: DateTime<Utc>) -> Organization {
    Organization {
        id: Uuid::new_v4(),
        project_id,
        display_name: "Acme Staff".to_string(),
        log_in_with_email: true,
        log_in_with_google: false,
        log_in_with_microsoft: false,
        log_in_with_password: false,
        create_time: now,
    }
}

impl Fixture {
    /// One project with one organization and current keys of both classes at `now`.
    pub async fn new(now: DateTime<Utc>) -> Result<Self> {
        Self::with_config(AuthConfig::default(), now).await
    }

    pub async fn with_config(config: AuthConfig, now: DateTime<Utc>) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());

        let project = project(true, now);
        store.insert_project(project.clone())?;
        let organization = organization(project.id, now);
        store.insert_organization(organization.clone())?;

        let services = Services::new(
            store.clone(),
            Arc::new(LocalKms::new(&MASTER_KEY)),
            &config,
            outbox.clone(),
        );
        for class in [TokenClass::Session, TokenClass::IntermediateSession] {
            services
                .state
                .keys
                .create_signing_key(project.id, class, now)
                .await?;
        }

        Ok(Self {
            store,
            outbox,
            config,
            services,
            project,
            organization,
        })
    }

    pub fn keys(&self) -> &Arc<SigningKeyStore> {
        &self.services.state.keys
    }

    /// Add another project with its own organization and keys.
    pub async fn add_project(&self, now: DateTime<Utc>) -> Result<(Project, Organization)> {
        let project = project(true, now);
        self.store.insert_project(project.clone())?;
        let organization = organization(project.id, now);
        self.store.insert_organization(organization.clone())?;
        for class in [TokenClass::Session, TokenClass::IntermediateSession] {
            self.keys()
                .create_signing_key(project.id, class, now)
                .await?;
        }
        Ok((project, organization))
    }
}
