//! CRM to Postgres sync pipeline: one generic job per entity, run concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crmsync_core::EntityKind;
use crmsync_crm::{
    build_http_client, CoqlFetcher, CredentialProvider, HttpClientConfig, OAuthClientConfig,
    RecordFetcher, ZohoCredentialProvider, DEFAULT_API_BASE_URL, DEFAULT_TOKEN_URL,
};
use crmsync_storage::{DatabaseConfig, EntityStore, PgStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub mod dedupe;
pub mod entities;
pub mod job;
pub mod orchestrator;
pub mod validate;

#[cfg(test)]
mod testing;

pub use dedupe::dedupe;
pub use entities::EntitySpec;
pub use job::{JobFailure, JobState, SyncError, SyncJob};
pub use orchestrator::{JobOutcome, Orchestrator, RunReport};
pub use validate::ValidationSkip;

pub const CRATE_NAME: &str = "crmsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub oauth: OAuthClientConfig,
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or unparsable values take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let db_defaults = DatabaseConfig::default();

        let database = DatabaseConfig {
            url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            host: text("PG_HOST", db_defaults.host.as_str()),
            port: lookup("PG_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(db_defaults.port),
            database: text("PG_DATABASE", db_defaults.database.as_str()),
            user: text("PG_USER", db_defaults.user.as_str()),
            password: text("PG_PASSWORD", db_defaults.password.as_str()),
            require_tls: lookup("PG_SSL").is_some_and(|v| parse_flag(&v)),
            max_connections: lookup("PG_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(db_defaults.max_connections),
            acquire_timeout: db_defaults.acquire_timeout,
        };

        let oauth = OAuthClientConfig {
            token_url: text("ZOHO_TOKEN_URL", DEFAULT_TOKEN_URL),
            client_id: text("ZOHO_CLIENT_ID", ""),
            client_secret: text("ZOHO_CLIENT_SECRET", ""),
            refresh_token: text("ZOHO_REFRESH_TOKEN", ""),
        };

        Self {
            database,
            oauth,
            api_base_url: text("ZOHO_API_BASE_URL", DEFAULT_API_BASE_URL),
            http_timeout_secs: lookup("CRMSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scheduler_enabled: lookup("CRMSYNC_SCHEDULER_ENABLED").is_some_and(|v| parse_flag(&v)),
            sync_cron: text("CRMSYNC_SYNC_CRON", "0 0 */6 * * *"),
        }
    }
}

/// Wires the shared collaborators into one job per selected entity.
pub struct SyncService {
    credentials: Arc<dyn CredentialProvider>,
    fetcher: Arc<dyn RecordFetcher>,
    store: Arc<dyn EntityStore>,
    entities: Vec<EntityKind>,
}

impl SyncService {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        fetcher: Arc<dyn RecordFetcher>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            credentials,
            fetcher,
            store,
            entities: EntityKind::ALL.to_vec(),
        }
    }

    /// Zoho credentials and COQL fetcher over one HTTP client, with the given store.
    pub fn with_store(config: &SyncConfig, store: Arc<dyn EntityStore>) -> Result<Self> {
        let http = build_http_client(&HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })
        .context("building CRM http client")?;
        let credentials = ZohoCredentialProvider::new(http.clone(), config.oauth.clone());
        let fetcher = CoqlFetcher::new(http, config.api_base_url.clone());
        Ok(Self::new(Arc::new(credentials), Arc::new(fetcher), store))
    }

    /// Production wiring: Zoho over HTTP and a lazily connected Postgres pool.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = PgStore::connect_lazy(&config.database).context("configuring postgres pool")?;
        Self::with_store(config, Arc::new(store))
    }

    /// Restrict the run to `entities`; an empty list keeps every entity.
    pub fn only(mut self, entities: Vec<EntityKind>) -> Self {
        if !entities.is_empty() {
            let mut entities = entities;
            entities.sort();
            entities.dedup();
            self.entities = entities;
        }
        self
    }

    pub fn entities(&self) -> &[EntityKind] {
        &self.entities
    }

    pub fn jobs(&self) -> Vec<SyncJob> {
        self.entities
            .iter()
            .map(|kind| {
                SyncJob::new(
                    EntitySpec::for_kind(*kind),
                    Arc::clone(&self.credentials),
                    Arc::clone(&self.fetcher),
                    Arc::clone(&self.store),
                )
            })
            .collect()
    }

    pub async fn run_once(&self) -> RunReport {
        Orchestrator.run_all(self.jobs()).await
    }
}

/// Cron scheduler running `service` on `config.sync_cron`, when enabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    service: Arc<SyncService>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            let report = service.run_once().await;
            if let Some(failure) = report.first_failure() {
                error!(run_id = %report.run_id, error = %failure, "scheduled sync failed");
            } else {
                info!(run_id = %report.run_id, "scheduled sync completed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(%cron, "sync scheduler configured");
    Ok(Some(sched))
}
