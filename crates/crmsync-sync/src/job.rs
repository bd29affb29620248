use std::fmt;
use std::sync::Arc;

use crmsync_core::{AccessToken, BatchResult, ColumnValue, EntityKind, EntityRow, RawRecord, UpsertOutcome};
use crmsync_crm::{CredentialError, CredentialProvider, FetchError, RecordFetcher};
use crmsync_storage::{EntityStore, StoreError, StoreSession};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dedupe::dedupe;
use crate::entities::EntitySpec;

/// Lifecycle of one pipeline run. `Failed` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    ConnectionVerified,
    TokenAcquired,
    Fetched,
    Deduplicated,
    Applying,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::ConnectionVerified => "connection_verified",
            JobState::TokenAcquired => "token_acquired",
            JobState::Fetched => "fetched",
            JobState::Deduplicated => "deduplicated",
            JobState::Applying => "applying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync job aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    pub fn is_uniqueness_conflict(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_uniqueness_conflict())
    }
}

/// A failed job: the state it was in when it failed and the untouched root cause.
#[derive(Debug, Error)]
#[error("{entity} sync failed during {state}: {error}")]
pub struct JobFailure {
    pub entity: EntityKind,
    pub state: JobState,
    #[source]
    pub error: SyncError,
}

/// One entity pipeline: verify connection, acquire token, fetch, dedupe, validate, upsert.
pub struct SyncJob {
    spec: EntitySpec,
    credentials: Arc<dyn CredentialProvider>,
    fetcher: Arc<dyn RecordFetcher>,
    store: Arc<dyn EntityStore>,
    state: JobState,
}

impl fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncJob")
            .field("entity", &self.spec.kind)
            .field("state", &self.state)
            .finish()
    }
}

impl SyncJob {
    pub fn new(
        spec: EntitySpec,
        credentials: Arc<dyn CredentialProvider>,
        fetcher: Arc<dyn RecordFetcher>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            spec,
            credentials,
            fetcher,
            store,
            state: JobState::Idle,
        }
    }

    pub fn entity(&self) -> EntityKind {
        self.spec.kind
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run to completion or failure. The leased connection is released on every path.
    pub async fn run(mut self) -> Result<BatchResult, JobFailure> {
        match self.execute().await {
            Ok(result) => {
                self.advance(JobState::Completed);
                info!(
                    processed = result.processed_count,
                    errors = result.error_count,
                    unchanged = result.unchanged_count,
                    children_processed = result.children_processed,
                    children_errors = result.children_errors,
                    "sync job completed"
                );
                Ok(result)
            }
            Err(error) => {
                let state = self.state;
                self.advance(JobState::Failed);
                error!(%state, error = %error, "sync job failed");
                Err(JobFailure {
                    entity: self.spec.kind,
                    state,
                    error,
                })
            }
        }
    }

    fn advance(&mut self, next: JobState) {
        debug!(from = %self.state, to = %next, "job state transition");
        self.state = next;
    }

    async fn execute(&mut self) -> Result<BatchResult, SyncError> {
        let mut session = self.store.lease().await?;
        session.ping().await?;
        self.advance(JobState::ConnectionVerified);

        let token = self.credentials.acquire().await?;
        self.advance(JobState::TokenAcquired);

        let records = self.fetcher.fetch(&token, &self.spec.query).await?;
        self.advance(JobState::Fetched);

        let fetched = records.len();
        let records = dedupe(records, self.spec.key_field);
        debug!(fetched, unique = records.len(), "records deduplicated");
        self.advance(JobState::Deduplicated);

        self.advance(JobState::Applying);
        let mut result = BatchResult::default();
        for record in &records {
            self.apply_record(session.as_mut(), &token, record, &mut result)
                .await?;
        }
        Ok(result)
    }

    async fn apply_record(
        &self,
        session: &mut dyn StoreSession,
        token: &AccessToken,
        record: &RawRecord,
        result: &mut BatchResult,
    ) -> Result<(), SyncError> {
        let mut row = match (self.spec.validate)(record) {
            Ok(row) => row,
            Err(skip) => {
                warn!(record_id = ?record.text(self.spec.key_field), reason = %skip, "record skipped");
                result.error_count += 1;
                return Ok(());
            }
        };

        if let Some(lookup) = self.spec.embedded {
            let related = self.fetcher.fetch_related(token, lookup.module, &row.key).await?;
            row.set(lookup.column, ColumnValue::Json(related_json(related)));
        }

        match session.apply(&self.spec.statement, &row).await? {
            UpsertOutcome::Unaffected => {
                debug!(record_id = %row.key, "record unchanged");
                result.unchanged_count += 1;
            }
            outcome => {
                debug!(record_id = %row.key, ?outcome, "record applied");
                result.processed_count += 1;
            }
        }

        self.apply_children(session, token, &row, result).await
    }

    async fn apply_children(
        &self,
        session: &mut dyn StoreSession,
        token: &AccessToken,
        parent: &EntityRow,
        result: &mut BatchResult,
    ) -> Result<(), SyncError> {
        let Some(children) = self.spec.children else {
            return Ok(());
        };

        let records = self
            .fetcher
            .fetch_related(token, children.module, &parent.key)
            .await?;
        for record in &records {
            let row = match (children.validate)(record, &parent.key) {
                Ok(row) => row,
                Err(skip) => {
                    warn!(
                        parent_id = %parent.key,
                        record_id = ?record.text("id"),
                        reason = %skip,
                        "child record skipped"
                    );
                    result.children_errors += 1;
                    continue;
                }
            };
            let outcome = session.apply(&children.statement, &row).await?;
            if outcome.is_processed() {
                result.children_processed += 1;
            }
            debug!(parent_id = %parent.key, record_id = %row.key, ?outcome, "child record applied");
        }
        Ok(())
    }
}

fn related_json(records: Vec<RawRecord>) -> Option<JsonValue> {
    if records.is_empty() {
        return None;
    }
    Some(JsonValue::Array(
        records.into_iter().map(|r| JsonValue::Object(r.into_inner())).collect(),
    ))
}
