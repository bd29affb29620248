use chrono::{DateTime, Utc};
use crmsync_core::{BatchResult, EntityKind};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::job::{JobFailure, JobState, SyncError, SyncJob};

#[derive(Debug)]
pub struct JobOutcome {
    pub entity: EntityKind,
    pub result: Result<BatchResult, JobFailure>,
}

impl JobOutcome {
    fn aborted(entity: EntityKind, reason: String) -> Self {
        Self {
            entity,
            result: Err(JobFailure {
                entity,
                state: JobState::Failed,
                error: SyncError::Aborted(reason),
            }),
        }
    }
}

/// Spawned entities with no outcome, one entry per missing job.
fn unreported(spawned: &[EntityKind], outcomes: &[JobOutcome]) -> Vec<EntityKind> {
    let mut missing = spawned.to_vec();
    for outcome in outcomes {
        if let Some(pos) = missing.iter().position(|entity| *entity == outcome.entity) {
            missing.remove(pos);
        }
    }
    missing
}

/// Per-job outcome table of one run, in completion order.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<JobOutcome>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// First failure in completion order.
    pub fn first_failure(&self) -> Option<&JobFailure> {
        self.outcomes.iter().find_map(|o| o.result.as_ref().err())
    }

    pub fn totals(&self) -> BatchResult {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .fold(BatchResult::default(), |mut acc, r| {
                acc.processed_count += r.processed_count;
                acc.error_count += r.error_count;
                acc.unchanged_count += r.unchanged_count;
                acc.children_processed += r.children_processed;
                acc.children_errors += r.children_errors;
                acc
            })
    }

    /// `Ok` only when every job completed; otherwise the first failure.
    pub fn into_result(self) -> Result<Self, JobFailure> {
        let RunReport {
            run_id,
            started_at,
            finished_at,
            outcomes,
        } = self;
        let mut completed = Vec::with_capacity(outcomes.len());
        for JobOutcome { entity, result } in outcomes {
            let result = result?;
            completed.push(JobOutcome {
                entity,
                result: Ok(result),
            });
        }
        Ok(RunReport {
            run_id,
            started_at,
            finished_at,
            outcomes: completed,
        })
    }
}

/// Runs jobs concurrently. A failing job never cancels its siblings.
#[derive(Debug, Default, Clone, Copy)]
pub struct Orchestrator;

impl Orchestrator {
    pub async fn run_all(&self, jobs: Vec<SyncJob>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = jobs.len();
        info!(%run_id, jobs = total, "sync run started");

        let spawned = jobs.iter().map(SyncJob::entity).collect::<Vec<_>>();
        let mut set = JoinSet::new();
        for job in jobs {
            let entity = job.entity();
            let span = info_span!("sync_job", %entity, %run_id);
            set.spawn(async move {
                // Nested task so a panic is attributed to its entity.
                match tokio::spawn(job.run().instrument(span)).await {
                    Ok(result) => JobOutcome { entity, result },
                    Err(join_err) => JobOutcome::aborted(entity, join_err.to_string()),
                }
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        let mut lost = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    error!(%run_id, error = %join_err, "sync task lost");
                    lost = Some(join_err.to_string());
                }
            }
        }
        for entity in unreported(&spawned, &outcomes) {
            let reason = lost
                .clone()
                .unwrap_or_else(|| "sync task ended without an outcome".to_string());
            outcomes.push(JobOutcome::aborted(entity, reason));
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };

        if report.is_success() {
            let totals = report.totals();
            info!(
                %run_id,
                jobs = total,
                processed = totals.processed_count,
                errors = totals.error_count,
                unchanged = totals.unchanged_count,
                "all sync jobs completed"
            );
        } else {
            for outcome in &report.outcomes {
                if let Err(failure) = &outcome.result {
                    error!(
                        %run_id,
                        entity = %failure.entity,
                        state = %failure.state,
                        error = %failure.error,
                        "sync job failed"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::entities::EntitySpec;
    use crate::testing::{FakeCredentials, FakeFetcher};
    use crmsync_storage::MemoryStore;
    use serde_json::json;

    fn job(kind: EntityKind, credentials: FakeCredentials, fetcher: FakeFetcher, store: &MemoryStore) -> SyncJob {
        SyncJob::new(
            EntitySpec::for_kind(kind),
            Arc::new(credentials),
            Arc::new(fetcher),
            Arc::new(store.clone()),
        )
    }

    #[tokio::test]
    async fn all_jobs_complete() {
        let store = MemoryStore::new();
        let jobs = vec![
            job(
                EntityKind::Cities,
                FakeCredentials::ok(),
                FakeFetcher::with_records(vec![json!({"Ciudad.id": "10", "Ciudad.Name": "Bogota"})]),
                &store,
            ),
            job(
                EntityKind::ProjectAttributes,
                FakeCredentials::ok(),
                FakeFetcher::with_records(vec![json!({"id": "5", "Nombre_atributo": "Gym"})]),
                &store,
            ),
        ];

        let report = Orchestrator.run_all(jobs).await;

        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.totals().processed_count, 2);
        assert!(report.finished_at >= report.started_at);
        assert!(report.into_result().is_ok());
        assert_eq!(store.open_leases(), 0);
    }

    #[test]
    fn lost_jobs_are_reported_as_aborted_failures() {
        let spawned = [EntityKind::Cities, EntityKind::Projects, EntityKind::Cities];
        let mut outcomes = vec![JobOutcome {
            entity: EntityKind::Cities,
            result: Ok(BatchResult::default()),
        }];

        let missing = unreported(&spawned, &outcomes);
        assert_eq!(missing, vec![EntityKind::Projects, EntityKind::Cities]);

        outcomes.extend(
            missing
                .into_iter()
                .map(|entity| JobOutcome::aborted(entity, "task cancelled".to_string())),
        );
        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes,
        };
        assert!(!report.is_success());
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.entity, EntityKind::Projects);
        assert_eq!(failure.state, JobState::Failed);
        assert!(matches!(&failure.error, SyncError::Aborted(reason) if reason == "task cancelled"));
    }

    #[tokio::test]
    async fn one_failure_does_not_cancel_siblings() {
        let store = MemoryStore::new();
        let jobs = vec![
            job(
                EntityKind::Cities,
                FakeCredentials::failing(),
                FakeFetcher::with_records(vec![]),
                &store,
            ),
            job(
                EntityKind::ProjectAttributes,
                FakeCredentials::ok(),
                FakeFetcher::with_records(vec![json!({"id": "5", "Nombre_atributo": "Gym"})]),
                &store,
            ),
            job(
                EntityKind::MegaProjects,
                FakeCredentials::ok(),
                FakeFetcher::failing(),
                &store,
            ),
        ];

        let report = Orchestrator.run_all(jobs).await;

        assert!(!report.is_success());
        assert_eq!(report.outcomes.len(), 3);
        let completed = report
            .outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.entity)
            .collect::<Vec<_>>();
        assert_eq!(completed, vec![EntityKind::ProjectAttributes]);
        assert!(store.row("Project_Attributes", "5").is_some());

        let first = report.first_failure().unwrap().entity;
        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.entity, first);
        assert!(matches!(
            failure.error,
            SyncError::Credential(_) | SyncError::Fetch(_)
        ));
    }

    #[tokio::test]
    async fn panicking_job_is_reported_as_aborted() {
        let store = MemoryStore::new();
        let jobs = vec![
            job(
                EntityKind::Cities,
                FakeCredentials::panicking(),
                FakeFetcher::with_records(vec![]),
                &store,
            ),
            job(
                EntityKind::ProjectAttributes,
                FakeCredentials::ok(),
                FakeFetcher::with_records(vec![]),
                &store,
            ),
        ];

        let report = Orchestrator.run_all(jobs).await;

        assert_eq!(report.outcomes.len(), 2);
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.entity, EntityKind::Cities);
        assert!(matches!(failure.error, SyncError::Aborted(_)));
        assert_eq!(store.open_leases(), 0);
    }

    #[tokio::test]
    async fn empty_job_list_is_a_success() {
        let report = Orchestrator.run_all(Vec::new()).await;
        assert!(report.is_success());
        assert!(report.outcomes.is_empty());
    }
}
