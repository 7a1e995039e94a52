//! Job snapshots for API readers.
//!
//! Process-lifetime map from job id to the latest [`JobSnapshot`], with an
//! optional JSON file that survives restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::job::{FailureReason, JobFailure, JobId, JobSnapshot, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("result store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("result store file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

struct Entry {
    snapshot: JobSnapshot,
    terminal_since: Option<Instant>,
}

impl Entry {
    fn new(snapshot: JobSnapshot) -> Self {
        let terminal_since = snapshot.status.is_terminal().then(Instant::now);
        Self {
            snapshot,
            terminal_since,
        }
    }
}

pub struct ResultStore {
    retention: Duration,
    path: Option<PathBuf>,
    entries: RwLock<HashMap<JobId, Entry>>,
}

impl ResultStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Back the store with a JSON file, loading whatever it already holds.
    ///
    /// Jobs that were still in flight when the file was written cannot be
    /// resumed; they are recorded as failed.
    pub async fn open(retention: Duration, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let store = Self {
            path: Some(path.clone()),
            ..Self::new(retention)
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "result_store_empty");
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshots: Vec<JobSnapshot> = serde_json::from_slice(&bytes)?;
        let mut recovered = 0usize;
        {
            let mut entries = store.entries.write().await;
            for mut snapshot in snapshots {
                if !snapshot.status.is_terminal() {
                    recovered += 1;
                    snapshot.status = JobStatus::Failed;
                    snapshot.updated_at = Utc::now();
                    snapshot.error = Some(JobFailure::new(
                        FailureReason::OrchestratorRestarted,
                        "job was in flight when the process stopped",
                    ));
                }
                entries.insert(snapshot.job_id.clone(), Entry::new(snapshot));
            }
            info!(
                path = %path.display(),
                loaded = entries.len(),
                recovered = recovered,
                "result_store_loaded"
            );
        }
        Ok(store)
    }

    /// Record `snapshot` as the latest state of its job.
    ///
    /// Returns `false` if the write was dropped because it would move the job
    /// backwards (an older snapshot arriving late, or anything after a
    /// terminal state).
    pub async fn put(&self, snapshot: JobSnapshot) -> bool {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&snapshot.job_id) {
            let current = existing.snapshot.status;
            if current.is_terminal() || snapshot.status.rank() < current.rank() {
                debug!(
                    job_id = %snapshot.job_id,
                    current = %current,
                    rejected = %snapshot.status,
                    "result_store_stale_write"
                );
                return false;
            }
        }
        entries.insert(snapshot.job_id.clone(), Entry::new(snapshot));
        true
    }

    pub async fn get(&self, job_id: &JobId) -> Result<JobSnapshot, StoreError> {
        self.entries
            .read()
            .await
            .get(job_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop snapshots that have been terminal for longer than the retention
    /// window.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| match entry.terminal_since {
            Some(since) => now.duration_since(since) < self.retention,
            None => true,
        });
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed = removed, remaining = entries.len(), "result_store_swept");
        }
        removed
    }

    /// Write every snapshot to the backing file, if there is one.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshots: Vec<JobSnapshot> = {
            let entries = self.entries.read().await;
            let mut snapshots: Vec<_> = entries.values().map(|e| e.snapshot.clone()).collect();
            snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            snapshots
        };
        let bytes = serde_json::to_vec_pretty(&snapshots)?;
        write_atomically(path, &bytes).await?;
        debug!(path = %path.display(), count = snapshots.len(), "result_store_persisted");
        Ok(())
    }

    /// Sweep (and persist) every `every`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                store.sweep().await;
                if let Err(e) = store.persist().await {
                    warn!(error = %e, "result_store_persist_failed");
                }
            }
        })
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobResult;
    use std::collections::BTreeMap;

    fn snapshot(id: &str, status: JobStatus) -> JobSnapshot {
        JobSnapshot {
            job_id: JobId::from(id),
            status,
            correlation_key: id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            attempt: 0,
            error: None,
            result: None,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mailflow-{}-{}.json", name, uuid::Uuid::new_v4().simple()))
    }

    #[tokio::test]
    async fn test_put_get_last_write_wins() {
        let store = ResultStore::new(Duration::from_secs(60));
        store.put(snapshot("a", JobStatus::AwaitingMail)).await;

        let mut running = snapshot("a", JobStatus::RunningWorkflow);
        running.attempt = 1;
        assert!(store.put(running).await);

        let mut retry = snapshot("a", JobStatus::RunningWorkflow);
        retry.attempt = 2;
        assert!(store.put(retry).await);

        let got = store.get(&JobId::from("a")).await.unwrap();
        assert_eq!(got.status, JobStatus::RunningWorkflow);
        assert_eq!(got.attempt, 2);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = ResultStore::new(Duration::from_secs(60));
        let err = store.get(&JobId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id.as_str() == "nope"));
    }

    #[tokio::test]
    async fn test_regressing_write_ignored() {
        let store = ResultStore::new(Duration::from_secs(60));
        store.put(snapshot("a", JobStatus::RunningWorkflow)).await;
        assert!(!store.put(snapshot("a", JobStatus::AwaitingMail)).await);

        store.put(snapshot("a", JobStatus::Failed)).await;
        assert!(!store.put(snapshot("a", JobStatus::Succeeded)).await);
        assert_eq!(store.get(&JobId::from("a")).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired_terminal() {
        let store = ResultStore::new(Duration::from_secs(60));
        store.put(snapshot("done", JobStatus::Succeeded)).await;
        store.put(snapshot("waiting", JobStatus::AwaitingMail)).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        store.put(snapshot("late", JobStatus::TimedOut)).await;
        assert_eq!(store.sweep().await, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.sweep().await, 1);
        assert!(store.get(&JobId::from("done")).await.is_err());
        assert!(store.get(&JobId::from("waiting")).await.is_ok());
        assert!(store.get(&JobId::from("late")).await.is_ok());
    }

    #[tokio::test]
    async fn test_persist_and_recover() {
        let path = temp_path("recover");
        {
            let store = ResultStore::open(Duration::from_secs(60), &path).await.unwrap();
            assert!(store.is_empty().await);

            let mut done = snapshot("done", JobStatus::Succeeded);
            done.result = Some(JobResult {
                payload: "123456".to_string(),
                extracted: BTreeMap::new(),
            });
            store.put(done).await;
            store.put(snapshot("inflight", JobStatus::RunningWorkflow)).await;
            store.persist().await.unwrap();
        }

        let store = ResultStore::open(Duration::from_secs(60), &path).await.unwrap();
        assert_eq!(store.len().await, 2);

        let done = store.get(&JobId::from("done")).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.result.unwrap().payload, "123456");

        let inflight = store.get(&JobId::from("inflight")).await.unwrap();
        assert_eq!(inflight.status, JobStatus::Failed);
        assert_eq!(inflight.error.unwrap().reason, FailureReason::OrchestratorRestarted);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_persist_without_path_is_noop() {
        let store = ResultStore::new(Duration::from_secs(60));
        store.put(snapshot("a", JobStatus::Created)).await;
        store.persist().await.unwrap();
    }
}
