//! In-memory run registry.
//!
//! Holds every run created by this process. Records are never removed;
//! they live until the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::RunError;
use crate::runs::Run;

/// Concurrency-safe map from run id to run record.
///
/// All access goes through one lock, so a committed write is visible to every
/// later read. The lock is never held across an await on external I/O.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, Run>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a run.
    pub async fn put(&self, run: Run) {
        self.runs.write().await.insert(run.run_id.clone(), run);
    }

    pub async fn get(&self, run_id: &str) -> Result<Run, RunError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunError::NotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Atomically replace a run with `transform(current)` and return the
    /// stored result.
    ///
    /// The run id and policy evidence of the current record are kept no
    /// matter what the transform returns.
    pub async fn update<F>(&self, run_id: &str, transform: F) -> Result<Run, RunError>
    where
        F: FnOnce(Run) -> Run,
    {
        let mut runs = self.runs.write().await;
        let current = runs.get(run_id).cloned().ok_or_else(|| RunError::NotFound {
            run_id: run_id.to_string(),
        })?;

        let run_id = current.run_id.clone();
        let evidence = current.policy_evidence.clone();
        let mut next = transform(current);
        next.run_id = run_id.clone();
        next.policy_evidence = evidence;

        runs.insert(run_id, next.clone());
        Ok(next)
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
