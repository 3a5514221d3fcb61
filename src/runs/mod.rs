//! Run records and the registry that holds them.

mod registry;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::PolicyEvidence;

pub use self::registry::RunRegistry;

/// Lifecycle state of a run.
///
/// Runs start as `Starting`; afterwards the status mirrors whatever phase
/// the platform last reported, except `Stopped`, which only an operator stop
/// produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
    NotFound,
    Unknown,
}

impl RunStatus {
    /// Map a platform phase (any case) onto a run status.
    pub fn from_phase(phase: &str) -> Self {
        match phase.to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "not_found" => Self::NotFound,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::NotFound => "not_found",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One sandboxed execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: String,
    /// Platform-assigned sandbox id.
    pub sandbox_id: String,
    /// Human-readable sandbox name (`run-<run_id>`).
    pub sandbox_name: String,
    pub namespace: String,
    pub status: RunStatus,
    /// Free-text reason reported by the platform.
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when an operator stopped the run.
    pub stopped_by_operator: bool,
    pub image_digest: String,
    pub policy_evidence: PolicyEvidence,
    /// Tools this run may invoke. Empty means every tool.
    pub allowed_tools: BTreeSet<String>,
    /// Port the sandbox serves tool calls on.
    pub downstream_port: u16,
}

impl Run {
    /// Whether `tool_name` falls within this run's tool scope.
    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.contains(tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_phase_is_case_insensitive() {
        assert_eq!(RunStatus::from_phase("Running"), RunStatus::Running);
        assert_eq!(RunStatus::from_phase("SUCCEEDED"), RunStatus::Succeeded);
        assert_eq!(RunStatus::from_phase("not_found"), RunStatus::NotFound);
        assert_eq!(RunStatus::from_phase("Evicted"), RunStatus::Unknown);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(RunStatus::NotFound).unwrap(),
            serde_json::json!("not_found")
        );
        assert_eq!(RunStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_tool_scope() {
        let mut run = crate::testing::sample_run("r1");
        assert!(run.allows_tool("anything"));

        run.allowed_tools.insert("search".to_string());
        assert!(run.allows_tool("search"));
        assert!(!run.allows_tool("exec"));
    }
}
