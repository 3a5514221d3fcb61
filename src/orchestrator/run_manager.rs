//! Run lifecycle: admission, sandbox creation, status, logs, stop.
//!
//! A run only exists once the image has been admitted by policy *and* the
//! platform has created its sandbox. Every created sandbox is also handed to
//! the [`CleanupScheduler`], so it is reclaimed even if nobody ever stops or
//! polls it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::RunnerConfig;
use crate::error::RunError;
use crate::orchestrator::cleanup::CleanupScheduler;
use crate::orchestrator::tool_proxy::{ToolInvocation, ToolProxy};
use crate::platform::{
    SandboxPlatform, SandboxSpec, SecurityProfile, parse_cpu_millis, parse_memory_bytes,
};
use crate::policy::{PolicyEnforcer, PolicyEvidence};
use crate::runs::{Run, RunRegistry, RunStatus};

/// `app` label value carried by every run sandbox.
pub const RUN_APP_LABEL: &str = "runguard-run";

/// Network isolation requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProfile {
    DenyAll,
    DnsOnly,
}

impl NetworkProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DenyAll => "deny-all",
            Self::DnsOnly => "dns-only",
        }
    }
}

impl std::str::FromStr for NetworkProfile {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny-all" => Ok(Self::DenyAll),
            "dns-only" => Ok(Self::DnsOnly),
            _ => Err(RunError::Validation(
                "network_policy_profile must be deny-all or dns-only".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of a create-run request.
///
/// Every field defaults so that shape problems surface as validation errors
/// rather than decode failures.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateRunRequest {
    pub image_ref: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// Environment passed verbatim to the sandbox.
    pub env_allowlist: BTreeMap<String, String>,
    pub allowed_tools: Vec<String>,
    /// Tool port inside the sandbox; `None` or 0 uses the configured default.
    pub downstream_port: Option<u16>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    /// Sandbox lifetime in seconds; 0 uses the configured default.
    pub timeout_seconds: i64,
    pub network_policy_profile: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateRunResponse {
    pub run_id: String,
    pub sandbox_name: String,
    pub image_digest: String,
    pub policy_evidence: PolicyEvidence,
}

/// Status view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub run_id: String,
    pub status: RunStatus,
    pub sandbox_name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Live sandbox address, present only when the status poll succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub image_digest: String,
    pub policy_evidence: PolicyEvidence,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stopped_by_operator: bool,
    pub allowed_tools: BTreeSet<String>,
}

impl RunView {
    fn new(run: Run, address: Option<String>) -> Self {
        Self {
            run_id: run.run_id,
            status: run.status,
            sandbox_name: run.sandbox_name,
            namespace: run.namespace,
            reason: run.reason,
            address,
            image_digest: run.image_digest,
            policy_evidence: run.policy_evidence,
            created_at: run.created_at,
            finished_at: run.finished_at,
            stopped_by_operator: run.stopped_by_operator,
            allowed_tools: run.allowed_tools,
        }
    }
}

/// Sandbox output. The platform reports one combined stream, so `stderr`
/// is always empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLogs {
    pub run_id: String,
    pub stdout: String,
    pub stderr: String,
}

/// A validated request with defaults applied.
#[derive(Debug)]
struct Placement {
    cpu_millis: u64,
    memory_bytes: u64,
    lifetime: Duration,
    downstream_port: u16,
    network_profile: NetworkProfile,
    allowed_tools: BTreeSet<String>,
}

/// Coordinates policy, platform, registry, cleanup and audit for runs.
pub struct RunOrchestrator {
    config: RunnerConfig,
    registry: RunRegistry,
    enforcer: PolicyEnforcer,
    platform: Arc<dyn SandboxPlatform>,
    audit: Arc<dyn AuditSink>,
    cleanup: CleanupScheduler,
    tools: ToolProxy,
}

impl RunOrchestrator {
    pub fn new(
        config: RunnerConfig,
        enforcer: PolicyEnforcer,
        platform: Arc<dyn SandboxPlatform>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, RunError> {
        let tools = ToolProxy::new(
            Arc::clone(&platform),
            Arc::clone(&audit),
            config.tool_timeout(),
        )?;
        Ok(Self {
            cleanup: CleanupScheduler::new(Arc::clone(&platform)),
            registry: RunRegistry::new(),
            config,
            enforcer,
            platform,
            audit,
            tools,
        })
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.cleanup
    }

    /// Admit the image, create its sandbox and register the run.
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<CreateRunResponse, RunError> {
        let placement = self.validate(&request)?;

        let admission = match self.enforcer.enforce(&request.image_ref).await {
            Ok(admission) => admission,
            Err(denial) => {
                tracing::warn!(
                    image_ref = %request.image_ref,
                    reason = %denial.reason,
                    detail = %denial.detail,
                    "Image denied by policy"
                );
                self.audit.emit(AuditEvent::RunCreateDenied {
                    reason: denial.to_string(),
                    image_ref: request.image_ref.clone(),
                    policy_evidence: denial.evidence.clone(),
                });
                return Err(denial.into());
            }
        };

        let run_id = Uuid::new_v4().to_string();
        let sandbox_name = format!("run-{run_id}");
        let namespace = self.config.namespace.clone();
        let labels = BTreeMap::from([
            ("app".to_string(), RUN_APP_LABEL.to_string()),
            ("run_id".to_string(), run_id.clone()),
            ("namespace".to_string(), namespace.clone()),
            (
                "network_policy_profile".to_string(),
                placement.network_profile.to_string(),
            ),
        ]);

        let spec = SandboxSpec {
            name: sandbox_name.clone(),
            namespace: namespace.clone(),
            run_id: run_id.clone(),
            image: admission.pinned_ref.clone(),
            command: request.command,
            args: request.args,
            env: request.env_allowlist,
            labels,
            cpu_millis: placement.cpu_millis,
            memory_bytes: placement.memory_bytes,
            lifetime: placement.lifetime,
            runtime_class: self.config.runtime_class.clone(),
            image_pull_policy: self.config.image_pull_policy,
            security: SecurityProfile::hardened(),
        };

        let sandbox_id = match self.platform.create_sandbox(spec).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Sandbox creation failed");
                self.audit.emit(AuditEvent::RunCreateDenied {
                    reason: e.to_string(),
                    image_ref: request.image_ref,
                    policy_evidence: admission.evidence,
                });
                return Err(RunError::Internal {
                    reason: e.to_string(),
                });
            }
        };

        self.cleanup
            .schedule(&namespace, &sandbox_id, self.config.cleanup_delay());

        let image_digest = admission.evidence.resolved_digest.clone();
        self.registry
            .put(Run {
                run_id: run_id.clone(),
                sandbox_id,
                sandbox_name: sandbox_name.clone(),
                namespace,
                status: RunStatus::Starting,
                reason: String::new(),
                created_at: Utc::now(),
                finished_at: None,
                stopped_by_operator: false,
                image_digest: image_digest.clone(),
                policy_evidence: admission.evidence.clone(),
                allowed_tools: placement.allowed_tools,
                downstream_port: placement.downstream_port,
            })
            .await;

        tracing::info!(
            run_id = %run_id,
            sandbox_name = %sandbox_name,
            image = %admission.pinned_ref,
            "Created run"
        );
        self.audit.emit(AuditEvent::RunCreated {
            run_id: run_id.clone(),
            sandbox_name: sandbox_name.clone(),
            runtime_class: self.config.runtime_class.clone(),
            image_digest: image_digest.clone(),
            network_policy_profile: placement.network_profile.to_string(),
            policy_evidence: admission.evidence.clone(),
        });

        Ok(CreateRunResponse {
            run_id,
            sandbox_name,
            image_digest,
            policy_evidence: admission.evidence,
        })
    }

    /// Refresh a run's status from the platform and return it.
    ///
    /// A failed poll serves the last stored record unchanged.
    pub async fn get_run(&self, run_id: &str) -> Result<RunView, RunError> {
        let run = self.registry.get(run_id).await?;

        let status = match self.platform.status(&run.namespace, &run.sandbox_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Status poll failed, serving stored run");
                return Ok(RunView::new(run, None));
            }
        };
        let address = self
            .platform
            .address(&run.namespace, &run.sandbox_id)
            .await
            .ok()
            .filter(|a| !a.is_empty());

        let run = self
            .registry
            .update(run_id, |mut run| {
                run.status = RunStatus::from_phase(&status.phase);
                run.reason = status.reason;
                run
            })
            .await?;
        Ok(RunView::new(run, address))
    }

    pub async fn get_logs(&self, run_id: &str) -> Result<RunLogs, RunError> {
        let run = self.registry.get(run_id).await?;
        let stdout = self
            .platform
            .logs(&run.namespace, &run.sandbox_id)
            .await
            .map_err(|e| RunError::UpstreamUnavailable {
                reason: format!("log fetch failed: {e}"),
            })?;
        Ok(RunLogs {
            run_id: run.run_id,
            stdout,
            stderr: String::new(),
        })
    }

    /// Delete the run's sandbox and mark it stopped by the operator.
    pub async fn stop_run(&self, run_id: &str) -> Result<(), RunError> {
        let run = self.registry.get(run_id).await?;

        self.platform
            .delete(&run.namespace, &run.sandbox_id)
            .await
            .map_err(|e| RunError::Internal {
                reason: format!("sandbox delete failed: {e}"),
            })?;

        self.registry
            .update(run_id, |mut run| {
                run.status = RunStatus::Stopped;
                run.finished_at = Some(Utc::now());
                run.stopped_by_operator = true;
                run
            })
            .await?;

        tracing::info!(run_id = %run_id, "Stopped run");
        self.audit.emit(AuditEvent::RunStopped {
            run_id: run_id.to_string(),
        });
        Ok(())
    }

    /// Forward a tool call into the run's sandbox.
    pub async fn invoke_tool(
        &self,
        run_id: &str,
        tool_name: &str,
        input: Map<String, Value>,
    ) -> Result<ToolInvocation, RunError> {
        let run = self.registry.get(run_id).await?;
        self.tools.invoke(&run, tool_name, input).await
    }

    /// Flush pending cleanups, waiting up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.cleanup.shutdown(grace).await;
    }

    fn validate(&self, request: &CreateRunRequest) -> Result<Placement, RunError> {
        if request.image_ref.trim().is_empty() {
            return Err(RunError::Validation("image_ref is required".to_string()));
        }
        let network_profile: NetworkProfile = request.network_policy_profile.parse()?;
        if request.timeout_seconds < 0 {
            return Err(RunError::Validation(
                "timeout_seconds must be >= 0".to_string(),
            ));
        }

        let cpu = non_blank(request.cpu.as_deref()).unwrap_or(self.config.default_cpu.as_str());
        let cpu_millis = parse_cpu_millis(cpu)
            .ok_or_else(|| RunError::Validation(format!("cpu '{cpu}' is not a valid quantity")))?;
        let memory = non_blank(request.memory.as_deref()).unwrap_or(self.config.default_memory.as_str());
        let memory_bytes = parse_memory_bytes(memory).ok_or_else(|| {
            RunError::Validation(format!("memory '{memory}' is not a valid quantity"))
        })?;

        let lifetime_secs = u64::try_from(request.timeout_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .unwrap_or(self.config.default_timeout_secs);
        let downstream_port = request
            .downstream_port
            .filter(|port| *port > 0)
            .unwrap_or(self.config.default_downstream_port);

        let allowed_tools = request
            .allowed_tools
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Placement {
            cpu_millis,
            memory_bytes,
            lifetime: Duration::from_secs(lifetime_secs),
            downstream_port,
            network_profile,
            allowed_tools,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
