//! Boundary to the container platform that hosts sandboxes.
//!
//! The control plane never talks to a container runtime directly; it goes
//! through [`SandboxPlatform`]. [`DockerPlatform`] is the production
//! implementation, and `crate::testing::StubPlatform` backs the tests.

mod docker;
mod resources;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PlatformError;

pub use self::docker::DockerPlatform;
pub use self::resources::{parse_cpu_millis, parse_memory_bytes};

/// Phase reported for a sandbox the platform no longer knows about.
pub const PHASE_NOT_FOUND: &str = "not_found";
/// Reason reported alongside [`PHASE_NOT_FOUND`].
pub const REASON_SANDBOX_MISSING: &str = "sandbox_missing";

/// When the platform should pull the sandbox image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl std::str::FromStr for ImagePullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Always" => Ok(Self::Always),
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Never" => Ok(Self::Never),
            other => Err(format!(
                "unknown pull policy '{other}' (expected Always, IfNotPresent or Never)"
            )),
        }
    }
}

impl std::fmt::Display for ImagePullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::IfNotPresent => write!(f, "IfNotPresent"),
            Self::Never => write!(f, "Never"),
        }
    }
}

/// Isolation settings applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityProfile {
    /// `uid:gid` the workload runs as. Never root.
    pub run_as_user: String,
    pub read_only_root_fs: bool,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    /// Use the runtime's default seccomp filter.
    pub default_seccomp: bool,
    /// Mount platform credentials (service account tokens and the like).
    pub mount_platform_credentials: bool,
}

impl SecurityProfile {
    pub fn hardened() -> Self {
        Self {
            run_as_user: "65532:65532".to_string(),
            read_only_root_fs: true,
            drop_all_capabilities: true,
            no_new_privileges: true,
            default_seccomp: true,
            mount_platform_credentials: false,
        }
    }
}

/// Everything the platform needs to launch one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Sandbox name, unique within the namespace.
    pub name: String,
    pub namespace: String,
    pub run_id: String,
    /// Digest-pinned image reference.
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    /// Hard upper bound on how long the workload may run.
    pub lifetime: Duration,
    pub runtime_class: String,
    pub image_pull_policy: ImagePullPolicy,
    pub security: SecurityProfile,
}

/// Live status of a sandbox as observed by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    /// Platform phase (`Pending`, `Running`, `Succeeded`, `Failed`, ...).
    pub phase: String,
    pub reason: String,
}

impl SandboxStatus {
    pub fn not_found() -> Self {
        Self {
            phase: PHASE_NOT_FOUND.to_string(),
            reason: REASON_SANDBOX_MISSING.to_string(),
        }
    }
}

/// Operations the control plane consumes from the container platform.
///
/// Implementations must treat a missing sandbox as a terminal
/// [`PHASE_NOT_FOUND`] status in [`status`](Self::status), and as success in
/// [`delete`](Self::delete).
#[async_trait]
pub trait SandboxPlatform: Send + Sync {
    /// Create and start a sandbox. Returns the platform-assigned sandbox id.
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<String, PlatformError>;

    async fn status(&self, namespace: &str, sandbox_id: &str)
    -> Result<SandboxStatus, PlatformError>;

    /// Network address tool calls should be sent to. May be empty while the
    /// sandbox is still being scheduled.
    async fn address(&self, namespace: &str, sandbox_id: &str) -> Result<String, PlatformError>;

    async fn logs(&self, namespace: &str, sandbox_id: &str) -> Result<String, PlatformError>;

    async fn delete(&self, namespace: &str, sandbox_id: &str) -> Result<(), PlatformError>;
}
