use std::net::SocketAddr;
use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;
use crate::platform::{ImagePullPolicy, parse_cpu_millis, parse_memory_bytes};

/// Runtime settings for the run control plane.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Address the HTTP API binds to.
    pub addr: SocketAddr,
    /// Scope every run is created in.
    pub namespace: String,
    /// Container runtime used for sandboxes (e.g. `runsc` for gVisor).
    pub runtime_class: String,
    pub image_pull_policy: ImagePullPolicy,
    /// CPU applied when a request leaves it unset.
    pub default_cpu: String,
    /// Memory applied when a request leaves it unset.
    pub default_memory: String,
    /// Sandbox lifetime applied when a request passes 0 or nothing.
    pub default_timeout_secs: u64,
    /// Delay before a sandbox is unconditionally deleted.
    pub cleanup_secs: u64,
    /// Tool port applied when a request leaves it unset.
    pub default_downstream_port: u16,
    /// Deadline for a single inbound API request.
    pub request_timeout_secs: u64,
    /// Timeout for forwarded tool calls.
    pub tool_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            namespace: "mcp-runs".to_string(),
            runtime_class: "runsc".to_string(),
            image_pull_policy: ImagePullPolicy::IfNotPresent,
            default_cpu: "100m".to_string(),
            default_memory: "128Mi".to_string(),
            default_timeout_secs: 300,
            cleanup_secs: 120,
            default_downstream_port: 8080,
            request_timeout_secs: 30,
            tool_timeout_secs: 30,
        }
    }
}

impl RunnerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_cpu = parse_string_env("RUNNER_DEFAULT_CPU", defaults.default_cpu)?;
        if parse_cpu_millis(&default_cpu).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "RUNNER_DEFAULT_CPU".to_string(),
                message: format!("'{default_cpu}' is not a CPU quantity"),
            });
        }
        let default_memory = parse_string_env("RUNNER_DEFAULT_MEMORY", defaults.default_memory)?;
        if parse_memory_bytes(&default_memory).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "RUNNER_DEFAULT_MEMORY".to_string(),
                message: format!("'{default_memory}' is not a memory quantity"),
            });
        }

        Ok(Self {
            addr: parse_optional_env("RUNNER_ADDR", defaults.addr)?,
            namespace: parse_string_env("RUNNER_NAMESPACE", defaults.namespace)?,
            runtime_class: parse_string_env("RUNNER_RUNTIMECLASS", defaults.runtime_class)?,
            image_pull_policy: parse_optional_env(
                "RUNNER_IMAGE_PULL_POLICY",
                defaults.image_pull_policy,
            )?,
            default_cpu,
            default_memory,
            default_timeout_secs: parse_optional_env(
                "RUNNER_DEFAULT_TIMEOUT_SECONDS",
                defaults.default_timeout_secs,
            )?,
            cleanup_secs: parse_optional_env("RUNNER_CLEANUP_SECONDS", defaults.cleanup_secs)?,
            default_downstream_port: parse_optional_env(
                "RUNNER_DEFAULT_DOWNSTREAM_PORT",
                defaults.default_downstream_port,
            )?,
            request_timeout_secs: parse_optional_env(
                "RUNNER_REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_secs,
            )?,
            tool_timeout_secs: parse_optional_env(
                "RUNNER_TOOL_TIMEOUT_SECONDS",
                defaults.tool_timeout_secs,
            )?,
        })
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    const KEYS: &[&str] = &[
        "RUNNER_ADDR",
        "RUNNER_NAMESPACE",
        "RUNNER_RUNTIMECLASS",
        "RUNNER_IMAGE_PULL_POLICY",
        "RUNNER_DEFAULT_CPU",
        "RUNNER_DEFAULT_MEMORY",
        "RUNNER_DEFAULT_TIMEOUT_SECONDS",
        "RUNNER_CLEANUP_SECONDS",
        "RUNNER_DEFAULT_DOWNSTREAM_PORT",
        "RUNNER_REQUEST_TIMEOUT_SECONDS",
        "RUNNER_TOOL_TIMEOUT_SECONDS",
    ];

    fn clear_runner_env() {
        // SAFETY: Only called under ENV_MUTEX in tests.
        unsafe {
            for key in KEYS {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_runner_config_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_runner_env();

        let cfg = RunnerConfig::resolve().unwrap();
        assert_eq!(cfg.namespace, "mcp-runs");
        assert_eq!(cfg.default_timeout_secs, 300);
        assert_eq!(cfg.cleanup_delay(), Duration::from_secs(120));
        assert_eq!(cfg.image_pull_policy, ImagePullPolicy::IfNotPresent);
        assert_eq!(cfg.addr.port(), 8080);
    }

    #[test]
    fn test_runner_config_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_runner_env();

        unsafe {
            std::env::set_var("RUNNER_ADDR", "127.0.0.1:9090");
            std::env::set_var("RUNNER_IMAGE_PULL_POLICY", "Always");
            std::env::set_var("RUNNER_CLEANUP_SECONDS", "15");
        }
        let cfg = RunnerConfig::resolve().unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.image_pull_policy, ImagePullPolicy::Always);
        assert_eq!(cfg.cleanup_secs, 15);

        clear_runner_env();
    }

    #[test]
    fn test_invalid_default_memory_is_an_error() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_runner_env();

        unsafe {
            std::env::set_var("RUNNER_DEFAULT_MEMORY", "lots");
        }
        let err = RunnerConfig::resolve().unwrap_err();
        assert!(err.to_string().contains("RUNNER_DEFAULT_MEMORY"));

        clear_runner_env();
    }
}
