use std::path::PathBuf;

use crate::config::helpers::{optional_env, parse_list_env, parse_string_env};
use crate::error::ConfigError;

/// Registries admitted when `RUNNER_ALLOWLISTED_REGISTRIES` is unset or empty.
const DEFAULT_REGISTRIES: &[&str] = &["cgr.dev", "ghcr.io"];

/// Supply-chain admission policy. Read-only after startup.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Registry hosts an image reference must come from (exact match).
    pub allowlisted_registries: Vec<String>,
    /// Whether every image must pass signature verification, even when the
    /// reference already pins a digest.
    pub require_signature: bool,
    /// Public key used for key-based verification.
    pub cosign_key_path: Option<PathBuf>,
    /// Expected certificate identity for keyless verification.
    pub cosign_identity: Option<String>,
    /// Expected OIDC issuer for keyless verification.
    pub cosign_issuer: Option<String>,
    /// Verifier executable.
    pub cosign_binary: String,
}

/// How signatures are checked. Exactly one mode is used per verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustConfig {
    Key { path: PathBuf },
    Keyless { identity: String, issuer: String },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowlisted_registries: DEFAULT_REGISTRIES.iter().map(|s| s.to_string()).collect(),
            require_signature: true,
            cosign_key_path: None,
            cosign_identity: None,
            cosign_issuer: None,
            cosign_binary: "cosign".to_string(),
        }
    }
}

impl PolicyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut registries = parse_list_env("RUNNER_ALLOWLISTED_REGISTRIES")?;
        if registries.is_empty() {
            registries = defaults.allowlisted_registries;
        }

        // Verification stays on unless explicitly disabled.
        let require_signature = !optional_env("RUNNER_REQUIRE_COSIGN")?
            .is_some_and(|v| v.eq_ignore_ascii_case("false"));

        Ok(Self {
            allowlisted_registries: registries,
            require_signature,
            cosign_key_path: optional_env("RUNNER_COSIGN_KEY_PATH")?.map(PathBuf::from),
            cosign_identity: optional_env("RUNNER_COSIGN_IDENTITY")?,
            cosign_issuer: optional_env("RUNNER_COSIGN_ISSUER")?,
            cosign_binary: parse_string_env("RUNNER_COSIGN_BINARY", defaults.cosign_binary)?,
        })
    }

    /// Whether `registry` is on the allowlist.
    pub fn is_registry_allowed(&self, registry: &str) -> bool {
        self.allowlisted_registries.iter().any(|r| r == registry)
    }

    /// Select the trust mode. A key path wins over identity+issuer.
    pub fn trust_config(&self) -> Result<TrustConfig, ConfigError> {
        if let Some(ref path) = self.cosign_key_path {
            return Ok(TrustConfig::Key { path: path.clone() });
        }
        match (&self.cosign_identity, &self.cosign_issuer) {
            (Some(identity), Some(issuer)) => Ok(TrustConfig::Keyless {
                identity: identity.clone(),
                issuer: issuer.clone(),
            }),
            _ => Err(ConfigError::MissingTrustConfig),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    fn clear_policy_env() {
        // SAFETY: Only called under ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("RUNNER_ALLOWLISTED_REGISTRIES");
            std::env::remove_var("RUNNER_REQUIRE_COSIGN");
            std::env::remove_var("RUNNER_COSIGN_KEY_PATH");
            std::env::remove_var("RUNNER_COSIGN_IDENTITY");
            std::env::remove_var("RUNNER_COSIGN_ISSUER");
            std::env::remove_var("RUNNER_COSIGN_BINARY");
        }
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_policy_env();

        let cfg = PolicyConfig::resolve().unwrap();
        assert_eq!(cfg.allowlisted_registries, vec!["cgr.dev", "ghcr.io"]);
        assert!(cfg.require_signature);
        assert_eq!(cfg.cosign_binary, "cosign");
    }

    #[test]
    fn test_only_literal_false_disables_verification() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_policy_env();

        unsafe {
            std::env::set_var("RUNNER_REQUIRE_COSIGN", "FALSE");
        }
        assert!(!PolicyConfig::resolve().unwrap().require_signature);

        unsafe {
            std::env::set_var("RUNNER_REQUIRE_COSIGN", "no");
        }
        assert!(PolicyConfig::resolve().unwrap().require_signature);

        clear_policy_env();
    }

    #[test]
    fn test_registry_list_parsed() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_policy_env();

        unsafe {
            std::env::set_var("RUNNER_ALLOWLISTED_REGISTRIES", "registry.internal, ghcr.io ,");
        }
        let cfg = PolicyConfig::resolve().unwrap();
        assert_eq!(cfg.allowlisted_registries, vec!["registry.internal", "ghcr.io"]);
        assert!(cfg.is_registry_allowed("ghcr.io"));
        assert!(!cfg.is_registry_allowed("docker.io"));

        clear_policy_env();
    }

    #[test]
    fn test_trust_config_selection() {
        let mut cfg = PolicyConfig::default();
        assert!(matches!(
            cfg.trust_config(),
            Err(ConfigError::MissingTrustConfig)
        ));

        cfg.cosign_identity = Some("ci@example.com".to_string());
        assert!(cfg.trust_config().is_err(), "identity alone is not enough");

        cfg.cosign_issuer = Some("https://token.actions.githubusercontent.com".to_string());
        assert!(matches!(
            cfg.trust_config().unwrap(),
            TrustConfig::Keyless { .. }
        ));

        cfg.cosign_key_path = Some(PathBuf::from("/etc/runguard/cosign.pub"));
        assert_eq!(
            cfg.trust_config().unwrap(),
            TrustConfig::Key {
                path: PathBuf::from("/etc/runguard/cosign.pub")
            }
        );
    }
}
