//! Error types for the run control plane.

use crate::policy::PolicyDenial;

/// Configuration errors raised while resolving settings from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Signature trust configuration missing: set a key path or an identity and issuer")]
    MissingTrustConfig,
}

/// Errors reported by the container platform boundary.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Sandbox not found: {sandbox_id}")]
    NotFound { sandbox_id: String },

    #[error("Sandbox creation failed: {reason}")]
    CreationFailed { reason: String },

    #[error("Platform unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors reported by a signature verifier.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to launch verifier: {0}")]
    Spawn(String),

    #[error("Verifier exited with {status}: {output}")]
    Rejected { status: String, output: String },

    #[error("Could not parse verifier output: {0}")]
    MalformedOutput(String),

    #[error("Verifier returned no signatures")]
    NoSignatures,

    #[error("Verifier output is missing the manifest digest")]
    MissingDigest,
}

/// Errors surfaced by run operations to the transport layer.
///
/// `UpstreamUnavailable` and `Internal` carry detail for logging only; the
/// transport never echoes it back to callers.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Policy denied: {0}")]
    PolicyDenied(Box<PolicyDenial>),

    #[error("Run not found: {run_id}")]
    NotFound { run_id: String },

    #[error("Tool '{tool_name}' is not allowed for run {run_id}")]
    ToolForbidden { run_id: String, tool_name: String },

    #[error("Upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl From<PolicyDenial> for RunError {
    fn from(denial: PolicyDenial) -> Self {
        Self::PolicyDenied(Box::new(denial))
    }
}
