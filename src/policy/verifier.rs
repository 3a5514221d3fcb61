//! Signature verification capability.
//!
//! The enforcer only depends on [`SignatureVerifier`]; [`CosignVerifier`]
//! shells out to the `cosign` CLI.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::TrustConfig;
use crate::error::VerifyError;

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Canonical manifest digest the signature covers.
    pub digest: String,
    /// Signer identity, when one could be determined.
    pub identity: Option<String>,
}

/// Verifies an image signature and resolves the signed digest.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Name recorded in policy evidence.
    fn name(&self) -> &str;

    async fn verify(&self, image_ref: &str, trust: &TrustConfig)
    -> Result<Verification, VerifyError>;
}

/// Runs `cosign verify` as a subprocess.
///
/// The child is killed if the verification future is dropped, so a caller
/// that gives up on a request does not leave the subprocess running.
#[derive(Debug, Clone)]
pub struct CosignVerifier {
    binary: String,
}

impl CosignVerifier {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args(image_ref: &str, trust: &TrustConfig) -> Vec<String> {
        let mut args = vec![
            "verify".to_string(),
            image_ref.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        match trust {
            TrustConfig::Key { path } => {
                args.push("--key".to_string());
                args.push(path.display().to_string());
            }
            TrustConfig::Keyless { identity, issuer } => {
                args.push("--certificate-identity".to_string());
                args.push(identity.clone());
                args.push("--certificate-oidc-issuer".to_string());
                args.push(issuer.clone());
            }
        }
        args
    }
}

impl Default for CosignVerifier {
    fn default() -> Self {
        Self::new("cosign")
    }
}

#[async_trait]
impl SignatureVerifier for CosignVerifier {
    fn name(&self) -> &str {
        "cosign"
    }

    async fn verify(
        &self,
        image_ref: &str,
        trust: &TrustConfig,
    ) -> Result<Verification, VerifyError> {
        let output = Command::new(&self.binary)
            .args(Self::args(image_ref, trust))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VerifyError::Spawn(format!("{}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(VerifyError::Rejected {
                status: output.status.to_string(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let configured_identity = match trust {
            TrustConfig::Keyless { identity, .. } => Some(identity.as_str()),
            TrustConfig::Key { .. } => None,
        };
        parse_cosign_output(&output.stdout, configured_identity)
    }
}

#[derive(Debug, Deserialize)]
struct CosignSignature {
    critical: CosignCritical,
}

#[derive(Debug, Deserialize)]
struct CosignCritical {
    image: CosignImage,
    #[serde(default)]
    identity: Option<CosignIdentity>,
}

#[derive(Debug, Deserialize)]
struct CosignImage {
    #[serde(rename = "docker-manifest-digest", default)]
    docker_manifest_digest: String,
}

#[derive(Debug, Deserialize)]
struct CosignIdentity {
    #[serde(rename = "docker-reference", default)]
    docker_reference: String,
}

/// Extract the digest and signer identity from `cosign verify --output json`.
///
/// The configured keyless identity wins over the reference cosign reports.
fn parse_cosign_output(
    stdout: &[u8],
    configured_identity: Option<&str>,
) -> Result<Verification, VerifyError> {
    let signatures: Vec<CosignSignature> =
        serde_json::from_slice(stdout).map_err(|e| VerifyError::MalformedOutput(e.to_string()))?;
    let first = signatures.into_iter().next().ok_or(VerifyError::NoSignatures)?;

    let digest = first.critical.image.docker_manifest_digest.trim().to_string();
    if digest.is_empty() {
        return Err(VerifyError::MissingDigest);
    }

    let identity = configured_identity.map(str::to_string).or_else(|| {
        first
            .critical
            .identity
            .map(|id| id.docker_reference)
            .filter(|r| !r.is_empty())
    });

    Ok(Verification { digest, identity })
}
