//! Supply-chain admission policy.
//!
//! Every image goes through [`PolicyEnforcer::enforce`] before a sandbox is
//! created for it:
//!
//! ```text
//! image_ref ──► registry segment? ──► allowlisted? ──► digest pinned & verify optional?
//!                    │                    │                  │            │
//!                    ▼                    ▼                  ▼ yes        ▼ no
//!            invalid_image_ref   registry_not_allowlisted  use it    verifier ──► cosign_verify_failed
//!                                                            │            │
//!                                                            └─────┬──────┘
//!                                                                  ▼
//!                                                  digest present & sha256? ──► pinned ref
//! ```
//!
//! Evidence is produced for both outcomes so denials can be audited with the
//! same context as admissions.

pub mod image_ref;
mod verifier;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;

pub use self::verifier::{CosignVerifier, SignatureVerifier, Verification};

/// Why an image was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    InvalidImageRef,
    RegistryNotAllowlisted,
    CosignVerifyFailed,
    DigestResolutionFailed,
    InvalidDigest,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidImageRef => "invalid_image_ref",
            Self::RegistryNotAllowlisted => "registry_not_allowlisted",
            Self::CosignVerifyFailed => "cosign_verify_failed",
            Self::DigestResolutionFailed => "digest_resolution_failed",
            Self::InvalidDigest => "invalid_digest",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record of an admission decision.
///
/// Either `resolved_digest` is non-empty and `denial_reason` is `None`, or
/// `denial_reason` is set and `resolved_digest` is empty. Only the enforcer
/// builds these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvidence {
    pub registry_allowed: bool,
    pub signature_verified: bool,
    pub verifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub resolved_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<DenialReason>,
}

impl PolicyEvidence {
    fn new(verifier: &str) -> Self {
        Self {
            registry_allowed: false,
            signature_verified: false,
            verifier: verifier.to_string(),
            identity: None,
            resolved_digest: String::new(),
            denial_reason: None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.denial_reason.is_none() && !self.resolved_digest.is_empty()
    }
}

/// Successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// `repository@sha256:...`
    pub pinned_ref: String,
    pub evidence: PolicyEvidence,
}

/// A refused image, with the partial evidence gathered before refusal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct PolicyDenial {
    pub reason: DenialReason,
    pub detail: String,
    pub evidence: PolicyEvidence,
}

/// Applies the admission policy to image references.
#[derive(Clone)]
pub struct PolicyEnforcer {
    config: PolicyConfig,
    verifier: Arc<dyn SignatureVerifier>,
}

impl PolicyEnforcer {
    pub fn new(config: PolicyConfig, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Admit or deny `reference`, resolving an immutable digest on admission.
    pub async fn enforce(&self, reference: &str) -> Result<Admission, PolicyDenial> {
        let mut evidence = PolicyEvidence::new(self.verifier.name());

        let Some(registry) = image_ref::registry_of(reference) else {
            return Err(deny(
                evidence,
                DenialReason::InvalidImageRef,
                "image reference must include a registry",
            ));
        };
        if !self.config.is_registry_allowed(registry) {
            return Err(deny(
                evidence,
                DenialReason::RegistryNotAllowlisted,
                format!("registry '{registry}' is not allowlisted"),
            ));
        }
        evidence.registry_allowed = true;

        let digest = match image_ref::embedded_digest(reference) {
            Some(pinned) if !self.config.require_signature => pinned.to_string(),
            // Either nothing is pinned or verification is mandatory; in the
            // latter case the verifier's digest replaces any embedded one.
            _ => {
                let verified = match self.verify(reference).await {
                    Ok(v) => v,
                    Err(detail) => {
                        return Err(deny(evidence, DenialReason::CosignVerifyFailed, detail));
                    }
                };
                evidence.signature_verified = true;
                evidence.identity = verified.identity;
                verified.digest
            }
        };

        if digest.is_empty() {
            return Err(deny(
                evidence,
                DenialReason::DigestResolutionFailed,
                "could not resolve digest",
            ));
        }
        if !digest.starts_with(image_ref::SHA256_PREFIX) {
            return Err(deny(
                evidence,
                DenialReason::InvalidDigest,
                format!("digest '{digest}' is not sha256"),
            ));
        }

        evidence.resolved_digest = digest.clone();
        Ok(Admission {
            pinned_ref: image_ref::pin(reference, &digest),
            evidence,
        })
    }

    async fn verify(&self, reference: &str) -> Result<Verification, String> {
        let trust = self.config.trust_config().map_err(|e| e.to_string())?;
        self.verifier
            .verify(reference, &trust)
            .await
            .map_err(|e| e.to_string())
    }
}

fn deny(
    mut evidence: PolicyEvidence,
    reason: DenialReason,
    detail: impl Into<String>,
) -> PolicyDenial {
    evidence.denial_reason = Some(reason);
    evidence.resolved_digest.clear();
    PolicyDenial {
        reason,
        detail: detail.into(),
        evidence,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::testing::StubVerifier;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn config(require_signature: bool) -> PolicyConfig {
        PolicyConfig {
            allowlisted_registries: vec!["ghcr.io".to_string()],
            require_signature,
            cosign_key_path: Some(PathBuf::from("/keys/cosign.pub")),
            ..PolicyConfig::default()
        }
    }

    fn enforcer(require_signature: bool, verifier: StubVerifier) -> PolicyEnforcer {
        PolicyEnforcer::new(config(require_signature), Arc::new(verifier))
    }

    #[tokio::test]
    async fn test_missing_registry_segment_denied() {
        let verifier = StubVerifier::digest("sha256:unused");
        let calls = verifier.calls();
        let enforcer = enforcer(true, verifier);

        for image in ["", "ubuntu:22.04", "tool"] {
            let denial = enforcer.enforce(image).await.unwrap_err();
            assert_eq!(denial.reason, DenialReason::InvalidImageRef);
            assert!(!denial.evidence.registry_allowed);
            assert_eq!(
                denial.evidence.denial_reason,
                Some(DenialReason::InvalidImageRef)
            );
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registry_not_allowlisted() {
        let enforcer = enforcer(false, StubVerifier::digest("sha256:unused"));
        let denial = enforcer
            .enforce("evil.example.com/bad:latest")
            .await
            .unwrap_err();
        assert_eq!(denial.reason, DenialReason::RegistryNotAllowlisted);
        assert!(!denial.evidence.registry_allowed);
        assert!(denial.evidence.resolved_digest.is_empty());
    }

    #[tokio::test]
    async fn test_embedded_digest_accepted_without_verification() {
        let verifier = StubVerifier::digest("sha256:other");
        let calls = verifier.calls();
        let enforcer = enforcer(false, verifier);
        let image = format!("ghcr.io/acme/tool@sha256:{HEX}");

        let admission = enforcer.enforce(&image).await.unwrap();
        assert_eq!(admission.pinned_ref, image);
        assert_eq!(admission.evidence.resolved_digest, format!("sha256:{HEX}"));
        assert!(!admission.evidence.signature_verified);
        assert!(admission.evidence.registry_allowed);
        assert!(admission.evidence.is_admitted());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_verifier_digest_overrides_embedded_digest() {
        let verified = format!("sha256:{}", HEX.replace('0', "f"));
        let enforcer = enforcer(true, StubVerifier::digest(&verified));
        let image = format!("ghcr.io/acme/tool:1.2@sha256:{HEX}");

        let admission = enforcer.enforce(&image).await.unwrap();
        assert_eq!(admission.evidence.resolved_digest, verified);
        assert_eq!(admission.pinned_ref, format!("ghcr.io/acme/tool@{verified}"));
        assert!(admission.evidence.signature_verified);
        assert_eq!(admission.evidence.verifier, "stub");
    }

    #[tokio::test]
    async fn test_tag_only_reference_is_verified_even_when_optional() {
        let verifier = StubVerifier::digest("sha256:abc");
        let calls = verifier.calls();
        let enforcer = enforcer(false, verifier);

        let admission = enforcer.enforce("ghcr.io/acme/tool:latest").await.unwrap();
        assert_eq!(admission.pinned_ref, "ghcr.io/acme/tool@sha256:abc");
        assert!(admission.evidence.signature_verified);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_verifier_failure_denied() {
        let enforcer = enforcer(true, StubVerifier::failing("no matching signatures"));
        let denial = enforcer.enforce("ghcr.io/acme/tool:1").await.unwrap_err();
        assert_eq!(denial.reason, DenialReason::CosignVerifyFailed);
        assert!(denial.evidence.registry_allowed);
        assert!(!denial.evidence.signature_verified);
        assert!(denial.detail.contains("no matching signatures"));
    }

    #[tokio::test]
    async fn test_missing_trust_config_denied() {
        let mut cfg = config(true);
        cfg.cosign_key_path = None;
        let enforcer = PolicyEnforcer::new(cfg, Arc::new(StubVerifier::digest("sha256:abc")));

        let denial = enforcer.enforce("ghcr.io/acme/tool:1").await.unwrap_err();
        assert_eq!(denial.reason, DenialReason::CosignVerifyFailed);
        assert!(denial.detail.contains("trust configuration"));
    }

    #[tokio::test]
    async fn test_empty_and_non_sha256_digests_denied() {
        let enforcer_empty = enforcer(true, StubVerifier::digest(""));
        let denial = enforcer_empty
            .enforce("ghcr.io/acme/tool:1")
            .await
            .unwrap_err();
        assert_eq!(denial.reason, DenialReason::DigestResolutionFailed);

        let enforcer_md5 = enforcer(true, StubVerifier::digest("md5:abc"));
        let denial = enforcer_md5
            .enforce("ghcr.io/acme/tool:1")
            .await
            .unwrap_err();
        assert_eq!(denial.reason, DenialReason::InvalidDigest);
        assert!(denial.evidence.signature_verified);
        assert!(denial.evidence.resolved_digest.is_empty());
    }

    #[test]
    fn test_evidence_serialization_omits_empty_optionals() {
        let evidence = PolicyEvidence::new("cosign");
        let json = serde_json::to_value(&evidence).unwrap();
        assert!(json.get("identity").is_none());
        assert!(json.get("denial_reason").is_none());

        let denial = deny(evidence, DenialReason::InvalidDigest, "bad");
        let json = serde_json::to_value(&denial.evidence).unwrap();
        assert_eq!(json["denial_reason"], "invalid_digest");
    }
}
