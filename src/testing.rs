//! Test doubles for the platform, verifier and audit boundaries.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::TrustConfig;
use crate::error::{PlatformError, VerifyError};
use crate::platform::{SandboxPlatform, SandboxSpec, SandboxStatus};
use crate::policy::{PolicyEvidence, SignatureVerifier, Verification};
use crate::runs::{Run, RunStatus};

/// A run record with admitted evidence, for seeding registries in tests.
pub fn sample_run(run_id: &str) -> Run {
    Run {
        run_id: run_id.to_string(),
        sandbox_id: format!("sbx-{run_id}"),
        sandbox_name: format!("run-{run_id}"),
        namespace: "test-runs".to_string(),
        status: RunStatus::Starting,
        reason: String::new(),
        created_at: Utc::now(),
        finished_at: None,
        stopped_by_operator: false,
        image_digest: "sha256:abc".to_string(),
        policy_evidence: PolicyEvidence {
            registry_allowed: true,
            signature_verified: true,
            verifier: "stub".to_string(),
            identity: Some("ci@example.com".to_string()),
            resolved_digest: "sha256:abc".to_string(),
            denial_reason: None,
        },
        allowed_tools: BTreeSet::new(),
        downstream_port: 8080,
    }
}

/// Verifier returning a fixed outcome and counting calls.
pub struct StubVerifier {
    outcome: Result<Verification, String>,
    calls: Arc<AtomicUsize>,
}

impl StubVerifier {
    /// Succeed with `digest` and a fixed identity.
    pub fn digest(digest: &str) -> Self {
        Self {
            outcome: Ok(Verification {
                digest: digest.to_string(),
                identity: Some("ci@example.com".to_string()),
            }),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every verification with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of `verify` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl SignatureVerifier for StubVerifier {
    fn name(&self) -> &str {
        "stub"
    }

    async fn verify(
        &self,
        _image_ref: &str,
        _trust: &TrustConfig,
    ) -> Result<Verification, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone().map_err(|output| VerifyError::Rejected {
            status: "exit status: 1".to_string(),
            output,
        })
    }
}

#[derive(Debug, Clone)]
struct StubSandbox {
    namespace: String,
    status: SandboxStatus,
    address: String,
    logs: String,
}

/// In-memory platform. Sandboxes are created in the `Pending` phase and can
/// be driven through other states with the setters.
#[derive(Default)]
pub struct StubPlatform {
    sandboxes: Mutex<HashMap<String, StubSandbox>>,
    created: Mutex<Vec<SandboxSpec>>,
    fail_create: AtomicBool,
    fail_status: AtomicBool,
    fail_address: AtomicBool,
    fail_logs: AtomicBool,
    fail_delete: AtomicBool,
    delete_calls: AtomicUsize,
    address_calls: AtomicUsize,
}

impl StubPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specs passed to `create_sandbox`, in call order.
    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn exists(&self, sandbox_id: &str) -> bool {
        self.sandboxes
            .lock()
            .map(|s| s.contains_key(sandbox_id))
            .unwrap_or(false)
    }

    pub fn set_status(&self, sandbox_id: &str, phase: &str, reason: &str) {
        self.with_sandbox(sandbox_id, |sbx| {
            sbx.status = SandboxStatus {
                phase: phase.to_string(),
                reason: reason.to_string(),
            };
        });
    }

    pub fn set_address(&self, sandbox_id: &str, address: &str) {
        self.with_sandbox(sandbox_id, |sbx| sbx.address = address.to_string());
    }

    pub fn set_logs(&self, sandbox_id: &str, logs: &str) {
        self.with_sandbox(sandbox_id, |sbx| sbx.logs = logs.to_string());
    }

    /// Register a sandbox directly, bypassing `create_sandbox`.
    pub fn insert(&self, namespace: &str, sandbox_id: &str) {
        if let Ok(mut sandboxes) = self.sandboxes.lock() {
            sandboxes.insert(
                sandbox_id.to_string(),
                StubSandbox {
                    namespace: namespace.to_string(),
                    status: SandboxStatus {
                        phase: "Pending".to_string(),
                        reason: String::new(),
                    },
                    address: String::new(),
                    logs: String::new(),
                },
            );
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn fail_address(&self, fail: bool) {
        self.fail_address.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn address_calls(&self) -> usize {
        self.address_calls.load(Ordering::SeqCst)
    }

    fn with_sandbox(&self, sandbox_id: &str, f: impl FnOnce(&mut StubSandbox)) {
        if let Ok(mut sandboxes) = self.sandboxes.lock()
            && let Some(sbx) = sandboxes.get_mut(sandbox_id)
        {
            f(sbx);
        }
    }

    fn lookup(&self, namespace: &str, sandbox_id: &str) -> Option<StubSandbox> {
        self.sandboxes
            .lock()
            .ok()?
            .get(sandbox_id)
            .filter(|sbx| sbx.namespace == namespace)
            .cloned()
    }

    fn unavailable() -> PlatformError {
        PlatformError::Unavailable {
            reason: "stub platform failure".to_string(),
        }
    }
}

#[async_trait]
impl SandboxPlatform for StubPlatform {
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<String, PlatformError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PlatformError::CreationFailed {
                reason: "stub refused to create sandbox".to_string(),
            });
        }
        let sandbox_id = format!("sbx-{}", spec.name);
        self.insert(&spec.namespace, &sandbox_id);
        if let Ok(mut created) = self.created.lock() {
            created.push(spec);
        }
        Ok(sandbox_id)
    }

    async fn status(
        &self,
        namespace: &str,
        sandbox_id: &str,
    ) -> Result<SandboxStatus, PlatformError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self
            .lookup(namespace, sandbox_id)
            .map(|sbx| sbx.status)
            .unwrap_or_else(SandboxStatus::not_found))
    }

    async fn address(&self, namespace: &str, sandbox_id: &str) -> Result<String, PlatformError> {
        self.address_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_address.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.lookup(namespace, sandbox_id)
            .map(|sbx| sbx.address)
            .ok_or_else(|| PlatformError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            })
    }

    async fn logs(&self, namespace: &str, sandbox_id: &str) -> Result<String, PlatformError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.lookup(namespace, sandbox_id)
            .map(|sbx| sbx.logs)
            .ok_or_else(|| PlatformError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            })
    }

    async fn delete(&self, namespace: &str, sandbox_id: &str) -> Result<(), PlatformError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        if let Ok(mut sandboxes) = self.sandboxes.lock()
            && sandboxes
                .get(sandbox_id)
                .is_some_and(|sbx| sbx.namespace == namespace)
        {
            sandboxes.remove(sandbox_id);
        }
        Ok(())
    }
}

/// Audit sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(AuditEvent::kind).collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
