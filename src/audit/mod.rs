//! Audit trail for security-relevant decisions.
//!
//! Emission is best-effort: a sink must never block or fail the operation
//! being audited. Records are redacted before they leave the process.

pub mod redaction;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::policy::PolicyEvidence;

pub use self::redaction::redact_sensitive;

/// Tracing target audit records are written under.
pub const AUDIT_TARGET: &str = "runguard::audit";

/// A security-relevant event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    RunCreated {
        run_id: String,
        sandbox_name: String,
        runtime_class: String,
        image_digest: String,
        network_policy_profile: String,
        policy_evidence: PolicyEvidence,
    },
    RunCreateDenied {
        reason: String,
        image_ref: String,
        policy_evidence: PolicyEvidence,
    },
    RunStopped {
        run_id: String,
    },
    ToolScopeViolation {
        run_id: String,
        tool_name: String,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::RunCreateDenied { .. } => "run_create_denied",
            Self::RunStopped { .. } => "run_stopped",
            Self::ToolScopeViolation { .. } => "tool_scope_violation",
        }
    }
}

/// A timestamped event as written to the sink: `ts`, `kind`, then the
/// event's own fields.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn now(event: AuditEvent) -> Self {
        Self {
            ts: Utc::now(),
            event,
        }
    }

    /// Render the record as one redacted JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let value = redact_sensitive(serde_json::to_value(self)?);
        serde_json::to_string(&value)
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not block and must swallow its own failures.
    fn emit(&self, event: AuditEvent);
}

/// Writes audit records as JSON lines through `tracing`.
///
/// Shipping and retention are left to whatever subscriber is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let kind = event.kind();
        match AuditRecord::now(event).to_line() {
            Ok(line) => tracing::info!(target: AUDIT_TARGET, kind, "{}", line),
            Err(e) => tracing::warn!(kind, error = %e, "Failed to serialize audit record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_field_order() {
        let record = AuditRecord::now(AuditEvent::ToolScopeViolation {
            run_id: "r1".to_string(),
            tool_name: "exec".to_string(),
        });
        let line = record.to_line().unwrap();

        let ts = line.find("\"ts\"").unwrap();
        let kind = line.find("\"kind\"").unwrap();
        let run_id = line.find("\"run_id\"").unwrap();
        assert!(ts < kind && kind < run_id, "unexpected order: {line}");
        assert!(line.contains("\"kind\":\"tool_scope_violation\""));
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = [
            AuditEvent::RunStopped {
                run_id: "r1".to_string(),
            },
            AuditEvent::ToolScopeViolation {
                run_id: "r1".to_string(),
                tool_name: "exec".to_string(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["kind"], event.kind());
        }
    }

    #[test]
    fn test_tracing_sink_never_panics() {
        TracingAuditSink.emit(AuditEvent::RunStopped {
            run_id: "r1".to_string(),
        });
    }
}
