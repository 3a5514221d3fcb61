//! Forwards tool calls to the tool endpoint inside a run's sandbox.
//!
//! Scope is checked before anything touches the network: a tool outside the
//! run's allowed set is audited and refused without resolving an address.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::audit::{AuditEvent, AuditSink};
use crate::error::RunError;
use crate::platform::SandboxPlatform;
use crate::runs::Run;

/// Result of a forwarded tool call.
///
/// `raw_status` is whatever the sandbox answered with; application-level
/// failures travel here rather than as an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub run_id: String,
    pub tool_name: String,
    /// The sandbox's JSON object, or `{"raw": <body>}` when the body is not
    /// a JSON object.
    pub output: Map<String, Value>,
    pub raw_status: u16,
}

pub struct ToolProxy {
    client: reqwest::Client,
    platform: Arc<dyn SandboxPlatform>,
    audit: Arc<dyn AuditSink>,
}

impl ToolProxy {
    pub fn new(
        platform: Arc<dyn SandboxPlatform>,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
    ) -> Result<Self, RunError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RunError::Internal {
                reason: format!("failed to build tool client: {e}"),
            })?;
        Ok(Self {
            client,
            platform,
            audit,
        })
    }

    /// Invoke `tool_name` inside `run`'s sandbox with `input`.
    pub async fn invoke(
        &self,
        run: &Run,
        tool_name: &str,
        input: Map<String, Value>,
    ) -> Result<ToolInvocation, RunError> {
        if !run.allows_tool(tool_name) {
            tracing::warn!(run_id = %run.run_id, tool_name, "Tool outside run scope");
            self.audit.emit(AuditEvent::ToolScopeViolation {
                run_id: run.run_id.clone(),
                tool_name: tool_name.to_string(),
            });
            return Err(RunError::ToolForbidden {
                run_id: run.run_id.clone(),
                tool_name: tool_name.to_string(),
            });
        }

        let address = self
            .platform
            .address(&run.namespace, &run.sandbox_id)
            .await
            .map_err(|e| RunError::UpstreamUnavailable {
                reason: format!("sandbox address lookup failed: {e}"),
            })?;
        if address.is_empty() {
            return Err(RunError::UpstreamUnavailable {
                reason: format!("sandbox {} has no address yet", run.sandbox_id),
            });
        }

        let url = tool_url(&address, run.downstream_port, tool_name)?;
        tracing::debug!(run_id = %run.run_id, %url, "Forwarding tool call");

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(|e| RunError::UpstreamUnavailable {
                reason: format!("tool call failed: {e}"),
            })?;
        let raw_status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| RunError::UpstreamUnavailable {
                reason: format!("failed to read tool response: {e}"),
            })?;

        Ok(ToolInvocation {
            run_id: run.run_id.clone(),
            tool_name: tool_name.to_string(),
            output: parse_output(&body),
            raw_status,
        })
    }
}

/// `http://<address>:<port>/tools/<tool_name>`, with the tool name encoded
/// as a single path segment.
fn tool_url(address: &str, port: u16, tool_name: &str) -> Result<Url, RunError> {
    let mut url = Url::parse(&format!("http://{address}:{port}/")).map_err(|e| {
        RunError::UpstreamUnavailable {
            reason: format!("invalid sandbox address '{address}': {e}"),
        }
    })?;
    url.path_segments_mut()
        .map_err(|()| RunError::UpstreamUnavailable {
            reason: format!("invalid sandbox address '{address}'"),
        })?
        .clear()
        .push("tools")
        .push(tool_name);
    Ok(url)
}

fn parse_output(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Map<String, Value>>(body) {
        Ok(map) => map,
        Err(_) => {
            let mut raw = Map::new();
            raw.insert(
                "raw".to_string(),
                Value::String(String::from_utf8_lossy(body).into_owned()),
            );
            raw
        }
    }
}
