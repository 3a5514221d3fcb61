//! Orchestrator for policy-gated sandbox runs.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              Orchestrator                       │
//! │                                                 │
//! │  HTTP API (default :8080, configurable)         │
//! │    POST /runs                                   │
//! │    GET  /runs/{run_id}                          │
//! │    GET  /runs/{run_id}/logs                     │
//! │    POST /runs/{run_id}/stop                     │
//! │    POST /runs/{run_id}/tools/{tool_name}        │
//! │    GET  /health                                 │
//! │                                                 │
//! │  RunOrchestrator                                │
//! │    create_run() -> policy + sandbox + record    │
//! │    get_run() / get_logs() / stop_run()          │
//! │                                                 │
//! │  ToolProxy       scoped tool forwarding         │
//! │  CleanupScheduler  TTL deletion of sandboxes    │
//! └───────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod cleanup;
pub mod run_manager;
pub mod tool_proxy;

pub use api::{ApiState, RunApi};
pub use cleanup::CleanupScheduler;
pub use run_manager::{
    CreateRunRequest, CreateRunResponse, NetworkProfile, RunLogs, RunOrchestrator, RunView,
};
pub use tool_proxy::{ToolInvocation, ToolProxy};
