//! Control plane for short-lived, policy-gated sandbox runs.
//!
//! Images are admitted by [`policy::PolicyEnforcer`], launched through a
//! [`platform::SandboxPlatform`], tracked in a [`runs::RunRegistry`] and
//! exposed over HTTP by [`orchestrator::RunApi`].

pub mod audit;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod policy;
pub mod runs;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use error::{ConfigError, PlatformError, RunError, VerifyError};
