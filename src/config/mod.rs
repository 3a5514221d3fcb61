//! Configuration for the run control plane.
//!
//! Everything comes from environment variables. A `.env` file in the working
//! directory is loaded first via dotenvy, which never overwrites variables
//! that are already set.

pub(crate) mod helpers;
mod policy;
mod runner;

use crate::error::ConfigError;

pub use self::policy::{PolicyConfig, TrustConfig};
pub use self::runner::RunnerConfig;

/// Main configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub runner: RunnerConfig,
    pub policy: PolicyConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::build()
    }

    fn build() -> Result<Self, ConfigError> {
        Ok(Self {
            runner: RunnerConfig::resolve()?,
            policy: PolicyConfig::resolve()?,
        })
    }
}
