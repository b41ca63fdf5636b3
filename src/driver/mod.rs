//! Stack lifecycle driver.
//!
//! The driver moves one [`StackRunRecord`] through its state machine by
//! calling the backend, polling to completion and classifying the outcome.
//! It journals every transition before returning and holds no state between
//! stacks.
//!
//! ```text
//! PENDING -> DEPLOYING -> DEPLOYED | DEPLOY_FAILED
//! DEPLOYED -> ROLLING_BACK -> ROLLED_BACK | ROLLBACK_FAILED
//! PENDING -> DELETING -> DELETED | DELETE_FAILED
//! PENDING -> RETAINED
//! ```
//!
//! [`StackRunRecord`]: crate::types::StackRunRecord

pub mod lifecycle;
pub mod poll;

use std::time::Duration;

use thiserror::Error;

use crate::backend::RetryConfig;
use crate::ledger::LedgerError;
use crate::types::{InvalidTransition, StackName, StackRunRecord};

pub use lifecycle::StackDriver;
pub use poll::{PollConfig, PollDecision, PollOperation, PollState};

/// Default timeout for a single backend call.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

/// Highest accepted `STACKLINE_MAX_RETRIES`.
const MAX_RETRIES_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum DriverError {
    /// A transition could not be recorded. The stack must not be touched
    /// further.
    #[error("journal write failed: {0}")]
    Journal(#[from] LedgerError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Receives every record transition and observed backend status.
pub trait Journal {
    fn transition(&mut self, record: &StackRunRecord) -> std::result::Result<(), LedgerError>;

    fn progress(&mut self, stack: &StackName, status: &str) -> std::result::Result<(), LedgerError>;
}

/// Timing and retry settings for the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub deploy_poll: PollConfig,
    pub rollback_poll: PollConfig,
    pub retry: RetryConfig,
    /// Upper bound on any single backend call.
    pub call_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            deploy_poll: PollConfig::new(),
            rollback_poll: PollConfig::new(),
            retry: RetryConfig::DEFAULT,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

impl DriverConfig {
    /// Reads overrides from the environment:
    ///
    /// - `STACKLINE_DEPLOY_TIMEOUT_SECS`
    /// - `STACKLINE_ROLLBACK_TIMEOUT_SECS`
    /// - `STACKLINE_POLL_MAX_INTERVAL_SECS`
    /// - `STACKLINE_MAX_RETRIES`
    ///
    /// Unset or unparsable values keep their defaults. Retries are capped
    /// at 100.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("STACKLINE_DEPLOY_TIMEOUT_SECS") {
            config.deploy_poll.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("STACKLINE_ROLLBACK_TIMEOUT_SECS") {
            config.rollback_poll.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("STACKLINE_POLL_MAX_INTERVAL_SECS") {
            config.deploy_poll.max_interval = Duration::from_secs(secs);
            config.rollback_poll.max_interval = Duration::from_secs(secs);
        }
        if let Some(retries) = env_u64("STACKLINE_MAX_RETRIES") {
            config.retry.max_retries = clamp_retries(retries);
        }
        config
    }
}

fn clamp_retries(retries: u64) -> u32 {
    u32::try_from(retries)
        .unwrap_or(u32::MAX)
        .min(MAX_RETRIES_LIMIT)
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
