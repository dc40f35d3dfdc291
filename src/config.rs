//! Tree configuration.
//!
//! The only knob is the retry budget: how many times a single `get`, `put`,
//! `delete` or scan step may restart its traversal before giving up with
//! [`MasstreeError::RetryLimitExceeded`](crate::MasstreeError::RetryLimitExceeded).
//!
//! # Environment
//!
//! - `MASSTREE_MAX_RETRIES`: overrides [`DEFAULT_MAX_RETRIES`]. Read once per process
//!   by [`TreeConfig::global`].

use std::env;
use std::sync::OnceLock;

use crate::tracing_helpers::warn_log;

/// Default restart budget for one operation.
pub const DEFAULT_MAX_RETRIES: u32 = 1_000_000;

/// Environment variable read by [`TreeConfig::from_env`].
pub const MAX_RETRIES_ENV: &str = "MASSTREE_MAX_RETRIES";

/// Per-tree configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Restarts allowed per operation; the next one fails. At least 1.
    pub max_retries: u32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl TreeConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Unparseable or zero values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = env::var(MAX_RETRIES_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.max_retries = n,
                _ => {
                    warn_log!(value = %raw, "ignoring invalid {}", MAX_RETRIES_ENV);
                }
            }
        }

        config
    }

    /// Process-wide config, read from the environment on first use.
    #[must_use]
    pub fn global() -> Self {
        static GLOBAL: OnceLock<TreeConfig> = OnceLock::new();

        *GLOBAL.get_or_init(Self::from_env)
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = if max_retries == 0 { 1 } else { max_retries };
        self
    }
}
