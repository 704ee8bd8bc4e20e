//! Ledger configuration
//!
//! Values come from the environment first and can be overridden by CLI
//! arguments:
//!
//! | variable                    | default |
//! |-----------------------------|---------|
//! | `LEDGER_LOCK_TIMEOUT_SECS`  | 50      |
//! | `LEDGER_CURRENCY`           | usd     |

use crate::core::creation::DEFAULT_LOCK_TIMEOUT;
use crate::types::Currency;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Bound on the wait for a product's inventory lock
    pub inventory_lock_timeout: Duration,
    /// Currency of products created from the command log
    pub currency: Currency,
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; unparsable values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            inventory_lock_timeout: lookup("LEDGER_LOCK_TIMEOUT_SECS")
                .and_then(|secs| secs.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT),
            currency: lookup("LEDGER_CURRENCY")
                .and_then(|code| code.parse().ok())
                .unwrap_or_default(),
        }
    }

    /// Apply explicit overrides on top of the environment
    pub fn with_overrides(mut self, lock_timeout_secs: Option<u64>, currency: Option<Currency>) -> Self {
        if let Some(secs) = lock_timeout_secs {
            self.inventory_lock_timeout = Duration::from_secs(secs);
        }
        if let Some(currency) = currency {
            self.currency = currency;
        }
        self
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
