use crate::config::LedgerConfig;
use crate::strategy::BatchConfig;
use crate::types::Currency;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Replay a purchase command log and report the settled ledger
#[derive(Parser, Debug)]
#[command(name = "purchase-settlement")]
#[command(about = "Replay purchase, refund and reconciliation commands", long_about = None)]
pub struct CliArgs {
    /// Input CSV file path containing ledger commands
    #[arg(value_name = "INPUT", help = "Path to the input CSV file")]
    pub input_file: PathBuf,

    #[arg(
        long = "strategy",
        value_name = "STRATEGY",
        default_value = "sequential",
        help = "Replay strategy: 'sequential' or 'concurrent' (partitioned by product)"
    )]
    pub strategy: StrategyType,

    /// Number of commands per batch (concurrent mode only)
    #[arg(long = "batch-size", value_name = "SIZE", help = "Commands per batch (default: 1000)")]
    pub batch_size: Option<usize>,

    /// Worker threads (concurrent mode only)
    #[arg(
        long = "max-concurrent",
        value_name = "COUNT",
        help = "Worker threads for concurrent replay (default: CPU cores)"
    )]
    pub max_concurrent_batches: Option<usize>,

    /// Overrides LEDGER_LOCK_TIMEOUT_SECS
    #[arg(long = "lock-timeout", value_name = "SECS", help = "Seconds to wait for a product inventory lock")]
    pub lock_timeout_secs: Option<u64>,

    /// Overrides LEDGER_CURRENCY
    #[arg(long = "currency", value_name = "CODE", help = "Currency of products created from the log")]
    pub currency: Option<Currency>,

    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        default_value = "warn",
        env = "LEDGER_LOG",
        help = "Log level used when RUST_LOG is unset"
    )]
    pub log_level: String,
}

/// Available replay strategies
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyType {
    Sequential,
    Concurrent,
}

impl CliArgs {
    /// Create a BatchConfig from CLI arguments
    ///
    /// Missing values fall back to the defaults; zero values are replaced
    /// with a warning.
    pub fn to_batch_config(&self) -> BatchConfig {
        if self.batch_size.is_none() && self.max_concurrent_batches.is_none() {
            return BatchConfig::default();
        }
        let default = BatchConfig::default();
        BatchConfig::new(
            self.batch_size.unwrap_or(default.batch_size),
            self.max_concurrent_batches
                .unwrap_or(default.max_concurrent_batches),
        )
    }

    /// Ledger configuration from the environment with CLI overrides applied
    pub fn to_ledger_config(&self) -> LedgerConfig {
        LedgerConfig::from_env().with_overrides(self.lock_timeout_secs, self.currency)
    }
}
