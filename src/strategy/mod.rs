//! Processing strategy module
//!
//! A strategy is a complete replay pipeline: read the command log, drive
//! every command through a [`LedgerEngine`](crate::core::LedgerEngine) and
//! write the final purchase summaries. The implementation is picked at
//! runtime from the CLI.

use crate::cli::StrategyType;
use crate::config::LedgerConfig;
use std::io::Write;
use std::path::Path;

pub mod concurrent;
pub mod sequential;

pub use concurrent::{BatchConfig, ConcurrentStrategy};
pub use sequential::SequentialStrategy;

/// Replay pipeline over a command log
pub trait ProcessingStrategy: Send + Sync {
    /// Replay the commands in `input_path` and write purchase summaries to `output`
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The input file cannot be opened
    /// - The async runtime cannot be started
    /// - Output cannot be written
    ///
    /// Rejected commands are logged and skipped; they never fail the run.
    fn process(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), String>;
}

/// Create a processing strategy
///
/// # Arguments
///
/// * `strategy_type` - Sequential or concurrent replay
/// * `batch_config` - Batch settings, ignored by the sequential strategy
/// * `ledger_config` - Lock timeout and default currency for the engine
pub fn create_strategy(
    strategy_type: StrategyType,
    batch_config: Option<BatchConfig>,
    ledger_config: LedgerConfig,
) -> Box<dyn ProcessingStrategy> {
    match strategy_type {
        StrategyType::Sequential => Box::new(SequentialStrategy::new(ledger_config)),
        StrategyType::Concurrent => Box::new(ConcurrentStrategy::new(
            batch_config.unwrap_or_default(),
            ledger_config,
        )),
    }
}
