//! Sequential processing strategy
//!
//! Streams the command log through a [`SyncReader`] and applies each
//! command in file order on a single-threaded runtime. Memory grows with
//! the number of purchases, never with the length of the log.

use crate::config::LedgerConfig;
use crate::core::LedgerEngine;
use crate::io::csv_format::write_purchases_csv;
use crate::io::sync_reader::SyncReader;
use crate::strategy::ProcessingStrategy;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Sequential processing strategy
///
/// # Examples
///
/// ```no_run
/// use purchase_settlement::config::LedgerConfig;
/// use purchase_settlement::strategy::{ProcessingStrategy, SequentialStrategy};
/// use std::path::Path;
///
/// let strategy = SequentialStrategy::new(LedgerConfig::default());
/// strategy
///     .process(Path::new("commands.csv"), &mut std::io::stdout())
///     .expect("Processing failed");
/// ```
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    config: LedgerConfig,
}

impl SequentialStrategy {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }
}

impl ProcessingStrategy for SequentialStrategy {
    fn process(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), String> {
        let reader = SyncReader::new(input_path)?;

        // Inventory locks wait with a timeout, so the time driver is required
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;

        let engine = LedgerEngine::new(&self.config);
        let mut rejected = 0usize;

        runtime.block_on(async {
            for result in reader {
                match result {
                    Ok(command) => {
                        let purchase = command.purchase.clone();
                        let kind = command.command.as_str();
                        if let Err(error) = engine.process(command).await {
                            rejected += 1;
                            warn!(%purchase, command = kind, %error, "command rejected");
                        }
                    }
                    Err(error) => {
                        rejected += 1;
                        warn!(%error, "skipping row");
                    }
                }
            }
        });

        let summaries = engine.summaries();
        info!(purchases = summaries.len(), rejected, "replay finished");
        write_purchases_csv(&summaries, output)
    }
}
