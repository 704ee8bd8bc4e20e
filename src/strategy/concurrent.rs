//! Concurrent batch processing strategy
//!
//! Reads the command log in batches and runs each batch through a
//! [`BatchProcessor`], one task per product, on a multi-threaded runtime.
//!
//! # Architecture
//!
//! ```text
//! ConcurrentStrategy
//!     ├── BatchConfig (batch_size, max_concurrent_batches)
//!     ├── AsyncReader (batch CSV reading)
//!     └── BatchProcessor (product partitioning)
//!         └── Arc<LedgerEngine>
//! ```
//!
//! # Ordering
//!
//! Batches run one after another, so a product's commands keep file order
//! even when they span batches. Commands for different products inside a
//! batch may interleave freely.

use crate::config::LedgerConfig;
use crate::core::{BatchProcessor, LedgerEngine};
use crate::io::async_reader::AsyncReader;
use crate::io::csv_format::write_purchases_csv;
use crate::strategy::ProcessingStrategy;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for batch processing
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Number of commands per batch
    pub batch_size: usize,
    /// Number of runtime worker threads
    pub max_concurrent_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_concurrent_batches: num_cpus::get(),
        }
    }
}

impl BatchConfig {
    /// Create a BatchConfig, replacing zero values with the defaults
    pub fn new(batch_size: usize, max_concurrent_batches: usize) -> Self {
        let default = Self::default();

        let batch_size = if batch_size == 0 {
            warn!(default = default.batch_size, "invalid batch_size 0, using default");
            default.batch_size
        } else {
            batch_size
        };

        let max_concurrent_batches = if max_concurrent_batches == 0 {
            warn!(
                default = default.max_concurrent_batches,
                "invalid max_concurrent_batches 0, using default"
            );
            default.max_concurrent_batches
        } else {
            max_concurrent_batches
        };

        Self {
            batch_size,
            max_concurrent_batches,
        }
    }
}

/// Concurrent batch processing strategy
#[derive(Debug, Clone)]
pub struct ConcurrentStrategy {
    batch: BatchConfig,
    ledger: LedgerConfig,
}

impl ConcurrentStrategy {
    pub fn new(batch: BatchConfig, ledger: LedgerConfig) -> Self {
        Self { batch, ledger }
    }
}

impl ProcessingStrategy for ConcurrentStrategy {
    fn process(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.batch.max_concurrent_batches)
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;

        runtime.block_on(async {
            let engine = Arc::new(LedgerEngine::new(&self.ledger));
            let processor = BatchProcessor::new(Arc::clone(&engine));

            let file = tokio::fs::File::open(input_path)
                .await
                .map_err(|e| format!("Failed to open file '{}': {}", input_path.display(), e))?;

            // csv-async reads through the futures io traits
            let compat_file = tokio_util::compat::TokioAsyncReadCompatExt::compat(file);
            let mut reader = AsyncReader::new(compat_file);

            let mut rejected = 0usize;
            loop {
                let batch = reader.read_batch(self.batch.batch_size).await;
                if batch.is_empty() {
                    break;
                }
                debug!(commands = batch.len(), "processing batch");

                for result in processor.process_batch(batch).await {
                    if let Err(error) = result.result {
                        rejected += 1;
                        warn!(
                            purchase = %result.command.purchase,
                            command = result.command.command.as_str(),
                            %error,
                            "command rejected"
                        );
                    }
                }
            }

            let summaries = engine.summaries();
            info!(purchases = summaries.len(), rejected, "replay finished");
            write_purchases_csv(&summaries, output)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const HEADER: &str = "type,purchase,product,seller,buyer,amount,tax,vat,fee,flags\n";

    fn create_temp_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(format!("{HEADER}{rows}").as_bytes())
            .expect("Failed to write to temp file");
        file.flush().expect("Failed to flush temp file");
        file
    }

    fn run(rows: &str, config: BatchConfig) -> String {
        let file = create_temp_csv(rows);
        let mut output = Vec::new();
        ConcurrentStrategy::new(config, LedgerConfig::default())
            .process(file.path(), &mut output)
            .unwrap();
        String::from_utf8(output).unwrap()
    }

    fn line_for<'a>(output: &'a str, purchase: &str) -> &'a str {
        output
            .lines()
            .find(|line| line.starts_with(&format!("{purchase},")))
            .unwrap_or_else(|| panic!("no output row for {purchase}"))
    }

    #[test]
    fn test_concurrent_strategy_processes_multiple_products() {
        let output = run(
            "purchase,a,1,10,20,10.00,,,,\n\
             purchase,b,2,11,21,20.00,,,,\n\
             refund,b,,,,5.00,,,,\n",
            BatchConfig::default(),
        );

        assert_eq!(output.lines().count(), 3);
        assert!(line_for(&output, "a").starts_with("a,successful,10.00,0.00,"));
        assert!(line_for(&output, "b").starts_with("b,successful,20.00,5.00,"));
    }

    #[test]
    fn test_concurrent_strategy_maintains_ordering_across_batches() {
        let output = run(
            "purchase,a,1,10,20,10.00,,,,\n\
             purchase,b,2,11,21,20.00,,,,\n\
             refund,a,,,,3.00,,,,\n\
             refund,b,,,,20.00,,,,\n\
             refund,a,,,,7.00,,,,\n",
            BatchConfig::new(2, 2),
        );

        assert!(line_for(&output, "a").ends_with("10.00,10.00,0.00,0.00,0.00,true,false,false"));
        assert!(line_for(&output, "b").ends_with("20.00,20.00,0.00,0.00,0.00,true,false,false"));
    }

    #[test]
    fn test_concurrent_strategy_handles_missing_file() {
        let mut output = Vec::new();

        let result = ConcurrentStrategy::new(BatchConfig::default(), LedgerConfig::default())
            .process(Path::new("nonexistent.csv"), &mut output);

        assert!(result.unwrap_err().contains("Failed to open file"));
    }

    #[test]
    fn test_batch_config_zero_values_fall_back() {
        let config = BatchConfig::new(0, 0);

        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_concurrent_batches, num_cpus::get());
    }
}
