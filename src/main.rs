//! Purchase Settlement CLI
//!
//! Replays a CSV command log through the settlement ledger and prints the
//! final state of every purchase to stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- commands.csv > purchases.csv
//! cargo run -- --strategy concurrent --batch-size 2000 commands.csv > purchases.csv
//! RUST_LOG=debug cargo run -- --currency eur commands.csv
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (missing arguments, file not found, output not writable, etc.)

use purchase_settlement::{cli, logging, strategy};
use std::process;
use tracing::error;

fn main() {
    let args = cli::parse_args();
    logging::init_logger(&args.log_level);

    let strategy = {
        let batch_config = matches!(args.strategy, cli::StrategyType::Concurrent)
            .then(|| args.to_batch_config());
        strategy::create_strategy(args.strategy, batch_config, args.to_ledger_config())
    };

    let mut output = std::io::stdout();
    if let Err(e) = strategy.process(&args.input_file, &mut output) {
        error!(error = %e, "replay failed");
        process::exit(1);
    }
}
