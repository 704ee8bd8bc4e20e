//! Benchmark suite comparing the replay strategies
//!
//! ```bash
//! cargo bench
//! ```
//!
//! Command logs are generated into temporary files before timing starts.
//! Each log spreads purchases over a fixed set of products and mixes in
//! partial refunds, full refunds, platform-tax refunds and reconciliation.

use purchase_settlement::cli::StrategyType;
use purchase_settlement::config::LedgerConfig;
use purchase_settlement::strategy::{create_strategy, BatchConfig};
use std::io::Write;
use tempfile::NamedTempFile;

const PRODUCTS: usize = 50;

fn main() {
    divan::main();
}

/// Build a command log with `purchases` purchases and their follow-ups
fn command_log(purchases: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    writeln!(file, "type,purchase,product,seller,buyer,amount,tax,vat,fee,flags").expect("write header");

    for n in 0..purchases {
        let product = n % PRODUCTS + 1;
        let seller = product + 1000;
        writeln!(file, "purchase,p{n},{product},{seller},{n},49.99,,4.12,5.00,").expect("write row");
        match n % 4 {
            0 => writeln!(file, "refund,p{n},,,,10.00,,,,").expect("write row"),
            1 => writeln!(file, "refund,p{n},,,,,,,,").expect("write row"),
            2 => writeln!(file, "refund_vat,p{n},,,,,,,,").expect("write row"),
            _ => writeln!(file, "sync,p{n},,,,,,,,").expect("write row"),
        }
    }

    file.flush().expect("Failed to flush temp file");
    file
}

#[divan::bench(args = [100, 1_000, 10_000])]
fn sequential_strategy(bencher: divan::Bencher, purchases: usize) {
    let log = command_log(purchases);
    let strategy = create_strategy(StrategyType::Sequential, None, LedgerConfig::default());

    bencher.bench_local(|| {
        let mut output = Vec::new();
        strategy
            .process(log.path(), &mut output)
            .expect("Processing failed");
    });
}

#[divan::bench(args = [100, 1_000, 10_000])]
fn concurrent_strategy(bencher: divan::Bencher, purchases: usize) {
    let log = command_log(purchases);
    let strategy = create_strategy(
        StrategyType::Concurrent,
        Some(BatchConfig::default()),
        LedgerConfig::default(),
    );

    bencher.bench_local(|| {
        let mut output = Vec::new();
        strategy
            .process(log.path(), &mut output)
            .expect("Processing failed");
    });
}
