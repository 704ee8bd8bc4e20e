//! Purchase Settlement Library
//! # Overview
//!
//! This library keeps the ledger of a digital-goods storefront: it moves
//! purchases through their lifecycle, settles them with charge processors,
//! records full and partial refunds with their exact flow of funds, and
//! reconciles local state with what the processor reports.
//!
//! # Architecture
//!
//! - [`types`] - Money, identifiers, purchases, refunds and ledger records
//! - [`core`] - Business logic components:
//!   - [`core::state_machine`] - Purchase lifecycle transitions and cascades
//!   - [`core::completion`] - Completion guarantee and out-of-band confirmation
//!   - [`core::creation`] - Purchase creation under per-product inventory locks
//!   - [`core::refund`] - Refund arithmetic and the refund ledger
//!   - [`core::sync_status`] - Reconciliation with the charge processor
//!   - [`core::engine`] - Command-log replay
//! - [`io`] - CSV command log reading and summary output
//! - [`strategy`] - Sequential and concurrent replay pipelines
//! - [`config`], [`logging`], [`cli`] - Process setup
//!
//! # Amounts
//!
//! Every amount is an integer count of the currency's smallest unit. Refund
//! shares are computed with floor division only, so no amount is ever
//! rounded up in the buyer's favor.

pub mod cli;
pub mod config;
pub mod core;
pub mod io;
pub mod logging;
pub mod strategy;
pub mod types;

pub use config::LedgerConfig;
pub use core::{
    CompletionOrchestrator, LedgerEngine, LedgerStore, PurchaseStateMachine, PurchaseSummary,
    RefundLedger, RefundOutcome, SyncStatusWithChargeProcessor,
};
pub use io::write_purchases_csv;
pub use types::{Cents, Currency, LedgerCommand, LedgerError, Money, Purchase, PurchaseState};
