//! Core business logic module
//!
//! This module contains the settlement ledger components:
//! - `store` - Transactional in-memory persistence
//! - `gateway` - Charge processor abstraction and registry
//! - `sinks` - Notifications and background jobs dispatched after commit
//! - `policy` - Review eligibility and fraud screening
//! - `state_machine` - Purchase lifecycle transitions and their cascades
//! - `completion` - Completion guarantee and out-of-band confirmation
//! - `creation` - Purchase creation under per-product inventory locks
//! - `refund` - Refund arithmetic and the refund ledger
//! - `sync_status` - Reconciliation with the charge processor
//! - `engine` - Command replay orchestration
//! - `batch_processor` - Product-partitioned concurrent batches

pub mod batch_processor;
pub mod completion;
pub mod creation;
pub mod engine;
pub mod gateway;
pub mod policy;
pub mod refund;
pub mod sinks;
pub mod state_machine;
pub mod store;
pub mod sync_status;

pub use batch_processor::{BatchProcessor, ProcessingResult, Stage};
pub use completion::{ensure_completion, CompletionOrchestrator};
pub use creation::{NewPurchase, PurchaseCreator};
pub use engine::{LedgerEngine, PurchaseSummary};
pub use gateway::{ChargeGateway, GatewayRegistry, InMemoryGateway};
pub use refund::{RefundLedger, RefundOutcome};
pub use state_machine::PurchaseStateMachine;
pub use store::LedgerStore;
pub use sync_status::{SyncOutcome, SyncStatusWithChargeProcessor};
