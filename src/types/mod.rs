//! Types module
//!
//! Contains core data structures used throughout the ledger.
//! This module organizes types into logical submodules:
//! - `money`: integer-cents amounts and currencies
//! - `ids`: identifier newtypes
//! - `purchase`: the purchase record and its lifecycle states
//! - `refund`: refund records and flow-of-funds
//! - `records`: products, sellers, subscriptions, gifts, preorders, balances
//! - `command`: rows of the command log
//! - `error`: error types for the ledger

pub mod command;
pub mod error;
pub mod ids;
pub mod money;
pub mod purchase;
pub mod records;
pub mod refund;

pub use command::{CommandFlags, CommandType, LedgerCommand};
pub use error::{ErrorKind, LedgerError};
pub use ids::{
    ChargeGroupId, GiftId, MerchantAccountId, PreorderId, ProductId, PurchaseId, RefundId,
    SubscriptionId, UserId,
};
pub use money::{floor_share, Cents, Currency, Money};
pub use purchase::{
    ChargeIntentStatus, Chargeback, ProcessorId, Purchase, PurchaseAmounts, PurchaseState,
};
pub use records::{
    BalanceEntry, BalanceEntryKind, Gift, GiftState, HolderOfFunds, InstallmentPlan,
    MerchantAccount, PendingPlanChange, PlanChangeKind, Preorder, PreorderState, Product, Seller,
    Subscription, SubscriptionState,
};
pub use refund::{FlowOfFunds, Refund, RefundStatus};
