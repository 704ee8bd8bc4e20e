//! Ledger commands read from the command log
//!
//! Each row of the input CSV becomes one [`LedgerCommand`]. Amounts stay in
//! major units here; the engine converts them with the purchase currency.

use super::ids::{ChargeGroupId, ProductId, UserId};
use super::records::PlanChangeKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Operations the command log can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Create and charge a purchase
    Purchase,
    /// Confirm a purchase waiting on an out-of-band authentication step
    Confirm,
    /// Full or partial refund
    Refund,
    /// Refund only the platform-collected tax
    RefundVat,
    FraudRefund,
    /// Reconcile with the charge processor
    Sync,
    /// Record a chargeback against the purchase
    Chargeback,
    /// Buyer cancelled the subscription at period end
    PendingCancel,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Purchase => "purchase",
            CommandType::Confirm => "confirm",
            CommandType::Refund => "refund",
            CommandType::RefundVat => "refund_vat",
            CommandType::FraudRefund => "fraud_refund",
            CommandType::Sync => "sync",
            CommandType::Chargeback => "chargeback",
            CommandType::PendingCancel => "pending_cancel",
        }
    }
}

/// Optional modifiers attached to a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFlags {
    pub preorder: bool,
    pub gift: bool,
    pub recurring: bool,
    pub test: bool,
    pub paypal: bool,
    pub no_charge: bool,
    pub refunds_disabled: bool,
    /// The acting user is internal support staff
    pub team: bool,
    pub won: bool,
    pub transferred: bool,
    pub limit: Option<u32>,
    pub charge: Option<ChargeGroupId>,
    pub payment_method: Option<String>,
    /// Client-side confirmation failure message
    pub error: Option<String>,
    /// Upgrade or resubscription of the subscription the named purchase
    /// (external id) belongs to
    pub plan_change: Option<(PlanChangeKind, String)>,
}

/// One parsed row of the command log
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerCommand {
    pub command: CommandType,
    /// External purchase id
    pub purchase: String,
    pub product: Option<ProductId>,
    pub seller: Option<UserId>,
    /// Buyer for purchases, acting user for refunds
    pub user: Option<UserId>,
    pub amount: Option<Decimal>,
    pub tax: Option<Decimal>,
    pub vat: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub flags: CommandFlags,
}
