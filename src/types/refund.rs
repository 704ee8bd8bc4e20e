//! Refund records and flow-of-funds value objects

use super::ids::{PurchaseId, RefundId, UserId};
use super::money::{Cents, Currency, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Immutable record of one refund operation against a purchase
///
/// Only `status` and `processor_refund_id` may be backfilled after the
/// processor confirmed the refund.
#[derive(Debug, Clone, PartialEq)]
pub struct Refund {
    pub id: RefundId,
    pub purchase_id: PurchaseId,
    pub currency: Currency,
    /// Gross amount returned through the payment network
    pub total_transaction_cents: Cents,
    /// Portion of the price returned to the buyer
    pub amount_cents: Cents,
    pub creator_tax_cents: Cents,
    pub gumroad_tax_cents: Cents,
    /// Platform fee reversed
    pub fee_cents: Cents,
    pub refunding_user_id: Option<UserId>,
    pub processor_refund_id: Option<String>,
    pub status: RefundStatus,
    pub is_for_fraud: bool,
    pub flow_of_funds: Option<FlowOfFunds>,
    pub created_at: DateTime<Utc>,
}

/// Amounts that moved at each ledger point for one processor operation
///
/// Refund flows carry negative amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOfFunds {
    /// Amount issued to (or taken from) the buyer's payment method
    pub issued_amount: Money,
    /// Amount settled in the platform's settlement currency
    pub settled_amount: Money,
    /// Amount that moved on the platform's own account
    pub gumroad_amount: Money,
    /// Gross amount transferred to/from the merchant account
    pub merchant_account_gross_amount: Option<Money>,
    /// Net amount transferred to/from the merchant account
    pub merchant_account_net_amount: Option<Money>,
}

impl FlowOfFunds {
    /// Zero-sum flow used when the processor did not report one
    ///
    /// Every ledger point moves the same amount in the purchase currency.
    pub fn build_simple_flow_of_funds(currency: Currency, amount_cents: Cents) -> Self {
        let amount = Money::new(currency, amount_cents);
        FlowOfFunds {
            issued_amount: amount,
            settled_amount: amount,
            gumroad_amount: amount,
            merchant_account_gross_amount: None,
            merchant_account_net_amount: None,
        }
    }

    /// Gross refunded to the buyer, as a positive number of cents
    pub fn issued_cents(&self) -> Cents {
        self.issued_amount.cents.abs()
    }
}
