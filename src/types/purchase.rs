//! Purchase-related types
//!
//! A [`Purchase`] is one attempted or completed transaction. It carries the
//! charged amounts, the monotonically growing refund aggregates and the
//! lifecycle state driven by the purchase state machine.

use super::ids::{
    ChargeGroupId, GiftId, MerchantAccountId, PreorderId, ProductId, PurchaseId, SubscriptionId,
    UserId,
};
use super::money::{Cents, Currency};
use super::records::InstallmentPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    /// Initial state: created, charge not resolved yet
    InProgress,
    /// Charge captured and seller balance credited
    Successful,
    Failed,
    /// Deferred-capture product: card authorized, capture happens on release
    PreorderAuthorizationSuccessful,
    PreorderAuthorizationFailed,
    /// The giftee side of a successful gift
    GiftReceiverPurchaseSuccessful,
    GiftReceiverPurchaseFailed,
    /// Recorded without any charge step (e.g. a plan change with nothing to pay)
    NotCharged,
}

impl PurchaseState {
    /// States that count as a completed sale
    pub fn is_successful_family(self) -> bool {
        matches!(
            self,
            PurchaseState::Successful
                | PurchaseState::GiftReceiverPurchaseSuccessful
                | PurchaseState::PreorderAuthorizationSuccessful
                | PurchaseState::NotCharged
        )
    }

    pub fn is_failed_family(self) -> bool {
        matches!(
            self,
            PurchaseState::Failed
                | PurchaseState::PreorderAuthorizationFailed
                | PurchaseState::GiftReceiverPurchaseFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseState::InProgress => "in_progress",
            PurchaseState::Successful => "successful",
            PurchaseState::Failed => "failed",
            PurchaseState::PreorderAuthorizationSuccessful => "preorder_authorization_successful",
            PurchaseState::PreorderAuthorizationFailed => "preorder_authorization_failed",
            PurchaseState::GiftReceiverPurchaseSuccessful => "gift_receiver_purchase_successful",
            PurchaseState::GiftReceiverPurchaseFailed => "gift_receiver_purchase_failed",
            PurchaseState::NotCharged => "not_charged",
        }
    }
}

impl fmt::Display for PurchaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the processor-side charge intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeIntentStatus {
    /// Waiting on the buyer (e.g. 3-D Secure)
    RequiresAction,
    /// Submitted, processor has not answered yet
    Processing,
    Succeeded,
    Canceled,
}

impl ChargeIntentStatus {
    /// An external action is still outstanding
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ChargeIntentStatus::RequiresAction | ChargeIntentStatus::Processing
        )
    }
}

/// Charge processors the ledger knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorId {
    Stripe,
    Braintree,
    /// Buyer pays the seller's PayPal account directly
    PaypalDirect,
}

impl ProcessorId {
    /// Name shown in user-facing messages
    pub fn display_name(self) -> &'static str {
        match self {
            ProcessorId::Stripe => "Stripe",
            ProcessorId::Braintree => "Braintree",
            ProcessorId::PaypalDirect => "PayPal",
        }
    }

    /// Whether funds flow from the buyer straight to the seller
    pub fn is_buyer_direct_to_seller(self) -> bool {
        matches!(self, ProcessorId::PaypalDirect)
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Dispute history of a charged purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chargeback {
    /// Amount the buyer's bank pulled back
    pub amount_cents: Cents,
    /// The dispute was won in the creator's favor
    pub won: bool,
    /// The won amount was already transferred back to the creator
    pub reversal_transferred: bool,
}

/// Charged amounts for a new purchase
///
/// `tax_cents`, `shipping_cents` and `fee_cents` are portions of
/// `price_cents`; `gumroad_tax_cents` is collected on top of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurchaseAmounts {
    pub price_cents: Cents,
    /// Creator-collected tax
    pub tax_cents: Cents,
    /// Platform-collected VAT/GST
    pub gumroad_tax_cents: Cents,
    pub shipping_cents: Cents,
    /// Platform fee
    pub fee_cents: Cents,
}

/// One attempted or completed transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub id: PurchaseId,
    pub external_id: String,
    pub product_id: ProductId,
    pub seller_id: UserId,
    pub currency: Currency,

    pub price_cents: Cents,
    pub tax_cents: Cents,
    pub gumroad_tax_cents: Cents,
    pub shipping_cents: Cents,
    pub fee_cents: Cents,
    /// Everything the buyer paid: price plus platform tax
    pub total_transaction_cents: Cents,

    pub amount_refunded_cents: Cents,
    pub fee_refunded_cents: Cents,
    pub tax_refunded_cents: Cents,
    pub gumroad_tax_refunded_cents: Cents,

    pub state: PurchaseState,
    /// Fully refunded; never true together with `stripe_partially_refunded`
    pub stripe_refunded: bool,
    pub stripe_partially_refunded: bool,

    pub processor: ProcessorId,
    pub merchant_account_id: Option<MerchantAccountId>,
    /// Processor charge id once the charge succeeded
    pub stripe_transaction_id: Option<String>,
    pub processor_payment_intent_id: Option<String>,
    pub charge_intent: Option<ChargeIntentStatus>,
    pub payment_method: String,
    pub combined_charge: Option<ChargeGroupId>,

    pub subscription_id: Option<SubscriptionId>,
    pub is_original_subscription_purchase: bool,
    pub is_upgrade_purchase: bool,
    pub is_resubscription_pending_confirmation: bool,
    pub installment_plan: Option<InstallmentPlan>,

    pub gift_id: Option<GiftId>,
    pub is_gift_sender_purchase: bool,
    pub is_gift_receiver_purchase: bool,

    pub preorder_id: Option<PreorderId>,
    pub is_preorder_authorization: bool,

    pub is_test_purchase: bool,
    pub chargeback: Option<Chargeback>,
    /// Last user-facing error attached to the purchase
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Purchase {
    /// Build a new purchase in the `in_progress` state
    pub fn new(
        id: PurchaseId,
        external_id: impl Into<String>,
        product_id: ProductId,
        seller_id: UserId,
        currency: Currency,
        amounts: PurchaseAmounts,
    ) -> Self {
        Purchase {
            id,
            external_id: external_id.into(),
            product_id,
            seller_id,
            currency,
            price_cents: amounts.price_cents,
            tax_cents: amounts.tax_cents,
            gumroad_tax_cents: amounts.gumroad_tax_cents,
            shipping_cents: amounts.shipping_cents,
            fee_cents: amounts.fee_cents,
            total_transaction_cents: amounts.price_cents + amounts.gumroad_tax_cents,
            amount_refunded_cents: 0,
            fee_refunded_cents: 0,
            tax_refunded_cents: 0,
            gumroad_tax_refunded_cents: 0,
            state: PurchaseState::InProgress,
            stripe_refunded: false,
            stripe_partially_refunded: false,
            processor: ProcessorId::Stripe,
            merchant_account_id: None,
            stripe_transaction_id: None,
            processor_payment_intent_id: None,
            charge_intent: None,
            payment_method: String::new(),
            combined_charge: None,
            subscription_id: None,
            is_original_subscription_purchase: false,
            is_upgrade_purchase: false,
            is_resubscription_pending_confirmation: false,
            installment_plan: None,
            gift_id: None,
            is_gift_sender_purchase: false,
            is_gift_receiver_purchase: false,
            preorder_id: None,
            is_preorder_authorization: false,
            is_test_purchase: false,
            chargeback: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    /// Price still refundable to the buyer
    pub fn amount_refundable_cents(&self) -> Cents {
        (self.price_cents - self.amount_refunded_cents).max(0)
    }

    /// Platform tax still refundable
    pub fn gumroad_tax_refundable_cents(&self) -> Cents {
        (self.gumroad_tax_cents - self.gumroad_tax_refunded_cents).max(0)
    }

    /// Gross amount still refundable through the processor
    pub fn total_refundable_cents(&self) -> Cents {
        self.amount_refundable_cents() + self.gumroad_tax_refundable_cents()
    }

    /// Whether the platform collected tax on this purchase
    pub fn is_platform_tax_responsible(&self) -> bool {
        self.gumroad_tax_cents > 0
    }

    pub fn has_pending_charge_intent(&self) -> bool {
        self.charge_intent.is_some_and(ChargeIntentStatus::is_pending)
    }

    /// The dispute was reversed in the creator's favor
    pub fn is_chargeback_reversed(&self) -> bool {
        self.chargeback.is_some_and(|chargeback| chargeback.won)
    }

    /// Charged back and still lost
    pub fn is_chargedback(&self) -> bool {
        self.chargeback.is_some_and(|chargeback| !chargeback.won)
    }

    /// Part of a multi-item processor charge
    pub fn is_in_combined_charge(&self) -> bool {
        self.combined_charge.is_some()
    }

    /// Any refund, including tax-only ones, was recorded
    pub fn has_refunds(&self) -> bool {
        self.stripe_refunded || self.stripe_partially_refunded
    }
}
