//! Records linked to a purchase
//!
//! Products, sellers, merchant accounts, subscriptions, gifts, preorders and
//! seller-balance entries. The ledger cascades state changes into these but
//! keeps their own logic deliberately small.

use super::ids::{
    GiftId, MerchantAccountId, PreorderId, ProductId, PurchaseId, RefundId, SubscriptionId, UserId,
};
use super::money::{Cents, Currency};
use super::purchase::ProcessorId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Installment plan attached to a product or purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallmentPlan {
    pub number_of_installments: u8,
}

/// A product (link) sold by a seller
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: ProductId,
    pub seller_id: UserId,
    pub currency: Currency,
    pub is_recurring_billing: bool,
    /// Inventory limit; `None` means unlimited
    pub max_purchase_count: Option<u32>,
    pub free_trial_days: Option<u32>,
    pub installment_plan: Option<InstallmentPlan>,
}

impl Product {
    pub fn new(id: ProductId, seller_id: UserId, currency: Currency) -> Self {
        Product {
            id,
            seller_id,
            currency,
            is_recurring_billing: false,
            max_purchase_count: None,
            free_trial_days: None,
            installment_plan: None,
        }
    }

    pub fn is_inventory_limited(&self) -> bool {
        self.max_purchase_count.is_some()
    }
}

/// A seller (creator) account
#[derive(Debug, Clone, PartialEq)]
pub struct Seller {
    pub id: UserId,
    pub refunds_disabled: bool,
    /// Seller turned off the buyer-direct PayPal path
    pub paypal_direct_disabled: bool,
    /// Internal support staff can bypass `refunds_disabled`
    pub is_team_member: bool,
}

impl Seller {
    pub fn new(id: UserId) -> Self {
        Seller {
            id,
            refunds_disabled: false,
            paypal_direct_disabled: false,
            is_team_member: false,
        }
    }
}

/// Which party currently custodies charged money
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderOfFunds {
    /// Funds sit on the platform account and are transferred to the creator
    Platform,
    /// Funds were settled straight into the creator's processor wallet
    Creator,
}

/// Connected processor sub-account through which a creator is paid
#[derive(Debug, Clone, PartialEq)]
pub struct MerchantAccount {
    pub id: MerchantAccountId,
    pub seller_id: UserId,
    pub processor: ProcessorId,
    pub active: bool,
    pub holder_of_funds: HolderOfFunds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Alive,
    /// Cancelled by the buyer, runs until the end of the paid period
    PendingCancellation,
    /// Deactivated immediately
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    Upgrade,
    Resubscription,
}

/// Speculative plan change awaiting payment confirmation
///
/// Holds what the subscription looked like before the change so a failed
/// payment can roll it back.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPlanChange {
    pub kind: PlanChangeKind,
    pub purchase_id: PurchaseId,
    pub previous_price_cents: Cents,
    pub previous_installment_plan: Option<InstallmentPlan>,
    pub previous_original_purchase_id: PurchaseId,
    pub previous_state: SubscriptionState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub product_id: ProductId,
    pub state: SubscriptionState,
    pub price_cents: Cents,
    pub installment_plan: Option<InstallmentPlan>,
    pub free_trial_ends_at: Option<DateTime<Utc>>,
    pub original_purchase_id: PurchaseId,
    /// Payment history, oldest first
    pub purchase_ids: Vec<PurchaseId>,
    pub pending_plan_change: Option<PendingPlanChange>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_alive(&self) -> bool {
        self.state != SubscriptionState::Cancelled
    }

    /// Deactivate now if the buyer already asked to cancel
    ///
    /// Returns whether the subscription was deactivated.
    pub fn cancel_immediately_if_pending_cancellation(&mut self) -> bool {
        if self.state == SubscriptionState::PendingCancellation {
            self.cancel_effective_immediately();
            true
        } else {
            false
        }
    }

    pub fn cancel_effective_immediately(&mut self) {
        self.state = SubscriptionState::Cancelled;
        self.deactivated_at = Some(Utc::now());
    }

    pub fn mark_pending_cancellation(&mut self) {
        if self.state == SubscriptionState::Alive {
            self.state = SubscriptionState::PendingCancellation;
        }
    }

    /// Roll back a resubscription whose payment failed
    pub fn unsubscribe_and_restore_previous_plan(&mut self) {
        if let Some(change) = self.pending_plan_change.take() {
            self.price_cents = change.previous_price_cents;
            self.installment_plan = change.previous_installment_plan;
            self.original_purchase_id = change.previous_original_purchase_id;
            self.purchase_ids.retain(|id| *id != change.purchase_id);
        }
        self.cancel_effective_immediately();
    }

    /// Roll back an upgrade whose payment failed
    ///
    /// Returns the purchase that is the original purchase of record again.
    pub fn restore_previous_original_purchase(&mut self) -> Option<PurchaseId> {
        let change = self.pending_plan_change.take()?;
        self.price_cents = change.previous_price_cents;
        self.installment_plan = change.previous_installment_plan;
        self.original_purchase_id = change.previous_original_purchase_id;
        self.state = change.previous_state;
        self.purchase_ids.retain(|id| *id != change.purchase_id);
        Some(change.previous_original_purchase_id)
    }

    /// Commit a confirmed upgrade or resubscription
    ///
    /// Returns the applied change so the caller can move the
    /// original-purchase flag.
    pub fn apply_pending_plan_change(&mut self) -> Option<PendingPlanChange> {
        let change = self.pending_plan_change.take()?;
        match change.kind {
            PlanChangeKind::Upgrade => {
                self.original_purchase_id = change.purchase_id;
            }
            PlanChangeKind::Resubscription => {
                self.state = SubscriptionState::Alive;
                self.deactivated_at = None;
            }
        }
        Some(change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiftState {
    InProgress,
    Successful,
    Failed,
}

/// A purchase bought by one person for another
#[derive(Debug, Clone, PartialEq)]
pub struct Gift {
    pub id: GiftId,
    pub gifter_purchase_id: PurchaseId,
    pub giftee_purchase_id: PurchaseId,
    pub state: GiftState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreorderState {
    InProgress,
    AuthorizationSuccessful,
    /// Authorized through a test purchase; never captured
    TestAuthorizationSuccessful,
    AuthorizationFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preorder {
    pub id: PreorderId,
    pub product_id: ProductId,
    pub purchase_id: PurchaseId,
    pub state: PreorderState,
}

/// Kinds of movement on a seller's balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceEntryKind {
    /// Net sale proceeds credited after a successful charge
    SaleCredit,
    /// Refunded amount taken back from the seller
    RefundDebit,
    /// Won-dispute transfer reversed because the buyer is refunded anyway
    DisputeReversal,
    /// Transfer share of already-refunded platform tax reversed on a partial refund
    ExcessTransferReversal,
    /// Platform keeps its fee on a refund
    RefundFeeRetention,
}

/// One signed movement on a seller balance
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceEntry {
    pub seller_id: UserId,
    pub kind: BalanceEntryKind,
    /// Positive credits, negative debits
    pub amount_cents: Cents,
    pub purchase_id: PurchaseId,
    pub refund_id: Option<RefundId>,
}
