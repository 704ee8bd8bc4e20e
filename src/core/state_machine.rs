//! Purchase lifecycle
//!
//! This module drives one purchase from `in_progress` to a resolved state
//! and cascades the change into the records linked to it (gift, preorder,
//! subscription, seller balance).
//!
//! The transition functions work on a staged [`LedgerState`] so callers can
//! combine them with other writes inside a single `LedgerStore::transaction`.
//! They return the background jobs to fan out once that transaction has
//! committed. [`PurchaseStateMachine`] wraps each of them in its own
//! transaction for callers that need nothing else.

use crate::core::sinks::{Job, SideEffects};
use crate::core::store::{LedgerState, LedgerStore};
use crate::types::{
    BalanceEntry, BalanceEntryKind, ChargeIntentStatus, GiftState, LedgerError, PlanChangeKind,
    PreorderState, PurchaseId, PurchaseState, Subscription, SubscriptionId, SubscriptionState,
};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};

/// Guard a transition: the purchase must currently be in one of `allowed`
fn expect_state(
    state: &LedgerState,
    purchase_id: PurchaseId,
    allowed: &[PurchaseState],
    to: PurchaseState,
) -> Result<(), LedgerError> {
    let current = state.purchase(purchase_id)?.state;
    if allowed.contains(&current) {
        Ok(())
    } else {
        Err(LedgerError::invalid_transition(purchase_id, current, to))
    }
}

/// Credit the seller with the net proceeds of a paid, non-test purchase
fn credit_sale(state: &mut LedgerState, purchase_id: PurchaseId) -> Result<(), LedgerError> {
    let purchase = state.purchase(purchase_id)?;
    if purchase.is_test_purchase || purchase.is_free() {
        return Ok(());
    }

    let entry = BalanceEntry {
        seller_id: purchase.seller_id,
        kind: BalanceEntryKind::SaleCredit,
        amount_cents: purchase.price_cents - purchase.fee_cents,
        purchase_id,
        refund_id: None,
    };
    state.record_balance_entry(entry);
    Ok(())
}

fn mark_successful(state: &mut LedgerState, purchase_id: PurchaseId) -> Result<(), LedgerError> {
    let purchase = state.purchase_mut(purchase_id)?;
    purchase.state = PurchaseState::Successful;
    purchase.error_message = None;
    if purchase.charge_intent.is_some() {
        purchase.charge_intent = Some(ChargeIntentStatus::Succeeded);
    }
    Ok(())
}

/// Authorization hold placed for a deferred-capture product
fn authorize_preorder(state: &mut LedgerState, purchase_id: PurchaseId) -> Result<Vec<Job>, LedgerError> {
    let purchase = state.purchase_mut(purchase_id)?;
    purchase.state = PurchaseState::PreorderAuthorizationSuccessful;
    purchase.error_message = None;
    let is_test = purchase.is_test_purchase;
    let preorder_id = purchase.preorder_id;

    if let Some(preorder_id) = preorder_id {
        state.preorder_mut(preorder_id)?.state = if is_test {
            PreorderState::TestAuthorizationSuccessful
        } else {
            PreorderState::AuthorizationSuccessful
        };
    }

    info!(purchase = %purchase_id, test = is_test, "preorder authorized");
    Ok(Vec::new())
}

/// Start the subscription a first recurring or installment payment creates
fn create_subscription(state: &mut LedgerState, purchase_id: PurchaseId) -> Result<(), LedgerError> {
    let purchase = state.purchase(purchase_id)?.clone();
    let product = state.product(purchase.product_id)?.clone();

    let giftee_id = match purchase.gift_id {
        Some(gift_id) if purchase.is_gift_sender_purchase => Some(state.gift(gift_id)?.giftee_purchase_id),
        _ => None,
    };

    let mut purchase_ids = vec![purchase_id];
    purchase_ids.extend(giftee_id);

    let subscription = Subscription {
        id: SubscriptionId(state.next_id()),
        product_id: product.id,
        state: SubscriptionState::Alive,
        price_cents: purchase.price_cents,
        installment_plan: purchase.installment_plan.or(product.installment_plan),
        free_trial_ends_at: product
            .free_trial_days
            .map(|days| purchase.created_at + Duration::days(i64::from(days))),
        original_purchase_id: purchase_id,
        purchase_ids,
        pending_plan_change: None,
        deactivated_at: None,
    };
    let subscription_id = subscription.id;
    state.save_subscription(subscription);

    let purchase = state.purchase_mut(purchase_id)?;
    purchase.subscription_id = Some(subscription_id);
    purchase.is_original_subscription_purchase = true;
    if let Some(giftee_id) = giftee_id {
        state.purchase_mut(giftee_id)?.subscription_id = Some(subscription_id);
    }

    debug!(purchase = %purchase_id, subscription = %subscription_id, "subscription created");
    Ok(())
}

/// Generic success path
///
/// # Errors
///
/// Returns `LedgerError::InvalidTransition` unless the purchase is
/// `in_progress` (or `failed` when `recovering`).
pub fn apply_success(
    state: &mut LedgerState,
    purchase_id: PurchaseId,
    recovering: bool,
) -> Result<Vec<Job>, LedgerError> {
    let allowed: &[PurchaseState] = if recovering {
        &[PurchaseState::InProgress, PurchaseState::Failed]
    } else {
        &[PurchaseState::InProgress]
    };
    let purchase = state.purchase(purchase_id)?.clone();

    if purchase.is_preorder_authorization {
        let allowed: &[PurchaseState] = if recovering {
            &[PurchaseState::InProgress, PurchaseState::PreorderAuthorizationFailed]
        } else {
            &[PurchaseState::InProgress]
        };
        expect_state(state, purchase_id, allowed, PurchaseState::PreorderAuthorizationSuccessful)?;
        return authorize_preorder(state, purchase_id);
    }
    expect_state(state, purchase_id, allowed, PurchaseState::Successful)?;

    if purchase.is_gift_sender_purchase {
        if let Some(gift_id) = purchase.gift_id {
            let gift = state.gift_mut(gift_id)?;
            gift.state = GiftState::Successful;
            let giftee_id = gift.giftee_purchase_id;
            state.purchase_mut(giftee_id)?.state = PurchaseState::GiftReceiverPurchaseSuccessful;
        }
    }

    let product = state.product(purchase.product_id)?;
    let needs_subscription = (product.is_recurring_billing
        || purchase.installment_plan.is_some()
        || product.installment_plan.is_some())
        && purchase.subscription_id.is_none();
    if needs_subscription {
        create_subscription(state, purchase_id)?;
    }

    credit_sale(state, purchase_id)?;
    mark_successful(state, purchase_id)?;

    info!(purchase = %purchase_id, recovering, "purchase successful");
    Ok(vec![
        Job::ActivateIntegrations { purchase_id },
        Job::RecalculateBalance {
            seller_id: purchase.seller_id,
        },
    ])
}

/// Commit a confirmed upgrade or resubscription
fn apply_plan_change(
    state: &mut LedgerState,
    purchase_id: PurchaseId,
    subscription_id: SubscriptionId,
) -> Result<Vec<Job>, LedgerError> {
    expect_state(state, purchase_id, &[PurchaseState::InProgress], PurchaseState::Successful)?;

    let change = state.subscription_mut(subscription_id)?.apply_pending_plan_change();
    if let Some(change) = change {
        if change.kind == PlanChangeKind::Upgrade
            && change.previous_original_purchase_id != purchase_id
        {
            state
                .purchase_mut(change.previous_original_purchase_id)?
                .is_original_subscription_purchase = false;
            state.purchase_mut(purchase_id)?.is_original_subscription_purchase = true;
        }
    }
    state
        .purchase_mut(purchase_id)?
        .is_resubscription_pending_confirmation = false;

    credit_sale(state, purchase_id)?;
    mark_successful(state, purchase_id)?;

    let seller_id = state.purchase(purchase_id)?.seller_id;
    info!(purchase = %purchase_id, subscription = %subscription_id, "plan change applied");
    Ok(vec![Job::RecalculateBalance { seller_id }])
}

/// Resolve a purchase whose charge went through
///
/// Exactly one path runs, picked in priority order: preorder
/// authorization, then a pending upgrade or resubscription, then the
/// generic success path.
pub fn apply_charge_success(
    state: &mut LedgerState,
    purchase_id: PurchaseId,
) -> Result<Vec<Job>, LedgerError> {
    let purchase = state.purchase(purchase_id)?;

    if purchase.is_preorder_authorization {
        return apply_success(state, purchase_id, false);
    }

    match purchase.subscription_id {
        Some(subscription_id)
            if purchase.is_upgrade_purchase || purchase.is_resubscription_pending_confirmation =>
        {
            apply_plan_change(state, purchase_id, subscription_id)
        }
        _ => apply_success(state, purchase_id, false),
    }
}

/// Record a purchase that needed no charge at all
pub fn apply_not_charged(
    state: &mut LedgerState,
    purchase_id: PurchaseId,
) -> Result<Vec<Job>, LedgerError> {
    expect_state(state, purchase_id, &[PurchaseState::InProgress], PurchaseState::NotCharged)?;

    let purchase = state.purchase(purchase_id)?.clone();
    if let Some(subscription_id) = purchase.subscription_id {
        if purchase.is_upgrade_purchase || purchase.is_resubscription_pending_confirmation {
            state.subscription_mut(subscription_id)?.apply_pending_plan_change();
        }
    }

    let purchase = state.purchase_mut(purchase_id)?;
    purchase.state = PurchaseState::NotCharged;
    purchase.is_resubscription_pending_confirmation = false;

    info!(purchase = %purchase_id, "purchase recorded without charge");
    Ok(vec![Job::ActivateIntegrations { purchase_id }])
}

/// Failure path, cascaded to every linked record
///
/// Failing an already failed purchase is a no-op.
pub fn apply_failure(
    state: &mut LedgerState,
    purchase_id: PurchaseId,
    error_message: Option<String>,
) -> Result<(), LedgerError> {
    let purchase = state.purchase(purchase_id)?.clone();
    if purchase.state.is_failed_family() {
        return Ok(());
    }

    let to = if purchase.is_preorder_authorization {
        PurchaseState::PreorderAuthorizationFailed
    } else {
        PurchaseState::Failed
    };
    expect_state(state, purchase_id, &[PurchaseState::InProgress], to)?;

    {
        let row = state.purchase_mut(purchase_id)?;
        row.state = to;
        row.error_message = error_message;
        if row.has_pending_charge_intent() {
            row.charge_intent = Some(ChargeIntentStatus::Canceled);
        }
    }

    if let Some(preorder_id) = purchase.preorder_id.filter(|_| purchase.is_preorder_authorization) {
        state.preorder_mut(preorder_id)?.state = PreorderState::AuthorizationFailed;
    }

    if let Some(gift_id) = purchase.gift_id {
        let gift = state.gift_mut(gift_id)?;
        gift.state = GiftState::Failed;
        let (gifter_id, giftee_id) = (gift.gifter_purchase_id, gift.giftee_purchase_id);

        let giftee = state.purchase_mut(giftee_id)?;
        if !giftee.state.is_failed_family() {
            giftee.state = PurchaseState::GiftReceiverPurchaseFailed;
        }
        let gifter = state.purchase_mut(gifter_id)?;
        if gifter.state == PurchaseState::InProgress {
            gifter.state = PurchaseState::Failed;
        }
    }

    if let Some(subscription_id) = purchase.subscription_id {
        if purchase.is_resubscription_pending_confirmation {
            state
                .subscription_mut(subscription_id)?
                .unsubscribe_and_restore_previous_plan();
            state
                .purchase_mut(purchase_id)?
                .is_resubscription_pending_confirmation = false;
        } else if purchase.is_upgrade_purchase {
            let restored = state
                .subscription_mut(subscription_id)?
                .restore_previous_original_purchase();
            if let Some(previous_id) = restored {
                state.purchase_mut(previous_id)?.is_original_subscription_purchase = true;
                state.purchase_mut(purchase_id)?.is_original_subscription_purchase = false;
            }
        }
    }

    info!(purchase = %purchase_id, state = %to, "purchase failed");
    Ok(())
}

/// Transactional front for the lifecycle transitions
#[derive(Debug, Clone)]
pub struct PurchaseStateMachine {
    store: Arc<LedgerStore>,
    effects: SideEffects,
}

impl PurchaseStateMachine {
    pub fn new(store: Arc<LedgerStore>, effects: SideEffects) -> Self {
        PurchaseStateMachine { store, effects }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Commit a successful charge and run the matching success path
    ///
    /// # Arguments
    ///
    /// * `purchase_id` - The purchase whose charge went through
    /// * `charge_id` - Processor charge id to record, if the charge has one
    ///
    /// # Errors
    ///
    /// Returns an error if the purchase is not `in_progress`.
    pub fn handle_charge_success(
        &self,
        purchase_id: PurchaseId,
        charge_id: Option<String>,
    ) -> Result<(), LedgerError> {
        let jobs = self.store.transaction(|state| {
            if let Some(charge_id) = charge_id {
                state.purchase_mut(purchase_id)?.stripe_transaction_id = Some(charge_id);
            }
            apply_charge_success(state, purchase_id)
        })?;
        self.effects.enqueue_all(jobs);
        Ok(())
    }

    /// Generic success path in its own transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the purchase is not `in_progress`.
    pub fn handle_purchase_success(&self, purchase_id: PurchaseId) -> Result<(), LedgerError> {
        let jobs = self
            .store
            .transaction(|state| apply_success(state, purchase_id, false))?;
        self.effects.enqueue_all(jobs);
        Ok(())
    }

    /// Explicit failed-to-successful recovery after the processor reported
    /// the charge as succeeded
    pub fn recover_purchase(&self, purchase_id: PurchaseId, charge_id: String) -> Result<(), LedgerError> {
        let jobs = self.store.transaction(|state| {
            state.purchase_mut(purchase_id)?.stripe_transaction_id = Some(charge_id);
            apply_success(state, purchase_id, true)
        })?;
        self.effects.enqueue_all(jobs);
        Ok(())
    }

    pub fn handle_not_charged(&self, purchase_id: PurchaseId) -> Result<(), LedgerError> {
        let jobs = self
            .store
            .transaction(|state| apply_not_charged(state, purchase_id))?;
        self.effects.enqueue_all(jobs);
        Ok(())
    }

    /// Mark the purchase and everything linked to it as failed
    ///
    /// # Errors
    ///
    /// Returns an error if the purchase already resolved to a non-failed state.
    pub fn handle_purchase_failure(
        &self,
        purchase_id: PurchaseId,
        error_message: Option<String>,
    ) -> Result<(), LedgerError> {
        self.store
            .transaction(|state| apply_failure(state, purchase_id, error_message))
    }
}
