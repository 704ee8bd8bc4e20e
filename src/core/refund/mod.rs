//! Refund ledger
//!
//! This module computes and records refunds so that the buyer, the creator
//! and the platform each get back (or give back) their own non-overlapping
//! portion of a purchase, taxes included.
//!
//! # Ordering
//!
//! The processor refund happens first and is not transactional with the
//! store. The local ledger application then runs in one store transaction.
//! If the processor refunded but the local commit failed, the purchase is
//! repaired by `SyncStatusWithChargeProcessor`, which re-applies the
//! missing gross.
//!
//! # Submodules
//!
//! - `calculator` - pure refund arithmetic
//! - `application` - the transactional ledger step

pub mod application;
pub mod calculator;

pub use application::{refund_purchase, AppliedRefund, RefundApplication, RefundKind};

use crate::core::gateway::{GatewayError, GatewayRegistry, RefundRequest};
use crate::core::sinks::SideEffects;
use crate::core::store::LedgerStore;
use crate::types::{
    Cents, FlowOfFunds, LedgerError, ProcessorId, Purchase, PurchaseId, RefundId, RefundStatus,
    UserId,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What a refund operation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded {
        refund_id: RefundId,
        /// The purchase is now fully refunded
        full: bool,
    },
    /// Nothing to refund; the end state already matches the request
    NoOp,
}

#[derive(Debug, Clone)]
pub struct RefundLedger {
    store: Arc<LedgerStore>,
    gateways: GatewayRegistry,
    effects: SideEffects,
}

impl RefundLedger {
    pub fn new(store: Arc<LedgerStore>, gateways: GatewayRegistry, effects: SideEffects) -> Self {
        RefundLedger {
            store,
            gateways,
            effects,
        }
    }

    /// Refund a purchase, fully or partially
    ///
    /// # Arguments
    ///
    /// * `purchase_id` - The purchase to refund
    /// * `refunding_user_id` - Who asked for the refund
    /// * `amount_cents` - Portion of the price to refund; `None` refunds
    ///   everything still refundable
    ///
    /// # Returns
    ///
    /// `RefundOutcome::NoOp` when there is nothing left to refund.
    ///
    /// # Errors
    ///
    /// - `NonPositiveRefundAmount` / `RefundAmountExceedsPrice` for a bad
    ///   amount; no ledger field changes
    /// - the validation and processor errors of [`RefundLedger::refund_and_save`]
    pub fn refund(
        &self,
        purchase_id: PurchaseId,
        refunding_user_id: Option<UserId>,
        amount_cents: Option<Cents>,
    ) -> Result<RefundOutcome, LedgerError> {
        let Some(amount_cents) = amount_cents else {
            return self.refund_and_save(purchase_id, refunding_user_id, None, false);
        };
        if amount_cents <= 0 {
            return Err(LedgerError::NonPositiveRefundAmount);
        }

        let purchase = self.store.purchase(purchase_id)?;
        let refundable = purchase.amount_refundable_cents();
        if amount_cents > refundable {
            warn!(purchase = %purchase_id, amount_cents, refundable, "refund above refundable amount");
            return Err(LedgerError::RefundAmountExceedsPrice {
                requested: amount_cents,
                refundable,
            });
        }

        // equivalent to a full refund; skip the proportional math
        if amount_cents == purchase.price_cents || amount_cents == refundable {
            return self.refund_and_save(purchase_id, refunding_user_id, None, false);
        }

        self.refund_and_save(purchase_id, refunding_user_id, Some(amount_cents), false)
    }

    /// Refund through the processor, then record it
    ///
    /// # Errors
    ///
    /// - `MerchantAccountInactive` / `PaymentMethodDisabled` naming the processor
    /// - `RefundsDisabled` unless the refunding user is a team member
    /// - `InsufficientFunds`, `ProcessorRejected` or `TemporaryProblem` from
    ///   the processor
    /// - `InvalidRefund` if the processor refunded but the ledger could not
    ///   record it
    pub fn refund_and_save(
        &self,
        purchase_id: PurchaseId,
        refunding_user_id: Option<UserId>,
        amount_cents: Option<Cents>,
        is_for_fraud: bool,
    ) -> Result<RefundOutcome, LedgerError> {
        let purchase = self.store.purchase(purchase_id)?;
        let Some(transaction_id) = purchase.stripe_transaction_id.clone() else {
            return Ok(RefundOutcome::NoOp);
        };
        if purchase.stripe_refunded || purchase.total_refundable_cents() == 0 {
            return Ok(RefundOutcome::NoOp);
        }
        self.check_refundable(&purchase, refunding_user_id)?;

        let gross_cents = match amount_cents {
            Some(amount) => Some(calculator::partial_gross_cents(&purchase, amount)),
            // a line item of a combined charge refunds only itself
            None if purchase.is_in_combined_charge() => Some(purchase.total_refundable_cents()),
            None => None,
        };

        let request = RefundRequest {
            transaction_id,
            amount_cents: gross_cents,
            currency: purchase.currency,
            merchant_account: purchase.merchant_account_id,
            reverse_transfer: !purchase.is_chargeback_reversed(),
            is_for_fraud,
        };
        let gateway = self.gateways.get(purchase.processor)?;
        let charge_refund = match gateway.refund(&request) {
            Ok(charge_refund) => charge_refund,
            Err(error) => return map_gateway_error(&purchase, error),
        };

        let gross_cents = gross_cents.unwrap_or(charge_refund.amount_cents);
        let flow_of_funds = charge_refund
            .flow_of_funds
            .unwrap_or_else(|| FlowOfFunds::build_simple_flow_of_funds(purchase.currency, -gross_cents));

        self.apply(RefundApplication {
            purchase_id,
            kind: RefundKind::Standard,
            gross_cents,
            refunding_user_id,
            processor_refund_id: Some(charge_refund.id),
            status: charge_refund.status,
            flow_of_funds,
            is_for_fraud,
        })
    }

    /// Refund only the platform-collected tax still refundable
    ///
    /// # Errors
    ///
    /// Same as [`RefundLedger::refund_and_save`].
    pub fn refund_gumroad_taxes(
        &self,
        purchase_id: PurchaseId,
        refunding_user_id: Option<UserId>,
    ) -> Result<RefundOutcome, LedgerError> {
        let purchase = self.store.purchase(purchase_id)?;
        let Some(transaction_id) = purchase.stripe_transaction_id.clone() else {
            return Ok(RefundOutcome::NoOp);
        };
        let tax_cents = purchase.gumroad_tax_refundable_cents();
        if purchase.stripe_refunded || tax_cents == 0 {
            return Ok(RefundOutcome::NoOp);
        }
        self.check_refundable(&purchase, refunding_user_id)?;

        let request = RefundRequest {
            transaction_id,
            amount_cents: Some(tax_cents),
            currency: purchase.currency,
            merchant_account: purchase.merchant_account_id,
            // the platform kept the tax; nothing was transferred
            reverse_transfer: false,
            is_for_fraud: false,
        };
        let gateway = self.gateways.get(purchase.processor)?;
        let charge_refund = match gateway.refund(&request) {
            Ok(charge_refund) => charge_refund,
            Err(error) => return map_gateway_error(&purchase, error),
        };

        let flow_of_funds = charge_refund
            .flow_of_funds
            .unwrap_or_else(|| FlowOfFunds::build_simple_flow_of_funds(purchase.currency, -tax_cents));
        self.apply(RefundApplication {
            purchase_id,
            kind: RefundKind::GumroadTaxOnly,
            gross_cents: tax_cents,
            refunding_user_id,
            processor_refund_id: Some(charge_refund.id),
            status: charge_refund.status,
            flow_of_funds,
            is_for_fraud: false,
        })
    }

    /// Full refund for fraud; the subscription, if any, ends now
    ///
    /// # Errors
    ///
    /// Same as [`RefundLedger::refund_and_save`].
    pub fn refund_for_fraud(
        &self,
        purchase_id: PurchaseId,
        refunding_user_id: Option<UserId>,
    ) -> Result<RefundOutcome, LedgerError> {
        let outcome = self.refund_and_save(purchase_id, refunding_user_id, None, true)?;

        self.store.transaction(|state| {
            let Some(subscription_id) = state.purchase(purchase_id)?.subscription_id else {
                return Ok(());
            };
            let subscription = state.subscription_mut(subscription_id)?;
            if subscription.is_alive() {
                subscription.cancel_effective_immediately();
                info!(subscription = %subscription_id, "subscription cancelled for fraud");
            }
            Ok(())
        })?;

        Ok(outcome)
    }

    /// Record a refund the processor issued without the ledger knowing
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidRefund` if the gross does not fit the
    /// purchase.
    pub fn record_processor_refund(
        &self,
        purchase_id: PurchaseId,
        gross_cents: Cents,
    ) -> Result<RefundOutcome, LedgerError> {
        let purchase = self.store.purchase(purchase_id)?;
        self.apply(RefundApplication {
            purchase_id,
            kind: RefundKind::Standard,
            gross_cents,
            refunding_user_id: None,
            processor_refund_id: None,
            status: RefundStatus::Succeeded,
            flow_of_funds: FlowOfFunds::build_simple_flow_of_funds(purchase.currency, -gross_cents),
            is_for_fraud: false,
        })
    }

    fn apply(&self, application: RefundApplication) -> Result<RefundOutcome, LedgerError> {
        let purchase_id = application.purchase_id;
        let applied = self
            .store
            .transaction(|state| refund_purchase(state, application))
            .inspect_err(|error| {
                error!(purchase = %purchase_id, %error, "processor refunded but ledger commit failed");
            })?;

        self.effects.notify(applied.notification);
        self.effects.enqueue_all(applied.jobs);
        Ok(RefundOutcome::Refunded {
            refund_id: applied.refund_id,
            full: applied.fully_refunded,
        })
    }

    /// Account and seller checks shared by every processor refund
    fn check_refundable(&self, purchase: &Purchase, refunding_user_id: Option<UserId>) -> Result<(), LedgerError> {
        let processor_name = purchase.processor.display_name();
        self.store.read(|state| {
            if let Some(account_id) = purchase.merchant_account_id {
                if !state.merchant_account(account_id)?.active {
                    return Err(LedgerError::merchant_account_inactive(processor_name));
                }
            }

            let seller = state.seller(purchase.seller_id)?;
            if purchase.processor == ProcessorId::PaypalDirect && seller.paypal_direct_disabled {
                return Err(LedgerError::payment_method_disabled(processor_name));
            }

            let is_team_member = refunding_user_id.is_some_and(|user| state.is_team_member(user));
            if seller.refunds_disabled && !is_team_member {
                return Err(LedgerError::RefundsDisabled);
            }
            Ok(())
        })
    }
}

fn map_gateway_error(purchase: &Purchase, error: GatewayError) -> Result<RefundOutcome, LedgerError> {
    warn!(purchase = %purchase.id, %error, "processor refused refund");
    match error {
        GatewayError::AlreadyRefunded => Ok(RefundOutcome::NoOp),
        GatewayError::InsufficientFunds => Err(LedgerError::insufficient_funds(
            purchase.processor.display_name(),
        )),
        GatewayError::InvalidRequest(message) | GatewayError::Declined(message) => {
            Err(LedgerError::ProcessorRejected { message })
        }
        GatewayError::Unavailable => Err(LedgerError::TemporaryProblem),
    }
}
