//! Ledger application of a processor-confirmed refund
//!
//! [`refund_purchase`] runs inside one `LedgerStore::transaction`: it reads
//! the refund aggregates, builds the refund row, moves the aggregates and
//! writes every balance entry and linked-record change, or nothing at all.
//! Notifications and jobs are returned to the caller for dispatch after the
//! commit.

use super::calculator::{self, RefundAmounts};
use crate::core::sinks::{Job, Notification, NotificationEvent};
use crate::core::store::LedgerState;
use crate::types::{
    floor_share, BalanceEntry, BalanceEntryKind, Cents, FlowOfFunds, HolderOfFunds, LedgerError,
    Purchase, PurchaseId, Refund, RefundId, RefundStatus, UserId,
};
use chrono::Utc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundKind {
    /// Price (and proportional taxes)
    Standard,
    /// Platform-collected tax only
    GumroadTaxOnly,
}

/// A refund the processor already issued, to be recorded locally
#[derive(Debug, Clone, PartialEq)]
pub struct RefundApplication {
    pub purchase_id: PurchaseId,
    pub kind: RefundKind,
    /// Gross the processor returned to the buyer
    pub gross_cents: Cents,
    pub refunding_user_id: Option<UserId>,
    pub processor_refund_id: Option<String>,
    pub status: RefundStatus,
    pub flow_of_funds: FlowOfFunds,
    pub is_for_fraud: bool,
}

/// Result of a committed ledger application
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRefund {
    pub refund_id: RefundId,
    pub fully_refunded: bool,
    pub notification: Notification,
    pub jobs: Vec<Job>,
}

fn integrity_error(purchase: &Purchase, gross_cents: Cents, reason: &str) -> LedgerError {
    error!(
        purchase = %purchase.id,
        gross_cents,
        refunded_cents = purchase.amount_refunded_cents,
        reason,
        "refund could not be recorded"
    );
    LedgerError::InvalidRefund {
        purchase: purchase.id,
    }
}

/// Holder of the purchase's funds; no merchant account means the platform
fn holder_of_funds(state: &LedgerState, purchase: &Purchase) -> Result<HolderOfFunds, LedgerError> {
    match purchase.merchant_account_id {
        Some(id) => Ok(state.merchant_account(id)?.holder_of_funds),
        None => Ok(HolderOfFunds::Platform),
    }
}

fn balance_entry(purchase: &Purchase, refund_id: RefundId, kind: BalanceEntryKind, amount_cents: Cents) -> BalanceEntry {
    BalanceEntry {
        seller_id: purchase.seller_id,
        kind,
        amount_cents,
        purchase_id: purchase.id,
        refund_id: Some(refund_id),
    }
}

/// Seller-balance movements caused by a standard refund
fn record_balance_entries(
    state: &mut LedgerState,
    purchase: &Purchase,
    refund: &Refund,
    fully_refunded: bool,
) -> Result<(), LedgerError> {
    let holder = holder_of_funds(state, purchase)?;

    // the fee goes back to the creator unless the platform retains it
    let fee_retained = !refund.is_for_fraud && holder == HolderOfFunds::Creator;
    state.record_balance_entry(balance_entry(
        purchase,
        refund.id,
        BalanceEntryKind::RefundDebit,
        -(refund.amount_cents - refund.fee_cents),
    ));
    if fee_retained && refund.fee_cents > 0 {
        state.record_balance_entry(balance_entry(
            purchase,
            refund.id,
            BalanceEntryKind::RefundFeeRetention,
            -refund.fee_cents,
        ));
    }

    if let Some(chargeback) = purchase.chargeback {
        let already_reversed = state
            .balance_entries_for(purchase.id)
            .iter()
            .any(|entry| entry.kind == BalanceEntryKind::DisputeReversal);
        if chargeback.won && chargeback.reversal_transferred && !already_reversed {
            state.record_balance_entry(balance_entry(
                purchase,
                refund.id,
                BalanceEntryKind::DisputeReversal,
                -chargeback.amount_cents,
            ));
        }
    }

    let tax_refunded_separately =
        purchase.is_platform_tax_responsible() && purchase.gumroad_tax_refundable_cents() == 0;
    if !fully_refunded && tax_refunded_separately && holder == HolderOfFunds::Platform {
        let excess = floor_share(
            refund.total_transaction_cents,
            purchase.gumroad_tax_cents,
            purchase.total_transaction_cents,
        );
        if excess > 0 {
            state.record_balance_entry(balance_entry(
                purchase,
                refund.id,
                BalanceEntryKind::ExcessTransferReversal,
                -excess,
            ));
        }
    }

    Ok(())
}

/// Record a processor refund against the ledger
///
/// # Arguments
///
/// * `state` - Staged state of the enclosing transaction
/// * `application` - The refund the processor issued
///
/// # Errors
///
/// Returns `LedgerError::InvalidRefund` if the gross exceeds what is still
/// refundable or no refund row with non-negative amounts can be built. The
/// enclosing transaction then commits nothing.
pub fn refund_purchase(
    state: &mut LedgerState,
    application: RefundApplication,
) -> Result<AppliedRefund, LedgerError> {
    let purchase = state.purchase(application.purchase_id)?.clone();
    let gross_cents = application.gross_cents;
    let refunded_gross_cents = state.refunded_gross_cents(purchase.id);

    if gross_cents <= 0 || gross_cents > purchase.total_refundable_cents() {
        return Err(integrity_error(&purchase, gross_cents, "gross exceeds refundable"));
    }

    let amounts: RefundAmounts = match application.kind {
        RefundKind::Standard => calculator::refund_amounts(&purchase, refunded_gross_cents, gross_cents)
            .ok_or_else(|| integrity_error(&purchase, gross_cents, "no valid refund variant"))?,
        RefundKind::GumroadTaxOnly => calculator::gumroad_tax_refund(&purchase),
    };
    let fully_refunded =
        calculator::completes_refund(&purchase, refunded_gross_cents, amounts.total_transaction_cents);

    let refund = Refund {
        id: RefundId(state.next_id()),
        purchase_id: purchase.id,
        currency: purchase.currency,
        total_transaction_cents: amounts.total_transaction_cents,
        amount_cents: amounts.amount_cents,
        creator_tax_cents: amounts.creator_tax_cents,
        gumroad_tax_cents: amounts.gumroad_tax_cents,
        fee_cents: amounts.fee_cents,
        refunding_user_id: application.refunding_user_id,
        processor_refund_id: application.processor_refund_id,
        status: application.status,
        is_for_fraud: application.is_for_fraud,
        flow_of_funds: Some(application.flow_of_funds),
        created_at: Utc::now(),
    };

    {
        let row = state.purchase_mut(purchase.id)?;
        row.amount_refunded_cents += amounts.amount_cents;
        row.fee_refunded_cents += amounts.fee_cents;
        row.tax_refunded_cents += amounts.creator_tax_cents;
        row.gumroad_tax_refunded_cents += amounts.gumroad_tax_cents;
        row.stripe_refunded = fully_refunded;
        row.stripe_partially_refunded = !fully_refunded;
    }

    if purchase.is_original_subscription_purchase {
        if let Some(subscription_id) = purchase.subscription_id {
            if state
                .subscription_mut(subscription_id)?
                .cancel_immediately_if_pending_cancellation()
            {
                info!(subscription = %subscription_id, "pending cancellation applied on refund");
            }
        }
    }

    if purchase.is_gift_sender_purchase {
        if let Some(gift_id) = purchase.gift_id {
            let giftee_id = state.gift(gift_id)?.giftee_purchase_id;
            let giftee = state.purchase_mut(giftee_id)?;
            giftee.stripe_refunded = fully_refunded;
            giftee.stripe_partially_refunded = !fully_refunded;
        }
    }

    if application.kind == RefundKind::Standard {
        record_balance_entries(state, &purchase, &refund, fully_refunded)?;
    }

    let event = if refund.is_for_fraud {
        NotificationEvent::RefundForFraud
    } else if fully_refunded {
        NotificationEvent::Refund
    } else {
        NotificationEvent::PartialRefund
    };
    let applied = AppliedRefund {
        refund_id: refund.id,
        fully_refunded,
        notification: Notification {
            event,
            purchase_id: purchase.id,
            amount_cents: refund.total_transaction_cents,
        },
        jobs: vec![
            Job::RecalculateBalance {
                seller_id: purchase.seller_id,
            },
            Job::ReindexPurchase {
                purchase_id: purchase.id,
            },
        ],
    };

    info!(
        purchase = %purchase.id,
        refund = %refund.id,
        gross_cents = refund.total_transaction_cents,
        amount_cents = refund.amount_cents,
        fully_refunded,
        "refund recorded"
    );
    state.save_refund(refund);

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Chargeback, Currency, MerchantAccount, MerchantAccountId, ProcessorId, ProductId,
        PurchaseAmounts, PurchaseState,
    };
    use rstest::rstest;

    fn state_with(amounts: PurchaseAmounts, holder: HolderOfFunds) -> LedgerState {
        let mut state = LedgerState::default();
        state.save_merchant_account(MerchantAccount {
            id: MerchantAccountId(100),
            seller_id: UserId(1),
            processor: ProcessorId::Stripe,
            active: true,
            holder_of_funds: holder,
        });
        let mut purchase = Purchase::new(
            PurchaseId(1),
            "p1",
            ProductId(1),
            UserId(1),
            Currency::Usd,
            amounts,
        );
        purchase.state = PurchaseState::Successful;
        purchase.merchant_account_id = Some(MerchantAccountId(100));
        state.save_purchase(purchase);
        state
    }

    fn application(gross_cents: Cents) -> RefundApplication {
        RefundApplication {
            purchase_id: PurchaseId(1),
            kind: RefundKind::Standard,
            gross_cents,
            refunding_user_id: Some(UserId(9)),
            processor_refund_id: Some("re_1".to_string()),
            status: RefundStatus::Succeeded,
            flow_of_funds: FlowOfFunds::build_simple_flow_of_funds(Currency::Usd, -gross_cents),
            is_for_fraud: false,
        }
    }

    fn amounts(price: Cents, vat: Cents, fee: Cents) -> PurchaseAmounts {
        PurchaseAmounts {
            price_cents: price,
            gumroad_tax_cents: vat,
            fee_cents: fee,
            ..PurchaseAmounts::default()
        }
    }

    fn entries_of(state: &LedgerState, kind: BalanceEntryKind) -> Vec<Cents> {
        state
            .balance_entries_for(PurchaseId(1))
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.amount_cents)
            .collect()
    }

    #[test]
    fn test_partial_refund_moves_aggregates_and_flags() {
        let mut state = state_with(amounts(10000, 0, 1000), HolderOfFunds::Platform);

        let applied = refund_purchase(&mut state, application(6000)).unwrap();

        assert!(!applied.fully_refunded);
        assert_eq!(applied.notification.event, NotificationEvent::PartialRefund);
        let purchase = state.purchase(PurchaseId(1)).unwrap();
        assert_eq!(purchase.amount_refunded_cents, 6000);
        assert_eq!(purchase.fee_refunded_cents, 600);
        assert!(purchase.stripe_partially_refunded);
        assert!(!purchase.stripe_refunded);
    }

    #[test]
    fn test_gross_above_refundable_is_integrity_error() {
        let mut state = state_with(amounts(10000, 0, 0), HolderOfFunds::Platform);

        let result = refund_purchase(&mut state, application(10001));

        assert_eq!(result, Err(LedgerError::InvalidRefund { purchase: PurchaseId(1) }));
        assert!(state.refunds_for(PurchaseId(1)).is_empty());
    }

    #[rstest]
    #[case::platform_holds_funds(HolderOfFunds::Platform, false, vec![-4500], vec![])]
    #[case::creator_holds_funds(HolderOfFunds::Creator, false, vec![-4500], vec![-500])]
    #[case::fraud_waives_retention(HolderOfFunds::Creator, true, vec![-4500], vec![])]
    fn test_fee_retention(
        #[case] holder: HolderOfFunds,
        #[case] is_for_fraud: bool,
        #[case] debits: Vec<Cents>,
        #[case] retained: Vec<Cents>,
    ) {
        let mut state = state_with(amounts(5000, 0, 500), holder);
        let mut application = application(5000);
        application.is_for_fraud = is_for_fraud;

        refund_purchase(&mut state, application).unwrap();

        assert_eq!(entries_of(&state, BalanceEntryKind::RefundDebit), debits);
        assert_eq!(entries_of(&state, BalanceEntryKind::RefundFeeRetention), retained);
    }

    #[test]
    fn test_won_dispute_reverses_dispute_amount_once() {
        let mut state = state_with(amounts(10000, 0, 0), HolderOfFunds::Platform);
        state.purchase_mut(PurchaseId(1)).unwrap().chargeback = Some(Chargeback {
            amount_cents: 7000,
            won: true,
            reversal_transferred: true,
        });

        refund_purchase(&mut state, application(3000)).unwrap();
        refund_purchase(&mut state, application(3000)).unwrap();

        assert_eq!(entries_of(&state, BalanceEntryKind::DisputeReversal), vec![-7000]);
        assert_eq!(
            entries_of(&state, BalanceEntryKind::RefundDebit),
            vec![-3000, -3000]
        );
    }

    #[test]
    fn test_partial_refund_after_tax_refund_reverses_excess_transfer() {
        let mut state = state_with(amounts(10000, 1000, 0), HolderOfFunds::Platform);
        let mut tax_only = application(1000);
        tax_only.kind = RefundKind::GumroadTaxOnly;
        refund_purchase(&mut state, tax_only).unwrap();

        refund_purchase(&mut state, application(2200)).unwrap();

        // 2200 * 1000 / 11000
        assert_eq!(
            entries_of(&state, BalanceEntryKind::ExcessTransferReversal),
            vec![-200]
        );
        let purchase = state.purchase(PurchaseId(1)).unwrap();
        assert_eq!(purchase.amount_refunded_cents, 2200);
        assert_eq!(purchase.gumroad_tax_refunded_cents, 1000);
    }

    #[test]
    fn test_tax_only_refund_touches_no_balance() {
        let mut state = state_with(amounts(10000, 800, 1000), HolderOfFunds::Platform);
        let mut tax_only = application(800);
        tax_only.kind = RefundKind::GumroadTaxOnly;

        let applied = refund_purchase(&mut state, tax_only).unwrap();

        assert!(!applied.fully_refunded);
        assert!(state.balance_entries_for(PurchaseId(1)).is_empty());
        let purchase = state.purchase(PurchaseId(1)).unwrap();
        assert_eq!(purchase.amount_refunded_cents, 0);
        assert_eq!(purchase.gumroad_tax_refunded_cents, 800);
        assert!(purchase.stripe_partially_refunded);
    }
}
