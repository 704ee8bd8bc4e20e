//! Refund arithmetic
//!
//! Pure functions from a purchase's charged and refunded amounts to the
//! amounts of the next refund. Every division is a floor: tax and fee may be
//! under-refunded by a cent, never over-refunded.

use crate::types::{floor_share, Cents, Purchase};

/// Amounts carried by one refund row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundAmounts {
    /// Gross returned through the payment network
    pub total_transaction_cents: Cents,
    /// Portion of the price
    pub amount_cents: Cents,
    pub creator_tax_cents: Cents,
    pub gumroad_tax_cents: Cents,
    pub fee_cents: Cents,
}

impl RefundAmounts {
    fn is_valid(&self) -> bool {
        self.total_transaction_cents >= 0
            && self.amount_cents >= 0
            && self.creator_tax_cents >= 0
            && self.gumroad_tax_cents >= 0
            && self.fee_cents >= 0
    }
}

/// Gross sent to the processor for a partial refund of `amount_cents` of
/// the price
///
/// Adds the proportional platform tax, capped by what is still refundable.
pub fn partial_gross_cents(purchase: &Purchase, amount_cents: Cents) -> Cents {
    if !purchase.is_platform_tax_responsible() {
        return amount_cents;
    }

    let tax = floor_share(amount_cents, purchase.gumroad_tax_cents, purchase.price_cents)
        .min(purchase.gumroad_tax_refundable_cents());
    amount_cents + tax
}

/// Whether a refund of `gross_cents` on top of `refunded_gross_cents`
/// completes the purchase
pub fn completes_refund(purchase: &Purchase, refunded_gross_cents: Cents, gross_cents: Cents) -> bool {
    refunded_gross_cents + gross_cents >= purchase.total_transaction_cents
}

/// Everything still refundable; used when a refund completes earlier partials
pub fn remaining_refund(purchase: &Purchase) -> RefundAmounts {
    RefundAmounts {
        total_transaction_cents: purchase.total_refundable_cents(),
        amount_cents: purchase.amount_refundable_cents(),
        creator_tax_cents: purchase.tax_cents - purchase.tax_refunded_cents,
        gumroad_tax_cents: purchase.gumroad_tax_refundable_cents(),
        fee_cents: purchase.fee_cents - purchase.fee_refunded_cents,
    }
}

/// The whole purchase, refunded in one go
pub fn full_refund(purchase: &Purchase) -> RefundAmounts {
    RefundAmounts {
        total_transaction_cents: purchase.total_transaction_cents,
        amount_cents: purchase.price_cents,
        creator_tax_cents: purchase.tax_cents,
        gumroad_tax_cents: purchase.gumroad_tax_cents,
        fee_cents: purchase.fee_cents,
    }
}

/// Proportional split of a partial gross
///
/// Creator tax is not capped by a remaining amount; the amount-refundable
/// guard upstream bounds it.
pub fn partial_refund(purchase: &Purchase, gross_cents: Cents) -> RefundAmounts {
    let total = purchase.total_transaction_cents;
    let gumroad_tax_cents = floor_share(gross_cents, purchase.gumroad_tax_cents, total)
        .min(purchase.gumroad_tax_refundable_cents());
    let creator_tax_cents = floor_share(gross_cents, purchase.tax_cents, total);
    let amount_cents = gross_cents - gumroad_tax_cents;
    let fee_cents = floor_share(purchase.fee_cents, amount_cents, purchase.price_cents);

    RefundAmounts {
        total_transaction_cents: gross_cents,
        amount_cents,
        creator_tax_cents,
        gumroad_tax_cents,
        fee_cents,
    }
}

/// Pick the refund constructor for `gross_cents` and build the amounts
///
/// In order: completing earlier partial refunds, a full refund of an
/// untouched purchase, a proportional partial refund.
///
/// Returns `None` when the result would carry a negative amount or push an
/// aggregate past what was charged.
pub fn refund_amounts(
    purchase: &Purchase,
    refunded_gross_cents: Cents,
    gross_cents: Cents,
) -> Option<RefundAmounts> {
    let has_prior_refund = refunded_gross_cents > 0 || purchase.has_refunds();

    let amounts = if has_prior_refund && completes_refund(purchase, refunded_gross_cents, gross_cents) {
        remaining_refund(purchase)
    } else if gross_cents == purchase.total_transaction_cents {
        full_refund(purchase)
    } else {
        partial_refund(purchase, gross_cents)
    };

    let fits = purchase.amount_refunded_cents + amounts.amount_cents <= purchase.price_cents
        && purchase.gumroad_tax_refunded_cents + amounts.gumroad_tax_cents <= purchase.gumroad_tax_cents
        && purchase.fee_refunded_cents + amounts.fee_cents <= purchase.fee_cents;

    (amounts.is_valid() && fits).then_some(amounts)
}

/// Platform-tax-only refund of whatever tax remains
pub fn gumroad_tax_refund(purchase: &Purchase) -> RefundAmounts {
    let tax = purchase.gumroad_tax_refundable_cents();
    RefundAmounts {
        total_transaction_cents: tax,
        amount_cents: 0,
        creator_tax_cents: 0,
        gumroad_tax_cents: tax,
        fee_cents: 0,
    }
}
