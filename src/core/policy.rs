//! Read-only purchase policies
//!
//! Two predicates the ledger consults but does not own: whether a purchase
//! counts toward public product ratings, and whether it may be charged at
//! all. Implementations are swappable behind the traits.

use crate::types::Purchase;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Why a purchase was blocked; shown to the buyer as-is
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FraudReason(pub String);

pub trait ReviewEligibility: Send + Sync + fmt::Debug {
    fn allows_review_to_be_counted(&self, purchase: &Purchase) -> bool;
}

pub trait FraudScreen: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns the reason the purchase must not be charged.
    fn passes_fraud_screen(&self, purchase: &Purchase) -> Result<(), FraudReason>;
}

/// Counts completed, paid-for purchases the buyer kept
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardReviewEligibility;

impl ReviewEligibility for StandardReviewEligibility {
    fn allows_review_to_be_counted(&self, purchase: &Purchase) -> bool {
        purchase.state.is_successful_family()
            && !purchase.is_test_purchase
            && !purchase.stripe_refunded
            && !purchase.is_chargedback()
            && !purchase.is_gift_sender_purchase
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFraudScreen;

impl FraudScreen for PassthroughFraudScreen {
    fn passes_fraud_screen(&self, _purchase: &Purchase) -> Result<(), FraudReason> {
        Ok(())
    }
}

/// Blocks payment methods on a deny list
#[derive(Debug, Default, Clone)]
pub struct BlockedPaymentMethodScreen {
    blocked: HashSet<String>,
}

impl BlockedPaymentMethodScreen {
    pub fn new(blocked: impl IntoIterator<Item = impl Into<String>>) -> Self {
        BlockedPaymentMethodScreen {
            blocked: blocked.into_iter().map(Into::into).collect(),
        }
    }
}

impl FraudScreen for BlockedPaymentMethodScreen {
    fn passes_fraud_screen(&self, purchase: &Purchase) -> Result<(), FraudReason> {
        if self.blocked.contains(&purchase.payment_method) {
            return Err(FraudReason(
                "Your payment method has been blocked. Please use another one.".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Chargeback, Currency, ProductId, PurchaseAmounts, PurchaseId, PurchaseState, UserId,
    };
    use rstest::rstest;

    fn successful_purchase() -> Purchase {
        let mut purchase = Purchase::new(
            PurchaseId(1),
            "p1",
            ProductId(1),
            UserId(1),
            Currency::Usd,
            PurchaseAmounts {
                price_cents: 1000,
                ..PurchaseAmounts::default()
            },
        );
        purchase.state = PurchaseState::Successful;
        purchase.payment_method = "tok_visa".to_string();
        purchase
    }

    #[rstest]
    #[case::counted(|_: &mut Purchase| {}, true)]
    #[case::failed(|p: &mut Purchase| p.state = PurchaseState::Failed, false)]
    #[case::test_purchase(|p: &mut Purchase| p.is_test_purchase = true, false)]
    #[case::fully_refunded(|p: &mut Purchase| p.stripe_refunded = true, false)]
    #[case::partially_refunded(|p: &mut Purchase| p.stripe_partially_refunded = true, true)]
    #[case::gift_sender(|p: &mut Purchase| p.is_gift_sender_purchase = true, false)]
    #[case::chargedback(|p: &mut Purchase| p.chargeback = Some(Chargeback {
        amount_cents: 1000,
        won: false,
        reversal_transferred: false,
    }), false)]
    #[case::chargeback_won(|p: &mut Purchase| p.chargeback = Some(Chargeback {
        amount_cents: 1000,
        won: true,
        reversal_transferred: true,
    }), true)]
    fn test_review_eligibility(#[case] tweak: fn(&mut Purchase), #[case] expected: bool) {
        let mut purchase = successful_purchase();
        tweak(&mut purchase);
        assert_eq!(
            StandardReviewEligibility.allows_review_to_be_counted(&purchase),
            expected
        );
    }

    #[test]
    fn test_blocked_payment_method_is_rejected() {
        let screen = BlockedPaymentMethodScreen::new(["tok_stolen"]);
        let mut purchase = successful_purchase();
        assert!(screen.passes_fraud_screen(&purchase).is_ok());

        purchase.payment_method = "tok_stolen".to_string();
        assert!(screen.passes_fraud_screen(&purchase).is_err());
    }
}
