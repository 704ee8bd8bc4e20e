//! Completion guarantees
//!
//! Every purchase that enters `in_progress` must leave it. Two pieces make
//! sure it does:
//!
//! - [`ensure_completion`] wraps a creation block in a scope guard. When the
//!   guard drops (normal return, early `?` return or panic unwinding) a
//!   purchase still `in_progress` without a pending processor action is
//!   failed.
//! - [`CompletionOrchestrator::confirm`] resolves a purchase that was
//!   waiting on an out-of-band authentication step.

use crate::core::gateway::{ConfirmParams, GatewayError, GatewayRegistry};
use crate::core::state_machine::PurchaseStateMachine;
use crate::types::{LedgerError, PurchaseId, PurchaseState};
use tracing::{error, info, warn};

const DANGLING_PURCHASE_MESSAGE: &str = "Sorry, something went wrong. Please try again.";

/// Fails a dangling purchase when dropped
#[derive(Debug)]
pub struct CompletionGuard<'a> {
    machine: &'a PurchaseStateMachine,
    purchase_id: PurchaseId,
}

impl<'a> CompletionGuard<'a> {
    pub fn new(machine: &'a PurchaseStateMachine, purchase_id: PurchaseId) -> Self {
        CompletionGuard {
            machine,
            purchase_id,
        }
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        let purchase = match self.machine.store().purchase(self.purchase_id) {
            Ok(purchase) => purchase,
            // never persisted, nothing to resolve
            Err(_) => return,
        };
        if purchase.state != PurchaseState::InProgress || purchase.has_pending_charge_intent() {
            return;
        }

        warn!(
            purchase = %self.purchase_id,
            panicking = std::thread::panicking(),
            "purchase left in progress, failing it"
        );
        if let Err(error) = self
            .machine
            .handle_purchase_failure(self.purchase_id, Some(DANGLING_PURCHASE_MESSAGE.to_string()))
        {
            error!(purchase = %self.purchase_id, %error, "could not fail dangling purchase");
        }
    }
}

/// Run `block` and guarantee the purchase is resolved afterwards
///
/// # Errors
///
/// Returns whatever `block` returned; the purchase is failed first if it
/// was left dangling.
pub fn ensure_completion<T>(
    machine: &PurchaseStateMachine,
    purchase_id: PurchaseId,
    block: impl FnOnce() -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let _guard = CompletionGuard::new(machine, purchase_id);
    block()
}

/// Resolves purchases after an out-of-band confirmation
#[derive(Debug, Clone)]
pub struct CompletionOrchestrator {
    machine: PurchaseStateMachine,
    gateways: GatewayRegistry,
}

impl CompletionOrchestrator {
    pub fn new(machine: PurchaseStateMachine, gateways: GatewayRegistry) -> Self {
        CompletionOrchestrator { machine, gateways }
    }

    /// Confirm an `in_progress` purchase
    ///
    /// Duplicate confirmations of an already successful purchase succeed
    /// without side effects.
    ///
    /// # Arguments
    ///
    /// * `purchase_id` - The purchase waiting on confirmation
    /// * `params` - Outcome of the client-side authentication step
    ///
    /// # Errors
    ///
    /// - `LedgerError::PurchaseNotInProgress` (retryable) if another worker
    ///   already moved the purchase
    /// - `LedgerError::PaymentDeclined` carrying the first processor message
    ///   verbatim; the purchase is failed
    pub fn confirm(&self, purchase_id: PurchaseId, params: &ConfirmParams) -> Result<(), LedgerError> {
        let purchase = self.machine.store().purchase(purchase_id)?;

        if purchase.state == PurchaseState::Successful {
            info!(purchase = %purchase_id, "already confirmed");
            return Ok(());
        }
        if purchase.state != PurchaseState::InProgress {
            warn!(purchase = %purchase_id, state = %purchase.state, "confirmation raced");
            return Err(LedgerError::PurchaseNotInProgress {
                purchase: purchase_id,
                state: purchase.state,
            });
        }

        if let Some(message) = &params.processor_error {
            return self.fail(purchase_id, message.clone());
        }

        let gateway = self.gateways.get(purchase.processor)?;
        match gateway.confirm_charge(&purchase, params) {
            Ok(charge) => self
                .machine
                .handle_charge_success(purchase_id, Some(charge.id))
                .map_err(raced),
            Err(GatewayError::Declined(message)) | Err(GatewayError::InvalidRequest(message)) => {
                self.fail(purchase_id, message)
            }
            Err(GatewayError::Unavailable) => Err(LedgerError::TemporaryProblem),
            Err(other) => self.fail(purchase_id, other.to_string()),
        }
    }

    fn fail(&self, purchase_id: PurchaseId, message: String) -> Result<(), LedgerError> {
        self.machine
            .handle_purchase_failure(purchase_id, Some(message.clone()))
            .map_err(raced)?;
        Err(LedgerError::PaymentDeclined { message })
    }
}

/// The purchase moved between the state check and the transition
fn raced(error: LedgerError) -> LedgerError {
    match error {
        LedgerError::InvalidTransition { purchase, from, .. } => {
            warn!(purchase = %purchase, state = %from, "confirmation raced");
            LedgerError::PurchaseNotInProgress {
                purchase,
                state: from,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gateway::{
        Charge, ChargeGateway, ChargeRefund, ChargeRequest, InMemoryGateway, RefundRequest,
    };
    use crate::core::sinks::SideEffects;
    use crate::core::store::LedgerStore;
    use crate::types::{
        ChargeIntentStatus, Currency, ProcessorId, Product, ProductId, Purchase, PurchaseAmounts,
        Seller, UserId,
    };
    use std::sync::Arc;

    struct Fixture {
        machine: PurchaseStateMachine,
        gateway: Arc<InMemoryGateway>,
        orchestrator: CompletionOrchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LedgerStore::new());
        store
            .transaction(|state| {
                state.save_seller(Seller::new(UserId(1)));
                state.save_product(Product::new(ProductId(1), UserId(1), Currency::Usd));
                Ok(())
            })
            .unwrap();
        let machine = PurchaseStateMachine::new(store, SideEffects::default());
        let gateway = Arc::new(InMemoryGateway::new(ProcessorId::Stripe));
        let gateways = GatewayRegistry::new().register(gateway.clone());
        Fixture {
            orchestrator: CompletionOrchestrator::new(machine.clone(), gateways),
            machine,
            gateway,
        }
    }

    fn insert(fixture: &Fixture, charge_intent: Option<ChargeIntentStatus>) -> PurchaseId {
        let intent = charge_intent.map(|_| {
            fixture
                .gateway
                .charge(&ChargeRequest {
                    reference: "p".to_string(),
                    merchant_account: None,
                    currency: Currency::Usd,
                    amount_cents: 1000,
                    payment_method: "3ds_required".to_string(),
                    capture: true,
                    attach_to: None,
                })
                .unwrap()
                .payment_intent_id
                .unwrap()
        });
        fixture
            .machine
            .store()
            .transaction(|state| {
                let id = PurchaseId(state.next_id());
                let mut purchase = Purchase::new(
                    id,
                    format!("p{}", id),
                    ProductId(1),
                    UserId(1),
                    Currency::Usd,
                    PurchaseAmounts {
                        price_cents: 1000,
                        ..PurchaseAmounts::default()
                    },
                );
                purchase.charge_intent = charge_intent;
                purchase.processor_payment_intent_id = intent;
                state.save_purchase(purchase);
                Ok(id)
            })
            .unwrap()
    }

    #[test]
    fn test_guard_fails_purchase_on_error() {
        let fixture = fixture();
        let id = insert(&fixture, None);

        let result: Result<(), LedgerError> =
            ensure_completion(&fixture.machine, id, || Err(LedgerError::TemporaryProblem));

        assert!(result.is_err());
        let purchase = fixture.machine.store().purchase(id).unwrap();
        assert_eq!(purchase.state, PurchaseState::Failed);
        assert_eq!(
            purchase.error_message.as_deref(),
            Some(DANGLING_PURCHASE_MESSAGE)
        );
    }

    #[test]
    fn test_guard_fails_purchase_on_panic() {
        let fixture = fixture();
        let id = insert(&fixture, None);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), LedgerError> =
                ensure_completion(&fixture.machine, id, || panic!("charge step blew up"));
        }));

        assert!(outcome.is_err());
        assert_eq!(
            fixture.machine.store().purchase(id).unwrap().state,
            PurchaseState::Failed
        );
    }

    #[test]
    fn test_guard_leaves_pending_intent_alone() {
        let fixture = fixture();
        let id = insert(&fixture, Some(ChargeIntentStatus::RequiresAction));

        ensure_completion(&fixture.machine, id, || Ok(())).unwrap();

        assert_eq!(
            fixture.machine.store().purchase(id).unwrap().state,
            PurchaseState::InProgress
        );
    }

    #[test]
    fn test_guard_ignores_resolved_purchase() {
        let fixture = fixture();
        let id = insert(&fixture, None);

        ensure_completion(&fixture.machine, id, || fixture.machine.handle_purchase_success(id))
            .unwrap();

        assert_eq!(
            fixture.machine.store().purchase(id).unwrap().state,
            PurchaseState::Successful
        );
    }

    #[test]
    fn test_confirm_succeeds_once_and_is_idempotent() {
        let fixture = fixture();
        let id = insert(&fixture, Some(ChargeIntentStatus::RequiresAction));

        fixture.orchestrator.confirm(id, &ConfirmParams::default()).unwrap();
        fixture.orchestrator.confirm(id, &ConfirmParams::default()).unwrap();

        let purchase = fixture.machine.store().purchase(id).unwrap();
        assert_eq!(purchase.state, PurchaseState::Successful);
        assert!(purchase.stripe_transaction_id.is_some());
        assert_eq!(
            fixture
                .machine
                .store()
                .read(|state| state.balance_entries_for(id).len()),
            1
        );
    }

    #[test]
    fn test_confirm_surfaces_processor_error_and_fails() {
        let fixture = fixture();
        let id = insert(&fixture, Some(ChargeIntentStatus::RequiresAction));
        let params = ConfirmParams {
            processor_error: Some("Authentication failed.".to_string()),
        };

        let result = fixture.orchestrator.confirm(id, &params);

        assert_eq!(
            result,
            Err(LedgerError::payment_declined("Authentication failed."))
        );
        let purchase = fixture.machine.store().purchase(id).unwrap();
        assert_eq!(purchase.state, PurchaseState::Failed);
        assert_eq!(purchase.charge_intent, Some(ChargeIntentStatus::Canceled));
    }

    /// Gateway that lets another worker fail the purchase mid-confirmation
    #[derive(Debug)]
    struct FailingMidConfirm {
        inner: Arc<InMemoryGateway>,
        machine: PurchaseStateMachine,
    }

    impl ChargeGateway for FailingMidConfirm {
        fn processor(&self) -> ProcessorId {
            self.inner.processor()
        }

        fn charge(&self, request: &ChargeRequest) -> Result<Charge, GatewayError> {
            self.inner.charge(request)
        }

        fn confirm_charge(
            &self,
            purchase: &Purchase,
            params: &ConfirmParams,
        ) -> Result<Charge, GatewayError> {
            let charge = self.inner.confirm_charge(purchase, params)?;
            let _ = self.machine.handle_purchase_failure(purchase.id, None);
            Ok(charge)
        }

        fn refund(&self, request: &RefundRequest) -> Result<ChargeRefund, GatewayError> {
            self.inner.refund(request)
        }

        fn get_or_search_charge(&self, purchase: &Purchase) -> Option<Charge> {
            self.inner.get_or_search_charge(purchase)
        }
    }

    #[test]
    fn test_confirm_reports_retryable_error_when_purchase_moves_mid_confirmation() {
        let fixture = fixture();
        let id = insert(&fixture, Some(ChargeIntentStatus::RequiresAction));
        let gateways = GatewayRegistry::new().register(Arc::new(FailingMidConfirm {
            inner: fixture.gateway.clone(),
            machine: fixture.machine.clone(),
        }));
        let orchestrator = CompletionOrchestrator::new(fixture.machine.clone(), gateways);

        let result = orchestrator.confirm(id, &ConfirmParams::default());

        assert_eq!(
            result,
            Err(LedgerError::PurchaseNotInProgress {
                purchase: id,
                state: PurchaseState::Failed,
            })
        );
        assert!(result.unwrap_err().is_retryable());
    }

    #[test]
    fn test_confirm_refuses_purchase_no_longer_in_progress() {
        let fixture = fixture();
        let id = insert(&fixture, Some(ChargeIntentStatus::RequiresAction));
        fixture.machine.handle_purchase_failure(id, None).unwrap();

        let result = fixture.orchestrator.confirm(id, &ConfirmParams::default());

        assert!(matches!(
            result,
            Err(LedgerError::PurchaseNotInProgress { .. })
        ));
        assert!(result.unwrap_err().is_retryable());
    }
}
