//! Reconciliation with the charge processor
//!
//! The processor call and the ledger commit are not one atomic step. This
//! module looks the charge up again and repairs whichever side the ledger
//! missed: a charge that succeeded after the purchase was given up on, a
//! purchase left waiting on a charge that never happened, or a refund the
//! processor issued that the ledger never recorded.
//!
//! Running `sync` twice in a row is safe; the second run finds nothing to do.

use crate::core::gateway::{ChargeStatus, GatewayRegistry};
use crate::core::refund::{RefundLedger, RefundOutcome};
use crate::core::state_machine::PurchaseStateMachine;
use crate::types::{Cents, LedgerError, PurchaseId, PurchaseState};
use tracing::{debug, info};

const CHARGE_NOT_FOUND_MESSAGE: &str = "Charge could not be found with the processor.";
const CHARGE_FAILED_MESSAGE: &str = "Your card was declined.";

/// What a reconciliation run changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    /// A given-up purchase whose charge went through is successful again
    Recovered,
    Failed,
    /// Gross refunded at the processor and missing from the ledger
    RefundReconciled { gross_cents: Cents },
}

#[derive(Debug, Clone)]
pub struct SyncStatusWithChargeProcessor {
    machine: PurchaseStateMachine,
    gateways: GatewayRegistry,
    ledger: RefundLedger,
}

impl SyncStatusWithChargeProcessor {
    pub fn new(machine: PurchaseStateMachine, gateways: GatewayRegistry, ledger: RefundLedger) -> Self {
        SyncStatusWithChargeProcessor {
            machine,
            gateways,
            ledger,
        }
    }

    /// Bring one purchase in line with what the processor reports
    ///
    /// # Errors
    ///
    /// Returns an error if the purchase does not exist, its processor is not
    /// registered, or the repair itself fails.
    pub fn sync(&self, purchase_id: PurchaseId) -> Result<SyncOutcome, LedgerError> {
        let purchase = self.machine.store().purchase(purchase_id)?;
        let gateway = self.gateways.get(purchase.processor)?;
        let charge = gateway.get_or_search_charge(&purchase);

        let recoverable = matches!(
            purchase.state,
            PurchaseState::InProgress | PurchaseState::Failed | PurchaseState::PreorderAuthorizationFailed
        );

        match charge {
            Some(charge)
                if recoverable
                    && matches!(charge.status, ChargeStatus::Succeeded | ChargeStatus::Authorized) =>
            {
                info!(purchase = %purchase_id, charge = %charge.id, "charge went through, recovering");
                self.machine.recover_purchase(purchase_id, charge.id)?;
                Ok(SyncOutcome::Recovered)
            }
            Some(charge)
                if purchase.state == PurchaseState::InProgress && charge.status == ChargeStatus::Failed =>
            {
                self.machine
                    .handle_purchase_failure(purchase_id, Some(CHARGE_FAILED_MESSAGE.to_string()))?;
                Ok(SyncOutcome::Failed)
            }
            Some(charge) if purchase.state.is_successful_family() && !purchase.is_in_combined_charge() => {
                let refunded_locally = self
                    .machine
                    .store()
                    .read(|state| state.refunded_gross_cents(purchase_id));
                let missing = (charge.amount_refunded_cents - refunded_locally)
                    .min(purchase.total_refundable_cents());
                if missing <= 0 {
                    return Ok(SyncOutcome::Unchanged);
                }

                info!(purchase = %purchase_id, missing, "recording refund issued at the processor");
                match self.ledger.record_processor_refund(purchase_id, missing)? {
                    RefundOutcome::Refunded { .. } => Ok(SyncOutcome::RefundReconciled { gross_cents: missing }),
                    RefundOutcome::NoOp => Ok(SyncOutcome::Unchanged),
                }
            }
            None if purchase.state == PurchaseState::InProgress && !purchase.has_pending_charge_intent() => {
                self.machine
                    .handle_purchase_failure(purchase_id, Some(CHARGE_NOT_FOUND_MESSAGE.to_string()))?;
                Ok(SyncOutcome::Failed)
            }
            _ => {
                debug!(purchase = %purchase_id, state = %purchase.state, "in sync");
                Ok(SyncOutcome::Unchanged)
            }
        }
    }
}
