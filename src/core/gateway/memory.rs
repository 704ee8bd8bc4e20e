//! Deterministic in-memory charge processor
//!
//! `InMemoryGateway` behaves like a real processor as far as the ledger can
//! tell: it keeps charges, tracks how much of each was refunded and reports
//! the same failure modes. Outcomes are driven by the payment-method token,
//! the way processor test cards work:
//!
//! | token prefix  | outcome                          |
//! |---------------|----------------------------------|
//! | `decline`     | `GatewayError::Declined`         |
//! | `3ds`         | charge waiting on buyer action   |
//! | `unavailable` | `GatewayError::Unavailable`      |
//! | anything else | charge succeeds (or authorizes)  |

use super::{
    Charge, ChargeGateway, ChargeRefund, ChargeRequest, ChargeStatus, ConfirmParams, GatewayError,
    RefundRequest,
};
use crate::types::{Cents, FlowOfFunds, Money, ProcessorId, Purchase, RefundStatus};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

const DECLINE_MESSAGE: &str = "Your card was declined.";

#[derive(Debug)]
pub struct InMemoryGateway {
    processor: ProcessorId,
    /// Charges by charge id
    charges: DashMap<String, Charge>,
    refunds: DashMap<String, ChargeRefund>,
    scripted_refund_errors: Mutex<VecDeque<GatewayError>>,
    reports_flow_of_funds: bool,
    next_id: AtomicU64,
}

impl InMemoryGateway {
    pub fn new(processor: ProcessorId) -> Self {
        InMemoryGateway {
            processor,
            charges: DashMap::new(),
            refunds: DashMap::new(),
            scripted_refund_errors: Mutex::new(VecDeque::new()),
            // PayPal-style processors do not break refunds down by ledger point
            reports_flow_of_funds: !processor.is_buyer_direct_to_seller(),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Make the next refund call fail with `error`
    pub fn fail_next_refund(&self, error: GatewayError) {
        self.scripted_refund_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Snapshot of a charge
    pub fn charge_by_id(&self, charge_id: &str) -> Option<Charge> {
        self.charges.get(charge_id).map(|charge| charge.clone())
    }

    /// Number of refunds the processor has issued
    pub fn refund_count(&self) -> usize {
        self.refunds.len()
    }

    /// Settle a charge that was waiting on the buyer, as if a webhook arrived
    pub fn settle_charge(&self, charge_id: &str) -> bool {
        match self.charges.get_mut(charge_id) {
            Some(mut charge) => {
                charge.status = ChargeStatus::Succeeded;
                true
            }
            None => false,
        }
    }

    /// Record a refund issued outside the ledger (dashboard, processor support)
    pub fn refund_out_of_band(&self, charge_id: &str, amount_cents: Cents) -> bool {
        match self.charges.get_mut(charge_id) {
            Some(mut charge) => {
                let remaining = charge.amount_cents - charge.amount_refunded_cents;
                charge.amount_refunded_cents += amount_cents.min(remaining);
                true
            }
            None => false,
        }
    }

    fn find_by_intent(&self, intent_id: &str) -> Option<String> {
        self.charges
            .iter()
            .find(|entry| entry.payment_intent_id.as_deref() == Some(intent_id))
            .map(|entry| entry.id.clone())
    }

    fn refund_flow(&self, charge: &Charge, amount_cents: Cents, reverse_transfer: bool) -> Option<FlowOfFunds> {
        if !self.reports_flow_of_funds {
            return None;
        }

        let amount = Money::new(charge.currency, -amount_cents);
        Some(FlowOfFunds {
            issued_amount: amount,
            settled_amount: amount,
            gumroad_amount: amount,
            merchant_account_gross_amount: reverse_transfer.then_some(amount),
            merchant_account_net_amount: reverse_transfer.then_some(amount),
        })
    }
}

impl ChargeGateway for InMemoryGateway {
    fn processor(&self) -> ProcessorId {
        self.processor
    }

    fn charge(&self, request: &ChargeRequest) -> Result<Charge, GatewayError> {
        let token = request.payment_method.as_str();
        if token.starts_with("decline") {
            return Err(GatewayError::Declined(DECLINE_MESSAGE.to_string()));
        }
        if token.starts_with("unavailable") {
            return Err(GatewayError::Unavailable);
        }

        if let Some(charge_id) = &request.attach_to {
            let mut charge = self.charges.get_mut(charge_id).ok_or_else(|| {
                GatewayError::InvalidRequest(format!("No such charge: '{}'", charge_id))
            })?;
            charge.amount_cents += request.amount_cents;
            let (currency, amount_cents) = (charge.currency, charge.amount_cents);
            if let Some(flow) = charge.flow_of_funds.as_mut() {
                *flow = FlowOfFunds::build_simple_flow_of_funds(currency, amount_cents);
            }
            return Ok(charge.clone());
        }

        let (status, payment_intent_id) = if token.starts_with("3ds") {
            (ChargeStatus::RequiresAction, Some(self.next_id("pi")))
        } else if request.capture {
            (ChargeStatus::Succeeded, None)
        } else {
            (ChargeStatus::Authorized, None)
        };

        let charge = Charge {
            id: self.next_id("ch"),
            payment_intent_id,
            status,
            currency: request.currency,
            amount_cents: request.amount_cents,
            amount_refunded_cents: 0,
            flow_of_funds: self
                .reports_flow_of_funds
                .then(|| FlowOfFunds::build_simple_flow_of_funds(request.currency, request.amount_cents)),
        };
        self.charges.insert(charge.id.clone(), charge.clone());

        Ok(charge)
    }

    fn confirm_charge(
        &self,
        purchase: &Purchase,
        params: &ConfirmParams,
    ) -> Result<Charge, GatewayError> {
        if let Some(message) = &params.processor_error {
            return Err(GatewayError::Declined(message.clone()));
        }

        let charge_id = purchase
            .processor_payment_intent_id
            .as_deref()
            .and_then(|intent| self.find_by_intent(intent))
            .ok_or_else(|| GatewayError::InvalidRequest("No such payment intent".to_string()))?;

        let mut charge = self
            .charges
            .get_mut(&charge_id)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("No such charge: '{}'", charge_id)))?;
        if charge.status == ChargeStatus::Failed {
            return Err(GatewayError::Declined(DECLINE_MESSAGE.to_string()));
        }
        charge.status = ChargeStatus::Succeeded;

        Ok(charge.clone())
    }

    fn refund(&self, request: &RefundRequest) -> Result<ChargeRefund, GatewayError> {
        if let Some(error) = self
            .scripted_refund_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(error);
        }

        let mut charge = self.charges.get_mut(&request.transaction_id).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("No such charge: '{}'", request.transaction_id))
        })?;

        let remaining = charge.amount_cents - charge.amount_refunded_cents;
        if remaining <= 0 {
            return Err(GatewayError::AlreadyRefunded);
        }

        let amount_cents = request.amount_cents.unwrap_or(remaining);
        if amount_cents <= 0 || amount_cents > remaining {
            return Err(GatewayError::InvalidRequest(format!(
                "Refund amount ({}) is greater than unrefunded amount on charge ({})",
                amount_cents, remaining
            )));
        }
        charge.amount_refunded_cents += amount_cents;

        let refund = ChargeRefund {
            id: self.next_id("re"),
            charge_id: charge.id.clone(),
            amount_cents,
            status: RefundStatus::Succeeded,
            flow_of_funds: self.refund_flow(&charge, amount_cents, request.reverse_transfer),
        };
        self.refunds.insert(refund.id.clone(), refund.clone());

        Ok(refund)
    }

    fn get_or_search_charge(&self, purchase: &Purchase) -> Option<Charge> {
        if let Some(charge) = purchase
            .stripe_transaction_id
            .as_deref()
            .and_then(|id| self.charge_by_id(id))
        {
            return Some(charge);
        }

        purchase
            .processor_payment_intent_id
            .as_deref()
            .and_then(|intent| self.find_by_intent(intent))
            .and_then(|id| self.charge_by_id(&id))
    }
}
