//! Charge processor abstraction
//!
//! The ledger never talks to a payment processor directly. It goes through a
//! [`ChargeGateway`] resolved from a [`GatewayRegistry`] by processor id, and
//! matches the [`GatewayError`] it gets back exhaustively instead of
//! unwinding on processor failures.

pub mod memory;

pub use memory::InMemoryGateway;

use crate::types::{
    Cents, Currency, FlowOfFunds, LedgerError, MerchantAccountId, ProcessorId, Purchase,
    RefundStatus,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Processor-side status of a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    /// Captured
    Succeeded,
    /// Authorized only; captured later
    Authorized,
    /// Waiting on the buyer (3-D Secure and friends)
    RequiresAction,
    Processing,
    Failed,
}

/// A charge as reported by the processor
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub id: String,
    pub payment_intent_id: Option<String>,
    pub status: ChargeStatus,
    pub currency: Currency,
    pub amount_cents: Cents,
    pub amount_refunded_cents: Cents,
    pub flow_of_funds: Option<FlowOfFunds>,
}

/// A request to charge (or authorize) a buyer
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    /// Our purchase external id, echoed in processor metadata
    pub reference: String,
    pub merchant_account: Option<MerchantAccountId>,
    pub currency: Currency,
    pub amount_cents: Cents,
    pub payment_method: String,
    /// `false` places an authorization hold only
    pub capture: bool,
    /// Existing charge this line item joins (combined charge)
    pub attach_to: Option<String>,
}

/// Result of an out-of-band confirmation step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmParams {
    /// Error reported by the client-side authentication, if it failed
    pub processor_error: Option<String>,
}

/// A refund request against a processor charge
#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub transaction_id: String,
    /// `None` refunds everything still refundable on the charge
    pub amount_cents: Option<Cents>,
    pub currency: Currency,
    pub merchant_account: Option<MerchantAccountId>,
    /// Pull the creator's share back from their connected account
    pub reverse_transfer: bool,
    pub is_for_fraud: bool,
}

/// A refund as reported by the processor
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRefund {
    pub id: String,
    pub charge_id: String,
    pub amount_cents: Cents,
    pub status: RefundStatus,
    pub flow_of_funds: Option<FlowOfFunds>,
}

/// Failure modes a processor can report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("charge has already been refunded")]
    AlreadyRefunded,
    #[error("insufficient funds to refund")]
    InsufficientFunds,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("declined: {0}")]
    Declined(String),
    #[error("processor unavailable")]
    Unavailable,
}

/// One payment processor
pub trait ChargeGateway: Send + Sync + fmt::Debug {
    fn processor(&self) -> ProcessorId;

    /// Charge or authorize a payment method
    fn charge(&self, request: &ChargeRequest) -> Result<Charge, GatewayError>;

    /// Finish a charge that was waiting on an out-of-band step
    fn confirm_charge(
        &self,
        purchase: &Purchase,
        params: &ConfirmParams,
    ) -> Result<Charge, GatewayError>;

    fn refund(&self, request: &RefundRequest) -> Result<ChargeRefund, GatewayError>;

    /// Look up the charge behind a purchase, by charge id or payment intent
    fn get_or_search_charge(&self, purchase: &Purchase) -> Option<Charge>;
}

/// Explicit processor-id to gateway mapping
#[derive(Debug, Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<ProcessorId, Arc<dyn ChargeGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway under the processor it reports
    pub fn register(mut self, gateway: Arc<dyn ChargeGateway>) -> Self {
        self.gateways.insert(gateway.processor(), gateway);
        self
    }

    /// Resolve the gateway for a processor
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::UnknownProcessor` if nothing was registered.
    pub fn get(&self, processor: ProcessorId) -> Result<Arc<dyn ChargeGateway>, LedgerError> {
        self.gateways
            .get(&processor)
            .cloned()
            .ok_or_else(|| LedgerError::unknown_processor(processor.display_name()))
    }
}
