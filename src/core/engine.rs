//! Ledger engine
//!
//! This module provides the `LedgerEngine` that replays ledger commands by
//! coordinating the purchase creator, the completion orchestrator, the
//! refund ledger and reconciliation over one shared store.
//!
//! The engine owns the command-log concerns the services do not:
//! - converting major-unit amounts to cents in the right currency
//! - resolving external purchase ids
//! - registering the sellers, products and team members commands mention

use crate::config::LedgerConfig;
use crate::core::completion::CompletionOrchestrator;
use crate::core::creation::{NewPurchase, PlanChangeRequest, PurchaseCreator};
use crate::core::gateway::{ConfirmParams, GatewayRegistry, InMemoryGateway};
use crate::core::policy::{FraudScreen, PassthroughFraudScreen, ReviewEligibility, StandardReviewEligibility};
use crate::core::refund::{RefundLedger, RefundOutcome};
use crate::core::sinks::SideEffects;
use crate::core::state_machine::PurchaseStateMachine;
use crate::core::store::{LedgerState, LedgerStore};
use crate::core::sync_status::SyncStatusWithChargeProcessor;
use crate::types::{
    Cents, Chargeback, CommandType, Currency, LedgerCommand, LedgerError, ProcessorId, Product,
    ProductId, PurchaseAmounts, PurchaseId, PurchaseState, Seller,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

/// Final state of one purchase, as reported by the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseSummary {
    pub external_id: String,
    pub state: PurchaseState,
    pub currency: Currency,
    pub price_cents: Cents,
    pub amount_refunded_cents: Cents,
    pub fee_refunded_cents: Cents,
    pub tax_refunded_cents: Cents,
    pub gumroad_tax_refunded_cents: Cents,
    pub fully_refunded: bool,
    pub partially_refunded: bool,
    pub review_counted: bool,
}

/// Command replay engine
///
/// Cheap to share: every collaborator is reference counted, so one engine
/// behind an `Arc` serves any number of concurrent tasks.
#[derive(Debug)]
pub struct LedgerEngine {
    store: Arc<LedgerStore>,
    creator: PurchaseCreator,
    orchestrator: CompletionOrchestrator,
    ledger: RefundLedger,
    sync: SyncStatusWithChargeProcessor,
    review: Arc<dyn ReviewEligibility>,
    currency: Currency,
}

impl LedgerEngine {
    /// Create an engine backed by in-memory processors for every processor id
    ///
    /// Side effects go to the log and every payment method passes the fraud
    /// screen.
    pub fn new(config: &LedgerConfig) -> Self {
        let gateways = [ProcessorId::Stripe, ProcessorId::Braintree, ProcessorId::PaypalDirect]
            .into_iter()
            .fold(GatewayRegistry::new(), |registry, processor| {
                registry.register(Arc::new(InMemoryGateway::new(processor)))
            });
        Self::with_collaborators(
            config,
            gateways,
            SideEffects::default(),
            Arc::new(PassthroughFraudScreen),
        )
    }

    /// Create an engine over explicit collaborators
    ///
    /// # Arguments
    ///
    /// * `config` - Lock timeout and product currency
    /// * `gateways` - Processor registry shared by every service
    /// * `effects` - Notification and job sinks
    /// * `fraud_screen` - Consulted before every charge
    pub fn with_collaborators(
        config: &LedgerConfig,
        gateways: GatewayRegistry,
        effects: SideEffects,
        fraud_screen: Arc<dyn FraudScreen>,
    ) -> Self {
        let store = Arc::new(LedgerStore::new());
        let machine = PurchaseStateMachine::new(store.clone(), effects.clone());
        let ledger = RefundLedger::new(store.clone(), gateways.clone(), effects);

        LedgerEngine {
            creator: PurchaseCreator::new(
                machine.clone(),
                gateways.clone(),
                fraud_screen,
                config.inventory_lock_timeout,
            ),
            orchestrator: CompletionOrchestrator::new(machine.clone(), gateways.clone()),
            sync: SyncStatusWithChargeProcessor::new(machine, gateways, ledger.clone()),
            ledger,
            store,
            review: Arc::new(StandardReviewEligibility),
            currency: config.currency,
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn refund_ledger(&self) -> &RefundLedger {
        &self.ledger
    }

    /// Process a single ledger command
    ///
    /// # Arguments
    ///
    /// * `command` - The command to apply
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a column the command type requires is missing
    /// - the referenced purchase, product or subscription does not exist
    /// - the underlying ledger operation rejects the command
    pub async fn process(&self, command: LedgerCommand) -> Result<(), LedgerError> {
        self.store.transaction(|state| {
            register_team_member(state, &command);
            Ok(())
        })?;

        match command.command {
            CommandType::Purchase => self.process_purchase(&command).await,
            CommandType::Confirm => {
                let purchase_id = self.resolve(&command)?;
                let params = ConfirmParams {
                    processor_error: command.flags.error.clone(),
                };
                self.orchestrator.confirm(purchase_id, &params)
            }
            CommandType::Refund => {
                let purchase = self.store.find_purchase(&command.purchase)?;
                let amount_cents = command
                    .amount
                    .map(|amount| purchase.currency.to_cents(amount))
                    .transpose()?;
                let outcome = self.ledger.refund(purchase.id, command.user, amount_cents)?;
                log_outcome(&command, outcome);
                Ok(())
            }
            CommandType::RefundVat => {
                let outcome = self
                    .ledger
                    .refund_gumroad_taxes(self.resolve(&command)?, command.user)?;
                log_outcome(&command, outcome);
                Ok(())
            }
            CommandType::FraudRefund => {
                let outcome = self
                    .ledger
                    .refund_for_fraud(self.resolve(&command)?, command.user)?;
                log_outcome(&command, outcome);
                Ok(())
            }
            CommandType::Sync => {
                let outcome = self.sync.sync(self.resolve(&command)?)?;
                debug!(purchase = %command.purchase, ?outcome, "synced");
                Ok(())
            }
            CommandType::Chargeback => self.process_chargeback(&command),
            CommandType::PendingCancel => {
                let purchase_id = self.resolve(&command)?;
                self.store.transaction(|state| {
                    let subscription_id = state
                        .purchase(purchase_id)?
                        .subscription_id
                        .ok_or_else(|| LedgerError::not_found("subscription", &command.purchase))?;
                    state.subscription_mut(subscription_id)?.mark_pending_cancellation();
                    Ok(())
                })
            }
        }
    }

    /// Create and charge a purchase
    ///
    /// The product (and its seller) is registered on first sight; later
    /// commands may tighten its limit or turn on recurring billing.
    async fn process_purchase(&self, command: &LedgerCommand) -> Result<(), LedgerError> {
        let product_id = command
            .product
            .ok_or_else(|| LedgerError::missing_field("purchase", &command.purchase, "product"))?;
        let price = command
            .amount
            .ok_or_else(|| LedgerError::missing_field("purchase", &command.purchase, "amount"))?;

        let amounts = PurchaseAmounts {
            price_cents: self.currency.to_cents(price)?,
            tax_cents: self.optional_cents(command.tax)?,
            gumroad_tax_cents: self.optional_cents(command.vat)?,
            shipping_cents: 0,
            fee_cents: self.optional_cents(command.fee)?,
        };

        let plan_change = match &command.flags.plan_change {
            Some((kind, external_id)) => {
                let subscription_id = self
                    .store
                    .find_purchase(external_id)?
                    .subscription_id
                    .ok_or_else(|| LedgerError::not_found("subscription", external_id))?;
                Some(PlanChangeRequest {
                    subscription_id,
                    kind: *kind,
                })
            }
            None => None,
        };

        let currency = self.currency;
        self.store
            .transaction(|state| register_product(state, product_id, command, currency))?;

        let flags = &command.flags;
        let mut new = NewPurchase::new(command.purchase.clone(), product_id, amounts);
        if flags.paypal {
            new.processor = ProcessorId::PaypalDirect;
        }
        if let Some(payment_method) = &flags.payment_method {
            new.payment_method = payment_method.clone();
        }
        new.is_preorder = flags.preorder;
        new.is_gift = flags.gift;
        new.is_test = flags.test;
        new.no_charge = flags.no_charge;
        new.combined_charge = flags.charge;
        new.plan_change = plan_change;

        let purchase_id = self.creator.create(new).await?;
        debug!(purchase = %purchase_id, external_id = %command.purchase, "purchase processed");
        Ok(())
    }

    /// Record a dispute on the purchase
    fn process_chargeback(&self, command: &LedgerCommand) -> Result<(), LedgerError> {
        let purchase = self.store.find_purchase(&command.purchase)?;
        let amount_cents = match command.amount {
            Some(amount) => purchase.currency.to_cents(amount)?,
            None => purchase.total_transaction_cents,
        };

        self.store.transaction(|state| {
            state.purchase_mut(purchase.id)?.chargeback = Some(Chargeback {
                amount_cents,
                won: command.flags.won,
                reversal_transferred: command.flags.transferred,
            });
            Ok(())
        })
    }

    fn resolve(&self, command: &LedgerCommand) -> Result<PurchaseId, LedgerError> {
        self.store
            .read(|state| state.purchase_by_external_id(&command.purchase).map(|purchase| purchase.id))
    }

    fn optional_cents(&self, amount: Option<Decimal>) -> Result<Cents, LedgerError> {
        amount.map_or(Ok(0), |amount| self.currency.to_cents(amount))
    }

    /// Final state of every purchase, ordered by external id
    ///
    /// The order does not depend on how concurrent replay interleaved
    /// purchase creation.
    pub fn summaries(&self) -> Vec<PurchaseSummary> {
        let mut summaries: Vec<_> = self
            .store
            .purchases()
            .into_iter()
            .map(|purchase| PurchaseSummary {
                review_counted: self.review.allows_review_to_be_counted(&purchase),
                external_id: purchase.external_id,
                state: purchase.state,
                currency: purchase.currency,
                price_cents: purchase.price_cents,
                amount_refunded_cents: purchase.amount_refunded_cents,
                fee_refunded_cents: purchase.fee_refunded_cents,
                tax_refunded_cents: purchase.tax_refunded_cents,
                gumroad_tax_refunded_cents: purchase.gumroad_tax_refunded_cents,
                fully_refunded: purchase.stripe_refunded,
                partially_refunded: purchase.stripe_partially_refunded,
            })
            .collect();
        summaries.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        summaries
    }
}

fn log_outcome(command: &LedgerCommand, outcome: RefundOutcome) {
    match outcome {
        RefundOutcome::Refunded { refund_id, full } => {
            debug!(purchase = %command.purchase, refund = %refund_id, full, "refund recorded");
        }
        RefundOutcome::NoOp => debug!(purchase = %command.purchase, "nothing to refund"),
    }
}

/// Flag the acting user as support staff
fn register_team_member(state: &mut LedgerState, command: &LedgerCommand) {
    let Some(user_id) = command.user.filter(|_| command.flags.team) else {
        return;
    };
    let mut user = state
        .seller(user_id)
        .cloned()
        .unwrap_or_else(|_| Seller::new(user_id));
    user.is_team_member = true;
    state.save_seller(user);
}

fn register_product(
    state: &mut LedgerState,
    product_id: ProductId,
    command: &LedgerCommand,
    currency: Currency,
) -> Result<(), LedgerError> {
    let flags = &command.flags;
    let mut product = match state.product(product_id) {
        Ok(product) => product.clone(),
        Err(_) => {
            let seller_id = command
                .seller
                .ok_or_else(|| LedgerError::missing_field("purchase", &command.purchase, "seller"))?;
            Product::new(product_id, seller_id, currency)
        }
    };
    product.is_recurring_billing |= flags.recurring;
    if flags.limit.is_some() {
        product.max_purchase_count = flags.limit;
    }

    let mut seller = state
        .seller(product.seller_id)
        .cloned()
        .unwrap_or_else(|_| Seller::new(product.seller_id));
    seller.refunds_disabled |= flags.refunds_disabled;

    state.save_seller(seller);
    state.save_product(product);
    Ok(())
}

impl Default for LedgerEngine {
    fn default() -> Self {
        Self::new(&LedgerConfig::default())
    }
}
