//! Purchase creation
//!
//! `PurchaseCreator` builds the purchase row (and the gift, preorder and
//! plan-change records that come with it) and then runs the charge step
//! inside [`ensure_completion`], so a creation that errors or panics after
//! the row exists still leaves the purchase resolved.
//!
//! # Inventory
//!
//! Products with a purchase limit are serialized per product: the creator
//! holds a permit of that product's semaphore from the sold-out check until
//! the charge step returns. Waiting for the permit is bounded; running out
//! of time is a retryable error. The permit is released on drop, whatever
//! way `create` exits.

use crate::core::completion::ensure_completion;
use crate::core::gateway::{ChargeRequest, ChargeStatus, GatewayError, GatewayRegistry};
use crate::core::policy::FraudScreen;
use crate::core::state_machine::PurchaseStateMachine;
use crate::core::store::LedgerState;
use crate::types::{
    ChargeGroupId, ChargeIntentStatus, Gift, GiftId, GiftState, HolderOfFunds, LedgerError,
    MerchantAccount, MerchantAccountId, PendingPlanChange, PlanChangeKind, Preorder, PreorderId,
    PreorderState, ProcessorId, Product, ProductId, Purchase, PurchaseAmounts, PurchaseId,
    PurchaseState, SubscriptionId,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Default bound on the wait for an inventory lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(50);

/// Upgrade or resubscription requested together with the purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanChangeRequest {
    pub subscription_id: SubscriptionId,
    pub kind: PlanChangeKind,
}

/// Everything needed to create a purchase
#[derive(Debug, Clone, PartialEq)]
pub struct NewPurchase {
    pub external_id: String,
    pub product_id: ProductId,
    pub amounts: PurchaseAmounts,
    pub processor: ProcessorId,
    pub payment_method: String,
    pub is_preorder: bool,
    pub is_gift: bool,
    pub is_test: bool,
    /// Record the purchase without a charge step
    pub no_charge: bool,
    pub combined_charge: Option<ChargeGroupId>,
    pub plan_change: Option<PlanChangeRequest>,
}

impl NewPurchase {
    pub fn new(external_id: impl Into<String>, product_id: ProductId, amounts: PurchaseAmounts) -> Self {
        NewPurchase {
            external_id: external_id.into(),
            product_id,
            amounts,
            processor: ProcessorId::Stripe,
            payment_method: "tok_visa".to_string(),
            is_preorder: false,
            is_gift: false,
            is_test: false,
            no_charge: false,
            combined_charge: None,
            plan_change: None,
        }
    }
}

/// Per-product inventory locks
#[derive(Debug, Default)]
pub struct ProductLocks {
    semaphores: DashMap<ProductId, Arc<Semaphore>>,
}

impl ProductLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait at most `wait` for the product's lock
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InventoryLockTimeout` when the wait runs out.
    pub async fn acquire(
        &self,
        product_id: ProductId,
        wait: Duration,
    ) -> Result<OwnedSemaphorePermit, LedgerError> {
        let semaphore = Arc::clone(
            self.semaphores
                .entry(product_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .value(),
        );

        match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => {
                warn!(product = %product_id, ?wait, "inventory lock not acquired");
                Err(LedgerError::InventoryLockTimeout {
                    product: product_id,
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PurchaseCreator {
    machine: PurchaseStateMachine,
    gateways: GatewayRegistry,
    fraud_screen: Arc<dyn FraudScreen>,
    locks: Arc<ProductLocks>,
    lock_timeout: Duration,
}

impl PurchaseCreator {
    pub fn new(
        machine: PurchaseStateMachine,
        gateways: GatewayRegistry,
        fraud_screen: Arc<dyn FraudScreen>,
        lock_timeout: Duration,
    ) -> Self {
        PurchaseCreator {
            machine,
            gateways,
            fraud_screen,
            locks: Arc::new(ProductLocks::new()),
            lock_timeout,
        }
    }

    /// Create a purchase and run its charge step
    ///
    /// # Arguments
    ///
    /// * `new` - The purchase to create
    ///
    /// # Returns
    ///
    /// The id of the created purchase. A purchase whose charge is waiting on
    /// the buyer is returned still `in_progress`.
    ///
    /// # Errors
    ///
    /// - `InventoryLockTimeout` if the product lock could not be acquired
    /// - `SoldOut` if the product's limit is reached
    /// - `PaymentDeclined`, `FraudBlocked` or `TemporaryProblem` from the
    ///   charge step; the purchase row exists and is failed
    pub async fn create(&self, new: NewPurchase) -> Result<PurchaseId, LedgerError> {
        let store = self.machine.store();
        let product = store.read(|state| state.product(new.product_id).cloned())?;

        let _permit = match product.max_purchase_count {
            Some(_) => Some(self.locks.acquire(product.id, self.lock_timeout).await?),
            None => None,
        };

        let purchase_id = store.transaction(|state| build_purchase(state, &product, &new))?;
        debug!(purchase = %purchase_id, external_id = %new.external_id, "purchase row created");

        ensure_completion(&self.machine, purchase_id, || self.charge(purchase_id, &new))?;
        Ok(purchase_id)
    }

    fn charge(&self, purchase_id: PurchaseId, new: &NewPurchase) -> Result<(), LedgerError> {
        let store = self.machine.store();
        let purchase = store.purchase(purchase_id)?;

        if let Err(reason) = self.fraud_screen.passes_fraud_screen(&purchase) {
            self.machine
                .handle_purchase_failure(purchase_id, Some(reason.to_string()))?;
            return Err(LedgerError::FraudBlocked { reason: reason.0 });
        }
        if new.no_charge {
            return self.machine.handle_not_charged(purchase_id);
        }
        if purchase.is_free() {
            return self.machine.handle_charge_success(purchase_id, None);
        }

        let gateway = self.gateways.get(purchase.processor)?;
        let attach_to = purchase.combined_charge.and_then(|group| {
            store.read(|state| state.combined_charge_transaction(group).map(str::to_string))
        });
        let request = ChargeRequest {
            reference: purchase.external_id.clone(),
            merchant_account: purchase.merchant_account_id,
            currency: purchase.currency,
            amount_cents: purchase.total_transaction_cents,
            payment_method: purchase.payment_method.clone(),
            capture: !purchase.is_preorder_authorization,
            attach_to,
        };

        match gateway.charge(&request) {
            Ok(charge) => match charge.status {
                ChargeStatus::Succeeded | ChargeStatus::Authorized => {
                    self.machine.handle_charge_success(purchase_id, Some(charge.id))
                }
                ChargeStatus::RequiresAction | ChargeStatus::Processing => {
                    let intent = if charge.status == ChargeStatus::RequiresAction {
                        ChargeIntentStatus::RequiresAction
                    } else {
                        ChargeIntentStatus::Processing
                    };
                    store.transaction(|state| {
                        let purchase = state.purchase_mut(purchase_id)?;
                        purchase.processor_payment_intent_id = charge.payment_intent_id.clone();
                        purchase.charge_intent = Some(intent);
                        Ok(())
                    })?;
                    info!(purchase = %purchase_id, ?intent, "charge waiting on buyer");
                    Ok(())
                }
                ChargeStatus::Failed => self.decline(purchase_id, "Your card was declined.".to_string()),
            },
            Err(GatewayError::Declined(message)) => self.decline(purchase_id, message),
            Err(GatewayError::Unavailable) => Err(LedgerError::TemporaryProblem),
            Err(other) => self.decline(purchase_id, other.to_string()),
        }
    }

    fn decline(&self, purchase_id: PurchaseId, message: String) -> Result<(), LedgerError> {
        self.machine
            .handle_purchase_failure(purchase_id, Some(message.clone()))?;
        Err(LedgerError::PaymentDeclined { message })
    }
}

/// Units already sold or held by in-flight purchases
fn units_taken(state: &LedgerState, product_id: ProductId) -> usize {
    state
        .purchases_for_product(product_id)
        .filter(|purchase| !purchase.is_gift_receiver_purchase)
        .filter(|purchase| {
            purchase.state.is_successful_family() || purchase.state == PurchaseState::InProgress
        })
        .count()
}

fn merchant_account_id(
    state: &mut LedgerState,
    product: &Product,
    processor: ProcessorId,
) -> MerchantAccountId {
    if let Some(account) = state.merchant_account_for(product.seller_id, processor) {
        return account.id;
    }

    let account = MerchantAccount {
        id: MerchantAccountId(state.next_id()),
        seller_id: product.seller_id,
        processor,
        active: true,
        holder_of_funds: if processor.is_buyer_direct_to_seller() {
            HolderOfFunds::Creator
        } else {
            HolderOfFunds::Platform
        },
    };
    let id = account.id;
    state.save_merchant_account(account);
    id
}

fn stage_plan_change(
    state: &mut LedgerState,
    purchase: &mut Purchase,
    request: PlanChangeRequest,
) -> Result<(), LedgerError> {
    let subscription = state.subscription_mut(request.subscription_id)?;
    let previous_original_purchase_id = subscription.original_purchase_id;
    subscription.pending_plan_change = Some(PendingPlanChange {
        kind: request.kind,
        purchase_id: purchase.id,
        previous_price_cents: subscription.price_cents,
        previous_installment_plan: subscription.installment_plan,
        previous_original_purchase_id,
        previous_state: subscription.state,
    });
    subscription.price_cents = purchase.price_cents;
    subscription.purchase_ids.push(purchase.id);
    purchase.subscription_id = Some(request.subscription_id);

    match request.kind {
        PlanChangeKind::Upgrade => {
            subscription.original_purchase_id = purchase.id;
            purchase.is_upgrade_purchase = true;
            purchase.is_original_subscription_purchase = true;
            state
                .purchase_mut(previous_original_purchase_id)?
                .is_original_subscription_purchase = false;
        }
        PlanChangeKind::Resubscription => {
            purchase.is_resubscription_pending_confirmation = true;
        }
    }
    Ok(())
}

fn build_purchase(
    state: &mut LedgerState,
    product: &Product,
    new: &NewPurchase,
) -> Result<PurchaseId, LedgerError> {
    if state.purchase_by_external_id(&new.external_id).is_ok() {
        return Err(LedgerError::DuplicatePurchase {
            external_id: new.external_id.clone(),
        });
    }
    if let Some(limit) = product.max_purchase_count {
        if units_taken(state, product.id) >= limit as usize {
            info!(product = %product.id, limit, "sold out");
            return Err(LedgerError::SoldOut { product: product.id });
        }
    }

    let id = PurchaseId(state.next_id());
    let mut purchase = Purchase::new(
        id,
        new.external_id.clone(),
        product.id,
        product.seller_id,
        product.currency,
        new.amounts,
    );
    purchase.processor = new.processor;
    purchase.payment_method = new.payment_method.clone();
    purchase.is_test_purchase = new.is_test;
    purchase.combined_charge = new.combined_charge;
    purchase.installment_plan = product.installment_plan;
    purchase.merchant_account_id = Some(merchant_account_id(state, product, new.processor));

    if new.is_preorder {
        let preorder_id = PreorderId(state.next_id());
        state.save_preorder(Preorder {
            id: preorder_id,
            product_id: product.id,
            purchase_id: id,
            state: PreorderState::InProgress,
        });
        purchase.preorder_id = Some(preorder_id);
        purchase.is_preorder_authorization = true;
    }

    if let Some(request) = new.plan_change {
        stage_plan_change(state, &mut purchase, request)?;
    }

    if new.is_gift {
        let giftee_id = PurchaseId(state.next_id());
        let gift_id = GiftId(state.next_id());
        let mut giftee = Purchase::new(
            giftee_id,
            format!("{}-giftee", new.external_id),
            product.id,
            product.seller_id,
            product.currency,
            PurchaseAmounts::default(),
        );
        giftee.is_gift_receiver_purchase = true;
        giftee.gift_id = Some(gift_id);
        giftee.is_test_purchase = new.is_test;
        state.save_purchase(giftee);
        state.save_gift(Gift {
            id: gift_id,
            gifter_purchase_id: id,
            giftee_purchase_id: giftee_id,
            state: GiftState::InProgress,
        });
        purchase.is_gift_sender_purchase = true;
        purchase.gift_id = Some(gift_id);
    }

    state.save_purchase(purchase);
    Ok(id)
}
