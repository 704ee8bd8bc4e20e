//! Transactional in-memory ledger store
//!
//! This module provides the `LedgerStore`, the persistence collaborator of the
//! settlement ledger. It keeps every record (purchases, refunds, linked
//! records and seller-balance entries) in one `LedgerState` and offers
//! all-or-nothing multi-row transactions over it.
//!
//! # Transactions
//!
//! `LedgerStore::transaction` runs a closure against the state while holding
//! the store lock. Every write made through `LedgerState` pushes the row's
//! previous value onto an undo journal; if the closure returns `Err` (or
//! panics) the journal is replayed backwards and the state is exactly what
//! it was before. A transaction therefore only copies the rows it touches.
//! Reads made inside the closure and the writes that depend on them happen
//! under the same lock: a refund can never be computed from aggregates
//! another refund is about to change.
//!
//! Identifiers are allocated from a counter inside the state, so an aborted
//! transaction does not consume them.
//!
//! # Indexes
//!
//! Purchases are indexed by external id, product and charge group; refunds
//! and balance entries by purchase; balances are kept per seller. These keys
//! are set when a row is saved, so they must change through `save_purchase`,
//! never through `purchase_mut`.

use crate::types::{
    BalanceEntry, Cents, ChargeGroupId, Gift, GiftId, LedgerError, MerchantAccount,
    MerchantAccountId, Preorder, PreorderId, ProcessorId, Product, ProductId, Purchase,
    PurchaseId, Refund, RefundId, RefundStatus, Seller, Subscription, SubscriptionId, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Previous value of one written row
#[derive(Debug, Clone)]
enum Undo {
    NextId(u64),
    Purchase(PurchaseId, Option<Purchase>),
    Refund(RefundId, Option<Refund>),
    Product(ProductId, Option<Product>),
    Seller(UserId, Option<Seller>),
    MerchantAccount(MerchantAccountId, Option<MerchantAccount>),
    Subscription(SubscriptionId, Option<Subscription>),
    Gift(GiftId, Option<Gift>),
    Preorder(PreorderId, Option<Preorder>),
    BalanceEntry,
}

/// Every record the ledger persists
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    purchases: HashMap<PurchaseId, Purchase>,
    external_ids: HashMap<String, PurchaseId>,
    purchases_by_product: HashMap<ProductId, Vec<PurchaseId>>,
    purchases_by_charge: HashMap<ChargeGroupId, Vec<PurchaseId>>,
    refunds: BTreeMap<RefundId, Refund>,
    refunds_by_purchase: HashMap<PurchaseId, Vec<RefundId>>,
    products: HashMap<ProductId, Product>,
    sellers: HashMap<UserId, Seller>,
    merchant_accounts: HashMap<MerchantAccountId, MerchantAccount>,
    accounts_by_seller: HashMap<(UserId, ProcessorId), MerchantAccountId>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    gifts: HashMap<GiftId, Gift>,
    preorders: HashMap<PreorderId, Preorder>,
    balance_entries: Vec<BalanceEntry>,
    entries_by_purchase: HashMap<PurchaseId, Vec<usize>>,
    balances: HashMap<UserId, Cents>,
    next_id: u64,
    journal: Vec<Undo>,
}

fn unindex<K: std::hash::Hash + Eq, V: PartialEq>(index: &mut HashMap<K, Vec<V>>, key: K, value: &V) {
    if let Some(values) = index.get_mut(&key) {
        if let Some(position) = values.iter().rposition(|v| v == value) {
            values.remove(position);
        }
        if values.is_empty() {
            index.remove(&key);
        }
    }
}

impl LedgerState {
    /// Allocate the next row identifier
    pub fn next_id(&mut self) -> u64 {
        self.journal.push(Undo::NextId(self.next_id));
        self.next_id += 1;
        self.next_id
    }

    pub fn purchase(&self, id: PurchaseId) -> Result<&Purchase, LedgerError> {
        self.purchases
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("purchase", id))
    }

    /// Mutable access to a purchase row
    ///
    /// External id, product and charge group are index keys: change them
    /// through [`LedgerState::save_purchase`] instead.
    pub fn purchase_mut(&mut self, id: PurchaseId) -> Result<&mut Purchase, LedgerError> {
        let purchase = self
            .purchases
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("purchase", id))?;
        self.journal.push(Undo::Purchase(id, Some(purchase.clone())));
        Ok(purchase)
    }

    pub fn purchase_by_external_id(&self, external_id: &str) -> Result<&Purchase, LedgerError> {
        self.external_ids
            .get(external_id)
            .and_then(|id| self.purchases.get(id))
            .ok_or_else(|| LedgerError::not_found("purchase", external_id))
    }

    /// Insert or replace a purchase row
    pub fn save_purchase(&mut self, purchase: Purchase) {
        let id = purchase.id;
        let previous = self.put_purchase(purchase);
        self.journal.push(Undo::Purchase(id, previous));
    }

    fn put_purchase(&mut self, purchase: Purchase) -> Option<Purchase> {
        let id = purchase.id;
        let keys = (purchase.external_id.clone(), purchase.product_id, purchase.combined_charge);
        let previous = self.purchases.insert(id, purchase);
        let reindex = previous.as_ref().map_or(true, |old| {
            (&old.external_id, old.product_id, old.combined_charge) != (&keys.0, keys.1, keys.2)
        });
        if reindex {
            if let Some(old) = &previous {
                self.unindex_purchase(old);
            }
            self.external_ids.insert(keys.0, id);
            self.purchases_by_product.entry(keys.1).or_default().push(id);
            if let Some(group) = keys.2 {
                self.purchases_by_charge.entry(group).or_default().push(id);
            }
        }
        previous
    }

    fn take_purchase(&mut self, id: PurchaseId) {
        if let Some(old) = self.purchases.remove(&id) {
            self.unindex_purchase(&old);
        }
    }

    fn unindex_purchase(&mut self, purchase: &Purchase) {
        if self.external_ids.get(&purchase.external_id) == Some(&purchase.id) {
            self.external_ids.remove(&purchase.external_id);
        }
        unindex(&mut self.purchases_by_product, purchase.product_id, &purchase.id);
        if let Some(group) = purchase.combined_charge {
            unindex(&mut self.purchases_by_charge, group, &purchase.id);
        }
    }

    /// All purchases sorted by id
    pub fn purchases(&self) -> Vec<&Purchase> {
        let mut purchases: Vec<&Purchase> = self.purchases.values().collect();
        purchases.sort_by_key(|purchase| purchase.id);
        purchases
    }

    pub fn purchases_for_product(&self, product_id: ProductId) -> impl Iterator<Item = &Purchase> {
        self.purchases_by_product
            .get(&product_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.purchases.get(id))
    }

    /// Processor charge already shared by a combined-charge group
    pub fn combined_charge_transaction(&self, group: ChargeGroupId) -> Option<&str> {
        self.purchases_by_charge
            .get(&group)?
            .iter()
            .filter_map(|id| self.purchases.get(id))
            .find_map(|purchase| purchase.stripe_transaction_id.as_deref())
    }

    pub fn save_refund(&mut self, refund: Refund) {
        let (id, purchase_id) = (refund.id, refund.purchase_id);
        let previous = self.refunds.insert(id, refund);
        if previous.is_none() {
            self.refunds_by_purchase.entry(purchase_id).or_default().push(id);
        }
        self.journal.push(Undo::Refund(id, previous));
    }

    /// Refunds of a purchase, oldest first
    pub fn refunds_for(&self, purchase_id: PurchaseId) -> Vec<&Refund> {
        self.refunds_by_purchase
            .get(&purchase_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.refunds.get(id))
            .collect()
    }

    /// Gross amount refunded so far through the processor
    pub fn refunded_gross_cents(&self, purchase_id: PurchaseId) -> Cents {
        self.refunds_for(purchase_id)
            .iter()
            .filter(|refund| refund.status != RefundStatus::Failed)
            .map(|refund| refund.total_transaction_cents)
            .sum()
    }

    pub fn product(&self, id: ProductId) -> Result<&Product, LedgerError> {
        self.products
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("product", id))
    }

    pub fn save_product(&mut self, product: Product) {
        let id = product.id;
        let previous = self.products.insert(id, product);
        self.journal.push(Undo::Product(id, previous));
    }

    pub fn seller(&self, id: UserId) -> Result<&Seller, LedgerError> {
        self.sellers
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("seller", id))
    }

    pub fn save_seller(&mut self, seller: Seller) {
        let id = seller.id;
        let previous = self.sellers.insert(id, seller);
        self.journal.push(Undo::Seller(id, previous));
    }

    /// Whether the user is internal support staff
    pub fn is_team_member(&self, id: UserId) -> bool {
        self.sellers.get(&id).is_some_and(|user| user.is_team_member)
    }

    pub fn merchant_account(&self, id: MerchantAccountId) -> Result<&MerchantAccount, LedgerError> {
        self.merchant_accounts
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("merchant account", id))
    }

    pub fn save_merchant_account(&mut self, account: MerchantAccount) {
        let id = account.id;
        let key = (account.seller_id, account.processor);
        let previous = self.merchant_accounts.insert(id, account);
        if previous.is_none() {
            self.accounts_by_seller.entry(key).or_insert(id);
        }
        self.journal.push(Undo::MerchantAccount(id, previous));
    }

    /// The seller's connected account on a processor, if any
    pub fn merchant_account_for(
        &self,
        seller_id: UserId,
        processor: ProcessorId,
    ) -> Option<&MerchantAccount> {
        self.accounts_by_seller
            .get(&(seller_id, processor))
            .and_then(|id| self.merchant_accounts.get(id))
    }

    pub fn subscription(&self, id: SubscriptionId) -> Result<&Subscription, LedgerError> {
        self.subscriptions
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("subscription", id))
    }

    pub fn subscription_mut(&mut self, id: SubscriptionId) -> Result<&mut Subscription, LedgerError> {
        let subscription = self
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("subscription", id))?;
        self.journal.push(Undo::Subscription(id, Some(subscription.clone())));
        Ok(subscription)
    }

    pub fn save_subscription(&mut self, subscription: Subscription) {
        let id = subscription.id;
        let previous = self.subscriptions.insert(id, subscription);
        self.journal.push(Undo::Subscription(id, previous));
    }

    pub fn gift(&self, id: GiftId) -> Result<&Gift, LedgerError> {
        self.gifts
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("gift", id))
    }

    pub fn gift_mut(&mut self, id: GiftId) -> Result<&mut Gift, LedgerError> {
        let gift = self
            .gifts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("gift", id))?;
        self.journal.push(Undo::Gift(id, Some(gift.clone())));
        Ok(gift)
    }

    pub fn save_gift(&mut self, gift: Gift) {
        let id = gift.id;
        let previous = self.gifts.insert(id, gift);
        self.journal.push(Undo::Gift(id, previous));
    }

    pub fn preorder(&self, id: PreorderId) -> Result<&Preorder, LedgerError> {
        self.preorders
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("preorder", id))
    }

    pub fn preorder_mut(&mut self, id: PreorderId) -> Result<&mut Preorder, LedgerError> {
        let preorder = self
            .preorders
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("preorder", id))?;
        self.journal.push(Undo::Preorder(id, Some(preorder.clone())));
        Ok(preorder)
    }

    pub fn save_preorder(&mut self, preorder: Preorder) {
        let id = preorder.id;
        let previous = self.preorders.insert(id, preorder);
        self.journal.push(Undo::Preorder(id, previous));
    }

    pub fn record_balance_entry(&mut self, entry: BalanceEntry) {
        *self.balances.entry(entry.seller_id).or_default() += entry.amount_cents;
        self.entries_by_purchase
            .entry(entry.purchase_id)
            .or_default()
            .push(self.balance_entries.len());
        self.balance_entries.push(entry);
        self.journal.push(Undo::BalanceEntry);
    }

    /// Current balance of a seller: sum of all entries
    pub fn balance_cents(&self, seller_id: UserId) -> Cents {
        self.balances.get(&seller_id).copied().unwrap_or(0)
    }

    pub fn balance_entries_for(&self, purchase_id: PurchaseId) -> Vec<&BalanceEntry> {
        self.entries_by_purchase
            .get(&purchase_id)
            .into_iter()
            .flatten()
            .filter_map(|index| self.balance_entries.get(*index))
            .collect()
    }

    /// Forget the journal; the writes made so far become permanent
    fn commit(&mut self) {
        self.journal.clear();
    }

    /// Undo every journaled write, newest first
    fn rollback(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::NextId(previous) => self.next_id = previous,
                Undo::Purchase(id, previous) => match previous {
                    Some(purchase) => {
                        self.put_purchase(purchase);
                    }
                    None => self.take_purchase(id),
                },
                Undo::Refund(id, previous) => match previous {
                    Some(refund) => {
                        self.refunds.insert(id, refund);
                    }
                    None => {
                        if let Some(refund) = self.refunds.remove(&id) {
                            unindex(&mut self.refunds_by_purchase, refund.purchase_id, &id);
                        }
                    }
                },
                Undo::Product(id, previous) => restore(&mut self.products, id, previous),
                Undo::Seller(id, previous) => restore(&mut self.sellers, id, previous),
                Undo::MerchantAccount(id, previous) => {
                    if previous.is_none() {
                        if let Some(account) = self.merchant_accounts.get(&id) {
                            let key = (account.seller_id, account.processor);
                            if self.accounts_by_seller.get(&key) == Some(&id) {
                                self.accounts_by_seller.remove(&key);
                            }
                        }
                    }
                    restore(&mut self.merchant_accounts, id, previous);
                }
                Undo::Subscription(id, previous) => restore(&mut self.subscriptions, id, previous),
                Undo::Gift(id, previous) => restore(&mut self.gifts, id, previous),
                Undo::Preorder(id, previous) => restore(&mut self.preorders, id, previous),
                Undo::BalanceEntry => {
                    if let Some(entry) = self.balance_entries.pop() {
                        *self.balances.entry(entry.seller_id).or_default() -= entry.amount_cents;
                        let index = self.balance_entries.len();
                        unindex(&mut self.entries_by_purchase, entry.purchase_id, &index);
                    }
                }
            }
        }
    }
}

fn restore<K: std::hash::Hash + Eq, V>(rows: &mut HashMap<K, V>, id: K, previous: Option<V>) {
    match previous {
        Some(row) => {
            rows.insert(id, row);
        }
        None => {
            rows.remove(&id);
        }
    }
}

/// Open transaction: rolls the state back unless committed
struct Transaction<'a> {
    state: MutexGuard<'a, LedgerState>,
    committed: bool,
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            self.state.commit();
        } else {
            self.state.rollback();
        }
    }
}

/// Thread-safe transactional store
#[derive(Debug, Default)]
pub struct LedgerStore {
    state: Mutex<LedgerState>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a read-only closure against the committed state
    pub fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> T {
        // A panicking transaction is rolled back while unwinding, so a
        // poisoned lock still guards consistent data.
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Run a closure as one atomic transaction
    ///
    /// Writes are applied in place and journaled; they are undone unless
    /// the closure returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns whatever error the closure returned; nothing is committed.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut transaction = Transaction {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
            committed: false,
        };
        let value = f(&mut *transaction.state)?;
        transaction.committed = true;
        Ok(value)
    }

    /// Snapshot of one purchase
    pub fn purchase(&self, id: PurchaseId) -> Result<Purchase, LedgerError> {
        self.read(|state| state.purchase(id).cloned())
    }

    /// Snapshot of one purchase, looked up by external id
    pub fn find_purchase(&self, external_id: &str) -> Result<Purchase, LedgerError> {
        self.read(|state| state.purchase_by_external_id(external_id).cloned())
    }

    /// Snapshot of all refunds of a purchase
    pub fn refunds_for(&self, purchase_id: PurchaseId) -> Vec<Refund> {
        self.read(|state| state.refunds_for(purchase_id).into_iter().cloned().collect())
    }

    /// Snapshot of all purchases sorted by id
    pub fn purchases(&self) -> Vec<Purchase> {
        self.read(|state| state.purchases().into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Currency, PurchaseAmounts};

    fn insert_purchase(state: &mut LedgerState, external_id: &str) -> PurchaseId {
        let id = PurchaseId(state.next_id());
        state.save_purchase(Purchase::new(
            id,
            external_id,
            ProductId(1),
            UserId(1),
            Currency::Usd,
            PurchaseAmounts {
                price_cents: 1000,
                ..PurchaseAmounts::default()
            },
        ));
        id
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let store = LedgerStore::new();

        let id = store
            .transaction(|state| Ok(insert_purchase(state, "p1")))
            .unwrap();

        assert_eq!(store.purchase(id).unwrap().external_id, "p1");
        assert_eq!(store.find_purchase("p1").unwrap().id, id);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = LedgerStore::new();

        let result: Result<(), LedgerError> = store.transaction(|state| {
            insert_purchase(state, "p1");
            Err(LedgerError::TemporaryProblem)
        });

        assert_eq!(result, Err(LedgerError::TemporaryProblem));
        assert!(store.find_purchase("p1").is_err());
        // the aborted transaction did not consume the id either
        let id = store
            .transaction(|state| Ok(insert_purchase(state, "p2")))
            .unwrap();
        assert_eq!(id, PurchaseId(1));
    }

    #[test]
    fn test_store_survives_panicking_transaction() {
        let store = std::sync::Arc::new(LedgerStore::new());
        store
            .transaction(|state| Ok(insert_purchase(state, "p1")))
            .unwrap();

        let cloned = std::sync::Arc::clone(&store);
        let handle = std::thread::spawn(move || {
            let _: Result<(), LedgerError> = cloned.transaction(|state| {
                insert_purchase(state, "p2");
                panic!("boom");
            });
        });
        assert!(handle.join().is_err());

        assert!(store.find_purchase("p1").is_ok());
        assert!(store.find_purchase("p2").is_err());
    }

    #[test]
    fn test_rollback_restores_updated_rows_and_indexes() {
        let store = LedgerStore::new();
        let id = store
            .transaction(|state| Ok(insert_purchase(state, "p1")))
            .unwrap();

        let result: Result<(), LedgerError> = store.transaction(|state| {
            state.purchase_mut(id)?.amount_refunded_cents = 500;
            let mut moved = state.purchase(id)?.clone();
            moved.product_id = ProductId(2);
            moved.combined_charge = Some(ChargeGroupId(7));
            state.save_purchase(moved);
            state.record_balance_entry(BalanceEntry {
                seller_id: UserId(1),
                kind: crate::types::BalanceEntryKind::RefundDebit,
                amount_cents: -500,
                purchase_id: id,
                refund_id: None,
            });
            Err(LedgerError::TemporaryProblem)
        });

        assert!(result.is_err());
        store.read(|state| {
            assert_eq!(state.purchase(id).unwrap().amount_refunded_cents, 0);
            assert_eq!(state.purchases_for_product(ProductId(1)).count(), 1);
            assert_eq!(state.purchases_for_product(ProductId(2)).count(), 0);
            assert_eq!(state.combined_charge_transaction(ChargeGroupId(7)), None);
            assert!(state.balance_entries_for(id).is_empty());
            assert_eq!(state.balance_cents(UserId(1)), 0);
        });
    }

    #[test]
    fn test_transaction_does_not_copy_untouched_rows() {
        let store = LedgerStore::new();
        store
            .transaction(|state| {
                for n in 0..100 {
                    insert_purchase(state, &format!("p{}", n));
                }
                Ok(())
            })
            .unwrap();

        store
            .transaction(|state| {
                state.purchase_mut(PurchaseId(1))?.amount_refunded_cents = 100;
                assert_eq!(state.journal.len(), 1);
                Ok(())
            })
            .unwrap();

        assert!(store.read(|state| state.journal.is_empty()));
    }

    #[test]
    fn test_indexes_follow_saved_purchases() {
        let store = LedgerStore::new();
        let (first, second) = store
            .transaction(|state| Ok((insert_purchase(state, "p1"), insert_purchase(state, "p2"))))
            .unwrap();
        store
            .transaction(|state| {
                for id in [first, second] {
                    let mut purchase = state.purchase(id)?.clone();
                    purchase.combined_charge = Some(ChargeGroupId(3));
                    state.save_purchase(purchase);
                }
                state.purchase_mut(second)?.stripe_transaction_id = Some("ch_9".to_string());
                Ok(())
            })
            .unwrap();

        store.read(|state| {
            assert_eq!(state.combined_charge_transaction(ChargeGroupId(3)), Some("ch_9"));
            assert_eq!(state.purchases_for_product(ProductId(1)).count(), 2);
        });
    }

    #[test]
    fn test_balance_sums_entries_per_seller() {
        let store = LedgerStore::new();
        store
            .transaction(|state| {
                for (seller, amount) in [(1, 900), (1, -300), (2, 50)] {
                    state.record_balance_entry(BalanceEntry {
                        seller_id: UserId(seller),
                        kind: crate::types::BalanceEntryKind::SaleCredit,
                        amount_cents: amount,
                        purchase_id: PurchaseId(1),
                        refund_id: None,
                    });
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(store.read(|state| state.balance_cents(UserId(1))), 600);
        assert_eq!(store.read(|state| state.balance_cents(UserId(2))), 50);
    }
}
