//! Ledger-level scenarios replayed through the engine
//!
//! Each test drives a [`LedgerEngine`] with the same commands the CSV log
//! would produce and checks the stored purchases and refund rows.

use purchase_settlement::core::refund::calculator;
use purchase_settlement::io::parse_flags;
use purchase_settlement::types::{
    CommandType, Currency, LedgerCommand, LedgerError, ProductId, Purchase, PurchaseAmounts,
    PurchaseId, PurchaseState, SubscriptionState, UserId,
};
use purchase_settlement::LedgerEngine;
use rust_decimal::Decimal;
use std::str::FromStr;

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

fn purchase_command(external_id: &str, product: u64, price: &str, vat: &str, fee: &str, flags: &str) -> LedgerCommand {
    let optional = |value: &str| (!value.is_empty()).then(|| dec(value));
    LedgerCommand {
        command: CommandType::Purchase,
        purchase: external_id.to_string(),
        product: Some(ProductId(product)),
        seller: Some(UserId(100 + product)),
        user: Some(UserId(7)),
        amount: Some(dec(price)),
        tax: None,
        vat: optional(vat),
        fee: optional(fee),
        flags: parse_flags(flags).unwrap(),
    }
}

fn command(kind: CommandType, external_id: &str, amount: Option<&str>) -> LedgerCommand {
    LedgerCommand {
        command: kind,
        purchase: external_id.to_string(),
        product: None,
        seller: None,
        user: Some(UserId(7)),
        amount: amount.map(dec),
        tax: None,
        vat: None,
        fee: None,
        flags: Default::default(),
    }
}

fn purchase(engine: &LedgerEngine, external_id: &str) -> Purchase {
    engine.store().find_purchase(external_id).unwrap()
}

#[tokio::test]
async fn test_failed_charge_never_leaves_purchase_in_progress() {
    let engine = LedgerEngine::default();

    let result = engine
        .process(purchase_command("p1", 1, "10.00", "", "", "pm=unavailable_card"))
        .await;

    assert_eq!(result, Err(LedgerError::TemporaryProblem));
    let p1 = purchase(&engine, "p1");
    assert_eq!(p1.state, PurchaseState::Failed);
    assert!(p1.error_message.is_some());
}

#[tokio::test]
async fn test_purchase_waiting_on_buyer_stays_in_progress() {
    let engine = LedgerEngine::default();

    engine
        .process(purchase_command("p1", 1, "10.00", "", "", "pm=3ds_card"))
        .await
        .unwrap();

    assert_eq!(purchase(&engine, "p1").state, PurchaseState::InProgress);
}

#[tokio::test]
async fn test_refunded_amounts_only_grow_and_flags_never_both_set() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("p1", 1, "100.00", "8.00", "10.00", ""))
        .await
        .unwrap();

    let mut previous = purchase(&engine, "p1");
    for amount in [Some("10.00"), Some("25.50"), Some("500.00"), Some("0.01"), Some("30.00"), None] {
        let _ = engine.process(command(CommandType::Refund, "p1", amount)).await;
        let current = purchase(&engine, "p1");

        assert!(current.amount_refunded_cents >= previous.amount_refunded_cents);
        assert!(current.gumroad_tax_refunded_cents >= previous.gumroad_tax_refunded_cents);
        assert!(current.amount_refunded_cents <= current.price_cents);
        assert!(current.gumroad_tax_refunded_cents <= current.gumroad_tax_cents);
        assert!(!(current.stripe_refunded && current.stripe_partially_refunded));
        previous = current;
    }

    assert_eq!(previous.amount_refunded_cents, 10000);
    assert_eq!(previous.gumroad_tax_refunded_cents, 800);
    assert_eq!(previous.fee_refunded_cents, 1000);
    assert!(previous.stripe_refunded);
    assert!(!previous.stripe_partially_refunded);
}

#[tokio::test]
async fn test_refund_above_refundable_amount_changes_nothing() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("p1", 1, "50.00", "", "5.00", ""))
        .await
        .unwrap();
    let before = purchase(&engine, "p1");

    let too_much = engine.process(command(CommandType::Refund, "p1", Some("50.01"))).await;
    let zero = engine.process(command(CommandType::Refund, "p1", Some("0"))).await;

    assert!(matches!(
        too_much,
        Err(LedgerError::RefundAmountExceedsPrice {
            requested: 5001,
            refundable: 5000
        })
    ));
    assert_eq!(zero, Err(LedgerError::NonPositiveRefundAmount));
    let after = purchase(&engine, "p1");
    assert_eq!(after.amount_refunded_cents, before.amount_refunded_cents);
    assert_eq!(after.fee_refunded_cents, before.fee_refunded_cents);
    assert_eq!(after.stripe_refunded, before.stripe_refunded);
    assert_eq!(after.stripe_partially_refunded, before.stripe_partially_refunded);
    assert!(engine.store().refunds_for(after.id).is_empty());
}

#[tokio::test]
async fn test_second_full_refund_is_a_no_op() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("p1", 1, "20.00", "", "", ""))
        .await
        .unwrap();

    engine.process(command(CommandType::Refund, "p1", None)).await.unwrap();
    engine.process(command(CommandType::Refund, "p1", None)).await.unwrap();

    let p1 = purchase(&engine, "p1");
    let refunds = engine.store().refunds_for(p1.id);
    assert_eq!(refunds.len(), 1);
    assert_eq!(p1.amount_refunded_cents, 2000);
}

#[test]
fn test_platform_tax_share_rounds_down() {
    let amounts = PurchaseAmounts {
        price_cents: 9999,
        gumroad_tax_cents: 823,
        ..Default::default()
    };
    let purchase = Purchase::new(PurchaseId(1), "p1", ProductId(1), UserId(1), Currency::Usd, amounts);
    assert_eq!(purchase.total_transaction_cents, 10822);

    let refund = calculator::partial_refund(&purchase, 5000);

    assert_eq!(refund.gumroad_tax_cents, 380);
    assert_eq!(refund.amount_cents, 4620);
}

#[tokio::test]
async fn test_partial_refund_with_platform_tax_through_engine() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("p1", 1, "99.99", "8.23", "", ""))
        .await
        .unwrap();

    engine
        .process(command(CommandType::Refund, "p1", Some("46.20")))
        .await
        .unwrap();

    let p1 = purchase(&engine, "p1");
    let refunds = engine.store().refunds_for(p1.id);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].total_transaction_cents, 5000);
    assert_eq!(refunds[0].gumroad_tax_cents, 380);
    assert_eq!(p1.amount_refunded_cents, 4620);
    assert!(p1.stripe_partially_refunded);
}

#[tokio::test]
async fn test_combined_charge_refund_is_limited_to_one_item() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("a", 1, "10.00", "", "", "charge=3"))
        .await
        .unwrap();
    engine
        .process(purchase_command("b", 2, "15.00", "", "", "charge=3"))
        .await
        .unwrap();
    assert_eq!(purchase(&engine, "a").stripe_transaction_id, purchase(&engine, "b").stripe_transaction_id);

    engine.process(command(CommandType::Refund, "a", None)).await.unwrap();

    let a = purchase(&engine, "a");
    let b = purchase(&engine, "b");
    let refunds = engine.store().refunds_for(a.id);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].total_transaction_cents, 1000);
    assert!(a.stripe_refunded);
    assert_eq!(b.amount_refunded_cents, 0);
    assert!(!b.stripe_refunded && !b.stripe_partially_refunded);
}

#[tokio::test]
async fn test_full_refund_end_to_end() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("p1", 1, "50.00", "", "5.00", ""))
        .await
        .unwrap();

    engine.process(command(CommandType::Refund, "p1", None)).await.unwrap();

    let p1 = purchase(&engine, "p1");
    assert_eq!(p1.amount_refunded_cents, 5000);
    assert!(p1.stripe_refunded);
    assert!(!p1.stripe_partially_refunded);
    let refunds = engine.store().refunds_for(p1.id);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount_cents, 5000);
    assert_eq!(refunds[0].fee_cents, 500);
}

#[tokio::test]
async fn test_partial_then_remaining_refund_completes_purchase() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("p1", 1, "100.00", "", "", ""))
        .await
        .unwrap();

    engine
        .process(command(CommandType::Refund, "p1", Some("60.00")))
        .await
        .unwrap();
    let partial = purchase(&engine, "p1");
    assert_eq!(partial.amount_refundable_cents(), 4000);
    assert!(partial.stripe_partially_refunded);

    engine
        .process(command(CommandType::Refund, "p1", Some("40.00")))
        .await
        .unwrap();

    let p1 = purchase(&engine, "p1");
    assert!(p1.stripe_refunded);
    assert!(!p1.stripe_partially_refunded);
    let refunded: i64 = engine
        .store()
        .refunds_for(p1.id)
        .iter()
        .map(|refund| refund.amount_cents)
        .sum();
    assert_eq!(refunded, 10000);
}

#[tokio::test]
async fn test_fraud_refund_cancels_subscription_immediately() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("m1", 1, "9.00", "", "", "recurring"))
        .await
        .unwrap();
    engine
        .process(command(CommandType::PendingCancel, "m1", None))
        .await
        .unwrap();

    engine
        .process(command(CommandType::FraudRefund, "m1", None))
        .await
        .unwrap();

    let m1 = purchase(&engine, "m1");
    assert!(m1.stripe_refunded);
    let refunds = engine.store().refunds_for(m1.id);
    assert_eq!(refunds.len(), 1);
    assert!(refunds[0].is_for_fraud);

    let subscription_id = m1.subscription_id.unwrap();
    let subscription = engine
        .store()
        .read(|state| state.subscription(subscription_id).cloned())
        .unwrap();
    assert_eq!(subscription.state, SubscriptionState::Cancelled);
    assert!(subscription.deactivated_at.is_some());
}

#[tokio::test]
async fn test_fraud_refund_cancels_alive_subscription() {
    let engine = LedgerEngine::default();
    engine
        .process(purchase_command("m1", 1, "9.00", "", "", "recurring"))
        .await
        .unwrap();

    engine
        .process(command(CommandType::FraudRefund, "m1", None))
        .await
        .unwrap();

    let subscription_id = purchase(&engine, "m1").subscription_id.unwrap();
    let state = engine
        .store()
        .read(|state| state.subscription(subscription_id).map(|subscription| subscription.state))
        .unwrap();
    assert_eq!(state, SubscriptionState::Cancelled);
}
