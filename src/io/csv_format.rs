//! CSV format handling for ledger commands and purchase output
//!
//! This module centralizes all CSV format concerns, providing:
//! - CsvRecord structure for deserialization
//! - Conversion from CSV records to ledger commands, flags included
//! - Purchase summary serialization
//!
//! All functions are pure (no I/O) for easy testing.

use crate::core::PurchaseSummary;
use crate::types::{ChargeGroupId, CommandFlags, CommandType, LedgerCommand, PlanChangeKind, ProductId, UserId};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Write;
use std::str::FromStr;

/// Column order of the purchase output
pub const OUTPUT_HEADER: [&str; 10] = [
    "purchase",
    "state",
    "price",
    "amount_refunded",
    "fee_refunded",
    "tax_refunded",
    "vat_refunded",
    "fully_refunded",
    "partially_refunded",
    "review_counted",
];

/// CSV record structure for deserialization
///
/// Matches the input columns: type, purchase, product, seller, buyer,
/// amount, tax, vat, fee, flags. Everything but type and purchase is
/// optional; which columns a command needs depends on its type.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct CsvRecord {
    #[serde(rename = "type")]
    pub command_type: String,
    pub purchase: String,
    pub product: Option<u64>,
    pub seller: Option<u64>,
    pub buyer: Option<u64>,
    pub amount: Option<String>,
    pub tax: Option<String>,
    pub vat: Option<String>,
    pub fee: Option<String>,
    pub flags: Option<String>,
}

/// Convert a CsvRecord to a LedgerCommand
///
/// # Returns
///
/// Result containing either:
/// - Ok(LedgerCommand) - Successfully converted record
/// - Err(String) - Error message describing the conversion failure
pub fn convert_csv_record(csv_record: CsvRecord) -> Result<LedgerCommand, String> {
    let command = match csv_record.command_type.trim().to_lowercase().as_str() {
        "purchase" => CommandType::Purchase,
        "confirm" => CommandType::Confirm,
        "refund" => CommandType::Refund,
        "refund_vat" => CommandType::RefundVat,
        "fraud_refund" => CommandType::FraudRefund,
        "sync" => CommandType::Sync,
        "chargeback" => CommandType::Chargeback,
        "pending_cancel" => CommandType::PendingCancel,
        _ => {
            return Err(format!(
                "Invalid command type: '{}' for purchase {}",
                csv_record.command_type, csv_record.purchase
            ))
        }
    };

    let purchase = csv_record.purchase.trim().to_string();
    if purchase.is_empty() {
        return Err(format!("{} command without a purchase id", command.as_str()));
    }

    let flags = match csv_record.flags.as_deref() {
        Some(raw) => parse_flags(raw).map_err(|e| format!("{} for purchase {}", e, purchase))?,
        None => CommandFlags::default(),
    };

    Ok(LedgerCommand {
        command,
        amount: parse_amount(csv_record.amount, "amount", &purchase)?,
        tax: parse_amount(csv_record.tax, "tax", &purchase)?,
        vat: parse_amount(csv_record.vat, "vat", &purchase)?,
        fee: parse_amount(csv_record.fee, "fee", &purchase)?,
        product: csv_record.product.map(ProductId),
        seller: csv_record.seller.map(UserId),
        user: csv_record.buyer.map(UserId),
        purchase,
        flags,
    })
}

fn parse_amount(field: Option<String>, column: &str, purchase: &str) -> Result<Option<Decimal>, String> {
    match field {
        Some(raw) if !raw.trim().is_empty() => Decimal::from_str(raw.trim())
            .map(Some)
            .map_err(|_| format!("Invalid {} '{}' for purchase {}", column, raw, purchase)),
        _ => Ok(None),
    }
}

/// Parse `|`-separated command flags
///
/// Bare words switch a flag on; `key=value` pairs carry a value.
pub fn parse_flags(raw: &str) -> Result<CommandFlags, String> {
    let mut flags = CommandFlags::default();

    for flag in raw.split('|').map(str::trim).filter(|flag| !flag.is_empty()) {
        match flag.split_once('=') {
            None => match flag {
                "preorder" => flags.preorder = true,
                "gift" => flags.gift = true,
                "recurring" => flags.recurring = true,
                "test" => flags.test = true,
                "paypal" => flags.paypal = true,
                "no_charge" => flags.no_charge = true,
                "refunds_disabled" => flags.refunds_disabled = true,
                "team" => flags.team = true,
                "won" => flags.won = true,
                "transferred" => flags.transferred = true,
                other => return Err(format!("Unknown flag '{}'", other)),
            },
            Some((key, value)) => {
                let value = value.trim();
                match key.trim() {
                    "limit" => {
                        flags.limit = Some(
                            value
                                .parse()
                                .map_err(|_| format!("Invalid limit '{}'", value))?,
                        )
                    }
                    "charge" => {
                        flags.charge = Some(ChargeGroupId(
                            value
                                .parse()
                                .map_err(|_| format!("Invalid charge group '{}'", value))?,
                        ))
                    }
                    "pm" => flags.payment_method = Some(value.to_string()),
                    "error" => flags.error = Some(value.to_string()),
                    "upgrade" => flags.plan_change = Some((PlanChangeKind::Upgrade, value.to_string())),
                    "resubscribe" => {
                        flags.plan_change = Some((PlanChangeKind::Resubscription, value.to_string()))
                    }
                    other => return Err(format!("Unknown flag '{}'", other)),
                }
            }
        }
    }

    Ok(flags)
}

/// Write purchase summaries to CSV format
///
/// Amounts are rendered in major units of each purchase's currency.
///
/// # Returns
///
/// * `Ok(())` if writing succeeded
/// * `Err(String)` if a write error occurred
pub fn write_purchases_csv(summaries: &[PurchaseSummary], output: &mut dyn Write) -> Result<(), String> {
    use csv::Writer;

    let mut writer = Writer::from_writer(output);

    writer
        .write_record(OUTPUT_HEADER)
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    for summary in summaries {
        let currency = summary.currency;
        writer
            .write_record(&[
                summary.external_id.clone(),
                summary.state.to_string(),
                currency.format_cents(summary.price_cents),
                currency.format_cents(summary.amount_refunded_cents),
                currency.format_cents(summary.fee_refunded_cents),
                currency.format_cents(summary.tax_refunded_cents),
                currency.format_cents(summary.gumroad_tax_refunded_cents),
                summary.fully_refunded.to_string(),
                summary.partially_refunded.to_string(),
                summary.review_counted.to_string(),
            ])
            .map_err(|e| format!("Failed to write purchase record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}
