//! Error types for the purchase settlement ledger
//!
//! This module defines every error the ledger can surface. Messages are
//! written for the person who triggered the operation (buyer, creator or
//! support staff), so most of them are user-facing.
//!
//! # Error Categories
//!
//! - **Validation**: user-correctable (bad refund amount, refunds disabled,
//!   disconnected payment account, insufficient processor funds)
//! - **Transient**: retry-safe, nothing was committed (processor unavailable,
//!   inventory lock timeout, purchase raced by another worker)
//! - **Integrity**: should never happen (a refund that cannot be recorded)
//! - **NotFound**: a referenced record does not exist
//! - **Input**: command-log I/O and parsing problems

use super::money::Cents;
use super::ids::{ProductId, PurchaseId};
use super::purchase::PurchaseState;
use thiserror::Error;

/// Coarse classification of a [`LedgerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Integrity,
    NotFound,
    Input,
    Internal,
}

/// Main error type for the settlement ledger
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// File not found at the specified path
    #[error("File not found: {path}")]
    FileNotFound {
        /// The path that was not found
        path: String,
    },

    /// I/O error occurred while reading or writing files
    #[error("I/O error: {message}")]
    IoError {
        /// Description of the I/O error
        message: String,
    },

    /// CSV parsing error occurred
    ///
    /// Recoverable: the malformed command is skipped.
    #[error("CSV parse error{}: {message}", line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    ParseError {
        /// Line number where the error occurred (if available)
        line: Option<u64>,
        /// Description of the parsing error
        message: String,
    },

    /// A referenced record does not exist
    #[error("{kind} {id} not found")]
    RecordNotFound {
        /// Record type ("purchase", "product", ...)
        kind: &'static str,
        /// The missing identifier
        id: String,
    },

    /// A command lacks a column its type requires
    #[error("{command} command for '{purchase}' requires {field}")]
    MissingField {
        command: &'static str,
        purchase: String,
        field: &'static str,
    },

    /// Amount could not be converted to minor units
    #[error("Invalid amount '{amount}'")]
    InvalidAmount {
        /// The amount as typed
        amount: String,
    },

    #[error("Unknown currency '{code}'")]
    UnknownCurrency { code: String },

    #[error("Refund amount must be greater than zero.")]
    NonPositiveRefundAmount,

    #[error("Refund amount cannot be greater than the purchase price.")]
    RefundAmountExceedsPrice {
        /// Requested amount in cents
        requested: Cents,
        /// What could still be refunded
        refundable: Cents,
    },

    /// The merchant account holding the funds is inactive
    #[error("The {processor} account holding these funds is disconnected. Please reconnect it to issue refunds.")]
    MerchantAccountInactive {
        /// Display name of the processor
        processor: String,
    },

    /// The buyer-direct processor path was disabled by the seller
    #[error("Refunds through {processor} are disabled for this account.")]
    PaymentMethodDisabled {
        /// Display name of the processor
        processor: String,
    },

    #[error("Refunds are disabled for this account.")]
    RefundsDisabled,

    #[error("Your {processor} account does not have sufficient funds to make this refund.")]
    InsufficientFunds {
        /// Display name of the processor
        processor: String,
    },

    /// The processor rejected the request; message is passed through verbatim
    #[error("{message}")]
    ProcessorRejected { message: String },

    #[error("There is a temporary problem, try again later.")]
    TemporaryProblem,

    /// No valid refund record could be built (negative or overflowing amounts)
    #[error("The refund for purchase {purchase} could not be recorded.")]
    InvalidRefund { purchase: PurchaseId },

    /// Confirmation raced another worker that already moved the purchase
    #[error("There is a temporary problem, please try again (your card was not charged).")]
    PurchaseNotInProgress {
        purchase: PurchaseId,
        state: PurchaseState,
    },

    /// The state machine refused a transition
    #[error("Purchase {purchase} cannot move from {from} to {to}")]
    InvalidTransition {
        purchase: PurchaseId,
        from: PurchaseState,
        to: PurchaseState,
    },

    /// Charge declined or client-side authentication failed; message verbatim
    #[error("{message}")]
    PaymentDeclined { message: String },

    /// The fraud screen blocked the purchase
    #[error("{reason}")]
    FraudBlocked { reason: String },

    /// A purchase with this external id already exists
    #[error("Purchase {external_id} already exists")]
    DuplicatePurchase { external_id: String },

    #[error("Sold out, please go back and pick another option.")]
    SoldOut { product: ProductId },

    #[error("Sorry, something went wrong. Please try again.")]
    InventoryLockTimeout { product: ProductId },

    #[error("No charge processor registered for '{processor}'")]
    UnknownProcessor { processor: String },
}

// Conversion from io::Error to LedgerError
impl From<std::io::Error> for LedgerError {
    fn from(error: std::io::Error) -> Self {
        LedgerError::IoError {
            message: error.to_string(),
        }
    }
}

// Conversion from csv::Error to LedgerError
impl From<csv::Error> for LedgerError {
    fn from(error: csv::Error) -> Self {
        let line = error.position().map(|pos| pos.line());

        LedgerError::ParseError {
            line,
            message: error.to_string(),
        }
    }
}

impl LedgerError {
    /// Classify the error according to the ledger's error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::FileNotFound { .. }
            | LedgerError::IoError { .. }
            | LedgerError::ParseError { .. }
            | LedgerError::MissingField { .. } => ErrorKind::Input,
            LedgerError::RecordNotFound { .. } => ErrorKind::NotFound,
            LedgerError::InvalidAmount { .. }
            | LedgerError::UnknownCurrency { .. }
            | LedgerError::NonPositiveRefundAmount
            | LedgerError::RefundAmountExceedsPrice { .. }
            | LedgerError::MerchantAccountInactive { .. }
            | LedgerError::PaymentMethodDisabled { .. }
            | LedgerError::RefundsDisabled
            | LedgerError::InsufficientFunds { .. }
            | LedgerError::ProcessorRejected { .. }
            | LedgerError::PaymentDeclined { .. }
            | LedgerError::FraudBlocked { .. }
            | LedgerError::DuplicatePurchase { .. }
            | LedgerError::SoldOut { .. } => ErrorKind::Validation,
            LedgerError::TemporaryProblem
            | LedgerError::PurchaseNotInProgress { .. }
            | LedgerError::InventoryLockTimeout { .. } => ErrorKind::Transient,
            LedgerError::InvalidRefund { .. } => ErrorKind::Integrity,
            LedgerError::InvalidTransition { .. }
            | LedgerError::UnknownProcessor { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry without risking duplicate side effects
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Create a RecordNotFound error
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        LedgerError::RecordNotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a MissingField error
    pub fn missing_field(command: &'static str, purchase: &str, field: &'static str) -> Self {
        LedgerError::MissingField {
            command,
            purchase: purchase.to_string(),
            field,
        }
    }

    /// Create an InvalidAmount error
    pub fn invalid_amount(amount: &str) -> Self {
        LedgerError::InvalidAmount {
            amount: amount.to_string(),
        }
    }

    pub fn unknown_currency(code: &str) -> Self {
        LedgerError::UnknownCurrency {
            code: code.to_string(),
        }
    }

    pub fn merchant_account_inactive(processor: &str) -> Self {
        LedgerError::MerchantAccountInactive {
            processor: processor.to_string(),
        }
    }

    pub fn payment_method_disabled(processor: &str) -> Self {
        LedgerError::PaymentMethodDisabled {
            processor: processor.to_string(),
        }
    }

    pub fn insufficient_funds(processor: &str) -> Self {
        LedgerError::InsufficientFunds {
            processor: processor.to_string(),
        }
    }

    pub fn payment_declined(message: &str) -> Self {
        LedgerError::PaymentDeclined {
            message: message.to_string(),
        }
    }

    pub fn invalid_transition(purchase: PurchaseId, from: PurchaseState, to: PurchaseState) -> Self {
        LedgerError::InvalidTransition { purchase, from, to }
    }

    pub fn unknown_processor(processor: &str) -> Self {
        LedgerError::UnknownProcessor {
            processor: processor.to_string(),
        }
    }
}
