//! Identifier newtypes
//!
//! Each record kind gets its own id type so a purchase id can never be
//! passed where a subscription id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! ledger_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }
    };
}

ledger_id!(
    /// Internal purchase identifier (database row id)
    PurchaseId
);
ledger_id!(
    /// Product (link) identifier
    ProductId
);
ledger_id!(
    /// User identifier: sellers, buyers and support staff share this space
    UserId
);
ledger_id!(RefundId);
ledger_id!(SubscriptionId);
ledger_id!(GiftId);
ledger_id!(PreorderId);
ledger_id!(MerchantAccountId);
ledger_id!(
    /// One processor-level charge covering several purchases
    ChargeGroupId
);
