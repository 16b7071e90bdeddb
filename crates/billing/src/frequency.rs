//! Billing frequency normalization
//!
//! Every calculator compares prices as monthly equivalents.

use fitdesk_shared::BillingFrequency;
use rust_decimal::Decimal;

/// Convert a price billed at `frequency` into its monthly equivalent
pub fn normalize_monthly(price: Decimal, frequency: BillingFrequency) -> Decimal {
    price / Decimal::from(frequency.months())
}
