//! Error types shared across FitDesk crates

use thiserror::Error;

/// Failure to parse one of the enumerated string values used on the wire and in storage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unsupported billing frequency: {0}")]
    BillingFrequency(String),

    #[error("Unknown subscription status: {0}")]
    SubscriptionStatus(String),

    #[error("Unknown session status: {0}")]
    SessionStatus(String),

    #[error("Unknown discount kind: {0}")]
    DiscountKind(String),
}
