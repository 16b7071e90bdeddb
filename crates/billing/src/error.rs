//! Plan-change error types

use fitdesk_shared::{ParseError, SubscriptionId, SubscriptionStatus};
use thiserror::Error;

/// Plan-change and provider-change errors
///
/// Everything except `CommitFailed` is a validation failure raised before any
/// calculation runs.
#[derive(Debug, Error)]
pub enum PlanChangeError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Subscription is {status} and cannot be changed")]
    InvalidSubscriptionState { status: SubscriptionStatus },

    #[error("Invalid target plan: {0}")]
    InvalidTargetPlan(String),

    #[error("Target plan has the same tier ({tier}) as the current plan")]
    LateralChangeNotAllowed { tier: u32 },

    #[error("Invalid target provider: {0}")]
    InvalidTargetProvider(String),

    #[error("Invalid effective date: {0}")]
    InvalidEffectiveDate(String),

    #[error("Conflicting session policy: {0}")]
    ConflictingSessionPolicy(String),

    #[error("Unsupported billing frequency: {0}")]
    UnsupportedBillingFrequency(String),

    #[error("A plan change is already pending for subscription {0}")]
    ConcurrentChangeInProgress(SubscriptionId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PlanChangeError {
    /// Whether the caller may retry the whole flow from validation
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlanChangeError::CommitFailed(_))
    }
}

impl From<ParseError> for PlanChangeError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::BillingFrequency(value) => {
                PlanChangeError::UnsupportedBillingFrequency(value)
            }
            other => PlanChangeError::InvalidInput(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for PlanChangeError {
    fn from(err: sqlx::Error) -> Self {
        PlanChangeError::CommitFailed(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, PlanChangeError>;
