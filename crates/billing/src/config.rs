//! Engine configuration
//!
//! Configuration via environment variables:
//! - `BILLING_CURRENCY`: ISO currency code for ledger entries (default: EUR)
//! - `BILLING_DOWNGRADE_SESSION_POLICY`: `forfeit` or `preserve` (default: forfeit)
//! - `BILLING_LATERAL_CHANGES`: `reject` or `allow` same-tier plan swaps (default: reject)

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::error::{BillingResult, PlanChangeError};

/// Default ledger currency
const DEFAULT_CURRENCY: &str = "EUR";

/// What happens to available sessions above the new cap on an immediate downgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeSessionPolicy {
    /// Available sessions are capped at the target plan's included count
    #[default]
    Forfeit,
    /// Available sessions are kept until consumed
    Preserve,
}

impl FromStr for DowngradeSessionPolicy {
    type Err = PlanChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forfeit" => Ok(Self::Forfeit),
            "preserve" => Ok(Self::Preserve),
            other => Err(PlanChangeError::Config(format!(
                "invalid downgrade session policy: {}",
                other
            ))),
        }
    }
}

/// How same-tier plan swaps are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateralChangePolicy {
    /// Same-tier changes fail validation
    #[default]
    Reject,
    /// Same-tier changes are allowed and classified by session counts
    Allow,
}

impl FromStr for LateralChangePolicy {
    type Err = PlanChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "allow" => Ok(Self::Allow),
            other => Err(PlanChangeError::Config(format!(
                "invalid lateral change policy: {}",
                other
            ))),
        }
    }
}

/// Plan-change engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub currency: String,
    pub downgrade_sessions: DowngradeSessionPolicy,
    pub lateral_changes: LateralChangePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: DEFAULT_CURRENCY.to_string(),
            downgrade_sessions: DowngradeSessionPolicy::default(),
            lateral_changes: LateralChangePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let currency = lookup("BILLING_CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PlanChangeError::Config(format!(
                "BILLING_CURRENCY must be a 3-letter code, got {}",
                currency
            )));
        }

        let downgrade_sessions = match lookup("BILLING_DOWNGRADE_SESSION_POLICY") {
            Some(value) => value.parse()?,
            None => DowngradeSessionPolicy::default(),
        };

        let lateral_changes = match lookup("BILLING_LATERAL_CHANGES") {
            Some(value) => value.parse()?,
            None => LateralChangePolicy::default(),
        };

        Ok(Self {
            currency: currency.to_ascii_uppercase(),
            downgrade_sessions,
            lateral_changes,
        })
    }

    pub fn with_downgrade_sessions(mut self, policy: DowngradeSessionPolicy) -> Self {
        self.downgrade_sessions = policy;
        self
    }

    pub fn with_lateral_changes(mut self, policy: LateralChangePolicy) -> Self {
        self.lateral_changes = policy;
        self
    }
}
