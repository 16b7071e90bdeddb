//! Common types used across FitDesk

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ParseError;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Subscription ID wrapper
    SubscriptionId
);
uuid_id!(
    /// Client ID wrapper
    ClientId
);
uuid_id!(
    /// Service provider (trainer) ID wrapper
    ProviderId
);
uuid_id!(
    /// Scheduled session ID wrapper
    SessionId
);
uuid_id!(
    /// Plan or provider change request ID wrapper
    ChangeRequestId
);

/// Plan catalog identifier (catalog slug such as `pt-8`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlanId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PlanId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Billing cadence of a plan or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum BillingFrequency {
    Monthly,
    Quarterly,
    Semiannual,
    Annual,
}

impl BillingFrequency {
    /// Length of one billing period in months
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Semiannual => 6,
            Self::Annual => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Semiannual => "semiannual",
            Self::Annual => "annual",
        }
    }
}

impl FromStr for BillingFrequency {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "semiannual" => Ok(Self::Semiannual),
            "annual" => Ok(Self::Annual),
            other => Err(ParseError::BillingFrequency(other.to_string())),
        }
    }
}

impl TryFrom<String> for BillingFrequency {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for BillingFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
    Expired,
    Pending,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Pending => "pending",
        }
    }

    /// Terminal states cannot take plan or provider changes
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            "pending" => Ok(Self::Pending),
            other => Err(ParseError::SubscriptionStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for SubscriptionStatus {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a booked session on the calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum SessionStatus {
    Scheduled,
    Confirmed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the session still occupies a provider's calendar
    pub fn is_booked(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Confirmed)
    }
}

impl FromStr for SessionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseError::SessionStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a discount reduces the agreed price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum DiscountKind {
    Percentage,
    FixedAmount,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::FixedAmount => "fixed_amount",
        }
    }
}

impl FromStr for DiscountKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(Self::Percentage),
            "fixed_amount" => Ok(Self::FixedAmount),
            other => Err(ParseError::DiscountKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for DiscountKind {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for DiscountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_months() {
        assert_eq!(BillingFrequency::Monthly.months(), 1);
        assert_eq!(BillingFrequency::Quarterly.months(), 3);
        assert_eq!(BillingFrequency::Semiannual.months(), 6);
        assert_eq!(BillingFrequency::Annual.months(), 12);
    }

    #[test]
    fn test_frequency_rejects_unknown_value() {
        let err = "weekly".parse::<BillingFrequency>().unwrap_err();
        assert_eq!(err, ParseError::BillingFrequency("weekly".to_string()));
    }

    #[test]
    fn test_frequency_serde_rejects_unknown_value() {
        let ok: BillingFrequency = serde_json::from_str("\"quarterly\"").unwrap();
        assert_eq!(ok, BillingFrequency::Quarterly);
        assert!(serde_json::from_str::<BillingFrequency>("\"biweekly\"").is_err());
        assert_eq!(
            serde_json::to_string(&BillingFrequency::Semiannual).unwrap(),
            "\"semiannual\""
        );
    }

    #[test]
    fn test_status_terminal() {
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(!SubscriptionStatus::Paused.is_terminal());
        assert!(!SubscriptionStatus::Active.is_terminal());
    }

    #[test]
    fn test_session_status_booked() {
        assert!(SessionStatus::Scheduled.is_booked());
        assert!(SessionStatus::Confirmed.is_booked());
        assert!(!SessionStatus::Cancelled.is_booked());
    }

    #[test]
    fn test_discount_kind_round_trip_names() {
        assert_eq!(
            "fixed_amount".parse::<DiscountKind>().unwrap(),
            DiscountKind::FixedAmount
        );
        assert_eq!(DiscountKind::Percentage.to_string(), "percentage");
    }
}
