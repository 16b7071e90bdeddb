//! Plan catalog and subscription records
//!
//! These are the inputs the calculators read. They are loaded from the
//! collaborators in [`crate::store`] and only ever mutated by a commit.

use fitdesk_shared::{
    BillingFrequency, ClientId, DiscountKind, PlanId, ProviderId, SessionId, SessionStatus,
    SubscriptionId, SubscriptionStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, Time};

use crate::frequency::normalize_monthly;

/// Catalog definition of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    /// Ordinal rank; a higher tier is an upgrade
    pub tier: u32,
    pub price: Decimal,
    pub billing_frequency: BillingFrequency,
    /// Benefit labels, compared as an unordered set
    pub benefits: Vec<String>,
    pub supports_pause: bool,
    pub multi_service: bool,
    pub services: Option<Vec<String>>,
    /// Countable sessions granted per period (session packs)
    pub included_sessions: Option<u32>,
}

impl Plan {
    /// Catalog price as a monthly equivalent
    pub fn monthly_price(&self) -> Decimal {
        normalize_monthly(self.price, self.billing_frequency)
    }
}

/// Discount attached to a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    pub kind: DiscountKind,
    pub value: Decimal,
    pub reason: Option<String>,
}

impl Discount {
    /// Apply the discount to `price`, never going below zero
    pub fn apply(&self, price: Decimal) -> Decimal {
        let discounted = match self.kind {
            DiscountKind::Percentage => {
                price - price * self.value / Decimal::ONE_HUNDRED
            }
            DiscountKind::FixedAmount => price - self.value,
        };
        discounted.max(Decimal::ZERO)
    }
}

/// Session counters for plans that grant countable sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub included: u32,
    pub used: u32,
    pub available: u32,
    pub bonus: u32,
}

impl SessionCounters {
    /// Add bonus sessions; they are immediately available
    pub fn grant_bonus(&self, count: u32) -> Self {
        Self {
            bonus: self.bonus.saturating_add(count),
            available: self.available.saturating_add(count),
            ..*self
        }
    }
}

/// A client's active commercial relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub client_id: ClientId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    /// Agreed recurring price before any discount
    pub price: Decimal,
    pub billing_frequency: BillingFrequency,
    pub period_start: Date,
    pub period_end: Date,
    pub next_renewal: Date,
    pub discount: Option<Discount>,
    pub sessions: Option<SessionCounters>,
    pub provider_id: Option<ProviderId>,
    /// Optimistic concurrency token, bumped by every commit
    pub version: i64,
}

impl Subscription {
    /// Price actually charged per period, after discount
    pub fn effective_price(&self) -> Decimal {
        match &self.discount {
            Some(discount) => discount.apply(self.price),
            None => self.price,
        }
    }

    pub fn effective_monthly_price(&self) -> Decimal {
        normalize_monthly(self.effective_price(), self.billing_frequency)
    }
}

/// A future booked session read from the calendar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSession {
    pub id: SessionId,
    pub subscription_id: SubscriptionId,
    pub date: Date,
    pub time: Time,
    pub session_type: String,
    pub status: SessionStatus,
    pub provider_id: ProviderId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn subscription(price: i64, discount: Option<Discount>) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            client_id: ClientId::new(),
            plan_id: PlanId::from("basic"),
            status: SubscriptionStatus::Active,
            price: Decimal::from(price),
            billing_frequency: BillingFrequency::Quarterly,
            period_start: date!(2026 - 10 - 01),
            period_end: date!(2026 - 12 - 30),
            next_renewal: date!(2026 - 12 - 30),
            discount,
            sessions: None,
            provider_id: None,
            version: 0,
        }
    }

    #[test]
    fn test_effective_price_without_discount() {
        let sub = subscription(120, None);
        assert_eq!(sub.effective_price(), Decimal::from(120));
        assert_eq!(sub.effective_monthly_price(), Decimal::from(40));
    }

    #[test]
    fn test_percentage_discount() {
        let sub = subscription(
            120,
            Some(Discount {
                kind: DiscountKind::Percentage,
                value: Decimal::from(25),
                reason: Some("loyalty".to_string()),
            }),
        );
        assert_eq!(sub.effective_price(), Decimal::from(90));
        assert_eq!(sub.effective_monthly_price(), Decimal::from(30));
    }

    #[test]
    fn test_fixed_discount_floors_at_zero() {
        let discount = Discount {
            kind: DiscountKind::FixedAmount,
            value: Decimal::from(200),
            reason: None,
        };
        assert_eq!(discount.apply(Decimal::from(120)), Decimal::ZERO);
    }

    #[test]
    fn test_grant_bonus_increments_available() {
        let counters = SessionCounters {
            included: 8,
            used: 2,
            available: 6,
            bonus: 0,
        };
        let granted = counters.grant_bonus(2);
        assert_eq!(granted.bonus, 2);
        assert_eq!(granted.available, 8);
        assert_eq!(granted.included, 8);
        assert_eq!(granted.used, 2);
    }
}
