//! Mid-cycle proration
//!
//! Credits the unused part of the current period at the subscription's
//! effective monthly rate and charges the same number of days at the target
//! plan's monthly rate. All day-based amounts use a fixed 30-day reference
//! month so results are consistent regardless of calendar month length.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::model::{Plan, Subscription};

/// Days in the reference month used for every day-based amount
pub const REFERENCE_MONTH_DAYS: u32 = 30;

/// Result of prorating a plan change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProrationResult {
    pub period_start: Date,
    pub period_end: Date,
    pub change_date: Date,
    pub days_total: u32,
    pub days_used: u32,
    pub days_remaining: u32,
    /// Current plan, monthly equivalent of the effective (discounted) price
    pub current_monthly: Decimal,
    /// Target plan, monthly equivalent of the catalog price
    pub new_monthly: Decimal,
    pub credit_current_period: Decimal,
    pub charge_new_period: Decimal,
    /// Positive = additional charge, negative = credit due
    pub net_prorated_amount: Decimal,
    /// True for deferred previews, which never produce a ledger entry directly
    pub informational: bool,
}

impl ProrationResult {
    pub fn is_charge(&self) -> bool {
        self.net_prorated_amount > Decimal::ZERO
    }

    pub fn is_credit(&self) -> bool {
        self.net_prorated_amount < Decimal::ZERO
    }

    pub fn is_neutral(&self) -> bool {
        self.net_prorated_amount.is_zero()
    }
}

/// Prorate moving `subscription` onto `target` on `change_date`
pub fn prorate(subscription: &Subscription, target: &Plan, change_date: Date) -> ProrationResult {
    let days_total = whole_days(subscription.period_start, subscription.period_end);
    let days_used = whole_days(subscription.period_start, change_date).min(days_total);
    let days_remaining = days_total - days_used;

    let current_monthly = subscription.effective_monthly_price();
    let new_monthly = target.monthly_price();

    let credit_current_period = per_reference_days(current_monthly, days_remaining);
    let charge_new_period = per_reference_days(new_monthly, days_remaining);

    ProrationResult {
        period_start: subscription.period_start,
        period_end: subscription.period_end,
        change_date,
        days_total,
        days_used,
        days_remaining,
        current_monthly,
        new_monthly,
        credit_current_period,
        charge_new_period,
        net_prorated_amount: charge_new_period - credit_current_period,
        informational: false,
    }
}

/// Whole days from `from` to `to`, zero if `to` is earlier
fn whole_days(from: Date, to: Date) -> u32 {
    let days = (to - from).whole_days();
    u32::try_from(days.max(0)).unwrap_or(u32::MAX)
}

fn per_reference_days(monthly: Decimal, days: u32) -> Decimal {
    monthly * Decimal::from(days) / Decimal::from(REFERENCE_MONTH_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitdesk_shared::{
        BillingFrequency, ClientId, DiscountKind, PlanId, SubscriptionId, SubscriptionStatus,
    };
    use std::str::FromStr;
    use time::macros::date;

    use crate::model::Discount;

    fn subscription(price: i64, start: Date, end: Date) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            client_id: ClientId::new(),
            plan_id: PlanId::from("basic"),
            status: SubscriptionStatus::Active,
            price: Decimal::from(price),
            billing_frequency: BillingFrequency::Monthly,
            period_start: start,
            period_end: end,
            next_renewal: end,
            discount: None,
            sessions: None,
            provider_id: None,
            version: 0,
        }
    }

    fn plan(price: i64, frequency: BillingFrequency) -> Plan {
        Plan {
            id: PlanId::from("premium"),
            name: "Premium".to_string(),
            tier: 2,
            price: Decimal::from(price),
            billing_frequency: frequency,
            benefits: vec![],
            supports_pause: true,
            multi_service: false,
            services: None,
            included_sessions: None,
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_mid_period_upgrade() {
        let sub = subscription(35, date!(2026 - 10 - 01), date!(2026 - 10 - 31));
        let target = plan(55, BillingFrequency::Monthly);

        let result = prorate(&sub, &target, date!(2026 - 10 - 16));
        assert_eq!(result.days_total, 30);
        assert_eq!(result.days_used, 15);
        assert_eq!(result.days_remaining, 15);
        assert_eq!(result.credit_current_period, dec("17.5"));
        assert_eq!(result.charge_new_period, dec("27.5"));
        assert_eq!(result.net_prorated_amount, dec("10.0"));
        assert!(result.is_charge());
        assert!(!result.informational);
    }

    #[test]
    fn test_downgrade_yields_credit() {
        let sub = subscription(55, date!(2026 - 10 - 01), date!(2026 - 10 - 31));
        let target = plan(35, BillingFrequency::Monthly);

        let result = prorate(&sub, &target, date!(2026 - 10 - 21));
        assert_eq!(result.days_remaining, 10);
        assert!(result.is_credit());
        assert_eq!(result.net_prorated_amount.round_dp(2), dec("-6.67"));
    }

    #[test]
    fn test_days_always_sum_to_total() {
        let start = date!(2026 - 10 - 01);
        let end = date!(2026 - 12 - 30);
        let sub = subscription(90, start, end);
        let target = plan(120, BillingFrequency::Quarterly);

        let mut day = start;
        while day <= end {
            let result = prorate(&sub, &target, day);
            assert_eq!(result.days_used + result.days_remaining, result.days_total);
            day = day.next_day().unwrap();
        }
    }

    #[test]
    fn test_change_date_outside_period_is_clamped() {
        let sub = subscription(35, date!(2026 - 10 - 01), date!(2026 - 10 - 31));
        let target = plan(55, BillingFrequency::Monthly);

        let before = prorate(&sub, &target, date!(2026 - 09 - 20));
        assert_eq!(before.days_used, 0);
        assert_eq!(before.days_remaining, 30);

        let after = prorate(&sub, &target, date!(2026 - 11 - 20));
        assert_eq!(after.days_used, 30);
        assert_eq!(after.days_remaining, 0);
        assert!(after.is_neutral());
    }

    #[test]
    fn test_discount_applies_to_current_side_only() {
        let mut sub = subscription(40, date!(2026 - 10 - 01), date!(2026 - 10 - 31));
        sub.discount = Some(Discount {
            kind: DiscountKind::FixedAmount,
            value: Decimal::from(10),
            reason: Some("referral".to_string()),
        });
        let target = plan(60, BillingFrequency::Monthly);

        let result = prorate(&sub, &target, date!(2026 - 10 - 01));
        assert_eq!(result.current_monthly, Decimal::from(30));
        assert_eq!(result.new_monthly, Decimal::from(60));
        assert_eq!(result.credit_current_period, Decimal::from(30));
        assert_eq!(result.charge_new_period, Decimal::from(60));
    }

    #[test]
    fn test_quarterly_target_is_normalized() {
        let sub = subscription(50, date!(2026 - 10 - 01), date!(2026 - 10 - 31));
        let target = plan(180, BillingFrequency::Quarterly);

        let result = prorate(&sub, &target, date!(2026 - 10 - 01));
        assert_eq!(result.new_monthly, Decimal::from(60));
        assert_eq!(result.net_prorated_amount, Decimal::from(10));
    }

    #[test]
    fn test_prorate_is_deterministic() {
        let sub = subscription(35, date!(2026 - 10 - 01), date!(2026 - 10 - 31));
        let target = plan(55, BillingFrequency::Monthly);
        let first = prorate(&sub, &target, date!(2026 - 10 - 09));
        let second = prorate(&sub, &target, date!(2026 - 10 - 09));
        assert_eq!(first, second);
    }
}
