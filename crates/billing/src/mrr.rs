//! Monthly recurring revenue impact of a plan change

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{Plan, Subscription};

/// MRR before and after a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MrrImpact {
    pub mrr_current: Decimal,
    pub mrr_new: Decimal,
    pub delta_mrr: Decimal,
    /// Percentage change relative to current MRR; zero when current MRR is zero
    pub percent_change: Decimal,
    pub annualized_impact: Decimal,
}

pub fn mrr_impact(subscription: &Subscription, target: &Plan) -> MrrImpact {
    let mrr_current = subscription.effective_monthly_price();
    let mrr_new = target.monthly_price();
    let delta_mrr = mrr_new - mrr_current;

    let percent_change = if mrr_current > Decimal::ZERO {
        delta_mrr / mrr_current * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };

    MrrImpact {
        mrr_current,
        mrr_new,
        delta_mrr,
        percent_change,
        annualized_impact: delta_mrr * Decimal::from(12),
    }
}
