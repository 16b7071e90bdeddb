//! Plan comparison
//!
//! Determines the tier direction of a change and partitions the two plans'
//! benefit labels into gained / lost / retained.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::model::Plan;

/// Direction of a plan change by tier rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDirection {
    Upgrade,
    Downgrade,
    /// Same tier, different plan
    Lateral,
}

impl std::fmt::Display for ChangeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeDirection::Upgrade => write!(f, "upgrade"),
            ChangeDirection::Downgrade => write!(f, "downgrade"),
            ChangeDirection::Lateral => write!(f, "lateral"),
        }
    }
}

/// Structural comparison of a source and target plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanComparison {
    /// Catalog price difference (target - source), each at its own frequency
    pub price_delta: Decimal,
    /// Monthly-equivalent price difference
    pub price_delta_monthly: Decimal,
    pub is_upgrade: bool,
    pub is_downgrade: bool,
    pub benefits_gained: Vec<String>,
    pub benefits_lost: Vec<String>,
    pub benefits_retained: Vec<String>,
}

impl PlanComparison {
    pub fn direction(&self) -> ChangeDirection {
        if self.is_upgrade {
            ChangeDirection::Upgrade
        } else if self.is_downgrade {
            ChangeDirection::Downgrade
        } else {
            ChangeDirection::Lateral
        }
    }
}

/// Compare `source` (current) against `target`
pub fn compare(source: &Plan, target: &Plan) -> PlanComparison {
    let source_benefits: HashSet<&str> = source.benefits.iter().map(String::as_str).collect();
    let target_benefits: HashSet<&str> = target.benefits.iter().map(String::as_str).collect();

    let benefits_gained = ordered_unique(&target.benefits, |b| !source_benefits.contains(b));
    let benefits_lost = ordered_unique(&source.benefits, |b| !target_benefits.contains(b));
    let benefits_retained = ordered_unique(&source.benefits, |b| target_benefits.contains(b));

    PlanComparison {
        price_delta: target.price - source.price,
        price_delta_monthly: target.monthly_price() - source.monthly_price(),
        is_upgrade: target.tier > source.tier,
        is_downgrade: target.tier < source.tier,
        benefits_gained,
        benefits_lost,
        benefits_retained,
    }
}

/// Labels matching `keep`, deduplicated, in first-appearance order
fn ordered_unique(labels: &[String], keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .iter()
        .filter(|label| keep(label.as_str()) && seen.insert(label.as_str()))
        .cloned()
        .collect()
}
