//! Subscription Change History
//!
//! Every committed change appends a history entry listing the fields it
//! touched. This module also exports history and ledger entries to CSV for:
//! - Customer billing statements
//! - Financial reconciliation

use fitdesk_shared::SubscriptionId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{LedgerEntry, SubscriptionStore};

/// Kind of change recorded in the history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    PlanChange,
    ProviderChange,
    BonusSessions,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::PlanChange => "plan_change",
            ChangeKind::ProviderChange => "provider_change",
            ChangeKind::BonusSessions => "bonus_sessions",
        }
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = crate::error::PlanChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan_change" => Ok(ChangeKind::PlanChange),
            "provider_change" => Ok(ChangeKind::ProviderChange),
            "bonus_sessions" => Ok(ChangeKind::BonusSessions),
            other => Err(crate::error::PlanChangeError::InvalidInput(format!(
                "unknown change kind: {}",
                other
            ))),
        }
    }
}

/// One field touched by a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// A history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeHistoryEntry {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub kind: ChangeKind,
    pub description: String,
    pub changes: Vec<FieldChange>,
    pub reason: Option<String>,
    pub actor_id: Option<Uuid>,
    pub recorded_at: OffsetDateTime,
}

impl ChangeHistoryEntry {
    pub fn new(
        subscription_id: SubscriptionId,
        kind: ChangeKind,
        description: impl Into<String>,
        recorded_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            kind,
            description: description.into(),
            changes: Vec::new(),
            reason: None,
            actor_id: None,
            recorded_at,
        }
    }

    /// Record a field change; unchanged values are skipped
    pub fn field<B: Serialize, A: Serialize>(mut self, field: &str, before: B, after: A) -> Self {
        let before = field_value(field, before);
        let after = field_value(field, after);
        if before != after {
            self.changes.push(FieldChange {
                field: field.to_string(),
                before,
                after,
            });
        }
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn actor(mut self, actor_id: Option<Uuid>) -> Self {
        self.actor_id = actor_id;
        self
    }
}

fn field_value<T: Serialize>(field: &str, value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        tracing::warn!(field = %field, error = %err, "Failed to serialize history field");
        serde_json::Value::Null
    })
}

/// Totals over a subscription's ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub subscription_id: SubscriptionId,
    pub total_charges: Decimal,
    pub total_credits: Decimal,
    pub net: Decimal,
    pub entry_count: usize,
}

/// Service for reading and exporting change history
pub struct BillingHistoryService {
    store: Arc<dyn SubscriptionStore>,
}

impl BillingHistoryService {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Export history and ledger entries for a subscription to CSV format
    pub async fn export_subscription_csv(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<String> {
        let history = self.store.history(subscription_id).await?;
        let ledger = self.store.ledger_entries(subscription_id).await?;
        Ok(export_csv(&history, &ledger))
    }

    pub async fn ledger_summary(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<LedgerSummary> {
        let ledger = self.store.ledger_entries(subscription_id).await?;

        let mut total_charges = Decimal::ZERO;
        let mut total_credits = Decimal::ZERO;
        for entry in &ledger {
            if entry.amount > Decimal::ZERO {
                total_charges += entry.amount;
            } else {
                total_credits += entry.amount.abs();
            }
        }

        Ok(LedgerSummary {
            subscription_id,
            total_charges,
            total_credits,
            net: total_charges - total_credits,
            entry_count: ledger.len(),
        })
    }
}

/// Render history and ledger entries as one CSV, newest first
pub fn export_csv(history: &[ChangeHistoryEntry], ledger: &[LedgerEntry]) -> String {
    let mut rows: Vec<(OffsetDateTime, String)> = Vec::with_capacity(history.len() + ledger.len());

    for entry in history {
        let details = entry
            .changes
            .iter()
            .map(|c| format!("{}: {} -> {}", c.field, c.before, c.after))
            .collect::<Vec<_>>()
            .join("; ");
        rows.push((
            entry.recorded_at,
            format!(
                "{},{},{},,,{}",
                format_timestamp(entry.recorded_at),
                entry.kind.as_str(),
                escape_csv_field(&format!("{} ({})", entry.description, details)),
                escape_csv_field(entry.reason.as_deref().unwrap_or_default()),
            ),
        ));
    }

    for entry in ledger {
        rows.push((
            entry.created_at,
            format!(
                "{},billing_adjustment,{},{:.2},{},{}",
                format_timestamp(entry.created_at),
                escape_csv_field(&format!("Proration effective {}", entry.effective_date)),
                entry.amount,
                entry.currency,
                entry.change_request_id,
            ),
        ));
    }

    rows.sort_by(|a, b| b.0.cmp(&a.0));

    let mut csv = String::from("Date,Type,Description,Amount,Currency,Reference\n");
    for (_, row) in rows {
        csv.push_str(&row);
        csv.push('\n');
    }
    csv
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Escape a field for CSV output
fn escape_csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
