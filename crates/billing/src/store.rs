//! Collaborator traits
//!
//! The orchestrator never talks to storage directly. It reads plans,
//! subscriptions and booked sessions through these traits and hands each
//! commit over as one unit that the store applies atomically.

use async_trait::async_trait;
use fitdesk_shared::{BillingFrequency, ChangeRequestId, PlanId, ProviderId, SubscriptionId};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::history::ChangeHistoryEntry;
use crate::model::{Plan, ScheduledSession, SessionCounters, Subscription};
use crate::proration::ProrationResult;
use crate::request::PlanChangeRequest;

/// A signed billing adjustment produced by a committed plan change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    /// Positive is a charge, negative a credit
    pub amount: Decimal,
    pub currency: String,
    pub effective_date: Date,
    pub change_request_id: ChangeRequestId,
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    /// Ledger entry for a proration, or `None` when it rounds to zero
    pub fn for_proration(
        subscription_id: SubscriptionId,
        change_request_id: ChangeRequestId,
        proration: &ProrationResult,
        currency: &str,
        created_at: OffsetDateTime,
    ) -> Option<Self> {
        let amount = ledger_amount(proration.net_prorated_amount);
        if amount.is_zero() {
            return None;
        }

        Some(Self {
            id: Uuid::new_v4(),
            subscription_id,
            amount,
            currency: currency.to_string(),
            effective_date: proration.change_date,
            change_request_id,
            created_at,
        })
    }
}

/// Round a net prorated amount to cents, midpoint away from zero
pub fn ledger_amount(net: Decimal) -> Decimal {
    net.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// A deferred plan change waiting for its date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPlanChange {
    pub request: PlanChangeRequest,
    pub scheduled_for: Date,
    /// Subscription version when the change was scheduled
    pub subscription_version: i64,
    pub created_at: OffsetDateTime,
}

/// Everything an immediate plan change writes
#[derive(Debug, Clone, PartialEq)]
pub struct PlanChangeCommit {
    pub request_id: ChangeRequestId,
    pub subscription_id: SubscriptionId,
    pub expected_version: i64,
    pub plan_id: PlanId,
    pub price: Decimal,
    pub billing_frequency: BillingFrequency,
    /// New counters, when the change adjusted them
    pub sessions: Option<SessionCounters>,
    pub ledger_entry: Option<LedgerEntry>,
    pub history: ChangeHistoryEntry,
    /// Remove the subscription's pending change in the same unit
    pub clears_pending: bool,
}

/// Everything a provider change writes
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderChangeCommit {
    pub request_id: ChangeRequestId,
    pub subscription_id: SubscriptionId,
    pub expected_version: i64,
    pub provider_id: ProviderId,
    /// Sessions already pointing at the new provider
    pub reassigned_sessions: Vec<ScheduledSession>,
    pub history: ChangeHistoryEntry,
}

/// A bonus-session grant
#[derive(Debug, Clone, PartialEq)]
pub struct BonusSessionsCommit {
    pub subscription_id: SubscriptionId,
    pub expected_version: i64,
    pub sessions: SessionCounters,
    pub history: ChangeHistoryEntry,
}

/// Plan reference data
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, plan_id: &PlanId) -> BillingResult<Option<Plan>>;
}

/// Subscription state, pending changes, ledger and history
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>>;

    async fn pending_change(&self, id: SubscriptionId) -> BillingResult<Option<PendingPlanChange>>;

    /// Record a deferred change.
    /// Fails with `ConcurrentChangeInProgress` if one is already pending.
    async fn schedule_change(&self, pending: PendingPlanChange) -> BillingResult<()>;

    /// Remove and return the pending change, if any
    async fn cancel_pending_change(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Option<PendingPlanChange>>;

    /// Remove the pending change only if it is still `request_id`.
    /// Returns whether a record was removed.
    async fn remove_pending_change(
        &self,
        id: SubscriptionId,
        request_id: ChangeRequestId,
    ) -> BillingResult<bool>;

    /// Pending changes scheduled on or before `today`, oldest first
    async fn due_changes(&self, today: Date) -> BillingResult<Vec<PendingPlanChange>>;

    /// Apply a plan change and return the new subscription version.
    /// Fails with `CommitFailed` on a version mismatch or lock timeout, and
    /// with `ConcurrentChangeInProgress` if the pending record does not match
    /// the commit: none may exist for a direct change, and a scheduled change
    /// must still be the one pending.
    async fn commit_plan_change(&self, commit: PlanChangeCommit) -> BillingResult<i64>;

    async fn commit_provider_change(&self, commit: ProviderChangeCommit) -> BillingResult<i64>;

    async fn commit_bonus_sessions(&self, commit: BonusSessionsCommit) -> BillingResult<i64>;

    async fn ledger_entries(&self, id: SubscriptionId) -> BillingResult<Vec<LedgerEntry>>;

    /// Change history, oldest first
    async fn history(&self, id: SubscriptionId) -> BillingResult<Vec<ChangeHistoryEntry>>;
}

/// Booked sessions for a subscription
#[async_trait]
pub trait SessionCalendar: Send + Sync {
    async fn scheduled_sessions(
        &self,
        subscription_id: &SubscriptionId,
    ) -> BillingResult<Vec<ScheduledSession>>;
}
