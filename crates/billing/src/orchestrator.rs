//! Plan-change orchestrator
//!
//! Two phases for every change:
//! - `preview` validates the request and computes comparison, proration, MRR
//!   impact and session handling without touching storage
//! - `commit` hands the previewed outcome to the store as one atomic unit,
//!   then notifies the client
//!
//! Deferred plan changes are recorded as pending and re-invoked on their date
//! by [`PlanChangeService::process_due_changes`].

use fitdesk_shared::{ChangeRequestId, ClientId, ProviderId, SubscriptionId};
use serde::Serialize;
use std::sync::Arc;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::comparison::{compare, ChangeDirection, PlanComparison};
use crate::config::{EngineConfig, LateralChangePolicy};
use crate::error::{BillingResult, PlanChangeError};
use crate::events::{
    ActorType, ChangeEventType, ChangeNotification, ChangeNotificationBuilder, Notifier,
};
use crate::history::{ChangeHistoryEntry, ChangeKind};
use crate::model::{Plan, SessionCounters, Subscription};
use crate::mrr::{mrr_impact, MrrImpact};
use crate::proration::{prorate, ProrationResult};
use crate::request::{PlanChangeRequest, ProviderChangeForm, ProviderChangeMode, ProviderChangeRequest};
use crate::sessions::{
    adjust_for_plan_change, affected_sessions, resolve_provider_change, SessionAdjustment,
    SessionResolution,
};
use crate::store::{
    BonusSessionsCommit, LedgerEntry, PendingPlanChange, PlanCatalog, PlanChangeCommit,
    ProviderChangeCommit, SessionCalendar, SubscriptionStore,
};

/// Where a plan-change evaluation comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invocation {
    /// A caller-submitted request
    Request,
    /// Re-invocation of a pending change on its scheduled date
    Scheduled(Date),
}

/// A previewed plan change.
///
/// Only produced by [`PlanChangeService::preview`]; pass it back unchanged to
/// [`PlanChangeService::commit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeOutcome {
    request: PlanChangeRequest,
    subscription_id: SubscriptionId,
    client_id: ClientId,
    subscription_version: i64,
    from_plan: Plan,
    to_plan: Plan,
    #[serde(skip)]
    previous: Subscription,
    direction: ChangeDirection,
    change_date: Date,
    comparison: PlanComparison,
    proration: ProrationResult,
    mrr_impact: MrrImpact,
    session_adjustment: SessionAdjustment,
    from_schedule: bool,
    computed_at: OffsetDateTime,
}

impl ChangeOutcome {
    pub fn request(&self) -> &PlanChangeRequest {
        &self.request
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    pub fn subscription_version(&self) -> i64 {
        self.subscription_version
    }

    pub fn from_plan(&self) -> &Plan {
        &self.from_plan
    }

    pub fn to_plan(&self) -> &Plan {
        &self.to_plan
    }

    pub fn direction(&self) -> ChangeDirection {
        self.direction
    }

    pub fn change_date(&self) -> Date {
        self.change_date
    }

    pub fn comparison(&self) -> &PlanComparison {
        &self.comparison
    }

    pub fn proration(&self) -> &ProrationResult {
        &self.proration
    }

    pub fn mrr_impact(&self) -> &MrrImpact {
        &self.mrr_impact
    }

    pub fn session_adjustment(&self) -> &SessionAdjustment {
        &self.session_adjustment
    }

    pub fn computed_at(&self) -> OffsetDateTime {
        self.computed_at
    }

    /// Whether committing schedules the change instead of applying it
    pub fn is_deferred(&self) -> bool {
        !self.request.apply_immediately
    }
}

/// Result of committing a plan change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitReceipt {
    Applied {
        request_id: ChangeRequestId,
        subscription_id: SubscriptionId,
        new_version: i64,
        ledger_entry: Option<LedgerEntry>,
    },
    Scheduled {
        request_id: ChangeRequestId,
        subscription_id: SubscriptionId,
        scheduled_for: Date,
    },
}

impl CommitReceipt {
    pub fn request_id(&self) -> ChangeRequestId {
        match self {
            CommitReceipt::Applied { request_id, .. } | CommitReceipt::Scheduled { request_id, .. } => {
                *request_id
            }
        }
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        match self {
            CommitReceipt::Applied {
                subscription_id, ..
            }
            | CommitReceipt::Scheduled {
                subscription_id, ..
            } => *subscription_id,
        }
    }

    pub fn ledger_entry(&self) -> Option<&LedgerEntry> {
        match self {
            CommitReceipt::Applied { ledger_entry, .. } => ledger_entry.as_ref(),
            CommitReceipt::Scheduled { .. } => None,
        }
    }
}

/// A pending change that could not be applied
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueChangeFailure {
    pub request_id: ChangeRequestId,
    pub subscription_id: SubscriptionId,
    pub error: String,
}

/// Result of one pass over due pending changes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DueChangeReport {
    pub applied: Vec<CommitReceipt>,
    /// No longer applicable; the pending record was removed
    pub skipped: Vec<DueChangeFailure>,
    /// Retryable failures; the pending record stays for the next pass
    pub failed: Vec<DueChangeFailure>,
}

/// A previewed provider change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderChangeOutcome {
    request: ProviderChangeRequest,
    subscription_id: SubscriptionId,
    client_id: ClientId,
    subscription_version: i64,
    previous_provider: Option<ProviderId>,
    effective_date: Date,
    resolution: SessionResolution,
    computed_at: OffsetDateTime,
}

impl ProviderChangeOutcome {
    pub fn request(&self) -> &ProviderChangeRequest {
        &self.request
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    pub fn subscription_version(&self) -> i64 {
        self.subscription_version
    }

    pub fn previous_provider(&self) -> Option<ProviderId> {
        self.previous_provider
    }

    pub fn effective_date(&self) -> Date {
        self.effective_date
    }

    pub fn resolution(&self) -> &SessionResolution {
        &self.resolution
    }

    pub fn computed_at(&self) -> OffsetDateTime {
        self.computed_at
    }
}

/// Result of committing a provider change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderChangeReceipt {
    pub request_id: ChangeRequestId,
    pub subscription_id: SubscriptionId,
    pub new_version: i64,
    pub sessions_reassigned: usize,
    pub sessions_kept: usize,
}

/// Plan-change and provider-change service
pub struct PlanChangeService {
    catalog: Arc<dyn PlanCatalog>,
    store: Arc<dyn SubscriptionStore>,
    calendar: Arc<dyn SessionCalendar>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl PlanChangeService {
    pub fn new(
        catalog: Arc<dyn PlanCatalog>,
        store: Arc<dyn SubscriptionStore>,
        calendar: Arc<dyn SessionCalendar>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            calendar,
            notifier,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Plan changes
    // =========================================================================

    /// Validate a plan-change request and compute its outcome
    pub async fn preview(&self, request: PlanChangeRequest) -> BillingResult<ChangeOutcome> {
        self.evaluate(request, Invocation::Request).await
    }

    /// Apply or schedule a previewed plan change
    pub async fn commit(&self, outcome: ChangeOutcome) -> BillingResult<CommitReceipt> {
        if outcome.is_deferred() {
            return self.schedule(outcome).await;
        }
        self.apply(outcome).await
    }

    /// Apply every pending change scheduled on or before `today`
    pub async fn process_due_changes(&self, today: Date) -> BillingResult<DueChangeReport> {
        let due = self.store.due_changes(today).await?;
        let mut report = DueChangeReport::default();

        for pending in due {
            let request_id = pending.request.id;
            let subscription_id = pending.request.subscription_id;
            let request = PlanChangeRequest {
                apply_immediately: true,
                effective_date: Some(pending.scheduled_for),
                ..pending.request
            };

            let result = match self
                .evaluate(request, Invocation::Scheduled(pending.scheduled_for))
                .await
            {
                Ok(outcome) => self.apply(outcome).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(receipt) => report.applied.push(receipt),
                Err(err) if err.is_retryable() => {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        request_id = %request_id,
                        error = %err,
                        "Failed to apply scheduled plan change, will retry"
                    );
                    report.failed.push(DueChangeFailure {
                        request_id,
                        subscription_id,
                        error: err.to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        request_id = %request_id,
                        error = %err,
                        "Scheduled plan change no longer applies, dropping it"
                    );
                    let failure = DueChangeFailure {
                        request_id,
                        subscription_id,
                        error: err.to_string(),
                    };
                    match self
                        .store
                        .remove_pending_change(subscription_id, request_id)
                        .await
                    {
                        Ok(_) => report.skipped.push(failure),
                        Err(remove_err) => {
                            tracing::error!(
                                subscription_id = %subscription_id,
                                request_id = %request_id,
                                error = %remove_err,
                                "Failed to drop scheduled plan change, will retry"
                            );
                            report.failed.push(DueChangeFailure {
                                error: remove_err.to_string(),
                                ..failure
                            });
                        }
                    }
                }
            }
        }

        tracing::info!(
            today = %today,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Processed due plan changes"
        );

        Ok(report)
    }

    /// Cancel the subscription's pending plan change, if any
    pub async fn cancel_pending(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<PendingPlanChange>> {
        let subscription = self.load_subscription(subscription_id).await?;
        let cancelled = self.store.cancel_pending_change(subscription_id).await?;

        if let Some(pending) = &cancelled {
            tracing::info!(
                subscription_id = %subscription_id,
                request_id = %pending.request.id,
                "Cancelled pending plan change"
            );
            let notification = ChangeNotificationBuilder::new(
                ChangeEventType::PlanChangeCancelled,
                subscription_id,
                subscription.client_id,
            )
            .request(pending.request.id)
            .data(serde_json::json!({
                "target_plan_id": pending.request.target_plan_id,
                "scheduled_for": pending.scheduled_for.to_string(),
            }))
            .build(self.clock.now());
            self.dispatch(notification).await;
        }

        Ok(cancelled)
    }

    async fn evaluate(
        &self,
        request: PlanChangeRequest,
        invocation: Invocation,
    ) -> BillingResult<ChangeOutcome> {
        let subscription = self.load_subscription(request.subscription_id).await?;
        ensure_changeable(&subscription)?;

        if request.target_plan_id == subscription.plan_id {
            return Err(PlanChangeError::InvalidTargetPlan(format!(
                "subscription is already on plan {}",
                request.target_plan_id
            )));
        }
        let to_plan = self
            .catalog
            .get_plan(&request.target_plan_id)
            .await?
            .ok_or_else(|| {
                PlanChangeError::InvalidTargetPlan(format!(
                    "plan {} does not exist",
                    request.target_plan_id
                ))
            })?;
        let from_plan = self
            .catalog
            .get_plan(&subscription.plan_id)
            .await?
            .ok_or_else(|| {
                PlanChangeError::InvalidInput(format!(
                    "current plan {} is missing from the catalog",
                    subscription.plan_id
                ))
            })?;

        let today = self.clock.today();
        let change_date = match invocation {
            Invocation::Scheduled(date) => date,
            Invocation::Request => resolve_change_date(&request, today)?,
        };

        if let Some(pending) = self.store.pending_change(subscription.id).await? {
            let own_record =
                invocation != Invocation::Request && pending.request.id == request.id;
            if !own_record {
                return Err(PlanChangeError::ConcurrentChangeInProgress(subscription.id));
            }
        }

        let comparison = compare(&from_plan, &to_plan);
        let direction = comparison.direction();
        if direction == ChangeDirection::Lateral
            && self.config.lateral_changes == LateralChangePolicy::Reject
        {
            return Err(PlanChangeError::LateralChangeNotAllowed {
                tier: from_plan.tier,
            });
        }

        let mut proration = prorate(&subscription, &to_plan, change_date);
        proration.informational = !request.apply_immediately;
        let mrr_impact = mrr_impact(&subscription, &to_plan);
        let session_adjustment = adjust_for_plan_change(
            subscription.sessions,
            &from_plan,
            &to_plan,
            direction,
            request.apply_immediately,
            self.config.downgrade_sessions,
        );

        Ok(ChangeOutcome {
            subscription_id: subscription.id,
            client_id: subscription.client_id,
            subscription_version: subscription.version,
            from_plan,
            to_plan,
            direction,
            change_date,
            comparison,
            proration,
            mrr_impact,
            session_adjustment,
            from_schedule: invocation != Invocation::Request,
            computed_at: self.clock.now(),
            previous: subscription,
            request,
        })
    }

    async fn schedule(&self, outcome: ChangeOutcome) -> BillingResult<CommitReceipt> {
        let request_id = outcome.request.id;
        let subscription_id = outcome.subscription_id;
        let scheduled_for = outcome.change_date;

        let pending = PendingPlanChange {
            request: outcome.request.clone(),
            scheduled_for,
            subscription_version: outcome.subscription_version,
            created_at: self.clock.now(),
        };
        self.store.schedule_change(pending).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            request_id = %request_id,
            from_plan = %outcome.from_plan.id,
            to_plan = %outcome.to_plan.id,
            scheduled_for = %scheduled_for,
            "Scheduled plan change"
        );

        let notification = ChangeNotificationBuilder::new(
            ChangeEventType::PlanChangeScheduled,
            subscription_id,
            outcome.client_id,
        )
        .request(request_id)
        .data(serde_json::json!({
            "from_plan_id": outcome.from_plan.id,
            "to_plan_id": outcome.to_plan.id,
            "scheduled_for": scheduled_for.to_string(),
            "direction": outcome.direction.to_string(),
        }))
        .actor_opt(outcome.request.actor_id, ActorType::Staff)
        .build(self.clock.now());
        self.dispatch(notification).await;

        Ok(CommitReceipt::Scheduled {
            request_id,
            subscription_id,
            scheduled_for,
        })
    }

    async fn apply(&self, outcome: ChangeOutcome) -> BillingResult<CommitReceipt> {
        let now = self.clock.now();
        let request_id = outcome.request.id;
        let subscription_id = outcome.subscription_id;
        let previous = &outcome.previous;
        let new_sessions = outcome.session_adjustment.new_counters();

        let ledger_entry = LedgerEntry::for_proration(
            subscription_id,
            request_id,
            &outcome.proration,
            &self.config.currency,
            now,
        );

        let history = ChangeHistoryEntry::new(
            subscription_id,
            ChangeKind::PlanChange,
            format!(
                "{} from {} to {}",
                outcome.direction, outcome.from_plan.name, outcome.to_plan.name
            ),
            now,
        )
        .field("plan_id", &previous.plan_id, &outcome.to_plan.id)
        .field("price", previous.price, outcome.to_plan.price)
        .field(
            "billing_frequency",
            previous.billing_frequency,
            outcome.to_plan.billing_frequency,
        )
        .field("discount", &previous.discount, Option::<()>::None)
        .field("sessions", previous.sessions, new_sessions.or(previous.sessions))
        .reason(outcome.request.reason.clone())
        .actor(outcome.request.actor_id);

        let commit = PlanChangeCommit {
            request_id,
            subscription_id,
            expected_version: outcome.subscription_version,
            plan_id: outcome.to_plan.id.clone(),
            price: outcome.to_plan.price,
            billing_frequency: outcome.to_plan.billing_frequency,
            sessions: new_sessions,
            ledger_entry: ledger_entry.clone(),
            history,
            clears_pending: outcome.from_schedule,
        };

        let new_version = match self.store.commit_plan_change(commit).await {
            Ok(version) => version,
            Err(err) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    request_id = %request_id,
                    error = %err,
                    "Failed to commit plan change"
                );
                return Err(err);
            }
        };

        let net_amount = ledger_entry
            .as_ref()
            .map(|e| e.amount)
            .unwrap_or_default();
        tracing::info!(
            subscription_id = %subscription_id,
            request_id = %request_id,
            from_plan = %outcome.from_plan.id,
            to_plan = %outcome.to_plan.id,
            direction = %outcome.direction,
            net_amount = %net_amount,
            delta_mrr = %outcome.mrr_impact.delta_mrr,
            new_version = new_version,
            "Applied plan change"
        );

        let event_type = match outcome.direction {
            ChangeDirection::Upgrade => ChangeEventType::PlanUpgraded,
            ChangeDirection::Downgrade => ChangeEventType::PlanDowngraded,
            ChangeDirection::Lateral => ChangeEventType::PlanChangedLateral,
        };
        let actor_type = if outcome.from_schedule {
            ActorType::System
        } else {
            ActorType::Staff
        };
        let notification =
            ChangeNotificationBuilder::new(event_type, subscription_id, outcome.client_id)
                .request(request_id)
                .data(serde_json::json!({
                    "from_plan_id": outcome.from_plan.id,
                    "to_plan_id": outcome.to_plan.id,
                    "change_date": outcome.change_date.to_string(),
                    "net_amount": net_amount,
                    "currency": self.config.currency,
                    "benefits_gained": outcome.comparison.benefits_gained,
                    "benefits_lost": outcome.comparison.benefits_lost,
                }))
                .actor_opt(outcome.request.actor_id, actor_type)
                .build(now);
        self.dispatch(notification).await;

        Ok(CommitReceipt::Applied {
            request_id,
            subscription_id,
            new_version,
            ledger_entry,
        })
    }

    // =========================================================================
    // Provider changes
    // =========================================================================

    /// Validate a provider-change request and resolve affected sessions
    pub async fn preview_provider_change(
        &self,
        request: ProviderChangeRequest,
    ) -> BillingResult<ProviderChangeOutcome> {
        let subscription = self.load_subscription(request.subscription_id).await?;
        ensure_changeable(&subscription)?;

        if subscription.provider_id == Some(request.target_provider_id) {
            return Err(PlanChangeError::InvalidTargetProvider(format!(
                "provider {} is already assigned",
                request.target_provider_id
            )));
        }

        let today = self.clock.today();
        let effective_date = match request.mode {
            ProviderChangeMode::Immediate => today,
            ProviderChangeMode::EffectiveOn(date) if date < today => {
                return Err(PlanChangeError::InvalidEffectiveDate(format!(
                    "{} is in the past",
                    date
                )));
            }
            ProviderChangeMode::EffectiveOn(date) => date,
        };

        let sessions = self.calendar.scheduled_sessions(&subscription.id).await?;
        let affected = affected_sessions(&sessions, effective_date).len();
        if request.session_policy.is_none() && affected > 0 {
            return Err(PlanChangeError::ConflictingSessionPolicy(format!(
                "{} scheduled session(s) affected but no policy selected",
                affected
            )));
        }

        let resolution = resolve_provider_change(
            &sessions,
            effective_date,
            request.target_provider_id,
            request.session_policy,
        );

        Ok(ProviderChangeOutcome {
            subscription_id: subscription.id,
            client_id: subscription.client_id,
            subscription_version: subscription.version,
            previous_provider: subscription.provider_id,
            effective_date,
            resolution,
            computed_at: self.clock.now(),
            request,
        })
    }

    /// Validate a provider-change form against the calendar and preview it
    pub async fn preview_provider_change_form(
        &self,
        form: ProviderChangeForm,
    ) -> BillingResult<ProviderChangeOutcome> {
        let sessions = self.calendar.scheduled_sessions(&form.subscription_id).await?;
        let today = self.clock.today();
        let effective_date = if form.apply_immediately {
            today
        } else {
            form.effective_date.unwrap_or(today)
        };
        let affected = affected_sessions(&sessions, effective_date).len();

        let request = form.into_request(affected)?;
        self.preview_provider_change(request).await
    }

    /// Commit a previewed provider change and notify about moved sessions
    pub async fn commit_provider_change(
        &self,
        outcome: ProviderChangeOutcome,
    ) -> BillingResult<ProviderChangeReceipt> {
        let now = self.clock.now();
        let request_id = outcome.request.id;
        let subscription_id = outcome.subscription_id;
        let new_provider = outcome.request.target_provider_id;

        let history = ChangeHistoryEntry::new(
            subscription_id,
            ChangeKind::ProviderChange,
            format!(
                "Provider change effective {} ({} session(s) reassigned, {} kept)",
                outcome.effective_date,
                outcome.resolution.reassigned.len(),
                outcome.resolution.kept.len()
            ),
            now,
        )
        .field("provider_id", outcome.previous_provider, Some(new_provider))
        .reason(outcome.request.reason.clone())
        .actor(outcome.request.actor_id);

        let commit = ProviderChangeCommit {
            request_id,
            subscription_id,
            expected_version: outcome.subscription_version,
            provider_id: new_provider,
            reassigned_sessions: outcome.resolution.reassigned.clone(),
            history,
        };

        let new_version = match self.store.commit_provider_change(commit).await {
            Ok(version) => version,
            Err(err) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    request_id = %request_id,
                    error = %err,
                    "Failed to commit provider change"
                );
                return Err(err);
            }
        };

        tracing::info!(
            subscription_id = %subscription_id,
            request_id = %request_id,
            provider_id = %new_provider,
            reassigned = outcome.resolution.reassigned.len(),
            kept = outcome.resolution.kept.len(),
            "Applied provider change"
        );

        let notification = ChangeNotificationBuilder::new(
            ChangeEventType::ProviderChanged,
            subscription_id,
            outcome.client_id,
        )
        .request(request_id)
        .data(serde_json::json!({
            "previous_provider": outcome.previous_provider,
            "new_provider": new_provider,
            "effective_date": outcome.effective_date.to_string(),
        }))
        .actor_opt(outcome.request.actor_id, ActorType::Staff)
        .build(now);
        self.dispatch(notification).await;

        for notice in &outcome.resolution.notifications {
            self.dispatch(ChangeNotification::session_reassigned(
                notice,
                outcome.client_id,
                request_id,
                now,
            ))
            .await;
        }

        Ok(ProviderChangeReceipt {
            request_id,
            subscription_id,
            new_version,
            sessions_reassigned: outcome.resolution.reassigned.len(),
            sessions_kept: outcome.resolution.kept.len(),
        })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Grant bonus sessions on top of the plan's included count
    pub async fn grant_bonus_sessions(
        &self,
        subscription_id: SubscriptionId,
        count: u32,
        reason: Option<String>,
        actor_id: Option<Uuid>,
    ) -> BillingResult<SessionCounters> {
        if count == 0 {
            return Err(PlanChangeError::InvalidInput(
                "bonus session count must be positive".to_string(),
            ));
        }

        let subscription = self.load_subscription(subscription_id).await?;
        ensure_changeable(&subscription)?;
        let counters = subscription.sessions.ok_or_else(|| {
            PlanChangeError::InvalidInput(format!(
                "subscription {} does not track sessions",
                subscription_id
            ))
        })?;
        let updated = counters.grant_bonus(count);
        let now = self.clock.now();

        let history = ChangeHistoryEntry::new(
            subscription_id,
            ChangeKind::BonusSessions,
            format!("Granted {} bonus session(s)", count),
            now,
        )
        .field("sessions", counters, updated)
        .reason(reason.clone())
        .actor(actor_id);

        self.store
            .commit_bonus_sessions(BonusSessionsCommit {
                subscription_id,
                expected_version: subscription.version,
                sessions: updated,
                history,
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            count = count,
            available = updated.available,
            "Granted bonus sessions"
        );

        let notification = ChangeNotificationBuilder::new(
            ChangeEventType::BonusSessionsGranted,
            subscription_id,
            subscription.client_id,
        )
        .data(serde_json::json!({
            "count": count,
            "available": updated.available,
            "reason": reason,
        }))
        .actor_opt(actor_id, ActorType::Staff)
        .build(now);
        self.dispatch(notification).await;

        Ok(updated)
    }

    async fn load_subscription(&self, id: SubscriptionId) -> BillingResult<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or(PlanChangeError::SubscriptionNotFound(id))
    }

    /// Notify without letting a delivery failure reach the caller
    async fn dispatch(&self, notification: ChangeNotification) {
        let event_type = notification.event_type;
        let subscription_id = notification.subscription_id;
        if let Err(err) = self.notifier.notify(notification).await {
            tracing::warn!(
                event_type = %event_type,
                subscription_id = %subscription_id,
                error = %err,
                "Failed to deliver change notification"
            );
        }
    }
}

fn ensure_changeable(subscription: &Subscription) -> BillingResult<()> {
    if subscription.status.is_terminal() {
        return Err(PlanChangeError::InvalidSubscriptionState {
            status: subscription.status,
        });
    }
    Ok(())
}

/// Date a caller-submitted request takes effect
fn resolve_change_date(request: &PlanChangeRequest, today: Date) -> BillingResult<Date> {
    match (request.apply_immediately, request.effective_date) {
        (true, None) => Ok(today),
        (true, Some(date)) if date == today => Ok(today),
        (true, Some(date)) => Err(PlanChangeError::InvalidEffectiveDate(format!(
            "immediate change cannot take effect on {}",
            date
        ))),
        (false, None) => Err(PlanChangeError::InvalidEffectiveDate(
            "a deferred change requires an effective date".to_string(),
        )),
        (false, Some(date)) if date < today => Err(PlanChangeError::InvalidEffectiveDate(format!(
            "{} is in the past",
            date
        ))),
        (false, Some(date)) => Ok(date),
    }
}
