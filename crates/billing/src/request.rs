//! Change requests accepted by the orchestrator

use fitdesk_shared::{ChangeRequestId, PlanId, ProviderId, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

use crate::error::{BillingResult, PlanChangeError};

/// Request to move a subscription to another plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanChangeRequest {
    pub id: ChangeRequestId,
    pub subscription_id: SubscriptionId,
    pub target_plan_id: PlanId,
    pub apply_immediately: bool,
    /// Required (and not in the past) when `apply_immediately` is false
    pub effective_date: Option<Date>,
    pub reason: Option<String>,
    pub actor_id: Option<Uuid>,
}

impl PlanChangeRequest {
    /// Change applied right away
    pub fn immediate(subscription_id: SubscriptionId, target_plan_id: impl Into<PlanId>) -> Self {
        Self {
            id: ChangeRequestId::new(),
            subscription_id,
            target_plan_id: target_plan_id.into(),
            apply_immediately: true,
            effective_date: None,
            reason: None,
            actor_id: None,
        }
    }

    /// Change applied on `effective_date`
    pub fn deferred(
        subscription_id: SubscriptionId,
        target_plan_id: impl Into<PlanId>,
        effective_date: Date,
    ) -> Self {
        Self {
            apply_immediately: false,
            effective_date: Some(effective_date),
            ..Self::immediate(subscription_id, target_plan_id)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}

/// What happens to already-booked sessions when the provider changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Sessions stay with the current provider
    Keep,
    /// Sessions move to the new provider
    Reassign,
}

impl SessionPolicy {
    /// Validate the two independent form toggles into a single policy.
    ///
    /// Both set is always rejected. Neither set is only acceptable when no
    /// sessions are affected.
    pub fn from_flags(
        keep_sessions: bool,
        reassign_sessions: bool,
        affected_sessions: usize,
    ) -> BillingResult<Option<Self>> {
        match (keep_sessions, reassign_sessions) {
            (true, true) => Err(PlanChangeError::ConflictingSessionPolicy(
                "keep and reassign are mutually exclusive".to_string(),
            )),
            (true, false) => Ok(Some(SessionPolicy::Keep)),
            (false, true) => Ok(Some(SessionPolicy::Reassign)),
            (false, false) if affected_sessions > 0 => {
                Err(PlanChangeError::ConflictingSessionPolicy(format!(
                    "{} scheduled session(s) affected but no policy selected",
                    affected_sessions
                )))
            }
            (false, false) => Ok(None),
        }
    }
}

/// When a provider change takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "date", rename_all = "snake_case")]
pub enum ProviderChangeMode {
    Immediate,
    EffectiveOn(Date),
}

/// Request to hand a subscription over to another provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderChangeRequest {
    pub id: ChangeRequestId,
    pub subscription_id: SubscriptionId,
    pub target_provider_id: ProviderId,
    pub mode: ProviderChangeMode,
    pub session_policy: Option<SessionPolicy>,
    pub reason: Option<String>,
    pub actor_id: Option<Uuid>,
}

impl ProviderChangeRequest {
    pub fn new(
        subscription_id: SubscriptionId,
        target_provider_id: ProviderId,
        mode: ProviderChangeMode,
        session_policy: Option<SessionPolicy>,
    ) -> Self {
        Self {
            id: ChangeRequestId::new(),
            subscription_id,
            target_provider_id,
            mode,
            session_policy,
            reason: None,
            actor_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Provider change as submitted from the dashboard form, with two checkboxes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderChangeForm {
    pub subscription_id: SubscriptionId,
    pub target_provider_id: ProviderId,
    pub apply_immediately: bool,
    pub effective_date: Option<Date>,
    pub keep_sessions: bool,
    pub reassign_sessions: bool,
    pub reason: Option<String>,
}

impl ProviderChangeForm {
    /// Validate the form into a request.
    ///
    /// `affected_sessions` is the number of booked sessions on or after the
    /// effective date, as reported by the calendar.
    pub fn into_request(self, affected_sessions: usize) -> BillingResult<ProviderChangeRequest> {
        let policy =
            SessionPolicy::from_flags(self.keep_sessions, self.reassign_sessions, affected_sessions)?;

        let mode = if self.apply_immediately {
            ProviderChangeMode::Immediate
        } else {
            let date = self.effective_date.ok_or_else(|| {
                PlanChangeError::InvalidEffectiveDate(
                    "a dated provider change requires an effective date".to_string(),
                )
            })?;
            ProviderChangeMode::EffectiveOn(date)
        };

        Ok(ProviderChangeRequest {
            id: ChangeRequestId::new(),
            subscription_id: self.subscription_id,
            target_provider_id: self.target_provider_id,
            mode,
            session_policy: policy,
            reason: self.reason,
            actor_id: None,
        })
    }
}
