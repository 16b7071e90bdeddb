//! Session reallocation
//!
//! Two independent concerns:
//! - adjusting session counters when a session-pack plan changes
//! - resolving booked sessions when the subscription's provider changes

use fitdesk_shared::{ProviderId, SessionId, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::{Date, Time};

use crate::comparison::ChangeDirection;
use crate::config::DowngradeSessionPolicy;
use crate::model::{Plan, ScheduledSession, SessionCounters};
use crate::request::SessionPolicy;

/// Effect of a plan change on session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionAdjustment {
    /// Subscription or one of the plans doesn't count sessions
    NotApplicable,
    /// Deferred change; counters stay as they are until renewal
    Unchanged { counters: SessionCounters },
    Adjusted {
        before: SessionCounters,
        after: SessionCounters,
        /// Available sessions dropped by a downgrade cap
        forfeited: u32,
    },
}

impl SessionAdjustment {
    /// Counters to write on commit, if any
    pub fn new_counters(&self) -> Option<SessionCounters> {
        match self {
            SessionAdjustment::Adjusted { after, .. } => Some(*after),
            _ => None,
        }
    }
}

/// Compute new session counters for a plan change
pub fn adjust_for_plan_change(
    counters: Option<SessionCounters>,
    current: &Plan,
    target: &Plan,
    direction: ChangeDirection,
    apply_immediately: bool,
    downgrade_policy: DowngradeSessionPolicy,
) -> SessionAdjustment {
    let (Some(counters), Some(current_included), Some(target_included)) =
        (counters, current.included_sessions, target.included_sessions)
    else {
        return SessionAdjustment::NotApplicable;
    };

    if !apply_immediately {
        return SessionAdjustment::Unchanged { counters };
    }

    let grows = match direction {
        ChangeDirection::Upgrade => true,
        ChangeDirection::Downgrade => false,
        ChangeDirection::Lateral => target_included > current_included,
    };

    let (available, forfeited) = if grows {
        let added = target_included.saturating_sub(current_included);
        (counters.available.saturating_add(added), 0)
    } else {
        match downgrade_policy {
            DowngradeSessionPolicy::Forfeit => {
                let capped = counters.available.min(target_included);
                (capped, counters.available - capped)
            }
            DowngradeSessionPolicy::Preserve => (counters.available, 0),
        }
    };

    SessionAdjustment::Adjusted {
        before: counters,
        after: SessionCounters {
            included: target_included,
            available,
            ..counters
        },
        forfeited,
    }
}

/// Notice sent to the client for each session moved to a new provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignmentNotice {
    pub session_id: SessionId,
    pub subscription_id: SubscriptionId,
    pub date: Date,
    pub time: Time,
    pub previous_provider: ProviderId,
    pub new_provider: ProviderId,
}

/// Outcome of applying a session policy to booked sessions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionResolution {
    /// Affected sessions left with their current provider
    pub kept: Vec<ScheduledSession>,
    /// Affected sessions, already pointing at the new provider
    pub reassigned: Vec<ScheduledSession>,
    pub notifications: Vec<ReassignmentNotice>,
}

impl SessionResolution {
    pub fn affected_count(&self) -> usize {
        self.kept.len() + self.reassigned.len()
    }
}

/// Booked sessions on or after `effective_date`
pub fn affected_sessions(sessions: &[ScheduledSession], effective_date: Date) -> Vec<&ScheduledSession> {
    sessions
        .iter()
        .filter(|s| s.date >= effective_date && s.status.is_booked())
        .collect()
}

/// Resolve booked sessions for a provider change.
///
/// Only sessions on or after `effective_date` that are scheduled or confirmed
/// are considered; everything else is left out of the resolution entirely.
/// With no policy (valid only when nothing is affected) every affected
/// session is kept.
pub fn resolve_provider_change(
    sessions: &[ScheduledSession],
    effective_date: Date,
    new_provider: ProviderId,
    policy: Option<SessionPolicy>,
) -> SessionResolution {
    let mut resolution = SessionResolution::default();

    for session in affected_sessions(sessions, effective_date) {
        match policy {
            Some(SessionPolicy::Reassign) => {
                resolution.notifications.push(ReassignmentNotice {
                    session_id: session.id,
                    subscription_id: session.subscription_id,
                    date: session.date,
                    time: session.time,
                    previous_provider: session.provider_id,
                    new_provider,
                });
                resolution.reassigned.push(ScheduledSession {
                    provider_id: new_provider,
                    ..session.clone()
                });
            }
            Some(SessionPolicy::Keep) | None => resolution.kept.push(session.clone()),
        }
    }

    resolution
}
