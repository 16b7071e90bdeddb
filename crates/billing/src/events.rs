//! Change Events Module
//!
//! Notifications emitted after a change is committed. They are handed to a
//! [`Notifier`] for client-facing messaging and are fire-and-forget from the
//! engine's standpoint: a failing notifier never undoes a commit.
//!
//! ## Event Types
//!
//! - Plan changes: upgraded, downgraded or lateral when applied, plus scheduled
//!   and cancelled for deferred changes
//! - Provider changes and per-session reassignments
//! - Bonus sessions granted

use async_trait::async_trait;
use fitdesk_shared::{ChangeRequestId, ClientId, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::sessions::ReassignmentNotice;

/// Types of change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEventType {
    // Plan changes
    PlanUpgraded,
    PlanDowngraded,
    PlanChangedLateral,
    PlanChangeScheduled,
    PlanChangeCancelled,

    // Provider changes
    ProviderChanged,
    SessionReassigned,

    // Sessions
    BonusSessionsGranted,
}

impl std::fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeEventType::PlanUpgraded => "PLAN_UPGRADED",
            ChangeEventType::PlanDowngraded => "PLAN_DOWNGRADED",
            ChangeEventType::PlanChangedLateral => "PLAN_CHANGED_LATERAL",
            ChangeEventType::PlanChangeScheduled => "PLAN_CHANGE_SCHEDULED",
            ChangeEventType::PlanChangeCancelled => "PLAN_CHANGE_CANCELLED",
            ChangeEventType::ProviderChanged => "PROVIDER_CHANGED",
            ChangeEventType::SessionReassigned => "SESSION_REASSIGNED",
            ChangeEventType::BonusSessionsGranted => "BONUS_SESSIONS_GRANTED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Staff member in the dashboard
    Staff,
    /// Scheduled re-invocation or other automation
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Staff => write!(f, "staff"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// A change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub id: Uuid,
    pub event_type: ChangeEventType,
    pub subscription_id: SubscriptionId,
    pub client_id: ClientId,
    pub change_request_id: Option<ChangeRequestId>,
    pub data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub occurred_at: OffsetDateTime,
}

/// Builder for change notifications
pub struct ChangeNotificationBuilder {
    event_type: ChangeEventType,
    subscription_id: SubscriptionId,
    client_id: ClientId,
    change_request_id: Option<ChangeRequestId>,
    data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl ChangeNotificationBuilder {
    pub fn new(
        event_type: ChangeEventType,
        subscription_id: SubscriptionId,
        client_id: ClientId,
    ) -> Self {
        Self {
            event_type,
            subscription_id,
            client_id,
            change_request_id: None,
            data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the triggering request
    pub fn request(mut self, request_id: ChangeRequestId) -> Self {
        self.change_request_id = Some(request_id);
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Set the actor with an optional user ID.
    /// Without one the actor type is left as system.
    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        if actor_id.is_some() {
            self.actor_type = actor_type;
        }
        self.actor_id = actor_id;
        self
    }

    pub fn build(self, occurred_at: OffsetDateTime) -> ChangeNotification {
        ChangeNotification {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            subscription_id: self.subscription_id,
            client_id: self.client_id,
            change_request_id: self.change_request_id,
            data: self.data,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
            occurred_at,
        }
    }
}

impl ChangeNotification {
    /// Notification for a single session moved to a new provider
    pub fn session_reassigned(
        notice: &ReassignmentNotice,
        client_id: ClientId,
        request_id: ChangeRequestId,
        occurred_at: OffsetDateTime,
    ) -> Self {
        ChangeNotificationBuilder::new(
            ChangeEventType::SessionReassigned,
            notice.subscription_id,
            client_id,
        )
        .request(request_id)
        .data(serde_json::json!({
            "session_id": notice.session_id,
            "date": notice.date.to_string(),
            "time": notice.time.to_string(),
            "previous_provider": notice.previous_provider,
            "new_provider": notice.new_provider,
        }))
        .build(occurred_at)
    }
}

/// Receives change notifications for client-facing messaging
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: ChangeNotification) -> BillingResult<()>;
}

/// Notifier that only writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: ChangeNotification) -> BillingResult<()> {
        tracing::info!(
            event_type = %notification.event_type,
            subscription_id = %notification.subscription_id,
            client_id = %notification.client_id,
            actor_type = %notification.actor_type,
            data = %notification.data,
            "Change notification"
        );
        Ok(())
    }
}
