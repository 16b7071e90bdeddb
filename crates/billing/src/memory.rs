//! In-memory collaborators
//!
//! Backs the orchestrator in tests and single-process tools. Commits take a
//! per-subscription lock (bounded by a timeout) and compare versions, so a
//! stale outcome or a contended subscription fails the same way it does
//! against Postgres.

use async_trait::async_trait;
use fitdesk_shared::{ChangeRequestId, PlanId, SubscriptionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::Date;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{BillingResult, PlanChangeError};
use crate::events::{ChangeNotification, Notifier};
use crate::history::ChangeHistoryEntry;
use crate::model::{Plan, ScheduledSession, Subscription};
use crate::store::{
    BonusSessionsCommit, LedgerEntry, PendingPlanChange, PlanCatalog, PlanChangeCommit,
    ProviderChangeCommit, SessionCalendar, SubscriptionStore,
};

/// How long a commit waits for the subscription lock
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    plans: HashMap<PlanId, Plan>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    sessions: HashMap<SubscriptionId, Vec<ScheduledSession>>,
    pending: HashMap<SubscriptionId, PendingPlanChange>,
    ledger: Vec<LedgerEntry>,
    history: Vec<ChangeHistoryEntry>,
}

impl State {
    /// Version check shared by every commit
    fn subscription_at(
        &mut self,
        id: SubscriptionId,
        expected_version: i64,
    ) -> BillingResult<&mut Subscription> {
        let subscription = self
            .subscriptions
            .get_mut(&id)
            .ok_or(PlanChangeError::SubscriptionNotFound(id))?;
        if subscription.version != expected_version {
            return Err(PlanChangeError::CommitFailed(format!(
                "subscription {} changed since preview (expected version {}, found {})",
                id, expected_version, subscription.version
            )));
        }
        Ok(subscription)
    }

    /// A direct change needs no pending record; a scheduled one needs its own
    fn pending_matches(&self, commit: &PlanChangeCommit) -> BillingResult<()> {
        let pending = self
            .pending
            .get(&commit.subscription_id)
            .map(|p| p.request.id);
        match (commit.clears_pending, pending) {
            (false, None) => Ok(()),
            (true, Some(id)) if id == commit.request_id => Ok(()),
            _ => Err(PlanChangeError::ConcurrentChangeInProgress(
                commit.subscription_id,
            )),
        }
    }
}

/// Plan catalog, subscription store and session calendar in one
pub struct InMemoryBillingStore {
    state: RwLock<State>,
    locks: Mutex<HashMap<SubscriptionId, Arc<Mutex<()>>>>,
    lock_timeout: Duration,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            locks: Mutex::new(HashMap::new()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.state.write().await.plans.insert(plan.id.clone(), plan);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_session(&self, session: ScheduledSession) {
        self.state
            .write()
            .await
            .sessions
            .entry(session.subscription_id)
            .or_default()
            .push(session);
    }

    /// Hold a subscription's commit lock until the guard is dropped
    pub async fn lock_subscription(&self, id: SubscriptionId) -> OwnedMutexGuard<()> {
        self.subscription_lock(id).await.lock_owned().await
    }

    async fn subscription_lock(&self, id: SubscriptionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    async fn acquire(&self, id: SubscriptionId) -> BillingResult<OwnedMutexGuard<()>> {
        let lock = self.subscription_lock(id).await;
        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                PlanChangeError::CommitFailed(format!(
                    "timed out waiting for the lock on subscription {}",
                    id
                ))
            })
    }
}

impl Default for InMemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlanCatalog for InMemoryBillingStore {
    async fn get_plan(&self, plan_id: &PlanId) -> BillingResult<Option<Plan>> {
        Ok(self.state.read().await.plans.get(plan_id).cloned())
    }
}

#[async_trait]
impl SessionCalendar for InMemoryBillingStore {
    async fn scheduled_sessions(
        &self,
        subscription_id: &SubscriptionId,
    ) -> BillingResult<Vec<ScheduledSession>> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .get(subscription_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        Ok(self.state.read().await.subscriptions.get(&id).cloned())
    }

    async fn pending_change(&self, id: SubscriptionId) -> BillingResult<Option<PendingPlanChange>> {
        Ok(self.state.read().await.pending.get(&id).cloned())
    }

    async fn schedule_change(&self, pending: PendingPlanChange) -> BillingResult<()> {
        let subscription_id = pending.request.subscription_id;
        let _guard = self.acquire(subscription_id).await?;
        let mut state = self.state.write().await;

        if state.pending.contains_key(&subscription_id) {
            return Err(PlanChangeError::ConcurrentChangeInProgress(subscription_id));
        }
        state.subscription_at(subscription_id, pending.subscription_version)?;
        state.pending.insert(subscription_id, pending);
        Ok(())
    }

    async fn cancel_pending_change(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Option<PendingPlanChange>> {
        let _guard = self.acquire(id).await?;
        Ok(self.state.write().await.pending.remove(&id))
    }

    async fn remove_pending_change(
        &self,
        id: SubscriptionId,
        request_id: ChangeRequestId,
    ) -> BillingResult<bool> {
        let _guard = self.acquire(id).await?;
        let mut state = self.state.write().await;
        if state
            .pending
            .get(&id)
            .is_some_and(|p| p.request.id == request_id)
        {
            state.pending.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn due_changes(&self, today: Date) -> BillingResult<Vec<PendingPlanChange>> {
        let state = self.state.read().await;
        let mut due: Vec<PendingPlanChange> = state
            .pending
            .values()
            .filter(|p| p.scheduled_for <= today)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(due)
    }

    async fn commit_plan_change(&self, commit: PlanChangeCommit) -> BillingResult<i64> {
        let _guard = self.acquire(commit.subscription_id).await?;
        let mut state = self.state.write().await;

        if state
            .ledger
            .iter()
            .any(|e| e.change_request_id == commit.request_id)
        {
            return Err(PlanChangeError::CommitFailed(format!(
                "change request {} already has a ledger entry",
                commit.request_id
            )));
        }

        state.pending_matches(&commit)?;

        let subscription = state.subscription_at(commit.subscription_id, commit.expected_version)?;
        subscription.plan_id = commit.plan_id;
        subscription.price = commit.price;
        subscription.billing_frequency = commit.billing_frequency;
        subscription.discount = None;
        if let Some(sessions) = commit.sessions {
            subscription.sessions = Some(sessions);
        }
        subscription.version += 1;
        let version = subscription.version;

        if commit.clears_pending {
            state.pending.remove(&commit.subscription_id);
        }
        if let Some(entry) = commit.ledger_entry {
            state.ledger.push(entry);
        }
        state.history.push(commit.history);

        Ok(version)
    }

    async fn commit_provider_change(&self, commit: ProviderChangeCommit) -> BillingResult<i64> {
        let _guard = self.acquire(commit.subscription_id).await?;
        let mut state = self.state.write().await;

        let subscription = state.subscription_at(commit.subscription_id, commit.expected_version)?;
        subscription.provider_id = Some(commit.provider_id);
        subscription.version += 1;
        let version = subscription.version;

        if let Some(sessions) = state.sessions.get_mut(&commit.subscription_id) {
            for updated in &commit.reassigned_sessions {
                if let Some(session) = sessions.iter_mut().find(|s| s.id == updated.id) {
                    session.provider_id = updated.provider_id;
                }
            }
        }
        state.history.push(commit.history);

        Ok(version)
    }

    async fn commit_bonus_sessions(&self, commit: BonusSessionsCommit) -> BillingResult<i64> {
        let _guard = self.acquire(commit.subscription_id).await?;
        let mut state = self.state.write().await;

        let subscription = state.subscription_at(commit.subscription_id, commit.expected_version)?;
        subscription.sessions = Some(commit.sessions);
        subscription.version += 1;
        let version = subscription.version;
        state.history.push(commit.history);

        Ok(version)
    }

    async fn ledger_entries(&self, id: SubscriptionId) -> BillingResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .ledger
            .iter()
            .filter(|e| e.subscription_id == id)
            .cloned()
            .collect())
    }

    async fn history(&self, id: SubscriptionId) -> BillingResult<Vec<ChangeHistoryEntry>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .iter()
            .filter(|e| e.subscription_id == id)
            .cloned()
            .collect())
    }
}

/// Notifier that keeps every notification for later inspection
#[derive(Default)]
pub struct RecordingNotifier {
    notifications: RwLock<Vec<ChangeNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that records and then reports failure
    pub fn failing() -> Self {
        Self {
            notifications: RwLock::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn notifications(&self) -> Vec<ChangeNotification> {
        self.notifications.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: ChangeNotification) -> BillingResult<()> {
        self.notifications.write().await.push(notification);
        if self.fail {
            return Err(PlanChangeError::InvalidInput(
                "notification channel unavailable".to_string(),
            ));
        }
        Ok(())
    }
}
