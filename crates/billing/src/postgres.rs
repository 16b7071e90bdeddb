//! Postgres collaborators
//!
//! Every commit runs in one transaction: the subscription row is locked with
//! `SELECT ... FOR UPDATE`, its version compared, and the update guarded by
//! `WHERE version = $n`. A lock wait beyond `lock_timeout` aborts the
//! transaction and surfaces as `CommitFailed`.

use async_trait::async_trait;
use fitdesk_shared::{
    BillingFrequency, ChangeRequestId, ClientId, DiscountKind, PlanId, ProviderId, SessionId,
    SessionStatus, SubscriptionId, SubscriptionStatus,
};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime, Time};
use uuid::Uuid;

use crate::error::{BillingResult, PlanChangeError};
use crate::history::{ChangeHistoryEntry, ChangeKind, FieldChange};
use crate::model::{Discount, Plan, ScheduledSession, SessionCounters, Subscription};
use crate::request::PlanChangeRequest;
use crate::store::{
    BonusSessionsCommit, LedgerEntry, PendingPlanChange, PlanCatalog, PlanChangeCommit,
    ProviderChangeCommit, SessionCalendar, SubscriptionStore,
};

/// Postgres lock wait limit for commit transactions
const LOCK_TIMEOUT: &str = "5s";

const SUBSCRIPTION_COLUMNS: &str = "id, client_id, plan_id, status, price, billing_frequency, \
     period_start, period_end, next_renewal, discount_kind, discount_value, discount_reason, \
     sessions_included, sessions_used, sessions_available, sessions_bonus, provider_id, version";

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: String,
    name: String,
    tier: i32,
    price: Decimal,
    billing_frequency: String,
    benefits: Json<Vec<String>>,
    supports_pause: bool,
    multi_service: bool,
    services: Option<Json<Vec<String>>>,
    included_sessions: Option<i32>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = PlanChangeError;

    fn try_from(row: PlanRow) -> BillingResult<Self> {
        Ok(Plan {
            id: PlanId::new(row.id),
            name: row.name,
            tier: to_u32(row.tier, "plans.tier")?,
            price: row.price,
            billing_frequency: row.billing_frequency.parse::<BillingFrequency>()?,
            benefits: row.benefits.0,
            supports_pause: row.supports_pause,
            multi_service: row.multi_service,
            services: row.services.map(|s| s.0),
            included_sessions: row
                .included_sessions
                .map(|n| to_u32(n, "plans.included_sessions"))
                .transpose()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    client_id: Uuid,
    plan_id: String,
    status: String,
    price: Decimal,
    billing_frequency: String,
    period_start: Date,
    period_end: Date,
    next_renewal: Date,
    discount_kind: Option<String>,
    discount_value: Option<Decimal>,
    discount_reason: Option<String>,
    sessions_included: Option<i32>,
    sessions_used: Option<i32>,
    sessions_available: Option<i32>,
    sessions_bonus: Option<i32>,
    provider_id: Option<Uuid>,
    version: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = PlanChangeError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let discount = match (row.discount_kind, row.discount_value) {
            (Some(kind), Some(value)) => Some(Discount {
                kind: kind.parse::<DiscountKind>()?,
                value,
                reason: row.discount_reason,
            }),
            _ => None,
        };

        let sessions = match (
            row.sessions_included,
            row.sessions_used,
            row.sessions_available,
            row.sessions_bonus,
        ) {
            (Some(included), Some(used), Some(available), Some(bonus)) => Some(SessionCounters {
                included: to_u32(included, "subscriptions.sessions_included")?,
                used: to_u32(used, "subscriptions.sessions_used")?,
                available: to_u32(available, "subscriptions.sessions_available")?,
                bonus: to_u32(bonus, "subscriptions.sessions_bonus")?,
            }),
            _ => None,
        };

        Ok(Subscription {
            id: SubscriptionId::from(row.id),
            client_id: ClientId::from(row.client_id),
            plan_id: PlanId::new(row.plan_id),
            status: row.status.parse::<SubscriptionStatus>()?,
            price: row.price,
            billing_frequency: row.billing_frequency.parse::<BillingFrequency>()?,
            period_start: row.period_start,
            period_end: row.period_end,
            next_renewal: row.next_renewal,
            discount,
            sessions,
            provider_id: row.provider_id.map(ProviderId::from),
            version: row.version,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    subscription_id: Uuid,
    session_date: Date,
    session_time: Time,
    session_type: String,
    status: String,
    provider_id: Uuid,
}

impl TryFrom<SessionRow> for ScheduledSession {
    type Error = PlanChangeError;

    fn try_from(row: SessionRow) -> BillingResult<Self> {
        Ok(ScheduledSession {
            id: SessionId::from(row.id),
            subscription_id: SubscriptionId::from(row.subscription_id),
            date: row.session_date,
            time: row.session_time,
            session_type: row.session_type,
            status: row.status.parse::<SessionStatus>()?,
            provider_id: ProviderId::from(row.provider_id),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PendingRow {
    request_id: Uuid,
    subscription_id: Uuid,
    target_plan_id: String,
    scheduled_for: Date,
    reason: Option<String>,
    actor_id: Option<Uuid>,
    subscription_version: i64,
    created_at: OffsetDateTime,
}

impl From<PendingRow> for PendingPlanChange {
    fn from(row: PendingRow) -> Self {
        PendingPlanChange {
            request: PlanChangeRequest {
                id: ChangeRequestId::from(row.request_id),
                subscription_id: SubscriptionId::from(row.subscription_id),
                target_plan_id: PlanId::new(row.target_plan_id),
                apply_immediately: false,
                effective_date: Some(row.scheduled_for),
                reason: row.reason,
                actor_id: row.actor_id,
            },
            scheduled_for: row.scheduled_for,
            subscription_version: row.subscription_version,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    subscription_id: Uuid,
    amount: Decimal,
    currency: String,
    effective_date: Date,
    change_request_id: Uuid,
    created_at: OffsetDateTime,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            id: row.id,
            subscription_id: SubscriptionId::from(row.subscription_id),
            amount: row.amount,
            currency: row.currency,
            effective_date: row.effective_date,
            change_request_id: ChangeRequestId::from(row.change_request_id),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    subscription_id: Uuid,
    kind: String,
    description: String,
    changes: Json<Vec<FieldChange>>,
    reason: Option<String>,
    actor_id: Option<Uuid>,
    recorded_at: OffsetDateTime,
}

impl TryFrom<HistoryRow> for ChangeHistoryEntry {
    type Error = PlanChangeError;

    fn try_from(row: HistoryRow) -> BillingResult<Self> {
        Ok(ChangeHistoryEntry {
            id: row.id,
            subscription_id: SubscriptionId::from(row.subscription_id),
            kind: row.kind.parse::<ChangeKind>()?,
            description: row.description,
            changes: row.changes.0,
            reason: row.reason,
            actor_id: row.actor_id,
            recorded_at: row.recorded_at,
        })
    }
}

fn to_u32(value: i32, column: &str) -> BillingResult<u32> {
    u32::try_from(value)
        .map_err(|_| PlanChangeError::InvalidInput(format!("{} is negative: {}", column, value)))
}

fn to_i32(value: u32, field: &str) -> BillingResult<i32> {
    i32::try_from(value)
        .map_err(|_| PlanChangeError::InvalidInput(format!("{} out of range: {}", field, value)))
}

/// Plan catalog, subscription store and session calendar backed by Postgres
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Start a commit transaction and lock the subscription row at `expected_version`
    async fn begin_locked(
        &self,
        subscription_id: SubscriptionId,
        expected_version: i64,
    ) -> BillingResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("SET LOCAL lock_timeout = '{}'", LOCK_TIMEOUT))
            .execute(&mut *tx)
            .await?;

        let current: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(subscription_id.0)
                .fetch_optional(&mut *tx)
                .await?;

        match current {
            None => Err(PlanChangeError::SubscriptionNotFound(subscription_id)),
            Some((version,)) if version != expected_version => {
                Err(PlanChangeError::CommitFailed(format!(
                    "subscription {} changed since preview (expected version {}, found {})",
                    subscription_id, expected_version, version
                )))
            }
            Some(_) => Ok(tx),
        }
    }

    /// Bump the version; zero rows means another writer got there first
    async fn bump_version(
        tx: &mut Transaction<'static, Postgres>,
        subscription_id: SubscriptionId,
        expected_version: i64,
    ) -> BillingResult<i64> {
        let updated: Option<(i64,)> = sqlx::query_as(
            "UPDATE subscriptions SET version = version + 1, updated_at = NOW()
             WHERE id = $1 AND version = $2
             RETURNING version",
        )
        .bind(subscription_id.0)
        .bind(expected_version)
        .fetch_optional(&mut **tx)
        .await?;

        updated.map(|(v,)| v).ok_or_else(|| {
            PlanChangeError::CommitFailed(format!(
                "version check failed for subscription {}",
                subscription_id
            ))
        })
    }

    async fn insert_history(
        tx: &mut Transaction<'static, Postgres>,
        entry: &ChangeHistoryEntry,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO subscription_change_history
                (id, subscription_id, kind, description, changes, reason, actor_id, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(entry.subscription_id.0)
        .bind(entry.kind.as_str())
        .bind(&entry.description)
        .bind(Json(&entry.changes))
        .bind(&entry.reason)
        .bind(entry.actor_id)
        .bind(entry.recorded_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PlanCatalog for PgBillingStore {
    async fn get_plan(&self, plan_id: &PlanId) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, tier, price, billing_frequency, benefits, supports_pause,
                    multi_service, services, included_sessions
             FROM plans WHERE id = $1",
        )
        .bind(plan_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }
}

#[async_trait]
impl SessionCalendar for PgBillingStore {
    async fn scheduled_sessions(
        &self,
        subscription_id: &SubscriptionId,
    ) -> BillingResult<Vec<ScheduledSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT id, subscription_id, session_date, session_time, session_type, status, provider_id
             FROM scheduled_sessions
             WHERE subscription_id = $1
             ORDER BY session_date, session_time",
        )
        .bind(subscription_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduledSession::try_from).collect()
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn pending_change(&self, id: SubscriptionId) -> BillingResult<Option<PendingPlanChange>> {
        let row: Option<PendingRow> = sqlx::query_as(
            "SELECT request_id, subscription_id, target_plan_id, scheduled_for, reason, actor_id,
                    subscription_version, created_at
             FROM pending_plan_changes WHERE subscription_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PendingPlanChange::from))
    }

    async fn schedule_change(&self, pending: PendingPlanChange) -> BillingResult<()> {
        let subscription_id = pending.request.subscription_id;
        let mut tx = self
            .begin_locked(subscription_id, pending.subscription_version)
            .await?;

        // Atomic insert - only succeeds if nothing is pending for this subscription
        let result = sqlx::query(
            "INSERT INTO pending_plan_changes
                (request_id, subscription_id, target_plan_id, scheduled_for, reason, actor_id,
                 subscription_version, created_at)
             SELECT $1, $2, $3, $4, $5, $6, $7, $8
             WHERE NOT EXISTS (
                 SELECT 1 FROM pending_plan_changes WHERE subscription_id = $2
             )
             ON CONFLICT (subscription_id) DO NOTHING",
        )
        .bind(pending.request.id.0)
        .bind(subscription_id.0)
        .bind(pending.request.target_plan_id.as_str())
        .bind(pending.scheduled_for)
        .bind(&pending.request.reason)
        .bind(pending.request.actor_id)
        .bind(pending.subscription_version)
        .bind(pending.created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PlanChangeError::ConcurrentChangeInProgress(subscription_id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_pending_change(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Option<PendingPlanChange>> {
        let row: Option<PendingRow> = sqlx::query_as(
            "DELETE FROM pending_plan_changes WHERE subscription_id = $1
             RETURNING request_id, subscription_id, target_plan_id, scheduled_for, reason,
                       actor_id, subscription_version, created_at",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PendingPlanChange::from))
    }

    async fn remove_pending_change(
        &self,
        id: SubscriptionId,
        request_id: ChangeRequestId,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "DELETE FROM pending_plan_changes WHERE subscription_id = $1 AND request_id = $2",
        )
        .bind(id.0)
        .bind(request_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn due_changes(&self, today: Date) -> BillingResult<Vec<PendingPlanChange>> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            "SELECT request_id, subscription_id, target_plan_id, scheduled_for, reason, actor_id,
                    subscription_version, created_at
             FROM pending_plan_changes
             WHERE scheduled_for <= $1
             ORDER BY scheduled_for, created_at",
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PendingPlanChange::from).collect())
    }

    async fn commit_plan_change(&self, commit: PlanChangeCommit) -> BillingResult<i64> {
        let mut tx = self
            .begin_locked(commit.subscription_id, commit.expected_version)
            .await?;

        // Runs under the subscription row lock, which schedule_change also takes
        let pending: Option<Uuid> = sqlx::query_scalar(
            "SELECT request_id FROM pending_plan_changes WHERE subscription_id = $1 FOR UPDATE",
        )
        .bind(commit.subscription_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        match (commit.clears_pending, pending) {
            (false, None) => {}
            (true, Some(id)) if id == commit.request_id.0 => {}
            _ => {
                return Err(PlanChangeError::ConcurrentChangeInProgress(
                    commit.subscription_id,
                ))
            }
        }

        let (included, used, available, bonus) = match commit.sessions {
            Some(s) => (
                Some(to_i32(s.included, "sessions.included")?),
                Some(to_i32(s.used, "sessions.used")?),
                Some(to_i32(s.available, "sessions.available")?),
                Some(to_i32(s.bonus, "sessions.bonus")?),
            ),
            None => (None, None, None, None),
        };

        sqlx::query(
            "UPDATE subscriptions
             SET plan_id = $2, price = $3, billing_frequency = $4,
                 discount_kind = NULL, discount_value = NULL, discount_reason = NULL,
                 sessions_included = COALESCE($5, sessions_included),
                 sessions_used = COALESCE($6, sessions_used),
                 sessions_available = COALESCE($7, sessions_available),
                 sessions_bonus = COALESCE($8, sessions_bonus)
             WHERE id = $1",
        )
        .bind(commit.subscription_id.0)
        .bind(commit.plan_id.as_str())
        .bind(commit.price)
        .bind(commit.billing_frequency.as_str())
        .bind(included)
        .bind(used)
        .bind(available)
        .bind(bonus)
        .execute(&mut *tx)
        .await?;

        let version =
            Self::bump_version(&mut tx, commit.subscription_id, commit.expected_version).await?;

        if let Some(entry) = &commit.ledger_entry {
            sqlx::query(
                "INSERT INTO billing_adjustments
                    (id, subscription_id, amount, currency, effective_date, change_request_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(entry.id)
            .bind(entry.subscription_id.0)
            .bind(entry.amount)
            .bind(&entry.currency)
            .bind(entry.effective_date)
            .bind(entry.change_request_id.0)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        if commit.clears_pending {
            sqlx::query(
                "DELETE FROM pending_plan_changes WHERE subscription_id = $1 AND request_id = $2",
            )
            .bind(commit.subscription_id.0)
            .bind(commit.request_id.0)
            .execute(&mut *tx)
            .await?;
        }

        Self::insert_history(&mut tx, &commit.history).await?;
        tx.commit().await?;

        Ok(version)
    }

    async fn commit_provider_change(&self, commit: ProviderChangeCommit) -> BillingResult<i64> {
        let mut tx = self
            .begin_locked(commit.subscription_id, commit.expected_version)
            .await?;

        sqlx::query("UPDATE subscriptions SET provider_id = $2 WHERE id = $1")
            .bind(commit.subscription_id.0)
            .bind(commit.provider_id.0)
            .execute(&mut *tx)
            .await?;

        for session in &commit.reassigned_sessions {
            sqlx::query(
                "UPDATE scheduled_sessions SET provider_id = $3
                 WHERE id = $1 AND subscription_id = $2",
            )
            .bind(session.id.0)
            .bind(commit.subscription_id.0)
            .bind(session.provider_id.0)
            .execute(&mut *tx)
            .await?;
        }

        let version =
            Self::bump_version(&mut tx, commit.subscription_id, commit.expected_version).await?;
        Self::insert_history(&mut tx, &commit.history).await?;
        tx.commit().await?;

        Ok(version)
    }

    async fn commit_bonus_sessions(&self, commit: BonusSessionsCommit) -> BillingResult<i64> {
        let mut tx = self
            .begin_locked(commit.subscription_id, commit.expected_version)
            .await?;

        sqlx::query(
            "UPDATE subscriptions
             SET sessions_included = $2, sessions_used = $3,
                 sessions_available = $4, sessions_bonus = $5
             WHERE id = $1",
        )
        .bind(commit.subscription_id.0)
        .bind(to_i32(commit.sessions.included, "sessions.included")?)
        .bind(to_i32(commit.sessions.used, "sessions.used")?)
        .bind(to_i32(commit.sessions.available, "sessions.available")?)
        .bind(to_i32(commit.sessions.bonus, "sessions.bonus")?)
        .execute(&mut *tx)
        .await?;

        let version =
            Self::bump_version(&mut tx, commit.subscription_id, commit.expected_version).await?;
        Self::insert_history(&mut tx, &commit.history).await?;
        tx.commit().await?;

        Ok(version)
    }

    async fn ledger_entries(&self, id: SubscriptionId) -> BillingResult<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT id, subscription_id, amount, currency, effective_date, change_request_id, created_at
             FROM billing_adjustments
             WHERE subscription_id = $1
             ORDER BY created_at",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn history(&self, id: SubscriptionId) -> BillingResult<Vec<ChangeHistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT id, subscription_id, kind, description, changes, reason, actor_id, recorded_at
             FROM subscription_change_history
             WHERE subscription_id = $1
             ORDER BY recorded_at",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChangeHistoryEntry::try_from).collect()
    }
}
