//! Integration tests for the plan-change flow
//!
//! These tests drive `PlanChangeService` end to end against the in-memory
//! store: preview, commit, scheduled re-invocation and provider changes.
//!
//! ## Test Coverage
//! - Immediate upgrade with proration and MRR impact
//! - Session-pack downgrade
//! - Deferred change scheduling and processing
//! - Provider change with keep/reassign policies
//! - Concurrency failures (stale preview, second pending change)
//!
//! ## Running Tests
//! ```bash
//! cargo test --test plan_change_flow
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use fitdesk_billing::{
    export_csv, BillingHistoryService, ChangeDirection, ChangeEventType, CommitReceipt,
    EngineConfig, FixedClock, InMemoryBillingStore, Plan, PlanCatalog, PlanChangeError,
    PlanChangeRequest, PlanChangeService, ProviderChangeForm, ProviderChangeMode,
    ProviderChangeRequest, RecordingNotifier, ScheduledSession, SessionAdjustment,
    SessionCalendar, SessionCounters, SessionPolicy, Subscription, SubscriptionStore,
};
use fitdesk_shared::{
    BillingFrequency, ClientId, PlanId, ProviderId, SessionId, SessionStatus, SubscriptionId,
    SubscriptionStatus,
};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use time::macros::{date, datetime, time};
use time::Date;

// ============================================================================
// Test Utilities
// ============================================================================

struct Harness {
    store: Arc<InMemoryBillingStore>,
    notifier: Arc<RecordingNotifier>,
    service: PlanChangeService,
}

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

fn catalog() -> Vec<Plan> {
    let plan = |id: &str, name: &str, tier: u32, price: &str, sessions: Option<u32>, benefits: &[&str]| Plan {
        id: PlanId::from(id),
        name: name.to_string(),
        tier,
        price: dec(price),
        billing_frequency: BillingFrequency::Monthly,
        benefits: benefits.iter().map(|b| b.to_string()).collect(),
        supports_pause: true,
        multi_service: false,
        services: None,
        included_sessions: sessions,
    };

    vec![
        plan("basic", "Basic", 1, "35", None, &["gym access", "locker"]),
        plan(
            "premium",
            "Premium",
            2,
            "55",
            None,
            &["gym access", "locker", "group classes"],
        ),
        plan("pt-4", "4 Session Pack", 1, "150", Some(4), &["personal training"]),
        plan(
            "pt-8",
            "8 Session Pack",
            2,
            "280",
            Some(8),
            &["personal training", "nutrition plan"],
        ),
    ]
}

/// Service pinned to day 15 of a 30-day October period
async fn harness() -> Harness {
    let store = Arc::new(InMemoryBillingStore::new());
    for plan in catalog() {
        store.insert_plan(plan).await;
    }

    let notifier = Arc::new(RecordingNotifier::new());
    let service = PlanChangeService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        notifier.clone(),
        EngineConfig::default(),
    )
    .with_clock(Arc::new(FixedClock(datetime!(2026-10-16 10:30 UTC))));

    Harness {
        store,
        notifier,
        service,
    }
}

async fn subscribe(h: &Harness, plan_id: &str, sessions: Option<SessionCounters>) -> Subscription {
    let plan = h
        .store
        .get_plan(&PlanId::from(plan_id))
        .await
        .unwrap()
        .expect("plan in catalog");
    let subscription = Subscription {
        id: SubscriptionId::new(),
        client_id: ClientId::new(),
        plan_id: plan.id.clone(),
        status: SubscriptionStatus::Active,
        price: plan.price,
        billing_frequency: plan.billing_frequency,
        period_start: date!(2026 - 10 - 01),
        period_end: date!(2026 - 10 - 31),
        next_renewal: date!(2026 - 10 - 31),
        discount: None,
        sessions,
        provider_id: Some(ProviderId::new()),
        version: 0,
    };
    h.store.insert_subscription(subscription.clone()).await;
    subscription
}

async fn book(h: &Harness, subscription: &Subscription, date: Date) -> ScheduledSession {
    let session = ScheduledSession {
        id: SessionId::new(),
        subscription_id: subscription.id,
        date,
        time: time!(07:30),
        session_type: "personal training".to_string(),
        status: SessionStatus::Confirmed,
        provider_id: subscription.provider_id.expect("provider assigned"),
    };
    h.store.insert_session(session.clone()).await;
    session
}

fn pack_counters() -> SessionCounters {
    SessionCounters {
        included: 8,
        used: 2,
        available: 6,
        bonus: 0,
    }
}

// ============================================================================
// Plan changes
// ============================================================================

#[tokio::test]
async fn test_immediate_upgrade_mid_period() {
    let h = harness().await;
    let sub = subscribe(&h, "basic", None).await;

    let outcome = h
        .service
        .preview(PlanChangeRequest::immediate(sub.id, "premium"))
        .await
        .unwrap();

    let proration = outcome.proration();
    assert_eq!(proration.days_total, 30);
    assert_eq!(proration.days_used, 15);
    assert_eq!(proration.days_remaining, 15);
    assert_eq!(proration.credit_current_period, dec("17.5"));
    assert_eq!(proration.charge_new_period, dec("27.5"));
    assert_eq!(proration.net_prorated_amount, dec("10.0"));
    assert!(!proration.informational);

    let mrr = outcome.mrr_impact();
    assert_eq!(mrr.mrr_current, dec("35"));
    assert_eq!(mrr.mrr_new, dec("55"));
    assert_eq!(mrr.delta_mrr, dec("20"));
    assert_eq!(mrr.percent_change.round_dp(2), dec("57.14"));
    assert_eq!(mrr.annualized_impact, dec("240"));

    assert_eq!(outcome.comparison().benefits_gained, vec!["group classes"]);
    assert!(outcome.comparison().benefits_lost.is_empty());

    let receipt = h.service.commit(outcome).await.unwrap();
    let CommitReceipt::Applied {
        new_version,
        ledger_entry,
        ..
    } = receipt
    else {
        panic!("immediate change must be applied");
    };
    assert_eq!(new_version, 1);
    let entry = ledger_entry.expect("non-zero proration produces a ledger entry");
    assert_eq!(entry.amount, dec("10.00"));
    assert_eq!(entry.effective_date, date!(2026 - 10 - 16));

    assert_eq!(h.store.ledger_entries(sub.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_session_pack_downgrade_caps_available() {
    let h = harness().await;
    let sub = subscribe(&h, "pt-8", Some(pack_counters())).await;

    let outcome = h
        .service
        .preview(PlanChangeRequest::immediate(sub.id, "pt-4"))
        .await
        .unwrap();
    assert_eq!(outcome.direction(), ChangeDirection::Downgrade);
    assert_eq!(
        *outcome.session_adjustment(),
        SessionAdjustment::Adjusted {
            before: pack_counters(),
            after: SessionCounters {
                included: 4,
                used: 2,
                available: 4,
                bonus: 0,
            },
            forfeited: 2,
        }
    );
    // (150 - 280) * 15 / 30
    assert!(outcome.proration().is_credit());
    assert_eq!(outcome.proration().net_prorated_amount, dec("-65"));

    h.service.commit(outcome).await.unwrap();
    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.sessions.unwrap().available, 4);
    assert_eq!(stored.price, dec("150"));

    let events: Vec<ChangeEventType> = h
        .notifier
        .notifications()
        .await
        .iter()
        .map(|n| n.event_type)
        .collect();
    assert_eq!(events, vec![ChangeEventType::PlanDowngraded]);
}

#[tokio::test]
async fn test_deferred_change_leaves_counters_until_processed() {
    let h = harness().await;
    let sub = subscribe(&h, "pt-8", Some(pack_counters())).await;

    let outcome = h
        .service
        .preview(PlanChangeRequest::deferred(sub.id, "pt-4", date!(2026 - 10 - 26)))
        .await
        .unwrap();
    assert!(outcome.is_deferred());
    assert!(outcome.proration().informational);
    assert_eq!(outcome.proration().days_remaining, 5);
    assert_eq!(
        *outcome.session_adjustment(),
        SessionAdjustment::Unchanged {
            counters: pack_counters()
        }
    );

    let receipt = h.service.commit(outcome).await.unwrap();
    assert!(matches!(
        receipt,
        CommitReceipt::Scheduled { scheduled_for, .. } if scheduled_for == date!(2026 - 10 - 26)
    ));

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.sessions, Some(pack_counters()));
    assert_eq!(stored.plan_id, PlanId::from("pt-8"));
    assert!(h.store.ledger_entries(sub.id).await.unwrap().is_empty());

    let report = h
        .service
        .process_due_changes(date!(2026 - 10 - 26))
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);
    assert!(report.failed.is_empty());

    // Prorated on the scheduled date: (150 - 280) * 5 / 30
    let entry = report.applied[0].ledger_entry().unwrap();
    assert_eq!(entry.amount, dec("-21.67"));
    assert_eq!(entry.effective_date, date!(2026 - 10 - 26));

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.plan_id, PlanId::from("pt-4"));
    assert_eq!(stored.sessions.unwrap().available, 4);

    // A second pass finds nothing left to apply
    let report = h
        .service
        .process_due_changes(date!(2026 - 10 - 27))
        .await
        .unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(h.store.ledger_entries(sub.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_pending_change_is_rejected() {
    let h = harness().await;
    let sub = subscribe(&h, "basic", None).await;

    let first = h
        .service
        .preview(PlanChangeRequest::deferred(sub.id, "premium", date!(2026 - 10 - 31)))
        .await
        .unwrap();
    let second = h
        .service
        .preview(PlanChangeRequest::deferred(sub.id, "premium", date!(2026 - 10 - 25)))
        .await
        .unwrap();

    h.service.commit(first).await.unwrap();
    let err = h.service.commit(second).await.unwrap_err();
    assert!(matches!(err, PlanChangeError::ConcurrentChangeInProgress(id) if id == sub.id));
}

#[tokio::test]
async fn test_stale_preview_fails_commit() {
    let h = harness().await;
    let sub = subscribe(&h, "pt-8", Some(pack_counters())).await;

    let stale = h
        .service
        .preview(PlanChangeRequest::immediate(sub.id, "pt-4"))
        .await
        .unwrap();

    h.service
        .grant_bonus_sessions(sub.id, 1, Some("make-up session".to_string()), None)
        .await
        .unwrap();

    let err = h.service.commit(stale).await.unwrap_err();
    assert!(matches!(err, PlanChangeError::CommitFailed(_)));
    assert!(err.is_retryable());

    // Retrying from validation picks up the new version
    let fresh = h
        .service
        .preview(PlanChangeRequest::immediate(sub.id, "pt-4"))
        .await
        .unwrap();
    assert_eq!(fresh.subscription_version(), 1);
    assert!(h.service.commit(fresh).await.is_ok());
}

#[tokio::test]
async fn test_unsupported_frequency_never_defaults() {
    let err = "fortnightly".parse::<BillingFrequency>().unwrap_err();
    assert!(matches!(
        PlanChangeError::from(err),
        PlanChangeError::UnsupportedBillingFrequency(value) if value == "fortnightly"
    ));
}

// ============================================================================
// Provider changes
// ============================================================================

#[tokio::test]
async fn test_provider_change_reassign_moves_future_sessions() {
    let h = harness().await;
    let sub = subscribe(&h, "pt-8", Some(pack_counters())).await;
    let past = book(&h, &sub, date!(2026 - 10 - 02)).await;
    book(&h, &sub, date!(2026 - 10 - 20)).await;
    book(&h, &sub, date!(2026 - 10 - 27)).await;

    let new_provider = ProviderId::new();
    let outcome = h
        .service
        .preview_provider_change(ProviderChangeRequest::new(
            sub.id,
            new_provider,
            ProviderChangeMode::Immediate,
            Some(SessionPolicy::Reassign),
        ))
        .await
        .unwrap();
    assert_eq!(outcome.resolution().reassigned.len(), 2);
    assert_eq!(outcome.resolution().notifications.len(), 2);

    h.service.commit_provider_change(outcome).await.unwrap();

    let sessions = h.store.scheduled_sessions(&sub.id).await.unwrap();
    for session in &sessions {
        if session.id == past.id {
            assert_eq!(session.provider_id, past.provider_id);
        } else {
            assert_eq!(session.provider_id, new_provider);
        }
    }

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.provider_id, Some(new_provider));

    let reassigned = h
        .notifier
        .notifications()
        .await
        .iter()
        .filter(|n| n.event_type == ChangeEventType::SessionReassigned)
        .count();
    assert_eq!(reassigned, 2);
}

#[tokio::test]
async fn test_provider_change_keep_leaves_sessions() {
    let h = harness().await;
    let sub = subscribe(&h, "pt-8", Some(pack_counters())).await;
    let original_provider = sub.provider_id.unwrap();
    book(&h, &sub, date!(2026 - 10 - 20)).await;
    book(&h, &sub, date!(2026 - 10 - 27)).await;

    let outcome = h
        .service
        .preview_provider_change(ProviderChangeRequest::new(
            sub.id,
            ProviderId::new(),
            ProviderChangeMode::Immediate,
            Some(SessionPolicy::Keep),
        ))
        .await
        .unwrap();
    assert_eq!(outcome.resolution().kept.len(), 2);
    assert!(outcome.resolution().notifications.is_empty());

    h.service.commit_provider_change(outcome).await.unwrap();

    let sessions = h.store.scheduled_sessions(&sub.id).await.unwrap();
    assert!(sessions.iter().all(|s| s.provider_id == original_provider));
}

#[tokio::test]
async fn test_provider_form_requires_exactly_one_policy() {
    let h = harness().await;
    let sub = subscribe(&h, "pt-8", Some(pack_counters())).await;
    book(&h, &sub, date!(2026 - 10 - 28)).await;

    let form = |keep: bool, reassign: bool| ProviderChangeForm {
        subscription_id: sub.id,
        target_provider_id: ProviderId::new(),
        apply_immediately: false,
        effective_date: Some(date!(2026 - 10 - 25)),
        keep_sessions: keep,
        reassign_sessions: reassign,
        reason: None,
    };

    for (keep, reassign) in [(true, true), (false, false)] {
        let err = h
            .service
            .preview_provider_change_form(form(keep, reassign))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanChangeError::ConflictingSessionPolicy(_)));
    }

    let outcome = h
        .service
        .preview_provider_change_form(form(false, true))
        .await
        .unwrap();
    assert_eq!(outcome.effective_date(), date!(2026 - 10 - 25));
    assert_eq!(outcome.resolution().reassigned.len(), 1);
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn test_history_export_covers_every_change() {
    let h = harness().await;
    let sub = subscribe(&h, "pt-8", Some(pack_counters())).await;

    h.service
        .grant_bonus_sessions(sub.id, 2, Some("referral".to_string()), None)
        .await
        .unwrap();
    let outcome = h
        .service
        .preview(PlanChangeRequest::immediate(sub.id, "pt-4").with_reason("fewer sessions"))
        .await
        .unwrap();
    h.service.commit(outcome).await.unwrap();

    let history = h.store.history(sub.id).await.unwrap();
    assert_eq!(history.len(), 2);

    let exporter = BillingHistoryService::new(h.store.clone());
    let csv = exporter.export_subscription_csv(sub.id).await.unwrap();
    assert_eq!(
        csv,
        export_csv(&history, &h.store.ledger_entries(sub.id).await.unwrap())
    );
    assert_eq!(csv.lines().count(), 4);
    assert!(csv.contains("bonus_sessions"));
    assert!(csv.contains("billing_adjustment"));

    let summary = exporter.ledger_summary(sub.id).await.unwrap();
    assert_eq!(summary.entry_count, 1);
    assert_eq!(summary.net, dec("-65"));
}
