//! FitDesk Billing
//!
//! Plan-change and proration engine for session-pack and membership
//! subscriptions.
//!
//! ## Calculators
//!
//! - [`frequency`]: normalize any billing frequency to a monthly amount
//! - [`comparison`]: price deltas and benefit partition between two plans
//! - [`proration`]: mid-cycle credit and charge on a 30-day reference month
//! - [`mrr`]: monthly recurring revenue impact
//! - [`sessions`]: session counters on plan changes, booked sessions on provider changes
//!
//! ## Orchestration
//!
//! [`PlanChangeService`] validates requests, previews outcomes and commits
//! them through the [`store`] traits. [`memory`] and [`postgres`] provide
//! implementations of those traits.

pub mod clock;
pub mod comparison;
pub mod config;
pub mod error;
pub mod events;
pub mod frequency;
pub mod history;
pub mod memory;
pub mod model;
pub mod mrr;
pub mod orchestrator;
pub mod postgres;
pub mod proration;
pub mod request;
pub mod sessions;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use comparison::{compare, ChangeDirection, PlanComparison};
pub use config::{DowngradeSessionPolicy, EngineConfig, LateralChangePolicy};
pub use error::{BillingResult, PlanChangeError};
pub use events::{
    ActorType, ChangeEventType, ChangeNotification, ChangeNotificationBuilder, Notifier,
    TracingNotifier,
};
pub use frequency::normalize_monthly;
pub use history::{export_csv, BillingHistoryService, ChangeHistoryEntry, ChangeKind, FieldChange};
pub use memory::{InMemoryBillingStore, RecordingNotifier};
pub use model::{Discount, Plan, ScheduledSession, SessionCounters, Subscription};
pub use mrr::{mrr_impact, MrrImpact};
pub use orchestrator::{
    ChangeOutcome, CommitReceipt, DueChangeFailure, DueChangeReport, PlanChangeService,
    ProviderChangeOutcome, ProviderChangeReceipt,
};
pub use postgres::PgBillingStore;
pub use proration::{prorate, ProrationResult, REFERENCE_MONTH_DAYS};
pub use request::{
    PlanChangeRequest, ProviderChangeForm, ProviderChangeMode, ProviderChangeRequest, SessionPolicy,
};
pub use sessions::{
    adjust_for_plan_change, resolve_provider_change, ReassignmentNotice, SessionAdjustment,
    SessionResolution,
};
pub use store::{
    LedgerEntry, PendingPlanChange, PlanCatalog, SessionCalendar, SubscriptionStore,
};
