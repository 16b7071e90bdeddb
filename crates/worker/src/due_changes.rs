//! Deferred plan-change job

use fitdesk_billing::{Clock, PlanChangeService, SystemClock};

/// Apply every pending plan change due today.
///
/// Errors are logged rather than returned; the next scheduled run retries.
pub async fn run(service: &PlanChangeService) {
    let today = SystemClock.today();

    match service.process_due_changes(today).await {
        Ok(report)
            if report.applied.is_empty() && report.skipped.is_empty() && report.failed.is_empty() =>
        {
            tracing::debug!(today = %today, "No plan changes due");
        }
        Ok(report) => {
            for skipped in &report.skipped {
                tracing::warn!(
                    subscription_id = %skipped.subscription_id,
                    request_id = %skipped.request_id,
                    error = %skipped.error,
                    "Pending plan change no longer applies, dropped"
                );
            }
            for failure in &report.failed {
                tracing::warn!(
                    subscription_id = %failure.subscription_id,
                    request_id = %failure.request_id,
                    error = %failure.error,
                    "Plan change left pending for retry"
                );
            }
            tracing::info!(
                today = %today,
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Deferred plan change run complete"
            );
        }
        Err(e) => {
            tracing::error!(today = %today, error = %e, "Failed to load due plan changes");
        }
    }
}
