//! Daily reachability sweep.

use std::sync::Arc;

use chrono_tz::Tz;
use herald_common::AppResult;
use herald_common::config::SweepConfig;
use herald_db::SubjectStore;
use herald_queue::{Pacer, RecurringJob, Repeat, TaskPayload, TaskQueue, dedupe, register_recurring};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::delivery::{DeliveryError, DeliveryGateway};
use super::reminder::ReminderService;

/// Counts of one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: u64,
    pub members: u64,
    pub left: u64,
    pub unreachable: u64,
    pub errors: u64,
}

/// Checks every reachable subject against the configured group.
pub struct ReachabilitySweep {
    subjects: Arc<dyn SubjectStore>,
    reminders: Arc<ReminderService>,
    gateway: Arc<dyn DeliveryGateway>,
    config: SweepConfig,
    pacer: Arc<Pacer>,
}

impl ReachabilitySweep {
    #[must_use]
    pub fn new(
        subjects: Arc<dyn SubjectStore>,
        reminders: Arc<ReminderService>,
        gateway: Arc<dyn DeliveryGateway>,
        config: SweepConfig,
        pacer: Arc<Pacer>,
    ) -> Self {
        Self {
            subjects,
            reminders,
            gateway,
            config,
            pacer,
        }
    }

    /// Page through reachable subjects and record their membership.
    ///
    /// A subject the channel reports as gone is marked unreachable and its
    /// pending reminders are cancelled.
    pub async fn run(&self) -> AppResult<SweepReport> {
        let mut report = SweepReport::default();
        let Some(group_id) = self.config.group_id else {
            info!("No group configured, skipping reachability sweep");
            return Ok(report);
        };

        let mut after = None;
        loop {
            let page = self
                .subjects
                .list_reachable(after, self.config.page_size.max(1))
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            for subject in &page {
                report.checked += 1;
                self.check(group_id, subject.id, &mut report).await?;
            }
        }

        info!(
            checked = report.checked,
            members = report.members,
            left = report.left,
            unreachable = report.unreachable,
            errors = report.errors,
            "Reachability sweep finished"
        );
        Ok(report)
    }

    async fn check(&self, group_id: i64, subject_id: i64, report: &mut SweepReport) -> AppResult<()> {
        self.pacer.wait().await;
        let status = match self.gateway.get_member_status(group_id, subject_id).await {
            Ok(status) => status,
            Err(DeliveryError::Permanent(reason)) => {
                debug!(subject_id, reason = %reason, "Subject unreachable");
                self.subjects.mark_unreachable(subject_id, &reason).await?;
                let summary = self.reminders.cancel_all_pending(subject_id).await?;
                if summary.failed > 0 {
                    warn!(subject_id, failed = summary.failed, "Some reminders could not be cancelled");
                }
                report.unreachable += 1;
                return Ok(());
            }
            Err(DeliveryError::RateLimited { retry_after }) => {
                warn!(subject_id, ?retry_after, "Rate limited during sweep");
                self.pacer.defer(retry_after).await;
                report.errors += 1;
                return Ok(());
            }
            Err(e) => {
                warn!(subject_id, error = %e, "Member status check failed");
                report.errors += 1;
                return Ok(());
            }
        };

        let is_member = status.is_member();
        self.subjects.record_membership(subject_id, is_member).await?;
        if is_member {
            report.members += 1;
        } else {
            report.left += 1;
        }
        Ok(())
    }
}

/// Register the daily sweep. Re-registering replaces the previous schedule.
pub async fn register_sweep(queue: &TaskQueue, config: &SweepConfig, timezone: Tz) -> AppResult<Option<String>> {
    if !config.enabled {
        info!("Reachability sweep disabled");
        return Ok(None);
    }
    let job = RecurringJob::new(
        dedupe::REACHABILITY_SWEEP,
        TaskPayload::ReachabilitySweep,
        Repeat::Daily {
            at: config.at,
            timezone,
        },
    );
    let task_id = register_recurring(queue, job).await?;
    info!(
        task_id = %task_id,
        hour = config.at.hour,
        minute = config.at.minute,
        %timezone,
        "Reachability sweep registered"
    );
    Ok(Some(task_id))
}
