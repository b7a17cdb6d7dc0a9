//! Scenario step catalog and reminder chain planning.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use herald_common::config::StepDefinition;
use herald_common::{AppError, AppResult, next_time_of_day};
use tracing::warn;

/// Steps indexed by id.
#[derive(Debug, Clone, Default)]
pub struct StepCatalog {
    steps: HashMap<String, StepDefinition>,
}

impl StepCatalog {
    #[must_use]
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        Self {
            steps: steps.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.get(id)
    }
}

/// One reminder of a planned chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedReminder {
    /// Step delivered by the reminder.
    pub step_id: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Plan the reminders of `step_id`, starting from `start`.
///
/// Bindings are walked in order with a shared cursor: each reminder is
/// offset from the previous one, not from `start`. A binding whose delay is
/// zero or negative is dropped. When the target step declares a time of day,
/// the candidate moves forward to the next occurrence of that local time in
/// `tz`, and the aligned instant becomes the new cursor.
pub fn compute_chain(
    catalog: &StepCatalog,
    step_id: &str,
    start: DateTime<Utc>,
    tz: Tz,
) -> AppResult<Vec<PlannedReminder>> {
    let step = catalog
        .get(step_id)
        .ok_or_else(|| AppError::NotFound(format!("Step not found: {step_id}")))?;

    let mut cursor = start;
    let mut planned = Vec::with_capacity(step.reminders.len());

    for binding in &step.reminders {
        let target = catalog.get(&binding.step).ok_or_else(|| {
            AppError::Config(format!(
                "Step {step_id} has a reminder to unknown step {}",
                binding.step
            ))
        })?;

        let delay = binding
            .delay_minutes
            .or(target.default_delay_minutes)
            .unwrap_or(0);
        if delay <= 0 {
            continue;
        }

        let candidate = cursor + Duration::minutes(delay);
        let scheduled_at = match target.time_of_day {
            Some(at) => next_time_of_day(candidate, at, tz).unwrap_or_else(|| {
                warn!(step = %target.id, %candidate, "Time-of-day alignment failed, using candidate");
                candidate
            }),
            None => candidate,
        };

        cursor = scheduled_at;
        planned.push(PlannedReminder {
            step_id: target.id.clone(),
            scheduled_at,
        });
    }

    Ok(planned)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use herald_common::TimeOfDay;
    use herald_common::config::ReminderBinding;

    fn step(id: &str, default_delay: Option<i64>, at: Option<TimeOfDay>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            default_delay_minutes: default_delay,
            time_of_day: at,
            text: format!("<b>{id}</b>"),
            reminders: Vec::new(),
        }
    }

    fn bind(step: &str, delay: Option<i64>) -> ReminderBinding {
        ReminderBinding {
            step: step.to_string(),
            delay_minutes: delay,
        }
    }

    fn catalog(bindings: Vec<ReminderBinding>) -> StepCatalog {
        let mut start = step("start", None, None);
        start.reminders = bindings;
        StepCatalog::new(vec![
            start,
            step("first", None, None),
            step("morning", Some(60), TimeOfDay::new(9, 0)),
            step("never", None, None),
        ])
    }

    #[test]
    fn test_chain_offsets_from_previous_reminder() {
        let tz: Tz = "Europe/Moscow".parse().unwrap();
        let start = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();
        let catalog = catalog(vec![bind("first", Some(120)), bind("morning", Some(1320))]);

        let chain = compute_chain(&catalog, "start", start, tz).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].scheduled_at, start + Duration::minutes(120));

        // 14:00 UTC + 22h = next day 12:00 UTC (15:00 MSK), so 09:00 MSK the day after.
        let aligned = Utc.with_ymd_and_hms(2025, 5, 12, 6, 0, 0).unwrap();
        assert_eq!(chain[1].step_id, "morning");
        assert_eq!(chain[1].scheduled_at, aligned);
    }

    #[test]
    fn test_non_positive_delays_are_skipped() {
        let tz = Tz::UTC;
        let start = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();
        let catalog = catalog(vec![
            bind("never", None),
            bind("first", Some(0)),
            bind("first", Some(-5)),
            bind("first", Some(30)),
        ]);

        let chain = compute_chain(&catalog, "start", start, tz).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].scheduled_at, start + Duration::minutes(30));
    }

    #[test]
    fn test_default_delay_of_target_is_used() {
        let tz = Tz::UTC;
        let start = Utc.with_ymd_and_hms(2025, 5, 10, 7, 0, 0).unwrap();
        let catalog = catalog(vec![bind("morning", None)]);

        let chain = compute_chain(&catalog, "start", start, tz).unwrap();
        // 08:00 is before 09:00, so same day.
        assert_eq!(
            chain[0].scheduled_at,
            Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_chain_is_non_decreasing_and_respects_delays() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let catalog = catalog(vec![
            bind("first", Some(45)),
            bind("morning", Some(300)),
            bind("first", Some(10)),
            bind("morning", Some(1440)),
            bind("morning", Some(1)),
        ]);
        // Walk across the spring-forward weekend hour by hour.
        let mut start = Utc.with_ymd_and_hms(2025, 3, 7, 0, 0, 0).unwrap();
        for _ in 0..96 {
            let chain = compute_chain(&catalog, "start", start, tz).unwrap();
            let delays = [45, 300, 10, 1440, 1];
            let mut previous = start;
            for (planned, delay) in chain.iter().zip(delays) {
                assert!(planned.scheduled_at >= previous + Duration::minutes(delay));
                previous = planned.scheduled_at;
            }
            start += Duration::hours(1);
        }
    }

    #[test]
    fn test_unknown_step_is_not_found() {
        let err = compute_chain(&StepCatalog::default(), "missing", Utc::now(), Tz::UTC).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
