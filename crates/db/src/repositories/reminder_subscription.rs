//! Reminder subscription repository.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use herald_common::{AppError, AppResult, IdGenerator};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

use crate::entities::reminder_subscription::{self, ReminderStatus};
use crate::entities::ReminderSubscription;
use crate::gateway::{NewReminderSubscription, ReminderStore};

/// Reminder subscription repository for database operations.
#[derive(Clone)]
pub struct ReminderSubscriptionRepository {
    db: Arc<DatabaseConnection>,
    id_gen: IdGenerator,
}

impl ReminderSubscriptionRepository {
    /// Create a new reminder subscription repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            id_gen: IdGenerator::new(),
        }
    }

    /// Find a subscription by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<reminder_subscription::Model>> {
        ReminderSubscription::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find pending subscriptions for a subject, earliest first.
    pub async fn find_pending_by_subject(
        &self,
        subject_id: i64,
    ) -> AppResult<Vec<reminder_subscription::Model>> {
        ReminderSubscription::find()
            .filter(reminder_subscription::Column::SubjectId.eq(subject_id))
            .filter(reminder_subscription::Column::Status.eq(ReminderStatus::Pending))
            .order_by_asc(reminder_subscription::Column::ScheduledAt)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Create a new pending subscription.
    pub async fn create(
        &self,
        input: NewReminderSubscription,
    ) -> AppResult<reminder_subscription::Model> {
        let model = reminder_subscription::ActiveModel {
            id: Set(self.id_gen.generate()),
            subject_id: Set(input.subject_id),
            step_id: Set(input.step_id),
            scenario_key: Set(input.scenario_key),
            status: Set(ReminderStatus::Pending),
            scheduled_at: Set(input.scheduled_at.into()),
            task_id: Set(None),
            created_at: Set(Utc::now().into()),
            updated_at: Set(None),
        };

        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Store the task id of a subscription.
    pub async fn set_task_id(&self, id: &str, task_id: &str) -> AppResult<()> {
        ReminderSubscription::update_many()
            .col_expr(reminder_subscription::Column::TaskId, Expr::value(task_id))
            .col_expr(
                reminder_subscription::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(reminder_subscription::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Update the status only if the row is still in `from`.
    pub async fn compare_and_set_status(
        &self,
        id: &str,
        from: ReminderStatus,
        to: ReminderStatus,
    ) -> AppResult<bool> {
        let result = ReminderSubscription::update_many()
            .col_expr(reminder_subscription::Column::Status, Expr::value(to.to_value()))
            .col_expr(
                reminder_subscription::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(reminder_subscription::Column::Id.eq(id))
            .filter(reminder_subscription::Column::Status.eq(from))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }
}

#[async_trait]
impl ReminderStore for ReminderSubscriptionRepository {
    async fn create_subscription(
        &self,
        input: NewReminderSubscription,
    ) -> AppResult<reminder_subscription::Model> {
        self.create(input).await
    }

    async fn find_subscription(&self, id: &str) -> AppResult<Option<reminder_subscription::Model>> {
        self.find_by_id(id).await
    }

    async fn attach_task(&self, id: &str, task_id: &str) -> AppResult<()> {
        self.set_task_id(id, task_id).await
    }

    async fn transition_subscription(
        &self,
        id: &str,
        from: ReminderStatus,
        to: ReminderStatus,
    ) -> AppResult<bool> {
        self.compare_and_set_status(id, from, to).await
    }

    async fn find_pending_by_subject(
        &self,
        subject_id: i64,
    ) -> AppResult<Vec<reminder_subscription::Model>> {
        Self::find_pending_by_subject(self, subject_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn create_test_subscription(id: &str, status: ReminderStatus) -> reminder_subscription::Model {
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap();
        reminder_subscription::Model {
            id: id.to_string(),
            subject_id: 42,
            step_id: "nudge".to_string(),
            scenario_key: "onboarding".to_string(),
            status,
            scheduled_at: at.into(),
            task_id: Some("task1".to_string()),
            created_at: at.into(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_find_by_id() {
        let sub = create_test_subscription("sub1", ReminderStatus::Pending);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([[sub.clone()]])
            .into_connection();

        let repo = ReminderSubscriptionRepository::new(Arc::new(db));
        let result = repo.find_by_id("sub1").await.unwrap();

        assert_eq!(result, Some(sub));
    }

    #[tokio::test]
    async fn test_find_pending_by_subject() {
        let first = create_test_subscription("sub1", ReminderStatus::Pending);
        let second = create_test_subscription("sub2", ReminderStatus::Pending);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([[first, second]])
            .into_connection();

        let repo = ReminderSubscriptionRepository::new(Arc::new(db));
        let result = repo.find_pending_by_subject(42).await.unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "sub1");
    }

    #[tokio::test]
    async fn test_compare_and_set_status_applied() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();

        let repo = ReminderSubscriptionRepository::new(Arc::new(db));
        let changed = repo
            .compare_and_set_status("sub1", ReminderStatus::Pending, ReminderStatus::Sent)
            .await
            .unwrap();

        assert!(changed);
    }

    #[tokio::test]
    async fn test_compare_and_set_status_stale() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();

        let repo = ReminderSubscriptionRepository::new(Arc::new(db));
        let changed = repo
            .compare_and_set_status("sub1", ReminderStatus::Pending, ReminderStatus::Canceled)
            .await
            .unwrap();

        assert!(!changed);
    }
}
