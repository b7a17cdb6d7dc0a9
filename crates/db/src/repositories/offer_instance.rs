//! Offer instance repository.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{AppError, AppResult, IdGenerator};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set, SqlErr,
};

use crate::entities::offer_instance::{self, OfferStatus};
use crate::entities::OfferInstance;
use crate::gateway::{MessageLocation, NewOfferInstance, OfferStore};

/// Offer instance repository for database operations.
#[derive(Clone)]
pub struct OfferInstanceRepository {
    db: Arc<DatabaseConnection>,
    id_gen: IdGenerator,
}

impl OfferInstanceRepository {
    /// Create a new offer instance repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            id_gen: IdGenerator::new(),
        }
    }

    /// Find an instance by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<offer_instance::Model>> {
        OfferInstance::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find the instance of `offer_key` for a subject.
    pub async fn find_by_subject_and_key(
        &self,
        subject_id: i64,
        offer_key: &str,
    ) -> AppResult<Option<offer_instance::Model>> {
        OfferInstance::find()
            .filter(offer_instance::Column::SubjectId.eq(subject_id))
            .filter(offer_instance::Column::OfferKey.eq(offer_key))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Insert a new active instance.
    pub async fn create(&self, input: NewOfferInstance) -> AppResult<offer_instance::Model> {
        let model = offer_instance::ActiveModel {
            id: Set(self.id_gen.generate()),
            subject_id: Set(input.subject_id),
            offer_key: Set(input.offer_key),
            status: Set(OfferStatus::Active),
            created_at: Set(input.created_at.into()),
            expires_at: Set(input.expires_at.map(Into::into)),
            finished_at: Set(None),
            initial_price: Set(input.initial_price),
            currency: Set(input.currency),
            message_chat_id: Set(None),
            message_id: Set(None),
            last_expiration_task_id: Set(None),
            updated_at: Set(None),
        };

        model.insert(self.db.as_ref()).await.map_err(map_insert_error)
    }

    /// Store the last displayed message and the armed expiration task.
    pub async fn set_display(
        &self,
        id: &str,
        location: Option<MessageLocation>,
        task_id: Option<String>,
    ) -> AppResult<()> {
        OfferInstance::update_many()
            .col_expr(
                offer_instance::Column::MessageChatId,
                Expr::value(location.map(|l| l.chat_id)),
            )
            .col_expr(
                offer_instance::Column::MessageId,
                Expr::value(location.map(|l| l.message_id)),
            )
            .col_expr(
                offer_instance::Column::LastExpirationTaskId,
                Expr::value(task_id),
            )
            .col_expr(
                offer_instance::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(offer_instance::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Clear the stored expiration task.
    pub async fn clear_task(&self, id: &str) -> AppResult<()> {
        OfferInstance::update_many()
            .col_expr(
                offer_instance::Column::LastExpirationTaskId,
                Expr::value(Option::<String>::None),
            )
            .filter(offer_instance::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Update the status only if the row is still in `from`.
    pub async fn compare_and_set_status(
        &self,
        id: &str,
        from: OfferStatus,
        to: OfferStatus,
        finished_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = OfferInstance::update_many()
            .col_expr(offer_instance::Column::Status, Expr::value(to.to_value()))
            .col_expr(
                offer_instance::Column::FinishedAt,
                Expr::value(finished_at.fixed_offset()),
            )
            .col_expr(
                offer_instance::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(offer_instance::Column::Id.eq(id))
            .filter(offer_instance::Column::Status.eq(from))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Move the instance to `Paid` unless it already is.
    pub async fn mark_paid(&self, id: &str, paid_at: DateTime<Utc>) -> AppResult<bool> {
        let result = OfferInstance::update_many()
            .col_expr(
                offer_instance::Column::Status,
                Expr::value(OfferStatus::Paid.to_value()),
            )
            .col_expr(
                offer_instance::Column::FinishedAt,
                Expr::value(paid_at.fixed_offset()),
            )
            .col_expr(
                offer_instance::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(offer_instance::Column::Id.eq(id))
            .filter(offer_instance::Column::Status.ne(OfferStatus::Paid))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }
}

fn map_insert_error(err: DbErr) -> AppError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => {
            AppError::Conflict(format!("Offer instance already exists: {detail}"))
        }
        _ => AppError::Database(err.to_string()),
    }
}

#[async_trait]
impl OfferStore for OfferInstanceRepository {
    async fn find_instance(
        &self,
        subject_id: i64,
        offer_key: &str,
    ) -> AppResult<Option<offer_instance::Model>> {
        self.find_by_subject_and_key(subject_id, offer_key).await
    }

    async fn find_instance_by_id(&self, id: &str) -> AppResult<Option<offer_instance::Model>> {
        self.find_by_id(id).await
    }

    async fn create_instance(&self, input: NewOfferInstance) -> AppResult<offer_instance::Model> {
        self.create(input).await
    }

    async fn record_display(
        &self,
        id: &str,
        location: Option<MessageLocation>,
        task_id: Option<String>,
    ) -> AppResult<()> {
        self.set_display(id, location, task_id).await
    }

    async fn clear_expiration_task(&self, id: &str) -> AppResult<()> {
        self.clear_task(id).await
    }

    async fn transition_instance(
        &self,
        id: &str,
        from: OfferStatus,
        to: OfferStatus,
        finished_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.compare_and_set_status(id, from, to, finished_at).await
    }

    async fn force_paid(&self, id: &str, paid_at: DateTime<Utc>) -> AppResult<bool> {
        self.mark_paid(id, paid_at).await
    }
}
