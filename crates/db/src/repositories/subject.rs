//! Subject repository.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use herald_common::{AppError, AppResult};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::entities::subject;
use crate::entities::Subject;
use crate::gateway::SubjectStore;

/// Subject repository for database operations.
///
/// Subjects are created when they enter a step or see an offer, or the first
/// time a flag is recorded for them.
#[derive(Clone)]
pub struct SubjectRepository {
    db: Arc<DatabaseConnection>,
}

impl SubjectRepository {
    /// Create a new subject repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a subject by ID.
    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<subject::Model>> {
        Subject::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Reachable subjects after a cursor, ascending by id.
    pub async fn find_reachable_after(
        &self,
        after: Option<i64>,
        limit: u64,
    ) -> AppResult<Vec<subject::Model>> {
        let mut query = Subject::find().filter(subject::Column::IsReachable.eq(true));

        if let Some(after) = after {
            query = query.filter(subject::Column::Id.gt(after));
        }

        query
            .order_by_asc(subject::Column::Id)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Insert the subject or update the given columns of the existing row.
    async fn upsert(
        &self,
        model: subject::ActiveModel,
        columns: impl IntoIterator<Item = subject::Column>,
    ) -> AppResult<()> {
        Subject::insert(model)
            .on_conflict(
                OnConflict::column(subject::Column::Id)
                    .update_columns(columns)
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    fn blank(id: i64) -> subject::ActiveModel {
        let now = Utc::now();
        subject::ActiveModel {
            id: Set(id),
            is_reachable: Set(true),
            unreachable_reason: Set(None),
            unreachable_at: Set(None),
            converted_at: Set(None),
            is_member: Set(None),
            checked_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(Some(now.into())),
        }
    }
}

#[async_trait]
impl SubjectStore for SubjectRepository {
    async fn find_subject(&self, id: i64) -> AppResult<Option<subject::Model>> {
        self.find_by_id(id).await
    }

    async fn touch(&self, id: i64) -> AppResult<()> {
        Subject::insert(Self::blank(id))
            .on_conflict(
                OnConflict::column(subject::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_unreachable(&self, id: i64, reason: &str) -> AppResult<()> {
        let mut model = Self::blank(id);
        model.is_reachable = Set(false);
        model.unreachable_reason = Set(Some(reason.to_string()));
        model.unreachable_at = Set(Some(Utc::now().into()));

        self.upsert(
            model,
            [
                subject::Column::IsReachable,
                subject::Column::UnreachableReason,
                subject::Column::UnreachableAt,
                subject::Column::UpdatedAt,
            ],
        )
        .await
    }

    async fn mark_converted(&self, id: i64) -> AppResult<()> {
        let mut model = Self::blank(id);
        model.converted_at = Set(Some(Utc::now().into()));

        self.upsert(
            model,
            [subject::Column::ConvertedAt, subject::Column::UpdatedAt],
        )
        .await
    }

    async fn record_membership(&self, id: i64, is_member: bool) -> AppResult<()> {
        let mut model = Self::blank(id);
        model.is_member = Set(Some(is_member));
        model.checked_at = Set(Some(Utc::now().into()));

        self.upsert(
            model,
            [
                subject::Column::IsMember,
                subject::Column::CheckedAt,
                subject::Column::UpdatedAt,
            ],
        )
        .await
    }

    async fn list_reachable(
        &self,
        after: Option<i64>,
        limit: u64,
    ) -> AppResult<Vec<subject::Model>> {
        self.find_reachable_after(after, limit).await
    }
}
