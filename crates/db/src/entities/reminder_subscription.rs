//! Reminder subscription entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Reminder subscription status.
///
/// Every status other than `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ReminderStatus {
    /// Waiting for its task to fire.
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Delivered to the subject.
    #[sea_orm(string_value = "sent")]
    Sent,
    /// Fired but not delivered (subject unreachable or already converted).
    #[sea_orm(string_value = "skipped")]
    Skipped,
    /// Cancelled before firing.
    #[sea_orm(string_value = "canceled")]
    Canceled,
}

impl ReminderStatus {
    /// Whether the subscription can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One scheduled reminder of a chain.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reminder_subscription")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Subject (chat user) the reminder is addressed to.
    #[sea_orm(indexed)]
    pub subject_id: i64,

    /// Step delivered when the reminder fires.
    pub step_id: String,

    /// Scenario the chain belongs to.
    pub scenario_key: String,

    /// Current status.
    pub status: ReminderStatus,

    /// When the reminder is due.
    pub scheduled_at: DateTimeWithTimeZone,

    /// Queue task that delivers the reminder.
    #[sea_orm(nullable)]
    pub task_id: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
