//! Offer instance entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Offer instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum OfferStatus {
    /// Shown and not yet resolved.
    #[sea_orm(string_value = "active")]
    Active,
    /// Timed out.
    #[sea_orm(string_value = "expired")]
    Expired,
    /// Paid for.
    #[sea_orm(string_value = "paid")]
    Paid,
    /// Withdrawn.
    #[sea_orm(string_value = "canceled")]
    Canceled,
}

impl OfferStatus {
    /// Whether the offer was resolved by the subject or an operator.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Paid | Self::Canceled)
    }
}

/// A subject's one-shot exposure to an offer.
///
/// At most one row exists per `(subject_id, offer_key)`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "offer_instance")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub subject_id: i64,

    pub offer_key: String,

    pub status: OfferStatus,

    pub created_at: DateTimeWithTimeZone,

    /// When the offer disappears; `None` means never.
    #[sea_orm(nullable)]
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// When the offer left the active state.
    #[sea_orm(nullable)]
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Price snapshot in minor currency units.
    pub initial_price: i64,

    pub currency: String,

    /// Chat of the last displayed offer message.
    #[sea_orm(nullable)]
    pub message_chat_id: Option<i64>,

    /// Last displayed offer message.
    #[sea_orm(nullable)]
    pub message_id: Option<i32>,

    /// Queue task that expires the offer.
    #[sea_orm(nullable)]
    pub last_expiration_task_id: Option<String>,

    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
