//! Subject entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Reachability and conversion flags of a chat user.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subject")]
pub struct Model {
    /// Chat user id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,

    /// False once the transport reported the user as permanently unreachable.
    pub is_reachable: bool,

    #[sea_orm(nullable)]
    pub unreachable_reason: Option<String>,

    #[sea_orm(nullable)]
    pub unreachable_at: Option<DateTimeWithTimeZone>,

    /// Set once the subject paid for anything.
    #[sea_orm(nullable)]
    pub converted_at: Option<DateTimeWithTimeZone>,

    /// Membership in the configured group as of the last sweep.
    #[sea_orm(nullable)]
    pub is_member: Option<bool>,

    #[sea_orm(nullable)]
    pub checked_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Whether the subject already converted.
    #[must_use]
    pub const fn has_converted(&self) -> bool {
        self.converted_at.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
