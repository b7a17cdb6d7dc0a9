//! Create reminder subscription table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ReminderSubscription::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ReminderSubscription::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ReminderSubscription::SubjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReminderSubscription::StepId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReminderSubscription::ScenarioKey)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReminderSubscription::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ReminderSubscription::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ReminderSubscription::TaskId).string().null())
                    .col(
                        ColumnDef::new(ReminderSubscription::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReminderSubscription::UpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Cancellation sweeps load every pending row of one subject.
        manager
            .create_index(
                Index::create()
                    .name("idx_reminder_subscription_subject_status")
                    .table(ReminderSubscription::Table)
                    .col(ReminderSubscription::SubjectId)
                    .col(ReminderSubscription::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ReminderSubscription::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ReminderSubscription {
    Table,
    Id,
    SubjectId,
    StepId,
    ScenarioKey,
    Status,
    ScheduledAt,
    TaskId,
    CreatedAt,
    UpdatedAt,
}
