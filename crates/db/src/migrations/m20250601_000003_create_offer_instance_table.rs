//! Create offer instance table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OfferInstance::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OfferInstance::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OfferInstance::SubjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OfferInstance::OfferKey).string().not_null())
                    .col(
                        ColumnDef::new(OfferInstance::Status)
                            .string_len(16)
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(OfferInstance::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OfferInstance::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OfferInstance::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OfferInstance::InitialPrice)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OfferInstance::Currency).string_len(8).not_null())
                    .col(ColumnDef::new(OfferInstance::MessageChatId).big_integer().null())
                    .col(ColumnDef::new(OfferInstance::MessageId).integer().null())
                    .col(
                        ColumnDef::new(OfferInstance::LastExpirationTaskId)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OfferInstance::UpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One instance per subject and offer, ever.
        manager
            .create_index(
                Index::create()
                    .name("uq_offer_instance_subject_offer")
                    .table(OfferInstance::Table)
                    .col(OfferInstance::SubjectId)
                    .col(OfferInstance::OfferKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OfferInstance::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OfferInstance {
    Table,
    Id,
    SubjectId,
    OfferKey,
    Status,
    CreatedAt,
    ExpiresAt,
    FinishedAt,
    InitialPrice,
    Currency,
    MessageChatId,
    MessageId,
    LastExpirationTaskId,
    UpdatedAt,
}
