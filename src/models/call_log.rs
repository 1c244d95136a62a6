use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    integer, pk_auto, string, string_null, timestamp_with_time_zone,
    timestamp_with_time_zone_null,
};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "call_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    /// When the attempt started, UTC.
    pub timestamp: DateTimeUtc,
    pub direction: String,
    pub status: String,
    pub caller_id: Option<String>,
    /// Digits as dialled, before speed-dial expansion.
    pub dialed_number: Option<String>,
    /// Destination actually handed to the signalling client.
    pub destination: Option<String>,
    pub speed_dial_code: Option<String>,
    pub duration_seconds: i32,
    pub answered_at: Option<DateTimeUtc>,
    pub ended_at: Option<DateTimeUtc>,
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(pk_auto(Column::Id))
                    .col(timestamp_with_time_zone(Column::Timestamp))
                    .col(string(Column::Direction).char_len(16))
                    .col(string(Column::Status).char_len(16))
                    .col(string_null(Column::CallerId).char_len(64))
                    .col(string_null(Column::DialedNumber).char_len(32))
                    .col(string_null(Column::Destination).char_len(64))
                    .col(string_null(Column::SpeedDialCode).char_len(4))
                    .col(integer(Column::DurationSeconds).not_null().default(0))
                    .col(timestamp_with_time_zone_null(Column::AnsweredAt))
                    .col(timestamp_with_time_zone_null(Column::EndedAt))
                    .col(string_null(Column::ErrorMessage).char_len(255))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_call_logs_timestamp")
                    .table(Entity)
                    .col(Column::Timestamp)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_call_logs_status")
                    .table(Entity)
                    .col(Column::Status)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Entity).to_owned())
            .await
    }
}
