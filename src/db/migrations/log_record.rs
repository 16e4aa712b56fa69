use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "log_record_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LogRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LogRecords::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LogRecords::Topic).string().not_null())
                    .col(ColumnDef::new(LogRecords::Partition).integer().not_null())
                    .col(ColumnDef::new(LogRecords::Key).big_integer().not_null())
                    .col(ColumnDef::new(LogRecords::Payload).blob().not_null())
                    .to_owned(),
            )
            .await?;

        // Consumers always look for the oldest record of their partition.
        manager
            .create_index(
                Index::create()
                    .name("idx-log_records-topic-partition-id")
                    .table(LogRecords::Table)
                    .col(LogRecords::Topic)
                    .col(LogRecords::Partition)
                    .col(LogRecords::Id)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(LogRecords::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum LogRecords {
    Table,
    Id,
    Topic,
    Partition,
    Key,
    Payload,
}
