use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "video_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Videos::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Videos::Id).big_integer().not_null().primary_key())
                    .col(ColumnDef::new(Videos::AuthorId).big_integer().not_null())
                    .col(ColumnDef::new(Videos::Title).string().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-videos-author_id")
                    .table(Videos::Table)
                    .col(Videos::AuthorId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Videos::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum Videos {
    Table,
    Id,
    AuthorId,
    Title,
}
