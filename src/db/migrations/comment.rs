use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "comment_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Comments::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Comments::Id).big_integer().not_null().primary_key())
                    .col(ColumnDef::new(Comments::UserId).big_integer().not_null())
                    .col(ColumnDef::new(Comments::VideoId).big_integer().not_null())
                    .col(ColumnDef::new(Comments::Content).text().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-comments-video_id")
                    .table(Comments::Table)
                    .col(Comments::VideoId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Comments::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum Comments {
    Table,
    Id,
    UserId,
    VideoId,
    Content,
}
