use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "favorite_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Favorites::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Favorites::Id).big_integer().not_null().primary_key())
                    .col(ColumnDef::new(Favorites::UserId).big_integer().not_null())
                    .col(ColumnDef::new(Favorites::VideoId).big_integer().not_null())
                    .index(
                        Index::create()
                            .name("idx-favorites-unique-user-video")
                            .col(Favorites::UserId)
                            .col(Favorites::VideoId)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-favorites-video_id")
                    .table(Favorites::Table)
                    .col(Favorites::VideoId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Favorites::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum Favorites {
    Table,
    Id,
    UserId,
    VideoId,
}
