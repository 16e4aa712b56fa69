use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "follow_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Relations::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Relations::Id).big_integer().not_null().primary_key())
                    .col(ColumnDef::new(Relations::FollowerId).big_integer().not_null())
                    .col(ColumnDef::new(Relations::AuthorId).big_integer().not_null())
                    .index(
                        Index::create()
                            .name("idx-relations-unique-follower-author")
                            .col(Relations::FollowerId)
                            .col(Relations::AuthorId)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-relations-author_id")
                    .table(Relations::Table)
                    .col(Relations::AuthorId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Relations::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum Relations {
    Table,
    Id,
    FollowerId,
    AuthorId,
}
