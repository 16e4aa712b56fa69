use sea_orm::entity::prelude::*;
use serde::Deserialize;
use serde::Serialize;

/// `follower_id` follows `author_id`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "relations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id:          i64,
    pub follower_id: i64,
    pub author_id:   i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
