use sea_orm::entity::prelude::*;

/// A record of the durable write-behind log. The auto-assigned id is the record offset.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "log_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id:        i64,
    pub topic:     String,
    pub partition: i32,
    pub key:       i64,
    pub payload:   Vec<u8>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
