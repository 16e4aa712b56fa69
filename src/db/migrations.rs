pub mod comment;
pub mod favorite;
pub mod follow;
pub mod log_record;
pub mod user;
pub mod video;

use sea_orm_migration::prelude::*;

pub struct Migrator;

impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(user::Migration),
            Box::new(video::Migration),
            Box::new(favorite::Migration),
            Box::new(follow::Migration),
            Box::new(comment::Migration),
            Box::new(log_record::Migration),
        ]
    }
}
