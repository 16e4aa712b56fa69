pub mod comment;
pub mod favorite;
pub mod follow;
pub mod log_record;
pub mod user;
pub mod video;

pub use comment::Model as Comment;
pub use favorite::Model as Favorite;
pub use follow::Model as Follow;
pub use log_record::Model as LogRecord;
pub use user::Model as User;
pub use video::Model as Video;
