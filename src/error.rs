use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::types::EntityKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Business conflicts detected synchronously, before an intent is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("video is already favorited")]
    AlreadyFavorited,
    #[error("video is not favorited")]
    NotFavorited,
    #[error("user is already followed")]
    AlreadyFollowing,
    #[error("user is not followed")]
    NotFollowing,
    #[error("follow limit exceeded")]
    FollowLimitExceeded,
    #[error("users cannot follow themselves")]
    SelfFollow,
    #[error("user name is taken")]
    UserExists,
    #[error("comment belongs to another user")]
    NotCommentOwner,
}

impl Conflict {
    pub fn response_code(&self) -> i32 {
        match self {
            Conflict::UserExists => 10_001,
            Conflict::AlreadyFollowing => 20_001,
            Conflict::NotFollowing => 20_002,
            Conflict::FollowLimitExceeded => 20_003,
            Conflict::SelfFollow => 20_004,
            Conflict::AlreadyFavorited => 30_001,
            Conflict::NotFavorited => 30_002,
            Conflict::NotCommentOwner => 40_001,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} {1} does not exist")]
    NotFound(EntityKind, i64),

    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// Transient failures survived the bounded retries.
    #[error("server busy after {attempts} attempts")]
    Busy {
        attempts: u32,
        #[source]
        source:   Box<Error>,
    },

    #[error("cache store: {0}")]
    Store(String),

    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),

    #[error("event codec: {0}")]
    Codec(#[from] postcard::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("log broker: {0}")]
    Log(String),

    #[error("malformed change event: {0}")]
    MalformedChange(String),

    #[error("clock moved backwards by {0:?}")]
    ClockRollback(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A failure of a coalesced load, shared by every waiter of that load.
    #[error("{0}")]
    Coalesced(Arc<Error>),
}

impl Error {
    /// Failures worth retrying at the call site: the remote side may recover.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(_) | Error::Log(_) => true,
            Error::Db(err) => matches!(
                err,
                sea_orm::DbErr::Conn(_) | sea_orm::DbErr::ConnectionAcquire(_) | sea_orm::DbErr::Exec(_)
            ),
            Error::Coalesced(inner) => inner.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(..) => true,
            Error::Coalesced(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    pub fn conflict(&self) -> Option<Conflict> {
        match self {
            Error::Conflict(c) => Some(*c),
            Error::Coalesced(inner) => inner.conflict(),
            _ => None,
        }
    }

    /// Code shown to end users. Infrastructure failures collapse into one generic code so no internal detail leaks.
    pub fn response_code(&self) -> i32 {
        if let Some(conflict) = self.conflict() {
            return conflict.response_code();
        }
        match self {
            Error::NotFound(EntityKind::User, _) => 10_002,
            Error::NotFound(EntityKind::Video, _) => 30_003,
            Error::NotFound(EntityKind::Comment, _) => 40_002,
            Error::Coalesced(inner) if inner.is_not_found() => inner.response_code(),
            _ => 50_000,
        }
    }
}

impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Self {
        Error::Coalesced(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_keep_their_code_through_coalescing() {
        let err = Error::Coalesced(Arc::new(Error::Conflict(Conflict::AlreadyFavorited)));
        assert_eq!(err.conflict(), Some(Conflict::AlreadyFavorited));
        assert_eq!(err.response_code(), 30_001);
    }

    #[test]
    fn infrastructure_failures_are_generic() {
        let err = Error::Busy {
            attempts: 3,
            source:   Box::new(Error::Store("connection reset".into())),
        };
        assert_eq!(err.response_code(), 50_000);
        assert!(!err.is_transient());
        assert!(Error::Store("timeout".into()).is_transient());
        assert_eq!(Error::NotFound(EntityKind::Video, 7).response_code(), 30_003);
    }
}
