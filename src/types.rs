use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumIter;
use strum::IntoStaticStr;

// Common prefix of every key the engine puts into the shared cache store.
const KEY_PREFIX: &str = "reel:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    User,
    Video,
    Comment,
}

/// The aggregate counters. Each one belongs to exactly one entity kind, so the name alone identifies the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr, Serialize, Deserialize)]
pub enum Counter {
    #[strum(serialize = "user:favorite_count")]
    UserFavoriteCount,
    #[strum(serialize = "user:total_favorited")]
    UserTotalFavorited,
    #[strum(serialize = "user:follow_count")]
    UserFollowCount,
    #[strum(serialize = "user:follower_count")]
    UserFollowerCount,
    #[strum(serialize = "user:work_count")]
    UserWorkCount,
    #[strum(serialize = "video:favorite_count")]
    VideoFavoriteCount,
    #[strum(serialize = "video:comment_count")]
    VideoCommentCount,
}

impl Counter {
    pub fn kind(&self) -> EntityKind {
        match self {
            Counter::VideoFavoriteCount | Counter::VideoCommentCount => EntityKind::Video,
            _ => EntityKind::User,
        }
    }

    pub fn cache_key(&self, key: i64) -> String {
        format!("{KEY_PREFIX}{self}:{key}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr, Serialize, Deserialize)]
pub enum Relation {
    /// Videos a user liked.
    #[strum(serialize = "user:favorite")]
    Favorites,
    /// Users a user follows.
    #[strum(serialize = "user:follow")]
    Follows,
    /// Users following a user. Only the first page is ever cached.
    #[strum(serialize = "user:follower")]
    Followers,
    /// Mutual follows.
    #[strum(serialize = "user:friend")]
    Friends,
}

impl Relation {
    pub fn cache_key(&self, owner: i64) -> String {
        format!("{KEY_PREFIX}{self}:{owner}")
    }

    pub fn is_capped(&self) -> bool {
        matches!(self, Relation::Followers)
    }
}

/// Cache keys for whole-entity blobs.
pub fn info_key(kind: EntityKind, key: i64) -> String {
    format!("{KEY_PREFIX}{kind}:info:{key}")
}

/// Signed action code carried by favorite and follow intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Action {
    Do,
    Undo,
}

impl Action {
    pub fn code(&self) -> i8 {
        match self {
            Action::Do => 1,
            Action::Undo => -1,
        }
    }

    pub fn delta(&self) -> i64 {
        self.code() as i64
    }
}

impl From<Action> for i8 {
    fn from(action: Action) -> Self {
        action.code()
    }
}

impl TryFrom<i8> for Action {
    type Error = String;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Action::Do),
            -1 => Ok(Action::Undo),
            other => Err(format!("unknown action code {other}")),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:+}", self.code())
    }
}
