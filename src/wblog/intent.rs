use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::Record;
use super::RecordHandler;
use super::Topic;
use crate::db::Repository;
use crate::error::Result;
use crate::types::Action;

/// A write requested by a user, to be applied to the durable store asynchronously. Identifiers of rows to be created
/// are allocated by the producer so that a redelivered intent creates nothing new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    Favorite {
        favorite_id: i64,
        user_id:     i64,
        video_id:    i64,
        action:      Action,
    },
    Follow {
        relation_id: i64,
        follower_id: i64,
        author_id:   i64,
        action:      Action,
    },
    CreateComment {
        comment_id: i64,
        user_id:    i64,
        video_id:   i64,
        content:    String,
    },
    DeleteComment {
        comment_id: i64,
        video_id:   i64,
    },
}

impl Intent {
    pub fn topic(&self) -> Topic {
        match self {
            Intent::Favorite { .. } => Topic::Favorite,
            Intent::Follow { .. } => Topic::Relation,
            Intent::CreateComment { .. } | Intent::DeleteComment { .. } => Topic::Comment,
        }
    }

    /// The key which orders this intent against others touching the same rows.
    pub fn routing_key(&self) -> i64 {
        match self {
            Intent::Favorite { user_id, .. } => *user_id,
            Intent::Follow { follower_id, .. } => *follower_id,
            Intent::CreateComment { video_id, .. } | Intent::DeleteComment { video_id, .. } => *video_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Applies intents to the durable store. Redelivered intents are absorbed: creates ignore conflicts, deletes of
/// missing rows do nothing.
#[derive(Debug)]
pub struct IntentApplier {
    repo: Arc<Repository>,
}

impl IntentApplier {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    pub async fn apply(&self, intent: &Intent) -> Result<()> {
        let changed = match intent {
            Intent::Favorite {
                favorite_id,
                user_id,
                video_id,
                action: Action::Do,
            } => self.repo.insert_favorite(*favorite_id, *user_id, *video_id).await?,
            Intent::Favorite {
                user_id,
                video_id,
                action: Action::Undo,
                ..
            } => self.repo.delete_favorite(*user_id, *video_id).await?,
            Intent::Follow {
                relation_id,
                follower_id,
                author_id,
                action: Action::Do,
            } => self.repo.insert_follow(*relation_id, *follower_id, *author_id).await?,
            Intent::Follow {
                follower_id,
                author_id,
                action: Action::Undo,
                ..
            } => self.repo.delete_follow(*follower_id, *author_id).await?,
            Intent::CreateComment {
                comment_id,
                user_id,
                video_id,
                content,
            } => self.repo.insert_comment(*comment_id, *user_id, *video_id, content).await?,
            Intent::DeleteComment { comment_id, .. } => self.repo.delete_comment(*comment_id).await?,
        };

        if !changed {
            debug!("intent {intent:?} changed nothing");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordHandler for IntentApplier {
    async fn handle(&self, record: &Record) -> Result<()> {
        self.apply(&Intent::decode(&record.payload)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn undo_is_carried_as_negative_code() {
        let intent = Intent::Follow {
            relation_id: 11,
            follower_id: 1,
            author_id:   2,
            action:      Action::Undo,
        };
        let bytes = intent.encode().unwrap();
        assert_eq!(Intent::decode(&bytes).unwrap(), intent);
        assert_eq!(intent.topic(), Topic::Relation);
        assert_eq!(intent.routing_key(), 1);
    }

    #[tokio::test]
    async fn replayed_intents_are_absorbed() {
        let (_dir, repo) = crate::db::tests::sqlite_repo(None).await;
        let repo = Arc::new(repo);
        let applier = IntentApplier::new(repo.clone());

        let create = Intent::CreateComment {
            comment_id: 5,
            user_id:    1,
            video_id:   2,
            content:    "first".into(),
        };
        applier.apply(&create).await.unwrap();
        applier.apply(&create).await.unwrap();
        assert_eq!(repo.count(crate::types::Counter::VideoCommentCount, 2).await.unwrap(), 1);

        let delete = Intent::DeleteComment {
            comment_id: 5,
            video_id:   2,
        };
        applier.apply(&delete).await.unwrap();
        applier.apply(&delete).await.unwrap();
        assert_eq!(repo.count(crate::types::Counter::VideoCommentCount, 2).await.unwrap(), 0);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(Intent::decode(&[0xff, 0xff, 0xff]), Err(Error::Codec(_))));
    }
}
