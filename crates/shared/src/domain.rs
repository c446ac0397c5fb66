use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(PostId);
id_newtype!(ReviewId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LikeKind {
    GroupPost,
    Review,
}

impl LikeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LikeKind::GroupPost => "group_post",
            LikeKind::Review => "review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "group_post" => Some(LikeKind::GroupPost),
            "review" => Some(LikeKind::Review),
            _ => None,
        }
    }
}

/// Something a user can like. Each kind is backed by its own join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LikeTarget {
    GroupPost(PostId),
    Review(ReviewId),
}

impl LikeTarget {
    pub fn new(kind: LikeKind, id: i64) -> Self {
        match kind {
            LikeKind::GroupPost => LikeTarget::GroupPost(PostId(id)),
            LikeKind::Review => LikeTarget::Review(ReviewId(id)),
        }
    }

    pub fn kind(self) -> LikeKind {
        match self {
            LikeTarget::GroupPost(_) => LikeKind::GroupPost,
            LikeTarget::Review(_) => LikeKind::Review,
        }
    }

    pub fn raw_id(self) -> i64 {
        match self {
            LikeTarget::GroupPost(id) => id.0,
            LikeTarget::Review(id) => id.0,
        }
    }
}

impl fmt::Display for LikeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.raw_id())
    }
}

/// Realtime broadcast topic. Like events go out on both the per-target and
/// the per-group topic so list views and detail views update alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum BroadcastTopic {
    Target { target: LikeTarget },
    Group { group_id: GroupId },
}

impl fmt::Display for BroadcastTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastTopic::Target { target } => write!(f, "likes:{target}"),
            BroadcastTopic::Group { group_id } => write!(f, "likes:group:{}", group_id.0),
        }
    }
}
