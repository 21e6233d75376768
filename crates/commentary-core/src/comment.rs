//! Comment payloads exchanged on a topic channel.
//!
//! Wire shapes:
//!
//! - join reply: `{ "comments": [ {content, user?: {email}}, ... ] }` → [`Snapshot`]
//! - live event `comments:<topic>:new`: `{ "comment": {...} }` → [`NewComment`]
//! - client push `comment:add`: `{ "content": "..." }` → [`AddComment`]
//!
//! The author is optional on the data model. The anonymous fallback only
//! exists at render time via [`Comment::author_label`].

use serde::{Deserialize, Serialize};

/// Label shown for comments without an author.
pub const ANONYMOUS_AUTHOR: &str = "Anonymous";

/// Client push event used to submit a comment.
pub const ADD_COMMENT_EVENT: &str = "comment:add";

/// Channel topic for a comment thread, e.g. `comments:42`.
#[must_use]
pub fn channel_topic(topic_id: &str) -> String {
    format!("comments:{topic_id}")
}

/// Live event name announcing a new comment, e.g. `comments:42:new`.
#[must_use]
pub fn new_comment_event(topic_id: &str) -> String {
    format!("comments:{topic_id}:new")
}

/// Author identity attached to a comment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAuthor {
    /// Author email.
    pub email: String,
}

/// A single comment as observed by the client. Immutable once received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Comment body text.
    pub content: String,
    /// Author, absent for anonymous comments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<CommentAuthor>,
}

impl Comment {
    /// Anonymous comment with the given content.
    #[must_use]
    pub fn anonymous(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            user: None,
        }
    }

    /// Comment attributed to `email`.
    #[must_use]
    pub fn by(content: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            user: Some(CommentAuthor {
                email: email.into(),
            }),
        }
    }

    /// Author email, if any.
    #[must_use]
    pub fn author_email(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.email.as_str())
    }

    /// Author email, or [`ANONYMOUS_AUTHOR`] for display.
    #[must_use]
    pub fn author_label(&self) -> &str {
        self.author_email().unwrap_or(ANONYMOUS_AUTHOR)
    }
}

/// Initial ordered comment history delivered by a successful join.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Comments in server order.
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Snapshot {
    /// Number of comments in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.comments.len()
    }

    /// Whether the snapshot holds no comments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

/// Payload of a live new-comment event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComment {
    /// The newly added comment.
    pub comment: Comment,
}

/// Payload of the `comment:add` client push.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddComment {
    /// Body text to submit.
    pub content: String,
}
