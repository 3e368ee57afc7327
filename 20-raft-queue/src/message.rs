//! Queue entries and the payload carried by the node binary.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// A single queue entry wrapping one payload value.
///
/// `Message::default()` is the zero-value message handed out for an empty
/// receive at the HTTP boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<T> {
    pub data: T,
}

impl<T> Message<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

/// A chat-style comment, the payload type served by the `node` binary.
///
/// Missing fields decode as empty, and JSON leaves empty fields out. The log
/// and snapshots use bincode, which always carries all three.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub timestamp: Option<DateTime<Utc>>,
    pub author: String,
    pub content: String,
}

impl Comment {
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            author: author.into(),
            content: content.into(),
        }
    }
}

impl Serialize for Comment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Positional formats cannot skip fields.
        let omit_empty = serializer.is_human_readable();
        let timestamp = !omit_empty || self.timestamp.is_some();
        let author = !omit_empty || !self.author.is_empty();
        let content = !omit_empty || !self.content.is_empty();
        let len = [timestamp, author, content].iter().filter(|kept| **kept).count();

        let mut state = serializer.serialize_struct("Comment", len)?;
        if timestamp {
            state.serialize_field("timestamp", &self.timestamp)?;
        } else {
            state.skip_field("timestamp")?;
        }
        if author {
            state.serialize_field("author", &self.author)?;
        } else {
            state.skip_field("author")?;
        }
        if content {
            state.serialize_field("content", &self.content)?;
        } else {
            state.skip_field("content")?;
        }
        state.end()
    }
}
