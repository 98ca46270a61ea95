use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const PREVIEW_MAX_CHARS: usize = 80;

/// Stream-assigned sequence, monotonic within one stream.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    Media {
        media_ref: String,
        media_kind: MediaKind,
    },
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_stream_key: StreamKey,
    pub sender_id: UserId,
    pub sender_display_name: String,
    #[serde(default)]
    pub sender_avatar_ref: Option<String>,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn preview(&self) -> String {
        match &self.content {
            MessageContent::Text { body } => {
                if body.chars().count() <= PREVIEW_MAX_CHARS {
                    body.clone()
                } else {
                    let mut preview: String = body.chars().take(PREVIEW_MAX_CHARS).collect();
                    preview.push('…');
                    preview
                }
            }
            MessageContent::Media { media_kind, .. } => match media_kind {
                MediaKind::Image => "[image]".to_owned(),
                MediaKind::Video => "[video]".to_owned(),
            },
        }
    }
}
