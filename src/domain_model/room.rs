use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Transport-level handle of a room's message stream. Distinct from [`RoomId`].
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(pub String);

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRoom {
    pub id: RoomId,
    pub stream_key: StreamKey,
    pub kind: RoomKind,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub members: Vec<MemberSummary>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    /// Messages at or before this instant are hidden on this client.
    #[serde(default)]
    pub client_cleared_at: Option<DateTime<Utc>>,
}

impl ConversationRoom {
    /// Whether a message sent at `timestamp` falls under the clear watermark.
    pub fn is_cleared(&self, timestamp: DateTime<Utc>) -> bool {
        self.client_cleared_at
            .is_some_and(|cleared_at| timestamp <= cleared_at)
    }
}

/// Partial room fields carried by a metadata event. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomPatch {
    pub stream_key: Option<StreamKey>,
    pub kind: Option<RoomKind>,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
    pub members: Option<Vec<MemberSummary>>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_delta: Option<u32>,
    pub client_cleared_at: Option<DateTime<Utc>>,
}

impl RoomPatch {
    /// Whether a room synthesized from this patch alone would lack detail worth fetching.
    pub fn is_incomplete(&self) -> bool {
        self.stream_key.is_none()
            || self.display_name.is_none()
            || self.avatar_ref.is_none()
            || (self.kind != Some(RoomKind::Direct) && self.members.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn watermark_boundary_is_inclusive_on_the_cleared_side() {
        let cleared_at = Utc.timestamp_opt(100, 0).unwrap();
        let room = ConversationRoom {
            id: RoomId::from("r1"),
            stream_key: StreamKey::from("s1"),
            kind: RoomKind::Direct,
            display_name: "r1".to_owned(),
            avatar_ref: None,
            members: Vec::new(),
            last_message_preview: None,
            last_message_at: None,
            unread_count: 0,
            client_cleared_at: Some(cleared_at),
        };

        assert!(room.is_cleared(cleared_at));
        assert!(!room.is_cleared(cleared_at + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn snapshot_json_uses_camel_case() {
        let json = r#"{
            "id": "r1",
            "streamKey": "chats/r1",
            "kind": "group",
            "displayName": "Book club",
            "members": [{"id": "u1", "displayName": "Ann", "role": "owner"}],
            "lastMessageAt": "2024-05-01T10:00:00Z",
            "unreadCount": 3,
            "clientClearedAt": null
        }"#;
        let room: ConversationRoom = serde_json::from_str(json).unwrap();
        assert_eq!(room.stream_key, StreamKey::from("chats/r1"));
        assert_eq!(room.kind, RoomKind::Group);
        assert_eq!(room.members[0].role, MemberRole::Owner);
        assert_eq!(room.unread_count, 3);
        assert!(room.client_cleared_at.is_none());
    }

    #[test]
    fn direct_patch_without_members_is_complete() {
        let patch = RoomPatch {
            stream_key: Some(StreamKey::from("s")),
            kind: Some(RoomKind::Direct),
            display_name: Some("Bob".to_owned()),
            avatar_ref: Some("avatars/bob.png".to_owned()),
            ..Default::default()
        };
        assert!(!patch.is_incomplete());
        assert!(RoomPatch::default().is_incomplete());
    }
}
