use crate::domain_model::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    RoomMetadata,
    Presence,
    Session,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopicKind::RoomMetadata => "room_metadata",
            TopicKind::Presence => "presence",
            TopicKind::Session => "session",
        };
        f.write_str(name)
    }
}

/// Transport-provided event id, used to drop re-deliveries.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomEventKind {
    Updated,
    Removed,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadataEvent {
    #[serde(default)]
    pub event_id: Option<EventId>,
    pub kind: RoomEventKind,
    pub room_id: RoomId,
    #[serde(default)]
    pub patch: RoomPatch,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionEvent {
    Revoked {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    RoomMetadata(RoomMetadataEvent),
    Presence(PresenceEvent),
    Session(SessionEvent),
}

impl ChannelEvent {
    pub fn topic(&self) -> TopicKind {
        match self {
            ChannelEvent::RoomMetadata(_) => TopicKind::RoomMetadata,
            ChannelEvent::Presence(_) => TopicKind::Presence,
            ChannelEvent::Session(_) => TopicKind::Session,
        }
    }

    pub fn is_revocation(&self) -> bool {
        matches!(self, ChannelEvent::Session(SessionEvent::Revoked { .. }))
    }
}

// region wire frames

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe { topic: TopicKind },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum ServerFrame {
    Event(ChannelEvent),
    Subscribed(TopicKind),
    Error(String),
}

// endregion

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_frame_decodes() {
        let json = r#"{
            "type": "event",
            "content": {
                "topic": "room_metadata",
                "event": {
                    "eventId": "ev-1",
                    "kind": "updated",
                    "roomId": "r1",
                    "patch": {"unreadDelta": 2}
                }
            }
        }"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        let ServerFrame::Event(event) = frame else {
            panic!("expected event frame");
        };
        assert_eq!(event.topic(), TopicKind::RoomMetadata);
        let ChannelEvent::RoomMetadata(meta) = event else {
            panic!("expected metadata event");
        };
        assert_eq!(meta.event_id, Some(EventId("ev-1".to_owned())));
        assert_eq!(meta.patch.unread_delta, Some(2));
        assert!(meta.patch.display_name.is_none());
    }

    #[test]
    fn removed_event_without_patch_decodes() {
        let json = r#"{"topic": "room_metadata", "event": {"kind": "removed", "roomId": "r9"}}"#;
        let event: ChannelEvent = serde_json::from_str(json).unwrap();
        let ChannelEvent::RoomMetadata(meta) = event else {
            panic!("expected metadata event");
        };
        assert_eq!(meta.kind, RoomEventKind::Removed);
        assert_eq!(meta.patch, RoomPatch::default());
    }

    #[test]
    fn subscribe_frame_encodes() {
        let frame = ClientFrame::Subscribe {
            topic: TopicKind::Presence,
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"subscribe","topic":"presence"}"#
        );
    }

    #[test]
    fn revocation_is_recognised() {
        let event = ChannelEvent::Session(SessionEvent::Revoked { reason: None });
        assert!(event.is_revocation());
        assert_eq!(event.topic(), TopicKind::Session);
    }
}
