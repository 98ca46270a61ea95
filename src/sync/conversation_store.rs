use crate::domain_model::*;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnreadUpdate {
    /// Added to the stored counter. Ignored for the active room.
    Add(u32),
    /// Overwrites the stored counter.
    Reset(u32),
}

/// Merge input for [`ConversationStore::upsert`]. `None` fields keep the stored value.
#[derive(Debug, Clone)]
pub struct RoomMerge {
    pub id: RoomId,
    pub stream_key: Option<StreamKey>,
    pub kind: Option<RoomKind>,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
    pub members: Option<Vec<MemberSummary>>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: UnreadUpdate,
    /// `Some(None)` removes the watermark.
    pub client_cleared_at: Option<Option<DateTime<Utc>>>,
}

impl RoomMerge {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            stream_key: None,
            kind: None,
            display_name: None,
            avatar_ref: None,
            members: None,
            last_message_preview: None,
            last_message_at: None,
            unread: UnreadUpdate::Add(0),
            client_cleared_at: None,
        }
    }

    /// Authoritative REST row: server counters and watermark replace local ones.
    pub fn from_snapshot(room: ConversationRoom) -> Self {
        Self {
            id: room.id,
            stream_key: Some(room.stream_key),
            kind: Some(room.kind),
            display_name: Some(room.display_name),
            avatar_ref: room.avatar_ref,
            members: Some(room.members),
            last_message_preview: room.last_message_preview,
            last_message_at: room.last_message_at,
            unread: UnreadUpdate::Reset(room.unread_count),
            client_cleared_at: Some(room.client_cleared_at),
        }
    }

    /// Detail fetched to fill a room synthesized from an event; counters stay local.
    pub fn from_enrichment(room: ConversationRoom) -> Self {
        Self {
            unread: UnreadUpdate::Add(0),
            ..Self::from_snapshot(room)
        }
    }

    pub fn from_patch(id: RoomId, patch: RoomPatch, unread_delta: u32) -> Self {
        Self {
            id,
            stream_key: patch.stream_key,
            kind: patch.kind,
            display_name: patch.display_name,
            avatar_ref: patch.avatar_ref,
            members: patch.members,
            last_message_preview: patch.last_message_preview,
            last_message_at: patch.last_message_at,
            unread: UnreadUpdate::Add(unread_delta),
            client_cleared_at: patch.client_cleared_at.map(Some),
        }
    }
}

impl RoomMerge {
    /// Drops the fields (and the unread counter) that newer channel events already set.
    pub fn yielding_to(self, carried: &CarriedFields) -> Self {
        Self {
            stream_key: self.stream_key.filter(|_| !carried.stream_key),
            kind: self.kind.filter(|_| !carried.kind),
            display_name: self.display_name.filter(|_| !carried.display_name),
            avatar_ref: self.avatar_ref.filter(|_| !carried.avatar_ref),
            members: self.members.filter(|_| !carried.members),
            last_message_preview: self.last_message_preview.filter(|_| !carried.last_message),
            last_message_at: self.last_message_at.filter(|_| !carried.last_message),
            unread: UnreadUpdate::Add(0),
            client_cleared_at: self.client_cleared_at.filter(|_| !carried.client_cleared_at),
            ..self
        }
    }
}

/// Which room fields channel events have set, accumulated across patches.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CarriedFields {
    pub stream_key: bool,
    pub kind: bool,
    pub display_name: bool,
    pub avatar_ref: bool,
    pub members: bool,
    pub last_message: bool,
    pub client_cleared_at: bool,
}

impl CarriedFields {
    pub fn add(&mut self, patch: &RoomPatch) {
        self.stream_key |= patch.stream_key.is_some();
        self.kind |= patch.kind.is_some();
        self.display_name |= patch.display_name.is_some();
        self.avatar_ref |= patch.avatar_ref.is_some();
        self.members |= patch.members.is_some();
        self.last_message |= patch.last_message_at.is_some() || patch.last_message_preview.is_some();
        self.client_cleared_at |= patch.client_cleared_at.is_some();
    }
}

/// Immutable view handed to readers.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Recency first, ties broken by id.
    pub rooms: Vec<ConversationRoom>,
    pub active_room_id: Option<RoomId>,
    /// Visible messages of the active room, in stream order.
    pub active_feed: Vec<Message>,
    pub presence: BTreeMap<UserId, bool>,
    pub version: u64,
}

impl StoreSnapshot {
    pub fn room(&self, room_id: &RoomId) -> Option<&ConversationRoom> {
        self.rooms.iter().find(|room| &room.id == room_id)
    }

    pub fn total_unread(&self) -> u64 {
        self.rooms.iter().map(|room| room.unread_count as u64).sum()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|room| room.id.clone()).collect()
    }
}

/// Reconciled room state. Owned by a single writer; readers get [`StoreSnapshot`]s.
#[derive(Debug, Default)]
pub struct ConversationStore {
    rooms: HashMap<RoomId, ConversationRoom>,
    active: Option<RoomId>,
    feed: Vec<Message>,
    feed_seen: HashSet<MessageId>,
    presence: BTreeMap<UserId, bool>,
    version: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn get(&self, room_id: &RoomId) -> Option<&ConversationRoom> {
        self.rooms.get(room_id)
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn active_room_id(&self) -> Option<&RoomId> {
        self.active.as_ref()
    }

    fn is_active(&self, room_id: &RoomId) -> bool {
        self.active.as_ref() == Some(room_id)
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// Inserts or merges by id. Returns `true` when the room was new.
    pub fn upsert(&mut self, merge: RoomMerge) -> bool {
        let is_active = self.is_active(&merge.id);
        let inserted = match self.rooms.get_mut(&merge.id) {
            Some(room) => {
                if let Some(stream_key) = merge.stream_key {
                    room.stream_key = stream_key;
                }
                if let Some(kind) = merge.kind {
                    room.kind = kind;
                }
                if let Some(display_name) = merge.display_name {
                    room.display_name = display_name;
                }
                if let Some(avatar_ref) = merge.avatar_ref {
                    room.avatar_ref = Some(avatar_ref);
                }
                if let Some(members) = merge.members {
                    room.members = members;
                }
                if let Some(at) = merge.last_message_at {
                    if room.last_message_at.is_none_or(|current| at >= current) {
                        room.last_message_at = Some(at);
                        if let Some(preview) = merge.last_message_preview {
                            room.last_message_preview = Some(preview);
                        }
                    }
                } else if let Some(preview) = merge.last_message_preview {
                    room.last_message_preview = Some(preview);
                }
                match merge.unread {
                    UnreadUpdate::Add(n) if !is_active => {
                        room.unread_count = room.unread_count.saturating_add(n);
                    }
                    UnreadUpdate::Add(_) => {}
                    UnreadUpdate::Reset(n) => room.unread_count = n,
                }
                if let Some(cleared_at) = merge.client_cleared_at {
                    room.client_cleared_at = cleared_at;
                }
                false
            }
            None => {
                let unread_count = match merge.unread {
                    UnreadUpdate::Add(_) if is_active => 0,
                    UnreadUpdate::Add(n) | UnreadUpdate::Reset(n) => n,
                };
                let room = ConversationRoom {
                    stream_key: merge
                        .stream_key
                        .unwrap_or_else(|| StreamKey(merge.id.0.clone())),
                    kind: merge.kind.unwrap_or(RoomKind::Direct),
                    display_name: merge.display_name.unwrap_or_default(),
                    avatar_ref: merge.avatar_ref,
                    members: merge.members.unwrap_or_default(),
                    last_message_preview: merge.last_message_preview,
                    last_message_at: merge.last_message_at,
                    unread_count,
                    client_cleared_at: merge.client_cleared_at.flatten(),
                    id: merge.id.clone(),
                };
                self.rooms.insert(merge.id.clone(), room);
                true
            }
        };
        if is_active {
            self.filter_feed();
        }
        self.touch();
        inserted
    }

    pub fn remove(&mut self, room_id: &RoomId) -> Option<ConversationRoom> {
        let removed = self.rooms.remove(room_id)?;
        if self.is_active(room_id) {
            self.reset_active();
        }
        self.touch();
        Some(removed)
    }

    /// Records the active room and zeroes its unread counter. Returns `false`
    /// for a room the store does not contain, leaving the pointer unchanged.
    pub fn set_active(&mut self, room_id: Option<RoomId>) -> bool {
        match room_id {
            Some(room_id) => {
                let Some(room) = self.rooms.get_mut(&room_id) else {
                    return false;
                };
                room.unread_count = 0;
                if !self.is_active(&room_id) {
                    self.feed.clear();
                    self.feed_seen.clear();
                    self.active = Some(room_id);
                }
            }
            None => self.reset_active(),
        }
        self.touch();
        true
    }

    fn reset_active(&mut self) {
        self.active = None;
        self.feed.clear();
        self.feed_seen.clear();
    }

    pub fn increment_unread(&mut self, room_id: &RoomId, n: u32) {
        if self.is_active(room_id) {
            return;
        }
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.unread_count = room.unread_count.saturating_add(n);
            self.touch();
        }
    }

    pub fn clear_unread(&mut self, room_id: &RoomId) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            if room.unread_count != 0 {
                room.unread_count = 0;
                self.touch();
            }
        }
    }

    /// One-sided history clear: new watermark, and the recency fields are reset.
    pub fn clear_history(&mut self, room_id: &RoomId, cleared_at: DateTime<Utc>) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        room.client_cleared_at = Some(cleared_at);
        room.last_message_preview = None;
        room.last_message_at = None;
        if self.is_active(room_id) {
            self.filter_feed();
        }
        self.touch();
        true
    }

    /// Moves the watermark without touching recency fields.
    pub fn set_cleared_at(&mut self, room_id: &RoomId, cleared_at: Option<DateTime<Utc>>) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if room.client_cleared_at == cleared_at {
            return false;
        }
        room.client_cleared_at = cleared_at;
        if self.is_active(room_id) {
            self.filter_feed();
        }
        self.touch();
        true
    }

    /// Appends a live message of the active room. Returns `false` when the
    /// message was dropped (other stream, under the watermark, or already seen).
    pub fn push_active_message(&mut self, message: Message) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        let Some(room) = self.rooms.get_mut(active) else {
            return false;
        };
        if room.stream_key != message.room_stream_key || room.is_cleared(message.timestamp) {
            return false;
        }
        if !self.feed_seen.insert(message.id) {
            return false;
        }
        if room
            .last_message_at
            .is_none_or(|current| message.timestamp >= current)
        {
            room.last_message_at = Some(message.timestamp);
            room.last_message_preview = Some(message.preview());
        }
        self.feed.push(message);
        self.touch();
        true
    }

    fn filter_feed(&mut self) {
        let Some(room) = self.active.as_ref().and_then(|id| self.rooms.get(id)) else {
            return;
        };
        self.feed.retain(|message| !room.is_cleared(message.timestamp));
    }

    pub fn set_presence(&mut self, user_id: UserId, online: bool) {
        if self.presence.insert(user_id, online) != Some(online) {
            self.touch();
        }
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&ConversationRoom) -> bool,
    {
        let before = self.rooms.len();
        self.rooms.retain(|_, room| keep(room));
        if self.rooms.len() != before {
            if let Some(active) = self.active.clone() {
                if !self.rooms.contains_key(&active) {
                    self.reset_active();
                }
            }
            self.touch();
        }
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
        self.presence.clear();
        self.reset_active();
        self.touch();
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut rooms: Vec<ConversationRoom> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        StoreSnapshot {
            rooms,
            active_room_id: self.active.clone(),
            active_feed: self.feed.clone(),
            presence: self.presence.clone(),
            version: self.version,
        }
    }
}
