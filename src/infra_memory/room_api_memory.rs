use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Default)]
pub struct InMemoryRoomApi {
    rooms: Mutex<Vec<ConversationRoom>>,
    read_marks: Mutex<Vec<RoomId>>,
    list_calls: AtomicUsize,
    failing_lists: AtomicUsize,
    failing_fetches: AtomicUsize,
    mark_read_fails: AtomicBool,
    list_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl InMemoryRoomApi {
    pub fn new(rooms: Vec<ConversationRoom>) -> Self {
        Self {
            rooms: Mutex::new(rooms),
            ..Default::default()
        }
    }

    pub fn set_rooms(&self, rooms: Vec<ConversationRoom>) {
        *self.rooms.lock().unwrap_or_else(|e| e.into_inner()) = rooms;
    }

    pub fn upsert_room(&self, room: ConversationRoom) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        match rooms.iter_mut().find(|r| r.id == room.id) {
            Some(existing) => *existing = room,
            None => rooms.push(room),
        }
    }

    pub fn remove_room(&self, room_id: &RoomId) {
        self.rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| &r.id != room_id);
    }

    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_mark_read(&self, fail: bool) {
        self.mark_read_fails.store(fail, Ordering::SeqCst);
    }

    /// Listings taken from now on capture the rooms, then wait for [`Self::release_lists`].
    pub fn hold_lists(&self) {
        *self.list_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_lists(&self) {
        if let Some(gate) = self.list_gate.lock().unwrap_or_else(|e| e.into_inner()).take() {
            gate.close();
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn read_marks(&self) -> Vec<RoomId> {
        self.read_marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl RoomApi for InMemoryRoomApi {
    async fn list_rooms(&self) -> Result<Vec<ConversationRoom>, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_lists) {
            return Err(FetchError::Transport("connection refused".to_owned()));
        }
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let gate = self.list_gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(gate) = gate {
            // a closed gate fails the acquire, which is the release signal
            let _ = gate.acquire().await;
        }
        Ok(rooms)
    }

    async fn fetch_room(&self, room_id: &RoomId) -> Result<ConversationRoom, FetchError> {
        if Self::take_failure(&self.failing_fetches) {
            return Err(FetchError::Status(503));
        }
        self.rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| &r.id == room_id)
            .cloned()
            .ok_or(FetchError::NotFound)
    }

    async fn mark_read(&self, room_id: &RoomId) -> Result<(), FetchError> {
        if self.mark_read_fails.load(Ordering::SeqCst) {
            return Err(FetchError::Status(500));
        }
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.iter_mut().find(|r| &r.id == room_id) {
            room.unread_count = 0;
        }
        self.read_marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(room_id.clone());
        Ok(())
    }

    async fn clear_history(&self, room_id: &RoomId) -> Result<DateTime<Utc>, FetchError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .iter_mut()
            .find(|r| &r.id == room_id)
            .ok_or(FetchError::NotFound)?;
        let now = Utc::now();
        room.client_cleared_at = Some(now);
        room.last_message_at = None;
        room.last_message_preview = None;
        Ok(now)
    }
}
