use crate::domain_model::*;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("room not found")]
    NotFound,
}

/// REST collaborator for the current user's rooms.
#[async_trait::async_trait]
pub trait RoomApi: Send + Sync {
    /// `GET /rooms`
    async fn list_rooms(&self) -> Result<Vec<ConversationRoom>, FetchError>;
    /// `GET /rooms/{id}`
    async fn fetch_room(&self, room_id: &RoomId) -> Result<ConversationRoom, FetchError>;
    /// `POST /rooms/{id}/read`
    async fn mark_read(&self, room_id: &RoomId) -> Result<(), FetchError>;
    /// `POST /rooms/{id}/clear`, returns the new clear watermark.
    async fn clear_history(&self, room_id: &RoomId) -> Result<DateTime<Utc>, FetchError>;
}
