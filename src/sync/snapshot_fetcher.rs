use crate::domain_model::*;
use crate::domain_port::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Authoritative room listing. No caching and no retries; the caller owns the
/// retry policy.
#[derive(Clone)]
pub struct RoomSnapshotFetcher {
    api: Arc<dyn RoomApi>,
    timeout: Duration,
}

impl RoomSnapshotFetcher {
    pub fn new(api: Arc<dyn RoomApi>, timeout: Duration) -> Self {
        Self { api, timeout }
    }

    pub async fn fetch_rooms(&self) -> Result<Vec<ConversationRoom>, FetchError> {
        let rooms = tokio::time::timeout(self.timeout, self.api.list_rooms())
            .await
            .map_err(|_| FetchError::Timeout)??;

        let mut seen = HashSet::with_capacity(rooms.len());
        let rooms: Vec<ConversationRoom> = rooms
            .into_iter()
            .filter(|room| {
                let fresh = seen.insert(room.id.clone());
                if !fresh {
                    tracing::warn!(room = %room.id, "duplicate room in snapshot, keeping the first");
                }
                fresh
            })
            .collect();

        tracing::debug!(rooms = rooms.len(), "room snapshot fetched");
        Ok(rooms)
    }
}
