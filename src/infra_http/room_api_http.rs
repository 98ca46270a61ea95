use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearedResponse {
    client_cleared_at: DateTime<Utc>,
}

/// [`RoomApi`] over the backend's REST endpoints.
pub struct HttpRoomApi {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpRoomApi {
    pub fn new(
        base_url: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self {
            client,
            base_url,
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
        let response = request
            .header(AUTHORIZATION, self.credential.bearer())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status => {
                tracing::debug!(%status, url = %response.url(), "room api request rejected");
                Err(FetchError::Status(status.as_u16()))
            }
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, FetchError> {
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Decode(e.to_string())
            }
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::Decode(e.to_string())
    } else {
        FetchError::Transport(e.to_string())
    }
}

#[async_trait::async_trait]
impl RoomApi for HttpRoomApi {
    async fn list_rooms(&self) -> Result<Vec<ConversationRoom>, FetchError> {
        let response = self.send(self.client.get(self.url("/rooms"))).await?;
        Self::decode(response).await
    }

    async fn fetch_room(&self, room_id: &RoomId) -> Result<ConversationRoom, FetchError> {
        let url = self.url(&format!("/rooms/{room_id}"));
        let response = self.send(self.client.get(url)).await?;
        Self::decode(response).await
    }

    async fn mark_read(&self, room_id: &RoomId) -> Result<(), FetchError> {
        let url = self.url(&format!("/rooms/{room_id}/read"));
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn clear_history(&self, room_id: &RoomId) -> Result<DateTime<Utc>, FetchError> {
        let url = self.url(&format!("/rooms/{room_id}/clear"));
        let response = self.send(self.client.post(url)).await?;
        let cleared: ClearedResponse = Self::decode(response).await?;
        Ok(cleared.client_cleared_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers one canned response per connection, returning the request heads.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api/v1/", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let mut heads = Vec::new();
            for (status, body) in responses {
                let (mut tcp, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let n = tcp.read(&mut buf).await.unwrap();
                heads.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                let response = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                tcp.write_all(response.as_bytes()).await.unwrap();
            }
            heads
        });
        (base, task)
    }

    fn api(base: String) -> HttpRoomApi {
        HttpRoomApi::new(base, Credential("t1".to_owned()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lists_rooms_with_bearer_credential() {
        let body = r#"[{"id":"r1","streamKey":"chats/r1","kind":"group","displayName":"Team","unreadCount":2}]"#;
        let (base, server) = serve(vec![(200, body)]).await;

        let rooms = api(base).list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].stream_key, StreamKey::from("chats/r1"));
        assert_eq!(rooms[0].unread_count, 2);

        let heads = server.await.unwrap();
        assert!(heads[0].starts_with("GET /api/v1/rooms HTTP/1.1"));
        assert!(heads[0].to_ascii_lowercase().contains("authorization: bearer t1"));
    }

    #[tokio::test]
    async fn maps_statuses_and_bad_bodies() {
        let (base, server) = serve(vec![(404, "{}"), (503, ""), (200, "not json")]).await;
        let api = api(base);
        let room = RoomId::from("r1");

        assert!(matches!(api.fetch_room(&room).await, Err(FetchError::NotFound)));
        assert!(matches!(api.mark_read(&room).await, Err(FetchError::Status(503))));
        assert!(matches!(api.fetch_room(&room).await, Err(FetchError::Decode(_))));

        let heads = server.await.unwrap();
        assert!(heads[1].starts_with("POST /api/v1/rooms/r1/read"));
    }

    #[tokio::test]
    async fn clear_history_returns_server_watermark() {
        let (base, _server) =
            serve(vec![(200, r#"{"clientClearedAt":"2024-05-01T10:00:00Z"}"#)]).await;
        let cleared = api(base).clear_history(&RoomId::from("r1")).await.unwrap();
        assert_eq!(cleared.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
