use super::frame::{Socket, WsFrame, open_socket};
use crate::domain_model::*;
use crate::domain_port::*;
use futures_util::StreamExt;

/// Streams served at `{base_url}/streams/{key}?backlog=N`, one JSON message
/// per text frame.
pub struct WsStreamTransport {
    base_url: String,
    credential: Credential,
}

impl WsStreamTransport {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credential,
        }
    }
}

struct WsMessageFeed {
    stream_key: StreamKey,
    socket: Socket,
}

#[async_trait::async_trait]
impl MessageFeed for WsMessageFeed {
    async fn next(&mut self) -> Option<Result<Message, StreamError>> {
        loop {
            let frame = match self.socket.next().await? {
                Ok(message) => WsFrame::from(message),
                Err(e) => return Some(Err(StreamError::Transport(e.to_string()))),
            };
            match frame {
                WsFrame::Text(text) => match serde_json::from_str::<Message>(&text) {
                    Ok(message) => return Some(Ok(message)),
                    Err(e) => {
                        tracing::warn!(stream = %self.stream_key, "undecodable message dropped: {e}")
                    }
                },
                WsFrame::Close => return None,
                WsFrame::Binary(_) | WsFrame::Ping | WsFrame::Pong => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl StreamTransport for WsStreamTransport {
    async fn open(
        &self,
        stream_key: &StreamKey,
        backlog: usize,
    ) -> Result<Box<dyn MessageFeed>, StreamError> {
        let url = format!("{}/streams/{}?backlog={}", self.base_url, stream_key, backlog);
        let socket = open_socket(&url, &self.credential)
            .await
            .map_err(StreamError::Transport)?;
        Ok(Box::new(WsMessageFeed {
            stream_key: stream_key.clone(),
            socket,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn message(id: u64, body: &str) -> Message {
        Message {
            id: MessageId(id),
            room_stream_key: StreamKey::from("chats/a"),
            sender_id: UserId::from("u1"),
            sender_display_name: "Ann".to_owned(),
            sender_avatar_ref: None,
            content: MessageContent::Text {
                body: body.to_owned(),
            },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn opens_stream_path_and_yields_messages_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sent = vec![message(1, "hi"), message(2, "there")];
        let to_send = sent.clone();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut path = String::new();
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().to_string();
                Ok(resp)
            })
            .await
            .unwrap();
            for m in to_send {
                ws.send(WsMessage::Text(serde_json::to_string(&m).unwrap())).await.unwrap();
            }
            ws.send(WsMessage::Text("{broken".to_owned())).await.unwrap();
            let _ = ws.close(None).await;
            path
        });

        let transport = WsStreamTransport::new(format!("ws://{addr}/"), Credential("t1".to_owned()));
        let mut feed = transport.open(&StreamKey::from("chats/a"), 25).await.unwrap();
        assert_eq!(feed.next().await.unwrap().unwrap(), sent[0]);
        assert_eq!(feed.next().await.unwrap().unwrap(), sent[1]);
        assert!(feed.next().await.is_none());

        assert_eq!(server.await.unwrap(), "/streams/chats/a?backlog=25");
    }
}
