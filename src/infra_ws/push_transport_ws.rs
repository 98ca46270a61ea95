use super::frame::{Socket, WsFrame, open_socket};
use crate::domain_model::*;
use crate::domain_port::*;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub struct WsPushTransport {
    url: String,
}

impl WsPushTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

struct WsPushConnection {
    socket: Socket,
}

#[async_trait::async_trait]
impl PushConnection for WsPushConnection {
    async fn subscribe(&mut self, topic: TopicKind) -> Result<(), ChannelError> {
        let frame = serde_json::to_string(&ClientFrame::Subscribe { topic })
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        self.socket
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn next(&mut self) -> Option<Result<ChannelEvent, ChannelError>> {
        loop {
            let message = match self.socket.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            };

            match WsFrame::from(message) {
                WsFrame::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Event(event)) => return Some(Ok(event)),
                    Ok(ServerFrame::Subscribed(topic)) => {
                        tracing::debug!(%topic, "push server confirmed subscription");
                    }
                    Ok(ServerFrame::Error(reason)) => {
                        tracing::warn!("push server error: {reason}");
                    }
                    Err(e) => tracing::warn!("undecodable push frame dropped: {e}"),
                },
                WsFrame::Close => return None,
                WsFrame::Binary(_) => tracing::debug!("binary push frame ignored"),
                WsFrame::Ping | WsFrame::Pong => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            tracing::debug!("push socket close: {e}");
        }
    }
}

#[async_trait::async_trait]
impl PushTransport for WsPushTransport {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn PushConnection>, ChannelError> {
        let socket = open_socket(&self.url, credential)
            .await
            .map_err(ChannelError::Transport)?;
        tracing::debug!(url = %self.url, "push socket open");
        Ok(Box::new(WsPushConnection { socket }))
    }
}
