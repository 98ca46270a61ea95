use crate::domain_model::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("stream closed")]
    Closed,
}

/// Ordered feed of one stream: the backlog first, then live appends.
#[async_trait::async_trait]
pub trait MessageFeed: Send {
    async fn next(&mut self) -> Option<Result<Message, StreamError>>;
}

#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens `stream_key` seeded with at most `backlog` of its most recent messages.
    async fn open(
        &self,
        stream_key: &StreamKey,
        backlog: usize,
    ) -> Result<Box<dyn MessageFeed>, StreamError>;
}
