use crate::domain_model::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("credential was revoked, a fresh one is required")]
    CredentialRevoked,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    Closed,
}

#[async_trait::async_trait]
pub trait PushConnection: Send {
    async fn subscribe(&mut self, topic: TopicKind) -> Result<(), ChannelError>;
    /// `None` once the server side is gone.
    async fn next(&mut self) -> Option<Result<ChannelEvent, ChannelError>>;
    async fn close(&mut self);
}

#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, credential: &Credential)
    -> Result<Box<dyn PushConnection>, ChannelError>;
}
