use crate::domain_model::*;
use crate::domain_port::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

struct LiveConnection {
    id: u64,
    credential: Credential,
    tx: UnboundedSender<ChannelEvent>,
    topics: HashSet<TopicKind>,
}

#[derive(Default)]
struct PushServerState {
    connection: Option<LiveConnection>,
    next_connection_id: u64,
    connects: usize,
    failing_connects: usize,
    rejected: HashSet<String>,
}

/// Push server living in the same process. At most one client connection at a
/// time; a new connect replaces the previous one.
#[derive(Clone, Default)]
pub struct InMemoryPushServer {
    state: Arc<Mutex<PushServerState>>,
}

impl InMemoryPushServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PushServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delivers `event` if a client is connected and subscribed to its topic.
    pub fn push(&self, event: ChannelEvent) -> bool {
        let state = self.lock();
        match &state.connection {
            Some(conn) if conn.topics.contains(&event.topic()) => conn.tx.send(event).is_ok(),
            _ => false,
        }
    }

    /// Drops the live connection; the client sees its feed end.
    pub fn drop_connection(&self) {
        self.lock().connection = None;
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// Refuses future connects presenting this credential.
    pub fn reject_credential(&self, credential: &Credential) {
        self.lock().rejected.insert(credential.0.clone());
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub fn connected_credential(&self) -> Option<Credential> {
        self.lock().connection.as_ref().map(|c| c.credential.clone())
    }

    pub fn subscribed_topics(&self) -> HashSet<TopicKind> {
        self.lock()
            .connection
            .as_ref()
            .map(|c| c.topics.clone())
            .unwrap_or_default()
    }
}

struct MemoryPushConnection {
    id: u64,
    rx: UnboundedReceiver<ChannelEvent>,
    server: InMemoryPushServer,
}

#[async_trait::async_trait]
impl PushConnection for MemoryPushConnection {
    async fn subscribe(&mut self, topic: TopicKind) -> Result<(), ChannelError> {
        let mut state = self.server.lock();
        match state.connection.as_mut() {
            Some(conn) if conn.id == self.id => {
                conn.topics.insert(topic);
                Ok(())
            }
            _ => Err(ChannelError::Closed),
        }
    }

    async fn next(&mut self) -> Option<Result<ChannelEvent, ChannelError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        let mut state = self.server.lock();
        if state.connection.as_ref().is_some_and(|c| c.id == self.id) {
            state.connection = None;
        }
        self.rx.close();
    }
}

#[async_trait::async_trait]
impl PushTransport for InMemoryPushServer {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn PushConnection>, ChannelError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ChannelError::Transport("connection refused".to_owned()));
        }
        if state.rejected.contains(&credential.0) {
            return Err(ChannelError::Transport("401 unauthorized".to_owned()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (tx, rx) = unbounded_channel();
        state.connection = Some(LiveConnection {
            id,
            credential: credential.clone(),
            tx,
            topics: HashSet::new(),
        });
        drop(state);

        Ok(Box::new(MemoryPushConnection {
            id,
            rx,
            server: self.clone(),
        }))
    }
}
