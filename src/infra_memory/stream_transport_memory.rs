use crate::domain_model::*;
use crate::domain_port::*;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Default)]
struct StreamLog {
    messages: Vec<Message>,
    next_id: u64,
    subscribers: Vec<UnboundedSender<Message>>,
}

/// Append-only streams keyed by [`StreamKey`]. Backlog capture and live
/// registration happen under the same entry lock, so a feed never misses or
/// repeats a message across the boundary.
#[derive(Default)]
pub struct InMemoryMessageStreams {
    streams: DashMap<StreamKey, StreamLog>,
    failing_opens: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
}

impl InMemoryMessageStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the stream, assigning the next id. Returns the stored message.
    pub fn publish(&self, stream_key: &StreamKey, mut message: Message) -> Message {
        let mut log = self.streams.entry(stream_key.clone()).or_default();
        log.next_id += 1;
        message.id = MessageId(log.next_id);
        message.room_stream_key = stream_key.clone();
        log.messages.push(message.clone());
        log.subscribers
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());
        message
    }

    /// Number of feeds still attached to the stream.
    pub fn live_feeds(&self, stream_key: &StreamKey) -> usize {
        self.streams
            .get(stream_key)
            .map(|log| log.subscribers.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Ends every feed of the stream, as a dropped server connection would.
    pub fn disconnect_feeds(&self, stream_key: &StreamKey) {
        if let Some(mut log) = self.streams.get_mut(stream_key) {
            log.subscribers.clear();
        }
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }
}

struct MemoryFeed {
    backlog: VecDeque<Message>,
    live: UnboundedReceiver<Message>,
}

#[async_trait::async_trait]
impl MessageFeed for MemoryFeed {
    async fn next(&mut self) -> Option<Result<Message, StreamError>> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(Ok(message));
        }
        self.live.recv().await.map(Ok)
    }
}

#[async_trait::async_trait]
impl StreamTransport for InMemoryMessageStreams {
    async fn open(
        &self,
        stream_key: &StreamKey,
        backlog: usize,
    ) -> Result<Box<dyn MessageFeed>, StreamError> {
        let delay = *self.open_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StreamError::Transport("stream unavailable".to_owned()));
        }

        let (tx, rx) = unbounded_channel();
        let mut log = self.streams.entry(stream_key.clone()).or_default();
        let skip = log.messages.len().saturating_sub(backlog);
        let seed: VecDeque<Message> = log.messages[skip..].iter().cloned().collect();
        log.subscribers.push(tx);

        Ok(Box::new(MemoryFeed {
            backlog: seed,
            live: rx,
        }))
    }
}
