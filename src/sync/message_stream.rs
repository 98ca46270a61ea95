use crate::domain_model::*;
use crate::domain_port::*;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// One open stream subscription.
///
/// Closing is idempotent and also happens on drop. Callback invocation and
/// [`SubscriptionHandle::close`] share a gate, so once `close` returns no
/// callback for this handle is running or will run.
pub struct SubscriptionHandle {
    id: u64,
    stream_key: StreamKey,
    gate: Arc<Mutex<bool>>,
    cancel: CancellationToken,
    ended: CancellationToken,
    open_count: Arc<AtomicUsize>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.stream_key
    }

    pub fn is_closed(&self) -> bool {
        !*self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn close(&self) {
        let mut open = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if *open {
            *open = false;
            self.cancel.cancel();
            self.open_count.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(subscription = self.id, stream = %self.stream_key, "subscription closed");
        }
    }

    /// Resolves once the feed stopped, whether closed locally or ended remotely.
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("stream_key", &self.stream_key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct MessageStreamClient {
    transport: Arc<dyn StreamTransport>,
    backlog: usize,
    next_id: AtomicU64,
    open_count: Arc<AtomicUsize>,
}

impl MessageStreamClient {
    pub fn new(transport: Arc<dyn StreamTransport>, backlog: usize) -> Self {
        Self {
            transport,
            backlog,
            next_id: AtomicU64::new(1),
            open_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opens `stream_key` and starts delivering to `on_message`: first up to
    /// `backlog` recent messages, then live appends. Messages whose id does not
    /// advance past the last delivered one are skipped.
    pub async fn subscribe<F>(
        &self,
        stream_key: &StreamKey,
        on_message: F,
    ) -> Result<SubscriptionHandle, StreamError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let feed = self.transport.open(stream_key, self.backlog).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let gate = Arc::new(Mutex::new(true));
        let cancel = CancellationToken::new();
        let ended = CancellationToken::new();
        self.open_count.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(pump(
            id,
            stream_key.clone(),
            feed,
            Box::new(on_message),
            gate.clone(),
            cancel.clone(),
            ended.clone(),
        ));
        tracing::debug!(subscription = id, stream = %stream_key, backlog = self.backlog, "subscribed");

        Ok(SubscriptionHandle {
            id,
            stream_key: stream_key.clone(),
            gate,
            cancel,
            ended,
            open_count: self.open_count.clone(),
        })
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        handle.close();
    }

    pub fn open_subscriptions(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

async fn pump(
    id: u64,
    stream_key: StreamKey,
    mut feed: Box<dyn MessageFeed>,
    on_message: Box<dyn Fn(Message) + Send + Sync>,
    gate: Arc<Mutex<bool>>,
    cancel: CancellationToken,
    ended: CancellationToken,
) {
    let mut last_delivered: Option<MessageId> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = feed.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::warn!(subscription = id, stream = %stream_key, "stream feed failed: {e}");
                break;
            }
            None => {
                tracing::debug!(subscription = id, stream = %stream_key, "stream feed ended");
                break;
            }
        };

        if last_delivered.is_some_and(|last| message.id <= last) {
            tracing::trace!(subscription = id, message = %message.id, "skipping already delivered message");
            continue;
        }
        last_delivered = Some(message.id);

        let open = gate.lock().unwrap_or_else(|e| e.into_inner());
        if !*open {
            break;
        }
        on_message(message);
    }

    ended.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::InMemoryMessageStreams;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn text(body: &str) -> Message {
        Message {
            id: MessageId(0),
            room_stream_key: StreamKey::from("unset"),
            sender_id: UserId::from("u1"),
            sender_display_name: "Ann".to_owned(),
            sender_avatar_ref: None,
            content: MessageContent::Text {
                body: body.to_owned(),
            },
            timestamp: Utc::now(),
        }
    }

    fn body(message: &Message) -> &str {
        match &message.content {
            MessageContent::Text { body } => body,
            MessageContent::Media { media_ref, .. } => media_ref,
        }
    }

    #[tokio::test]
    async fn delivers_bounded_backlog_then_live_messages_in_order() {
        let streams = Arc::new(InMemoryMessageStreams::new());
        let key = StreamKey::from("chats/a");
        for i in 0..5 {
            streams.publish(&key, text(&format!("old-{i}")));
        }

        let client = MessageStreamClient::new(streams.clone(), 2);
        let (tx, mut rx) = unbounded_channel();
        let handle = client
            .subscribe(&key, move |m| {
                let _ = tx.send(m);
            })
            .await
            .unwrap();
        streams.publish(&key, text("live"));

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(rx.recv().await.unwrap());
        }
        let bodies: Vec<_> = got.iter().map(body).collect();
        assert_eq!(bodies, vec!["old-3", "old-4", "live"]);
        assert!(got.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(client.open_subscriptions(), 1);
        client.unsubscribe(handle);
        assert_eq!(client.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn no_callback_after_close() {
        let streams = Arc::new(InMemoryMessageStreams::new());
        let key = StreamKey::from("chats/a");
        let client = MessageStreamClient::new(streams.clone(), 10);
        let (tx, mut rx) = unbounded_channel();
        let handle = client
            .subscribe(&key, move |m| {
                let _ = tx.send(m);
            })
            .await
            .unwrap();

        handle.close();
        handle.close();
        assert!(handle.is_closed());
        streams.publish(&key, text("late"));
        handle.ended().await;

        assert!(rx.recv().await.is_none());
        assert_eq!(client.open_subscriptions(), 0);
        assert_eq!(streams.live_feeds(&key), 0);
    }

    #[tokio::test]
    async fn dropping_the_handle_closes_it() {
        let streams = Arc::new(InMemoryMessageStreams::new());
        let key = StreamKey::from("chats/a");
        let client = MessageStreamClient::new(streams.clone(), 10);
        {
            let _handle = client.subscribe(&key, |_| {}).await.unwrap();
            assert_eq!(client.open_subscriptions(), 1);
        }
        assert_eq!(client.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn remote_end_resolves_ended_without_closing() {
        let streams = Arc::new(InMemoryMessageStreams::new());
        let key = StreamKey::from("chats/a");
        let client = MessageStreamClient::new(streams.clone(), 10);
        let handle = client.subscribe(&key, |_| {}).await.unwrap();

        streams.disconnect_feeds(&key);
        tokio::time::timeout(Duration::from_secs(1), handle.ended())
            .await
            .unwrap();
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let streams = Arc::new(InMemoryMessageStreams::new());
        streams.fail_next_opens(1);
        let client = MessageStreamClient::new(streams.clone(), 10);
        let result = client.subscribe(&StreamKey::from("chats/a"), |_| {}).await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
        assert_eq!(client.open_subscriptions(), 0);
    }
}
