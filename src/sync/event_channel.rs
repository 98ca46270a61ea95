use crate::domain_model::*;
use crate::domain_port::*;
use crate::sync::{Backoff, BackoffConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, retry_in: Duration },
    Disconnected,
    Revoked,
}

#[async_trait::async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, event: &ChannelEvent) -> anyhow::Result<()>;
}

type HandlerMap = HashMap<TopicKind, Vec<Arc<dyn TopicHandler>>>;

enum Control {
    Subscribe(TopicKind),
}

struct Supervisor {
    cancel: CancellationToken,
    control: UnboundedSender<Control>,
    task: JoinHandle<()>,
}

/// Caller's view of one `connect` call.
pub struct ConnectionHandle {
    status: watch::Receiver<ChannelStatus>,
}

impl ConnectionHandle {
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }
}

#[derive(Clone)]
struct SupervisorContext {
    transport: Arc<dyn PushTransport>,
    backoff: BackoffConfig,
    handlers: Arc<RwLock<HandlerMap>>,
    status: Arc<watch::Sender<ChannelStatus>>,
    revoked: Arc<Mutex<Option<Credential>>>,
}

/// Durable push connection with typed topic dispatch.
///
/// Subscription intent survives reconnects: every registered topic is
/// subscribed again before the status turns `Connected`. Events pushed while
/// disconnected are not replayed.
pub struct EventChannel {
    ctx: SupervisorContext,
    supervisor: Mutex<Option<Supervisor>>,
}

impl EventChannel {
    pub fn new(transport: Arc<dyn PushTransport>, backoff: BackoffConfig) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Idle);
        Self {
            ctx: SupervisorContext {
                transport,
                backoff,
                handlers: Arc::new(RwLock::new(HashMap::new())),
                status: Arc::new(status),
                revoked: Arc::new(Mutex::new(None)),
            },
            supervisor: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.ctx.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.ctx.status.subscribe()
    }

    pub fn on_topic(&self, topic: TopicKind, handler: Arc<dyn TopicHandler>) {
        let is_new_topic = {
            let mut handlers = self.ctx.handlers.write().unwrap_or_else(|e| e.into_inner());
            let list = handlers.entry(topic).or_default();
            list.push(handler);
            list.len() == 1
        };
        if is_new_topic {
            let supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(supervisor) = supervisor.as_ref() {
                let _ = supervisor.control.send(Control::Subscribe(topic));
            }
        }
    }

    pub fn registered_topics(&self) -> Vec<TopicKind> {
        self.ctx.registered_topics()
    }

    /// Starts the connection supervisor. Returns immediately; progress is
    /// reported through the handle's status.
    pub fn connect(&self, credential: Credential) -> Result<ConnectionHandle, ChannelError> {
        {
            let mut revoked = self.ctx.revoked.lock().unwrap_or_else(|e| e.into_inner());
            if revoked.as_ref() == Some(&credential) {
                return Err(ChannelError::CredentialRevoked);
            }
            *revoked = None;
        }

        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = unbounded_channel();
        let task = tokio::spawn(supervise(
            self.ctx.clone(),
            credential,
            control_rx,
            cancel.clone(),
        ));

        let previous = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Supervisor {
                cancel,
                control: control_tx,
                task,
            });
        if let Some(previous) = previous {
            tracing::debug!("replacing running channel supervisor");
            previous.cancel.cancel();
            previous.task.abort();
        }

        Ok(ConnectionHandle {
            status: self.ctx.status.subscribe(),
        })
    }

    pub async fn disconnect(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.task.await {
                tracing::error!("channel supervisor panicked: {e}");
            }
        }
    }

    /// Non-blocking variant of [`EventChannel::disconnect`] for drop paths.
    /// The connection is dropped without a close handshake.
    pub fn abort(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            supervisor.task.abort();
            self.ctx.set_status(ChannelStatus::Disconnected);
            tracing::warn!("channel supervisor aborted");
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        let supervisor = self
            .supervisor
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
        }
    }
}

impl SupervisorContext {
    fn set_status(&self, status: ChannelStatus) {
        self.status.send_replace(status);
    }

    fn registered_topics(&self) -> Vec<TopicKind> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(topic, _)| *topic)
            .collect()
    }

    async fn dispatch(&self, event: &ChannelEvent) {
        let handlers: Vec<Arc<dyn TopicHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.topic())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!(topic = %event.topic(), "topic handler failed: {e:#}");
            }
        }
    }

    /// Sleeps for the next backoff delay. Returns `false` if cancelled meanwhile.
    async fn wait_backoff(&self, backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
        let delay = backoff.next_delay();
        self.set_status(ChannelStatus::Reconnecting {
            attempt: backoff.attempt(),
            retry_in: delay,
        });
        tracing::info!(attempt = backoff.attempt(), "channel reconnecting in {:?}", delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

enum PumpExit {
    Cancelled,
    Dropped,
    Revoked,
}

async fn supervise(
    ctx: SupervisorContext,
    credential: Credential,
    mut control: UnboundedReceiver<Control>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(ctx.backoff);
    ctx.set_status(ChannelStatus::Connecting);

    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            connected = ctx.transport.connect(&credential) => connected,
        };

        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("channel connect failed: {e}");
                if ctx.wait_backoff(&mut backoff, &cancel).await {
                    continue;
                }
                break;
            }
        };

        if let Err(e) = resubscribe(&ctx, conn.as_mut()).await {
            tracing::warn!("channel resubscribe failed: {e}");
            conn.close().await;
            if ctx.wait_backoff(&mut backoff, &cancel).await {
                continue;
            }
            break;
        }

        backoff.reset();
        ctx.set_status(ChannelStatus::Connected);
        tracing::info!("channel connected");

        match pump(&ctx, conn.as_mut(), &mut control, &cancel).await {
            PumpExit::Cancelled => {
                conn.close().await;
                break;
            }
            PumpExit::Revoked => {
                conn.close().await;
                *ctx.revoked.lock().unwrap_or_else(|e| e.into_inner()) = Some(credential);
                ctx.set_status(ChannelStatus::Revoked);
                tracing::warn!("session revoked, channel closed");
                return;
            }
            PumpExit::Dropped => {
                tracing::warn!("channel connection dropped");
                if !ctx.wait_backoff(&mut backoff, &cancel).await {
                    break;
                }
            }
        }
    }

    ctx.set_status(ChannelStatus::Disconnected);
    tracing::info!("channel disconnected");
}

async fn resubscribe(
    ctx: &SupervisorContext,
    conn: &mut dyn PushConnection,
) -> Result<(), ChannelError> {
    for topic in ctx.registered_topics() {
        conn.subscribe(topic).await?;
        tracing::debug!(%topic, "subscribed");
    }
    Ok(())
}

async fn pump(
    ctx: &SupervisorContext,
    conn: &mut dyn PushConnection,
    control: &mut UnboundedReceiver<Control>,
    cancel: &CancellationToken,
) -> PumpExit {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            Some(Control::Subscribe(topic)) = control.recv() => {
                if let Err(e) = conn.subscribe(topic).await {
                    tracing::warn!(%topic, "late subscribe failed: {e}");
                    return PumpExit::Dropped;
                }
                tracing::debug!(%topic, "subscribed");
            }
            next = conn.next() => match next {
                Some(Ok(event)) => {
                    ctx.dispatch(&event).await;
                    if event.is_revocation() {
                        return PumpExit::Revoked;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("channel read failed: {e}");
                    return PumpExit::Dropped;
                }
                None => return PumpExit::Dropped,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::InMemoryPushServer;
    use tokio::sync::mpsc::UnboundedSender;

    struct Collect(UnboundedSender<ChannelEvent>);

    #[async_trait::async_trait]
    impl TopicHandler for Collect {
        async fn handle(&self, event: &ChannelEvent) -> anyhow::Result<()> {
            self.0.send(event.clone())?;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl TopicHandler for Failing {
        async fn handle(&self, _event: &ChannelEvent) -> anyhow::Result<()> {
            anyhow::bail!("handler broke")
        }
    }

    fn presence(user: &str, online: bool) -> ChannelEvent {
        ChannelEvent::Presence(PresenceEvent {
            user_id: UserId::from(user),
            online,
        })
    }

    fn credential(token: &str) -> Credential {
        Credential(token.to_owned())
    }

    async fn wait_status(rx: &mut watch::Receiver<ChannelStatus>, expected: ChannelStatus) {
        rx.wait_for(|status| *status == expected).await.unwrap();
        rx.borrow_and_update();
    }

    #[tokio::test]
    async fn subscribes_before_connected_and_preserves_order() {
        let server = InMemoryPushServer::new();
        let channel = EventChannel::new(Arc::new(server.clone()), BackoffConfig::default());
        let (tx, mut rx) = unbounded_channel();
        let collect: Arc<dyn TopicHandler> = Arc::new(Collect(tx));
        channel.on_topic(TopicKind::Presence, collect.clone());
        channel.on_topic(TopicKind::Session, collect);

        let handle = channel.connect(credential("t1")).unwrap();
        let mut status = handle.watch();
        wait_status(&mut status, ChannelStatus::Connected).await;
        assert!(server.subscribed_topics().contains(&TopicKind::Presence));
        assert!(server.subscribed_topics().contains(&TopicKind::Session));

        for i in 0..5 {
            assert!(server.push(presence(&format!("u{i}"), true)));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), presence(&format!("u{i}"), true));
        }
        channel.disconnect().await;
        assert_eq!(channel.status(), ChannelStatus::Disconnected);
        assert!(!server.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_and_resubscribes() {
        let server = InMemoryPushServer::new();
        let channel = EventChannel::new(
            Arc::new(server.clone()),
            BackoffConfig {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(4),
            },
        );
        let (tx, mut rx) = unbounded_channel();
        channel.on_topic(TopicKind::Presence, Arc::new(Collect(tx)));
        let handle = channel.connect(credential("t1")).unwrap();
        let mut status = handle.watch();
        wait_status(&mut status, ChannelStatus::Connected).await;

        server.fail_next_connects(3);
        server.drop_connection();
        let mut delays = Vec::new();
        loop {
            status.changed().await.unwrap();
            match status.borrow_and_update().clone() {
                ChannelStatus::Reconnecting { retry_in, .. } => delays.push(retry_in.as_secs()),
                ChannelStatus::Connected => break,
                _ => {}
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 4]);
        assert_eq!(server.connect_count(), 5);
        assert!(server.subscribed_topics().contains(&TopicKind::Presence));

        assert!(server.push(presence("u1", false)));
        assert_eq!(rx.recv().await.unwrap(), presence("u1", false));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn late_registration_subscribes_on_live_connection() {
        let server = InMemoryPushServer::new();
        let channel = EventChannel::new(Arc::new(server.clone()), BackoffConfig::default());
        let handle = channel.connect(credential("t1")).unwrap();
        let mut status = handle.watch();
        wait_status(&mut status, ChannelStatus::Connected).await;
        assert!(server.subscribed_topics().is_empty());

        let (tx, mut rx) = unbounded_channel();
        channel.on_topic(TopicKind::Presence, Arc::new(Collect(tx)));
        while !server.subscribed_topics().contains(&TopicKind::Presence) {
            tokio::task::yield_now().await;
        }
        assert!(server.push(presence("u1", true)));
        assert_eq!(rx.recv().await.unwrap(), presence("u1", true));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_dispatch() {
        let server = InMemoryPushServer::new();
        let channel = EventChannel::new(Arc::new(server.clone()), BackoffConfig::default());
        let (tx, mut rx) = unbounded_channel();
        channel.on_topic(TopicKind::Presence, Arc::new(Failing));
        channel.on_topic(TopicKind::Presence, Arc::new(Collect(tx)));
        let handle = channel.connect(credential("t1")).unwrap();
        let mut status = handle.watch();
        wait_status(&mut status, ChannelStatus::Connected).await;

        server.push(presence("u1", true));
        server.push(presence("u2", true));
        assert_eq!(rx.recv().await.unwrap(), presence("u1", true));
        assert_eq!(rx.recv().await.unwrap(), presence("u2", true));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn revocation_is_terminal_until_fresh_credential() {
        let server = InMemoryPushServer::new();
        let channel = EventChannel::new(Arc::new(server.clone()), BackoffConfig::default());
        let (tx, mut rx) = unbounded_channel();
        channel.on_topic(TopicKind::Session, Arc::new(Collect(tx)));
        let handle = channel.connect(credential("t1")).unwrap();
        let mut status = handle.watch();
        wait_status(&mut status, ChannelStatus::Connected).await;

        let revoked = ChannelEvent::Session(SessionEvent::Revoked {
            reason: Some("logged out elsewhere".to_owned()),
        });
        assert!(server.push(revoked.clone()));
        assert_eq!(rx.recv().await.unwrap(), revoked);
        wait_status(&mut status, ChannelStatus::Revoked).await;
        assert!(!server.is_connected());
        assert_eq!(server.connect_count(), 1);

        assert!(matches!(
            channel.connect(credential("t1")),
            Err(ChannelError::CredentialRevoked)
        ));

        let handle = channel.connect(credential("t2")).unwrap();
        let mut status = handle.watch();
        wait_status(&mut status, ChannelStatus::Connected).await;
        assert_eq!(server.connected_credential(), Some(credential("t2")));
        channel.disconnect().await;
    }
}
