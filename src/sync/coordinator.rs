use crate::domain_model::*;
use crate::domain_port::*;
use crate::sync::*;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender, UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const COMMAND_MAILBOX_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Bootstrapping,
    Live,
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncExit {
    LoggedOut,
    /// The owning application must re-authenticate.
    SessionRevoked { reason: Option<String> },
    /// The coordinator task died or the channel went away underneath it.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync coordinator stopped")]
    Stopped,
    #[error("unknown room: {0}")]
    UnknownRoom(RoomId),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub snapshot_backoff: BackoffConfig,
    pub stream_backoff: BackoffConfig,
    pub refresh_interval: Option<Duration>,
    pub dedupe_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_backoff: BackoffConfig::default(),
            stream_backoff: BackoffConfig::default(),
            refresh_interval: None,
            dedupe_window: 1024,
        }
    }
}

pub struct SyncDeps {
    pub fetcher: RoomSnapshotFetcher,
    pub room_api: Arc<dyn RoomApi>,
    pub channel: Arc<EventChannel>,
    pub streams: Arc<MessageStreamClient>,
    pub credential: Credential,
}

enum Command {
    Activate(RoomId, oneshot::Sender<Result<(), SyncError>>),
    Deactivate,
    Refresh,
    ClearHistory(RoomId),
    Logout,
}

enum Input {
    Channel(ChannelEvent),
    SnapshotFetched(Result<Vec<ConversationRoom>, FetchError>),
    SnapshotRetry,
    SubscriptionOpened {
        generation: u64,
        result: Result<(), StreamError>,
    },
    StreamMessage {
        generation: u64,
        message: Message,
    },
    Resubscribe {
        generation: u64,
    },
    Enriched {
        room_id: RoomId,
        result: Result<ConversationRoom, FetchError>,
    },
    HistoryCleared {
        room_id: RoomId,
        result: Result<DateTime<Utc>, FetchError>,
    },
}

// region handle

/// Cloneable front of a running [`SyncCoordinator`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: Sender<Command>,
    store: watch::Receiver<Arc<StoreSnapshot>>,
    phase: watch::Receiver<SyncPhase>,
    exit: watch::Receiver<Option<SyncExit>>,
}

impl SyncHandle {
    async fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Stopped)
    }

    /// Opens `room_id`: zeroes its unread counter and moves the single message
    /// subscription to it.
    pub async fn activate(&self, room_id: RoomId) -> Result<(), SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Activate(room_id, reply_tx)).await?;
        reply_rx.await.map_err(|_| SyncError::Stopped)?
    }

    pub async fn deactivate(&self) -> Result<(), SyncError> {
        self.send(Command::Deactivate).await
    }

    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.send(Command::Refresh).await
    }

    pub async fn clear_history(&self, room_id: RoomId) -> Result<(), SyncError> {
        self.send(Command::ClearHistory(room_id)).await
    }

    /// Tears the session down and waits for the coordinator to exit.
    pub async fn logout(&self) -> SyncExit {
        if self.send(Command::Logout).await.is_err() {
            tracing::debug!("logout requested on a stopped coordinator");
        }
        self.wait().await
    }

    pub async fn wait(&self) -> SyncExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(SyncExit::Cancelled),
            Err(_) => SyncExit::Cancelled,
        }
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.store.borrow().clone()
    }

    pub fn watch_store(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.store.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.clone()
    }
}

// endregion

// region channel forwarding

/// Moves channel events onto the coordinator task.
struct MailboxForwarder {
    inbox: UnboundedSender<Input>,
}

#[async_trait::async_trait]
impl TopicHandler for MailboxForwarder {
    async fn handle(&self, event: &ChannelEvent) -> anyhow::Result<()> {
        if self.inbox.is_closed() {
            tracing::trace!(topic = %event.topic(), "coordinator gone, event dropped");
            return Ok(());
        }
        self.inbox
            .send(Input::Channel(event.clone()))
            .map_err(|_| anyhow!("coordinator mailbox closed"))
    }
}

/// Aborts the channel supervisor if the coordinator unwinds before teardown.
struct ChannelGuard(Arc<EventChannel>);

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// endregion

/// What channel events did to a room while a snapshot was in flight.
#[derive(Debug)]
enum Touched {
    Updated(CarriedFields),
    Removed,
}

/// A subscribe in progress. The task parks an opened handle in `slot` only
/// while `token` is live, checked under the slot lock, so cancelling the token
/// and then draining the slot leaves no handle open.
struct Subscribing {
    token: CancellationToken,
    slot: Arc<Mutex<Option<SubscriptionHandle>>>,
}

/// Bounded window of recently applied event ids.
struct SeenEvents {
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` when the id is already in the window.
    fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Unread increment implied by a metadata patch.
fn unread_delta(known: Option<&ConversationRoom>, patch: &RoomPatch) -> u32 {
    if let Some(delta) = patch.unread_delta {
        return delta;
    }
    match (patch.last_message_at, known.and_then(|r| r.last_message_at)) {
        (Some(at), Some(current)) if at > current => 1,
        (Some(_), None) => 1,
        _ => 0,
    }
}

/// Single-task owner of the [`ConversationStore`].
///
/// Every input (commands, channel events, fetch results, stream callbacks)
/// is processed on this task, one at a time. Slow operations run in spawned
/// tasks and report back through the inbox.
pub struct SyncCoordinator {
    deps: SyncDeps,
    config: SyncConfig,
    store: ConversationStore,
    store_tx: watch::Sender<Arc<StoreSnapshot>>,
    published_version: u64,
    phase_tx: watch::Sender<SyncPhase>,
    inbox_tx: UnboundedSender<Input>,
    cancel: CancellationToken,

    snapshot_in_flight: bool,
    snapshot_queued: bool,
    snapshot_ok_once: bool,
    snapshot_backoff: Backoff,
    touched_since_fetch: HashMap<RoomId, Touched>,

    channel_connected_once: bool,
    channel_up: bool,

    generation: u64,
    subscription: Option<SubscriptionHandle>,
    subscribing: Option<Subscribing>,
    subscribe_task: Option<JoinHandle<()>>,
    stream_backoff: Backoff,

    seen_events: SeenEvents,
    pending_enrichment: HashSet<RoomId>,
    enrich_in_flight: HashSet<RoomId>,
}

impl SyncCoordinator {
    pub fn spawn(deps: SyncDeps, config: SyncConfig) -> SyncHandle {
        let (commands_tx, commands_rx) = tokio::sync::mpsc::channel(COMMAND_MAILBOX_CAP);
        let (inbox_tx, inbox_rx) = unbounded_channel();
        let (store_tx, store_rx) = watch::channel(Arc::new(StoreSnapshot::default()));
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Bootstrapping);
        let (exit_tx, exit_rx) = watch::channel(None);

        let coordinator = Self {
            snapshot_backoff: Backoff::new(config.snapshot_backoff),
            stream_backoff: Backoff::new(config.stream_backoff),
            seen_events: SeenEvents::new(config.dedupe_window),
            deps,
            config,
            store: ConversationStore::new(),
            store_tx,
            published_version: 0,
            phase_tx,
            inbox_tx,
            cancel: CancellationToken::new(),
            snapshot_in_flight: false,
            snapshot_queued: false,
            snapshot_ok_once: false,
            touched_since_fetch: HashMap::new(),
            channel_connected_once: false,
            channel_up: false,
            generation: 0,
            subscription: None,
            subscribing: None,
            subscribe_task: None,
            pending_enrichment: HashSet::new(),
            enrich_in_flight: HashSet::new(),
        };

        let session = nanoid::nanoid!(8);
        let span = tracing::info_span!("sync", %session);
        tokio::spawn(
            async move {
                let exit = coordinator.run(commands_rx, inbox_rx).await;
                tracing::info!(?exit, "sync coordinator exited");
                exit_tx.send_replace(Some(exit));
            }
            .instrument(span),
        );

        SyncHandle {
            commands: commands_tx,
            store: store_rx,
            phase: phase_rx,
            exit: exit_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: Receiver<Command>,
        mut inbox: UnboundedReceiver<Input>,
    ) -> SyncExit {
        tracing::info!("sync coordinator starting");
        let _tasks_guard = self.cancel.clone().drop_guard();
        let _channel_guard = ChannelGuard(self.deps.channel.clone());
        let mut channel_status = self.deps.channel.watch_status();
        let mut refresh = self.config.refresh_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        let bootstrap_exit = self.bootstrap();
        self.publish();

        let exit = match bootstrap_exit {
            Some(exit) => exit,
            None => loop {
                let exit = tokio::select! {
                    biased;
                    command = commands.recv() => match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            tracing::info!("every sync handle dropped, logging out");
                            Some(SyncExit::LoggedOut)
                        }
                    },
                    Some(input) = inbox.recv() => self.handle_input(input),
                    changed = channel_status.changed() => match changed {
                        Ok(()) => {
                            let status = channel_status.borrow_and_update().clone();
                            self.on_channel_status(status)
                        }
                        Err(_) => Some(SyncExit::Cancelled),
                    },
                    _ = subscription_ended(&self.subscription) => {
                        self.on_subscription_ended();
                        None
                    }
                    _ = tick(&mut refresh) => {
                        tracing::debug!("periodic refresh");
                        self.request_snapshot();
                        None
                    }
                };
                self.publish();
                if let Some(exit) = exit {
                    break exit;
                }
            },
        };

        self.teardown().await;
        exit
    }

    fn bootstrap(&mut self) -> Option<SyncExit> {
        let forwarder: Arc<dyn TopicHandler> = Arc::new(MailboxForwarder {
            inbox: self.inbox_tx.clone(),
        });
        for topic in [TopicKind::RoomMetadata, TopicKind::Presence, TopicKind::Session] {
            self.deps.channel.on_topic(topic, forwarder.clone());
        }

        self.request_snapshot();

        match self.deps.channel.connect(self.deps.credential.clone()) {
            Ok(_) => None,
            Err(ChannelError::CredentialRevoked) => {
                tracing::warn!("credential already revoked, not connecting");
                Some(SyncExit::SessionRevoked { reason: None })
            }
            Err(e) => {
                tracing::error!("channel connect failed: {e}");
                Some(SyncExit::Cancelled)
            }
        }
    }

    async fn teardown(&mut self) {
        self.drop_active_subscription();
        self.cancel.cancel();
        self.deps.channel.disconnect().await;
        self.store.clear();
        self.publish();
        self.set_phase(SyncPhase::Stopped);
    }

    // region plumbing

    fn publish(&mut self) {
        if self.store.version() != self.published_version {
            self.published_version = self.store.version();
            self.store_tx.send_replace(Arc::new(self.store.snapshot()));
        }
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            tracing::info!(?previous, ?phase, "sync phase changed");
        }
    }

    fn refresh_phase(&mut self) {
        let phase = if !(self.snapshot_ok_once && self.channel_connected_once) {
            SyncPhase::Bootstrapping
        } else if self.channel_up {
            SyncPhase::Live
        } else {
            SyncPhase::Degraded
        };
        self.set_phase(phase);
    }

    fn schedule(&self, delay: Duration, input: Input) {
        let inbox = self.inbox_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = inbox.send(input);
                }
            }
        });
    }

    fn active_stream_key(&self) -> Option<StreamKey> {
        self.store
            .active_room_id()
            .and_then(|id| self.store.get(id))
            .map(|room| room.stream_key.clone())
    }

    /// Upsert that moves the live subscription if the active room's stream key changed.
    fn upsert_room(&mut self, merge: RoomMerge) {
        let before = self.active_stream_key();
        self.store.upsert(merge);
        if before.is_some() && self.active_stream_key() != before {
            tracing::info!("active room stream key changed, resubscribing");
            self.drop_active_subscription();
            self.open_subscription();
        }
    }

    // endregion

    fn handle_command(&mut self, command: Command) -> Option<SyncExit> {
        match command {
            Command::Activate(room_id, reply) => {
                let result = self.activate(room_id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Deactivate => {
                self.drop_active_subscription();
                self.store.set_active(None);
                tracing::debug!("active room cleared");
            }
            Command::Refresh => self.request_snapshot(),
            Command::ClearHistory(room_id) => self.clear_history(room_id),
            Command::Logout => {
                tracing::info!("logout requested");
                return Some(SyncExit::LoggedOut);
            }
        }
        None
    }

    fn handle_input(&mut self, input: Input) -> Option<SyncExit> {
        match input {
            Input::Channel(event) => return self.on_channel_event(event),
            Input::SnapshotFetched(result) => self.on_snapshot(result),
            Input::SnapshotRetry => self.request_snapshot(),
            Input::SubscriptionOpened { generation, result } => {
                self.on_subscription_opened(generation, result)
            }
            Input::StreamMessage {
                generation,
                message,
            } => self.on_stream_message(generation, message),
            Input::Resubscribe { generation } => {
                if generation == self.generation
                    && self.subscription.is_none()
                    && self.subscribing.is_none()
                {
                    self.open_subscription();
                }
            }
            Input::Enriched { room_id, result } => self.on_enriched(room_id, result),
            Input::HistoryCleared { room_id, result } => match result {
                Ok(cleared_at) => {
                    if self.store.clear_history(&room_id, cleared_at) {
                        tracing::info!(room = %room_id, %cleared_at, "history cleared");
                    }
                }
                Err(e) => tracing::warn!(room = %room_id, "clear history failed: {e}"),
            },
        }
        None
    }

    // region snapshot

    fn request_snapshot(&mut self) {
        if self.snapshot_in_flight {
            self.snapshot_queued = true;
            return;
        }
        self.snapshot_in_flight = true;
        self.touched_since_fetch.clear();

        let fetcher = self.deps.fetcher.clone();
        let inbox = self.inbox_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = fetcher.fetch_rooms() => {
                    let _ = inbox.send(Input::SnapshotFetched(result));
                }
            }
        });
    }

    fn on_snapshot(&mut self, result: Result<Vec<ConversationRoom>, FetchError>) {
        self.snapshot_in_flight = false;

        let rooms = match result {
            Ok(rooms) => rooms,
            Err(e) => {
                self.snapshot_queued = false;
                let delay = self.snapshot_backoff.next_delay();
                tracing::warn!("room snapshot failed: {e}, retrying in {:?}", delay);
                self.schedule(delay, Input::SnapshotRetry);
                return;
            }
        };
        self.snapshot_backoff.reset();

        let touched = std::mem::take(&mut self.touched_since_fetch);
        let rooms: Vec<ConversationRoom> = rooms
            .into_iter()
            .filter(|room| {
                let removed = matches!(touched.get(&room.id), Some(Touched::Removed));
                if removed {
                    tracing::debug!(room = %room.id, "room removed during fetch, ignoring its row");
                }
                !removed
            })
            .collect();
        let fetched: HashSet<RoomId> = rooms.iter().map(|room| room.id.clone()).collect();
        let keep = |id: &RoomId| fetched.contains(id) || touched.contains_key(id);

        if self.store.active_room_id().is_some_and(|id| !keep(id)) {
            tracing::info!("active room missing from snapshot, closing it");
            self.drop_active_subscription();
        }
        self.store.retain(|room| keep(&room.id));
        let room_count = rooms.len();
        for room in rooms {
            self.pending_enrichment.remove(&room.id);
            let merge = match touched.get(&room.id) {
                Some(Touched::Updated(carried)) => RoomMerge::from_snapshot(room).yielding_to(carried),
                _ => RoomMerge::from_snapshot(room),
            };
            self.upsert_room(merge);
        }
        if let Some(active) = self.store.active_room_id().cloned() {
            self.store.clear_unread(&active);
        }

        let store = &self.store;
        self.pending_enrichment.retain(|id| store.contains(id));
        let retry: Vec<RoomId> = self.pending_enrichment.iter().cloned().collect();
        for room_id in retry {
            self.enrich(room_id);
        }

        tracing::info!(rooms = room_count, "room snapshot applied");
        self.snapshot_ok_once = true;
        self.refresh_phase();

        if std::mem::take(&mut self.snapshot_queued) {
            self.request_snapshot();
        }
    }

    // endregion

    // region channel

    fn on_channel_status(&mut self, status: ChannelStatus) -> Option<SyncExit> {
        match status {
            ChannelStatus::Connected => {
                let reconnected = self.channel_connected_once && !self.channel_up;
                self.channel_connected_once = true;
                self.channel_up = true;
                if reconnected {
                    tracing::info!("channel restored, reconciling with a fresh snapshot");
                    self.request_snapshot();
                }
                self.refresh_phase();
            }
            ChannelStatus::Reconnecting { .. } | ChannelStatus::Disconnected => {
                self.channel_up = false;
                self.refresh_phase();
            }
            ChannelStatus::Revoked => {
                return Some(SyncExit::SessionRevoked { reason: None });
            }
            ChannelStatus::Idle | ChannelStatus::Connecting => {}
        }
        None
    }

    fn on_channel_event(&mut self, event: ChannelEvent) -> Option<SyncExit> {
        match event {
            ChannelEvent::RoomMetadata(event) => self.on_room_event(event),
            ChannelEvent::Presence(presence) => {
                self.store.set_presence(presence.user_id, presence.online);
            }
            ChannelEvent::Session(SessionEvent::Revoked { reason }) => {
                tracing::warn!(?reason, "session revoked");
                return Some(SyncExit::SessionRevoked { reason });
            }
        }
        None
    }

    fn on_room_event(&mut self, event: RoomMetadataEvent) {
        if let Some(event_id) = &event.event_id {
            if !self.seen_events.insert(event_id.clone()) {
                tracing::debug!(event = %event_id.0, "duplicate room event dropped");
                return;
            }
        }
        let room_id = event.room_id;

        match event.kind {
            RoomEventKind::Removed => {
                self.touched_since_fetch.insert(room_id.clone(), Touched::Removed);
                if self.store.active_room_id() == Some(&room_id) {
                    self.drop_active_subscription();
                }
                self.pending_enrichment.remove(&room_id);
                match self.store.remove(&room_id) {
                    Some(_) => tracing::info!(room = %room_id, "room removed"),
                    None => tracing::debug!(room = %room_id, "removal of unknown room ignored"),
                }
            }
            RoomEventKind::Updated => {
                let touched = self
                    .touched_since_fetch
                    .entry(room_id.clone())
                    .or_insert(Touched::Updated(CarriedFields::default()));
                match touched {
                    Touched::Updated(carried) => carried.add(&event.patch),
                    Touched::Removed => {
                        let mut carried = CarriedFields::default();
                        carried.add(&event.patch);
                        *touched = Touched::Updated(carried);
                    }
                }
                let known = self.store.get(&room_id);
                let delta = unread_delta(known, &event.patch);
                if known.is_none() {
                    let incomplete = event.patch.is_incomplete();
                    self.upsert_room(RoomMerge::from_patch(room_id.clone(), event.patch, delta));
                    tracing::debug!(room = %room_id, incomplete, "room synthesized from event");
                    if incomplete {
                        self.pending_enrichment.insert(room_id.clone());
                        self.enrich(room_id);
                    }
                } else {
                    self.upsert_room(RoomMerge::from_patch(room_id.clone(), event.patch, delta));
                    tracing::debug!(room = %room_id, delta, "room updated");
                    if self.pending_enrichment.contains(&room_id) {
                        self.enrich(room_id);
                    }
                }
            }
        }
    }

    fn enrich(&mut self, room_id: RoomId) {
        if !self.enrich_in_flight.insert(room_id.clone()) {
            return;
        }
        let api = self.deps.room_api.clone();
        let inbox = self.inbox_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = api.fetch_room(&room_id) => {
                    let _ = inbox.send(Input::Enriched { room_id, result });
                }
            }
        });
    }

    fn on_enriched(&mut self, room_id: RoomId, result: Result<ConversationRoom, FetchError>) {
        self.enrich_in_flight.remove(&room_id);
        match result {
            Ok(room) if self.store.contains(&room_id) => {
                self.pending_enrichment.remove(&room_id);
                self.upsert_room(RoomMerge::from_enrichment(room));
                tracing::debug!(room = %room_id, "room enriched");
            }
            Ok(_) => {
                self.pending_enrichment.remove(&room_id);
                tracing::debug!(room = %room_id, "enriched room is gone");
            }
            Err(e) => {
                tracing::warn!(room = %room_id, "room enrichment failed, keeping placeholder: {e}");
            }
        }
    }

    // endregion

    // region active room

    fn activate(&mut self, room_id: RoomId) -> Result<(), SyncError> {
        if !self.store.contains(&room_id) {
            tracing::warn!(room = %room_id, "activation of unknown room");
            return Err(SyncError::UnknownRoom(room_id));
        }

        if self.store.active_room_id() == Some(&room_id) {
            self.store.set_active(Some(room_id));
            return Ok(());
        }

        self.drop_active_subscription();
        self.store.set_active(Some(room_id.clone()));
        self.stream_backoff.reset();
        self.mark_read(room_id.clone());
        self.open_subscription();
        tracing::info!(room = %room_id, generation = self.generation, "room activated");
        Ok(())
    }

    fn mark_read(&self, room_id: RoomId) {
        let api = self.deps.room_api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&room_id).await {
                tracing::warn!(room = %room_id, "mark read failed, local state kept: {e}");
            }
        });
    }

    fn clear_history(&mut self, room_id: RoomId) {
        if !self.store.contains(&room_id) {
            tracing::warn!(room = %room_id, "clear history on unknown room");
            return;
        }
        let api = self.deps.room_api.clone();
        let inbox = self.inbox_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = api.clear_history(&room_id) => {
                    let _ = inbox.send(Input::HistoryCleared { room_id, result });
                }
            }
        });
    }

    /// Closes the live subscription and invalidates any in-flight one.
    fn drop_active_subscription(&mut self) {
        self.generation += 1;
        if let Some(subscribing) = self.subscribing.take() {
            subscribing.token.cancel();
            let parked = subscribing.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = parked {
                handle.close();
            }
        }
        if let Some(handle) = self.subscription.take() {
            self.deps.streams.unsubscribe(handle);
        }
    }

    fn open_subscription(&mut self) {
        let Some(stream_key) = self.active_stream_key() else {
            return;
        };
        let generation = self.generation;
        let token = self.cancel.child_token();
        let slot = Arc::new(Mutex::new(None));
        self.subscribing = Some(Subscribing {
            token: token.clone(),
            slot: slot.clone(),
        });
        let previous = self.subscribe_task.take();

        let streams = self.deps.streams.clone();
        let inbox = self.inbox_tx.clone();
        self.subscribe_task = Some(tokio::spawn(async move {
            // the previous attempt is already cancelled; it must release its handle first
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let callback_inbox = inbox.clone();
            let on_message = move |message: Message| {
                let _ = callback_inbox.send(Input::StreamMessage {
                    generation,
                    message,
                });
            };
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = streams.subscribe(&stream_key, on_message) => result,
            };

            let result = match result {
                Ok(handle) => {
                    let mut parked = slot.lock().unwrap_or_else(|e| e.into_inner());
                    if token.is_cancelled() {
                        handle.close();
                        return;
                    }
                    *parked = Some(handle);
                    Ok(())
                }
                Err(e) => Err(e),
            };
            let _ = inbox.send(Input::SubscriptionOpened { generation, result });
        }));
    }

    fn on_subscription_opened(&mut self, generation: u64, result: Result<(), StreamError>) {
        if generation != self.generation {
            // its handle was closed when the generation moved on
            tracing::trace!(generation, current = self.generation, "stale subscription discarded");
            return;
        }
        let Some(subscribing) = self.subscribing.take() else {
            return;
        };

        match result {
            Ok(()) => {
                let parked = subscribing.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                let Some(handle) = parked else {
                    return;
                };
                tracing::debug!(stream = %handle.stream_key(), generation, "message stream subscribed");
                self.stream_backoff.reset();
                if let Some(previous) = self.subscription.replace(handle) {
                    previous.close();
                }
            }
            Err(e) => {
                let delay = self.stream_backoff.next_delay();
                tracing::warn!("message stream subscribe failed: {e}, retrying in {:?}", delay);
                self.schedule(delay, Input::Resubscribe { generation });
            }
        }
    }

    fn on_subscription_ended(&mut self) {
        let Some(handle) = self.subscription.take() else {
            return;
        };
        if handle.is_closed() {
            return;
        }
        handle.close();
        let delay = self.stream_backoff.next_delay();
        tracing::warn!(stream = %handle.stream_key(), "message stream ended, resubscribing in {:?}", delay);
        self.schedule(
            delay,
            Input::Resubscribe {
                generation: self.generation,
            },
        );
    }

    fn on_stream_message(&mut self, generation: u64, message: Message) {
        if generation != self.generation {
            tracing::trace!(generation, message = %message.id, "stale stream message dropped");
            return;
        }
        let id = message.id;
        if !self.store.push_active_message(message) {
            tracing::trace!(message = %id, "message filtered (cleared or duplicate)");
        }
    }

    // endregion
}

async fn subscription_ended(subscription: &Option<SubscriptionHandle>) {
    match subscription {
        Some(handle) => handle.ended().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn room_at(secs: Option<i64>) -> ConversationRoom {
        ConversationRoom {
            id: RoomId::from("a"),
            stream_key: StreamKey::from("a"),
            kind: RoomKind::Direct,
            display_name: "A".to_owned(),
            avatar_ref: None,
            members: Vec::new(),
            last_message_preview: None,
            last_message_at: secs.map(at),
            unread_count: 0,
            client_cleared_at: None,
        }
    }

    #[test]
    fn explicit_delta_wins() {
        let patch = RoomPatch {
            unread_delta: Some(3),
            last_message_at: Some(at(1)),
            ..Default::default()
        };
        assert_eq!(unread_delta(Some(&room_at(Some(10))), &patch), 3);
    }

    #[test]
    fn newer_activity_defaults_to_one() {
        let newer = RoomPatch {
            last_message_at: Some(at(20)),
            ..Default::default()
        };
        assert_eq!(unread_delta(Some(&room_at(Some(10))), &newer), 1);
        assert_eq!(unread_delta(Some(&room_at(None)), &newer), 1);
        assert_eq!(unread_delta(None, &newer), 1);

        let same = RoomPatch {
            last_message_at: Some(at(10)),
            ..Default::default()
        };
        assert_eq!(unread_delta(Some(&room_at(Some(10))), &same), 0);
        assert_eq!(unread_delta(None, &RoomPatch::default()), 0);
    }

    #[test]
    fn seen_events_window_is_bounded() {
        let mut seen = SeenEvents::new(2);
        assert!(seen.insert(EventId("1".to_owned())));
        assert!(!seen.insert(EventId("1".to_owned())));
        assert!(seen.insert(EventId("2".to_owned())));
        assert!(seen.insert(EventId("3".to_owned())));
        assert!(seen.insert(EventId("1".to_owned())));
        assert!(!seen.insert(EventId("3".to_owned())));
    }
}
