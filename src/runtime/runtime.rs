use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_http::*;
use crate::infra_memory::*;
use crate::infra_ws::*;
use crate::logger::*;
use crate::settings::Settings;
use crate::sync::*;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles onto the in-process backend, for driving the `fake` runtime.
#[derive(Clone)]
pub struct FakeBackend {
    pub api: Arc<InMemoryRoomApi>,
    pub push: InMemoryPushServer,
    pub streams: Arc<InMemoryMessageStreams>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            api: Arc::new(InMemoryRoomApi::default()),
            push: InMemoryPushServer::new(),
            streams: Arc::new(InMemoryMessageStreams::new()),
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Composition root: picks the adapters named by the settings, wires the sync
/// engine and owns its shutdown.
pub struct Runtime {
    handle: SyncHandle,
    channel: Arc<EventChannel>,
    streams: Arc<MessageStreamClient>,
    fake: Option<FakeBackend>,
}

impl Runtime {
    pub fn try_new(settings: &Settings, credential: Credential) -> anyhow::Result<Self> {
        let run_id = nanoid::nanoid!(10);
        info!(%run_id, backend = %settings.backend.kind, "runtime starting");

        match settings.backend.kind.as_str() {
            "fake" => {
                return Ok(Self::with_fake_backend(
                    settings,
                    credential,
                    FakeBackend::new(),
                ));
            }
            "real" => {}
            other => return Err(anyhow::anyhow!("Unknown backend: {}", other)),
        }

        let room_api: Arc<dyn RoomApi> = Arc::new(HttpRoomApi::new(
            settings.api.base_url.clone(),
            credential.clone(),
            Duration::from_millis(settings.api.timeout_ms),
        )?);
        let push: Arc<dyn PushTransport> =
            Arc::new(WsPushTransport::new(settings.channel.url.clone()));
        let stream_transport: Arc<dyn StreamTransport> = Arc::new(WsStreamTransport::new(
            settings.stream.url.clone(),
            credential.clone(),
        ));

        Ok(Self::with_adapters(
            room_api,
            push,
            stream_transport,
            None,
            settings,
            credential,
        ))
    }

    /// Runs against an already seeded in-process backend, whatever the
    /// configured backend kind.
    pub fn with_fake_backend(
        settings: &Settings,
        credential: Credential,
        fake: FakeBackend,
    ) -> Self {
        Self::with_adapters(
            fake.api.clone(),
            Arc::new(fake.push.clone()),
            fake.streams.clone(),
            Some(fake),
            settings,
            credential,
        )
    }

    fn with_adapters(
        room_api: Arc<dyn RoomApi>,
        push: Arc<dyn PushTransport>,
        stream_transport: Arc<dyn StreamTransport>,
        fake: Option<FakeBackend>,
        settings: &Settings,
        credential: Credential,
    ) -> Self {
        let channel = Arc::new(EventChannel::new(push, channel_backoff(settings)));
        let streams = Arc::new(MessageStreamClient::new(
            stream_transport,
            settings.stream.backlog,
        ));
        let fetcher = RoomSnapshotFetcher::new(
            room_api.clone(),
            Duration::from_millis(settings.api.timeout_ms),
        );

        let handle = SyncCoordinator::spawn(
            SyncDeps {
                fetcher,
                room_api,
                channel: channel.clone(),
                streams: streams.clone(),
                credential,
            },
            sync_config(settings),
        );

        Self {
            handle,
            channel,
            streams,
            fake,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// `Some` only for the `fake` backend.
    pub fn fake_backend(&self) -> Option<&FakeBackend> {
        self.fake.as_ref()
    }

    pub async fn shutdown(&self) -> SyncExit {
        info!("runtime shutting down...");
        let exit = match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.handle.logout()).await {
            Ok(exit) => exit,
            Err(_) => {
                error!("sync coordinator did not stop in time");
                self.channel.abort();
                SyncExit::Cancelled
            }
        };
        info!(
            ?exit,
            open_subscriptions = self.streams.open_subscriptions(),
            "runtime stopped"
        );
        exit
    }
}

pub fn channel_backoff(settings: &Settings) -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(settings.channel.initial_backoff_ms),
        max: Duration::from_millis(settings.channel.max_backoff_ms),
    }
}

pub fn sync_config(settings: &Settings) -> SyncConfig {
    let snapshot_backoff = BackoffConfig {
        initial: Duration::from_millis(settings.sync.snapshot_initial_backoff_ms),
        max: Duration::from_millis(settings.sync.snapshot_max_backoff_ms),
    };
    SyncConfig {
        snapshot_backoff,
        stream_backoff: channel_backoff(settings),
        refresh_interval: settings
            .sync
            .refresh_interval_secs
            .map(Duration::from_secs),
        dedupe_window: settings.sync.dedupe_window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::parse_settings;

    #[tokio::test]
    async fn fake_runtime_bootstraps_and_shuts_down() {
        let settings = parse_settings(Some("settings/dev.toml")).unwrap();
        let runtime = Runtime::try_new(&settings, Credential("dev".to_owned())).unwrap();
        let fake = runtime.fake_backend().unwrap().clone();

        let mut phase = runtime.handle().watch_phase();
        phase.wait_for(|p| *p == SyncPhase::Live).await.unwrap();
        assert!(fake.push.is_connected());

        assert_eq!(runtime.shutdown().await, SyncExit::LoggedOut);
        assert!(!fake.push.is_connected());
        assert_eq!(runtime.handle().phase(), SyncPhase::Stopped);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut settings = parse_settings(Some("settings/dev.toml")).unwrap();
        settings.backend.kind = "carrier-pigeon".to_owned();
        assert!(Runtime::try_new(&settings, Credential("dev".to_owned())).is_err());
    }
}
