//! Scripted run of the sync engine against the in-process backend.
//!
//! $ cargo run --bin sync_demo -- --settings=settings/dev.toml

use chrono::{Duration as ChronoDuration, Utc};
use roomsync::domain_model::*;
use roomsync::logger::*;
use roomsync::runtime::*;
use roomsync::settings::*;
use roomsync::sync::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn room(id: &str, name: &str, unread: u32, minutes_ago: i64) -> ConversationRoom {
    ConversationRoom {
        id: RoomId::from(id),
        stream_key: StreamKey(format!("chats/{id}")),
        kind: RoomKind::Direct,
        display_name: name.to_owned(),
        avatar_ref: None,
        members: Vec::new(),
        last_message_preview: Some("earlier".to_owned()),
        last_message_at: Some(Utc::now() - ChronoDuration::minutes(minutes_ago)),
        unread_count: unread,
        client_cleared_at: None,
    }
}

fn text(sender: &str, body: &str) -> Message {
    Message {
        id: MessageId(0),
        room_stream_key: StreamKey::from(""),
        sender_id: UserId::from(sender),
        sender_display_name: sender.to_owned(),
        sender_avatar_ref: None,
        content: MessageContent::Text {
            body: body.to_owned(),
        },
        timestamp: Utc::now(),
    }
}

async fn until<F>(
    store: &mut watch::Receiver<Arc<StoreSnapshot>>,
    step: &str,
    f: F,
) -> anyhow::Result<()>
where
    F: FnMut(&Arc<StoreSnapshot>) -> bool,
{
    tokio::time::timeout(STEP_TIMEOUT, store.wait_for(f))
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for: {step}"))?
        .map_err(|_| anyhow::anyhow!("coordinator stopped during: {step}"))?;
    let snapshot = store.borrow_and_update().clone();
    info!(
        step,
        rooms = ?snapshot.room_ids(),
        unread = snapshot.total_unread(),
        feed = snapshot.active_feed.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logger = Logger::new_bootstrap();
    let settings = parse_settings(cli.settings.as_deref())?;
    logger.reload_from_config(&LogConfig::from(&settings.log))?;

    let fake = FakeBackend::new();
    fake.api
        .set_rooms(vec![room("alice", "Alice", 0, 5), room("team", "Team", 2, 30)]);

    let runtime =
        Runtime::with_fake_backend(&settings, Credential("demo".to_owned()), fake.clone());
    let sync = runtime.handle();
    let mut store = sync.watch_store();

    until(&mut store, "bootstrap snapshot", |s| s.rooms.len() == 2).await?;

    let alice = RoomId::from("alice");
    let alice_stream = StreamKey::from("chats/alice");
    sync.activate(alice.clone()).await?;
    fake.streams.publish(&alice_stream, text("alice", "hi!"));
    fake.streams.publish(&alice_stream, text("alice", "are you there?"));
    until(&mut store, "active feed", |s| s.active_feed.len() == 2).await?;

    fake.push.push(ChannelEvent::RoomMetadata(RoomMetadataEvent {
        event_id: Some(EventId("evt-1".to_owned())),
        kind: RoomEventKind::Updated,
        room_id: RoomId::from("team"),
        patch: RoomPatch {
            last_message_preview: Some("standup moved".to_owned()),
            last_message_at: Some(Utc::now()),
            ..Default::default()
        },
    }));
    until(&mut store, "team unread bump", |s| {
        s.room(&RoomId::from("team")).is_some_and(|r| r.unread_count == 3)
    })
    .await?;

    fake.api.upsert_room(room("carol", "Carol", 1, 0));
    fake.push.push(ChannelEvent::RoomMetadata(RoomMetadataEvent {
        event_id: Some(EventId("evt-2".to_owned())),
        kind: RoomEventKind::Updated,
        room_id: RoomId::from("carol"),
        patch: RoomPatch {
            last_message_at: Some(Utc::now()),
            ..Default::default()
        },
    }));
    until(&mut store, "carol enriched", |s| {
        s.room(&RoomId::from("carol")).is_some_and(|r| r.display_name == "Carol")
    })
    .await?;

    let mut phase = sync.watch_phase();
    fake.push.drop_connection();
    fake.api.remove_room(&RoomId::from("team"));
    tokio::time::timeout(STEP_TIMEOUT, phase.wait_for(|p| *p == SyncPhase::Degraded)).await??;
    info!("channel dropped, phase degraded");
    until(&mut store, "reconciled after reconnect", |s| {
        s.room(&RoomId::from("team")).is_none()
    })
    .await?;

    fake.push.push(ChannelEvent::Session(SessionEvent::Revoked {
        reason: Some("signed in on another device".to_owned()),
    }));
    let exit = tokio::time::timeout(STEP_TIMEOUT, sync.wait()).await?;
    info!(
        ?exit,
        live_feeds = fake.streams.live_feeds(&alice_stream),
        "demo finished"
    );

    Ok(())
}
