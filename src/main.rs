use roomsync::domain_model::*;
use roomsync::logger::*;
use roomsync::runtime::*;
use roomsync::settings::*;
use roomsync::sync::*;
use std::time::Duration;
use tokio::signal;

const ACTIVATE_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    info!(?project_settings);
    logger.reload_from_config(&LogConfig::from(&project_settings.log))?;

    let token = match std::env::var(TOKEN_ENV) {
        Ok(token) => token,
        Err(_) if project_settings.backend.kind == "fake" => "dev-token".to_owned(),
        Err(_) => return Err(anyhow::anyhow!("{} is not set", TOKEN_ENV)),
    };
    let runtime = Runtime::try_new(&project_settings, Credential(token))?;
    let sync = runtime.handle();

    let mut store = sync.watch_store();
    tokio::spawn(async move {
        while store.changed().await.is_ok() {
            let snapshot = store.borrow_and_update().clone();
            info!(
                rooms = snapshot.rooms.len(),
                unread = snapshot.total_unread(),
                active = ?snapshot.active_room_id,
                feed = snapshot.active_feed.len(),
                "store updated"
            );
        }
    });

    if let Some(room) = cli.activate {
        let room_id = RoomId(room);
        let mut store = sync.watch_store();
        let known = tokio::time::timeout(
            ACTIVATE_WAIT,
            store.wait_for(|snapshot| snapshot.room(&room_id).is_some()),
        )
        .await
        .is_ok_and(|seen| seen.is_ok());
        if known {
            sync.activate(room_id).await?;
        } else {
            warn!(room = %room_id, "room did not show up, not activating");
        }
    }

    let exit = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("interrupted");
            runtime.shutdown().await
        }
        exit = sync.wait() => exit,
    };

    match exit {
        SyncExit::SessionRevoked { reason } => Err(anyhow::anyhow!(
            "session revoked ({}), sign in again",
            reason.as_deref().unwrap_or("no reason given")
        )),
        exit => {
            info!(?exit, "bye");
            Ok(())
        }
    }
}
