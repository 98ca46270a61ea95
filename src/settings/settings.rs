use anyhow::{Result, anyhow};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub log: Log,
    pub backend: Backend,
    pub api: Api,
    pub channel: Channel,
    pub stream: Stream,
    pub sync: SyncTuning,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

#[derive(Debug, Deserialize)]
pub struct Backend {
    pub kind: String, // "fake" or "real"
}

#[derive(Debug, Deserialize)]
pub struct Api {
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Channel {
    pub url: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Stream {
    pub url: String,
    pub backlog: usize,
}

#[derive(Debug, Deserialize)]
pub struct SyncTuning {
    /// Periodic snapshot refresh; absent disables it.
    pub refresh_interval_secs: Option<u64>,
    pub dedupe_window: usize,
    pub snapshot_initial_backoff_ms: u64,
    pub snapshot_max_backoff_ms: u64,
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

const ENV_PREFIX: &str = "ROOMSYNC";

/// Environment variable holding the session credential.
pub const TOKEN_ENV: &str = "ROOMSYNC_TOKEN";

/// Reads the TOML file at `path` (or the profile default), then applies
/// `ROOMSYNC__<SECTION>__<KEY>` environment overrides.
pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(Config::try_deserialize)
        .map_err(|e| anyhow!("invalid settings in {path}: {e}"))?;

    if settings.channel.initial_backoff_ms == 0 || settings.sync.snapshot_initial_backoff_ms == 0 {
        return Err(anyhow!("initial backoff must be positive"));
    }

    Ok(settings)
}
