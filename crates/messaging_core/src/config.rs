use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use shared::domain::UserId;
use tracing::warn;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "messaging.toml";

/// Timing and sizing knobs of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Delay before refetching the directory after a push for an unknown
    /// thread.
    pub thread_refresh_delay: Duration,
    pub poll_interval: Duration,
    pub connect_retry_interval: Duration,
    pub connect_max_attempts: u32,
    pub message_page_size: u32,
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            thread_refresh_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(60),
            connect_retry_interval: Duration::from_secs(1),
            connect_max_attempts: 10,
            message_page_size: 50,
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub auth_endpoint: Option<String>,
    pub app_key: String,
    pub access_token: Option<String>,
    pub user_id: Option<UserId>,
    pub sync: SyncConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            ws_url: None,
            auth_endpoint: None,
            app_key: "tutoring".into(),
            access_token: None,
            user_id: None,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientSettings {
    pub fn api_base(&self) -> String {
        format!("{}/api", self.server_url.trim_end_matches('/'))
    }

    pub fn auth_endpoint(&self) -> String {
        self.auth_endpoint.clone().unwrap_or_else(|| {
            format!("{}/broadcasting/auth", self.server_url.trim_end_matches('/'))
        })
    }

    /// Push socket URL; derived from the server URL unless set explicitly.
    pub fn ws_url(&self) -> Result<String> {
        if let Some(explicit) = &self.ws_url {
            return Ok(explicit.clone());
        }
        let server_url = self.server_url.trim_end_matches('/');
        let ws_base = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&format!("{ws_base}/app/{}", self.app_key))
            .with_context(|| format!("invalid websocket url derived from {server_url}"))?;
        url.query_pairs_mut()
            .append_pair("protocol", "7")
            .append_pair("client", "rust");
        Ok(url.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    ws_url: Option<String>,
    auth_endpoint: Option<String>,
    app_key: Option<String>,
    access_token: Option<String>,
    user_id: Option<i64>,
    poll_interval_secs: Option<u64>,
    thread_refresh_delay_ms: Option<u64>,
    connect_retry_interval_ms: Option<u64>,
    connect_max_attempts: Option<u32>,
    message_page_size: Option<u32>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the settings file if present, then environment overrides.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Err(err) = apply_file(&mut settings, &raw) {
            warn!(path = %path.display(), "ignoring unreadable settings file: {err:#}");
        }
    }

    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = env("APP__AUTH_ENDPOINT") {
        settings.auth_endpoint = Some(v);
    }
    if let Some(v) = env("APP__APP_KEY") {
        settings.app_key = v;
    }
    if let Some(v) = env("APP__ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }
    if let Some(v) = env("APP__USER_ID") {
        match v.parse::<UserId>() {
            Ok(user_id) => settings.user_id = Some(user_id),
            Err(err) => warn!("ignoring APP__USER_ID: {err}"),
        }
    }
    if let Some(secs) = env("APP__POLL_INTERVAL_SECS").and_then(|v| v.parse::<u64>().ok()) {
        set_poll_interval(&mut settings.sync, secs, "APP__POLL_INTERVAL_SECS");
    }
    if let Some(ms) = env("APP__THREAD_REFRESH_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.sync.thread_refresh_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = env("APP__CONNECT_RETRY_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.sync.connect_retry_interval = Duration::from_millis(ms);
    }
    if let Some(n) = env("APP__CONNECT_MAX_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()) {
        settings.sync.connect_max_attempts = n;
    }
    if let Some(n) = env("APP__MESSAGE_PAGE_SIZE").and_then(|v| v.parse::<u32>().ok()) {
        settings.sync.message_page_size = n;
    }

    settings
}

fn apply_file(settings: &mut ClientSettings, raw: &str) -> Result<()> {
    let file: FileSettings = toml::from_str(raw).context("parsing settings toml")?;

    if let Some(v) = file.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file.ws_url {
        settings.ws_url = Some(v);
    }
    if let Some(v) = file.auth_endpoint {
        settings.auth_endpoint = Some(v);
    }
    if let Some(v) = file.app_key {
        settings.app_key = v;
    }
    if let Some(v) = file.access_token {
        settings.access_token = Some(v);
    }
    if let Some(v) = file.user_id {
        settings.user_id = Some(UserId(v));
    }
    if let Some(secs) = file.poll_interval_secs {
        set_poll_interval(&mut settings.sync, secs, "poll_interval_secs");
    }
    if let Some(ms) = file.thread_refresh_delay_ms {
        settings.sync.thread_refresh_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = file.connect_retry_interval_ms {
        settings.sync.connect_retry_interval = Duration::from_millis(ms);
    }
    if let Some(n) = file.connect_max_attempts {
        settings.sync.connect_max_attempts = n;
    }
    if let Some(n) = file.message_page_size {
        settings.sync.message_page_size = n;
    }
    Ok(())
}

/// Zero is rejected and the current interval kept.
fn set_poll_interval(sync: &mut SyncConfig, secs: u64, source: &str) {
    if secs == 0 {
        warn!(source, "ignoring zero poll interval, keeping {:?}", sync.poll_interval);
        return;
    }
    sync.poll_interval = Duration::from_secs(secs);
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
