use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::{KeyserverId, Platform, PlatformDetails};
use tracing::error;

pub const DEFAULT_CONFIG_FILE: &str = "keyserver_conn.toml";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const AUTH_RETRY_DELAY: Duration = Duration::from_secs(60);
pub const UPLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(50);
pub const AUTHORITATIVE_KEYSERVER_ID: &str = "256";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundFailurePolicy {
    Fatal,
    Log,
}

impl BackgroundFailurePolicy {
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            Self::Fatal
        } else {
            Self::Log
        }
    }

    /// `Fatal` hands the error back to the caller; `Log` records it and
    /// carries on.
    pub fn report(self, context: &str, err: anyhow::Error) -> anyhow::Result<()> {
        match self {
            Self::Fatal => Err(err.context(context.to_string())),
            Self::Log => {
                error!(error = %err, "{context}");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyserverEntry {
    pub id: KeyserverId,
    pub url_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub platform_details: PlatformDetails,
    pub set_session_id_on_request: bool,
    pub call_timeout: Duration,
    pub authoritative_keyserver_id: KeyserverId,
    pub using_services_access_token: bool,
    pub relying_on_authoritative_keyserver: bool,
    pub auth_retry_delay: Duration,
    pub upload_progress_interval: Duration,
    pub background_failure_policy: BackgroundFailurePolicy,
    pub keyservers: Vec<KeyserverEntry>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            platform_details: PlatformDetails {
                platform: Platform::Web,
                code_version: None,
                state_version: None,
            },
            set_session_id_on_request: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            authoritative_keyserver_id: KeyserverId::new(AUTHORITATIVE_KEYSERVER_ID),
            using_services_access_token: true,
            relying_on_authoritative_keyserver: true,
            auth_retry_delay: AUTH_RETRY_DELAY,
            upload_progress_interval: UPLOAD_PROGRESS_INTERVAL,
            background_failure_policy: BackgroundFailurePolicy::for_build(),
            keyservers: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn is_authoritative(&self, keyserver_id: &KeyserverId) -> bool {
        *keyserver_id == self.authoritative_keyserver_id
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    platform: Option<Platform>,
    code_version: Option<u32>,
    state_version: Option<u32>,
    set_session_id_on_request: Option<bool>,
    call_timeout_ms: Option<u64>,
    authoritative_keyserver_id: Option<String>,
    using_services_access_token: Option<bool>,
    relying_on_authoritative_keyserver: Option<bool>,
    auth_retry_delay_ms: Option<u64>,
    upload_progress_interval_ms: Option<u64>,
    background_failure_policy: Option<BackgroundFailurePolicy>,
    #[serde(default)]
    keyservers: Vec<KeyserverEntry>,
}

pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ConnectionConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let raw = match fs::read_to_string(path) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    };
    settings_from_sources(raw.as_deref(), |key| std::env::var(key).ok())
}

pub(crate) fn settings_from_sources(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ConnectionConfig> {
    let mut settings = ConnectionConfig::default();

    if let Some(raw) = file_contents {
        let file_cfg: FileSettings =
            toml::from_str(raw).context("failed to parse keyserver connection config")?;
        if let Some(v) = file_cfg.platform {
            settings.platform_details.platform = v;
        }
        if file_cfg.code_version.is_some() {
            settings.platform_details.code_version = file_cfg.code_version;
        }
        if file_cfg.state_version.is_some() {
            settings.platform_details.state_version = file_cfg.state_version;
        }
        if let Some(v) = file_cfg.set_session_id_on_request {
            settings.set_session_id_on_request = v;
        }
        if let Some(v) = file_cfg.call_timeout_ms {
            settings.call_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.authoritative_keyserver_id {
            settings.authoritative_keyserver_id = KeyserverId(v);
        }
        if let Some(v) = file_cfg.using_services_access_token {
            settings.using_services_access_token = v;
        }
        if let Some(v) = file_cfg.relying_on_authoritative_keyserver {
            settings.relying_on_authoritative_keyserver = v;
        }
        if let Some(v) = file_cfg.auth_retry_delay_ms {
            settings.auth_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.upload_progress_interval_ms {
            settings.upload_progress_interval = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.background_failure_policy {
            settings.background_failure_policy = v;
        }
        settings.keyservers = file_cfg.keyservers;
    }

    if let Some(v) = env("KEYSERVER_CONN__CALL_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.call_timeout = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = env("KEYSERVER_CONN__AUTHORITATIVE_KEYSERVER_ID") {
        settings.authoritative_keyserver_id = KeyserverId(v);
    }
    if let Some(v) = env("KEYSERVER_CONN__SET_SESSION_ID_ON_REQUEST") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.set_session_id_on_request = parsed;
        }
    }
    if let Some(v) = env("KEYSERVER_CONN__USING_SERVICES_ACCESS_TOKEN") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.using_services_access_token = parsed;
        }
    }
    if let Some(v) = env("KEYSERVER_CONN__BACKGROUND_FAILURE_POLICY") {
        match v.to_ascii_lowercase().as_str() {
            "fatal" => settings.background_failure_policy = BackgroundFailurePolicy::Fatal,
            "log" => settings.background_failure_policy = BackgroundFailurePolicy::Log,
            _ => {}
        }
    }
    if let Some(v) = env("KEYSERVER_CONN__CODE_VERSION") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.platform_details.code_version = Some(parsed);
        }
    }

    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
