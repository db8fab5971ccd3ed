use std::env;
use std::time::Duration;

use url::Url;

use crate::protocol::VoiceSettings;

/// Backend used when the app runs on the same machine as the assistant.
const LOCAL_BACKEND_URL: &str = "ws://localhost:8000/ws";

/// Deployed hosts follow the convention that the front-end hostname
/// contains `jar-vet` and the backend is reachable at the same hostname
/// with `jar-vet-backend` substituted for it.
const FRONTEND_HOST_MARKER: &str = "jar-vet";
const BACKEND_HOST_MARKER: &str = "jar-vet-backend";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend_url: String,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub speaker_enabled: bool,
    pub voice: VoiceSettings,
}

impl AppConfig {
    pub fn default_host() -> String {
        "localhost".to_string()
    }
}

/// Picks the backend websocket endpoint. An explicit URL wins; otherwise
/// local hosts use the development backend, and deployed hosts derive the
/// backend hostname from their own via the `jar-vet` naming convention.
pub fn resolve_backend_url(
    explicit: Option<&str>,
    host: &str,
    secure: bool,
) -> Result<String, String> {
    if let Some(raw) = explicit {
        let parsed = Url::parse(raw).map_err(|err| format!("invalid backend url '{raw}': {err}"))?;
        match parsed.scheme() {
            "ws" | "wss" => return Ok(raw.to_string()),
            other => return Err(format!("backend url must be ws or wss, got '{other}'")),
        }
    }
    if host == "localhost" || host == "127.0.0.1" {
        return Ok(LOCAL_BACKEND_URL.to_string());
    }
    let scheme = if secure { "wss" } else { "ws" };
    let backend_host = host.replacen(FRONTEND_HOST_MARKER, BACKEND_HOST_MARKER, 1);
    Ok(format!("{scheme}://{backend_host}/ws"))
}

pub fn voice_settings_from_env() -> VoiceSettings {
    let defaults = VoiceSettings::default();
    VoiceSettings {
        rate: env_optional_f32("VOICE_RATE").unwrap_or(defaults.rate),
        pitch: env_optional_f32("VOICE_PITCH").unwrap_or(defaults.pitch),
        volume: env_optional_f32("VOICE_VOLUME").unwrap_or(defaults.volume),
    }
}

pub(crate) fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_optional_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() { None } else { Some(trimmed) }
    })
}

pub(crate) fn env_optional_f32(key: &str) -> Option<f32> {
    env::var(key).ok().and_then(|value| value.parse::<f32>().ok())
}

pub(crate) fn env_optional_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse::<u32>().ok())
}

pub(crate) fn env_duration_seconds(key: &str, default_secs: f32) -> Duration {
    let value = env_optional_f32(key).unwrap_or(default_secs);
    Duration::from_secs_f32(value.max(0.0))
}

pub(crate) fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    let value = env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(value)
}
