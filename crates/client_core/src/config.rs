use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub api_url: String,
    pub ws_url: String,
    pub token_db_url: String,
    pub page_size: u32,
    pub max_upload_bytes: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let api_url = "http://127.0.0.1:8000".to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            token_db_url: "sqlite://./data/client.db".into(),
            page_size: 50,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            reconnect_base_ms: 1000,
            reconnect_cap_ms: 10_000,
        }
    }
}

impl ClientSettings {
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        let api_url = trim_trailing_slash(api_url.into());
        self.ws_url = derive_ws_url(&api_url);
        self.api_url = api_url;
        self
    }

    pub fn clamped_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

/// `http(s)://host` becomes `ws(s)://host/ws`.
pub fn derive_ws_url(api_url: &str) -> String {
    let api_url = api_url.trim_end_matches('/');
    let swapped = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    };
    format!("{swapped}/ws")
}

fn trim_trailing_slash(value: String) -> String {
    value.trim_end_matches('/').to_string()
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();
    let mut explicit_ws_url = false;

    if let Ok(raw) = fs::read_to_string(file) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("api_url").and_then(toml::Value::as_str) {
                    settings = settings.with_api_url(v);
                }
                if let Some(v) = file_cfg.get("ws_url").and_then(toml::Value::as_str) {
                    settings.ws_url = trim_trailing_slash(v.to_string());
                    explicit_ws_url = true;
                }
                if let Some(v) = file_cfg.get("token_db_url").and_then(toml::Value::as_str) {
                    settings.token_db_url = v.to_string();
                }
                if let Some(v) = file_cfg.get("page_size").and_then(toml::Value::as_integer) {
                    settings.page_size = v.clamp(1, i64::from(MAX_PAGE_SIZE)) as u32;
                }
                if let Some(v) = file_cfg
                    .get("max_upload_bytes")
                    .and_then(toml::Value::as_integer)
                {
                    if v > 0 {
                        settings.max_upload_bytes = v as u64;
                    }
                }
                if let Some(v) = file_cfg
                    .get("reconnect_base_ms")
                    .and_then(toml::Value::as_integer)
                {
                    if v > 0 {
                        settings.reconnect_base_ms = v as u64;
                    }
                }
                if let Some(v) = file_cfg
                    .get("reconnect_cap_ms")
                    .and_then(toml::Value::as_integer)
                {
                    if v > 0 {
                        settings.reconnect_cap_ms = v as u64;
                    }
                }
            }
            Err(err) => warn!("config: ignoring unreadable {}: {err}", file.display()),
        }
    }

    for key in ["API_URL", "APP__API_URL"] {
        if let Some(v) = env(key) {
            let ws_url = settings.ws_url.clone();
            settings = settings.with_api_url(v);
            if explicit_ws_url {
                settings.ws_url = ws_url;
            }
        }
    }
    for key in ["WS_URL", "APP__WS_URL"] {
        if let Some(v) = env(key) {
            settings.ws_url = trim_trailing_slash(v);
        }
    }
    if let Some(v) = env("APP__TOKEN_DB_URL") {
        settings.token_db_url = v;
    }
    if let Some(v) = env("APP__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed.clamp(1, MAX_PAGE_SIZE);
        }
    }
    if let Some(v) = env("APP__MAX_UPLOAD_BYTES") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.max_upload_bytes = parsed;
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
