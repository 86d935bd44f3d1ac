use super::*;

use std::{
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn derives_websocket_url_from_api_url() {
    assert_eq!(derive_ws_url("http://localhost:8000"), "ws://localhost:8000/ws");
    assert_eq!(derive_ws_url("https://chat.example.com/"), "wss://chat.example.com/ws");
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = load_settings_from(Path::new("/definitely/missing/client.toml"), no_env);
    assert_eq!(settings, ClientSettings::default());
    assert_eq!(settings.max_upload_bytes, 20 * 1024 * 1024);
    assert_eq!(settings.ws_url, "ws://127.0.0.1:8000/ws");
}

#[test]
fn file_then_env_overrides() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("chat_client_config_{suffix}.toml"));
    fs::write(
        &path,
        "api_url = \"https://api.example.com\"\npage_size = 500\nmax_upload_bytes = 1024\n",
    )
    .expect("write config");

    let settings = load_settings_from(&path, |key| match key {
        "APP__TOKEN_DB_URL" => Some("sqlite::memory:".to_string()),
        "APP__PAGE_SIZE" => Some("25".to_string()),
        _ => None,
    });
    fs::remove_file(&path).expect("cleanup");

    assert_eq!(settings.api_url, "https://api.example.com");
    assert_eq!(settings.ws_url, "wss://api.example.com/ws");
    assert_eq!(settings.max_upload_bytes, 1024);
    assert_eq!(settings.token_db_url, "sqlite::memory:");
    assert_eq!(settings.page_size, 25);
}

#[test]
fn explicit_ws_url_wins_over_derived() {
    let settings = load_settings_from(Path::new("/missing.toml"), |key| match key {
        "APP__API_URL" => Some("http://api.local:9000/".to_string()),
        "APP__WS_URL" => Some("ws://stream.local/ws/".to_string()),
        _ => None,
    });
    assert_eq!(settings.api_url, "http://api.local:9000");
    assert_eq!(settings.ws_url, "ws://stream.local/ws");
}

#[test]
fn page_size_is_clamped() {
    let settings = ClientSettings {
        page_size: 0,
        ..ClientSettings::default()
    };
    assert_eq!(settings.clamped_page_size(), 1);
    let settings = ClientSettings {
        page_size: 1000,
        ..ClientSettings::default()
    };
    assert_eq!(settings.clamped_page_size(), 100);
}
