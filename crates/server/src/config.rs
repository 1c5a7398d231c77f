use std::{collections::HashMap, fs};

use realtime::DeliveryPolicy;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub auth_secret: String,
    pub token_ttl_seconds: i64,
    pub edit_window_seconds: i64,
    pub delete_window_seconds: i64,
    pub notify_batch_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/chat.db".into(),
            auth_secret: "devsecret".into(),
            token_ttl_seconds: 86_400,
            edit_window_seconds: 900,
            delete_window_seconds: 3_600,
            notify_batch_ms: 2_000,
        }
    }
}

impl Settings {
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            edit_window: chrono::Duration::seconds(self.edit_window_seconds),
            delete_window: chrono::Duration::seconds(self.delete_window_seconds),
            batch_window: std::time::Duration::from_millis(self.notify_batch_ms),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr").and_then(toml::Value::as_str) {
                settings.server_bind = v.to_string();
            }
            if let Some(v) = file_cfg.get("database_url").and_then(toml::Value::as_str) {
                settings.database_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("auth_secret").and_then(toml::Value::as_str) {
                settings.auth_secret = v.to_string();
            }
            if let Some(v) = file_cfg
                .get("token_ttl_seconds")
                .and_then(toml::Value::as_integer)
            {
                settings.token_ttl_seconds = v;
            }
            if let Some(v) = file_cfg
                .get("edit_window_seconds")
                .and_then(toml::Value::as_integer)
            {
                settings.edit_window_seconds = v;
            }
            if let Some(v) = file_cfg
                .get("delete_window_seconds")
                .and_then(toml::Value::as_integer)
            {
                settings.delete_window_seconds = v;
            }
            if let Some(v) = file_cfg
                .get("notify_batch_ms")
                .and_then(toml::Value::as_integer)
            {
                settings.notify_batch_ms = v.max(0) as u64;
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("AUTH_SECRET") {
        settings.auth_secret = v;
    }
    if let Ok(v) = std::env::var("APP__AUTH_SECRET") {
        settings.auth_secret = v;
    }

    if let Ok(v) = std::env::var("APP__TOKEN_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.token_ttl_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__EDIT_WINDOW_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.edit_window_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__DELETE_WINDOW_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.delete_window_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__NOTIFY_BATCH_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.notify_batch_ms = parsed;
        }
    }

    settings
}

/// Accepts bare file paths and `sqlite:path` shorthand; anything already
/// carrying a scheme passes through. Parent directories are the storage
/// layer's concern.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
