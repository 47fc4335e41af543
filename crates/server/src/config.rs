use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// HS256 secret for channel-authorization grants.
    pub channel_auth_secret: String,
    pub channel_auth_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            channel_auth_secret: "devsecret".into(),
            channel_auth_ttl_seconds: 300,
        }
    }
}

fn env_override(settings_field: &mut String, keys: &[&str]) {
    for key in keys {
        if let Ok(value) = std::env::var(key) {
            *settings_field = value;
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("channel_auth_secret") {
                settings.channel_auth_secret = v.clone();
            }
            if let Some(v) = file_cfg.get("channel_auth_ttl_seconds") {
                if let Ok(parsed) = v.parse::<i64>() {
                    settings.channel_auth_ttl_seconds = parsed;
                }
            }
        }
    }

    env_override(&mut settings.server_bind, &["SERVER_BIND", "APP__BIND_ADDR"]);
    env_override(
        &mut settings.database_url,
        &["DATABASE_URL", "APP__DATABASE_URL"],
    );
    env_override(
        &mut settings.channel_auth_secret,
        &["CHANNEL_AUTH_SECRET", "APP__CHANNEL_AUTH_SECRET"],
    );
    if let Ok(v) = std::env::var("APP__CHANNEL_AUTH_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.channel_auth_ttl_seconds = parsed;
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
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

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn memory_urls_pass_through_untouched() {
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert!(sqlite_path("sqlite::memory:").is_none());
    }

    #[test]
    fn creates_parent_dir_for_absolute_sqlite_url() {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let temp_root = std::env::temp_dir().join(format!("chat_server_test_{suffix}"));
        let db_path = temp_root.join("data").join("test.db");
        let url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

        prepare_database_url(&url).expect("prepare db url");
        assert!(db_path.parent().expect("parent").exists());

        fs::remove_dir_all(temp_root).expect("cleanup");
    }
}
