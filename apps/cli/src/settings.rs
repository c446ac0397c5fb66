use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use client_core::ClientConfig;
use serde::Deserialize;
use shared::domain::UserId;

pub const DEFAULT_SETTINGS_FILE: &str = "mori.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub backend_url: String,
    pub api_key: Option<String>,
    pub user_id: Option<i64>,
    pub like_echo_window_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8443".into(),
            api_key: None,
            user_id: None,
            like_echo_window_ms: ClientConfig::default().like_echo_window.as_millis() as u64,
        }
    }
}

/// Values accepted in `mori.toml`; anything missing keeps its default.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    backend_url: Option<String>,
    api_key: Option<String>,
    user_id: Option<i64>,
    like_echo_window_ms: Option<u64>,
}

/// Command-line values, applied last.
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    pub user_id: Option<i64>,
}

impl ClientSettings {
    pub fn load(path: &Path, overrides: &SettingsOverrides) -> Result<Self> {
        let file = match fs::read_to_string(path) {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Self::resolve(file.as_deref(), |key| std::env::var(key).ok(), overrides)
    }

    pub fn resolve(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
        overrides: &SettingsOverrides,
    ) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(raw) = file {
            let file: FileSettings = toml::from_str(raw).context("invalid settings file")?;
            if let Some(v) = file.backend_url {
                settings.backend_url = v;
            }
            if let Some(v) = file.api_key {
                settings.api_key = Some(v);
            }
            if let Some(v) = file.user_id {
                settings.user_id = Some(v);
            }
            if let Some(v) = file.like_echo_window_ms {
                settings.like_echo_window_ms = v;
            }
        }

        if let Some(v) = env("MORI_BACKEND_URL") {
            settings.backend_url = v;
        }
        if let Some(v) = env("MORI_API_KEY") {
            settings.api_key = Some(v);
        }
        if let Some(v) = env("MORI_USER_ID") {
            settings.user_id = Some(
                v.trim()
                    .parse()
                    .with_context(|| format!("MORI_USER_ID is not a number: {v}"))?,
            );
        }
        if let Some(v) = env("MORI_LIKE_ECHO_WINDOW_MS") {
            settings.like_echo_window_ms = v
                .trim()
                .parse()
                .with_context(|| format!("MORI_LIKE_ECHO_WINDOW_MS is not a number: {v}"))?;
        }

        if let Some(v) = &overrides.backend_url {
            settings.backend_url = v.clone();
        }
        if let Some(v) = &overrides.api_key {
            settings.api_key = Some(v.clone());
        }
        if let Some(v) = overrides.user_id {
            settings.user_id = Some(v);
        }

        settings.api_key = settings.api_key.filter(|key| !key.trim().is_empty());
        Ok(settings)
    }

    pub fn user(&self) -> Result<UserId> {
        match self.user_id {
            Some(id) => Ok(UserId(id)),
            None => bail!("no user id configured; pass --user-id or set MORI_USER_ID"),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            like_echo_window: Duration::from_millis(self.like_echo_window_ms),
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
