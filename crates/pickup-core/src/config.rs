//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the backend URL, the project's anon key and the last
//! email used to sign in.
//!
//! Configuration is stored at `~/.config/pickup/config.json`. The
//! `PICKUP_BACKEND_URL` and `PICKUP_ANON_KEY` environment variables take
//! precedence over the file.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::api::BackendSettings;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "pickup";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const BACKEND_URL_ENV: &str = "PICKUP_BACKEND_URL";
pub const ANON_KEY_ENV: &str = "PICKUP_ANON_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub last_email: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Resolve backend settings from the environment and this config.
    pub fn backend(&self) -> Result<BackendSettings> {
        self.backend_with_env(|name| std::env::var(name).ok())
    }

    fn backend_with_env(&self, env: impl Fn(&str) -> Option<String>) -> Result<BackendSettings> {
        let pick = |name: &str, file: &Option<String>| {
            env(name)
                .or_else(|| file.clone())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let url = pick(BACKEND_URL_ENV, &self.backend_url).ok_or_else(|| {
            anyhow::anyhow!("No backend URL configured (set {} or backend_url in config)", BACKEND_URL_ENV)
        })?;
        let anon_key = pick(ANON_KEY_ENV, &self.anon_key).ok_or_else(|| {
            anyhow::anyhow!("No anon key configured (set {} or anon_key in config)", ANON_KEY_ENV)
        })?;

        Ok(BackendSettings::new(url, anon_key))
    }
}
