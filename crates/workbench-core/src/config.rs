use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths;

const CONFIG_FILE_PATH: &str = "workbench.toml";
const DEFAULT_API_BASE: &str = "http://localhost:8000/api";
const DEFAULT_STREAM_PATH: &str = "/chat/stream";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbenchConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    /// Path appended to `api_base` for the streaming completion endpoint.
    pub stream_path: String,
    pub enable_evaluation: bool,
    /// Directory for conversation records; `~/.chat-workbench/conversations`
    /// when unset.
    pub data_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            enable_evaluation: false,
            data_dir: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

pub(crate) fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl WorkbenchConfig {
    /// Load `~/.chat-workbench/config.json`, falling back to
    /// `./workbench.toml`, then apply `WORKBENCH_*` environment overrides.
    pub fn load() -> Self {
        let mut config = Self::from_files(&paths::config_json_path(), Path::new(CONFIG_FILE_PATH));
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    pub fn from_files(json_path: &Path, toml_path: &Path) -> Self {
        if json_path.exists() {
            match std::fs::read_to_string(json_path) {
                Ok(content) => match serde_json::from_str::<WorkbenchConfig>(&content) {
                    Ok(config) => return config,
                    Err(error) => {
                        log::warn!("Ignoring invalid config {}: {}", json_path.display(), error)
                    }
                },
                Err(error) => log::warn!("Failed to read {}: {}", json_path.display(), error),
            }
        }

        if toml_path.exists() {
            match std::fs::read_to_string(toml_path) {
                Ok(content) => match toml::from_str::<WorkbenchConfig>(&content) {
                    Ok(config) => return config,
                    Err(error) => {
                        log::warn!("Ignoring invalid config {}: {}", toml_path.display(), error)
                    }
                },
                Err(error) => log::warn!("Failed to read {}: {}", toml_path.display(), error),
            }
        }

        Self::default()
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_base) = lookup("WORKBENCH_API_BASE") {
            self.api_base = api_base;
        }
        if let Some(api_key) = lookup("WORKBENCH_API_KEY") {
            self.api_key = Some(api_key).filter(|key| !key.trim().is_empty());
        }
        if let Some(enabled) = lookup("WORKBENCH_ENABLE_EVALUATION") {
            self.enable_evaluation = parse_bool_env(&enabled);
        }
        if let Some(data_dir) = lookup("WORKBENCH_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(data_dir));
        }
        if let Some(timeout) = lookup("WORKBENCH_TIMEOUT_SECS") {
            match timeout.trim().parse() {
                Ok(secs) => self.request_timeout_secs = secs,
                Err(_) => log::warn!("Ignoring invalid WORKBENCH_TIMEOUT_SECS: {}", timeout),
            }
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(paths::conversations_dir)
    }

    pub fn stream_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            self.stream_path.trim_start_matches('/')
        )
    }
}
