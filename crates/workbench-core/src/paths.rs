use std::path::PathBuf;

/// Workbench home directory (`~/.chat-workbench`).
pub fn workbench_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".chat-workbench")
}

pub fn config_json_path() -> PathBuf {
    workbench_dir().join("config.json")
}

/// Default location of the conversation records.
pub fn conversations_dir() -> PathBuf {
    workbench_dir().join("conversations")
}
