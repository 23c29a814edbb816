use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::retrieval::SearchMethod;

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers for batch import. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Defaults for `search`.
    pub search: SearchConfig,
}

/// Search defaults. The match threshold is never configured here: every
/// search has to state it.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub method: SearchMethod,
    /// Candidates fetched from the index before reranking.
    pub pre_filter_limit: usize,
    /// Results returned.
    pub limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            method: SearchMethod::Frames,
            pre_filter_limit: 50,
            limit: 5,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/songmatch/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Database path: CLI flag, then config file, then the XDG default.
    pub fn resolve_db_path(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.db_path.clone())
            .unwrap_or_else(default_db_path)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("songmatch.db")
    } else {
        // Fallback: current directory
        PathBuf::from("songmatch.db")
    }
}
