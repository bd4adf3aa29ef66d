//! Configuration for the media pipeline
//!
//! Two layers are provided:
//! 1. `EnvConfig` - process environment (server, storage, asset paths, upstream API key)
//! 2. `AppConfig` - `config.toml` pipeline tuning (delays, thresholds, intervals),
//!    hot-reloaded by `ConfigManager` when the file changes on disk

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("{0} is required")]
    MissingVar(&'static str),

    #[error("Invalid value for {key}: {value}")]
    InvalidVar { key: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Debug,
    Release,
    Test,
}

impl FromStr for ServerMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(ServerMode::Debug),
            "release" => Ok(ServerMode::Release),
            "test" => Ok(ServerMode::Test),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub mode: ServerMode,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_idle_connections: usize,
    pub max_open_connections: usize,
}

#[derive(Debug, Clone)]
pub struct AssetPaths {
    pub thumbnail_dir: PathBuf,
    pub performer_dir: PathBuf,
    pub assets_base_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub metadata_api_key: String,
}

/// Settings read from the process environment at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub paths: AssetPaths,
    pub api: ApiConfig,
}

impl EnvConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let string_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let mode = match get("SERVER_MODE") {
            Some(value) => ServerMode::from_str(&value)
                .map_err(|_| ConfigError::InvalidVar { key: "SERVER_MODE", value })?,
            None => ServerMode::Release,
        };

        let api_key = get("ADULTDATALINK_API_KEY").ok_or(ConfigError::MissingVar("ADULTDATALINK_API_KEY"))?;

        Ok(Self {
            server: ServerConfig {
                port: parse_var(get("SERVER_PORT"), "SERVER_PORT", 8080)?,
                host: string_or("SERVER_HOST", "localhost"),
                mode,
                read_timeout: Duration::from_secs(parse_var(get("SERVER_READ_TIMEOUT"), "SERVER_READ_TIMEOUT", 15)?),
                write_timeout: Duration::from_secs(parse_var(get("SERVER_WRITE_TIMEOUT"), "SERVER_WRITE_TIMEOUT", 15)?),
            },
            database: DatabaseConfig {
                path: PathBuf::from(string_or("DATABASE_PATH", "./data/video_storage.db")),
                max_idle_connections: parse_var(get("DB_MAX_IDLE_CONN"), "DB_MAX_IDLE_CONN", 10)?,
                max_open_connections: parse_var(get("DB_MAX_OPEN_CONN"), "DB_MAX_OPEN_CONN", 100)?,
            },
            paths: AssetPaths {
                thumbnail_dir: PathBuf::from(string_or("THUMBNAIL_DIR", "./assets/thumbnails")),
                performer_dir: PathBuf::from(string_or("PERFORMER_DIR", "./assets/performers")),
                assets_base_dir: PathBuf::from(string_or("ASSETS_BASE_DIR", "./assets")),
            },
            api: ApiConfig { metadata_api_key: api_key },
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_var<T: FromStr>(value: Option<String>, key: &'static str, default: T) -> ConfigResult<T> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { key, value: raw }),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// config.toml
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Paths {
    pub log_directory: String,
    pub backup_directory: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            log_directory: "./logs".to_string(),
            backup_directory: "./backups".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    /// "json" or "line"
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "line".to_string(),
            log_to_terminal: true,
            log_to_file: true,
        }
    }
}

/// Outbound pacing. Defaults are the values the upstream forum tolerates.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Rate {
    pub page_delay_ms: u64,
    pub index_page_delay_ms: u64,
    pub thread_delay_ms: u64,
    pub link_delay_ms: u64,
    pub sweep_link_delay_ms: u64,
    pub retry_base_ms: u64,
    pub max_retries: u32,
    pub scraper_timeout_secs: u64,
    pub verifier_timeout_secs: u64,
    pub scraper_max_redirects: usize,
    pub verifier_max_redirects: usize,
}

impl Default for Rate {
    fn default() -> Self {
        Self {
            page_delay_ms: 1_000,
            index_page_delay_ms: 2_000,
            thread_delay_ms: 3_000,
            link_delay_ms: 500,
            sweep_link_delay_ms: 1_000,
            retry_base_ms: 10_000,
            max_retries: 3,
            scraper_timeout_secs: 30,
            verifier_timeout_secs: 15,
            scraper_max_redirects: 10,
            verifier_max_redirects: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_seconds: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { tick_seconds: 30 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CompanionSettings {
    pub health_interval_secs: u64,
    pub analysis_interval_secs: u64,
    pub activity_poll_secs: u64,
    pub summary_interval_hours: u64,
    pub performers_without_thumbnails: i64,
    pub tagging_min_videos: i64,
    pub tagging_max_tags: i64,
    pub linking_min_videos: i64,
    pub linking_max_performers: i64,
    pub previews_missing: i64,
    pub previews_min_videos: i64,
    pub performers_without_metadata: i64,
    pub videos_without_thumbnails: i64,
    pub videos_without_metadata: i64,
}

impl Default for CompanionSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: 3_600,
            analysis_interval_secs: 6 * 3_600,
            activity_poll_secs: 5,
            summary_interval_hours: 24,
            performers_without_thumbnails: 5,
            tagging_min_videos: 50,
            tagging_max_tags: 5,
            linking_min_videos: 100,
            linking_max_performers: 10,
            previews_missing: 20,
            previews_min_videos: 50,
            performers_without_metadata: 10,
            videos_without_thumbnails: 100,
            videos_without_metadata: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WatcherSettings {
    pub settle_delay_ms: u64,
    pub video_extensions: Vec<String>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 5_000,
            video_extensions: ["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VerifierSettings {
    pub sweep_interval_hours: u64,
    pub stale_after_days: i64,
    pub sweep_limit: usize,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            sweep_interval_hours: 24,
            stale_after_days: 7,
            sweep_limit: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JDownloaderSettings {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for JDownloaderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3128".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub logging: Logging,
    pub rate: Rate,
    pub scheduler: SchedulerSettings,
    pub companion: CompanionSettings,
    pub watcher: WatcherSettings,
    pub verifier: VerifierSettings,
    pub jdownloader: JDownloaderSettings,
}

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone)]
pub enum ConfigReloadEvent {
    AppConfig,
}

/// Owns `config.toml` and keeps the in-memory copy in sync with the file.
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
    _watcher: Option<RecommendedWatcher>,
    reload_tx: broadcast::Sender<ConfigReloadEvent>,
}

impl ConfigManager {
    pub async fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir)?;
        let (reload_tx, _) = broadcast::channel(16);

        let mut manager = Self {
            app_config: Arc::new(RwLock::new(app_config)),
            config_dir,
            _watcher: None,
            reload_tx,
        };

        manager.create_default_config()?;
        manager.setup_watcher()?;

        Ok(manager)
    }

    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse {}: {}", CONFIG_FILE, e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                let toml_string = toml::to_string_pretty(&default_config)
                    .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
                fs::write(&config_path, toml_string)?;

                Ok(default_config)
            }
        }
    }

    fn setup_watcher(&mut self) -> ConfigResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&self.config_dir, RecursiveMode::NonRecursive)?;

        let config_dir = self.config_dir.clone();
        let app_config = self.app_config.clone();
        let reload_tx = self.reload_tx.clone();

        tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event { kind: EventKind::Modify(_), paths, .. }) => {
                        let touched = paths
                            .iter()
                            .any(|p| p.file_name().and_then(|n| n.to_str()) == Some(CONFIG_FILE));
                        if !touched {
                            continue;
                        }
                        match Self::load_app_config(&config_dir) {
                            Ok(new_config) => {
                                *app_config.write() = new_config;
                                let _ = reload_tx.send(ConfigReloadEvent::AppConfig);
                                info!("Reloaded app config");
                            }
                            Err(e) => error!("Failed to reload app config: {}", e),
                        }
                    }
                    Err(e) => error!("Config watch error: {}", e),
                    _ => {}
                }
            }
        });

        self._watcher = Some(watcher);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigReloadEvent> {
        self.reload_tx.subscribe()
    }

    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let config_path = self.config_dir.join(CONFIG_FILE);
        let toml_string = toml::to_string_pretty(config).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(&config_path, toml_string)?;

        *self.app_config.write() = config.clone();
        Ok(())
    }

    fn create_default_config(&self) -> ConfigResult<()> {
        let config_path = self.config_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            let default_config = AppConfig::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
            fs::write(&config_path, toml_string)?;
            *self.app_config.write() = default_config;
        }
        Ok(())
    }
}

pub async fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
    Ok(Arc::new(ConfigManager::new(config_dir).await?))
}
