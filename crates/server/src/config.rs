use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub music_root: String,
    pub index_path: String,
    pub port: u16,
    pub bind_host: String,
    pub ffmpeg_path: String,
    /// Inserted before the engine's own arguments on every invocation.
    pub ffmpeg_global_args: Vec<String>,
    pub default_quality: String,
    pub stream_buffer_chunks: usize,
    pub scan_on_start: bool,
    /// 0 disables the periodic scan.
    pub scan_interval_secs: u64,
    pub watch_music: bool,
    pub watch_debounce_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_root: "".to_string(),
            index_path: "library.redb".to_string(),
            port: 5000,
            bind_host: "0.0.0.0".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_global_args: Vec::new(),
            default_quality: "lossless".to_string(),
            stream_buffer_chunks: 8,
            scan_on_start: true,
            scan_interval_secs: 300,
            watch_music: false,
            watch_debounce_secs: 2,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("WEBMUSIC_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        normalize(&mut config);
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

fn normalize(config: &mut ServerConfig) {
    let defaults = ServerConfig::default();
    if config.version < CONFIG_VERSION {
        config.version = CONFIG_VERSION;
    }
    if config.index_path.trim().is_empty() {
        config.index_path = defaults.index_path;
    }
    if config.port == 0 {
        config.port = defaults.port;
    }
    if config.bind_host.trim().is_empty() {
        config.bind_host = defaults.bind_host;
    }
    if config.ffmpeg_path.trim().is_empty() {
        config.ffmpeg_path = defaults.ffmpeg_path;
    }
    if config.default_quality.trim().is_empty() {
        config.default_quality = defaults.default_quality;
    }
    if config.stream_buffer_chunks == 0 {
        config.stream_buffer_chunks = defaults.stream_buffer_chunks;
    }
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}
