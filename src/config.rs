use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::logger::log;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8711;
pub const APP_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

pub fn get_config_dir() -> PathBuf {
    let mut path = dirs::home_dir().expect("Could not find home directory");
    path.push(".passkeep");
    path
}

/// Server base URL. `PASSKEEP_SERVER` overrides whatever the config says.
pub fn get_server_url(host: &str, port: u16) -> String {
    std::env::var("PASSKEEP_SERVER").unwrap_or_else(|_| format!("http://{}:{}", host, port))
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

pub fn load_config() -> AppConfig {
    let dir = get_config_dir();
    fs::create_dir_all(&dir).ok();
    load_config_from(&dir.join("config.toml"))
}

fn load_config_from(path: &Path) -> AppConfig {
    if !path.exists() {
        let default_config = AppConfig::default();
        if let Ok(toml_str) = toml::to_string_pretty(&default_config) {
            let _ = write_private(path, toml_str.as_bytes());
        }
        return default_config;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to parse config.toml: {}.", e);
                let backup_path = path.with_extension("toml.bak");
                if let Err(backup_err) = fs::rename(path, &backup_path) {
                    eprintln!("Failed to backup corrupted config: {}", backup_err);
                } else {
                    eprintln!("Corrupted config backed up to {:?}", backup_path);
                }
                eprintln!("Using default configuration.");
                AppConfig::default()
            }
        },
        Err(e) => {
            eprintln!("Failed to read config file: {}. Using default.", e);
            AppConfig::default()
        }
    }
}

// Owner-only file, secrets end up in these.
fn write_private(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

/// One "remember me" tuple. The most recent entry drives silent login at
/// startup; a new entry is written after every successful manual login.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryEntry {
    pub username: String,
    pub password: String,
    pub secret_key: String,
    pub host: String,
    pub port: u16,
    pub token: String,
    pub saved: String,
    pub silently_login: bool,
}

/// Local login-history store, kept as a JSON list on disk.
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_store() -> Self {
        Self::new(get_config_dir().join("history.json"))
    }

    pub fn load(&self) -> Vec<HistoryEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };

        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                log(&format!("history: unreadable file, starting fresh: {}", e));
                let backup = self.path.with_extension("json.bak");
                let _ = fs::rename(&self.path, backup);
                Vec::new()
            }
        }
    }

    /// Last saved login, if any.
    pub fn last(&self) -> Option<HistoryEntry> {
        self.load().into_iter().last()
    }

    pub fn push(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        let mut entries = self.load();
        entries.retain(|e| e.username != entry.username || e.host != entry.host);
        entries.push(entry);

        let json = serde_json::to_string_pretty(&entries)?;
        write_private(&self.path, json.as_bytes())?;
        log("history: entry saved");
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            log("history: cleared");
        }
        Ok(())
    }
}
