use crate::containment::ZoneScope;
use crate::reconcile::DEFAULT_HEARTBEAT_MS;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub base_url: String,
    pub ws_url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            ws_url: "ws://localhost:3000/ws".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionSettings {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub heartbeat_secs: f64,
    pub zone_scope: ZoneScope,
    pub refresh_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: DEFAULT_HEARTBEAT_MS as f64 / 1000.0,
            zone_scope: ZoneScope::default(),
            refresh_secs: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageSettings {
    pub data_dir: Option<PathBuf>,   // Overrides <data_dir>/petfence
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                log::warn!("Ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                log::warn!("Could not read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("petfence")
            .join("config.toml")
    }

    /// Heartbeat as a chrono duration, never below one second.
    pub fn heartbeat(&self) -> chrono::Duration {
        let ms = (self.monitor.heartbeat_secs.max(1.0) * 1000.0).round() as i64;
        chrono::Duration::milliseconds(ms)
    }
}
