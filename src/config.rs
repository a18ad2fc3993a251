use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub gate: GateConfig,
    pub queue: QueueConfig,
    pub extract: ExtractConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
}

/// Upscale service endpoint and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub upscale_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_image_bytes: usize,
    pub inter_item_delay_ms: u64,
    pub notification_cooldown_secs: u64,
    pub max_attempts: u32,
    pub recent_status_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub jpeg_quality: u8,
    pub privileged_timeout_secs: u64,
    pub user_agent: String,
    pub probe_per_second: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_path: String,
    pub save_upscaled: bool,
    pub archive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Config {
    /// Loads `path` if it exists, then applies `MANGALIFT__SECTION__KEY`
    /// environment overrides on top of the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("MANGALIFT").separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }
}

impl ServerConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn upscale_timeout(&self) -> Duration {
        Duration::from_secs(self.upscale_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl QueueConfig {
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            health_interval_secs: 30,
            health_timeout_secs: 5,
            upscale_timeout_secs: 120,
            request_timeout_secs: 30,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_width: 200,
            min_height: 200,
            max_width: 3000,
            // Long-strip webtoon chapters ship as one very tall image.
            max_height: 20000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 20 * 1024 * 1024,
            inter_item_delay_ms: 500,
            notification_cooldown_secs: 10,
            max_attempts: 3,
            recent_status_limit: 20,
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 92,
            privileged_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            probe_per_second: 8,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_path: "./upscaled".to_string(),
            save_upscaled: true,
            archive: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:data/mangalift.db".to_string(),
            max_connections: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_expectations() {
        let config = Config::default();
        assert_eq!(config.gate.min_width, 200);
        assert_eq!(config.gate.max_height, 20000);
        assert_eq!(config.queue.max_image_bytes, 20 * 1024 * 1024);
        assert_eq!(config.server.upscale_timeout(), Duration::from_secs(120));
        assert_eq!(config.server.health_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mangalift.toml");
        fs::write(&path, "[gate]\nmin_width = 320\n\n[server]\nbase_url = \"http://10.0.0.2:5000\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gate.min_width, 320);
        assert_eq!(config.gate.min_height, 200);
        assert_eq!(config.server.base_url, "http://10.0.0.2:5000");
    }

    #[test]
    fn missing_file_yields_defaults_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mangalift.toml");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.queue.max_attempts, 3);

        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.storage.output_path, config.storage.output_path);
    }
}
