use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub directory: DirectoryConfig,
    pub storage: StorageConfig,
    pub aggregation: AggregationConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reads `config.{toml,json}` if present, then `MONITOR_*` environment
    /// overrides (`MONITOR_METRICS__EMAIL`, `MONITOR_SERVER__PORT`, ...).
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("MONITOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub base_url: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub request_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub expiry_lookahead_secs: i64,
    pub fallback_token_lifetime_secs: i64,
    pub page_size: u32,
    pub granularity: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            email: None,
            password: None,
            request_timeout_secs: 30,
            refresh_interval_secs: 12 * 24 * 3600,
            expiry_lookahead_secs: 5 * 60,
            fallback_token_lifetime_secs: 13 * 24 * 3600,
            page_size: 50,
            granularity: "1m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// `redis://host:port/db`. Unset means the directory is disabled.
    pub url: Option<String>,
    pub key_prefix: String,
    pub timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "v2board_database_AGENT_".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/store.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub sample_window: usize,
    pub fleet_concurrency: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            sample_window: 5,
            fleet_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: "logs".to_string(),
        }
    }
}
