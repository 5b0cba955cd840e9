use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Result, Context};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Socket.IO endpoint path on the dispatch server
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Venue station this display plays for (the routing key)
    pub station_id: Option<String>,
    pub access_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            socket_path: default_socket_path(),
            station_id: None,
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlaybackConfig {
    /// GStreamer element name, e.g. "kmssink" or "waylandsink". playbin picks one if unset.
    pub video_sink: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: u8,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            video_sink: None,
            volume: default_volume(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectivityConfig {
    /// Defaults to the server base URL
    pub probe_url: Option<String>,
    #[serde(with = "humantime_serde", default = "default_probe_interval")]
    pub probe_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_debounce")]
    pub debounce: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
            debounce: default_debounce(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    #[serde(with = "humantime_serde", default = "default_backoff_base")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde", default = "default_backoff_max")]
    pub backoff_max: Duration,
    #[serde(with = "humantime_serde", default = "default_register_timeout")]
    pub register_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            register_timeout: default_register_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost".to_string()
}

fn default_socket_path() -> String {
    "/socket.io".to_string()
}

fn default_volume() -> u8 {
    100
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_debounce() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_register_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub playback: PlaybackConfig,
    pub connectivity: ConnectivityConfig,
    pub connection: ConnectionConfig,
}

pub const ACCESS_TOKEN_ENV: &str = "ROCKOLA_ACCESS_TOKEN";

pub fn config_path() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to get config directory")?
        .join("rockola")
        .join("config.toml"))
}

impl Config {
    pub async fn load() -> Result<Self> {
        let config_path = config_path()?;
        let mut config = Self::load_from(&config_path).await?;

        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.is_empty() {
                config.server.access_token = Some(token);
            }
        }

        Ok(config)
    }

    pub async fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::warn!("No config file found at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(config_path).await
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config = Self::parse(&content)?;
        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// A malformed section falls back to its defaults instead of failing the whole file.
    pub fn parse(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)
            .with_context(|| "Failed to parse config TOML")?;

        let mut section_errors = 0usize;
        let server = parse_section::<ServerConfig>(&table, "server", &mut section_errors);
        let playback = parse_section::<PlaybackConfig>(&table, "playback", &mut section_errors);
        let connectivity = parse_section::<ConnectivityConfig>(&table, "connectivity", &mut section_errors);
        let connection = parse_section::<ConnectionConfig>(&table, "connection", &mut section_errors);

        for key in table.keys() {
            if !matches!(key.as_str(), "server" | "playback" | "connectivity" | "connection") {
                tracing::warn!("Unknown config section [{}] ignored", key);
            }
        }

        if section_errors > 0 {
            tracing::warn!("{} configuration section(s) had errors and were replaced by defaults", section_errors);
        }

        Ok(Config { server, playback, connectivity, connection })
    }

    pub fn probe_url(&self) -> &str {
        self.connectivity
            .probe_url
            .as_deref()
            .unwrap_or(&self.server.base_url)
    }
}

fn parse_section<T>(table: &toml::Table, name: &str, errors: &mut usize) -> T
where
    T: for<'de> Deserialize<'de> + Default,
{
    match table.get(name) {
        Some(v) => v.clone().try_into().unwrap_or_else(|e| {
            tracing::error!("Failed to parse [{}] config section: {}", name, e);
            *errors += 1;
            T::default()
        }),
        None => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.base_url, "http://localhost");
        assert_eq!(config.server.socket_path, "/socket.io");
        assert_eq!(config.playback.volume, 100);
        assert_eq!(config.connectivity.debounce, Duration::from_secs(1));
        assert_eq!(config.connection.backoff_max, Duration::from_secs(30));
        assert_eq!(config.probe_url(), "http://localhost");
    }

    #[test]
    fn sections_and_durations_are_read() {
        let config = Config::parse(
            r#"
            [server]
            base-url = "https://dispatch.example"
            station-id = "65f0c2"
            access-token = "abc"

            [playback]
            video-sink = "kmssink"
            volume = 40

            [connectivity]
            probe-url = "https://probe.example/health"
            probe-interval = "10s"
            debounce = "1500ms"

            [connection]
            backoff-base = "250ms"
            backoff-max = "1m"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.base_url, "https://dispatch.example");
        assert_eq!(config.server.station_id.as_deref(), Some("65f0c2"));
        assert_eq!(config.server.access_token.as_deref(), Some("abc"));
        assert_eq!(config.playback.video_sink.as_deref(), Some("kmssink"));
        assert_eq!(config.playback.volume, 40);
        assert_eq!(config.connectivity.probe_interval, Duration::from_secs(10));
        assert_eq!(config.connectivity.debounce, Duration::from_millis(1500));
        assert_eq!(config.connection.backoff_base, Duration::from_millis(250));
        assert_eq!(config.connection.backoff_max, Duration::from_secs(60));
        assert_eq!(config.probe_url(), "https://probe.example/health");
    }

    #[test]
    fn malformed_section_falls_back_to_defaults() {
        let config = Config::parse(
            r#"
            [server]
            station-id = "65f0c2"

            [playback]
            volume = "loud"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.station_id.as_deref(), Some("65f0c2"));
        assert_eq!(config.playback.volume, 100);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::parse("[server").is_err());
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("rockola-test-missing").join("config.toml");
        let config = Config::load_from(&path).await.unwrap();
        assert!(config.server.station_id.is_none());
    }
}
