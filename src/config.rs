// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "rabbitmq-bridge.json";

/// Broker coordinates and connection tuning. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default)]
    pub process_limit: Option<u64>,
    #[serde(default)]
    pub error_exchange: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_user() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 30 }
fn default_connect_attempts() -> u32 { 1 }
fn default_reconnect_delay() -> u64 { 1000 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            vhost: default_vhost(),
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
            connect_attempts: default_connect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI understood by lapin, heartbeat and timeout included as query parameters.
    pub fn uri(&self) -> String {
        self.build_uri(&percent_encode(&self.password))
    }

    /// Same as [`BrokerConfig::uri`] with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        self.build_uri("****")
    }

    fn build_uri(&self, password: &str) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            percent_encode(&self.user),
            password,
            self.host,
            self.port,
            percent_encode(&self.vhost),
            self.heartbeat_seconds,
            self.connection_timeout_ms,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("Configuration error: broker.host cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("Configuration error: broker.port must be non-zero"));
        }
        if self.connect_attempts == 0 {
            return Err(anyhow!("Configuration error: broker.connect_attempts must be at least 1"));
        }
        Ok(())
    }
}

// Userinfo and vhost segments only keep RFC 3986 unreserved characters verbatim.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn percent_encode(raw: &str) -> String {
    utf8_percent_encode(raw, URI_COMPONENT).to_string()
}

pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn read_config_file(path: &Path) -> Result<AppConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")
}

/// Loads the explicit file, or the first discovered one, or defaults; then applies
/// `AMQP_*` environment overrides (a `.env` file is honoured).
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let mut config = match explicit.map(Path::to_path_buf).or_else(find_config_file) {
        Some(path) => read_config_file(&path)?,
        None => {
            debug!("No configuration file found, using defaults");
            AppConfig::default()
        }
    };

    dotenv::dotenv().ok();
    apply_overrides(&mut config, |key| std::env::var(key).ok())?;

    config.broker.validate()?;
    Ok(config)
}

pub fn apply_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("AMQP_HOST") {
        config.broker.host = host;
    }
    if let Some(port) = lookup("AMQP_PORT") {
        config.broker.port = port
            .parse()
            .context(format!("AMQP_PORT is not a valid port: {}", port))?;
    }
    if let Some(user) = lookup("AMQP_USER") {
        config.broker.user = user;
    }
    if let Some(password) = lookup("AMQP_PASSWORD") {
        config.broker.password = password;
    }
    if let Some(vhost) = lookup("AMQP_VHOST") {
        config.broker.vhost = vhost;
    }
    if let Some(limit) = lookup("AMQP_PROCESS_LIMIT") {
        let limit: u64 = limit
            .parse()
            .context(format!("AMQP_PROCESS_LIMIT is not a number: {}", limit))?;
        config.consumer.process_limit = (limit > 0).then_some(limit);
    }
    if let Some(exchange) = lookup("AMQP_ERROR_EXCHANGE") {
        config.consumer.error_exchange = (!exchange.is_empty()).then_some(exchange);
    }
    Ok(())
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&AppConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
