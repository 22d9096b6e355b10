//! Configuration management with secure credential storage
//!
//! Handles:
//! - Time-series store connection settings
//! - Per-source descriptor sets (API / web portal / Modbus)
//! - Secret resolution: environment first, config file second, OS keyring last
//! - Cross-platform config and data locations

use anyhow::{Context, Result};
use chrono::NaiveDate;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::model::SourceKind;

const KEYRING_SERVICE: &str = "solharvest";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    pub api: Option<ApiSourceConfig>,
    pub web: Option<WebSourceConfig>,
    pub modbus: Option<ModbusSourceConfig>,
}

/// InfluxDB v2 compatible write target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// Prefer SOLHARVEST_STORE_TOKEN over this value.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            org: "home".to_string(),
            bucket: "solar".to_string(),
            token: None,
        }
    }
}

impl StoreConfig {
    pub fn resolve_token(&self) -> Option<String> {
        std::env::var("SOLHARVEST_STORE_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.token.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Defaults to the OS data directory (`.../solharvest/cache`).
    pub dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("cache")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Defaults to `.../solharvest/spill.jsonl` in the OS data directory.
    pub spill_path: Option<PathBuf>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_secs: 30,
            max_retries: 5,
            backoff_base_ms: 500,
            spill_path: None,
        }
    }
}

impl WriterConfig {
    pub fn resolve_spill_path(&self) -> Result<PathBuf> {
        match &self.spill_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("spill.jsonl")),
        }
    }
}

/// Quota-limited vendor REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSourceConfig {
    pub base_url: String,
    pub site_id: String,
    /// Prefer SOLHARVEST_API_KEY over this value.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_interval_minutes")]
    pub poll_interval_minutes: u64,
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,
    /// Earliest month available for history backfill (e.g. "2021-03-01").
    pub history_start: Option<NaiveDate>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

fn default_api_interval_minutes() -> u64 {
    15
}

fn default_daily_quota() -> u32 {
    300
}

impl ApiSourceConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var("SOLHARVEST_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }

    /// Startup validation. A failure here keeps the API loop from starting
    /// but never affects the other source kinds.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("api.base_url is empty");
        }
        if self.site_id.is_empty() {
            anyhow::bail!("api.site_id is empty");
        }
        if self.resolve_api_key().is_none() {
            anyhow::bail!("no API key: set SOLHARVEST_API_KEY or api.api_key");
        }
        if self.daily_quota == 0 {
            anyhow::bail!("api.daily_quota must be > 0");
        }
        if !self.endpoints.iter().any(|e| e.enabled) {
            anyhow::bail!("api source has no enabled endpoints");
        }
        Ok(())
    }
}

/// Authenticated vendor web portal, scraped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSourceConfig {
    pub base_url: String,
    pub username: String,
    /// Prefer SOLHARVEST_WEB_PASSWORD, then this value, then the OS keyring.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_web_interval_minutes")]
    pub poll_interval_minutes: u64,
    #[serde(default = "default_web_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_web_interval_minutes() -> u64 {
    10
}

fn default_web_cache_ttl_secs() -> u64 {
    300
}

impl WebSourceConfig {
    pub fn resolve_password(&self) -> Option<String> {
        std::env::var("SOLHARVEST_WEB_PASSWORD")
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| self.password.clone())
            .or_else(|| load_keyring_secret("web-portal").ok())
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("web.base_url is empty");
        }
        if self.username.is_empty() {
            anyhow::bail!("web.username is empty");
        }
        if self.resolve_password().is_none() {
            anyhow::bail!(
                "no portal password: set SOLHARVEST_WEB_PASSWORD, web.password or the keyring entry"
            );
        }
        if !self.endpoints.iter().any(|e| e.enabled) {
            anyhow::bail!("web source has no enabled endpoints");
        }
        Ok(())
    }
}

/// Local inverter reachable over Modbus TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSourceConfig {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_modbus_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_modbus_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_modbus_interval_seconds() -> u64 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_modbus_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    250
}

impl ModbusSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("modbus.host is empty");
        }
        let has_registers = self.endpoints.iter().any(|e| {
            e.enabled
                && e.measurements
                    .iter()
                    .any(|m| m.enabled && m.register.is_some())
        });
        if !has_registers {
            anyhow::bail!("modbus source has no enabled register measurements");
        }
        Ok(())
    }
}

/// One source-specific data feed and its declared measurements.
///
/// Resolved once at startup and immutable for the rest of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stamped from the owning config section during load.
    #[serde(default = "default_source_kind")]
    pub source_kind: SourceKind,
    pub device_id: String,
    pub device_type: Option<String>,
    /// API/WEB: request path relative to the base URL.
    pub path: Option<String>,
    /// WEB: CSS selector scoping this device's sub-tree in the page.
    pub device_selector: Option<String>,
    /// MODBUS: unit identifier on the bus.
    pub unit_id: Option<u8>,
    /// API: dotted path to a source-reported timestamp in the payload.
    pub timestamp_path: Option<String>,
    #[serde(default)]
    pub request_params: HashMap<String, String>,
    #[serde(default)]
    pub measurements: Vec<MeasurementSpec>,
}

fn default_true() -> bool {
    true
}

fn default_source_kind() -> SourceKind {
    SourceKind::Api
}

impl EndpointDescriptor {
    pub fn enabled_measurements(&self) -> impl Iterator<Item = &MeasurementSpec> {
        self.measurements.iter().filter(|m| m.enabled)
    }
}

/// One declared measurement on an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub unit: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// API: dotted path to the value inside the JSON payload.
    pub value_path: Option<String>,
    /// WEB: CSS selector inside the device scope.
    pub selector: Option<String>,
    /// MODBUS: starting register address.
    pub register: Option<u16>,
    pub register_format: Option<RegisterFormat>,
    /// MODBUS: multiplier applied to the decoded register value.
    pub scale: Option<f64>,
}

/// Numeric layout of a Modbus register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    U16,
    S16,
    U32,
    F32,
}

impl RegisterFormat {
    /// Number of 16-bit registers the format spans.
    pub fn register_count(&self) -> u16 {
        match self {
            RegisterFormat::U16 | RegisterFormat::S16 => 1,
            RegisterFormat::U32 | RegisterFormat::F32 => 2,
        }
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location (or SOLHARVEST_CONFIG).
    ///
    /// A missing file yields the default (no sources configured); an
    /// unparsable file is a fatal startup error.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        config.stamp_source_kinds();
        Ok(config)
    }

    /// Parse config from a TOML string (used by tests and the smoke binary).
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: AgentConfig = toml::from_str(content).context("invalid config TOML")?;
        config.stamp_source_kinds();
        Ok(config)
    }

    /// Descriptors carry their source kind so downstream stages never have
    /// to know which config section they came from.
    fn stamp_source_kinds(&mut self) {
        if let Some(api) = &mut self.api {
            for endpoint in &mut api.endpoints {
                endpoint.source_kind = SourceKind::Api;
            }
        }
        if let Some(web) = &mut self.web {
            for endpoint in &mut web.endpoints {
                endpoint.source_kind = SourceKind::Web;
            }
        }
        if let Some(modbus) = &mut self.modbus {
            for endpoint in &mut modbus.endpoints {
                endpoint.source_kind = SourceKind::Modbus;
            }
        }
    }

    /// Get OS-specific config file path.
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("SOLHARVEST_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not find config directory"))?;
        path.push("solharvest");
        path.push("config.toml");
        Ok(path)
    }
}

/// OS-specific data directory for cache, session, quota and spill files.
pub fn data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_dir().ok_or_else(|| anyhow::anyhow!("could not find data directory"))?;
    path.push("solharvest");
    Ok(path)
}

/// Load a secret from the OS keyring.
fn load_keyring_secret(user: &str) -> Result<String> {
    let entry = Entry::new(KEYRING_SERVICE, user)?;
    entry.get_password().map_err(Into::into)
}

/// Save a secret to the OS keyring (used by external setup tooling).
pub fn save_keyring_secret(user: &str, secret: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, user)?;
    entry.set_password(secret).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [store]
        url = "http://127.0.0.1:8086"
        org = "home"
        bucket = "solar"
        token = "t0ken"

        [api]
        base_url = "https://api.example.com"
        site_id = "1234"
        api_key = "k3y"
        daily_quota = 300
        history_start = "2021-03-01"

        [[api.endpoints]]
        id = "site-energy"
        device_id = "site-1234"
        path = "/site/1234/energy"

        [[api.endpoints.measurements]]
        name = "energy"
        unit = "Wh"
        min = 0.0
        value_path = "energy.values"

        [modbus]
        host = "192.168.1.100"
        port = 1502

        [[modbus.endpoints]]
        id = "inverter"
        device_id = "inv-1"
        unit_id = 1

        [[modbus.endpoints.measurements]]
        name = "ac_power"
        unit = "W"
        min = 0.0
        max = 20000.0
        register = 40083
        register_format = "f32"
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();

        let api = config.api.as_ref().unwrap();
        assert_eq!(api.daily_quota, 300);
        assert_eq!(api.poll_interval_minutes, 15); // default
        assert_eq!(api.endpoints.len(), 1);
        assert_eq!(api.endpoints[0].source_kind, SourceKind::Api);
        assert!(api.endpoints[0].enabled);

        let modbus = config.modbus.as_ref().unwrap();
        assert_eq!(modbus.port, 1502);
        assert_eq!(modbus.endpoints[0].source_kind, SourceKind::Modbus);
        let spec = &modbus.endpoints[0].measurements[0];
        assert_eq!(spec.register, Some(40083));
        assert_eq!(spec.register_format, Some(RegisterFormat::F32));
        assert_eq!(spec.register_format.unwrap().register_count(), 2);

        assert!(config.web.is_none());
    }

    #[test]
    fn test_api_validation_requires_key() {
        let mut config = AgentConfig::from_toml(SAMPLE).unwrap();
        let api = config.api.as_mut().unwrap();
        api.api_key = None;
        // Only meaningful when the env override is absent.
        if std::env::var("SOLHARVEST_API_KEY").is_err() {
            assert!(api.validate().is_err());
        }
    }

    #[test]
    fn test_modbus_validation_requires_registers() {
        let mut config = AgentConfig::from_toml(SAMPLE).unwrap();
        let modbus = config.modbus.as_mut().unwrap();
        assert!(modbus.validate().is_ok());
        modbus.endpoints[0].measurements[0].register = None;
        assert!(modbus.validate().is_err());
    }

    #[test]
    fn test_default_config_has_no_sources() {
        let config = AgentConfig::default();
        assert!(config.api.is_none());
        assert!(config.web.is_none());
        assert!(config.modbus.is_none());
        assert_eq!(config.writer.batch_size, 500);
    }
}
