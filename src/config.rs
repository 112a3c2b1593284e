//! Configuration management for lanvault

use crate::crypto::KdfParams;
use crate::error::{Error, Result};
use crate::sync::{DiscoverySettings, SyncSettings, DEFAULT_TCP_PORT, DEFAULT_WS_PORT};
use crate::sync::discovery::{DEFAULT_DISCOVERY_PORT, DEFAULT_MULTICAST_GROUP};
use crate::vault::{VaultSettings, DEFAULT_AUTO_LOCK_MS};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default auto-sync interval (seconds)
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Default per-message sync timeout (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Vault location and session behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault database directory
    pub path: PathBuf,

    /// Inactivity before the vault locks itself; 0 disables auto-lock
    pub auto_lock_timeout_ms: u64,
}

/// Argon2id costs, only used when a vault is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub memory_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

/// This device as seen by peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Fixed device id; derived from the host when unset
    pub id: Option<String>,

    /// Human-readable device name
    pub name: String,
}

/// Sync server and client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Periodically sync with discovered peers
    pub auto_sync: bool,
    pub interval_secs: u64,
    pub request_timeout_ms: u64,
    pub tcp_port: u16,
    pub ws_port: u16,
    /// Address the sync listeners bind to
    pub bind: IpAddr,
}

/// Multicast discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub multicast_group: Ipv4Addr,
    pub port: u16,
    pub announce_interval_secs: u64,
    pub peer_ttl_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path; stderr when unset
    pub file: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vault: VaultConfig,
    pub kdf: KdfConfig,
    pub device: DeviceConfig,
    pub sync: SyncConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

/// Default data directory
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanvault")
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            path: data_dir().join("vault"),
            auto_lock_timeout_ms: DEFAULT_AUTO_LOCK_MS,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        KdfConfig {
            memory_cost_kib: KdfParams::DEFAULT.memory_cost,
            time_cost: KdfParams::DEFAULT.time_cost,
            parallelism: KdfParams::DEFAULT.parallelism,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: None,
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "lanvault-device".to_string()),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            enabled: true,
            auto_sync: true,
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            tcp_port: DEFAULT_TCP_PORT,
            ws_port: DEFAULT_WS_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            enabled: true,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_DISCOVERY_PORT,
            announce_interval_secs: 5,
            peer_ttl_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        data_dir().join("config.yaml")
    }

    /// Load configuration from a file (YAML or JSON), with environment
    /// variable substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::parse(&content, is_yaml(path_ref))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults; overrides apply either way
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config text after `${VAR}` substitution
    pub fn parse(content: &str, yaml: bool) -> Result<Self> {
        let content = Self::substitute_env_vars(content)?;
        if yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))
        }
    }

    /// Substitute environment variables in config content.
    /// Supports ${VAR_NAME} syntax; unset variables are left as written.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| Error::Internal(format!("env pattern: {}", e)))?;

        let result = re.replace_all(content, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        });
        Ok(result.into_owned())
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(path) = value("LANVAULT_VAULT_PATH") {
            self.vault.path = PathBuf::from(path);
        }

        if let Some(ms) = value("LANVAULT_AUTO_LOCK_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.vault.auto_lock_timeout_ms = ms;
        }

        if let Some(name) = value("LANVAULT_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(port) = value("LANVAULT_SYNC_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.sync.tcp_port = port;
        }

        if let Some(level) = value("LANVAULT_LOG") {
            self.logging.level = level;
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to YAML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to JSON: {}", e)))?
        };

        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.vault.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("Vault path is required".to_string()));
        }

        if self.kdf.memory_cost_kib < 8 * self.kdf.parallelism.max(1) {
            return Err(Error::InvalidConfig(
                "KDF memory cost must be at least 8 KiB per lane".to_string(),
            ));
        }

        if self.kdf.time_cost == 0 || self.kdf.parallelism == 0 {
            return Err(Error::InvalidConfig(
                "KDF time cost and parallelism must be greater than 0".to_string(),
            ));
        }

        if self.device.name.trim().is_empty() {
            return Err(Error::InvalidConfig("Device name is required".to_string()));
        }

        if self.sync.enabled {
            if self.sync.tcp_port == 0 || self.sync.ws_port == 0 {
                return Err(Error::InvalidConfig("Sync ports must be non-zero".to_string()));
            }
            if self.sync.tcp_port == self.sync.ws_port {
                return Err(Error::InvalidConfig(
                    "Sync TCP and WebSocket ports must differ".to_string(),
                ));
            }
            if self.sync.interval_secs == 0 || self.sync.request_timeout_ms == 0 {
                return Err(Error::InvalidConfig(
                    "Sync interval and request timeout must be greater than 0".to_string(),
                ));
            }
        }

        if self.discovery.enabled {
            if !self.discovery.multicast_group.is_multicast() {
                return Err(Error::InvalidConfig(format!(
                    "{} is not a multicast address",
                    self.discovery.multicast_group
                )));
            }
            if self.discovery.announce_interval_secs == 0 {
                return Err(Error::InvalidConfig(
                    "Announce interval must be greater than 0".to_string(),
                ));
            }
            if self.discovery.peer_ttl_secs <= self.discovery.announce_interval_secs {
                return Err(Error::InvalidConfig(
                    "Peer TTL must exceed the announce interval".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        if let Some(parent) = self.vault.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.logging.file.as_ref().and_then(|f| f.parent()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Session settings for opening or creating the vault
    pub fn vault_settings(&self) -> VaultSettings {
        VaultSettings {
            auto_lock_timeout: match self.vault.auto_lock_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            kdf: KdfParams {
                memory_cost: self.kdf.memory_cost_kib,
                time_cost: self.kdf.time_cost,
                parallelism: self.kdf.parallelism,
            },
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            request_timeout: Duration::from_millis(self.sync.request_timeout_ms),
            interval: Duration::from_secs(self.sync.interval_secs),
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            group: self.discovery.multicast_group,
            port: self.discovery.port,
            announce_interval: Duration::from_secs(self.discovery.announce_interval_secs),
            peer_ttl: Duration::from_secs(self.discovery.peer_ttl_secs),
            sync_port: self.sync.tcp_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.vault.auto_lock_timeout_ms, 300_000);
        assert_eq!(config.sync.tcp_port, 47321);
        assert_eq!(config.sync.ws_port, 47322);
        assert_eq!(config.discovery.port, 47320);
        assert!(config.vault.path.ends_with("lanvault/vault"));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "vault:\n  auto_lock_timeout_ms: 60000\nsync:\n  tcp_port: 50000\n";
        let config = Config::parse(yaml, true).unwrap();
        assert_eq!(config.vault.auto_lock_timeout_ms, 60_000);
        assert_eq!(config.sync.tcp_port, 50_000);
        assert_eq!(config.sync.ws_port, DEFAULT_WS_PORT);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("LANVAULT_TEST_SUBST_NAME", "kitchen-laptop");
        let json = r#"{"device": {"name": "${LANVAULT_TEST_SUBST_NAME}"},
                       "logging": {"level": "${LANVAULT_TEST_SUBST_UNSET}"}}"#;
        let config = Config::parse(json, false).unwrap();
        assert_eq!(config.device.name, "kitchen-laptop");
        assert_eq!(config.logging.level, "${LANVAULT_TEST_SUBST_UNSET}");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("LANVAULT_VAULT_PATH", "/tmp/other-vault"),
            ("LANVAULT_AUTO_LOCK_MS", "0"),
            ("LANVAULT_DEVICE_NAME", " desk "),
            ("LANVAULT_SYNC_PORT", "not-a-port"),
            ("LANVAULT_LOG", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.vault.path, PathBuf::from("/tmp/other-vault"));
        assert_eq!(config.vault.auto_lock_timeout_ms, 0);
        assert_eq!(config.device.name, "desk");
        assert_eq!(config.sync.tcp_port, DEFAULT_TCP_PORT);
        assert_eq!(config.logging.level, "debug");
        assert!(config.vault_settings().auto_lock_timeout.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.sync.ws_port = config.sync.tcp_port;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.discovery.multicast_group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.discovery.peer_ttl_secs = config.discovery.announce_interval_secs;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.kdf.time_cost = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_save_and_load_both_formats() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.device.id = Some("fixed-id".to_string());
        config.kdf.memory_cost_kib = 1024;

        for name in ["config.yaml", "config.json"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            let loaded = Config::parse(&std::fs::read_to_string(&path).unwrap(), is_yaml(&path)).unwrap();
            assert_eq!(loaded, config);
        }
    }

    #[test]
    fn test_settings_conversions() {
        let mut config = Config::default();
        config.vault.auto_lock_timeout_ms = 1500;
        config.sync.tcp_port = 50_001;
        config.discovery.peer_ttl_secs = 90;

        let vault = config.vault_settings();
        assert_eq!(vault.auto_lock_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(vault.kdf, KdfParams::DEFAULT);

        let discovery = config.discovery_settings();
        assert_eq!(discovery.sync_port, 50_001);
        assert_eq!(discovery.peer_ttl, Duration::from_secs(90));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
