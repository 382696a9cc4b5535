//! Configuration handling for the netcore service.
//!
//! Configuration is read from a YAML file and then overridden by `NETCORE_*`
//! environment variables. A missing or unparsable file falls back to the
//! built-in defaults.

use anyhow::{bail, Result};
use netcore_socket::{AddressFamily, IpAddress};
use netcore_storage::StorageMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Transport served by a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    /// TCP, optionally wrapped in TLS
    Tcp,
    /// UDP, one context per client endpoint
    Udp,
}

/// One listening endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Listener name, recorded in every context it registers
    pub name: String,
    /// Local port
    pub port: u16,
    /// Transport
    pub protocol: ListenerProtocol,
    /// Idle minutes before eviction; -1 keeps idle clients forever
    #[serde(default = "default_client_timeout")]
    pub client_timeout_minutes: i64,
    /// Maximum concurrent clients; absent is unlimited
    #[serde(default)]
    pub max_clients: Option<usize>,
    /// Refuse to serve without TLS
    #[serde(default)]
    pub tls_required: bool,
}

fn default_client_timeout() -> i64 {
    -1
}

/// TLS certificate material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key (PKCS#8)
    pub key_file: PathBuf,
}

/// Netcore service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address every listener binds to
    pub bind_address: IpAddress,
    /// Listening endpoints
    pub listeners: Vec<ListenerSettings>,
    /// Certificate material for TLS listeners
    pub tls: Option<TlsSettings>,
    /// Seconds between liveness sweeps
    pub sweep_interval_secs: u64,
    /// Seconds allowed for each connection teardown
    pub close_timeout_secs: u64,
    /// Key store backend
    pub key_store: StorageMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddress::wildcard(AddressFamily::IPv4),
            listeners: vec![
                ListenerSettings {
                    name: "echo".to_string(),
                    port: 7000,
                    protocol: ListenerProtocol::Tcp,
                    client_timeout_minutes: 5,
                    max_clients: Some(1024),
                    tls_required: false,
                },
                ListenerSettings {
                    name: "echo-udp".to_string(),
                    port: 7001,
                    protocol: ListenerProtocol::Udp,
                    client_timeout_minutes: 1,
                    max_clients: Some(1024),
                    tls_required: false,
                },
            ],
            tls: None,
            sweep_interval_secs: 60,
            close_timeout_secs: 5,
            key_store: StorageMode::InMemory,
        }
    }
}

/// Root of the YAML document
#[derive(Debug, Deserialize)]
struct RootConfig {
    netcore: Option<ServerConfig>,
}

impl ServerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// The result is not validated; callers validate once every override,
    /// including command-line flags, has been applied.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(RootConfig { netcore: Some(loaded) }) => {
                    config = loaded;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Ok(RootConfig { netcore: None }) => {
                    warn!("No netcore section in {:?}, using defaults", config_path.as_ref());
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", config_path.as_ref(), e);
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides();

        info!(
            "Final netcore configuration: bind={}, listeners={}, sweep_interval={}s, close_timeout={}s, key_store={:?}",
            config.bind_address,
            config.listeners.len(),
            config.sweep_interval_secs,
            config.close_timeout_secs,
            config.key_store
        );
        Ok(config)
    }

    /// Interval between liveness sweeps
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Bound on each connection teardown
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Reject configurations no listener set could serve
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for listener in &self.listeners {
            if listener.name.is_empty() {
                bail!("Listener on port {} has an empty name", listener.port);
            }
            if !names.insert(listener.name.as_str()) {
                bail!("Duplicate listener name: {}", listener.name);
            }
            if listener.tls_required && listener.protocol == ListenerProtocol::Udp {
                bail!("Listener {} requires TLS but uses UDP", listener.name);
            }
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("NETCORE_BIND_ADDRESS") {
            match IpAddress::parse(&value) {
                Ok(address) => {
                    self.bind_address = address;
                    info!("Bind address overridden by environment: {}", address);
                }
                Err(e) => warn!("Ignoring NETCORE_BIND_ADDRESS: {}", e),
            }
        }

        if let Some(value) = lookup("NETCORE_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                self.sweep_interval_secs = secs;
                info!("Sweep interval overridden by environment: {}s", secs);
            }
        }

        if let Some(value) = lookup("NETCORE_CLOSE_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                self.close_timeout_secs = secs;
                info!("Close timeout overridden by environment: {}s", secs);
            }
        }

        if let (Some(cert_file), Some(key_file)) =
            (lookup("NETCORE_TLS_CERT_FILE"), lookup("NETCORE_TLS_KEY_FILE"))
        {
            self.tls = Some(TlsSettings {
                cert_file: PathBuf::from(cert_file),
                key_file: PathBuf::from(key_file),
            });
            info!("TLS material overridden by environment");
        }

        if let Some(path) = lookup("NETCORE_KEY_STORE_PATH") {
            self.key_store = StorageMode::File {
                path: PathBuf::from(path),
            };
            info!("Key store overridden by environment: {:?}", self.key_store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.to_string(), "0.0.0.0");
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].protocol, ListenerProtocol::Tcp);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.close_timeout(), Duration::from_secs(5));
        assert_eq!(config.key_store, StorageMode::InMemory);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
netcore:
  bind_address: "127.0.0.1"
  sweep_interval_secs: 30
  listeners:
    - name: mail
      port: 2525
      protocol: tcp
      client_timeout_minutes: 10
      max_clients: 50
    - name: dns
      port: 5353
      protocol: udp
  key_store:
    mode: file
    path: /var/lib/netcore/keys.json
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ServerConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.bind_address.to_string(), "127.0.0.1");
        assert_eq!(config.sweep_interval_secs, 30);
        // Unset fields keep their defaults
        assert_eq!(config.close_timeout_secs, 5);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].max_clients, Some(50));
        assert_eq!(config.listeners[1].protocol, ListenerProtocol::Udp);
        assert_eq!(config.listeners[1].client_timeout_minutes, -1);
        assert!(!config.listeners[1].tls_required);
        assert_eq!(
            config.key_store,
            StorageMode::File {
                path: PathBuf::from("/var/lib/netcore/keys.json")
            }
        );
    }

    #[test]
    fn test_missing_or_malformed_file_uses_defaults() {
        let config = ServerConfig::load_from_file("/nonexistent/netcore.yaml").unwrap();
        assert_eq!(config.listeners.len(), 2);

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"netcore: [unclosed").unwrap();
        let config = ServerConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.listeners[0].name, "echo");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = ServerConfig::default();
        config.listeners[1].name = "echo".to_string();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.listeners[1].tls_required = true;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("NETCORE_BIND_ADDRESS", "::1"),
            ("NETCORE_CLOSE_TIMEOUT_SECS", "2"),
            ("NETCORE_SWEEP_INTERVAL_SECS", "not-a-number"),
            ("NETCORE_TLS_CERT_FILE", "/etc/netcore/cert.pem"),
            ("NETCORE_TLS_KEY_FILE", "/etc/netcore/key.pem"),
            ("NETCORE_KEY_STORE_PATH", "keys.json"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.bind_address.to_string(), "::1");
        assert_eq!(config.close_timeout_secs, 2);
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(
            config.tls,
            Some(TlsSettings {
                cert_file: PathBuf::from("/etc/netcore/cert.pem"),
                key_file: PathBuf::from("/etc/netcore/key.pem"),
            })
        );
        assert_eq!(
            config.key_store,
            StorageMode::File {
                path: PathBuf::from("keys.json")
            }
        );
    }
}
