use crate::security::Vault;
use crate::subscription::{DEFAULT_POLL_RATE_SECONDS, GROUP_COUNT};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "QSYS_";
pub const DEFAULT_QRC_PORT: u16 = 1710;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub auth: AuthConfig,
    pub change_groups: ChangeGroupConfig,
    pub logging: LoggingConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    pub host: String,
    pub port: u16,
    pub redundant_host: Option<String>,
    pub redundancy_enabled: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_QRC_PORT,
            redundant_host: None,
            redundancy_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: Option<String>,
    pub password_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChangeGroupConfig {
    pub poll_rates: [f64; GROUP_COUNT],
}

impl Default for ChangeGroupConfig {
    fn default() -> Self {
        Self {
            poll_rates: [DEFAULT_POLL_RATE_SECONDS; GROUP_COUNT],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub connection_events: bool,
    pub wire_traffic: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            connection_events: true,
            wire_traffic: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub path: Option<String>,
}

#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Everything one client instance needs to reach the engine. Built once and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub primary_host: String,
    pub port: u16,
    pub redundant_host: Option<String>,
    pub redundancy_enabled: bool,
    pub credentials: Option<Credentials>,
    pub poll_rates: [f64; GROUP_COUNT],
    pub log_connection_events: bool,
    pub log_wire_traffic: bool,
}

impl EndpointConfig {
    pub fn new(primary_host: impl Into<String>, port: u16) -> Self {
        Self {
            primary_host: primary_host.into(),
            port,
            redundant_host: None,
            redundancy_enabled: false,
            credentials: None,
            poll_rates: [DEFAULT_POLL_RATE_SECONDS; GROUP_COUNT],
            log_connection_events: false,
            log_wire_traffic: false,
        }
    }

    pub fn with_redundant_host(mut self, host: impl Into<String>) -> Self {
        self.redundant_host = Some(host.into());
        self.redundancy_enabled = true;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            secret: secret.into(),
        });
        self
    }

    pub fn with_poll_rates(mut self, poll_rates: [f64; GROUP_COUNT]) -> Self {
        self.poll_rates = poll_rates;
        self
    }

    pub fn auth_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Failover only makes sense when a standby host is actually known.
    pub fn failover_enabled(&self) -> bool {
        self.redundancy_enabled && self.redundant_host.is_some()
    }
}

/// Protocol timings. The defaults are what the engine expects; tests use
/// shorter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub tcp_keepalive: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(30_000),
            tcp_keepalive: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|err| format!("invalid {}: {err}", config_path.display()))?;
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}CORE_HOST", ENV_PREFIX)) {
            self.core.host = val;
        }
        if let Ok(val) = env::var(format!("{}CORE_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.core.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}REDUNDANT_HOST", ENV_PREFIX)) {
            self.core.redundant_host = Some(val);
        }
        if let Ok(val) = env::var(format!("{}REDUNDANCY_ENABLED", ENV_PREFIX)) {
            self.core.redundancy_enabled = val.parse().unwrap_or(false);
        }

        if let Ok(val) = env::var(format!("{}AUTH_ENABLED", ENV_PREFIX)) {
            self.auth.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var(format!("{}AUTH_USERNAME", ENV_PREFIX)) {
            self.auth.username = Some(val);
        }
        if let Ok(val) = env::var(format!("{}AUTH_PASSWORD_KEY", ENV_PREFIX)) {
            self.auth.password_key = Some(val);
        }

        for (i, rate) in self.change_groups.poll_rates.iter_mut().enumerate() {
            if let Ok(val) = env::var(format!("{}POLL_RATE_{}", ENV_PREFIX, i + 1)) {
                if let Ok(parsed) = val.parse() {
                    *rate = parsed;
                }
            }
        }

        if let Ok(val) = env::var(format!("{}LOG_CONNECTION", ENV_PREFIX)) {
            self.logging.connection_events = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}LOG_WIRE", ENV_PREFIX)) {
            self.logging.wire_traffic = val.parse().unwrap_or(false);
        }

        if let Ok(val) = env::var(format!("{}VAULT_PATH", ENV_PREFIX)) {
            self.vault.path = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.core.host.trim().is_empty() {
            return Err("core.host must be set".into());
        }
        if self.core.port == 0 {
            return Err("core.port must be non-zero".into());
        }
        if self.core.redundancy_enabled
            && self.core.redundant_host.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err("core.redundant_host is required when core.redundancy_enabled = true".into());
        }
        if self.auth.enabled {
            if self.auth.username.as_deref().unwrap_or("").trim().is_empty() {
                return Err("auth.username is required when auth.enabled = true".into());
            }
            if self.auth.password_key.as_deref().unwrap_or("").trim().is_empty() {
                return Err("auth.password_key is required when auth.enabled = true".into());
            }
        }
        for (i, rate) in self.change_groups.poll_rates.iter().enumerate() {
            if !rate.is_finite() || *rate <= 0.0 {
                return Err(format!("change_groups.poll_rates[{i}] must be a positive number").into());
            }
        }
        Ok(())
    }

    /// Resolves the secret for authentication from the vault.
    pub fn endpoint(&self, vault: &Vault) -> Result<EndpointConfig, Box<dyn std::error::Error>> {
        let credentials = if self.auth.enabled {
            let username = self
                .auth
                .username
                .as_deref()
                .ok_or("missing auth.username in config")?
                .trim();
            let key = self
                .auth
                .password_key
                .as_deref()
                .ok_or("missing auth.password_key in config")?
                .trim();
            Some(Credentials {
                username: username.to_string(),
                secret: vault.retrieve(key)?,
            })
        } else {
            None
        };

        Ok(EndpointConfig {
            primary_host: self.core.host.trim().to_string(),
            port: self.core.port,
            redundant_host: self
                .core
                .redundant_host
                .as_deref()
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string),
            redundancy_enabled: self.core.redundancy_enabled,
            credentials,
            poll_rates: self.change_groups.poll_rates,
            log_connection_events: self.logging.connection_events,
            log_wire_traffic: self.logging.wire_traffic,
        })
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join("QsysCoreLink").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
