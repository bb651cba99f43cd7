//! Configuration for the WinRM action handler
//!
//! Handles loading configuration from:
//! - Default values
//! - System configuration (/etc/winrm-actionhandler/config.toml)
//! - Project configuration (./winrm-actionhandler.toml)
//! - Environment variables
//!
//! The file has three parts:
//!
//! ```toml
//! [handler]
//! parallel_tasks = 5
//! use_ssl = true
//!
//! # One table per customer; "default" serves requests without a CustomerID
//! [vault.default]
//! url = "https://vault.example.com:7272"
//! token = "..."
//!
//! # One table per jump host, keyed by the RemoteExecutionServer name
//! [jump_hosts.jump1]
//! vault_resource = "jump1.example.com"
//! vault_account = "winrm-cert"
//! ```
//!
//! All tables are read once at startup and shared read-only between actions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::session::Transport;
use crate::vault::VaultEndpoint;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "WINRM_ACTIONHANDLER_CONFIG";

/// Errors raised while loading or querying configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        /// Path to the config file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("Failed to parse config file '{path}': {message}")]
    Parse {
        /// Path to the config file
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// No `[vault.<customer>]` table for the customer.
    #[error("No vault configured for customer '{0}'")]
    MissingTenant(String),

    /// No `[jump_hosts.<name>]` table for the jump host.
    #[error("Jumpserver '{0}' is not configured")]
    MissingJumpHost(String),

    /// A table exists but lacks a required option.
    #[error("Option '{option}' is missing in [{section}]")]
    MissingOption {
        /// Table name, e.g. `vault.default`
        section: String,
        /// Missing key
        option: String,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Handler-wide settings
    pub handler: HandlerConfig,

    /// Vault endpoints keyed by customer id
    pub vault: HashMap<String, TenantVaultConfig>,

    /// Jump hosts keyed by `RemoteExecutionServer` name
    pub jump_hosts: HashMap<String, JumpHostConfig>,
}

/// Handler-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Maximum number of actions running at once
    pub parallel_tasks: usize,

    /// Talk to WinRM over HTTPS (5986) instead of HTTP (5985)
    pub use_ssl: bool,

    /// Verify WinRM server certificates
    pub verify_tls: bool,

    /// WinRM request timeout in seconds
    pub timeout: u64,

    /// Seconds to wait for in-flight actions on shutdown
    pub shutdown_grace: u64,

    /// Directory for temporary client certificate files
    pub cert_dir: Option<PathBuf>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            parallel_tasks: 5,
            use_ssl: true,
            verify_tls: false,
            timeout: 60,
            shutdown_grace: 30,
            cert_dir: None,
        }
    }
}

impl HandlerConfig {
    /// Transport implied by `use_ssl`.
    pub fn transport(&self) -> Transport {
        Transport::from_ssl(self.use_ssl)
    }

    /// WinRM request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

/// Vault settings for one customer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantVaultConfig {
    /// Vault base URL
    pub url: Option<String>,

    /// Pre-shared API token
    pub token: Option<String>,

    /// Verify the vault's TLS certificate
    pub verify_tls: bool,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for TenantVaultConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            verify_tls: true,
            timeout: 30,
        }
    }
}

/// One jump host entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JumpHostConfig {
    /// Vault resource holding the jump host's client certificate
    pub vault_resource: Option<String>,

    /// Vault account holding the jump host's client certificate
    pub vault_account: Option<String>,

    /// Address to connect to (defaults to the table name)
    pub hostname: Option<String>,

    /// WinRM port (defaults by transport)
    pub port: Option<u16>,

    /// Override the handler's `use_ssl` for this jump host
    pub use_ssl: Option<bool>,
}

/// A fully resolved jump host route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpRoute {
    /// Name the request used
    pub name: String,
    /// Address to connect to
    pub hostname: String,
    /// WinRM port
    pub port: u16,
    /// Transport to the jump host
    pub transport: Transport,
    /// Vault resource of the client certificate
    pub vault_resource: String,
    /// Vault account of the client certificate
    pub vault_account: String,
}

fn required(value: &Option<String>, section: &str, option: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(ConfigError::MissingOption {
            section: section.to_string(),
            option: option.to_string(),
        }),
    }
}

impl Config {
    /// Load configuration from the standard locations.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::find_config_file(config_path) {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// First existing config file, explicit path taking priority.
    fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit_path {
            return Some(path.to_path_buf());
        }

        if let Ok(env_config) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(env_config));
        }

        [
            PathBuf::from("winrm-actionhandler.toml"),
            PathBuf::from("/etc/winrm-actionhandler/config.toml"),
        ]
        .into_iter()
        .find(|path| path.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // WINRM_ACTIONHANDLER_PARALLEL_TASKS
        if let Ok(tasks) = std::env::var("WINRM_ACTIONHANDLER_PARALLEL_TASKS") {
            if let Ok(n) = tasks.parse() {
                self.handler.parallel_tasks = n;
            }
        }

        // WINRM_ACTIONHANDLER_TIMEOUT
        if let Ok(timeout) = std::env::var("WINRM_ACTIONHANDLER_TIMEOUT") {
            if let Ok(n) = timeout.parse() {
                self.handler.timeout = n;
            }
        }
    }

    /// Vault endpoint for a customer.
    pub fn vault_endpoint(&self, customer: &str) -> Result<VaultEndpoint, ConfigError> {
        let tenant = self
            .vault
            .get(customer)
            .ok_or_else(|| ConfigError::MissingTenant(customer.to_string()))?;
        let section = format!("vault.{}", customer);

        let url = required(&tenant.url, &section, "url")?;
        let token = required(&tenant.token, &section, "token")?;

        Ok(VaultEndpoint::new(url, token)
            .with_verify_tls(tenant.verify_tls)
            .with_timeout(Duration::from_secs(tenant.timeout)))
    }

    /// Resolve a jump host entry into a route.
    pub fn jump_route(&self, name: &str) -> Result<JumpRoute, ConfigError> {
        let entry = self
            .jump_hosts
            .get(name)
            .ok_or_else(|| ConfigError::MissingJumpHost(name.to_string()))?;
        let section = format!("jump_hosts.{}", name);

        let vault_resource = required(&entry.vault_resource, &section, "vault_resource")?;
        let vault_account = required(&entry.vault_account, &section, "vault_account")?;

        let transport = entry
            .use_ssl
            .map(Transport::from_ssl)
            .unwrap_or_else(|| self.handler.transport());

        Ok(JumpRoute {
            name: name.to_string(),
            hostname: entry.hostname.clone().unwrap_or_else(|| name.to_string()),
            port: entry.port.unwrap_or_else(|| transport.default_port()),
            transport,
            vault_resource,
            vault_account,
        })
    }
}
