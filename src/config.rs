//! Job configuration.
//!
//! Jobs are described in a TOML file:
//!
//! ```toml
//! hosts = ["localhost:10022", "localhost:10023"]
//! path = "/data/f.csv"
//! ignore_not_found_hosts = true
//!
//! [auth]
//! type = "password"
//! user = "collector"
//! password = "secret"
//! skip_host_key_verification = true
//! ```
//!
//! The `auth` table is validated into a typed [`Auth`] before anything else
//! runs, so a missing password or unknown auth type fails the job up front
//! instead of at the first connection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sources::target::Target;
use crate::sources::transport::{ConnectOptions, HostKeyPolicy};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default TCP connect + handshake timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default existence-probe timeout in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Errors raised while loading or validating a job configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unsupported auth type: {0}")]
    UnsupportedAuthType(String),

    #[error("auth.password is required when auth.type is \"password\"")]
    MissingPassword,

    #[error("auth.user is not set and the current user could not be determined")]
    UnknownUser,

    #[error(
        "No host key verifier: set auth.load_known_hosts = true or auth.skip_host_key_verification = true"
    )]
    NoHostKeyVerifier,

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

// =============================================================================
// Auth
// =============================================================================

/// Raw `auth` table as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// `"password"` or `"public_key"` (default).
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Login user; defaults to the current process user.
    pub user: Option<String>,
    /// Required when `type = "password"`.
    pub password: Option<String>,
    /// Private key file; absent means agent + default key discovery.
    pub key_path: Option<PathBuf>,
    /// Accept any host key.
    pub skip_host_key_verification: bool,
    /// Verify host keys against a known_hosts file (default true).
    pub load_known_hosts: Option<bool>,
    /// Alternative known_hosts file (default `~/.ssh/known_hosts`).
    pub known_hosts_path: Option<PathBuf>,
}

/// Validated authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Password { user: String, password: String },
    PublicKey { user: String, key_path: Option<PathBuf> },
}

impl Auth {
    pub fn user(&self) -> &str {
        match self {
            Auth::Password { user, .. } | Auth::PublicKey { user, .. } => user,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Auth::Password { .. } => "password",
            Auth::PublicKey { .. } => "public_key",
        }
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Auth::PublicKey { user, key_path } => f
                .debug_struct("PublicKey")
                .field("user", user)
                .field("key_path", key_path)
                .finish(),
        }
    }
}

impl AuthSection {
    /// Validate into an [`Auth`].
    pub fn to_auth(&self) -> Result<Auth, ConfigError> {
        let user = match &self.user {
            Some(user) => user.clone(),
            None => current_user().ok_or(ConfigError::UnknownUser)?,
        };

        match self.kind.as_deref().unwrap_or("public_key") {
            "password" => {
                let password = self.password.clone().ok_or(ConfigError::MissingPassword)?;
                Ok(Auth::Password { user, password })
            }
            "public_key" => Ok(Auth::PublicKey {
                user,
                key_path: self.key_path.clone(),
            }),
            other => Err(ConfigError::UnsupportedAuthType(other.to_string())),
        }
    }

    /// Resolve how host keys are checked.
    pub fn host_key_policy(&self) -> Result<HostKeyPolicy, ConfigError> {
        if self.skip_host_key_verification {
            return Ok(HostKeyPolicy::AcceptAny);
        }
        if !self.load_known_hosts.unwrap_or(true) {
            return Err(ConfigError::NoHostKeyVerifier);
        }
        let path = match &self.known_hosts_path {
            Some(path) => Some(path.clone()),
            None => default_known_hosts_path(),
        };
        Ok(HostKeyPolicy::KnownHosts { path })
    }
}

/// Current process user from the environment.
fn current_user() -> Option<String> {
    dotenvy::var("USER")
        .or_else(|_| dotenvy::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
}

fn default_known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

// =============================================================================
// Job config
// =============================================================================

/// A job configuration. Every key has a default, so an empty file is valid
/// (and selects nothing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Static host candidates.
    pub hosts: Vec<String>,
    /// Local command whose stdout lists the hosts.
    pub hosts_command: Option<String>,
    /// Separator for `hosts_command` output.
    pub hosts_separator: String,
    /// Remote path fetched from every host.
    pub path: String,
    /// Local command whose stdout is the path.
    pub path_command: Option<String>,
    /// Port for hosts without an embedded one.
    #[serde(alias = "port")]
    pub default_port: u16,
    pub auth: AuthSection,
    /// Drop hosts whose existence probe fails instead of failing their unit.
    pub ignore_not_found_hosts: bool,
    /// Persisted watermark.
    pub last_target: Option<Target>,
    pub connect_timeout_secs: u64,
    /// Per-read bound during transfers; absent means unbounded.
    pub transfer_timeout_secs: Option<u64>,
    pub probe_timeout_secs: u64,
    /// Worker pool size; absent means one worker per CPU.
    pub max_parallel: Option<usize>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            hosts_command: None,
            hosts_separator: " ".to_string(),
            path: String::new(),
            path_command: None,
            default_port: DEFAULT_PORT,
            auth: AuthSection::default(),
            ignore_not_found_hosts: false,
            last_target: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            transfer_timeout_secs: None,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            max_parallel: None,
        }
    }
}

impl JobConfig {
    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `REMOTE_INPUT_*` overrides from the environment (or `.env`).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = dotenvy::var("REMOTE_INPUT_DEFAULT_PORT")
            && let Ok(port) = val.parse()
        {
            self.default_port = port;
        }

        if let Ok(val) = dotenvy::var("REMOTE_INPUT_MAX_PARALLEL")
            && let Ok(n) = val.parse()
        {
            self.max_parallel = Some(n);
        }

        if let Ok(val) = dotenvy::var("REMOTE_INPUT_IGNORE_NOT_FOUND_HOSTS") {
            self.ignore_not_found_hosts = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = dotenvy::var("REMOTE_INPUT_TRANSFER_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            self.transfer_timeout_secs = Some(secs);
        }
    }

    /// Validate everything a job needs before it starts and build the
    /// transport options.
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        if self.hosts_command.is_some() && self.hosts_separator.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "hosts_separator",
                reason: "must not be empty".into(),
            });
        }
        if self.default_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "default_port",
                reason: "must be between 1 and 65535".into(),
            });
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "connect_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.probe_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "probe_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_parallel == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "max_parallel",
                reason: "must be at least 1".into(),
            });
        }

        Ok(ConnectOptions {
            auth: self.auth.to_auth()?,
            host_keys: self.auth.host_key_policy()?,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            transfer_timeout: self.transfer_timeout_secs.map(Duration::from_secs),
        })
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Worker pool size.
    pub fn parallelism(&self) -> usize {
        self.max_parallel.unwrap_or_else(rayon::current_num_threads)
    }
}
