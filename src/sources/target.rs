//! Fetch targets and the incremental-load watermark.
//!
//! A [`Target`] is one `(host, path)` pair. Targets are totally ordered by
//! their canonical `host:path` string, and that order is what the watermark
//! uses: a target is eligible for a run iff there is no watermark yet or the
//! target sorts strictly after it.
//!
//! The order is purely lexicographic. `localhost:10022:/f` sorts before
//! `localhost:10023:/f`, `host10` sorts before `host9`, and a host named `a`
//! that appears after `z` became the watermark is never selected again.
//! Downstream configurations rely on this, so it is kept as is.
//!
//! # Example
//!
//! ```rust
//! use remote_file_input::sources::target::{Target, is_selected};
//!
//! let watermark = Target::new("localhost:10022", "/data/f.csv");
//! let next = Target::new("localhost:10023", "/data/f.csv");
//!
//! assert!(is_selected(&next, Some(&watermark)));
//! assert!(!is_selected(&watermark, Some(&watermark)));
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The persisted incremental-load cursor: the maximum target of the last
/// fully committed run. `None` on the first run.
pub type Watermark = Option<Target>;

/// A single `(host, path)` fetch unit.
///
/// `host` may embed a port (`host:port`, `[v6addr]:port`). Equality and
/// ordering are defined on the canonical string, so two targets whose
/// `host:path` strings coincide are the same target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub path: String,
}

impl Target {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }

    /// Canonical `host:path` form.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.host, self.path)
    }

    fn canonical_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.host
            .bytes()
            .chain(std::iter::once(b':'))
            .chain(self.path.bytes())
    }

    /// Resolve the connection endpoint, using `default_port` when the host
    /// carries no port of its own.
    pub fn endpoint(&self, default_port: u16) -> Result<Endpoint, EndpointError> {
        Endpoint::parse(&self.host, default_port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Target {}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Target {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_bytes().cmp(other.canonical_bytes())
    }
}

/// Selection predicate: `watermark is absent || target > watermark`.
pub fn is_selected(target: &Target, watermark: Option<&Target>) -> bool {
    match watermark {
        None => true,
        Some(mark) => target > mark,
    }
}

/// The watermark a fully committed run over `targets` leaves behind.
///
/// `None` for an empty task set, in which case the previous watermark stays.
pub fn next_watermark(targets: &[Target]) -> Option<Target> {
    targets.iter().max().cloned()
}

// =============================================================================
// Endpoints
// =============================================================================

/// Errors parsing a host string into a connection endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Host is empty")]
    EmptyHost,

    #[error("Invalid port `{port}` in host `{host}`")]
    InvalidPort { host: String, port: String },

    #[error("Unterminated IPv6 literal in host `{0}`")]
    UnterminatedBracket(String),
}

/// Network address of a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host`, `host:port`, `[addr]` or `[addr]:port`.
    ///
    /// A bare IPv6 address (more than one colon, no brackets) is taken as a
    /// host without a port.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, EndpointError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EndpointError::EmptyHost);
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (addr, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointError::UnterminatedBracket(raw.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(raw, port)?,
                None if tail.is_empty() => default_port,
                None => {
                    return Err(EndpointError::InvalidPort {
                        host: raw.to_string(),
                        port: tail.to_string(),
                    });
                }
            };
            return Ok(Self {
                host: addr.to_string(),
                port,
            });
        }

        match raw.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                if host.is_empty() {
                    return Err(EndpointError::EmptyHost);
                }
                Ok(Self {
                    host: host.to_string(),
                    port: parse_port(raw, port)?,
                })
            }
            _ => Ok(Self {
                host: raw.to_string(),
                port: default_port,
            }),
        }
    }
}

fn parse_port(raw: &str, port: &str) -> Result<u16, EndpointError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| EndpointError::InvalidPort {
            host: raw.to_string(),
            port: port.to_string(),
        })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// =============================================================================
// Config diff
// =============================================================================

/// Job output carried into the next run's configuration.
///
/// `last_target` is omitted entirely when the run had nothing to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_target: Option<Target>,
}

impl ConfigDiff {
    /// Diff for a fully committed task set.
    pub fn for_task_set(targets: &[Target]) -> Self {
        Self {
            last_target: next_watermark(targets),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_target.is_none()
    }

    /// Load a diff file. A missing file is an empty diff.
    pub fn load(path: &Path) -> Result<Self, io::Error> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Write the diff as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), io::Error> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
    }
}
