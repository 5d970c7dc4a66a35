//! In-process transport backed by a host → files map.
//!
//! Serves the same contract as the SSH transport (listing probes, file and
//! directory downloads, unreachable hosts) without any network, and records
//! every connection and download so callers can assert on what was fetched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::target::Endpoint;
use super::transport::{CommandOutput, ConnectOptions, Connection, Transport, TransportError};
use crate::config::DEFAULT_PORT;

type Files = BTreeMap<String, Vec<u8>>;

/// A fake fleet of hosts.
#[derive(Default)]
pub struct MemoryTransport {
    hosts: RwLock<HashMap<Endpoint, Files>>,
    unreachable: RwLock<HashSet<Endpoint>>,
    connects: AtomicUsize,
    downloads: Arc<Mutex<Vec<String>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to `host` (`host` or `host:port`, default port 22).
    pub fn with_file(self, host: &str, path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.add_file(host, path, bytes);
        self
    }

    pub fn add_file(&self, host: &str, path: &str, bytes: impl Into<Vec<u8>>) {
        self.hosts
            .write()
            .entry(endpoint_key(host))
            .or_default()
            .insert(path.to_string(), bytes.into());
    }

    /// Make `host` refuse (or accept again) connections.
    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let key = endpoint_key(host);
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(&key);
        } else {
            unreachable.insert(key);
        }
    }

    /// Number of successful connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Completed downloads as `endpoint:path`, in completion order.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }
}

fn endpoint_key(host: &str) -> Endpoint {
    Endpoint::parse(host, DEFAULT_PORT).unwrap_or_else(|_| Endpoint {
        host: host.to_string(),
        port: DEFAULT_PORT,
    })
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        endpoint: &Endpoint,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        if self.unreachable.read().contains(endpoint) {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "Connection refused".into(),
            });
        }
        let files = self
            .hosts
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "No route to host".into(),
            })?;

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            endpoint: endpoint.clone(),
            files: Some(files),
            downloads: Arc::clone(&self.downloads),
        }))
    }
}

struct MemoryConnection {
    endpoint: Endpoint,
    files: Option<Files>,
    downloads: Arc<Mutex<Vec<String>>>,
}

impl MemoryConnection {
    fn files(&self) -> Result<&Files, TransportError> {
        self.files.as_ref().ok_or(TransportError::Closed)
    }

    /// Files matching `path`: the file itself, or everything beneath it when
    /// it names a directory (the empty path matches every file).
    fn matching(&self, path: &str) -> Result<Vec<(&String, &Vec<u8>)>, TransportError> {
        let files = self.files()?;
        if let Some((name, bytes)) = files.get_key_value(path) {
            return Ok(vec![(name, bytes)]);
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(files
            .iter()
            .filter(|(name, _)| path.is_empty() || name.starts_with(&prefix))
            .collect())
    }
}

impl Connection for MemoryConnection {
    fn exec_command(
        &mut self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let words = shell_words::split(command).map_err(|e| TransportError::Exec {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        let (exit_status, stdout) = match words.as_slice() {
            ["ls"] => (0, Vec::new()),
            ["ls", path] => {
                let found = self.matching(path)?;
                if found.is_empty() {
                    (2, Vec::new())
                } else {
                    let listing: String =
                        found.iter().map(|(name, _)| format!("{name}\n")).collect();
                    (0, listing.into_bytes())
                }
            }
            ["test", "-d", path] => {
                let is_file = self.files()?.contains_key(*path);
                let has_children = !self.matching(path)?.is_empty();
                (if !is_file && has_children { 0 } else { 1 }, Vec::new())
            }
            ["find", dir, "-type", "f"] => {
                let dir = if *dir == "." { "" } else { dir };
                let found = self.matching(dir)?;
                let listing: String = found.iter().map(|(name, _)| format!("{name}\n")).collect();
                (if found.is_empty() { 1 } else { 0 }, listing.into_bytes())
            }
            _ => (127, Vec::new()),
        };

        Ok(CommandOutput {
            exit_status,
            stdout,
        })
    }

    fn download(
        &mut self,
        remote_path: &str,
        sink: &mut dyn Write,
    ) -> Result<u64, TransportError> {
        let found = self.matching(remote_path)?;
        if found.is_empty() {
            return Err(TransportError::NotFound(remote_path.to_string()));
        }

        let mut total = 0;
        for (_, bytes) in found {
            sink.write_all(bytes)
                .map_err(|e| TransportError::Transfer {
                    path: remote_path.to_string(),
                    reason: e.to_string(),
                })?;
            total += bytes.len() as u64;
        }

        self.downloads
            .lock()
            .push(format!("{}:{}", self.endpoint, remote_path));
        Ok(total)
    }

    fn close(&mut self) {
        self.files = None;
    }
}
