//! Secure transport client.
//!
//! A [`Transport`] opens one authenticated [`Connection`] per host. A
//! connection can run a single remote command with a timeout (used for
//! existence probes) and download a remote file over SCP. Connections are
//! independent: nothing is shared between them, so each unit of work opens,
//! uses and closes its own.
//!
//! [`SshTransport`] is the libssh2-backed implementation used in production.
//!
//! # Scoped use
//!
//! Connections close on drop, and [`Connection::close`] is idempotent, so
//! every exit path (including errors and cancellation) releases the socket.
//!
//! ```rust,ignore
//! use remote_file_input::sources::transport::{SshTransport, Transport};
//!
//! let mut conn = SshTransport.connect(&endpoint, &options)?;
//! let mut bytes = Vec::new();
//! conn.download("/var/log/app.log", &mut bytes)?;
//! conn.close();
//! ```

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ssh2::{Channel, CheckResult, ExtendedData, KnownHostFileKind, Session};
use thiserror::Error;
use tracing::{debug, warn};

use super::target::Endpoint;
use crate::config::Auth;

/// Timeout for the remote directory listing that precedes a tree download.
pub const LISTING_TIMEOUT_SECS: u64 = 60;

/// Errors raised by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Host key verification failed for {endpoint}: {reason}")]
    HostKey { endpoint: String, reason: String },

    #[error("Authentication failed for {user}@{endpoint}: {reason}")]
    Auth {
        user: String,
        endpoint: String,
        reason: String,
    },

    #[error("Remote command `{command}` failed: {reason}")]
    Exec { command: String, reason: String },

    #[error("Remote command `{command}` timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    #[error("Remote path not found: {0}")]
    NotFound(String),

    #[error("Transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("Connection is closed")]
    Closed,
}

impl TransportError {
    /// Whether the failure happened before a session was usable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::HostKey { .. } | Self::Auth { .. }
        )
    }
}

/// How remote host keys are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key.
    AcceptAny,
    /// Require a matching entry in a known_hosts file. A missing file has no
    /// entries, so every host is rejected.
    KnownHosts { path: Option<PathBuf> },
}

/// Everything needed to open and authenticate a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub auth: Auth,
    pub host_keys: HostKeyPolicy,
    /// Bound on TCP connect, handshake and authentication.
    pub connect_timeout: Duration,
    /// Bound on each blocking read during downloads; `None` is unbounded.
    pub transfer_timeout: Option<Duration>,
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Opens connections. Shared across parallel units, hence `Sync`.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open, authenticated connection.
pub trait Connection: Send {
    /// Run `command` in a fresh channel, waiting at most `timeout` in total.
    fn exec_command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;

    /// Copy the full contents of `remote_path` into `sink`, returning the
    /// number of bytes written.
    ///
    /// A directory (or the empty path, meaning the login directory) is
    /// downloaded as the concatenation of every regular file beneath it, in
    /// byte-wise path order.
    fn download(&mut self, remote_path: &str, sink: &mut dyn Write)
    -> Result<u64, TransportError>;

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Shell command that lists `path` (or the login directory when empty).
pub fn list_command(path: &str) -> String {
    if path.is_empty() {
        "ls".to_string()
    } else {
        format!("ls {}", shell_words::quote(path))
    }
}

/// Shell command that lists every regular file under `dir`.
pub fn find_files_command(dir: &str) -> String {
    let dir = if dir.is_empty() { "." } else { dir };
    format!("find {} -type f", shell_words::quote(dir))
}

/// Parse `find` output into sorted remote paths.
pub fn parse_file_listing(stdout: &[u8]) -> Vec<String> {
    let mut files: Vec<String> = String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    files.sort_unstable();
    files.dedup();
    files
}

// =============================================================================
// libssh2 implementation
// =============================================================================

/// Transport backed by libssh2.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport;

impl Transport for SshTransport {
    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(SshConnection::open(endpoint, options)?))
    }
}

/// An SSH session to one host.
pub struct SshConnection {
    session: Option<Session>,
    endpoint: String,
    transfer_timeout_ms: u32,
}

impl SshConnection {
    /// Connect, verify the host key and authenticate.
    pub fn open(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Self, TransportError> {
        let name = endpoint.to_string();
        let connect_err = |reason: String| TransportError::Connect {
            endpoint: name.clone(),
            reason,
        };

        let tcp = connect_tcp(endpoint, options.connect_timeout)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Session::new().map_err(|e| connect_err(e.to_string()))?;
        // Compression is negotiated during the handshake, so it is enabled up
        // front for every session.
        session.set_compress(true);
        session.set_timeout(duration_ms(options.connect_timeout));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| connect_err(format!("handshake failed: {e}")))?;

        verify_host_key(&session, endpoint, &options.host_keys)?;
        authenticate(&session, &name, &options.auth)?;

        let transfer_timeout_ms = options.transfer_timeout.map(duration_ms).unwrap_or(0);
        session.set_timeout(transfer_timeout_ms);

        debug!(endpoint = %name, user = %options.auth.user(), "ssh session established");

        Ok(Self {
            session: Some(session),
            endpoint: name,
            transfer_timeout_ms,
        })
    }

    fn session(&self) -> Result<&Session, TransportError> {
        self.session.as_ref().ok_or(TransportError::Closed)
    }

    /// Copy one remote file. `Ok(None)` means the SCP open was refused, which
    /// the caller disambiguates (missing path vs. directory).
    fn scp_file(
        &self,
        path: &str,
        sink: &mut dyn Write,
    ) -> Result<Option<u64>, TransportError> {
        let session = self.session()?;
        let (mut channel, stat) = match session.scp_recv(Path::new(path)) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(endpoint = %self.endpoint, path, error = %e, "scp open refused");
                return Ok(None);
            }
        };

        let transfer_err = |e: io::Error| TransportError::Transfer {
            path: path.to_string(),
            reason: e.to_string(),
        };

        let expected = stat.size();
        let copied = io::copy(&mut (&mut channel).take(expected), sink).map_err(transfer_err)?;
        if copied != expected {
            return Err(TransportError::Transfer {
                path: path.to_string(),
                reason: format!("short read: {copied} of {expected} bytes"),
            });
        }

        if let Err(e) = finish_channel(&mut channel) {
            // The payload is complete; a sloppy channel teardown is not fatal.
            debug!(endpoint = %self.endpoint, path, error = %e, "scp channel teardown");
        }

        Ok(Some(copied))
    }

    fn is_remote_dir(&mut self, path: &str) -> Result<bool, TransportError> {
        let command = format!("test -d {}", shell_words::quote(path));
        let output = self.exec_command(&command, Duration::from_secs(LISTING_TIMEOUT_SECS))?;
        Ok(output.success())
    }

    fn download_tree(&mut self, dir: &str, sink: &mut dyn Write) -> Result<u64, TransportError> {
        let command = find_files_command(dir);
        let output = self.exec_command(&command, Duration::from_secs(LISTING_TIMEOUT_SECS))?;
        if !output.success() {
            return Err(TransportError::NotFound(dir.to_string()));
        }

        let files = parse_file_listing(&output.stdout);
        debug!(endpoint = %self.endpoint, dir, files = files.len(), "downloading directory");

        let mut total = 0;
        for file in &files {
            total += self
                .scp_file(file, sink)?
                .ok_or_else(|| TransportError::Transfer {
                    path: file.clone(),
                    reason: "file vanished or is unreadable".into(),
                })?;
        }
        Ok(total)
    }
}

impl Connection for SshConnection {
    fn exec_command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let session = self.session()?;
        let result = run_exec(session, command, timeout);
        session.set_timeout(self.transfer_timeout_ms);

        result.map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                TransportError::Timeout {
                    command: command.to_string(),
                    secs: timeout.as_secs(),
                }
            } else {
                TransportError::Exec {
                    command: command.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }

    fn download(
        &mut self,
        remote_path: &str,
        sink: &mut dyn Write,
    ) -> Result<u64, TransportError> {
        if remote_path.is_empty() {
            return self.download_tree("", sink);
        }
        if let Some(bytes) = self.scp_file(remote_path, sink)? {
            return Ok(bytes);
        }
        if self.is_remote_dir(remote_path)? {
            return self.download_tree(remote_path, sink);
        }
        Err(TransportError::NotFound(remote_path.to_string()))
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!(endpoint = %self.endpoint, error = %e, "ssh disconnect");
            }
            debug!(endpoint = %self.endpoint, "ssh session closed");
        }
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

fn finish_channel(channel: &mut Channel) -> Result<(), ssh2::Error> {
    channel.send_eof()?;
    channel.wait_eof()?;
    channel.close()?;
    channel.wait_close()
}

/// Run `command`, failing with `TimedOut` once `timeout` has elapsed in
/// total. libssh2 only bounds single blocking calls, so every read gets the
/// time left until the deadline.
fn run_exec(session: &Session, command: &str, timeout: Duration) -> io::Result<CommandOutput> {
    let deadline = Instant::now() + timeout;
    session.set_timeout(remaining_ms(deadline)?);
    let mut channel = session.channel_session()?;
    channel.handle_extended_data(ExtendedData::Ignore)?;
    channel.exec(command)?;

    let mut stdout = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        session.set_timeout(remaining_ms(deadline)?);
        match channel.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => stdout.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    session.set_timeout(remaining_ms(deadline)?);
    channel.wait_close()?;
    let exit_status = channel.exit_status()?;

    Ok(CommandOutput {
        exit_status,
        stdout,
    })
}

/// Milliseconds left until `deadline`, never 0 (libssh2 reads 0 as "no
/// timeout").
fn remaining_ms(deadline: Instant) -> io::Result<u32> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "command deadline elapsed"));
    }
    Ok(duration_ms(left).max(1))
}

fn verify_host_key(
    session: &Session,
    endpoint: &Endpoint,
    policy: &HostKeyPolicy,
) -> Result<(), TransportError> {
    let path = match policy {
        HostKeyPolicy::AcceptAny => return Ok(()),
        HostKeyPolicy::KnownHosts { path } => path.as_deref(),
    };

    let host_key_err = |reason: String| TransportError::HostKey {
        endpoint: endpoint.to_string(),
        reason,
    };

    let (key, _) = session
        .host_key()
        .ok_or_else(|| host_key_err("server presented no host key".into()))?;

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| host_key_err(e.to_string()))?;
    if let Some(path) = path
        && path.exists()
    {
        known_hosts
            .read_file(path, KnownHostFileKind::OpenSSH)
            .map_err(|e| host_key_err(format!("reading {}: {e}", path.display())))?;
    }

    match known_hosts.check_port(&endpoint.host, endpoint.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(host_key_err("host not found in known_hosts".into())),
        CheckResult::Mismatch => {
            warn!(endpoint = %endpoint, "host key mismatch");
            Err(host_key_err("host key does not match known_hosts".into()))
        }
        CheckResult::Failure => Err(host_key_err("known_hosts check failed".into())),
    }
}

fn authenticate(session: &Session, endpoint: &str, auth: &Auth) -> Result<(), TransportError> {
    let auth_err = |reason: String| TransportError::Auth {
        user: auth.user().to_string(),
        endpoint: endpoint.to_string(),
        reason,
    };

    match auth {
        Auth::Password { user, password } => session
            .userauth_password(user, password)
            .map_err(|e| auth_err(e.to_string()))?,
        Auth::PublicKey {
            user,
            key_path: Some(key_path),
        } => session
            .userauth_pubkey_file(user, None, key_path, None)
            .map_err(|e| auth_err(format!("key {}: {e}", key_path.display())))?,
        Auth::PublicKey {
            user,
            key_path: None,
        } => authenticate_default_keys(session, user).map_err(auth_err)?,
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(auth_err("server rejected credentials".into()))
    }
}

/// Default key discovery: ssh-agent first, then the usual identity files.
fn authenticate_default_keys(session: &Session, user: &str) -> Result<(), String> {
    let mut attempts = Vec::new();

    match session.userauth_agent(user) {
        Ok(()) if session.authenticated() => return Ok(()),
        Ok(()) => attempts.push("ssh-agent: rejected".to_string()),
        Err(e) => attempts.push(format!("ssh-agent: {e}")),
    }

    for key in default_identity_files() {
        if !key.exists() {
            continue;
        }
        match session.userauth_pubkey_file(user, None, &key, None) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => attempts.push(format!("{}: rejected", key.display())),
            Err(e) => attempts.push(format!("{}: {e}", key.display())),
        }
    }

    Err(attempts.join("; "))
}

fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

fn duration_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_ms_counts_down_to_timeout() {
        let ms = remaining_ms(Instant::now() + Duration::from_secs(5)).unwrap();
        assert!((1..=5000).contains(&ms), "{ms}");

        // Under a millisecond left still yields a bounded call, never 0.
        if let Ok(ms) = remaining_ms(Instant::now() + Duration::from_micros(900)) {
            assert_eq!(ms, 1);
        }

        let err = remaining_ms(Instant::now()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_list_command_quotes_path() {
        assert_eq!(list_command("/data/f.csv"), "ls /data/f.csv");
        assert_eq!(list_command("/data/my file.csv"), "ls '/data/my file.csv'");
        assert_eq!(list_command(""), "ls");
    }

    #[test]
    fn test_find_files_command() {
        assert_eq!(find_files_command("/mount"), "find /mount -type f");
        assert_eq!(find_files_command(""), "find . -type f");
    }

    #[test]
    fn test_parse_file_listing_sorts_and_skips_blanks() {
        let listing = b"/mount/b.csv\n/mount/a.csv\n\n/mount/sub/c.csv\n/mount/a.csv\n";
        assert_eq!(
            parse_file_listing(listing),
            vec!["/mount/a.csv", "/mount/b.csv", "/mount/sub/c.csv"]
        );
        assert!(parse_file_listing(b"").is_empty());
    }

    #[test]
    fn test_command_output_helpers() {
        let out = CommandOutput {
            exit_status: 0,
            stdout: b"f.csv\n".to_vec(),
        };
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "f.csv\n");
        assert!(
            !CommandOutput {
                exit_status: 2,
                stdout: Vec::new()
            }
            .success()
        );
    }

    #[test]
    fn test_connectivity_classification() {
        let connect = TransportError::Connect {
            endpoint: "h:22".into(),
            reason: "refused".into(),
        };
        assert!(connect.is_connectivity());
        assert!(!TransportError::NotFound("/x".into()).is_connectivity());
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_secs(5)), 5000);
        assert_eq!(duration_ms(Duration::from_secs(u64::MAX / 1000)), u32::MAX);
    }

    #[test]
    fn test_connect_to_closed_port_fails_with_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint {
            host: "127.0.0.1".into(),
            port,
        };
        let options = ConnectOptions {
            auth: Auth::Password {
                user: "u".into(),
                password: "p".into(),
            },
            host_keys: HostKeyPolicy::AcceptAny,
            connect_timeout: Duration::from_secs(2),
            transfer_timeout: None,
        };
        let err = SshTransport.connect(&endpoint, &options).err().unwrap();
        assert!(matches!(err, TransportError::Connect { .. }), "{err}");
    }
}
