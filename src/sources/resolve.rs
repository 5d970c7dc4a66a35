//! Host and path resolution.
//!
//! Hosts come from the static `hosts` list or, when `hosts_command` is set,
//! from that command's stdout split on `hosts_separator`. The path is the
//! literal `path` or the trimmed stdout of `path_command`. The same path is
//! paired with every host.
//!
//! Commands run through the local shell (`sh -c`), never over SSH. A command
//! that exits non-zero aborts resolution entirely; no partial host list is
//! ever used.

use std::process::{Command, Stdio};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::JobConfig;

/// Errors from local resolver commands.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` finished with non-zero exit code {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: String,
        stderr: String,
    },
}

/// Raw candidates produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub hosts: Vec<String>,
    pub path: String,
}

/// Resolve hosts and path for a job.
pub fn resolve(config: &JobConfig) -> Result<Resolution, CommandError> {
    let hosts = resolve_hosts(config)?;
    let path = resolve_path(config)?;
    Ok(Resolution { hosts, path })
}

/// Host candidates, in command-output or config order.
pub fn resolve_hosts(config: &JobConfig) -> Result<Vec<String>, CommandError> {
    match &config.hosts_command {
        Some(command) => {
            let stdout = run_local_command(command)?;
            Ok(split_hosts(&stdout, &config.hosts_separator))
        }
        None => Ok(config.hosts.clone()),
    }
}

/// The remote path applied to every host.
pub fn resolve_path(config: &JobConfig) -> Result<String, CommandError> {
    match &config.path_command {
        Some(command) => Ok(run_local_command(command)?.trim_end().to_string()),
        None => Ok(config.path.clone()),
    }
}

/// Split command output into hosts. Entries are trimmed and empty entries
/// (e.g. from a trailing separator or blank output) are dropped.
pub fn split_hosts(stdout: &str, separator: &str) -> Vec<String> {
    stdout
        .trim()
        .split(separator)
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run `command` through the local shell and return its stdout.
pub fn run_local_command(command: &str) -> Result<String, CommandError> {
    info!(command = %command, "Running command");
    let start = Instant::now();

    let output = shell(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| CommandError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(CommandError::NonZeroExit {
            command: command.to_string(),
            code: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none (terminated by signal)".to_string()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    debug!(
        command = %command,
        bytes = output.stdout.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "command finished"
    );
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(not(windows))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
