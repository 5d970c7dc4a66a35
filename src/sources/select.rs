//! Target selection.
//!
//! Pairs every resolved host with the resolved path, drops targets that do
//! not sort after the watermark, and (when `ignore_not_found_hosts` is set)
//! drops targets whose existence probe fails. Probing is sequential and a
//! probe failure of any kind only drops that one host.
//!
//! The output keeps resolver order; it is not sorted. Its length is the
//! number of parallel units for the job.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::resolve::{self, CommandError};
use super::target::{Target, is_selected};
use super::transport::{ConnectOptions, Transport, list_command};
use crate::config::JobConfig;

/// Outcome of probing one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found,
    /// The listing command exited with a non-zero status.
    NotFound { exit_status: i32 },
    /// The host could not be reached, authenticated or queried.
    Unreachable { error: String },
}

/// A target left out of the run, and why.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedTarget {
    pub target: Target,
    pub reason: String,
}

/// Result of selection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Selection {
    /// The Run Task Set, in resolver order.
    pub targets: Vec<Target>,
    /// Targets at or before the watermark.
    pub skipped: Vec<Target>,
    /// Targets removed by existence probes.
    pub dropped: Vec<DroppedTarget>,
}

/// Builds the Run Task Set for a job.
pub struct TargetSelector<'a> {
    transport: &'a dyn Transport,
    options: &'a ConnectOptions,
    default_port: u16,
    ignore_not_found_hosts: bool,
    probe_timeout: Duration,
}

impl<'a> TargetSelector<'a> {
    pub fn new(
        config: &JobConfig,
        transport: &'a dyn Transport,
        options: &'a ConnectOptions,
    ) -> Self {
        Self {
            transport,
            options,
            default_port: config.default_port,
            ignore_not_found_hosts: config.ignore_not_found_hosts,
            probe_timeout: config.probe_timeout(),
        }
    }

    /// Select targets for `hosts` × `path` against `watermark`.
    pub fn select(&self, hosts: &[String], path: &str, watermark: Option<&Target>) -> Selection {
        let mut selection = Selection::default();

        for host in hosts {
            let target = Target::new(host.as_str(), path);

            if !is_selected(&target, watermark) {
                debug!(target = %target, "at or before watermark, skipping");
                selection.skipped.push(target);
                continue;
            }

            if self.ignore_not_found_hosts {
                match self.probe(&target) {
                    ProbeOutcome::Found => {}
                    ProbeOutcome::NotFound { exit_status } => {
                        warn!(target = %target, exit_status, "Remote file not found");
                        selection.dropped.push(DroppedTarget {
                            target,
                            reason: format!("listing exited with status {exit_status}"),
                        });
                        continue;
                    }
                    ProbeOutcome::Unreachable { error } => {
                        warn!(target = %target, error = %error, "failed to check the file exists");
                        selection.dropped.push(DroppedTarget {
                            target,
                            reason: error,
                        });
                        continue;
                    }
                }
            }

            selection.targets.push(target);
        }

        selection
    }

    /// Existence probe: connect, list the target path, close.
    pub fn probe(&self, target: &Target) -> ProbeOutcome {
        let start = Instant::now();

        let endpoint = match target.endpoint(self.default_port) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                return ProbeOutcome::Unreachable {
                    error: e.to_string(),
                };
            }
        };

        let mut conn = match self.transport.connect(&endpoint, self.options) {
            Ok(conn) => conn,
            Err(e) => {
                return ProbeOutcome::Unreachable {
                    error: e.to_string(),
                };
            }
        };

        let result = conn.exec_command(&list_command(&target.path), self.probe_timeout);
        conn.close();

        let outcome = match result {
            Ok(output) if output.success() => ProbeOutcome::Found,
            Ok(output) => ProbeOutcome::NotFound {
                exit_status: output.exit_status,
            },
            Err(e) => ProbeOutcome::Unreachable {
                error: e.to_string(),
            },
        };

        debug!(
            target = %target,
            outcome = ?outcome,
            duration_ms = start.elapsed().as_millis() as u64,
            "existence probe"
        );
        outcome
    }
}

/// Resolve hosts and path, then select against `watermark`.
///
/// Only resolver commands can fail this; per-host problems never do.
pub fn select_targets(
    config: &JobConfig,
    transport: &dyn Transport,
    options: &ConnectOptions,
    watermark: Option<&Target>,
) -> Result<Selection, CommandError> {
    let resolution = resolve::resolve(config)?;
    let selection = TargetSelector::new(config, transport, options).select(
        &resolution.hosts,
        &resolution.path,
        watermark,
    );

    let names: Vec<String> = selection.targets.iter().map(Target::to_string).collect();
    info!(
        targets = ?names,
        skipped = selection.skipped.len(),
        dropped = selection.dropped.len(),
        "Loading targets"
    );
    Ok(selection)
}
