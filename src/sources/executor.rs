//! Unit-of-work execution.
//!
//! Unit `i` fetches `task_set[i]`: it opens its own connection, downloads the
//! path fully into memory, closes the connection and hands the bytes to the
//! sink as its only input file. Units never retry and never share a
//! connection or buffer; a failing unit reports failure for itself only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::target::{EndpointError, Target};
use super::transport::{ConnectOptions, Transport, TransportError};
use crate::pipeline::{FileInputSink, RemoteFile, SingleFileInput, SinkError};

/// Why a unit failed.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Cancelled before start")]
    Cancelled,
}

/// Result of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    /// Position in the Run Task Set.
    pub index: usize,
    pub target: Target,
    pub success: bool,
    /// Bytes handed to the sink.
    pub bytes: u64,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Drives units against a transport and a sink.
pub struct UnitExecutor<'a> {
    transport: &'a dyn Transport,
    options: &'a ConnectOptions,
    default_port: u16,
    sink: &'a dyn FileInputSink,
}

impl<'a> UnitExecutor<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        options: &'a ConnectOptions,
        default_port: u16,
        sink: &'a dyn FileInputSink,
    ) -> Self {
        Self {
            transport,
            options,
            default_port,
            sink,
        }
    }

    /// Run one unit. Never panics on remote failures; they become the report.
    pub fn run_unit(&self, index: usize, target: &Target) -> UnitReport {
        let start = Instant::now();
        info!(index, target = %target, "unit started");

        let result = self.fetch(target).and_then(|bytes| {
            let input = SingleFileInput::new(RemoteFile::new(target.clone(), bytes));
            Ok(self.sink.accept(index, input)?)
        });
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(bytes) => {
                info!(index, target = %target, bytes, duration_ms, "unit committed");
                UnitReport {
                    index,
                    target: target.clone(),
                    success: true,
                    bytes,
                    error: None,
                    duration_ms,
                }
            }
            Err(e) => {
                warn!(index, target = %target, error = %e, duration_ms, "unit failed");
                UnitReport::failed(index, target, &e, duration_ms)
            }
        }
    }

    /// Download `target` into memory over a connection scoped to this call.
    fn fetch(&self, target: &Target) -> Result<Vec<u8>, UnitError> {
        let endpoint = target.endpoint(self.default_port)?;
        let mut conn = self.transport.connect(&endpoint, self.options)?;

        let mut buf = Vec::new();
        let result = conn.download(&target.path, &mut buf);
        conn.close();
        result?;

        Ok(buf)
    }

    /// Run `units` in parallel on the current rayon pool.
    ///
    /// Units that have not started when `cancel` is raised are reported as
    /// cancelled; `on_done` sees every report as soon as its unit finishes.
    pub fn run_units<F>(
        &self,
        units: &[(usize, Target)],
        cancel: &AtomicBool,
        on_done: F,
    ) -> Vec<UnitReport>
    where
        F: Fn(&UnitReport) + Send + Sync,
    {
        let mut reports: Vec<UnitReport> = units
            .par_iter()
            .map(|(index, target)| {
                let report = if cancel.load(Ordering::SeqCst) {
                    UnitReport::failed(*index, target, &UnitError::Cancelled, 0)
                } else {
                    self.run_unit(*index, target)
                };
                on_done(&report);
                report
            })
            .collect();
        reports.sort_by_key(|r| r.index);
        reports
    }
}

impl UnitReport {
    fn failed(index: usize, target: &Target, error: &UnitError, duration_ms: u64) -> Self {
        Self {
            index,
            target: target.clone(),
            success: false,
            bytes: 0,
            error: Some(error.to_string()),
            duration_ms,
        }
    }
}
