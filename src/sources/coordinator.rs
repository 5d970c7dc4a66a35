//! Job transaction, commit and resume.
//!
//! A job resolves and selects its targets once, persists them as a
//! [`RunState`] and launches one unit per target. Every unit that commits is
//! recorded in the state file straight away. When all units have committed
//! the state file is removed and the new watermark (the maximum target of the
//! whole task set) is returned as a [`ConfigDiff`]. If any unit fails, the
//! job fails, the watermark stays where it was and the state file remains so
//! a resume re-drives exactly the units that did not commit, using the same
//! target assignment.
//!
//! # Example
//!
//! ```rust,ignore
//! let coordinator = Coordinator::new(&config, &SshTransport, &sink, "run.state.json")?;
//! let report = coordinator.transaction(config.last_target.as_ref())?;
//! if !report.succeeded() {
//!     // later, after fixing the failing hosts
//!     let report = coordinator.resume_saved()?;
//! }
//! ```

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use super::executor::{UnitExecutor, UnitReport};
use super::resolve::CommandError;
use super::select::{Selection, select_targets};
use super::target::{ConfigDiff, Target};
use super::transport::{ConnectOptions, Transport};
use crate::config::{ConfigError, JobConfig};
use crate::pipeline::FileInputSink;

/// Current on-disk format of [`RunState`].
pub const STATE_VERSION: u32 = 1;

/// Errors reading or writing the run state.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read run state {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Run state {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write run state {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Run state {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("Run state {path} records unit {index} but has only {len} targets")]
    IndexOutOfRange {
        path: PathBuf,
        index: usize,
        len: usize,
    },
}

/// Errors that stop a job as a whole.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed to start worker pool: {0}")]
    Pool(String),
}

// =============================================================================
// Run state
// =============================================================================

/// The persisted Run Task Set and its commit progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Unit `i` fetches `targets[i]`. Never changes after creation.
    pub targets: Vec<Target>,
    /// Indices of units that committed.
    pub committed: BTreeSet<usize>,
}

impl RunState {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            version: STATE_VERSION,
            created_at: Utc::now(),
            targets,
            committed: BTreeSet::new(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.targets.len()
    }

    /// Units that still have to run, with their targets.
    pub fn pending(&self) -> Vec<(usize, Target)> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.committed.contains(index))
            .map(|(index, target)| (index, target.clone()))
            .collect()
    }

    /// Record unit `index` as committed. Out-of-range indices are ignored.
    pub fn commit(&mut self, index: usize) -> bool {
        index < self.targets.len() && self.committed.insert(index)
    }

    pub fn is_complete(&self) -> bool {
        self.committed.len() == self.targets.len()
    }

    /// The diff a complete run produces; `None` while units are pending or
    /// when there was nothing to fetch.
    pub fn diff(&self) -> Option<ConfigDiff> {
        if !self.is_complete() || self.targets.is_empty() {
            return None;
        }
        Some(ConfigDiff::for_task_set(&self.targets))
    }

    /// Load and validate a state file.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = std::fs::read_to_string(path).map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let state: Self = serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        if state.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: state.version,
            });
        }
        if let Some(&index) = state.committed.iter().find(|i| **i >= state.targets.len()) {
            return Err(StateError::IndexOutOfRange {
                path: path.to_path_buf(),
                index,
                len: state.targets.len(),
            });
        }
        Ok(state)
    }

    /// Atomically replace the state file.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let write_err = |source: io::Error| StateError::Write {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let content = serde_json::to_vec_pretty(self).map_err(|e| write_err(e.into()))?;
        let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        staged.write_all(&content).map_err(write_err)?;
        staged.flush().map_err(write_err)?;
        staged.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    /// Delete the state file; a missing file is fine.
    pub fn remove(path: &Path) -> Result<(), StateError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Write {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

// =============================================================================
// Job report
// =============================================================================

/// Outcome of a transaction or resume.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Size of the Run Task Set.
    pub task_count: usize,
    /// Reports for the units driven by this invocation.
    pub units: Vec<UnitReport>,
    /// Indices still not committed.
    pub pending: Vec<usize>,
    pub cancelled: bool,
    /// New watermark, present only on full success with a non-empty set.
    pub diff: Option<ConfigDiff>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn failed_units(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| !u.success)
    }

    pub fn total_bytes(&self) -> u64 {
        self.units.iter().map(|u| u.bytes).sum()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs jobs and resumes them from their state file.
pub struct Coordinator<'a> {
    config: &'a JobConfig,
    options: ConnectOptions,
    transport: &'a dyn Transport,
    sink: &'a dyn FileInputSink,
    state_path: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl<'a> Coordinator<'a> {
    /// Validate `config` and prepare a coordinator. Nothing connects yet.
    pub fn new(
        config: &'a JobConfig,
        transport: &'a dyn Transport,
        sink: &'a dyn FileInputSink,
        state_path: impl Into<PathBuf>,
    ) -> Result<Self, JobError> {
        Ok(Self {
            options: config.connect_options()?,
            config,
            transport,
            sink,
            state_path: state_path.into(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share a cancellation flag with the caller.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Resolve and select without running anything.
    pub fn select(&self, watermark: Option<&Target>) -> Result<Selection, JobError> {
        Ok(select_targets(
            self.config,
            self.transport,
            &self.options,
            watermark,
        )?)
    }

    /// Start a new job: select, persist the task set, drive every unit.
    pub fn transaction(&self, watermark: Option<&Target>) -> Result<JobReport, JobError> {
        let selection = self.select(watermark)?;
        let state = RunState::new(selection.targets);
        state.save(&self.state_path)?;
        info!(
            state = %self.state_path.display(),
            tasks = state.task_count(),
            "run state saved"
        );
        self.resume(state)
    }

    /// Resume the job recorded in the state file.
    pub fn resume_saved(&self) -> Result<JobReport, JobError> {
        let state = RunState::load(&self.state_path)?;
        info!(
            state = %self.state_path.display(),
            tasks = state.task_count(),
            committed = state.committed.len(),
            "resuming run"
        );
        self.resume(state)
    }

    /// Drive the pending units of `state`.
    pub fn resume(&self, state: RunState) -> Result<JobReport, JobError> {
        let task_count = state.task_count();
        let pending = state.pending();
        if !pending.is_empty() {
            info!(pending = pending.len(), total = task_count, "driving units");
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallelism())
            .thread_name(|i| format!("remote-input-{i}"))
            .build()
            .map_err(|e| JobError::Pool(e.to_string()))?;

        let executor = UnitExecutor::new(
            self.transport,
            &self.options,
            self.config.default_port,
            self.sink,
        );
        let state = Mutex::new(state);
        let save_error: Mutex<Option<StateError>> = Mutex::new(None);

        let units = pool.install(|| {
            executor.run_units(&pending, &self.cancel, |report| {
                if !report.success {
                    return;
                }
                let mut state = state.lock();
                state.commit(report.index);
                if let Err(e) = state.save(&self.state_path) {
                    error!(index = report.index, error = %e, "failed to record commit");
                    let mut slot = save_error.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            })
        });

        if let Some(e) = save_error.into_inner() {
            return Err(e.into());
        }

        let state = state.into_inner();
        let pending: Vec<usize> = state.pending().into_iter().map(|(i, _)| i).collect();
        let cancelled = self.cancel.load(Ordering::SeqCst);

        let diff = if pending.is_empty() {
            RunState::remove(&self.state_path)?;
            let diff = state.diff();
            match &diff {
                Some(diff) => info!(
                    last_target = ?diff.last_target.as_ref().map(Target::to_string),
                    "job committed, watermark advanced"
                ),
                None => info!("job committed, nothing to fetch"),
            }
            diff
        } else {
            warn!(
                failed = pending.len(),
                total = task_count,
                cancelled,
                state = %self.state_path.display(),
                "job failed, watermark unchanged"
            );
            None
        };

        Ok(JobReport {
            task_count,
            units,
            pending,
            cancelled,
            diff,
        })
    }
}
