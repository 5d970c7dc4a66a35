//! Remote file collection over SSH.
//!
//! A job turns a host list and a remote path into a set of targets, fetches
//! each target in its own parallel unit and advances a watermark only when
//! every unit has committed.
//!
//! # Architecture
//!
//! - **target**: targets, their total order, the watermark and the config diff
//! - **resolve**: host list and path, from config or local shell commands
//! - **transport**: SSH sessions, remote commands and SCP downloads
//! - **memory**: an in-process transport with the same contract
//! - **select**: watermark filtering and optional existence probes
//! - **executor**: one connection, one download and one sink call per unit
//! - **coordinator**: run state, commit bookkeeping and resume
//!
//! # Configuration
//!
//! Jobs are configured in TOML:
//!
//! ```toml
//! hosts = ["localhost:10022", "localhost:10023"]
//! path = "/mount/data/sample_01.csv"
//! ignore_not_found_hosts = true
//!
//! [auth]
//! type = "public_key"
//! user = "bob"
//! key_path = "/home/bob/.ssh/id_ed25519"
//! ```
//!
//! # Running
//!
//! ```rust,ignore
//! use remote_file_input::config::JobConfig;
//! use remote_file_input::pipeline::DirectorySink;
//! use remote_file_input::sources::{Coordinator, SshTransport};
//!
//! let config = JobConfig::load(Path::new("job.toml"))?;
//! let sink = DirectorySink::new("out")?;
//! let coordinator = Coordinator::new(&config, &SshTransport, &sink, "job.state.json")?;
//!
//! let report = coordinator.transaction(config.last_target.as_ref())?;
//! if let Some(diff) = &report.diff {
//!     diff.save(Path::new("job.diff.json"))?;
//! }
//! ```

pub mod coordinator;
pub mod executor;
pub mod memory;
pub mod resolve;
pub mod select;
pub mod target;
pub mod transport;

pub use coordinator::{Coordinator, JobError, JobReport, RunState, StateError};
pub use executor::{UnitError, UnitExecutor, UnitReport};
pub use memory::MemoryTransport;
pub use resolve::{CommandError, Resolution};
pub use select::{DroppedTarget, ProbeOutcome, Selection, TargetSelector, select_targets};
pub use target::{ConfigDiff, Endpoint, EndpointError, Target, Watermark};
pub use transport::{
    CommandOutput, ConnectOptions, Connection, HostKeyPolicy, SshTransport, Transport,
    TransportError,
};
