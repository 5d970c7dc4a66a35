pub mod config;
pub mod pipeline;
pub mod sources;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{info, warn};

use config::JobConfig;
use pipeline::DirectorySink;
use sources::{ConfigDiff, Coordinator, JobReport, SshTransport, select_targets};

/// State file used when neither `--state` nor `--diff` is given.
pub const DEFAULT_STATE_FILE: &str = "remote-input.state.json";

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "remote-input",
    version,
    about = "Incrementally collect files from remote hosts over SSH"
)]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Select targets after the watermark and fetch them in parallel
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Directory receiving one file per unit
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
    /// Re-drive the units an unfinished run did not commit
    Resume {
        #[command(flatten)]
        job: JobArgs,

        /// Directory receiving one file per unit
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
    /// Print the targets a run would fetch, without fetching them
    Targets {
        /// Job configuration (TOML)
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Watermark file overriding `last_target`
        #[arg(long)]
        diff: Option<PathBuf>,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

/// Files a job reads and writes.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Job configuration (TOML)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Watermark file; read on start, rewritten after a successful run
    #[arg(long)]
    pub diff: Option<PathBuf>,

    /// Run state file (defaults to `<diff>.state.json`)
    #[arg(long)]
    pub state: Option<PathBuf>,
}

impl JobArgs {
    pub fn state_path(&self) -> PathBuf {
        self.state
            .clone()
            .unwrap_or_else(|| default_state_path(self.diff.as_deref()))
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { job, output } => drive(job, output, false).await,
        Commands::Resume { job, output } => drive(job, output, true).await,
        Commands::Targets { config, diff } => {
            tokio::task::spawn_blocking(move || preview_targets(&config, diff.as_deref()))
                .await?
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "remote-input", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

/// Run or resume a job on the blocking pool, cancelling on Ctrl+C.
async fn drive(job: JobArgs, output: PathBuf, resume: bool) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            warn!("interrupted, waiting for running units to finish");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let report =
        tokio::task::spawn_blocking(move || execute(&job, &output, resume, cancel)).await??;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.succeeded() {
        bail!(
            "{} of {} units did not commit; fix the failing hosts and run `remote-input resume`",
            report.pending.len(),
            report.task_count
        );
    }
    Ok(())
}

fn execute(
    job: &JobArgs,
    output: &Path,
    resume: bool,
    cancel: Arc<AtomicBool>,
) -> Result<JobReport> {
    let config = load_job(&job.config, job.diff.as_deref())?;
    let state_path = job.state_path();

    if !resume && state_path.exists() {
        bail!(
            "Run state {} belongs to an unfinished job; use `remote-input resume` or delete it",
            state_path.display()
        );
    }

    let sink = DirectorySink::new(output)
        .with_context(|| format!("creating output directory {}", output.display()))?;
    let transport = SshTransport;
    let coordinator =
        Coordinator::new(&config, &transport, &sink, state_path)?.with_cancel_flag(cancel);

    let report = if resume {
        coordinator.resume_saved()?
    } else {
        coordinator.transaction(config.last_target.as_ref())?
    };

    if let (Some(diff), Some(path)) = (&report.diff, &job.diff) {
        diff.save(path)
            .with_context(|| format!("writing watermark {}", path.display()))?;
        info!(path = %path.display(), "watermark saved");
    }
    Ok(report)
}

fn preview_targets(config_path: &Path, diff: Option<&Path>) -> Result<()> {
    let config = load_job(config_path, diff)?;
    let options = config.connect_options()?;
    let selection = select_targets(
        &config,
        &SshTransport,
        &options,
        config.last_target.as_ref(),
    )?;
    println!("{}", serde_json::to_string_pretty(&selection)?);
    Ok(())
}

/// Load the job config; a watermark in the diff file wins over the config's.
pub fn load_job(config_path: &Path, diff: Option<&Path>) -> Result<JobConfig> {
    let mut config = JobConfig::load(config_path)
        .with_context(|| format!("loading job config {}", config_path.display()))?;

    if let Some(path) = diff {
        let diff = ConfigDiff::load(path)
            .with_context(|| format!("reading watermark {}", path.display()))?;
        if let Some(last_target) = diff.last_target {
            config.last_target = Some(last_target);
        }
    }
    Ok(config)
}

/// `<diff>.state.json` beside the diff file, or [`DEFAULT_STATE_FILE`].
pub fn default_state_path(diff: Option<&Path>) -> PathBuf {
    match diff {
        Some(diff) => {
            let mut name = diff.as_os_str().to_owned();
            name.push(".state.json");
            PathBuf::from(name)
        }
        None => PathBuf::from(DEFAULT_STATE_FILE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Target;

    #[test]
    fn test_default_state_path() {
        assert_eq!(
            default_state_path(Some(Path::new("jobs/a.diff.json"))),
            PathBuf::from("jobs/a.diff.json.state.json")
        );
        assert_eq!(default_state_path(None), PathBuf::from(DEFAULT_STATE_FILE));
    }

    #[test]
    fn test_diff_watermark_overrides_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config_path = tmp.path().join("job.toml");
        std::fs::write(
            &config_path,
            "hosts = [\"a\"]\npath = \"/p\"\n\n[last_target]\nhost = \"a\"\npath = \"/old\"\n",
        )
        .unwrap();

        let config = load_job(&config_path, None).unwrap();
        assert_eq!(config.last_target, Some(Target::new("a", "/old")));

        let diff_path = tmp.path().join("diff.json");
        let config = load_job(&config_path, Some(&diff_path)).unwrap();
        assert_eq!(
            config.last_target,
            Some(Target::new("a", "/old")),
            "missing diff file keeps the config watermark"
        );

        ConfigDiff::for_task_set(&[Target::new("b", "/p")])
            .save(&diff_path)
            .unwrap();
        let config = load_job(&config_path, Some(&diff_path)).unwrap();
        assert_eq!(config.last_target, Some(Target::new("b", "/p")));
    }

    #[test]
    fn test_cli_parses_job_flags() {
        let cli = Cli::try_parse_from([
            "remote-input",
            "run",
            "--config",
            "job.toml",
            "--diff",
            "d.json",
            "-o",
            "out",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { job, output } => {
                assert_eq!(job.state_path(), PathBuf::from("d.json.state.json"));
                assert_eq!(output, PathBuf::from("out"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
