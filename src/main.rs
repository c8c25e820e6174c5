use std::collections::HashSet;
use std::fs;

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use zfsreplay::config;
use zfsreplay::driver::{self, JobFile, RunOptions, ZfsSnapshotBackend};
use zfsreplay::index;
use zfsreplay::ls;
use zfsreplay::matcher::{self, Mode};

/// Replay historical filesystem snapshots onto a live copy-on-write target.
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, Parser)]
enum Subcommand {
    /// Run every job in a job file, skipping steps already applied.
    Replay {
        #[arg(long)]
        jobs: Utf8PathBuf,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Compare two real trees and print a +/-/M/U line per path.
    Diff {
        a: Utf8PathBuf,
        b: Utf8PathBuf,
        #[arg(long, value_enum, default_value = "path-only")]
        mode: CliMode,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliMode {
    PathOnly,
    Linked,
    Cow,
}

impl From<CliMode> for Mode {
    fn from(m: CliMode) -> Mode {
        match m {
            CliMode::PathOnly => Mode::PathOnly,
            CliMode::Linked => Mode::Linked,
            CliMode::Cow => Mode::Cow,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let config = config::load().unwrap_or_else(|e| {
        tracing::warn!("couldn't load config, using defaults: {e}");
        config::Configuration::default()
    });

    match args.subcommand {
        Subcommand::Replay { jobs, threads, dry_run } => run_replay(&jobs, threads, dry_run, &config),
        Subcommand::Diff { a, b, mode } => run_diff(&a, &b, mode.into(), &config),
    }
}

fn run_replay(jobs_path: &Utf8PathBuf, threads: Option<usize>, dry_run: bool, config: &config::Configuration) -> Result<()> {
    let text = fs::read_to_string(jobs_path).with_context(|| format!("reading {jobs_path}"))?;
    let job_file: JobFile = toml::from_str(&text).with_context(|| format!("parsing {jobs_path}"))?;

    let opts = RunOptions {
        dry_run,
        verbosity: 3,
        threads: threads.unwrap_or(config.threads),
        extra_ignore: config.ignore.iter().cloned().collect(),
        block_identity_threshold: config.block_identity_threshold,
        generation_oracle_path: config.generation_oracle_path.clone(),
        block_identity_oracle_path: config.block_identity_oracle_path.clone(),
    };
    let backend = ZfsSnapshotBackend;
    let records = driver::run(&job_file.jobs, &backend, &opts)?;

    for record in &records {
        tracing::info!("{}: {:?} ({:?})", record.label, record.outcome, record.duration);
    }
    Ok(())
}

fn run_diff(a: &Utf8PathBuf, b: &Utf8PathBuf, mode: Mode, config: &config::Configuration) -> Result<()> {
    let ignore: HashSet<String> = config.ignore.iter().cloned().collect();
    let a_index = index::index(a, &ignore)?;
    let b_index = index::index(b, &ignore)?;
    if mode == Mode::Cow {
        bail!("diff doesn't have a snapshot-generation oracle to consult for cow mode; use linked or path-only");
    }
    let result = matcher::match_indexes(&a_index, &b_index, mode, None);
    ls::print_diff(&a_index, &b_index, &result);
    Ok(())
}

/// Set up tracing to spit messages to stderr, gated by an occurrence-counted
/// `-v` flag layered under `RUST_LOG`.
fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
