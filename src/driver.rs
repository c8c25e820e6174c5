//! The ambient collaborator: owns the job queue and the real snapshot/
//! rollback tooling. Not part of the core's correctness surface — the core
//! only ever sees one (A, B, T) triple at a time via [`crate::apply::apply`].

use std::collections::HashSet;
use std::process::Command;

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use serde_derive::Deserialize;
use tracing::{info, warn};

use crate::apply::{self, ApplyRequest};
use crate::matcher::{CowOracles, Mode};
use crate::mutator::Mutator;
use crate::oracle::{BlockIdentityOracle, GenerationOracle, SubprocessBlockIdentityOracle, ZdbGenerationOracle};

/// One step of a replay chain, as read from a job file.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub label: String,
    pub a_root: Utf8PathBuf,
    pub b_root: Utf8PathBuf,
    pub t_root: Utf8PathBuf,
    #[serde(default)]
    pub mode: JobMode,
    /// The name the target snapshot should have after a successful apply;
    /// also used to detect whether this step has already run.
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    #[default]
    PathOnly,
    Linked,
    Cow,
}

impl From<JobMode> for Mode {
    fn from(m: JobMode) -> Mode {
        match m {
            JobMode::PathOnly => Mode::PathOnly,
            JobMode::Linked => Mode::Linked,
            JobMode::Cow => Mode::Cow,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JobFile {
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug)]
pub enum Outcome {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct RunRecord {
    pub label: String,
    pub outcome: Outcome,
    pub duration: std::time::Duration,
}

/// Talks to the real snapshotting filesystem. A fake backs the tests.
pub trait SnapshotBackend {
    fn existing_snapshots(&self, dataset_root: &camino::Utf8Path) -> Result<HashSet<String>>;
    fn rollback(&self, dataset_root: &camino::Utf8Path) -> Result<()>;
    fn snapshot(&self, dataset_root: &camino::Utf8Path, name: &str) -> Result<()>;
}

/// Shells out to `zfs list -t snapshot` / `zfs rollback` / `zfs snapshot`.
pub struct ZfsSnapshotBackend;

impl SnapshotBackend for ZfsSnapshotBackend {
    fn existing_snapshots(&self, dataset_root: &camino::Utf8Path) -> Result<HashSet<String>> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-o", "name", "-t", "snapshot", "-r"])
            .arg(dataset_root.as_str())
            .output()
            .context("running zfs list")?;
        if !output.status.success() {
            bail!("zfs list failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
    }

    fn rollback(&self, dataset_root: &camino::Utf8Path) -> Result<()> {
        let status = Command::new("zfs").arg("rollback").arg(dataset_root.as_str()).status()?;
        if !status.success() {
            bail!("zfs rollback {dataset_root} failed");
        }
        Ok(())
    }

    fn snapshot(&self, dataset_root: &camino::Utf8Path, name: &str) -> Result<()> {
        let status = Command::new("zfs")
            .arg("snapshot")
            .arg(format!("{dataset_root}@{name}"))
            .status()?;
        if !status.success() {
            bail!("zfs snapshot {dataset_root}@{name} failed");
        }
        Ok(())
    }
}

pub struct RunOptions {
    pub dry_run: bool,
    pub verbosity: u8,
    pub threads: usize,
    pub extra_ignore: HashSet<String>,
    pub block_identity_threshold: u64,
    pub generation_oracle_path: Option<String>,
    pub block_identity_oracle_path: Option<String>,
}

/// Run every job in order, skipping ones whose target snapshot already
/// exists, rolling the target back to its baseline before the first step
/// that actually runs, and snapshotting it after each successful one.
pub fn run(
    jobs: &[JobSpec],
    backend: &dyn SnapshotBackend,
    opts: &RunOptions,
) -> Result<Vec<RunRecord>> {
    let mut records = Vec::new();
    let mut rolled_back = false;

    // Built lazily, once, and reused across every Cow-mode job in this run:
    // the generation oracle's whole point is a long-lived coprocess per
    // dataset, not one spawned and torn down per step.
    let needs_cow_oracles = jobs.iter().any(|j| matches!(j.mode, JobMode::Cow));
    let cow_oracles: Option<(Box<dyn GenerationOracle>, Box<dyn BlockIdentityOracle>)> =
        if needs_cow_oracles {
            let gen_path = opts
                .generation_oracle_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("a job needs cow mode but no generation_oracle_path is configured"))?;
            let block_path = opts
                .block_identity_oracle_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("a job needs cow mode but no block_identity_oracle_path is configured"))?;
            Some((
                Box::new(ZdbGenerationOracle::new(gen_path.clone())),
                Box::new(SubprocessBlockIdentityOracle::new(block_path.clone())),
            ))
        } else {
            None
        };

    for job in jobs {
        let already_done = backend
            .existing_snapshots(&job.t_root)
            .unwrap_or_default()
            .contains(&job.snapshot_name);
        if already_done {
            info!("skipping {} (snapshot {} already exists)", job.label, job.snapshot_name);
            records.push(RunRecord { label: job.label.clone(), outcome: Outcome::Skipped, duration: Default::default() });
            continue;
        }

        if !rolled_back {
            backend.rollback(&job.t_root).with_context(|| format!("rolling back {}", job.t_root))?;
            rolled_back = true;
        }

        let start = std::time::Instant::now();
        let mutator = Mutator::new(opts.dry_run, opts.verbosity);
        let snap_a = job.a_root.to_string();
        let snap_b = job.b_root.to_string();

        let oracles = cow_oracles.as_ref().map(|(generation, block_identity)| CowOracles {
            generation: generation.as_ref(),
            block_identity: block_identity.as_ref(),
            snap_a: &snap_a,
            snap_b: &snap_b,
        });

        let req = ApplyRequest {
            a_root: &job.a_root,
            b_root: &job.b_root,
            t_root: &job.t_root,
            ignore: opts.extra_ignore.clone(),
            mode: job.mode.into(),
            threads: opts.threads,
            snap_a: snap_a.clone(),
            snap_b: snap_b.clone(),
            block_identity_threshold: opts.block_identity_threshold,
        };

        match apply::apply(req, &mutator, oracles.as_ref()) {
            Ok(()) => {
                if !opts.dry_run {
                    backend
                        .snapshot(&job.t_root, &job.snapshot_name)
                        .with_context(|| format!("snapshotting {} after {}", job.t_root, job.label))?;
                }
                records.push(RunRecord { label: job.label.clone(), outcome: Outcome::Applied, duration: start.elapsed() });
                rolled_back = false;
            }
            Err(e) => {
                warn!("job {} failed: {e}", job.label);
                records.push(RunRecord { label: job.label.clone(), outcome: Outcome::Failed, duration: start.elapsed() });
                bail!("job {} failed: {e}", job.label);
            }
        }
    }

    Ok(records)
}
