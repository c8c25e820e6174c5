//! The applier: turn a [`crate::matcher::MatchResult`] into an ordered plan
//! of [`crate::mutator::Mutator`] calls that transforms T from A into B.
//!
//! Phase order is load-bearing. No phase starts until the previous one has
//! fully completed; only phase 6 (parallel update/create) runs concurrently,
//! and only because pairs and residuals are guaranteed disjoint by
//! construction (see the matcher's index invariants).

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::Result;
use crate::index::{self, Index};
use crate::matcher::{self, CowOracles, MatchResult, Mode, Pair};
use crate::mutator::Mutator;
use crate::node::NodeKind;

/// Default above which `Cow` mode consults the block-identity oracle instead
/// of reading and comparing the whole file; overridable per request since
/// it's sensitive to the target pool's layout.
pub const DEFAULT_BLOCK_IDENTITY_THRESHOLD: u64 = 50 * 1024 * 1024;

pub struct ApplyRequest<'a> {
    pub a_root: &'a Utf8Path,
    pub b_root: &'a Utf8Path,
    pub t_root: &'a Utf8Path,
    pub ignore: HashSet<String>,
    pub mode: Mode,
    pub threads: usize,
    pub snap_a: String,
    pub snap_b: String,
    pub block_identity_threshold: u64,
}

/// Transform T (starting byte-equivalent to A) into byte-equivalent B.
///
/// Precondition: T already mirrors A (the caller established this via a
/// rollback). On success T mirrors B. On failure the plan aborts with no
/// partial rollback; the caller retries the whole step from a fresh rollback.
pub fn apply(req: ApplyRequest, mutator: &Mutator, oracles: Option<&CowOracles>) -> Result<()> {
    let a = index::index(req.a_root, &req.ignore)?;
    let mut b = index::index(req.b_root, &req.ignore)?;
    let m = matcher::match_indexes(&a, &b, req.mode, oracles);

    let staging_root = pre_stage(&a, &mut b, &m, req.t_root, mutator)?;
    delete_residuals(&a, &m, req.t_root, mutator)?;
    create_directories(&b, &m, req.t_root, mutator)?;
    parallel_update_and_create(
        &a,
        &b,
        &m,
        req.t_root,
        req.mode,
        req.threads,
        req.block_identity_threshold,
        oracles,
        &req.snap_a,
        &req.snap_b,
        mutator,
    )?;

    if let Some(staging_root) = staging_root {
        cleanup_staging(&staging_root, mutator)?;
    }
    final_directory_mtimes(&b, req.t_root, mutator)?;

    info!("apply complete: {}", mutator.counters.summary());
    Ok(())
}

/// Moving entries are relocated to a staging area before anything is
/// deleted or created, so a delete can never collide with a move's old
/// path and a create can never collide with its new one.
fn pre_stage(
    a: &Index,
    b: &mut Index,
    m: &MatchResult,
    t_root: &Utf8Path,
    mutator: &Mutator,
) -> Result<Option<Utf8PathBuf>> {
    let moving: Vec<Pair> = m
        .pairs
        .iter()
        .copied()
        .filter(|p| !a.nodes[p.a].is_dir() && a.nodes[p.a].relpath != b.nodes[p.b].relpath)
        .collect();
    if moving.is_empty() {
        return Ok(None);
    }

    let random_id: u64 = rand::thread_rng().gen_range(0..1_000_000_000_000u64);
    let staging_root = t_root.join(format!(".zfsreplay-{random_id:012}"));
    for (k, pair) in moving.iter().enumerate() {
        let group = (k / 256) as u8;
        let slot = (k % 256) as u8;
        let staging_path = staging_root.join(format!("{group:02x}")).join(format!("{slot:02x}"));
        let src = t_root.join(&a.nodes[pair.a].relpath);
        mutator.prename(&src, &staging_path)?;
        b.nodes[pair.b].staging_path = Some(staging_path);
    }
    Ok(Some(staging_root))
}

fn delete_residuals(a: &Index, m: &MatchResult, t_root: &Utf8Path, mutator: &Mutator) -> Result<()> {
    let mut relpaths: Vec<&Utf8PathBuf> = m.a_only.keys().collect();
    // Reverse sorted order puts children before their parents.
    relpaths.sort_unstable_by(|x, y| y.cmp(x));
    for relpath in relpaths {
        let node = &a.nodes[m.a_only[relpath]];
        let target = t_root.join(relpath);
        if node.is_dir() {
            mutator.rmdir(&target)?;
        } else {
            mutator.unlink(&target)?;
        }
    }
    Ok(())
}

fn create_directories(b: &Index, m: &MatchResult, t_root: &Utf8Path, mutator: &Mutator) -> Result<()> {
    let mut dirs: Vec<&Utf8PathBuf> = m
        .b_only
        .keys()
        .filter(|rp| b.nodes[m.b_only[*rp]].is_dir())
        .collect();
    dirs.sort_unstable();
    for relpath in dirs {
        let node = &b.nodes[m.b_only[relpath]];
        let target = t_root.join(relpath);
        mutator.mkdir(&target)?;
        mutator.chmod(&target, node.stat.perm_bits())?;
        mutator.chown(&target, node.stat.uid, node.stat.gid)?;
    }
    Ok(())
}

enum Task {
    UpdatePair(Pair),
    CreateNew(usize),
}

#[allow(clippy::too_many_arguments)]
fn parallel_update_and_create(
    a: &Index,
    b: &Index,
    m: &MatchResult,
    t_root: &Utf8Path,
    mode: Mode,
    threads: usize,
    block_identity_threshold: u64,
    oracles: Option<&CowOracles>,
    snap_a: &str,
    snap_b: &str,
    mutator: &Mutator,
) -> Result<()> {
    let mut tasks: Vec<(Utf8PathBuf, Task)> = m
        .pairs
        .iter()
        .map(|&p| (t_root.join(&b.nodes[p.b].relpath), Task::UpdatePair(p)))
        .chain(
            m.b_only
                .iter()
                .filter(|&(_, &idx)| !b.nodes[idx].is_dir())
                .map(|(relpath, &idx)| (t_root.join(relpath), Task::CreateNew(idx))),
        )
        .collect();
    tasks.sort_unstable_by(|x, y| x.0.cmp(&y.0));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .expect("building the fixed-size worker pool");

    let results: Vec<Result<()>> = pool.install(|| {
        tasks
            .par_iter()
            .map(|(target, task)| match task {
                Task::UpdatePair(pair) => update_pair(
                    a,
                    b,
                    pair,
                    target,
                    mode,
                    block_identity_threshold,
                    oracles,
                    snap_a,
                    snap_b,
                    mutator,
                ),
                Task::CreateNew(idx) => create_new(b, *idx, target, mutator, true),
            })
            .collect()
    });
    for r in results {
        r?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn update_pair(
    a: &Index,
    b: &Index,
    pair: &Pair,
    target: &Utf8Path,
    mode: Mode,
    block_identity_threshold: u64,
    oracles: Option<&CowOracles>,
    snap_a: &str,
    snap_b: &str,
    mutator: &Mutator,
) -> Result<()> {
    let an = &a.nodes[pair.a];
    let bn = &b.nodes[pair.b];

    if an.relpath != bn.relpath {
        if bn.is_dir() {
            return Err(crate::error::Error::InvariantViolation(format!(
                "directory {} was renamed to {} but directories are never pre-staged or moved",
                an.relpath, bn.relpath
            )));
        }
        let staging = bn.staging_path.as_ref().expect("moving pair was pre-staged");
        mutator.rename(staging, target, &an.relpath)?;
    }

    match bn.kind {
        NodeKind::Directory => {}
        NodeKind::Symlink => {
            let a_dest = an.link_dest().ok().map(|p| p.to_owned());
            let b_dest = bn.link_dest().ok().map(|p| p.to_owned());
            if a_dest != b_dest {
                if let Some(b_dest) = b_dest {
                    if target.is_symlink() || target.exists() {
                        mutator.unlink(target)?;
                    }
                    mutator.symlink(&b_dest, target)?;
                }
            }
            return Ok(());
        }
        NodeKind::Regular => {
            let unchanged = match mode {
                Mode::PathOnly => false,
                Mode::Linked => an.stat.ino == bn.stat.ino,
                Mode::Cow => an.stat.ctime == bn.stat.ctime,
            };
            if unchanged {
                return Ok(());
            }
            if an.stat.size != bn.stat.size {
                mutator.unlink(target).ok();
                mutator.copy(&bn.path, target)?;
            } else if mode == Mode::Cow && bn.stat.size > block_identity_threshold && oracles.is_some() {
                let oracles = oracles.unwrap();
                let id_a = oracles.block_identity.block_id(snap_a, an.stat.ino);
                let id_b = oracles.block_identity.block_id(snap_b, bn.stat.ino);
                if id_a.is_some() && id_a == id_b {
                    // Same top-level indirect block: physically unchanged.
                } else {
                    mutator.merge(&bn.path, target)?;
                }
            } else {
                mutator.merge(&bn.path, target)?;
            }
        }
    }

    if an.stat.perm_bits() != bn.stat.perm_bits() {
        mutator.chmod(target, bn.stat.perm_bits())?;
    }
    if an.stat.uid != bn.stat.uid || an.stat.gid != bn.stat.gid {
        mutator.chown(target, bn.stat.uid, bn.stat.gid)?;
    }
    mutator.utime(target, bn.stat.atime, bn.stat.mtime)?;
    Ok(())
}

fn create_new(b: &Index, idx: usize, target: &Utf8Path, mutator: &Mutator, set_utime: bool) -> Result<()> {
    let node = &b.nodes[idx];
    match node.kind {
        NodeKind::Directory => mutator.mkdir(target)?,
        NodeKind::Symlink => {
            if let Ok(dest) = node.link_dest() {
                let dest = dest.to_owned();
                mutator.symlink(&dest, target)?;
            }
        }
        NodeKind::Regular => mutator.copy(&node.path, target)?,
    }
    if node.kind != NodeKind::Symlink {
        mutator.chmod(target, node.stat.perm_bits())?;
    }
    mutator.chown(target, node.stat.uid, node.stat.gid)?;
    if set_utime {
        mutator.utime(target, node.stat.atime, node.stat.mtime)?;
    }
    Ok(())
}

fn cleanup_staging(staging_root: &Utf8Path, mutator: &Mutator) -> Result<()> {
    if mutator.dry_run {
        return Ok(());
    }
    if staging_root.exists() {
        std::fs::remove_dir_all(staging_root)
            .map_err(|e| crate::error::Error::io(staging_root, e))?;
    }
    Ok(())
}

fn final_directory_mtimes(b: &Index, t_root: &Utf8Path, mutator: &Mutator) -> Result<()> {
    for node in b.nodes.iter().filter(|n| n.is_dir()) {
        let target = t_root.join(&node.relpath);
        let current = match std::fs::symlink_metadata(&target) {
            Ok(m) => m,
            Err(e) => {
                warn!("couldn't stat {target} for final mtime reconciliation: {e}");
                continue;
            }
        };
        let current_mtime = current
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if current_mtime != node.stat.mtime.as_second() {
            mutator.utime(&target, node.stat.atime, node.stat.mtime)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;
    use std::fs;

    fn mirror(src: &Utf8Path, dst: &Utf8Path) {
        fs::create_dir_all(dst).unwrap();
        for entry in walkdir_lite(src) {
            let rel = entry.strip_prefix(src).unwrap();
            let target = dst.join(rel);
            let meta = fs::symlink_metadata(&entry).unwrap();
            if meta.is_dir() {
                fs::create_dir_all(&target).unwrap();
            } else if meta.file_type().is_symlink() {
                #[cfg(unix)]
                std::os::unix::fs::symlink(fs::read_link(&entry).unwrap(), &target).unwrap();
            } else {
                fs::copy(&entry, &target).unwrap();
            }
        }
    }

    fn walkdir_lite(root: &Utf8Path) -> Vec<Utf8PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_owned()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap() {
                let entry = entry.unwrap();
                let path = Utf8PathBuf::try_from(entry.path()).unwrap();
                if path != root {
                    out.push(path.clone());
                }
                if entry.file_type().unwrap().is_dir() {
                    stack.push(path);
                }
            }
        }
        out
    }

    fn run_apply(a: &Utf8Path, b: &Utf8Path, t: &Utf8Path, mode: Mode) -> Mutator {
        mirror(a, t);
        let mutator = Mutator::new(false, 3);
        let req = ApplyRequest {
            a_root: a,
            b_root: b,
            t_root: t,
            ignore: HashSet::new(),
            mode,
            threads: 2,
            snap_a: "a".into(),
            snap_b: "b".into(),
            block_identity_threshold: DEFAULT_BLOCK_IDENTITY_THRESHOLD,
        };
        apply(req, &mutator, None).unwrap();
        mutator
    }

    #[test]
    fn s1_rename_preserves_inode_identity() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let t_dir = tempfile::tempdir().unwrap();
        let a = Utf8Path::from_path(a_dir.path()).unwrap();
        let b = Utf8Path::from_path(b_dir.path()).unwrap();
        let t = Utf8Path::from_path(t_dir.path()).unwrap();

        fs::write(a.join("foo.txt"), b"AB").unwrap();
        fs::hard_link(a.join("foo.txt"), b.join("bar.txt")).unwrap();

        run_apply(a, b, t, Mode::Linked);

        assert!(!t.join("foo.txt").exists());
        assert_eq!(fs::read(t.join("bar.txt")).unwrap(), b"AB");
    }

    #[test]
    fn s3_type_change_deletes_then_creates() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let t_dir = tempfile::tempdir().unwrap();
        let a = Utf8Path::from_path(a_dir.path()).unwrap();
        let b = Utf8Path::from_path(b_dir.path()).unwrap();
        let t = Utf8Path::from_path(t_dir.path()).unwrap();

        #[cfg(unix)]
        std::os::unix::fs::symlink("x", a.join("p")).unwrap();
        fs::create_dir(b.join("p")).unwrap();

        run_apply(a, b, t, Mode::PathOnly);

        assert!(t.join("p").is_dir());
    }

    #[test]
    fn s4_delete_subtree_children_before_parent() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let t_dir = tempfile::tempdir().unwrap();
        let a = Utf8Path::from_path(a_dir.path()).unwrap();
        let b = Utf8Path::from_path(b_dir.path()).unwrap();
        let t = Utf8Path::from_path(t_dir.path()).unwrap();

        fs::create_dir(a.join("d")).unwrap();
        fs::write(a.join("d/f"), b"x").unwrap();

        run_apply(a, b, t, Mode::PathOnly);

        assert!(!t.join("d").exists());
    }

    #[test]
    fn no_op_apply_performs_zero_mutations() {
        let a_dir = tempfile::tempdir().unwrap();
        let t_dir = tempfile::tempdir().unwrap();
        let a = Utf8Path::from_path(a_dir.path()).unwrap();
        let t = Utf8Path::from_path(t_dir.path()).unwrap();

        fs::write(a.join("same.txt"), b"same").unwrap();
        mirror(a, t);
        // Equalize the target's own mtimes to A's so the final reconciliation
        // pass also finds nothing to do.
        let mutator = run_apply(a, a, t, Mode::Linked);

        assert_eq!(mutator.counters.total_mutations(), 0);
    }
}
