//! The pair-matcher: decide which entries of A and B are "the same thing".
//!
//! Phases run inode-first, relpath-second, mirroring [`crate::index`]'s own
//! by-inode/by-relpath duality: an identical relpath whose inode also
//! matches is a true survivor (phase M1); a relpath match on differing
//! inodes is content replaced in place (phase M2).

use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::index::Index;
use crate::node::NodeKind;
use crate::oracle::{BlockIdentityOracle, GenerationOracle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    PathOnly,
    Linked,
    Cow,
}

/// Indices into `a.nodes` and `b.nodes` naming the same logical entity.
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub a: usize,
    pub b: usize,
}

pub struct MatchResult {
    pub pairs: Vec<Pair>,
    /// relpath -> node index in A, to delete.
    pub a_only: FxHashMap<Utf8PathBuf, usize>,
    /// relpath -> node index in B, to create.
    pub b_only: FxHashMap<Utf8PathBuf, usize>,
}

pub struct CowOracles<'a> {
    pub generation: &'a dyn GenerationOracle,
    pub block_identity: &'a dyn BlockIdentityOracle,
    pub snap_a: &'a str,
    pub snap_b: &'a str,
}

pub fn match_indexes(
    a: &Index,
    b: &Index,
    mode: Mode,
    oracles: Option<&CowOracles>,
) -> MatchResult {
    let mut a_only: FxHashMap<Utf8PathBuf, usize> =
        a.nodes.iter().enumerate().map(|(i, n)| (n.relpath.clone(), i)).collect();
    let mut b_only: FxHashMap<Utf8PathBuf, usize> =
        b.nodes.iter().enumerate().map(|(i, n)| (n.relpath.clone(), i)).collect();
    let mut pairs = Vec::new();

    if mode != Mode::PathOnly {
        phase_m1(a, b, mode, oracles, &mut pairs, &mut a_only, &mut b_only);
    }
    phase_m2(a, b, &mut pairs, &mut a_only, &mut b_only);

    MatchResult { pairs, a_only, b_only }
}

fn phase_m1(
    a: &Index,
    b: &Index,
    mode: Mode,
    oracles: Option<&CowOracles>,
    pairs: &mut Vec<Pair>,
    a_only: &mut FxHashMap<Utf8PathBuf, usize>,
    b_only: &mut FxHashMap<Utf8PathBuf, usize>,
) {
    let mut b_inodes: Vec<u64> = b.by_inode.keys().copied().collect();
    b_inodes.sort_unstable();

    for ino in b_inodes {
        let b_set = b.inode_set(ino);
        let Some(&b_repr_idx) = b_set.first() else { continue };
        let b_repr = &b.nodes[b_repr_idx];
        if b_repr.is_dir() {
            continue;
        }
        if b_set.len() > 1 {
            warn!("{} shares inode {ino} with {} other entries in B", b_repr.relpath, b_set.len() - 1);
        }

        let a_set = a.inode_set(ino);
        let Some(&a_repr_idx) = a_set.first() else { continue };
        let a_repr = &a.nodes[a_repr_idx];
        if a_repr.is_dir() != b_repr.is_dir() {
            warn!("inode {ino} is a directory on one side only, skipping");
            continue;
        }
        if a_set.len() > 1 {
            warn!("{} shares inode {ino} with {} other entries in A", a_repr.relpath, a_set.len() - 1);
        }

        if mode == Mode::Cow {
            let Some(oracles) = oracles else {
                warn!("COW mode requested but no oracles were supplied, skipping inode {ino}");
                continue;
            };
            let gen_a = oracles.generation.generation(oracles.snap_a, ino);
            let gen_b = oracles.generation.generation(oracles.snap_b, ino);
            match (gen_a, gen_b) {
                (Some(ga), Some(gb)) if ga != gb => {
                    warn!("inode {ino} recycled between snapshots (gen {ga} -> {gb}), skipping");
                    continue;
                }
                (None, _) | (_, None) => {
                    warn!("couldn't obtain generation for inode {ino}, skipping");
                    continue;
                }
                _ => {}
            }
        }

        if !a_only.contains_key(&a_repr.relpath) || !b_only.contains_key(&b_repr.relpath) {
            // Already paired via another inode alias; shouldn't happen for
            // representatives, but stay defensive.
            continue;
        }

        if a_repr.stat.size != b_repr.stat.size && a_repr.name != b_repr.name {
            warn!(
                "inode {ino} looks recycled ({} -> {}, size {} -> {}), skipping",
                a_repr.relpath, b_repr.relpath, a_repr.stat.size, b_repr.stat.size
            );
            continue;
        }

        pairs.push(Pair { a: a_repr_idx, b: b_repr_idx });
        a_only.remove(&a_repr.relpath);
        b_only.remove(&b_repr.relpath);
    }
}

fn phase_m2(
    a: &Index,
    b: &Index,
    pairs: &mut Vec<Pair>,
    a_only: &mut FxHashMap<Utf8PathBuf, usize>,
    b_only: &mut FxHashMap<Utf8PathBuf, usize>,
) {
    let remaining_b: Vec<Utf8PathBuf> = b_only.keys().cloned().collect();
    for relpath in remaining_b {
        let Some(&a_idx) = a_only.get(&relpath) else { continue };
        let Some(&b_idx) = b_only.get(&relpath) else { continue };
        if a.nodes[a_idx].kind == b.nodes[b_idx].kind {
            pairs.push(Pair { a: a_idx, b: b_idx });
            a_only.remove(&relpath);
            b_only.remove(&relpath);
        }
        // Differing kind: leave both in their residuals so the applier
        // resolves the type change as a delete-then-create.
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index;
    use camino::Utf8Path;
    use std::collections::HashSet;

    #[test]
    fn path_only_ignores_inode_identity() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("f"), b"x").unwrap();
        std::fs::write(dir_b.path().join("f"), b"y").unwrap();

        let a = index::index(Utf8Path::from_path(dir_a.path()).unwrap(), &HashSet::new()).unwrap();
        let b = index::index(Utf8Path::from_path(dir_b.path()).unwrap(), &HashSet::new()).unwrap();

        let m = match_indexes(&a, &b, Mode::PathOnly, None);
        assert_eq!(m.pairs.len(), 1);
        assert!(m.a_only.is_empty() && m.b_only.is_empty());
    }

    #[test]
    fn linked_mode_pairs_by_inode_across_renames() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("old.txt"), b"x").unwrap();
        std::fs::hard_link(dir_a.path().join("old.txt"), dir_b.path().join("new.txt")).unwrap();

        let a = index::index(Utf8Path::from_path(dir_a.path()).unwrap(), &HashSet::new()).unwrap();
        let b = index::index(Utf8Path::from_path(dir_b.path()).unwrap(), &HashSet::new()).unwrap();

        let m = match_indexes(&a, &b, Mode::Linked, None);
        assert_eq!(m.pairs.len(), 1);
        assert_eq!(a.nodes[m.pairs[0].a].relpath, Utf8Path::new("old.txt"));
        assert_eq!(b.nodes[m.pairs[0].b].relpath, Utf8Path::new("new.txt"));
    }

    #[test]
    fn type_change_is_left_in_residuals() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("p"), b"x").unwrap();
        std::fs::create_dir(dir_b.path().join("p")).unwrap();

        let a = index::index(Utf8Path::from_path(dir_a.path()).unwrap(), &HashSet::new()).unwrap();
        let b = index::index(Utf8Path::from_path(dir_b.path()).unwrap(), &HashSet::new()).unwrap();

        let m = match_indexes(&a, &b, Mode::Linked, None);
        assert!(m.pairs.is_empty());
        assert_eq!(m.a_only.len(), 1);
        assert_eq!(m.b_only.len(), 1);
    }

    #[test]
    fn residual_coverage_holds() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("keep"), b"x").unwrap();
        std::fs::write(dir_a.path().join("gone"), b"x").unwrap();
        std::fs::write(dir_b.path().join("keep"), b"x").unwrap();
        std::fs::write(dir_b.path().join("new"), b"y").unwrap();

        let a = index::index(Utf8Path::from_path(dir_a.path()).unwrap(), &HashSet::new()).unwrap();
        let b = index::index(Utf8Path::from_path(dir_b.path()).unwrap(), &HashSet::new()).unwrap();
        let m = match_indexes(&a, &b, Mode::PathOnly, None);

        assert_eq!(m.pairs.len() + m.a_only.len(), a.len());
        assert_eq!(m.pairs.len() + m.b_only.len(), b.len());
    }
}
