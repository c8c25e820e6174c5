//! Walk a tree once into a stable, queryable [`Index`].

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::node::{Node, NodeKind, Stat};

/// The result of walking one root: every node reachable from it, keyed two ways.
#[derive(Debug)]
pub struct Index {
    pub root: Utf8PathBuf,
    /// Walk order: parents always precede their children.
    pub nodes: Vec<Node>,
    pub by_relpath: FxHashMap<Utf8PathBuf, usize>,
    pub by_inode: FxHashMap<u64, Vec<usize>>,
}

impl Index {
    pub fn get(&self, relpath: &Utf8Path) -> Option<&Node> {
        self.by_relpath.get(relpath).map(|&i| &self.nodes[i])
    }

    pub fn inode_set(&self, ino: u64) -> &[usize] {
        self.by_inode.get(&ino).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Walk `root`, skipping any entry whose basename is in `ignore`.
///
/// Filesystem boundaries are never crossed: a child whose device differs from
/// `root`'s is skipped entirely, directory or not.
pub fn index(root: &Utf8Path, ignore: &HashSet<String>) -> Result<Index> {
    let root_stat = stat(root)?;
    let mut nodes = Vec::new();
    let mut by_relpath = FxHashMap::default();
    let mut by_inode: FxHashMap<u64, Vec<usize>> = FxHashMap::default();

    // Explicit work stack, not recursion: some source trees nest deep enough
    // that a recursive walk risks blowing the stack.
    let mut stack = vec![(root.to_owned(), Utf8PathBuf::new(), true)];

    while let Some((dir_path, dir_relpath, is_root)) = stack.pop() {
        let mut names = list_dir_with_retry(&dir_path, is_root)?;
        names.sort();

        // Push in reverse so we pop (and thus visit) in sorted order.
        for name in names.into_iter().rev() {
            if ignore.contains(&name) {
                continue;
            }
            let child_path = dir_path.join(&name);
            let child_relpath = dir_relpath.join(&name);

            let child_stat = match lstat(&child_path) {
                Ok(s) => s,
                Err(e) => {
                    warn!("couldn't stat {child_path}: {e}, skipping");
                    continue;
                }
            };
            if child_stat.dev != root_stat.dev {
                debug!("{child_path} crosses a filesystem boundary, skipping");
                continue;
            }
            let Some(kind) = kind_of(child_stat.mode) else {
                trace!("{child_path} is not a directory, regular file, or symlink, skipping");
                continue;
            };

            let idx = nodes.len();
            nodes.push(Node::new(
                name,
                child_path.clone(),
                child_relpath.clone(),
                kind,
                child_stat,
            ));
            by_relpath.insert(child_relpath.clone(), idx);
            by_inode.entry(child_stat.ino).or_default().push(idx);

            if kind == NodeKind::Directory {
                stack.push((child_path, child_relpath, false));
            }
        }
    }

    Ok(Index { root: root.to_owned(), nodes, by_relpath, by_inode })
}

/// List a directory's entry names, retrying an empty top-level result.
///
/// Freshly-mounted copy-on-write snapshot directories sometimes report an
/// empty listing transiently; a stale empty silently drops the whole subtree.
fn list_dir_with_retry(dir: &Utf8Path, is_root: bool) -> Result<Vec<String>> {
    let tries = if is_root { 4 } else { 1 };
    let mut last_err = None;
    for attempt in 0..tries {
        if attempt > 0 {
            let backoff = Duration::from_secs(1u64 << (attempt - 1));
            warn!("{dir} listed empty, retrying in {backoff:?}");
            thread::sleep(backoff);
        }
        match list_dir(dir) {
            Ok(names) if names.is_empty() && attempt + 1 < tries => continue,
            Ok(names) => return Ok(names),
            Err(e) => {
                last_err = Some(e);
                break;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::io(dir, std::io::Error::other("empty listing"))))
}

fn list_dir(dir: &Utf8Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name();
        match name.into_string() {
            Ok(n) => names.push(n),
            Err(_) => warn!("{dir} has a non-UTF-8 entry, skipping"),
        }
    }
    Ok(names)
}

fn kind_of(mode: u32) -> Option<NodeKind> {
    use rustix::fs::FileType;
    match FileType::from_raw_mode(mode) {
        FileType::Directory => Some(NodeKind::Directory),
        FileType::RegularFile => Some(NodeKind::Regular),
        FileType::Symlink => Some(NodeKind::Symlink),
        _ => None,
    }
}

fn stat(path: &Utf8Path) -> Result<Stat> {
    let st = rustix::fs::stat(path.as_std_path()).map_err(|e| Error::io(path, e.into()))?;
    Ok(to_stat(st))
}

fn lstat(path: &Utf8Path) -> Result<Stat> {
    let st = rustix::fs::lstat(path.as_std_path()).map_err(|e| Error::io(path, e.into()))?;
    Ok(to_stat(st))
}

fn to_stat(st: rustix::fs::Stat) -> Stat {
    Stat {
        mode: st.st_mode,
        uid: st.st_uid,
        gid: st.st_gid,
        size: st.st_size as u64,
        atime: timestamp_from(st.st_atime, st.st_atime_nsec as i64),
        mtime: timestamp_from(st.st_mtime, st.st_mtime_nsec as i64),
        ctime: timestamp_from(st.st_ctime, st.st_ctime_nsec as i64),
        dev: st.st_dev,
        ino: st.st_ino,
        nlink: st.st_nlink as u64,
    }
}

fn timestamp_from(secs: i64, nanos: i64) -> Timestamp {
    Timestamp::new(secs, nanos as i32).unwrap_or(Timestamp::UNIX_EPOCH)
}

/// An explicit cache of completed indexes, keyed by root.
///
/// Deliberately not a `static`/`lazy_static`: the driver owns one instance
/// and threads it through a run, so two runs never share state by accident.
#[derive(Default)]
pub struct IndexCache {
    entries: Mutex<FxHashMap<Utf8PathBuf, std::sync::Arc<Index>>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_index(
        &self,
        root: &Utf8Path,
        ignore: &HashSet<String>,
    ) -> Result<std::sync::Arc<Index>> {
        if let Some(cached) = self.entries.lock().unwrap().get(root) {
            trace!("index cache hit for {root}");
            return Ok(cached.clone());
        }
        let built = std::sync::Arc::new(index(root, ignore)?);
        self.entries.lock().unwrap().insert(root.to_owned(), built.clone());
        Ok(built)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}
