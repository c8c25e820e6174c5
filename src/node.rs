//! The [`Node`]/[`Stat`] data model: one filesystem entry as seen by an [`crate::index::Index`].

use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;

/// The three kinds of entry the indexer will ever hand back.
///
/// Anything else (devices, sockets, fifos, doors) is filtered out at walk time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Directory,
    Regular,
    Symlink,
}

/// The subset of `stat(2)` we actually compare or replay.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
}

impl Stat {
    /// Permission bits only (low 12), the part `chmod` actually replays.
    pub fn perm_bits(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// One filesystem entry discovered by an index walk.
///
/// Nodes are immutable from the moment the indexer emits them until the
/// applier assigns a `staging_path` during the pre-stage phase; an index is
/// never mutated again after that.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub path: Utf8PathBuf,
    pub relpath: Utf8PathBuf,
    pub kind: NodeKind,
    pub stat: Stat,
    link_dest: std::sync::OnceLock<Utf8PathBuf>,
    pub staging_path: Option<Utf8PathBuf>,
}

impl Node {
    pub fn new(name: String, path: Utf8PathBuf, relpath: Utf8PathBuf, kind: NodeKind, stat: Stat) -> Self {
        Self {
            name,
            path,
            relpath,
            kind,
            stat,
            link_dest: std::sync::OnceLock::new(),
            staging_path: None,
        }
    }

    /// The symlink target, resolved lazily on first access and memoized.
    ///
    /// Panics if called on a non-symlink node; callers are expected to check
    /// `kind` first since this mirrors the invariant that `link_dest` is only
    /// ever meaningful for symlinks.
    pub fn link_dest(&self) -> std::io::Result<&Utf8Path> {
        if let Some(existing) = self.link_dest.get() {
            return Ok(existing);
        }
        assert_eq!(self.kind, NodeKind::Symlink, "link_dest on a non-symlink node");
        let target = std::fs::read_link(&self.path)?;
        let target = Utf8PathBuf::try_from(target)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(self.link_dest.get_or_init(|| target))
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}
