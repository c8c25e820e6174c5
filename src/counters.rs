//! Mutation counters: how many times the mutator did each kind of thing.
//!
//! An explicit struct, not a global `static` — the applier owns one instance
//! per run so concurrent runs (and tests) never share counts by accident.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub renamed: AtomicU64,
    pub deleted: AtomicU64,
    pub created_dirs: AtomicU64,
    pub created_symlinks: AtomicU64,
    pub copied: AtomicU64,
    pub merged: AtomicU64,
    pub merge_blocks_written: AtomicU64,
    pub chmodded: AtomicU64,
    pub chowned: AtomicU64,
    pub utimed: AtomicU64,
}

impl Counters {
    pub fn total_mutations(&self) -> u64 {
        self.renamed.load(Ordering::Relaxed)
            + self.deleted.load(Ordering::Relaxed)
            + self.created_dirs.load(Ordering::Relaxed)
            + self.created_symlinks.load(Ordering::Relaxed)
            + self.copied.load(Ordering::Relaxed)
            + self.merged.load(Ordering::Relaxed)
            + self.chmodded.load(Ordering::Relaxed)
            + self.chowned.load(Ordering::Relaxed)
            + self.utimed.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} renamed, {} deleted, {} dirs created, {} symlinks created, \
             {} copied, {} merged ({} blocks rewritten), {} chmod, {} chown, {} utime",
            self.renamed.load(Ordering::Relaxed),
            self.deleted.load(Ordering::Relaxed),
            self.created_dirs.load(Ordering::Relaxed),
            self.created_symlinks.load(Ordering::Relaxed),
            self.copied.load(Ordering::Relaxed),
            self.merged.load(Ordering::Relaxed),
            self.merge_blocks_written.load(Ordering::Relaxed),
            self.chmodded.load(Ordering::Relaxed),
            self.chowned.load(Ordering::Relaxed),
            self.utimed.load(Ordering::Relaxed),
        )
    }
}
