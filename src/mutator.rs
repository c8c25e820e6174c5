//! A thin, uniformly-logged facade over the destructive filesystem operations.
//!
//! Every call here checks `dry_run` before doing anything that would write —
//! including opening a destination file for write inside [`Mutator::copy`]
//! and [`Mutator::merge`], not just before issuing the write itself, so a
//! dry run truly performs zero writes.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;

use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;
use rustix::fs::{AtFlags, CWD, Gid, Mode, Timestamps, Uid};
use tracing::{debug, trace};

use crate::counters::Counters;
use crate::error::{Error, Result};

/// The block-merge algorithm's fixed unit, chosen to match the target
/// filesystem's recordsize so unchanged blocks never get rewritten.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Diverging blocks in a row before we give up comparing and just copy the
/// rest of the file. Three in a row strongly predicts whole-file divergence.
const MERGE_ABANDON_THRESHOLD: u32 = 3;

pub struct Mutator {
    pub dry_run: bool,
    pub verbosity: u8,
    pub counters: Counters,
}

impl Mutator {
    pub fn new(dry_run: bool, verbosity: u8) -> Self {
        Self { dry_run, verbosity, counters: Counters::default() }
    }

    fn log(&self, tier: u8, msg: std::fmt::Arguments) {
        if self.verbosity >= tier {
            debug!("{}", msg);
        } else {
            trace!("{}", msg);
        }
    }

    pub fn prename(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        self.log(1, format_args!("prestage {src} -> {dst}"));
        if self.dry_run {
            return Ok(());
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::rename(src, dst).map_err(|e| Error::io(src, e))?;
        self.counters.renamed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn rename(&self, src: &Utf8Path, dst: &Utf8Path, original: &Utf8Path) -> Result<()> {
        self.log(1, format_args!("rename {original} -> {dst}"));
        if self.dry_run {
            return Ok(());
        }
        std::fs::rename(src, dst).map_err(|e| Error::io(src, e))?;
        self.counters.renamed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn rmdir(&self, path: &Utf8Path) -> Result<()> {
        self.log(1, format_args!("rmdir {path}"));
        if self.dry_run {
            return Ok(());
        }
        std::fs::remove_dir(path).map_err(|e| Error::io(path, e))?;
        self.counters.deleted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn unlink(&self, path: &Utf8Path) -> Result<()> {
        self.log(1, format_args!("unlink {path}"));
        if self.dry_run {
            return Ok(());
        }
        std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;
        self.counters.deleted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn mkdir(&self, path: &Utf8Path) -> Result<()> {
        self.log(2, format_args!("mkdir {path}"));
        if self.dry_run {
            return Ok(());
        }
        std::fs::create_dir(path).map_err(|e| Error::io(path, e))?;
        self.counters.created_dirs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn symlink(&self, link_target: &Utf8Path, link_path: &Utf8Path) -> Result<()> {
        self.log(2, format_args!("symlink {link_path} -> {link_target}"));
        if self.dry_run {
            return Ok(());
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(link_target, link_path).map_err(|e| Error::io(link_path, e))?;
        self.counters.created_symlinks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Never follows a symlink target. On platforms without a no-follow
    /// chmod (Linux included), this is a documented no-op, logged at debug.
    pub fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        self.log(3, format_args!("chmod {path} {mode:o}"));
        if self.dry_run {
            return Ok(());
        }
        match rustix::fs::chmodat(CWD, path.as_std_path(), Mode::from_raw_mode(mode), AtFlags::SYMLINK_NOFOLLOW) {
            Ok(()) => {
                self.counters.chmodded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(rustix::io::Errno::OPNOTSUPP) | Err(rustix::io::Errno::INVAL) => {
                debug!("chmod has no symlink-safe variant here, skipping {path}");
                Ok(())
            }
            Err(e) => Err(Error::io(path, e.into())),
        }
    }

    pub fn chown(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<()> {
        self.log(3, format_args!("chown {path} {uid}:{gid}"));
        if self.dry_run {
            return Ok(());
        }
        rustix::fs::chownat(
            CWD,
            path.as_std_path(),
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .map_err(|e| Error::io(path, e.into()))?;
        self.counters.chowned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn utime(&self, path: &Utf8Path, atime: Timestamp, mtime: Timestamp) -> Result<()> {
        self.log(3, format_args!("utime {path}"));
        if self.dry_run {
            return Ok(());
        }
        let times = Timestamps {
            last_access: to_timespec(atime),
            last_modification: to_timespec(mtime),
        };
        rustix::fs::utimensat(CWD, path.as_std_path(), &times, AtFlags::SYMLINK_NOFOLLOW)
            .map_err(|e| Error::io(path, e.into()))?;
        self.counters.utimed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn copy(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        self.log(1, format_args!("copy {src} -> {dst}"));
        if self.dry_run {
            return Ok(());
        }
        let mut from = std::fs::File::open(src).map_err(|e| Error::io(src, e))?;
        let mut to = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dst)
            .map_err(|e| Error::io(dst, e))?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            let n = from.read(&mut buf).map_err(|e| Error::io(src, e))?;
            if n == 0 {
                break;
            }
            to.write_all(&buf[..n]).map_err(|e| Error::io(dst, e))?;
        }
        self.counters.copied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rewrite only the 128 KiB blocks of `dst` that differ from `src`.
    ///
    /// After three differing blocks in a row, give up comparing and copy the
    /// remainder of `src` over `dst` unconditionally, since three diverging
    /// blocks strongly predicts the whole file has changed and further reads
    /// to compare would just be wasted I/O.
    pub fn merge(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        self.log(1, format_args!("merge {src} -> {dst}"));
        if self.dry_run {
            return Ok(());
        }
        let mut from = std::fs::File::open(src).map_err(|e| Error::io(src, e))?;
        let mut to = OpenOptions::new().write(true).open(dst).map_err(|e| Error::io(dst, e))?;

        let mut a = vec![0u8; BLOCK_SIZE];
        let mut b = vec![0u8; BLOCK_SIZE];
        let mut n_diff = 0u32;

        loop {
            let pos = to.stream_position().map_err(|e| Error::io(dst, e))?;
            let na = read_fully(&mut from, &mut a).map_err(|e| Error::io(src, e))?;
            if n_diff < MERGE_ABANDON_THRESHOLD {
                let nb = read_fully(&mut to, &mut b).map_err(|e| Error::io(dst, e))?;
                if na != nb {
                    return Err(Error::MergeSync { a: src.to_owned(), b: dst.to_owned(), offset: pos });
                }
                if na == 0 {
                    self.counters.merged.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                if a[..na] == b[..nb] {
                    continue;
                }
                to.seek(SeekFrom::Start(pos)).map_err(|e| Error::io(dst, e))?;
                to.write_all(&a[..na]).map_err(|e| Error::io(dst, e))?;
                self.counters.merge_blocks_written.fetch_add(1, Ordering::Relaxed);
                n_diff += 1;
            } else {
                if na == 0 {
                    self.counters.merged.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                to.seek(SeekFrom::Start(pos)).map_err(|e| Error::io(dst, e))?;
                to.write_all(&a[..na]).map_err(|e| Error::io(dst, e))?;
                self.counters.merge_blocks_written.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn read_fully(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn to_timespec(ts: Timestamp) -> rustix::fs::Timespec {
    rustix::fs::Timespec { tv_sec: ts.as_second(), tv_nsec: ts.subsec_nanosecond() as _ }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    fn write_blocks(path: &Utf8Path, blocks: &[&[u8]]) {
        let mut f = std::fs::File::create(path).unwrap();
        for b in blocks {
            let mut block = vec![0u8; BLOCK_SIZE];
            block[..b.len()].copy_from_slice(b);
            f.write_all(&block).unwrap();
        }
    }

    #[test]
    fn merge_rewrites_only_differing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(&dir.path().join("src")).unwrap().to_owned();
        let dst = Utf8Path::from_path(&dir.path().join("dst")).unwrap().to_owned();
        write_blocks(&src, &[b"AAAA", b"CHANGED", b"CCCC"]);
        write_blocks(&dst, &[b"AAAA", b"BBBB", b"CCCC"]);

        let m = Mutator::new(false, 0);
        m.merge(&src, &dst).unwrap();

        assert_eq!(m.counters.merge_blocks_written.load(Ordering::Relaxed), 1);
        assert_eq!(std::fs::read(&dst).unwrap(), std::fs::read(&src).unwrap());
    }

    #[test]
    fn merge_abandons_after_three_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(&dir.path().join("src")).unwrap().to_owned();
        let dst = Utf8Path::from_path(&dir.path().join("dst")).unwrap().to_owned();
        write_blocks(&src, &[b"1", b"2", b"3", b"4", b"5"]);
        write_blocks(&dst, &[b"a", b"b", b"c", b"4", b"5"]);

        let m = Mutator::new(false, 0);
        m.merge(&src, &dst).unwrap();

        // Blocks 1-3 differ and trip the threshold; blocks 4-5 are copied
        // unconditionally without being compared, for 5 writes total.
        assert_eq!(m.counters.merge_blocks_written.load(Ordering::Relaxed), 5);
        assert_eq!(std::fs::read(&dst).unwrap(), std::fs::read(&src).unwrap());
    }

    #[test]
    fn dry_run_merge_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(&dir.path().join("src")).unwrap().to_owned();
        let dst = Utf8Path::from_path(&dir.path().join("dst")).unwrap().to_owned();
        write_blocks(&src, &[b"AAAA", b"CHANGED"]);
        write_blocks(&dst, &[b"AAAA", b"BBBB"]);
        let before = std::fs::read(&dst).unwrap();

        let m = Mutator::new(true, 0);
        m.merge(&src, &dst).unwrap();

        assert_eq!(m.counters.total_mutations(), 0);
        assert_eq!(std::fs::read(&dst).unwrap(), before);
    }

    #[test]
    fn dry_run_copy_does_not_create_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(&dir.path().join("src")).unwrap().to_owned();
        let dst = Utf8Path::from_path(&dir.path().join("dst")).unwrap().to_owned();
        std::fs::write(&src, b"hello").unwrap();

        let m = Mutator::new(true, 0);
        m.copy(&src, &dst).unwrap();

        assert!(!dst.exists());
    }
}
