use std::collections::HashSet;
use std::fs;

use camino::Utf8Path;
use tempfile::tempdir;
use zfsreplay::apply::{self, ApplyRequest, DEFAULT_BLOCK_IDENTITY_THRESHOLD};
use zfsreplay::matcher::Mode;
use zfsreplay::mutator::{Mutator, BLOCK_SIZE};

fn mirror(src: &Utf8Path, dst: &Utf8Path) {
    let mut stack = vec![src.to_owned()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = Utf8Path::from_path(&entry.path()).unwrap().to_owned();
            let rel = path.strip_prefix(src).unwrap();
            let target = dst.join(rel);
            let meta = fs::symlink_metadata(&path).unwrap();
            if meta.is_dir() {
                fs::create_dir_all(&target).unwrap();
                stack.push(path);
            } else if meta.file_type().is_symlink() {
                #[cfg(unix)]
                std::os::unix::fs::symlink(fs::read_link(&path).unwrap(), &target).unwrap();
            } else {
                fs::copy(&path, &target).unwrap();
            }
        }
    }
}

fn run(a: &Utf8Path, b: &Utf8Path, t: &Utf8Path, mode: Mode) -> Mutator {
    mirror(a, t);
    let mutator = Mutator::new(false, 0);
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
    apply::apply(req, &mutator, None).unwrap();
    mutator
}

#[test]
fn s2_in_place_edit_rewrites_only_the_changed_block() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();
    let t_dir = tempdir().unwrap();
    let a = Utf8Path::from_path(a_dir.path()).unwrap();
    let b = Utf8Path::from_path(b_dir.path()).unwrap();
    let t = Utf8Path::from_path(t_dir.path()).unwrap();

    let mut blocks_a = vec![0u8; BLOCK_SIZE * 4];
    blocks_a[0] = 1;
    blocks_a[BLOCK_SIZE] = 2;
    blocks_a[BLOCK_SIZE * 2] = 3;
    blocks_a[BLOCK_SIZE * 3] = 4;
    let mut blocks_b = blocks_a.clone();
    blocks_b[BLOCK_SIZE + 5] = 99; // only block index 1 differs

    fs::write(a.join("a.bin"), &blocks_a).unwrap();
    fs::write(b.join("a.bin"), &blocks_b).unwrap();

    let mutator = run(a, b, t, Mode::Cow);

    assert_eq!(
        mutator.counters.merge_blocks_written.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(fs::read(t.join("a.bin")).unwrap(), blocks_b);
}

#[test]
fn s5_move_into_new_directory() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();
    let t_dir = tempdir().unwrap();
    let a = Utf8Path::from_path(a_dir.path()).unwrap();
    let b = Utf8Path::from_path(b_dir.path()).unwrap();
    let t = Utf8Path::from_path(t_dir.path()).unwrap();

    fs::write(a.join("x"), b"payload").unwrap();
    fs::create_dir(b.join("sub")).unwrap();
    fs::hard_link(a.join("x"), b.join("sub/y")).unwrap();

    run(a, b, t, Mode::Linked);

    assert!(!t.join("x").exists());
    assert_eq!(fs::read(t.join("sub/y")).unwrap(), b"payload");
}

#[test]
fn s6_symlink_target_change_with_differing_inodes() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();
    let t_dir = tempdir().unwrap();
    let a = Utf8Path::from_path(a_dir.path()).unwrap();
    let b = Utf8Path::from_path(b_dir.path()).unwrap();
    let t = Utf8Path::from_path(t_dir.path()).unwrap();

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink("old", a.join("l")).unwrap();
        std::os::unix::fs::symlink("new", b.join("l")).unwrap();
    }

    run(a, b, t, Mode::PathOnly);

    let target = fs::read_link(t.join("l")).unwrap();
    assert_eq!(target, std::path::PathBuf::from("new"));
}
