use tempfile::tempdir;

mod common;
use common::*;

#[test]
fn diff_reports_added_removed_and_metadata_changes() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();

    write_file(a_dir.path(), "keep.txt", b"same");
    write_file(a_dir.path(), "gone.txt", b"bye");
    write_file(b_dir.path(), "keep.txt", b"same");
    write_file(b_dir.path(), "new.txt", b"hi");

    let assert = cli()
        .unwrap()
        .args(["diff", "--mode", "path-only"])
        .arg(a_dir.path())
        .arg(b_dir.path())
        .assert()
        .success();

    let out = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(out.contains("- gone.txt"));
    assert!(out.contains("+ new.txt"));
    assert!(!out.contains("keep.txt"));
}

#[test]
fn diff_rejects_cow_mode_without_an_oracle() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();

    cli()
        .unwrap()
        .args(["diff", "--mode", "cow"])
        .arg(a_dir.path())
        .arg(b_dir.path())
        .assert()
        .failure();
}
