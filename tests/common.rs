#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;

pub fn cli() -> Result<Command> {
    Ok(Command::cargo_bin(env!("CARGO_PKG_NAME"))?)
}

pub fn write_file(dir: &Path, relpath: &str, contents: &[u8]) {
    let path = dir.join(relpath);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}
