//! Cross-job defaults, loaded from `~/.config/zfsreplay.toml` if present.
//!
//! CLI flags always override whatever is in the config file.

use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

fn default_threads() -> usize {
    4
}

fn default_block_identity_threshold() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Files above this size skip full comparison in `Cow` mode and consult
    /// the block-identity oracle instead.
    #[serde(default = "default_block_identity_threshold")]
    pub block_identity_threshold: u64,

    #[serde(default)]
    pub ignore: Vec<String>,

    pub generation_oracle_path: Option<String>,
    pub block_identity_oracle_path: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            block_identity_threshold: default_block_identity_threshold(),
            ignore: Vec::new(),
            generation_oracle_path: None,
            block_identity_oracle_path: None,
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("can't find home directory"))?
        .try_into()
        .context("home directory isn't UTF-8")?;
    confpath.extend([".config", "zfsreplay.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("couldn't parse {confpath}"))?;
    Ok(conf)
}
