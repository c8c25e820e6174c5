//! The core's closed error taxonomy.
//!
//! Everything that can make the applier abort a step lives here. Divergences
//! the indexer and matcher can recover from structurally (hardlink sets,
//! recycled inodes) are not errors at all — they're `tracing::warn!` events,
//! since by definition they never fail a `Result`.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error at {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{a} and {b} disagreed on size while merging at offset {offset}")]
    MergeSync {
        a: Utf8PathBuf,
        b: Utf8PathBuf,
        offset: u64,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl Error {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
