//! Replay historical filesystem snapshots onto a live copy-on-write target.
//!
//! The four core modules ([`index`], [`matcher`], [`mutator`], [`apply`])
//! form a standalone library: given two read-only source trees and a
//! mutable target tree, they transform the target from one into the other
//! with minimal writes and preserved inode identity. Everything else here
//! ([`driver`], [`config`], the `zfsreplay` binary) is the ambient
//! collaborator that supplies those trees from a chain of real snapshots.

pub mod apply;
pub mod config;
pub mod counters;
pub mod driver;
pub mod error;
pub mod index;
pub mod ls;
pub mod matcher;
pub mod mutator;
pub mod node;
pub mod oracle;

/// The four components with the correctness contract: Indexer, Pair-Matcher,
/// Mutator, Applier. Everything else in this crate is ambient plumbing
/// (`driver`, `config`, the binary) that feeds them real snapshot trees.
pub mod core {
    pub use crate::apply::*;
    pub use crate::index::*;
    pub use crate::matcher::*;
    pub use crate::mutator::*;
    pub use crate::node::*;
}
