//! Print a `+`/`-`/`M`/`U` summary line per path for the `diff` subcommand.
//!
//! This never touches the filesystem; it exists so a user can inspect what
//! an apply would do without a target tree at all.

use camino::Utf8Path;

use crate::index::Index;
use crate::matcher::{MatchResult, Pair};
use crate::node::NodeKind;

fn has_trailing_slash(p: &Utf8Path) -> bool {
    p.as_str().as_bytes().last() == Some(&b'/')
}

fn print_path(prefix: &str, path: &Utf8Path, kind: NodeKind) {
    print!("{prefix}{path}");
    if kind == NodeKind::Directory && !has_trailing_slash(path) {
        print!("/");
    }
    println!();
}

/// Print one line per changed or added/removed path, plus `U` for
/// metadata-only changes, matching the prefix convention: `+` added,
/// `-` removed, `M` contents changed, `U` metadata-only changed.
pub fn print_diff(a: &Index, b: &Index, m: &MatchResult) {
    let mut removed: Vec<&Utf8Path> = m.a_only.keys().map(|p| p.as_path()).collect();
    removed.sort_unstable();
    for relpath in removed {
        let node = &a.nodes[m.a_only[relpath]];
        print_path("- ", relpath, node.kind);
    }

    let mut added: Vec<&Utf8Path> = m.b_only.keys().map(|p| p.as_path()).collect();
    added.sort_unstable();
    for relpath in added {
        let node = &b.nodes[m.b_only[relpath]];
        print_path("+ ", relpath, node.kind);
    }

    let mut pairs: Vec<&Pair> = m.pairs.iter().collect();
    pairs.sort_unstable_by_key(|p| &b.nodes[p.b].relpath);
    for pair in pairs {
        let an = &a.nodes[pair.a];
        let bn = &b.nodes[pair.b];
        if an.relpath != bn.relpath {
            println!("  {} -> {}", an.relpath, bn.relpath);
            continue;
        }
        let content_changed = match bn.kind {
            NodeKind::Regular => an.stat.size != bn.stat.size || an.stat.mtime != bn.stat.mtime,
            NodeKind::Symlink => an.link_dest().ok() != bn.link_dest().ok(),
            NodeKind::Directory => false,
        };
        let metadata_changed = an.stat.perm_bits() != bn.stat.perm_bits()
            || an.stat.uid != bn.stat.uid
            || an.stat.gid != bn.stat.gid;
        if content_changed {
            print_path("M ", &bn.relpath, bn.kind);
        } else if metadata_changed {
            print_path("U ", &bn.relpath, bn.kind);
        }
    }
}
