//! Three-way merge between the working tree and two historical revisions,
//! producing a textual worklog of commands for the user to review and
//! replay through the control file. Pull never mutates the tree: merges of
//! arbitrary (possibly binary) file content cannot be machine-resolved
//! safely.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use similar::TextDiff;

use super::{Error, NodeId, Tree};
use crate::Pointer;

/// Don't render diffs for files bigger than this.
const MAX_DIFF_BYTES: u64 = 512 * 1024;

fn pointer_opt(tree: &Tree, id: Option<NodeId>) -> Option<Pointer> {
    id.and_then(|i| tree.node_pointer(i).ok())
}

fn is_dir_opt(tree: &Tree, id: Option<NodeId>) -> bool {
    id.and_then(|i| tree.info(i).ok())
        .map(|i| i.is_dir())
        .unwrap_or(false)
}

async fn children_map(tree: &mut Tree, id: NodeId) -> Result<BTreeMap<String, NodeId>, Error> {
    Ok(tree
        .children_info(id)
        .await?
        .into_iter()
        .map(|i| (i.name, i.id))
        .collect())
}

async fn read_all(tree: &mut Tree, id: NodeId) -> Result<Vec<u8>, Error> {
    let size = tree.info(id)?.size as usize;
    let mut buf = vec![0u8; size];
    let n = tree.read_at(id, &mut buf, 0).await?;
    buf.truncate(n);
    Ok(buf)
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", path, name)
    }
}

/// Walks the union of paths reachable in the working tree (W), the local
/// base (L) and the remote base (R), in lexicographic order, and emits
/// commands for everything the remote side changed. Content addressing
/// makes the comparison cheap: equal pointers mean equal subtrees, and the
/// walk does not descend into them.
pub async fn pull_worklog(
    working: &mut Tree,
    local: &mut Tree,
    remote: &mut Tree,
    remote_base: &Pointer,
) -> Result<String, Error> {
    // Comparison is by stored pointer; flush so the working tree's pointers
    // reflect its current content.
    working.flush().await?;
    let rev = remote_base.hex();
    let mut out = String::new();
    let mut work: VecDeque<(String, Option<NodeId>, Option<NodeId>, Option<NodeId>)> =
        VecDeque::from([(
            String::new(),
            Some(working.root_id()),
            Some(local.root_id()),
            Some(remote.root_id()),
        )]);
    while let Some((path, w, l, r)) = work.pop_front() {
        let wp = pointer_opt(working, w);
        let lp = pointer_opt(local, l);
        let rp = pointer_opt(remote, r);
        if wp == lp && lp == rp {
            continue; // unchanged everywhere
        }
        if wp == rp {
            continue; // both sides made the same change
        }
        if lp == rp {
            continue; // changed locally only: keep
        }
        if !path.is_empty() && working.is_ignored(&rev, &path) {
            continue;
        }
        if wp == lp && !path.is_empty() {
            // Changed remotely, untouched locally: adopt the remote side.
            if w.is_some() {
                out.push_str(&format!("unlink {}\n", path));
            }
            if r.is_some() {
                out.push_str(&format!("graft {}/{} {}\n", rev, path, path));
            }
            continue;
        }
        // The root always descends (it cannot be unlinked or grafted over);
        // elsewhere both sides changed, and descending while both are
        // directories localizes the conflict.
        if is_dir_opt(working, w) && is_dir_opt(remote, r) {
            let wc = children_map(working, w.expect("dir checked")).await?;
            let rc = children_map(remote, r.expect("dir checked")).await?;
            let lc = if is_dir_opt(local, l) {
                children_map(local, l.expect("dir checked")).await?
            } else {
                BTreeMap::new()
            };
            let names: BTreeSet<String> = wc
                .keys()
                .chain(lc.keys())
                .chain(rc.keys())
                .cloned()
                .collect();
            for name in names {
                work.push_back((
                    join(&path, &name),
                    wc.get(&name).copied(),
                    lc.get(&name).copied(),
                    rc.get(&name).copied(),
                ));
            }
            continue;
        }
        if wp == lp {
            // The root with a non-directory counterpart; nothing sensible
            // to emit.
            continue;
        }
        emit_conflict(&mut out, working, remote, &rev, &path, w, r).await?;
    }
    Ok(out)
}

async fn emit_conflict(
    out: &mut String,
    working: &mut Tree,
    remote: &mut Tree,
    rev: &str,
    path: &str,
    w: Option<NodeId>,
    r: Option<NodeId>,
) -> Result<(), Error> {
    out.push_str(&format!(
        "# conflict at {}: changed both locally and remotely\n",
        path
    ));
    out.push_str(&format!("keep-local-for {}/{}\n", rev, path));
    out.push_str("# or take the remote version instead:\n");
    if w.is_some() {
        out.push_str(&format!("#   unlink {}\n", path));
    }
    if r.is_some() {
        out.push_str(&format!("#   graft {}/{} {}\n", rev, path, path));
    }
    let (Some(w), Some(r)) = (w, r) else {
        return Ok(());
    };
    let w_info = working.info(w)?;
    let r_info = remote.info(r)?;
    if w_info.is_dir() || r_info.is_dir() {
        return Ok(());
    }
    if w_info.size > MAX_DIFF_BYTES || r_info.size > MAX_DIFF_BYTES {
        out.push_str("# (content too large to diff)\n");
        return Ok(());
    }
    let local_bytes = read_all(working, w).await?;
    let remote_bytes = read_all(remote, r).await?;
    match (
        String::from_utf8(local_bytes),
        String::from_utf8(remote_bytes),
    ) {
        (Ok(local_text), Ok(remote_text)) => {
            let diff = TextDiff::from_lines(&local_text, &remote_text);
            let rendered = diff
                .unified_diff()
                .header(&format!("local/{}", path), &format!("remote/{}", path))
                .to_string();
            for line in rendered.lines() {
                out.push_str("# ");
                out.push_str(line);
                out.push('\n');
            }
        }
        _ => out.push_str("# (binary content, no diff)\n"),
    }
    Ok(())
}

/// Renders unified diffs between a base revision's tree and the working
/// tree, for the `diff` control command. With `include_bodies`, added and
/// removed files are diffed against empty content; otherwise they are
/// mentioned by name only. `prefix` restricts the output to one subtree.
pub async fn tree_diff(
    working: &mut Tree,
    base: &mut Tree,
    prefix: Option<&str>,
    include_bodies: bool,
) -> Result<String, Error> {
    working.flush().await?;
    let wanted = |path: &str| -> bool {
        match prefix {
            None => true,
            Some(p) => {
                let p = p.trim_matches('/');
                path == p || path.starts_with(&format!("{}/", p)) || p.starts_with(&format!("{}/", path)) || path.is_empty()
            }
        }
    };
    let mut out = String::new();
    let mut work: VecDeque<(String, Option<NodeId>, Option<NodeId>)> = VecDeque::from([(
        String::new(),
        Some(working.root_id()),
        Some(base.root_id()),
    )]);
    while let Some((path, w, b)) = work.pop_front() {
        if !wanted(&path) {
            continue;
        }
        let wp = pointer_opt(working, w);
        let bp = pointer_opt(base, b);
        if wp == bp {
            continue;
        }
        if is_dir_opt(working, w) && is_dir_opt(base, b) {
            let wc = children_map(working, w.expect("dir checked")).await?;
            let bc = children_map(base, b.expect("dir checked")).await?;
            let names: BTreeSet<String> = wc.keys().chain(bc.keys()).cloned().collect();
            for name in names {
                work.push_back((
                    join(&path, &name),
                    wc.get(&name).copied(),
                    bc.get(&name).copied(),
                ));
            }
            continue;
        }
        // Leaf difference. The display path matches command grammar: no
        // leading slash.
        let emit_path = if path.is_empty() { "/" } else { &path };
        let w_file = w.is_some() && !is_dir_opt(working, w);
        let b_file = b.is_some() && !is_dir_opt(base, b);
        match (w, b) {
            (Some(wi), Some(bi)) if w_file && b_file => {
                let base_bytes = read_all(base, bi).await?;
                let local_bytes = read_all(working, wi).await?;
                push_file_diff(&mut out, emit_path, &base_bytes, &local_bytes);
            }
            (Some(wi), None) if w_file => {
                if include_bodies {
                    let local_bytes = read_all(working, wi).await?;
                    push_file_diff(&mut out, emit_path, b"", &local_bytes);
                } else {
                    out.push_str(&format!("only in local: {}\n", emit_path));
                }
            }
            (None, Some(bi)) if b_file => {
                if include_bodies {
                    let base_bytes = read_all(base, bi).await?;
                    push_file_diff(&mut out, emit_path, &base_bytes, b"");
                } else {
                    out.push_str(&format!("only in base: {}\n", emit_path));
                }
            }
            (Some(_), None) => out.push_str(&format!("only in local: {}/\n", emit_path)),
            (None, Some(_)) => out.push_str(&format!("only in base: {}/\n", emit_path)),
            _ => out.push_str(&format!("kind changed: {}\n", emit_path)),
        }
    }
    Ok(out)
}

fn push_file_diff(out: &mut String, path: &str, base: &[u8], local: &[u8]) {
    if base.len() as u64 > MAX_DIFF_BYTES || local.len() as u64 > MAX_DIFF_BYTES {
        out.push_str(&format!("{}: content too large to diff\n", path));
        return;
    }
    match (
        String::from_utf8(base.to_vec()),
        String::from_utf8(local.to_vec()),
    ) {
        (Ok(base_text), Ok(local_text)) => {
            let diff = TextDiff::from_lines(&base_text, &local_text);
            out.push_str(
                &diff
                    .unified_diff()
                    .header(&format!("base/{}", path), &format!("local/{}", path))
                    .to_string(),
            );
        }
        _ => out.push_str(&format!("{}: binary content differs\n", path)),
    }
}
