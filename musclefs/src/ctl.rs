//! The synthetic `ctl` file at the mount root: whole-command writes,
//! buffered responses served by subsequent reads. This is where flush,
//! pull and push are driven from.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use muscle::tree::{pull_worklog, tree_diff, Revision, Tree};
use muscle::Pointer;
use tracing::info;

use crate::dispatcher::State;
use crate::wire::{Qid, Stat, QTFILE};

/// State of the control file. Its qid path comes from the server start time
/// in nanoseconds, disjoint from the tree's id space.
pub struct Ctl {
    qid: Qid,
    contents: Vec<u8>,
    atime: u32,
    mtime: u32,
}

impl Ctl {
    pub fn new() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            qid: Qid {
                typ: QTFILE,
                version: 0,
                path: since_epoch.as_nanos() as u64,
            },
            contents: Vec::new(),
            atime: since_epoch.as_secs() as u32,
            mtime: since_epoch.as_secs() as u32,
        }
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    pub fn stat(&self, uid: &str) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid,
            mode: 0o644,
            atime: self.atime,
            mtime: self.mtime,
            length: self.contents.len() as u64,
            name: "ctl".to_string(),
            uid: uid.to_string(),
            gid: uid.to_string(),
            muid: String::new(),
        }
    }

    /// Serves the buffered response of the last command.
    pub fn read(&self, offset: u64, count: u32) -> Bytes {
        let offset = (offset as usize).min(self.contents.len());
        let end = (offset + count as usize).min(self.contents.len());
        Bytes::copy_from_slice(&self.contents[offset..end])
    }

    pub fn touch_atime(&mut self) {
        self.atime = unix_now();
    }

    pub fn touch_mtime(&mut self) {
        self.mtime = unix_now();
    }

    fn set_contents(&mut self, text: String) {
        self.contents = text.into_bytes();
    }
}

impl Default for Ctl {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// Runs one whole command. The response buffer is overwritten either way;
/// an error is both returned (for the 9P error response) and rendered into
/// the buffer, so `cat ctl` after a failed write shows what went wrong.
pub async fn run_command(state: &mut State, line: &str) -> Result<(), String> {
    let mut out = String::new();
    let result = dispatch(state, line, &mut out).await;
    if let Err(e) = &result {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(e);
        out.push('\n');
    }
    state.ctl.set_contents(out);
    result
}

async fn dispatch(state: &mut State, line: &str, out: &mut String) -> Result<(), String> {
    let mut tokens = line.split_whitespace();
    let Some(cmd) = tokens.next() else {
        return Ok(());
    };
    let args: Vec<&str> = tokens.collect();
    match cmd {
        "diff" => diff(state, &args, out).await,
        "level" => {
            let name = args.first().ok_or("missing argument to level")?;
            match &state.level {
                None => Err("log level control unavailable".to_string()),
                Some(handle) => {
                    handle(name)?;
                    info!(level = name, "log level changed");
                    out.push_str(&format!("level set to {}\n", name));
                    Ok(())
                }
            }
        }
        "lsof" => {
            for path in state.tree.list_nodes_in_use() {
                out.push_str(&path);
                out.push('\n');
            }
            Ok(())
        }
        "dump" => {
            out.push_str(&state.tree.dump_nodes());
            Ok(())
        }
        "keep-local-for" => {
            let arg = args.first().ok_or("missing argument to keep-local-for")?;
            let (revision, path) = arg
                .split_once('/')
                .ok_or("argument must look like REVISION/path")?;
            state.tree.ignore(revision, path);
            Ok(())
        }
        "rename" => {
            let (old, new) = match args.as_slice() {
                [old, new] => (*old, *new),
                _ => return Err("usage: rename old/path new/path".to_string()),
            };
            state
                .tree
                .rename(old, new)
                .await
                .map_err(|e| format!("could not rename {:?} to {:?}: {}", old, new, e))
        }
        "unlink" => {
            let path = args.first().ok_or("missing argument to unlink")?;
            let node = state
                .tree
                .walk_path(path)
                .await
                .map_err(|e| format!("could not walk the local tree along {:?}: {}", path, e))?;
            state.tree.remove_for_merge(node).await.map_err(|e| e.to_string())
        }
        "graft" => graft(state, &args, out).await,
        "trim" => {
            state.tree.trim();
            Ok(())
        }
        "flush" => {
            state
                .tree
                .flush()
                .await
                .map_err(|e| format!("could not flush: {}", e))?;
            out.push_str("flushed\n");
            Ok(())
        }
        "pull" => pull(state, out).await,
        "push" => push(state, out).await,
        other => Err(format!("command not recognized: {:?}", other)),
    }
}

async fn diff(state: &mut State, args: &[&str], out: &mut String) -> Result<(), String> {
    let mut include_bodies = false;
    let mut prefix = None;
    for arg in args {
        if *arg == "-N" {
            include_bodies = true;
        } else {
            prefix = Some(*arg);
        }
    }
    let base = state
        .store
        .local_base_pointer()
        .await
        .map_err(|e| e.to_string())?;
    if base.is_zero() {
        out.push_str("no local base revision, nothing to diff against\n");
        return Ok(());
    }
    let mut base_tree = Tree::with_revision(state.store.clone(), &base)
        .await
        .map_err(|e| format!("could not load tree {}: {}", base, e))?;
    let text = tree_diff(&mut state.tree, &mut base_tree, prefix, include_bodies)
        .await
        .map_err(|e| e.to_string())?;
    out.push_str(&text);
    Ok(())
}

async fn graft(state: &mut State, args: &[&str], out: &mut String) -> Result<(), String> {
    let (hist, local) = match args {
        [hist, local] => (*hist, *local),
        _ => return Err("usage: graft REVISION/hist/path local/path".to_string()),
    };
    let mut hist_elems: Vec<&str> = hist.split('/').filter(|e| !e.is_empty()).collect();
    if hist_elems.len() < 2 {
        return Err("first argument must look like REVISION/path".to_string());
    }
    let revision_hex = hist_elems.remove(0);
    let revision =
        Pointer::from_hex(revision_hex).map_err(|e| format!("{:?}: {}", revision_hex, e))?;
    let mut local_elems: Vec<&str> = local.split('/').filter(|e| !e.is_empty()).collect();
    let Some(local_name) = local_elems.pop() else {
        return Err("missing local path".to_string());
    };
    out.push_str(&format!(
        "grafting {} from revision {} into {}\n",
        hist_elems.join("/"),
        revision_hex,
        local
    ));
    let mut historical = Tree::with_revision(state.store.clone(), &revision)
        .await
        .map_err(|e| format!("could not load tree {:?}: {}", revision_hex, e))?;
    let hist_root = historical.root_id();
    let walked = historical
        .walk(hist_root, &hist_elems)
        .await
        .map_err(|e| format!("could not walk tree {:?} along {:?}: {}", revision_hex, hist_elems, e))?;
    if walked.len() != hist_elems.len() {
        return Err(format!(
            "walked {} path elements, required {}",
            walked.len(),
            hist_elems.len()
        ));
    }
    let donor = historical
        .node_pointer(*walked.last().expect("length checked"))
        .map_err(|e| e.to_string())?;
    let local_root = state.tree.root_id();
    let local_walk = state
        .tree
        .walk(local_root, &local_elems)
        .await
        .map_err(|e| format!("could not walk the local tree along {:?}: {}", local_elems, e))?;
    if local_walk.len() != local_elems.len() {
        return Err(format!(
            "walked {} path elements, required {}",
            local_walk.len(),
            local_elems.len()
        ));
    }
    let parent = local_walk.last().copied().unwrap_or(local_root);
    state
        .tree
        .graft(parent, &donor, local_name)
        .await
        .map_err(|e| format!("graft failed: {}", e))?;
    Ok(())
}

async fn pull(state: &mut State, out: &mut String) -> Result<(), String> {
    let localbase = state
        .store
        .local_base_pointer()
        .await
        .map_err(|e| e.to_string())?;
    let remotebase = state
        .store
        .remote_base_pointer()
        .await
        .map_err(|e| e.to_string())?;
    if localbase == remotebase {
        out.push_str("local base matches remote base, pull is a no-op\n");
        return Ok(());
    }
    let mut localbasetree = Tree::with_revision(state.store.clone(), &localbase)
        .await
        .map_err(|e| format!("could not load tree {}: {}", localbase, e))?;
    let mut remotebasetree = Tree::with_revision(state.store.clone(), &remotebase)
        .await
        .map_err(|e| format!("could not load tree {}: {}", remotebase, e))?;
    let commands = pull_worklog(
        &mut state.tree,
        &mut localbasetree,
        &mut remotebasetree,
        &remotebase,
    )
    .await
    .map_err(|e| e.to_string())?;
    if commands.is_empty() {
        out.push_str("no commands to run, pull is a no-op\n");
        state
            .store
            .set_local_base_pointer(&remotebase)
            .await
            .map_err(|e| e.to_string())?;
        return Ok(());
    }
    out.push_str(&commands);
    Ok(())
}

async fn push(state: &mut State, out: &mut String) -> Result<(), String> {
    let localbase = state
        .store
        .local_base_pointer()
        .await
        .map_err(|e| e.to_string())?;
    let remotebase = state
        .store
        .remote_base_pointer()
        .await
        .map_err(|e| e.to_string())?;
    if localbase != remotebase {
        return Err(format!(
            "local base {} does not match remote base {}, pull first",
            localbase, remotebase
        ));
    }
    out.push_str("local base matches remote base, push allowed\n");

    state
        .tree
        .flush()
        .await
        .map_err(|e| format!("could not flush: {}", e))?;
    out.push_str("push: flushed\n");

    state
        .tree
        .seal()
        .await
        .map_err(|e| format!("could not seal: {}", e))?;
    out.push_str("push: sealed\n");

    let revision = Revision::new(state.tree.root_pointer(), remotebase);
    let key = state
        .store
        .store_revision(&revision)
        .await
        .map_err(|e| e.to_string())?;
    out.push_str(&format!("push: revision created: {}\n", key.short()));

    // The revision is only reachable once every block is on the remote.
    state.paired.drain().await.map_err(|e| e.to_string())?;
    out.push_str("push: propagation log drained\n");

    state.tree.set_revision(key.clone());
    state
        .store
        .set_remote_base_pointer(&key)
        .await
        .map_err(|e| e.to_string())?;
    out.push_str(&format!("push: updated remote base pointer: {}\n", key));
    state
        .store
        .set_local_base_pointer(&key)
        .await
        .map_err(|e| e.to_string())?;
    out.push_str(&format!("push: updated local base pointer: {}\n", key));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_read_serves_by_offset() {
        let mut ctl = Ctl::new();
        ctl.set_contents("flushed\n".to_string());
        assert_eq!(ctl.read(0, 5), Bytes::from_static(b"flush"));
        assert_eq!(ctl.read(5, 100), Bytes::from_static(b"ed\n"));
        assert_eq!(ctl.read(8, 100), Bytes::from_static(b""));
        assert_eq!(ctl.read(100, 1), Bytes::from_static(b""));
    }

    #[test]
    fn ctl_stat_reports_buffer_length() {
        let mut ctl = Ctl::new();
        ctl.set_contents("0123456789".to_string());
        let stat = ctl.stat("someone");
        assert_eq!(stat.length, 10);
        assert_eq!(stat.name, "ctl");
        assert_eq!(stat.mode, 0o644);
        assert_eq!(stat.qid.typ, QTFILE);
    }
}
