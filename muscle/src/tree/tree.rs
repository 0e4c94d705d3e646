use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument};

use super::node::{
    marshal_body, unmarshal_body, Children, Content, Node, NodeId, NodeInfo, ParsedBody,
    ParsedContent,
};
use super::store::Store;
use super::{Error, DMDIR};
use crate::Pointer;

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > 255
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(Error::BadName(name.to_string()));
    }
    Ok(())
}

fn path_elements(path: &str) -> Vec<&str> {
    path.split('/').filter(|e| !e.is_empty()).collect()
}

/// The mutable working tree (or a read-only historical one), owning its
/// nodes in an arena keyed by [NodeId]. All operations the 9P front-end and
/// the control file need live here.
pub struct Tree {
    store: Arc<Store>,
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
    root: NodeId,
    writable: bool,
    /// Pointer of the revision this tree's ancestry is based on.
    revision: Pointer,
    /// Revision hex → paths to keep local on pull (`keep-local-for`).
    ignored: HashMap<String, HashSet<String>>,
    last_flushed: Option<Instant>,
    snapshot_frequency: Duration,
}

impl Tree {
    /// The working tree: materializes the root from the stored root pointer
    /// (an empty directory for a brand new filesystem).
    pub async fn with_root(store: Arc<Store>, snapshot_frequency: Duration) -> Result<Self, Error> {
        let root_pointer = store.local_root_pointer().await?;
        let revision = store.local_base_pointer().await?;
        let mut tree = Self {
            store,
            nodes: HashMap::new(),
            next_id: 1,
            root: 0,
            writable: true,
            revision,
            ignored: HashMap::new(),
            last_flushed: None,
            snapshot_frequency,
        };
        tree.init_root(root_pointer).await?;
        Ok(tree)
    }

    /// A read-only tree for the given revision, for pull and graft.
    pub async fn with_revision(store: Arc<Store>, revision: &Pointer) -> Result<Self, Error> {
        let rev = store.load_revision(revision).await?;
        let mut tree = Self {
            store,
            nodes: HashMap::new(),
            next_id: 1,
            root: 0,
            writable: false,
            revision: revision.clone(),
            ignored: HashMap::new(),
            last_flushed: None,
            snapshot_frequency: Duration::MAX,
        };
        tree.init_root(rev.root().clone()).await?;
        Ok(tree)
    }

    async fn init_root(&mut self, pointer: Pointer) -> Result<(), Error> {
        let id = self.alloc_id();
        let node = if pointer.is_zero() {
            Node {
                id,
                version: 1,
                name: "root".to_string(),
                mode: DMDIR | 0o777,
                size: 0,
                mtime: unix_now(),
                pointer: Pointer::zero(),
                parent: None,
                content: Content::Dir {
                    children: Children::Loaded(Vec::new()),
                },
                refcount: 0,
                dirty: true,
                unlinked: false,
            }
        } else {
            let body = self.load_body(&pointer).await?;
            self.node_from_body(id, pointer, body, None)
        };
        self.nodes.insert(id, node);
        self.root = id;
        // The root is always loaded and never evicted.
        self.ensure_loaded(id).await?;
        Ok(())
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    async fn load_body(&self, pointer: &Pointer) -> Result<ParsedBody, Error> {
        let bytes = self.store.load_node_body(pointer).await?;
        unmarshal_body(pointer, &bytes)
    }

    fn node_from_body(
        &self,
        id: NodeId,
        pointer: Pointer,
        body: ParsedBody,
        parent: Option<NodeId>,
    ) -> Node {
        let content = match body.content {
            ParsedContent::File(refs) => Content::File {
                blocks: refs
                    .into_iter()
                    .map(|(p, len)| self.store.factory().load(p, len))
                    .collect(),
            },
            ParsedContent::Dir(ptrs) => Content::Dir {
                children: Children::Sparse(ptrs),
            },
        };
        Node {
            id,
            version: 1,
            name: body.name,
            mode: body.mode,
            size: body.size,
            mtime: body.mtime,
            pointer,
            parent,
            content,
            refcount: 0,
            dirty: false,
            unlinked: false,
        }
    }

    /// Hydrates a directory's children from its stored body. Memoized;
    /// re-loading is a no-op, and files are born loaded.
    async fn ensure_loaded(&mut self, id: NodeId) -> Result<(), Error> {
        let ptrs = match self.nodes.get(&id) {
            None => return Err(Error::NotExist),
            Some(n) => match &n.content {
                Content::File { .. } => return Ok(()),
                Content::Dir {
                    children: Children::Loaded(_),
                } => return Ok(()),
                Content::Dir {
                    children: Children::Sparse(ptrs),
                } => ptrs.clone(),
            },
        };
        let mut ids = Vec::with_capacity(ptrs.len());
        for p in ptrs {
            let body = self.load_body(&p).await?;
            let cid = self.alloc_id();
            let child = self.node_from_body(cid, p, body, Some(id));
            self.nodes.insert(cid, child);
            ids.push(cid);
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.content = Content::Dir {
                children: Children::Loaded(ids),
            };
        }
        Ok(())
    }

    fn lookup_child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes.get(&dir)?.content {
            Content::Dir {
                children: Children::Loaded(ids),
            } => ids
                .iter()
                .copied()
                .find(|c| self.nodes.get(c).map(|n| n.name == name).unwrap_or(false)),
            _ => None,
        }
    }

    /// Bumps the node's version and marks it and its chain of ancestors
    /// dirty: directory bodies embed child pointers, so a re-sealed child
    /// changes every directory up to the root.
    fn modified(&mut self, id: NodeId) {
        let mut cur = Some(id);
        let mut direct = true;
        while let Some(i) = cur {
            let Some(n) = self.nodes.get_mut(&i) else { break };
            if !direct && n.dirty {
                break;
            }
            n.version = n.version.wrapping_add(1);
            n.dirty = true;
            direct = false;
            cur = n.parent;
        }
    }

    // ------------------------------------------------------------------
    // Accessors for the front-end.

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn root_pointer(&self) -> Pointer {
        self.nodes[&self.root].pointer.clone()
    }

    pub fn revision(&self) -> &Pointer {
        &self.revision
    }

    pub fn set_revision(&mut self, revision: Pointer) {
        self.revision = revision;
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        id == self.root
    }

    pub fn is_unlinked(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|n| n.unlinked).unwrap_or(true)
    }

    pub fn info(&self, id: NodeId) -> Result<NodeInfo, Error> {
        self.nodes.get(&id).map(Node::info).ok_or(Error::NotExist)
    }

    pub fn node_pointer(&self, id: NodeId) -> Result<Pointer, Error> {
        self.nodes
            .get(&id)
            .map(|n| n.pointer.clone())
            .ok_or(Error::NotExist)
    }

    /// Attribute views of a directory's children, for dir reads. Hydrates.
    pub async fn children_info(&mut self, id: NodeId) -> Result<Vec<NodeInfo>, Error> {
        if !self.nodes.get(&id).ok_or(Error::NotExist)?.is_dir() {
            return Err(Error::NotADir);
        }
        self.ensure_loaded(id).await?;
        match &self.nodes[&id].content {
            Content::Dir {
                children: Children::Loaded(ids),
            } => Ok(ids.iter().map(|c| self.nodes[c].info()).collect()),
            _ => unreachable!("loaded above"),
        }
    }

    /// The qualified name of a node, for diagnostics and lsof.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(i) = cur {
            if i == self.root {
                break;
            }
            let Some(n) = self.nodes.get(&i) else { break };
            parts.push(n.name.clone());
            cur = n.parent;
        }
        if parts.is_empty() {
            "/".to_string()
        } else {
            parts.reverse();
            format!("/{}", parts.join("/"))
        }
    }

    // ------------------------------------------------------------------
    // Reference counting: one count per live fid plus internal pins.

    pub fn attach(&mut self) -> NodeId {
        self.ref_node(self.root, "attach");
        self.root
    }

    pub fn ref_node(&mut self, id: NodeId, reason: &str) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.refcount += 1;
            debug!(node = id, refcount = n.refcount, reason, "ref");
        }
    }

    pub fn unref_node(&mut self, id: NodeId, reason: &str) {
        let drop_now = match self.nodes.get_mut(&id) {
            None => false,
            Some(n) => {
                n.refcount = n.refcount.saturating_sub(1);
                debug!(node = id, refcount = n.refcount, reason, "unref");
                n.refcount == 0 && n.unlinked
            }
        };
        if drop_now {
            self.nodes.remove(&id);
        }
    }

    /// Qualified names of nodes with live references, sorted.
    pub fn list_nodes_in_use(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.refcount > 0)
            .map(|n| self.path_of(n.id))
            .collect();
        paths.sort();
        paths
    }

    /// A human-readable dump of the arena, for the `dump` command.
    pub fn dump_nodes(&self) -> String {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        let mut out = String::new();
        for id in ids {
            let n = &self.nodes[&id];
            out.push_str(&format!(
                "{} {} mode={:o} size={} ver={} ref={} ptr={}{}{}{}\n",
                id,
                self.path_of(id),
                n.mode,
                n.size,
                n.version,
                n.refcount,
                if n.pointer.is_zero() {
                    "-".to_string()
                } else {
                    n.pointer.short()
                },
                if n.dirty { " dirty" } else { "" },
                if n.is_loaded() { " loaded" } else { "" },
                if n.unlinked { " unlinked" } else { "" },
            ));
        }
        out
    }

    // ------------------------------------------------------------------
    // Navigation and structure.

    /// Walks `names` starting at `base`, loading directories on demand, and
    /// returns the resolved prefix. A fully unresolvable first element is
    /// [Error::NotExist]; a proper prefix is returned without error, as 9P
    /// wants it.
    pub async fn walk(&mut self, base: NodeId, names: &[&str]) -> Result<Vec<NodeId>, Error> {
        let mut walked = Vec::with_capacity(names.len());
        let mut at = base;
        for (i, name) in names.iter().enumerate() {
            let next = if *name == ".." {
                match self.nodes.get(&at) {
                    // The root is its own parent.
                    Some(n) => n.parent.unwrap_or(at),
                    None => break,
                }
            } else {
                let Some(n) = self.nodes.get(&at) else { break };
                if !n.is_dir() {
                    if i == 0 {
                        return Err(Error::NotExist);
                    }
                    break;
                }
                self.ensure_loaded(at).await?;
                match self.lookup_child(at, name) {
                    Some(c) => c,
                    None if i == 0 => return Err(Error::NotExist),
                    None => break,
                }
            };
            walked.push(next);
            at = next;
        }
        Ok(walked)
    }

    /// Walks a `/`-separated path from the root, requiring every element to
    /// resolve.
    pub async fn walk_path(&mut self, path: &str) -> Result<NodeId, Error> {
        let elems = path_elements(path);
        let walked = self.walk(self.root, &elems).await?;
        if walked.len() != elems.len() {
            return Err(Error::NotExist);
        }
        Ok(walked.last().copied().unwrap_or(self.root))
    }

    /// Forces full hydration of a directory.
    pub async fn grow(&mut self, id: NodeId) -> Result<(), Error> {
        if !self.nodes.get(&id).ok_or(Error::NotExist)?.is_dir() {
            return Err(Error::NotADir);
        }
        self.ensure_loaded(id).await
    }

    /// Creates a fresh node under `parent`.
    #[instrument(skip(self))]
    pub async fn add(&mut self, parent: NodeId, name: &str, mode: u32) -> Result<NodeId, Error> {
        self.check_writable()?;
        validate_name(name)?;
        {
            let p = self.nodes.get(&parent).ok_or(Error::NotExist)?;
            if p.unlinked {
                return Err(Error::Unlinked);
            }
            if !p.is_dir() {
                return Err(Error::NotADir);
            }
        }
        self.ensure_loaded(parent).await?;
        if self.lookup_child(parent, name).is_some() {
            return Err(Error::Exists);
        }
        let id = self.alloc_id();
        let node = Node {
            id,
            version: 1,
            name: name.to_string(),
            mode,
            size: 0,
            mtime: unix_now(),
            pointer: Pointer::zero(),
            parent: Some(parent),
            content: if mode & DMDIR != 0 {
                Content::Dir {
                    children: Children::Loaded(Vec::new()),
                }
            } else {
                Content::File { blocks: Vec::new() }
            },
            refcount: 0,
            dirty: true,
            unlinked: false,
        };
        self.nodes.insert(id, node);
        if let Some(p) = self.nodes.get_mut(&parent) {
            if let Content::Dir {
                children: Children::Loaded(ids),
            } = &mut p.content
            {
                ids.push(id);
            }
            p.mtime = unix_now();
        }
        self.modified(parent);
        Ok(id)
    }

    /// Unlinks a node; directories must be empty.
    pub async fn remove(&mut self, id: NodeId) -> Result<(), Error> {
        self.remove_impl(id, true).await
    }

    /// Unlinks a whole subtree, for replaying merge worklogs.
    pub async fn remove_for_merge(&mut self, id: NodeId) -> Result<(), Error> {
        self.remove_impl(id, false).await
    }

    async fn remove_impl(&mut self, id: NodeId, check_empty: bool) -> Result<(), Error> {
        self.check_writable()?;
        let (parent, is_dir, unlinked) = {
            let n = self.nodes.get(&id).ok_or(Error::NotExist)?;
            (n.parent, n.is_dir(), n.unlinked)
        };
        if unlinked {
            return Err(Error::Unlinked);
        }
        let Some(parent) = parent else {
            // The root itself.
            return Err(Error::PermissionDenied);
        };
        if is_dir && check_empty {
            self.ensure_loaded(id).await?;
            if let Content::Dir {
                children: Children::Loaded(ids),
            } = &self.nodes[&id].content
            {
                if !ids.is_empty() {
                    return Err(Error::NotEmpty);
                }
            }
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            if let Content::Dir {
                children: Children::Loaded(ids),
            } = &mut p.content
            {
                ids.retain(|c| *c != id);
            }
            p.mtime = unix_now();
        }
        self.modified(parent);
        self.unlink_subtree(id);
        Ok(())
    }

    /// Marks a detached subtree unlinked; entries nobody references are
    /// dropped from the arena now, the rest when their last fid goes.
    fn unlink_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        let mut drop_now = Vec::new();
        while let Some(i) = stack.pop() {
            if let Some(n) = self.nodes.get_mut(&i) {
                n.unlinked = true;
                n.version = n.version.wrapping_add(1);
                if let Content::Dir {
                    children: Children::Loaded(ids),
                } = &n.content
                {
                    stack.extend(ids.iter().copied());
                }
                if n.refcount == 0 {
                    drop_now.push(i);
                }
            }
        }
        for i in drop_now {
            self.nodes.remove(&i);
        }
    }

    /// Whole-path rename, for the control file. The destination must not
    /// exist; its parent must.
    pub async fn rename(&mut self, oldpath: &str, newpath: &str) -> Result<(), Error> {
        self.check_writable()?;
        let old = path_elements(oldpath);
        let new = path_elements(newpath);
        if old.is_empty() || new.is_empty() {
            return Err(Error::BadName(format!("{} -> {}", oldpath, newpath)));
        }
        let walked = self.walk(self.root, &old).await?;
        if walked.len() != old.len() {
            return Err(Error::NotExist);
        }
        let node = *walked.last().expect("nonempty");
        let (new_name, new_parent_path) = new.split_last().expect("nonempty");
        validate_name(new_name)?;
        let parent_walk = self.walk(self.root, new_parent_path).await?;
        if parent_walk.len() != new_parent_path.len() {
            return Err(Error::NotExist);
        }
        let new_parent = parent_walk.last().copied().unwrap_or(self.root);
        if !self.nodes.get(&new_parent).ok_or(Error::NotExist)?.is_dir() {
            return Err(Error::NotADir);
        }
        self.ensure_loaded(new_parent).await?;
        if let Some(existing) = self.lookup_child(new_parent, new_name) {
            if existing != node {
                return Err(Error::Exists);
            }
        }
        // Moving a directory under itself would orphan the subtree.
        let mut cur = Some(new_parent);
        while let Some(i) = cur {
            if i == node {
                return Err(Error::PermissionDenied);
            }
            cur = self.nodes.get(&i).and_then(|n| n.parent);
        }
        let old_parent = self.nodes[&node].parent.expect("walked nodes have parents");
        if let Some(p) = self.nodes.get_mut(&old_parent) {
            if let Content::Dir {
                children: Children::Loaded(ids),
            } = &mut p.content
            {
                ids.retain(|c| *c != node);
            }
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            n.name = new_name.to_string();
            n.parent = Some(new_parent);
        }
        if let Some(p) = self.nodes.get_mut(&new_parent) {
            if let Content::Dir {
                children: Children::Loaded(ids),
            } = &mut p.content
            {
                ids.push(node);
            }
        }
        self.modified(node);
        self.modified(old_parent);
        self.modified(new_parent);
        Ok(())
    }

    /// Renames a node within its parent (the wstat flavor).
    pub fn set_name(&mut self, id: NodeId, name: &str) -> Result<(), Error> {
        self.check_writable()?;
        validate_name(name)?;
        let (parent, unlinked) = {
            let n = self.nodes.get(&id).ok_or(Error::NotExist)?;
            (n.parent, n.unlinked)
        };
        if unlinked {
            return Err(Error::Unlinked);
        }
        if let Some(parent) = parent {
            if let Some(existing) = self.lookup_child(parent, name) {
                if existing != id {
                    return Err(Error::Exists);
                }
            }
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.name = name.to_string();
        }
        self.modified(id);
        Ok(())
    }

    pub fn touch(&mut self, id: NodeId, mtime: u32) -> Result<(), Error> {
        self.check_writable()?;
        let n = self.nodes.get_mut(&id).ok_or(Error::NotExist)?;
        if n.unlinked {
            return Err(Error::Unlinked);
        }
        n.mtime = mtime;
        self.modified(id);
        Ok(())
    }

    /// Replaces the permission bits, leaving the directory bit alone.
    pub fn set_perm(&mut self, id: NodeId, perm: u32) -> Result<(), Error> {
        self.check_writable()?;
        let n = self.nodes.get_mut(&id).ok_or(Error::NotExist)?;
        if n.unlinked {
            return Err(Error::Unlinked);
        }
        n.mode = (n.mode & DMDIR) | (perm & 0o777);
        self.modified(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // File content.

    pub async fn read_at(&mut self, id: NodeId, buf: &mut [u8], off: u64) -> Result<usize, Error> {
        let bs = self.store.factory().block_size();
        let node = self.nodes.get_mut(&id).ok_or(Error::NotExist)?;
        if node.unlinked {
            return Err(Error::Unlinked);
        }
        let Content::File { blocks } = &mut node.content else {
            return Err(Error::PermissionDenied);
        };
        let mut read = 0;
        while read < buf.len() {
            let pos = off as usize + read;
            let idx = pos / bs;
            if idx >= blocks.len() {
                break;
            }
            let n = blocks[idx].read_at(&mut buf[read..], pos % bs).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    pub async fn write_at(&mut self, id: NodeId, data: &[u8], off: u64) -> Result<(), Error> {
        self.check_writable()?;
        let size = {
            let n = self.nodes.get(&id).ok_or(Error::NotExist)?;
            if n.unlinked {
                return Err(Error::Unlinked);
            }
            if n.is_dir() {
                return Err(Error::PermissionDenied);
            }
            n.size
        };
        if off > size {
            self.zero_fill(id, size, off).await?;
        }
        self.write_span(id, data, off).await?;
        let n = self.nodes.get_mut(&id).expect("checked above");
        n.size = n.size.max(off + data.len() as u64);
        n.mtime = unix_now();
        self.modified(id);
        Ok(())
    }

    /// Writes a contiguous span, thawing sealed blocks it touches and
    /// appending staging blocks as needed. Assumes no gap before `off`.
    async fn write_span(&mut self, id: NodeId, data: &[u8], off: u64) -> Result<(), Error> {
        let factory = self.store.factory().clone();
        let bs = factory.block_size();
        let node = self.nodes.get_mut(&id).ok_or(Error::NotExist)?;
        let Content::File { blocks } = &mut node.content else {
            return Err(Error::PermissionDenied);
        };
        let mut written = 0;
        while written < data.len() {
            let pos = off as usize + written;
            let idx = pos / bs;
            while blocks.len() <= idx {
                blocks.push(factory.new_block());
            }
            let block = &mut blocks[idx];
            if block.is_sealed() {
                block.thaw().await?;
            }
            written += block.write_at(&data[written..], pos % bs).await?;
        }
        Ok(())
    }

    async fn zero_fill(&mut self, id: NodeId, from: u64, to: u64) -> Result<(), Error> {
        const CHUNK: u64 = 256 * 1024;
        let mut pos = from;
        while pos < to {
            let n = (to - pos).min(CHUNK) as usize;
            self.write_span(id, &vec![0u8; n], pos).await?;
            pos += n as u64;
        }
        Ok(())
    }

    pub async fn truncate(&mut self, id: NodeId, len: u64) -> Result<(), Error> {
        self.check_writable()?;
        let (size, is_dir, unlinked) = {
            let n = self.nodes.get(&id).ok_or(Error::NotExist)?;
            (n.size, n.is_dir(), n.unlinked)
        };
        if unlinked {
            return Err(Error::Unlinked);
        }
        if is_dir {
            return Err(Error::PermissionDenied);
        }
        let bs = self.store.factory().block_size() as u64;
        if len > size {
            self.zero_fill(id, size, len).await?;
        } else if len < size {
            let keep = (len.div_ceil(bs)) as usize;
            let node = self.nodes.get_mut(&id).expect("checked above");
            let Content::File { blocks } = &mut node.content else {
                return Err(Error::PermissionDenied);
            };
            blocks.truncate(keep);
            let boundary = (len % bs) as usize;
            if boundary != 0 {
                if let Some(last) = blocks.last_mut() {
                    if last.is_sealed() {
                        last.thaw().await?;
                    }
                    last.truncate(boundary).await?;
                }
            }
        }
        let n = self.nodes.get_mut(&id).expect("checked above");
        n.size = len;
        n.mtime = unix_now();
        self.modified(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence.

    /// Serializes all dirty state into the store, post-order, then records
    /// the new root pointer and clears dirty flags.
    #[instrument(skip(self))]
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.flush_inner(true).await?;
        self.last_flushed = Some(Instant::now());
        Ok(())
    }

    /// The flush pass without clearing dirty flags: guarantees every block
    /// reachable from the root is resident in the paired store, prior to
    /// push.
    pub async fn seal(&mut self) -> Result<(), Error> {
        self.flush_inner(false).await
    }

    /// Rate-limited flush for the background snapshot timer.
    pub async fn flush_if_not_done_recently(&mut self) -> Result<(), Error> {
        if let Some(t) = self.last_flushed {
            if t.elapsed() < self.snapshot_frequency {
                return Ok(());
            }
        }
        self.flush().await
    }

    async fn flush_inner(&mut self, clear: bool) -> Result<(), Error> {
        let order = self.dirty_postorder();
        if order.is_empty() {
            return Ok(());
        }
        debug!(nodes = order.len(), "flushing dirty nodes");
        for id in order {
            {
                let node = self.nodes.get_mut(&id).ok_or(Error::NotExist)?;
                if let Content::File { blocks } = &mut node.content {
                    for b in blocks.iter_mut() {
                        b.seal().await?;
                    }
                }
            }
            let bytes = {
                let node = self.nodes.get(&id).ok_or(Error::NotExist)?;
                let content = match &node.content {
                    Content::File { blocks } => ParsedContent::File(
                        blocks
                            .iter()
                            .map(|b| (b.pointer().expect("sealed above").clone(), b.len() as u32))
                            .collect(),
                    ),
                    Content::Dir { children } => ParsedContent::Dir(match children {
                        Children::Sparse(ptrs) => ptrs.clone(),
                        Children::Loaded(ids) => {
                            let mut named: Vec<(&str, Pointer)> = ids
                                .iter()
                                .map(|c| {
                                    let child = &self.nodes[c];
                                    (child.name.as_str(), child.pointer.clone())
                                })
                                .collect();
                            // Name order keeps serialization deterministic.
                            named.sort_by(|a, b| a.0.cmp(b.0));
                            named.into_iter().map(|(_, p)| p).collect()
                        }
                    }),
                };
                marshal_body(&node.name, node.mode, node.size, node.mtime, &content)?
            };
            let pointer = self.store.store_node_body(&bytes).await?;
            let node = self.nodes.get_mut(&id).ok_or(Error::NotExist)?;
            node.pointer = pointer;
            if clear {
                node.dirty = false;
            }
        }
        let root_pointer = self.nodes[&self.root].pointer.clone();
        self.store.set_local_root_pointer(&root_pointer).await?;
        Ok(())
    }

    /// Dirty nodes, children before parents. Clean subtrees are pruned: a
    /// dirty descendant implies a dirty ancestor.
    fn dirty_postorder(&self) -> Vec<NodeId> {
        fn rec(tree: &Tree, id: NodeId, out: &mut Vec<NodeId>) {
            let Some(node) = tree.nodes.get(&id) else { return };
            if !node.dirty {
                return;
            }
            if let Content::Dir {
                children: Children::Loaded(ids),
            } = &node.content
            {
                for c in ids {
                    rec(tree, *c, out);
                }
            }
            out.push(id);
        }
        let mut out = Vec::new();
        rec(self, self.root, &mut out);
        out
    }

    // ------------------------------------------------------------------
    // History.

    /// Grafts the subtree stored at `donor` (a node body pointer from a
    /// historical tree) under `parent` as `name`. The clone gets a new
    /// identity but shares the stored body, so the operation is cheap no
    /// matter the subtree size.
    #[instrument(skip(self), fields(donor = %donor))]
    pub async fn graft(
        &mut self,
        parent: NodeId,
        donor: &Pointer,
        name: &str,
    ) -> Result<NodeId, Error> {
        self.check_writable()?;
        validate_name(name)?;
        if donor.is_zero() {
            return Err(Error::NotExist);
        }
        if !self.nodes.get(&parent).ok_or(Error::NotExist)?.is_dir() {
            return Err(Error::NotADir);
        }
        self.ensure_loaded(parent).await?;
        if self.lookup_child(parent, name).is_some() {
            return Err(Error::Exists);
        }
        let body = self.load_body(donor).await?;
        let id = self.alloc_id();
        let mut node = self.node_from_body(id, donor.clone(), body, Some(parent));
        if node.name != name {
            // The stored body embeds the donor name; re-serialize at the
            // next flush or a cold reload would resurrect it.
            node.name = name.to_string();
            node.dirty = true;
        }
        self.nodes.insert(id, node);
        if let Some(p) = self.nodes.get_mut(&parent) {
            if let Content::Dir {
                children: Children::Loaded(ids),
            } = &mut p.content
            {
                ids.push(id);
            }
            p.mtime = unix_now();
        }
        self.modified(parent);
        Ok(id)
    }

    /// Records a path to keep local when pulling against the given revision.
    pub fn ignore(&mut self, revision: &str, path: &str) {
        self.ignored
            .entry(revision.to_string())
            .or_default()
            .insert(path.trim_matches('/').to_string());
    }

    pub fn is_ignored(&self, revision: &str, path: &str) -> bool {
        self.ignored
            .get(revision)
            .map(|paths| paths.contains(path.trim_matches('/')))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Memory pressure.

    /// Evicts cached block plaintext and collapses clean, unreferenced,
    /// fully-flushed subtrees back to their sparse form. The root stays.
    pub fn trim(&mut self) {
        self.trim_node(self.root);
    }

    fn trim_node(&mut self, id: NodeId) -> bool {
        enum Kind {
            Leaf,
            Loaded(Vec<NodeId>),
        }
        let (pinned, kind) = match self.nodes.get_mut(&id) {
            None => return true,
            Some(node) => {
                let pinned = node.dirty || node.refcount > 0 || node.pointer.is_zero();
                let kind = match &mut node.content {
                    Content::File { blocks } => {
                        for b in blocks.iter_mut() {
                            b.evict_plaintext();
                        }
                        Kind::Leaf
                    }
                    Content::Dir {
                        children: Children::Sparse(_),
                    } => Kind::Leaf,
                    Content::Dir {
                        children: Children::Loaded(ids),
                    } => Kind::Loaded(ids.clone()),
                };
                (pinned, kind)
            }
        };
        match kind {
            Kind::Leaf => !pinned,
            Kind::Loaded(ids) => {
                let mut all = true;
                for c in &ids {
                    all &= self.trim_node(*c);
                }
                if all && id != self.root {
                    // Children are collapsible wholesale; name order matches
                    // the serialized body.
                    let mut named: Vec<(String, Pointer)> = ids
                        .iter()
                        .map(|c| {
                            let n = &self.nodes[c];
                            (n.name.clone(), n.pointer.clone())
                        })
                        .collect();
                    named.sort_by(|a, b| a.0.cmp(&b.0));
                    for c in &ids {
                        self.nodes.remove(c);
                    }
                    let node = self.nodes.get_mut(&id).expect("present above");
                    node.content = Content::Dir {
                        children: Children::Sparse(named.into_iter().map(|(_, p)| p).collect()),
                    };
                    !pinned
                } else {
                    false
                }
            }
        }
    }
}
