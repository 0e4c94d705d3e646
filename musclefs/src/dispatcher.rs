//! The 9P request dispatcher: one worker per connection, every request
//! serialized through a single tree mutex. Fids wrap tree nodes (with a
//! reference count) or the synthetic control file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::BytesMut;
use muscle::storage::PairedStore;
use muscle::tree::{
    self, NodeId, NodeInfo, Store as TreeStore, Tree, DMAPPEND, DMAUTH, DMDEVICE, DMDIR, DMEXCL,
    DMLINK, DMMOUNT, DMNAMEDPIPE, DMSETGID, DMSETUID, DMSOCKET, DMSYMLINK, DMTMP,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

use crate::ctl::{self, Ctl};
use crate::wire::{
    self, Qid, Rmessage, Stat, Tmessage, IOHDRSZ, MAX_MSIZE, ORCLOSE, OTRUNC, QTDIR, QTEXCL,
    QTFILE,
};

const EPERM: &str = "permission denied";
const ENOENT: &str = "file not found";
const ENOTEMPTY: &str = "directory not empty";
const EUNLINKED: &str = "fid points to unlinked node";
const ENOAUTH: &str = "authentication not required";
const EBADFID: &str = "unknown fid";
const EINUSE: &str = "fid already in use";
const ELOCKED: &str = "file already locked";

/// Runtime control of the log filter, wired up by main; the ctl `level`
/// command goes through it.
pub type LevelHandle = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Everything behind the tree lock.
pub struct State {
    pub tree: Tree,
    pub store: Arc<TreeStore>,
    pub paired: Arc<PairedStore>,
    pub ctl: Ctl,
    pub level: Option<LevelHandle>,
}

struct LockOwner {
    #[allow(dead_code)]
    conn: u64,
    #[allow(dead_code)]
    fid: u32,
}

pub struct Server {
    /// The tree lock: every request holds it for its full duration.
    state: tokio::sync::Mutex<State>,
    /// Exclusive-use lock table, qid path → owning fid.
    locks: StdMutex<HashMap<u64, LockOwner>>,
    /// The DMEXCL bit per qid path; it is not persisted with the node body.
    more_mode: StdMutex<HashMap<u64, u32>>,
    next_conn: AtomicU64,
}

#[derive(Clone, Copy)]
enum FidTarget {
    Ctl,
    Node(NodeId),
}

struct Fid {
    target: FidTarget,
    dirb: Option<DirBuffer>,
    locked: bool,
}

impl Fid {
    fn ctl() -> Self {
        Fid {
            target: FidTarget::Ctl,
            dirb: None,
            locked: false,
        }
    }

    fn node(id: NodeId) -> Self {
        Fid {
            target: FidTarget::Node(id),
            dirb: None,
            locked: false,
        }
    }
}

struct ConnState {
    id: u64,
    msize: u32,
    fids: HashMap<u32, Fid>,
}

/// Serialized child stats, computed at open time so directory reads stay
/// stable for the lifetime of the open fid. Reads consume whole entries.
struct DirBuffer {
    data: Vec<u8>,
    bounds: Vec<usize>,
}

impl DirBuffer {
    fn new(stats: &[Stat]) -> Self {
        let mut data = BytesMut::new();
        let mut bounds = vec![0];
        for stat in stats {
            stat.encode(&mut data);
            bounds.push(data.len());
        }
        Self {
            data: data.to_vec(),
            bounds,
        }
    }

    fn empty() -> Self {
        Self {
            data: Vec::new(),
            bounds: vec![0],
        }
    }

    fn read(&self, offset: u64, count: u32) -> Result<&[u8], &'static str> {
        let offset = offset as usize;
        if offset == self.data.len() {
            return Ok(&[]);
        }
        if !self.bounds.contains(&offset) {
            return Err("bad offset in directory read");
        }
        let limit = offset + count as usize;
        let end = self
            .bounds
            .iter()
            .copied()
            .filter(|b| *b > offset && *b <= limit)
            .max()
            .unwrap_or(offset);
        Ok(&self.data[offset..end])
    }
}

pub(crate) fn owner() -> String {
    std::env::var("USER").unwrap_or_else(|_| "muscle".to_string())
}

fn node_qid(info: &NodeInfo) -> Qid {
    Qid {
        typ: if info.is_dir() { QTDIR } else { QTFILE },
        version: info.version,
        path: info.id,
    }
}

fn node_stat(info: &NodeInfo, uid: &str) -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid: node_qid(info),
        mode: info.mode,
        atime: info.mtime,
        mtime: info.mtime,
        length: if info.is_dir() { 0 } else { info.size },
        name: info.name.clone(),
        uid: uid.to_string(),
        gid: uid.to_string(),
        muid: String::new(),
    }
}

const UNSUPPORTED_MODES: &[(u32, &str)] = &[
    (DMAPPEND, "append-only files are not supported"),
    (DMMOUNT, "mounted channels are not supported"),
    (DMAUTH, "authentication files are not supported"),
    (DMTMP, "temporary files are not supported"),
    (DMSYMLINK, "symbolic links are not supported"),
    (DMLINK, "hard links are not supported"),
    (DMDEVICE, "device files are not supported"),
    (DMNAMEDPIPE, "named pipes are not supported"),
    (DMSOCKET, "sockets are not supported"),
    (DMSETUID, "setuid files are not supported"),
    (DMSETGID, "setgid files are not supported"),
];

/// Polices mode bits on create and wstat: unsupported bits each have their
/// own refusal, unknown bits are rejected wholesale, and a node never
/// changes between directory and regular file.
fn check_mode(existing_is_dir: Option<bool>, mode: u32) -> Result<(), String> {
    if let Some(is_dir) = existing_is_dir {
        if is_dir && mode & DMDIR == 0 {
            return Err("a directory cannot become a regular file".to_string());
        }
        if !is_dir && mode & DMDIR != 0 {
            return Err("a regular file cannot become a directory".to_string());
        }
    }
    for (bit, msg) in UNSUPPORTED_MODES {
        if mode & bit != 0 {
            return Err((*msg).to_string());
        }
    }
    let mut known = 0o777 | DMDIR | DMEXCL;
    for (bit, _) in UNSUPPORTED_MODES {
        known |= bit;
    }
    let extra = mode & !known;
    if extra != 0 {
        return Err(format!("unrecognized mode bits: {:b}", extra));
    }
    Ok(())
}

fn tree_error(e: &tree::Error) -> Rmessage {
    let ename = match e {
        tree::Error::NotExist => ENOENT.to_string(),
        tree::Error::Exists => "file already exists".to_string(),
        tree::Error::NotEmpty => ENOTEMPTY.to_string(),
        tree::Error::NotADir => "not a directory".to_string(),
        tree::Error::Unlinked => EUNLINKED.to_string(),
        tree::Error::PermissionDenied => EPERM.to_string(),
        tree::Error::BadName(name) => format!("invalid name {:?}", name),
        other => {
            error!("tree operation failed: {}", other);
            EPERM.to_string()
        }
    };
    Rmessage::Error { ename }
}

fn err(ename: &str) -> Rmessage {
    Rmessage::Error {
        ename: ename.to_string(),
    }
}

impl Server {
    pub async fn new(
        mut tree: Tree,
        store: Arc<TreeStore>,
        paired: Arc<PairedStore>,
        level: Option<LevelHandle>,
    ) -> Arc<Self> {
        // Best-effort clean-up, for when the control file used to be part
        // of the tree.
        let root = tree.root_id();
        if let Ok(nodes) = tree.walk(root, &["ctl"]).await {
            if let Some(stale) = nodes.first() {
                let _ = tree.remove(*stale).await;
            }
        }
        Arc::new(Self {
            state: tokio::sync::Mutex::new(State {
                tree,
                store,
                paired,
                ctl: Ctl::new(),
                level,
            }),
            locks: StdMutex::new(HashMap::new()),
            more_mode: StdMutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        })
    }

    /// For the snapshot timer and the shutdown path.
    pub async fn flush_tree(&self, only_if_stale: bool) -> Result<(), tree::Error> {
        let mut state = self.state.lock().await;
        if only_if_stale {
            state.tree.flush_if_not_done_recently().await
        } else {
            state.tree.flush().await
        }
    }

    fn lock_node(&self, path: u64, conn: u64, fid: u32) -> bool {
        let mut locks = self.locks.lock().expect("lock table");
        if locks.contains_key(&path) {
            return false;
        }
        locks.insert(path, LockOwner { conn, fid });
        true
    }

    fn unlock_node(&self, path: u64) {
        self.locks.lock().expect("lock table").remove(&path);
    }

    fn more_mode(&self, path: u64) -> u32 {
        self.more_mode
            .lock()
            .expect("more-mode table")
            .get(&path)
            .copied()
            .unwrap_or(0)
    }

    fn set_more_mode(&self, path: u64, bits: u32) {
        let mut table = self.more_mode.lock().expect("more-mode table");
        if bits == 0 {
            table.remove(&path);
        } else {
            table.insert(path, bits);
        }
    }

    /// Runs one connection to completion. Requests are handled strictly in
    /// order; fids are destroyed when the connection goes away.
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut conn = ConnState {
            id: self.next_conn.fetch_add(1, Ordering::SeqCst),
            msize: MAX_MSIZE,
            fids: HashMap::new(),
        };
        debug!(conn = conn.id, "connection open");
        loop {
            match wire::read_request(&mut reader).await {
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = conn.id, "bad request: {}", e);
                    break;
                }
                Ok(Some((tag, msg))) => {
                    let resp = self.handle(&mut conn, msg).await;
                    if let Err(e) = wire::write_response(&mut writer, tag, &resp).await {
                        warn!(conn = conn.id, "write failed: {}", e);
                        break;
                    }
                }
            }
        }
        self.destroy_fids(&mut conn).await;
        debug!(conn = conn.id, "connection closed");
    }

    async fn destroy_fids(&self, conn: &mut ConnState) {
        let fids: Vec<Fid> = conn.fids.drain().map(|(_, f)| f).collect();
        if fids.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for fid in fids {
            self.release_fid(&mut state, fid);
        }
    }

    fn release_fid(&self, state: &mut State, fid: Fid) {
        if let FidTarget::Node(node) = fid.target {
            if fid.locked {
                if let Ok(info) = state.tree.info(node) {
                    self.unlock_node(info.id);
                }
            }
            state.tree.unref_node(node, "fid destroy");
        }
    }

    async fn handle(&self, conn: &mut ConnState, msg: Tmessage) -> Rmessage {
        match msg {
            Tmessage::Version { msize, version } => self.version(conn, msize, &version).await,
            Tmessage::Auth { .. } => err(ENOAUTH),
            Tmessage::Attach { fid, .. } => self.attach(conn, fid).await,
            Tmessage::Flush { .. } => Rmessage::Flush,
            Tmessage::Walk { fid, newfid, names } => self.walk(conn, fid, newfid, names).await,
            Tmessage::Open { fid, mode } => self.open(conn, fid, mode).await,
            Tmessage::Create {
                fid,
                name,
                perm,
                mode,
            } => self.create(conn, fid, &name, perm, mode).await,
            Tmessage::Read { fid, offset, count } => self.read(conn, fid, offset, count).await,
            Tmessage::Write { fid, offset, data } => self.write(conn, fid, offset, &data).await,
            Tmessage::Clunk { fid } => self.clunk(conn, fid).await,
            Tmessage::Remove { fid } => self.remove(conn, fid).await,
            Tmessage::Stat { fid } => self.stat(conn, fid).await,
            Tmessage::Wstat { fid, stat } => self.wstat(conn, fid, stat).await,
        }
    }

    async fn version(&self, conn: &mut ConnState, msize: u32, version: &str) -> Rmessage {
        // A version request resets the session.
        self.destroy_fids(conn).await;
        conn.msize = msize.clamp(IOHDRSZ + 1, MAX_MSIZE);
        let version = if version.starts_with("9P2000") {
            "9P2000"
        } else {
            "unknown"
        };
        Rmessage::Version {
            msize: conn.msize,
            version: version.to_string(),
        }
    }

    async fn attach(&self, conn: &mut ConnState, fid: u32) -> Rmessage {
        if conn.fids.contains_key(&fid) {
            return err(EINUSE);
        }
        let mut state = self.state.lock().await;
        let root = state.tree.attach();
        let info = match state.tree.info(root) {
            Ok(info) => info,
            Err(e) => return tree_error(&e),
        };
        conn.fids.insert(fid, Fid::node(root));
        Rmessage::Attach {
            qid: node_qid(&info),
        }
    }

    async fn walk(
        &self,
        conn: &mut ConnState,
        fid: u32,
        newfid: u32,
        names: Vec<String>,
    ) -> Rmessage {
        let mut state = self.state.lock().await;
        let Some(entry) = conn.fids.get(&fid) else {
            return err(EBADFID);
        };
        if newfid != fid && conn.fids.contains_key(&newfid) {
            return err(EINUSE);
        }
        match entry.target {
            FidTarget::Ctl => {
                if names.is_empty() {
                    conn.fids.insert(newfid, Fid::ctl());
                    Rmessage::Walk { qids: Vec::new() }
                } else {
                    err(EPERM)
                }
            }
            FidTarget::Node(node) => {
                if state.tree.is_unlinked(node) {
                    return err(EUNLINKED);
                }
                if names.is_empty() {
                    state.tree.ref_node(node, "clone");
                    // With newfid == fid the walk rebinds the fid to the
                    // node it already wraps; its open state (dir buffer,
                    // exclusive lock) stays. Only FidDestroy releases those.
                    if newfid != fid {
                        conn.fids.insert(newfid, Fid::node(node));
                    }
                    return Rmessage::Walk { qids: Vec::new() };
                }
                if state.tree.is_root(node) && names.len() == 1 && names[0] == "ctl" {
                    let qid = state.ctl.qid();
                    if let Some(old) = conn.fids.remove(&newfid) {
                        self.release_fid(&mut state, old);
                    }
                    conn.fids.insert(newfid, Fid::ctl());
                    return Rmessage::Walk { qids: vec![qid] };
                }
                let elems: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
                match state.tree.walk(node, &elems).await {
                    Err(tree::Error::NotExist) => err(ENOENT),
                    Err(e) => {
                        error!(path = %state.tree.path_of(node), "could not walk: {}", e);
                        err(EPERM)
                    }
                    Ok(nodes) => {
                        let mut qids = Vec::with_capacity(nodes.len());
                        for n in &nodes {
                            match state.tree.info(*n) {
                                Ok(info) => qids.push(node_qid(&info)),
                                Err(e) => return tree_error(&e),
                            }
                        }
                        if nodes.len() == names.len() {
                            let target = *nodes.last().expect("nonempty");
                            state.tree.ref_node(target, "successful walk");
                            if let Some(old) = conn.fids.remove(&newfid) {
                                self.release_fid(&mut state, old);
                            }
                            conn.fids.insert(newfid, Fid::node(target));
                        }
                        Rmessage::Walk { qids }
                    }
                }
            }
        }
    }

    async fn open(&self, conn: &mut ConnState, fid: u32, mode: u8) -> Rmessage {
        if mode & ORCLOSE != 0 {
            return err(EPERM);
        }
        let mut state = self.state.lock().await;
        let Some(entry) = conn.fids.get_mut(&fid) else {
            return err(EBADFID);
        };
        match entry.target {
            FidTarget::Ctl => Rmessage::Open {
                qid: state.ctl.qid(),
                iounit: 0,
            },
            FidTarget::Node(node) => {
                if state.tree.is_unlinked(node) {
                    return err(EUNLINKED);
                }
                let info = match state.tree.info(node) {
                    Ok(info) => info,
                    Err(e) => return tree_error(&e),
                };
                let mut qid = node_qid(&info);
                if self.more_mode(qid.path) & DMEXCL != 0 {
                    if !self.lock_node(qid.path, conn.id, fid) {
                        return err(ELOCKED);
                    }
                    entry.locked = true;
                    qid.typ |= QTEXCL;
                }
                if info.is_dir() {
                    if let Err(e) = state.tree.grow(node).await {
                        return tree_error(&e);
                    }
                    let children = match state.tree.children_info(node).await {
                        Ok(children) => children,
                        Err(e) => return tree_error(&e),
                    };
                    let uid = owner();
                    let stats: Vec<Stat> =
                        children.iter().map(|c| node_stat(c, &uid)).collect();
                    conn.fids.get_mut(&fid).expect("present above").dirb =
                        Some(DirBuffer::new(&stats));
                } else if mode & OTRUNC != 0 {
                    if let Err(e) = state.tree.truncate(node, 0).await {
                        return tree_error(&e);
                    }
                }
                Rmessage::Open { qid, iounit: 0 }
            }
        }
    }

    async fn create(
        &self,
        conn: &mut ConnState,
        fid: u32,
        name: &str,
        perm: u32,
        _mode: u8,
    ) -> Rmessage {
        let mut state = self.state.lock().await;
        let Some(entry) = conn.fids.get(&fid) else {
            return err(EBADFID);
        };
        let parent = match entry.target {
            FidTarget::Ctl => return err(EPERM),
            FidTarget::Node(node) => node,
        };
        if state.tree.is_unlinked(parent) {
            return err(EUNLINKED);
        }
        if let Err(msg) = check_mode(None, perm) {
            return Rmessage::Error { ename: msg };
        }
        let node = match state.tree.add(parent, name, perm).await {
            Ok(node) => node,
            Err(e) => return tree_error(&e),
        };
        state.tree.ref_node(node, "create");
        state.tree.unref_node(parent, "created child");
        let info = match state.tree.info(node) {
            Ok(info) => info,
            Err(e) => return tree_error(&e),
        };
        let mut qid = node_qid(&info);
        let mut new_fid = Fid::node(node);
        if info.is_dir() {
            new_fid.dirb = Some(DirBuffer::empty());
        }
        if perm & DMEXCL != 0 {
            self.set_more_mode(qid.path, DMEXCL);
            // Node ids are allocated from a counter and never reused, so
            // the lock table cannot already hold an entry for a node that
            // was just created.
            let _locked = self.lock_node(qid.path, conn.id, fid);
            debug_assert!(_locked, "lock table held an entry for a fresh qid path");
            new_fid.locked = true;
            qid.typ |= QTEXCL;
        }
        conn.fids.insert(fid, new_fid);
        Rmessage::Create { qid, iounit: 0 }
    }

    async fn read(&self, conn: &mut ConnState, fid: u32, offset: u64, count: u32) -> Rmessage {
        let count = count.min(conn.msize - IOHDRSZ);
        let mut state = self.state.lock().await;
        let Some(entry) = conn.fids.get(&fid) else {
            return err(EBADFID);
        };
        match &entry.target {
            FidTarget::Ctl => {
                state.ctl.touch_atime();
                Rmessage::Read {
                    data: state.ctl.read(offset, count),
                }
            }
            FidTarget::Node(node) => {
                let node = *node;
                if state.tree.is_unlinked(node) {
                    return err(EUNLINKED);
                }
                if let Some(dirb) = &entry.dirb {
                    return match dirb.read(offset, count) {
                        Ok(data) => Rmessage::Read {
                            data: bytes::Bytes::copy_from_slice(data),
                        },
                        Err(msg) => err(msg),
                    };
                }
                let mut buf = vec![0u8; count as usize];
                match state.tree.read_at(node, &mut buf, offset).await {
                    Ok(n) => {
                        buf.truncate(n);
                        Rmessage::Read { data: buf.into() }
                    }
                    Err(e) => {
                        error!(path = %state.tree.path_of(node), "could not read: {}", e);
                        tree_error(&e)
                    }
                }
            }
        }
    }

    async fn write(&self, conn: &mut ConnState, fid: u32, offset: u64, data: &[u8]) -> Rmessage {
        let mut state = self.state.lock().await;
        let Some(entry) = conn.fids.get(&fid) else {
            return err(EBADFID);
        };
        match entry.target {
            FidTarget::Ctl => {
                state.ctl.touch_mtime();
                // One Twrite is one whole command.
                let command = String::from_utf8_lossy(data).to_string();
                match ctl::run_command(&mut state, &command).await {
                    Ok(()) => Rmessage::Write {
                        count: data.len() as u32,
                    },
                    Err(e) => Rmessage::Error { ename: e },
                }
            }
            FidTarget::Node(node) => {
                if state.tree.is_unlinked(node) {
                    return err(EUNLINKED);
                }
                match state.tree.info(node) {
                    Ok(info) if info.is_dir() => return err(EPERM),
                    Err(e) => return tree_error(&e),
                    Ok(_) => {}
                }
                match state.tree.write_at(node, data, offset).await {
                    Ok(()) => Rmessage::Write {
                        count: data.len() as u32,
                    },
                    Err(e) => tree_error(&e),
                }
            }
        }
    }

    async fn clunk(&self, conn: &mut ConnState, fid: u32) -> Rmessage {
        let Some(entry) = conn.fids.remove(&fid) else {
            return err(EBADFID);
        };
        let mut state = self.state.lock().await;
        self.release_fid(&mut state, entry);
        Rmessage::Clunk
    }

    async fn remove(&self, conn: &mut ConnState, fid: u32) -> Rmessage {
        let Some(entry) = conn.fids.remove(&fid) else {
            return err(EBADFID);
        };
        let mut state = self.state.lock().await;
        match entry.target {
            FidTarget::Ctl => {
                // The fid is gone either way, per the protocol.
                err(EPERM)
            }
            FidTarget::Node(node) => {
                if state.tree.is_unlinked(node) {
                    self.release_fid(&mut state, entry);
                    return err(EUNLINKED);
                }
                let result = state.tree.remove(node).await;
                self.release_fid(&mut state, entry);
                match result {
                    Ok(()) => Rmessage::Remove,
                    Err(tree::Error::NotEmpty) => err(ENOTEMPTY),
                    Err(e) => {
                        error!(path = %state.tree.path_of(node), "could not remove: {}", e);
                        err(EPERM)
                    }
                }
            }
        }
    }

    async fn stat(&self, conn: &mut ConnState, fid: u32) -> Rmessage {
        let state = self.state.lock().await;
        let Some(entry) = conn.fids.get(&fid) else {
            return err(EBADFID);
        };
        match entry.target {
            FidTarget::Ctl => Rmessage::Stat {
                stat: state.ctl.stat(&owner()),
            },
            FidTarget::Node(node) => {
                if state.tree.is_unlinked(node) {
                    return err(EUNLINKED);
                }
                let info = match state.tree.info(node) {
                    Ok(info) => info,
                    Err(e) => return tree_error(&e),
                };
                let mut stat = node_stat(&info, &owner());
                if self.more_mode(stat.qid.path) & DMEXCL != 0 {
                    stat.mode |= DMEXCL;
                    stat.qid.typ |= QTEXCL;
                } else {
                    stat.mode &= !DMEXCL;
                    stat.qid.typ &= !QTEXCL;
                }
                Rmessage::Stat { stat }
            }
        }
    }

    async fn wstat(&self, conn: &mut ConnState, fid: u32, mut stat: Stat) -> Rmessage {
        let mut state = self.state.lock().await;
        let Some(entry) = conn.fids.get(&fid) else {
            return err(EBADFID);
        };
        let node = match entry.target {
            FidTarget::Ctl => return err(EPERM),
            FidTarget::Node(node) => node,
        };
        if state.tree.is_unlinked(node) {
            return err(EUNLINKED);
        }
        let info = match state.tree.info(node) {
            Ok(info) => info,
            Err(e) => return tree_error(&e),
        };
        if stat.change_length() {
            if info.is_dir() {
                return err(EPERM);
            }
            if let Err(e) = state.tree.truncate(node, stat.length).await {
                error!("could not truncate: {}", e);
                return err(EPERM);
            }
        }

        // Linux 9P mounts send Wstat with a non-empty muid during rename
        // and set atime on touch; both are illegal per the protocol.
        // Discard them instead of failing renames and touches.
        stat.atime = u32::MAX;
        stat.muid.clear();
        if stat.change_illegal_fields() {
            warn!(path = %state.tree.path_of(node), "wstat tries to change illegal fields");
            return err(EPERM);
        }

        if stat.change_name() {
            if let Err(e) = state.tree.set_name(node, &stat.name) {
                return tree_error(&e);
            }
        }
        if stat.change_mtime() {
            if let Err(e) = state.tree.touch(node, stat.mtime) {
                return tree_error(&e);
            }
        }
        if stat.change_mode() {
            if let Err(msg) = check_mode(Some(info.is_dir()), stat.mode) {
                return Rmessage::Error { ename: msg };
            }
            if stat.mode & DMEXCL != 0 {
                self.set_more_mode(info.id, DMEXCL);
            } else {
                self.set_more_mode(info.id, 0);
            }
            if let Err(e) = state.tree.set_perm(node, stat.mode & 0o777) {
                return tree_error(&e);
            }
        }
        if stat.change_gid() {
            return err(EPERM);
        }
        Rmessage::Wstat
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use muscle::block::Factory;
    use muscle::storage::{DiskStore, MemoryStore, PairedStore, Store as _};
    use muscle::Pointer;

    use super::*;
    use crate::wire::{NOFID, OREAD, ORDWR};

    const BLOCK_SIZE: usize = 32;

    async fn test_server(
        dir: &std::path::Path,
    ) -> (Arc<Server>, Arc<TreeStore>, Arc<PairedStore>, Arc<MemoryStore>) {
        let staging = Arc::new(DiskStore::new(dir.join("staging")).await.unwrap());
        let cache = Arc::new(DiskStore::new(dir.join("cache")).await.unwrap());
        let remote = Arc::new(MemoryStore::default());
        let paired = Arc::new(
            PairedStore::new(cache, remote.clone(), &dir.join("propagation.log"))
                .await
                .unwrap(),
        );
        let factory = Factory::new(staging, paired.clone(), &[3; 32], BLOCK_SIZE).unwrap();
        let store = Arc::new(TreeStore::new(factory, &dir.join("base")).await.unwrap());
        let tree = Tree::with_root(store.clone(), Duration::from_secs(3600))
            .await
            .unwrap();
        let server = Server::new(tree, store.clone(), paired.clone(), None).await;
        (server, store, paired, remote)
    }

    struct Client {
        stream: tokio::io::DuplexStream,
        tag: u16,
    }

    impl Client {
        async fn connect(server: &Arc<Server>) -> Client {
            let (client_side, server_side) = tokio::io::duplex(2 * MAX_MSIZE as usize);
            tokio::spawn(server.clone().serve_connection(server_side));
            let mut client = Client {
                stream: client_side,
                tag: 0,
            };
            let resp = client
                .rpc(Tmessage::Version {
                    msize: MAX_MSIZE,
                    version: "9P2000".to_string(),
                })
                .await;
            assert!(matches!(resp, Rmessage::Version { .. }), "{:?}", resp);
            client
        }

        async fn rpc(&mut self, msg: Tmessage) -> Rmessage {
            self.tag = self.tag.wrapping_add(1);
            wire::write_request(&mut self.stream, self.tag, &msg)
                .await
                .unwrap();
            let (tag, resp) = wire::read_response(&mut self.stream)
                .await
                .unwrap()
                .expect("server hung up");
            assert_eq!(tag, self.tag);
            resp
        }

        async fn attach(&mut self, fid: u32) -> Qid {
            match self
                .rpc(Tmessage::Attach {
                    fid,
                    afid: NOFID,
                    uname: "test".to_string(),
                    aname: String::new(),
                })
                .await
            {
                Rmessage::Attach { qid } => qid,
                other => panic!("attach: {:?}", other),
            }
        }

        async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> Rmessage {
            self.rpc(Tmessage::Walk {
                fid,
                newfid,
                names: names.iter().map(|s| s.to_string()).collect(),
            })
            .await
        }

        async fn clone_fid(&mut self, fid: u32, newfid: u32) {
            match self.walk(fid, newfid, &[]).await {
                Rmessage::Walk { qids } => assert!(qids.is_empty()),
                other => panic!("clone: {:?}", other),
            }
        }

        async fn create(&mut self, fid: u32, name: &str, perm: u32) -> Rmessage {
            self.rpc(Tmessage::Create {
                fid,
                name: name.to_string(),
                perm,
                mode: ORDWR,
            })
            .await
        }

        async fn open(&mut self, fid: u32, mode: u8) -> Rmessage {
            self.rpc(Tmessage::Open { fid, mode }).await
        }

        async fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Rmessage {
            self.rpc(Tmessage::Write {
                fid,
                offset,
                data: Bytes::copy_from_slice(data),
            })
            .await
        }

        async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Bytes {
            match self.rpc(Tmessage::Read { fid, offset, count }).await {
                Rmessage::Read { data } => data,
                other => panic!("read: {:?}", other),
            }
        }

        async fn clunk(&mut self, fid: u32) {
            match self.rpc(Tmessage::Clunk { fid }).await {
                Rmessage::Clunk => {}
                other => panic!("clunk: {:?}", other),
            }
        }

        async fn stat(&mut self, fid: u32) -> Stat {
            match self.rpc(Tmessage::Stat { fid }).await {
                Rmessage::Stat { stat } => stat,
                other => panic!("stat: {:?}", other),
            }
        }

        /// Walks a fresh fid to `ctl` and runs one command through it,
        /// returning the buffered response.
        async fn ctl(&mut self, root_fid: u32, work_fid: u32, command: &str) -> Result<String, String> {
            match self.walk(root_fid, work_fid, &["ctl"]).await {
                Rmessage::Walk { qids } => assert_eq!(qids.len(), 1),
                other => panic!("walk to ctl: {:?}", other),
            }
            let result = match self.write(work_fid, 0, command.as_bytes()).await {
                Rmessage::Write { .. } => Ok(()),
                Rmessage::Error { ename } => Err(ename),
                other => panic!("ctl write: {:?}", other),
            };
            let data = self.read(work_fid, 0, MAX_MSIZE - IOHDRSZ).await;
            self.clunk(work_fid).await;
            let text = String::from_utf8(data.to_vec()).unwrap();
            match result {
                Ok(()) => Ok(text),
                Err(e) => Err(e),
            }
        }
    }

    fn expect_error(resp: Rmessage) -> String {
        match resp {
            Rmessage::Error { ename } => ename,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        c.clone_fid(0, 1).await;
        match c.create(1, "hello", 0o644).await {
            Rmessage::Create { qid, .. } => assert_eq!(qid.typ, QTFILE),
            other => panic!("create: {:?}", other),
        }
        match c.write(1, 0, b"world").await {
            Rmessage::Write { count } => assert_eq!(count, 5),
            other => panic!("write: {:?}", other),
        }
        assert_eq!(c.read(1, 0, 5).await, Bytes::from_static(b"world"));

        match c.rpc(Tmessage::Remove { fid: 1 }).await {
            Rmessage::Remove => {}
            other => panic!("remove: {:?}", other),
        }
        let ename = expect_error(c.walk(0, 2, &["hello"]).await);
        assert_eq!(ename, ENOENT);
    }

    #[tokio::test]
    async fn exclusive_open_contention() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;

        let mut a = Client::connect(&server).await;
        a.attach(0).await;
        a.clone_fid(0, 1).await;
        match a.create(1, "lock", DMEXCL | 0o644).await {
            Rmessage::Create { qid, .. } => assert_ne!(qid.typ & QTEXCL, 0),
            other => panic!("create: {:?}", other),
        }

        let mut b = Client::connect(&server).await;
        b.attach(0).await;
        match b.walk(0, 1, &["lock"]).await {
            Rmessage::Walk { qids } => assert_eq!(qids.len(), 1),
            other => panic!("walk: {:?}", other),
        }
        let ename = expect_error(b.open(1, OREAD).await);
        assert_eq!(ename, ELOCKED);

        // the creator clunks; the second open succeeds and takes the lock
        a.clunk(1).await;
        match b.open(1, OREAD).await {
            Rmessage::Open { qid, .. } => assert_ne!(qid.typ & QTEXCL, 0),
            other => panic!("open after clunk: {:?}", other),
        }
    }

    #[tokio::test]
    async fn self_clone_walk_keeps_lock_and_dir_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;

        let mut a = Client::connect(&server).await;
        a.attach(0).await;
        a.clone_fid(0, 1).await;
        a.create(1, "lock", DMEXCL | 0o644).await;

        // a zero-element walk of a fid onto itself rebinds it in place and
        // must not release the exclusive lock
        a.clone_fid(1, 1).await;
        let mut b = Client::connect(&server).await;
        b.attach(0).await;
        match b.walk(0, 1, &["lock"]).await {
            Rmessage::Walk { qids } => assert_eq!(qids.len(), 1),
            other => panic!("walk: {:?}", other),
        }
        assert_eq!(expect_error(b.open(1, OREAD).await), ELOCKED);

        // nor may it drop an open directory fid's stable read buffer
        a.clone_fid(0, 2).await;
        match a.open(2, OREAD).await {
            Rmessage::Open { qid, .. } => assert_eq!(qid.typ, QTDIR),
            other => panic!("open dir: {:?}", other),
        }
        a.clone_fid(2, 2).await;
        let mut data = a.read(2, 0, MAX_MSIZE - IOHDRSZ).await;
        let stat = Stat::decode(&mut data).unwrap();
        assert_eq!(stat.name, "lock");
    }

    #[tokio::test]
    async fn ctl_flush_and_unknown_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        assert_eq!(c.ctl(0, 1, "flush").await.unwrap(), "flushed\n");
        let err = c.ctl(0, 1, "frobnicate").await.unwrap_err();
        assert!(err.contains("command not recognized"), "{}", err);
    }

    #[tokio::test]
    async fn ctl_cannot_be_walked_through_removed_or_created_under() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        match c.walk(0, 1, &["ctl"]).await {
            Rmessage::Walk { qids } => assert_eq!(qids.len(), 1),
            other => panic!("walk: {:?}", other),
        }
        assert_eq!(expect_error(c.walk(1, 2, &["below"]).await), EPERM);
        assert_eq!(expect_error(c.create(1, "x", 0o644).await), EPERM);
        assert_eq!(expect_error(c.rpc(Tmessage::Remove { fid: 1 }).await), EPERM);
    }

    #[tokio::test]
    async fn push_requires_matching_bases() {
        let dir = tempfile::tempdir().unwrap();
        let (server, store, _, _) = test_server(dir.path()).await;
        let foreign = Pointer::of(b"someone else pushed this");
        store.set_remote_base_pointer(&foreign).await.unwrap();

        let mut c = Client::connect(&server).await;
        c.attach(0).await;
        let err = c.ctl(0, 1, "push").await.unwrap_err();
        assert!(err.contains("pull first"), "{}", err);
        assert!(err.contains(&Pointer::zero().hex()), "{}", err);
        assert!(err.contains(&foreign.hex()), "{}", err);
    }

    #[tokio::test]
    async fn pull_is_a_noop_when_bases_match() {
        let dir = tempfile::tempdir().unwrap();
        let (server, store, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        let out = c.ctl(0, 1, "pull").await.unwrap();
        assert_eq!(out, "local base matches remote base, pull is a no-op\n");
        assert!(store.local_base_pointer().await.unwrap().is_zero());
        assert!(store.remote_base_pointer().await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn push_advances_both_bases_and_drains_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let (server, store, paired, remote) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        c.clone_fid(0, 1).await;
        c.create(1, "pushed.txt", 0o644).await;
        c.write(1, 0, b"make it durable").await;
        c.clunk(1).await;

        let out = c.ctl(0, 1, "push").await.unwrap();
        assert!(out.contains("push: revision created:"), "{}", out);
        assert!(out.contains("push: updated local base pointer:"), "{}", out);

        let local = store.local_base_pointer().await.unwrap();
        let remote_base = store.remote_base_pointer().await.unwrap();
        assert!(!local.is_zero());
        assert_eq!(local, remote_base);
        assert_eq!(paired.pending().await, 0);
        // the revision record itself reached the slow store
        assert!(remote.contains(&local).await.unwrap());

        // and a subsequent pull is a no-op
        let out = c.ctl(0, 1, "pull").await.unwrap();
        assert_eq!(out, "local base matches remote base, pull is a no-op\n");
    }

    #[tokio::test]
    async fn unsupported_and_unknown_modes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        c.clone_fid(0, 1).await;
        let ename = expect_error(c.create(1, "bad", 0o644 | DMSYMLINK).await);
        assert_eq!(ename, "symbolic links are not supported");

        let ename = expect_error(c.create(1, "bad", 0o644 | DMAPPEND).await);
        assert_eq!(ename, "append-only files are not supported");

        let ename = expect_error(c.create(1, "bad", 0o644 | 0x400).await);
        assert!(ename.starts_with("unrecognized mode bits"), "{}", ename);
    }

    #[tokio::test]
    async fn wstat_quirks() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        c.clone_fid(0, 1).await;
        c.create(1, "old-name", 0o644).await;

        // Linux sends muid and atime along with renames and touches; both
        // are discarded rather than failing the request.
        let mut rename = Stat::nil();
        rename.name = "new-name".to_string();
        rename.muid = "someone".to_string();
        rename.atime = 1234;
        match c.rpc(Tmessage::Wstat { fid: 1, stat: rename }).await {
            Rmessage::Wstat => {}
            other => panic!("wstat: {:?}", other),
        }
        assert_eq!(c.stat(1).await.name, "new-name");

        // actually illegal field changes are refused
        let mut illegal = Stat::nil();
        illegal.dev = 7;
        assert_eq!(
            expect_error(c.rpc(Tmessage::Wstat { fid: 1, stat: illegal }).await),
            EPERM
        );

        // gid changes are refused
        let mut gid = Stat::nil();
        gid.gid = "wheel".to_string();
        assert_eq!(
            expect_error(c.rpc(Tmessage::Wstat { fid: 1, stat: gid }).await),
            EPERM
        );

        // directories cannot be truncated
        c.clone_fid(0, 2).await;
        c.create(2, "subdir", DMDIR | 0o755).await;
        let mut shrink = Stat::nil();
        shrink.length = 0;
        assert_eq!(
            expect_error(c.rpc(Tmessage::Wstat { fid: 2, stat: shrink }).await),
            EPERM
        );

        // directory/file transitions are refused
        let mut flip = Stat::nil();
        flip.mode = 0o755;
        assert_eq!(
            expect_error(c.rpc(Tmessage::Wstat { fid: 2, stat: flip }).await),
            "a directory cannot become a regular file"
        );

        // mtime changes apply
        let mut touch = Stat::nil();
        touch.mtime = 1234;
        match c.rpc(Tmessage::Wstat { fid: 1, stat: touch }).await {
            Rmessage::Wstat => {}
            other => panic!("wstat mtime: {:?}", other),
        }
        assert_eq!(c.stat(1).await.mtime, 1234);
    }

    #[tokio::test]
    async fn directory_reads_are_stable_and_cut_at_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        for name in ["alpha", "beta"] {
            c.clone_fid(0, 1).await;
            c.create(1, name, 0o644).await;
            c.clunk(1).await;
        }

        c.clone_fid(0, 3).await;
        match c.open(3, OREAD).await {
            Rmessage::Open { qid, .. } => assert_eq!(qid.typ, QTDIR),
            other => panic!("open dir: {:?}", other),
        }
        let mut data = c.read(3, 0, MAX_MSIZE - IOHDRSZ).await;
        let mut names = Vec::new();
        let mut consumed = 0u64;
        while !data.is_empty() {
            let before = data.len();
            let stat = Stat::decode(&mut data).unwrap();
            consumed += (before - data.len()) as u64;
            names.push(stat.name);
        }
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
        // the ctl file is synthetic and never shows up in listings
        assert!(!names.contains(&"ctl".to_string()));

        // reads continue from the previous offset and end cleanly
        assert_eq!(c.read(3, consumed, 8192).await.len(), 0);

        // a misaligned offset is refused
        let resp = c.rpc(Tmessage::Read { fid: 3, offset: 1, count: 8192 }).await;
        assert_eq!(expect_error(resp), "bad offset in directory read");
    }

    #[tokio::test]
    async fn open_with_otrunc_discards_content() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        c.clone_fid(0, 1).await;
        c.create(1, "notes", 0o644).await;
        c.write(1, 0, b"0123456789").await;
        c.clunk(1).await;

        match c.walk(0, 1, &["notes"]).await {
            Rmessage::Walk { qids } => assert_eq!(qids.len(), 1),
            other => panic!("walk: {:?}", other),
        }
        c.open(1, ORDWR | OTRUNC).await;
        assert_eq!(c.stat(1).await.length, 0);
    }

    #[tokio::test]
    async fn unlinked_fids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        c.clone_fid(0, 1).await;
        c.create(1, "doomed", 0o644).await;
        // a second fid for the same node
        match c.walk(0, 2, &["doomed"]).await {
            Rmessage::Walk { qids } => assert_eq!(qids.len(), 1),
            other => panic!("walk: {:?}", other),
        }
        match c.rpc(Tmessage::Remove { fid: 2 }).await {
            Rmessage::Remove => {}
            other => panic!("remove: {:?}", other),
        }
        assert_eq!(expect_error(c.write(1, 0, b"too late").await), EUNLINKED);
        let resp = c.rpc(Tmessage::Read { fid: 1, offset: 0, count: 1 }).await;
        assert_eq!(expect_error(resp), EUNLINKED);
    }

    #[tokio::test]
    async fn version_negotiation() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let (client_side, server_side) = tokio::io::duplex(2 * MAX_MSIZE as usize);
        tokio::spawn(server.clone().serve_connection(server_side));
        let mut c = Client {
            stream: client_side,
            tag: 0,
        };

        match c
            .rpc(Tmessage::Version {
                msize: 1 << 20,
                version: "9P2000.u".to_string(),
            })
            .await
        {
            Rmessage::Version { msize, version } => {
                assert_eq!(msize, MAX_MSIZE); // capped
                assert_eq!(version, "9P2000"); // downgraded to plain
            }
            other => panic!("version: {:?}", other),
        }
        match c
            .rpc(Tmessage::Version {
                msize: 8192,
                version: "9P1999".to_string(),
            })
            .await
        {
            Rmessage::Version { version, .. } => assert_eq!(version, "unknown"),
            other => panic!("version: {:?}", other),
        }
    }

    #[tokio::test]
    async fn auth_is_not_required() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        let resp = c
            .rpc(Tmessage::Auth {
                afid: 0,
                uname: "test".to_string(),
                aname: String::new(),
            })
            .await;
        assert_eq!(expect_error(resp), ENOAUTH);
    }

    #[tokio::test]
    async fn lsof_reports_open_fids() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _, _, _) = test_server(dir.path()).await;
        let mut c = Client::connect(&server).await;
        c.attach(0).await;

        c.clone_fid(0, 1).await;
        c.create(1, "held-open", 0o644).await;
        let out = c.ctl(0, 2, "lsof").await.unwrap();
        assert!(out.contains("/held-open"), "{}", out);
    }
}
