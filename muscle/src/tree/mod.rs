//! The tree engine: an in-memory mutable directory tree, lazily hydrated
//! from and persisted to the content-addressed store, with snapshots
//! (revisions), three-way pull and push on top.

use thiserror::Error;

use crate::{block, storage, Pointer, PointerError};

mod merge;
mod node;
mod revision;
mod store;
#[cfg(test)]
mod tests;
#[allow(clippy::module_inception)]
mod tree;

pub use merge::{pull_worklog, tree_diff};
pub use node::{NodeId, NodeInfo};
pub use revision::Revision;
pub use store::Store;
pub use tree::Tree;

/// Mode bits, the 9P `DM*` layout. Only the permission bits, [DMDIR] and
/// [DMEXCL] are honored by the tree; the rest exist so the front-end can
/// name what it rejects.
pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;
pub const DMEXCL: u32 = 0x2000_0000;
pub const DMMOUNT: u32 = 0x1000_0000;
pub const DMAUTH: u32 = 0x0800_0000;
pub const DMTMP: u32 = 0x0400_0000;
pub const DMSYMLINK: u32 = 0x0200_0000;
pub const DMLINK: u32 = 0x0100_0000;
pub const DMDEVICE: u32 = 0x0080_0000;
pub const DMNAMEDPIPE: u32 = 0x0020_0000;
pub const DMSOCKET: u32 = 0x0010_0000;
pub const DMSETUID: u32 = 0x0008_0000;
pub const DMSETGID: u32 = 0x0004_0000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("does not exist")]
    NotExist,

    #[error("already exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotADir,

    #[error("node is unlinked")]
    Unlinked,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid name {0:?}")]
    BadName(String),

    #[error("corrupt pointer in {0}: {1}")]
    CorruptPointer(std::path::PathBuf, PointerError),

    #[error("corrupt object {0}: {1}")]
    Corrupt(Pointer, String),

    #[error(transparent)]
    Block(#[from] block::Error),

    #[error(transparent)]
    Store(#[from] storage::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
