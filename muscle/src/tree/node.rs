use serde::{Deserialize, Serialize};

use super::{Error, DMDIR};
use crate::block::Block;
use crate::{Pointer, POINTER_LEN};

/// Stable identifier of a node while the server runs; doubles as the 9P qid
/// path. Ids are allocated from an arena counter at hydration and never
/// serialized: embedding them in the body would break content dedup across
/// snapshots.
pub type NodeId = u64;

/// A directory-tree vertex. Owned by the [super::Tree] arena; the parent
/// back-reference is a weak index, the canonical owner of a node is its
/// parent's child list.
pub(super) struct Node {
    pub(super) id: NodeId,
    pub(super) version: u32,
    pub(super) name: String,
    pub(super) mode: u32,
    pub(super) size: u64,
    pub(super) mtime: u32,
    /// Pointer of the serialized body, zero if never stored.
    pub(super) pointer: Pointer,
    pub(super) parent: Option<NodeId>,
    pub(super) content: Content,
    pub(super) refcount: u32,
    pub(super) dirty: bool,
    pub(super) unlinked: bool,
}

pub(super) enum Content {
    File { blocks: Vec<Block> },
    Dir { children: Children },
}

/// A directory's children start out sparse (the stored child pointers) and
/// are upgraded to arena ids on load.
pub(super) enum Children {
    Sparse(Vec<Pointer>),
    Loaded(Vec<NodeId>),
}

impl Node {
    pub(super) fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }

    pub(super) fn is_loaded(&self) -> bool {
        match &self.content {
            Content::File { .. } => true,
            Content::Dir { children } => matches!(children, Children::Loaded(_)),
        }
    }

    pub(super) fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            version: self.version,
            name: self.name.clone(),
            mode: self.mode,
            size: self.size,
            mtime: self.mtime,
        }
    }
}

/// The front-end-facing view of a node's attributes, enough to build qids
/// and stat records.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub id: u64,
    pub version: u32,
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: u32,
}

impl NodeInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }
}

/// The decoded form of a stored node body.
pub(super) struct ParsedBody {
    pub(super) name: String,
    pub(super) mode: u32,
    pub(super) size: u64,
    pub(super) mtime: u32,
    pub(super) content: ParsedContent,
}

pub(super) enum ParsedContent {
    /// Sealed block refs: pointer and plaintext length.
    File(Vec<(Pointer, u32)>),
    /// Child body pointers; child metadata lives in the child bodies.
    Dir(Vec<Pointer>),
}

// The wire form. Fixed-width pointers keep the encoding deterministic:
// serializing the same body twice yields identical bytes, which content
// addressing relies on.
#[derive(Serialize, Deserialize)]
struct Body {
    name: String,
    mode: u32,
    size: u64,
    mtime: u32,
    content: BodyContent,
}

#[derive(Serialize, Deserialize)]
enum BodyContent {
    File { blocks: Vec<BlockRef> },
    Dir { children: Vec<[u8; POINTER_LEN]> },
}

#[derive(Serialize, Deserialize)]
struct BlockRef {
    pointer: [u8; POINTER_LEN],
    len: u32,
}

fn to_raw(p: &Pointer) -> [u8; POINTER_LEN] {
    p.as_slice().try_into().expect("pointers are fixed width")
}

pub(super) fn marshal_body(
    name: &str,
    mode: u32,
    size: u64,
    mtime: u32,
    content: &ParsedContent,
) -> Result<Vec<u8>, Error> {
    let body = Body {
        name: name.to_string(),
        mode,
        size,
        mtime,
        content: match content {
            ParsedContent::File(refs) => BodyContent::File {
                blocks: refs
                    .iter()
                    .map(|(p, len)| BlockRef {
                        pointer: to_raw(p),
                        len: *len,
                    })
                    .collect(),
            },
            ParsedContent::Dir(children) => BodyContent::Dir {
                children: children.iter().map(to_raw).collect(),
            },
        },
    };
    bincode::serialize(&body)
        .map_err(|e| Error::Corrupt(Pointer::zero(), format!("marshal node body: {}", e)))
}

pub(super) fn unmarshal_body(pointer: &Pointer, bytes: &[u8]) -> Result<ParsedBody, Error> {
    let body: Body = bincode::deserialize(bytes)
        .map_err(|e| Error::Corrupt(pointer.clone(), format!("unmarshal node body: {}", e)))?;
    Ok(ParsedBody {
        name: body.name,
        mode: body.mode,
        size: body.size,
        mtime: body.mtime,
        content: match body.content {
            BodyContent::File { blocks } => ParsedContent::File(
                blocks
                    .into_iter()
                    .map(|r| (Pointer::from(&r.pointer), r.len))
                    .collect(),
            ),
            BodyContent::Dir { children } => {
                ParsedContent::Dir(children.iter().map(|raw| Pointer::from(raw)).collect())
            }
        },
    })
}
