use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::Error;
use crate::{Pointer, POINTER_LEN};

/// A snapshot record: the root's pointer, the parent revision, a host tag
/// and a timestamp. Revisions form a DAG rooted at the zero pointer and are
/// named, like everything else, by the pointer of their stored form.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    root: Pointer,
    parent: Pointer,
    host: String,
    time: u64,
}

#[derive(Serialize, Deserialize)]
struct Body {
    root: [u8; POINTER_LEN],
    parent: [u8; POINTER_LEN],
    host: String,
    time: u64,
}

impl Revision {
    pub fn new(root: Pointer, parent: Pointer) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            root,
            parent,
            host,
            time,
        }
    }

    pub fn root(&self) -> &Pointer {
        &self.root
    }

    pub fn parent(&self) -> &Pointer {
        &self.parent
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub(super) fn marshal(&self) -> Result<Vec<u8>, Error> {
        let body = Body {
            root: self.root.as_slice().try_into().expect("fixed width"),
            parent: self.parent.as_slice().try_into().expect("fixed width"),
            host: self.host.clone(),
            time: self.time,
        };
        bincode::serialize(&body)
            .map_err(|e| Error::Corrupt(Pointer::zero(), format!("marshal revision: {}", e)))
    }

    pub(super) fn unmarshal(pointer: &Pointer, bytes: &[u8]) -> Result<Self, Error> {
        let body: Body = bincode::deserialize(bytes)
            .map_err(|e| Error::Corrupt(pointer.clone(), format!("unmarshal revision: {}", e)))?;
        Ok(Self {
            root: Pointer::from(&body.root),
            parent: Pointer::from(&body.parent),
            host: body.host,
            time: body.time,
        })
    }
}
