//! Blocks: bounded, encrypted, content-addressed byte regions backing file
//! data.
//!
//! The factory mints two block classes. *Staging* blocks are mutable and
//! live in the staging store only, under a random handle, until sealed.
//! *Sealed* blocks are immutable: the plaintext is AES-256-GCM encrypted,
//! the stored form is `nonce || ciphertext`, and the block's pointer is the
//! BLAKE3 hash of that stored form. Mutating a sealed block means thawing it
//! into a fresh staging block; the sealed bytes are never touched.
//!
//! Nonces are derived from a keyed BLAKE3 hash of the plaintext, so sealing
//! equal plaintexts yields equal ciphertexts and equal pointers. Content
//! addressing requires the determinism; the construction is SIV-like.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use rand::Rng;
use thiserror::Error;

use crate::storage::{self, DiskStore, Store};
use crate::Pointer;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const NONCE_CONTEXT: &str = "muscle block nonce derivation v1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("encryption key must be 32 bytes, got {0}")]
    BadKey(usize),

    #[error("block is sealed")]
    Sealed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("block {0} missing from store")]
    Missing(Pointer),

    #[error("stored block {0} is malformed")]
    Corrupt(Pointer),

    #[error(transparent)]
    Store(#[from] storage::Error),
}

struct Inner {
    staging: Arc<DiskStore>,
    paired: Arc<dyn Store>,
    cipher: Aes256Gcm,
    nonce_key: [u8; 32],
    block_size: usize,
}

impl Inner {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let derived = blake3::keyed_hash(&self.nonce_key, plaintext);
        let nonce = &derived.as_bytes()[..NONCE_LEN];
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| Error::EncryptFailed)?;
        let mut stored = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        stored.extend_from_slice(nonce);
        stored.extend_from_slice(&ciphertext);
        Ok(stored)
    }

    fn decrypt(&self, stored: &[u8], pointer: &Pointer) -> Result<Vec<u8>, Error> {
        if stored.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Corrupt(pointer.clone()));
        }
        let (nonce, ciphertext) = stored.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::DecryptFailed)
    }
}

/// Mints [Block]s over a staging store, a paired store and an AEAD key.
#[derive(Clone)]
pub struct Factory {
    inner: Arc<Inner>,
}

impl Factory {
    pub fn new(
        staging: Arc<DiskStore>,
        paired: Arc<dyn Store>,
        key: &[u8],
        block_size: usize,
    ) -> Result<Self, Error> {
        let key: [u8; 32] = key.try_into().map_err(|_| Error::BadKey(key.len()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                staging,
                paired,
                cipher: Aes256Gcm::new(&key.into()),
                nonce_key: blake3::derive_key(NONCE_CONTEXT, &key),
                block_size,
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Mints a fresh mutable staging block.
    pub fn new_block(&self) -> Block {
        let handle: [u8; 32] = rand::thread_rng().gen();
        Block {
            inner: self.inner.clone(),
            state: State::Staging {
                handle: Pointer::from(&handle),
                buf: Vec::new(),
            },
        }
    }

    /// A lazy handle to a sealed block; nothing is read until the first
    /// [Block::read_at].
    pub fn load(&self, pointer: Pointer, len: u32) -> Block {
        Block {
            inner: self.inner.clone(),
            state: State::Sealed {
                pointer,
                len,
                plaintext: None,
            },
        }
    }

    /// Encrypts and stores a byte region directly, without going through a
    /// staging block. Node bodies and revision records take this path.
    pub async fn seal_bytes(&self, plaintext: &[u8]) -> Result<Pointer, Error> {
        let stored = self.inner.encrypt(plaintext)?;
        let pointer = Pointer::of(&stored);
        self.inner.paired.put(&pointer, stored.into()).await?;
        Ok(pointer)
    }

    /// Fetches and decrypts a byte region sealed by [Self::seal_bytes].
    pub async fn open_bytes(&self, pointer: &Pointer) -> Result<Bytes, Error> {
        let stored = self
            .inner
            .paired
            .get(pointer)
            .await?
            .ok_or_else(|| Error::Missing(pointer.clone()))?;
        Ok(self.inner.decrypt(&stored, pointer)?.into())
    }
}

enum State {
    Staging {
        handle: Pointer,
        buf: Vec<u8>,
    },
    Sealed {
        pointer: Pointer,
        len: u32,
        plaintext: Option<Bytes>,
    },
}

/// One block of file content. See the module docs for the two classes.
pub struct Block {
    inner: Arc<Inner>,
    state: State,
}

impl Block {
    pub fn len(&self) -> usize {
        match &self.state {
            State::Staging { buf, .. } => buf.len(),
            State::Sealed { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.state, State::Sealed { .. })
    }

    /// The content pointer, present once sealed.
    pub fn pointer(&self) -> Option<&Pointer> {
        match &self.state {
            State::Staging { .. } => None,
            State::Sealed { pointer, .. } => Some(pointer),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.block_size
    }

    /// Copies block content at `off` into `buf`, decrypting on first access
    /// to a sealed block. Returns the number of bytes copied; zero at or
    /// past the end of the block.
    pub async fn read_at(&mut self, buf: &mut [u8], off: usize) -> Result<usize, Error> {
        self.hydrate().await?;
        let content: &[u8] = match &self.state {
            State::Staging { buf, .. } => buf,
            State::Sealed { plaintext, .. } => plaintext.as_ref().expect("hydrated above"),
        };
        if off >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - off);
        buf[..n].copy_from_slice(&content[off..off + n]);
        Ok(n)
    }

    /// Writes into a staging block at `off`, extending it up to the block
    /// size. Returns how many bytes were accepted (zero once full); errors
    /// on sealed blocks.
    pub async fn write_at(&mut self, data: &[u8], off: usize) -> Result<usize, Error> {
        let cap = self.inner.block_size;
        let inner = self.inner.clone();
        match &mut self.state {
            State::Sealed { .. } => Err(Error::Sealed),
            State::Staging { handle, buf } => {
                if off >= cap {
                    return Ok(0);
                }
                let n = data.len().min(cap - off);
                if buf.len() < off + n {
                    buf.resize(off + n, 0);
                }
                buf[off..off + n].copy_from_slice(&data[..n]);
                inner
                    .staging
                    .put(handle, Bytes::from(buf.clone()))
                    .await?;
                Ok(n)
            }
        }
    }

    /// Shortens a staging block; errors on sealed blocks.
    pub async fn truncate(&mut self, len: usize) -> Result<(), Error> {
        let inner = self.inner.clone();
        match &mut self.state {
            State::Sealed { .. } => Err(Error::Sealed),
            State::Staging { handle, buf } => {
                buf.truncate(len);
                inner
                    .staging
                    .put(handle, Bytes::from(buf.clone()))
                    .await?;
                Ok(())
            }
        }
    }

    /// Turns a sealed block back into a staging block with the same content
    /// under a fresh handle. The sealed bytes remain in the store; the next
    /// seal produces a new pointer. No-op on staging blocks.
    pub async fn thaw(&mut self) -> Result<(), Error> {
        if !self.is_sealed() {
            return Ok(());
        }
        self.hydrate().await?;
        let plaintext = match &self.state {
            State::Sealed { plaintext, .. } => plaintext.as_ref().expect("hydrated above").to_vec(),
            State::Staging { .. } => unreachable!(),
        };
        let handle: [u8; 32] = rand::thread_rng().gen();
        let handle = Pointer::from(&handle);
        self.inner
            .staging
            .put(&handle, Bytes::from(plaintext.clone()))
            .await?;
        self.state = State::Staging {
            handle,
            buf: plaintext,
        };
        Ok(())
    }

    /// Encrypts, stores into the paired store and returns the content
    /// pointer. Idempotent if already sealed. The staging file is deleted.
    pub async fn seal(&mut self) -> Result<Pointer, Error> {
        let (handle, buf) = match &self.state {
            State::Sealed { pointer, .. } => return Ok(pointer.clone()),
            State::Staging { handle, buf } => (handle.clone(), buf.clone()),
        };
        let stored = self.inner.encrypt(&buf)?;
        let pointer = Pointer::of(&stored);
        self.inner.paired.put(&pointer, stored.into()).await?;
        self.inner.staging.delete(&handle).await?;
        self.state = State::Sealed {
            pointer: pointer.clone(),
            len: buf.len() as u32,
            plaintext: Some(buf.into()),
        };
        Ok(pointer)
    }

    /// Drops the cached plaintext of a sealed block; the next read faults it
    /// back in. No-op on staging blocks.
    pub fn evict_plaintext(&mut self) {
        if let State::Sealed { plaintext, .. } = &mut self.state {
            *plaintext = None;
        }
    }

    async fn hydrate(&mut self) -> Result<(), Error> {
        let (pointer, len) = match &self.state {
            State::Sealed {
                pointer,
                len,
                plaintext: None,
            } => (pointer.clone(), *len),
            _ => return Ok(()),
        };
        let stored = self
            .inner
            .paired
            .get(&pointer)
            .await?
            .ok_or_else(|| Error::Missing(pointer.clone()))?;
        let content = self.inner.decrypt(&stored, &pointer)?;
        if content.len() != len as usize {
            return Err(Error::Corrupt(pointer));
        }
        if let State::Sealed { plaintext, .. } = &mut self.state {
            *plaintext = Some(content.into());
        }
        Ok(())
    }
}
