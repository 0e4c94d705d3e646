use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::instrument;

use super::{Error, Revision};
use crate::block::Factory;
use crate::Pointer;

const ROOT_FILE: &str = "root.pointer";
const LOCAL_BASE_FILE: &str = "local.base.pointer";
const REMOTE_BASE_FILE: &str = "remote.base.pointer";

/// Persistence for the tree: node bodies and revisions go through the block
/// factory (encrypted, content-addressed, into the paired store); the root
/// pointer and the two base pointers are small hex files in the base
/// directory, overwritten atomically.
pub struct Store {
    factory: Factory,
    base: PathBuf,
}

impl Store {
    pub async fn new(factory: Factory, base: &Path) -> Result<Self, Error> {
        tokio::fs::create_dir_all(base).await?;
        Ok(Self {
            factory,
            base: base.to_path_buf(),
        })
    }

    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    async fn read_pointer_file(&self, name: &str) -> Result<Pointer, Error> {
        let path = self.base.join(name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            // A missing file is an empty history, not corruption.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Pointer::zero()),
            Err(e) => return Err(e.into()),
        };
        Pointer::from_hex(text.trim()).map_err(|e| Error::CorruptPointer(path, e))
    }

    async fn write_pointer_file(&self, name: &str, pointer: &Pointer) -> Result<(), Error> {
        let path = self.base.join(name);
        let scratch = self.base.join(format!("{}.tmp", name));
        let mut file = tokio::fs::File::create(&scratch).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, format!("{}\n", pointer).as_bytes())
            .await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&scratch, &path).await?;
        Ok(())
    }

    /// The root of the working tree as of the last flush; zero for a brand
    /// new filesystem.
    pub async fn local_root_pointer(&self) -> Result<Pointer, Error> {
        self.read_pointer_file(ROOT_FILE).await
    }

    pub async fn set_local_root_pointer(&self, pointer: &Pointer) -> Result<(), Error> {
        self.write_pointer_file(ROOT_FILE, pointer).await
    }

    /// The most recent revision reflected in the working tree's ancestry.
    pub async fn local_base_pointer(&self) -> Result<Pointer, Error> {
        self.read_pointer_file(LOCAL_BASE_FILE).await
    }

    pub async fn set_local_base_pointer(&self, pointer: &Pointer) -> Result<(), Error> {
        self.write_pointer_file(LOCAL_BASE_FILE, pointer).await
    }

    /// The most recent revision known to have been pushed.
    pub async fn remote_base_pointer(&self) -> Result<Pointer, Error> {
        self.read_pointer_file(REMOTE_BASE_FILE).await
    }

    pub async fn set_remote_base_pointer(&self, pointer: &Pointer) -> Result<(), Error> {
        self.write_pointer_file(REMOTE_BASE_FILE, pointer).await
    }

    pub(super) async fn store_node_body(&self, bytes: &[u8]) -> Result<Pointer, Error> {
        Ok(self.factory.seal_bytes(bytes).await?)
    }

    pub(super) async fn load_node_body(&self, pointer: &Pointer) -> Result<Bytes, Error> {
        Ok(self.factory.open_bytes(pointer).await?)
    }

    #[instrument(skip_all, fields(revision.root = %revision.root()))]
    pub async fn store_revision(&self, revision: &Revision) -> Result<Pointer, Error> {
        let bytes = revision.marshal()?;
        Ok(self.factory.seal_bytes(&bytes).await?)
    }

    pub async fn load_revision(&self, pointer: &Pointer) -> Result<Revision, Error> {
        let bytes = self.factory.open_bytes(pointer).await?;
        Revision::unmarshal(pointer, &bytes)
    }
}
