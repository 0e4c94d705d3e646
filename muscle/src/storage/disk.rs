use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tracing::instrument;

use super::{Error, Store};
use crate::Pointer;

/// A [Store] backed by a directory on a POSIX filesystem.
///
/// Blobs land in `<root>/<hex[..2]>/<hex>`, sharded by the first byte of the
/// hex key. Writes are staged in `<root>/tmp` and moved into place with an
/// atomic rename, so readers never observe partial blobs.
#[derive(Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub async fn new(root: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(root.join("tmp")).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, pointer: &Pointer) -> PathBuf {
        let hex = pointer.hex();
        self.root.join(&hex[..2]).join(hex)
    }

    fn scratch_path(&self, pointer: &Pointer) -> PathBuf {
        let suffix: u64 = rand::thread_rng().gen();
        self.root
            .join("tmp")
            .join(format!("{}.{:016x}", pointer.short(), suffix))
    }
}

#[async_trait]
impl Store for DiskStore {
    #[instrument(skip(self), fields(blob.pointer = %pointer))]
    async fn get(&self, pointer: &Pointer) -> Result<Option<Bytes>, Error> {
        match tokio::fs::read(self.object_path(pointer)).await {
            Ok(data) => Ok(Some(data.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, data), fields(blob.pointer = %pointer, blob.len = data.len()))]
    async fn put(&self, pointer: &Pointer, data: Bytes) -> Result<(), Error> {
        let dst = self.object_path(pointer);
        let scratch = self.scratch_path(pointer);
        let mut file = tokio::fs::File::create(&scratch).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &data).await?;
        file.sync_all().await?;
        drop(file);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&scratch, &dst).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(blob.pointer = %pointer))]
    async fn delete(&self, pointer: &Pointer) -> Result<(), Error> {
        match tokio::fs::remove_file(self.object_path(pointer)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, pointer: &Pointer) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.object_path(pointer)).await?)
    }
}
