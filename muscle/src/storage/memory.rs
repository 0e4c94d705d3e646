use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

use super::{Error, Store};
use crate::Pointer;

/// An in-memory [Store], used by tests and by `memory://` remotes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    db: Arc<RwLock<HashMap<Pointer, Bytes>>>,
}

#[async_trait]
impl Store for MemoryStore {
    #[instrument(skip(self), fields(blob.pointer = %pointer))]
    async fn get(&self, pointer: &Pointer) -> Result<Option<Bytes>, Error> {
        let db = self.db.read()?;
        Ok(db.get(pointer).cloned())
    }

    #[instrument(skip(self, data), fields(blob.pointer = %pointer, blob.len = data.len()))]
    async fn put(&self, pointer: &Pointer, data: Bytes) -> Result<(), Error> {
        let mut db = self.db.write()?;
        db.insert(pointer.clone(), data);
        Ok(())
    }

    #[instrument(skip(self), fields(blob.pointer = %pointer))]
    async fn delete(&self, pointer: &Pointer) -> Result<(), Error> {
        let mut db = self.db.write()?;
        db.remove(pointer);
        Ok(())
    }

    async fn contains(&self, pointer: &Pointer) -> Result<bool, Error> {
        let db = self.db.read()?;
        Ok(db.contains_key(pointer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_put_delete() {
        let store = MemoryStore::default();
        let p = Pointer::of(b"hello");

        assert_eq!(store.get(&p).await.unwrap(), None);
        assert!(!store.contains(&p).await.unwrap());

        store.put(&p, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(
            store.get(&p).await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert!(store.contains(&p).await.unwrap());

        store.delete(&p).await.unwrap();
        assert_eq!(store.get(&p).await.unwrap(), None);

        // deleting twice is fine
        store.delete(&p).await.unwrap();
    }
}
