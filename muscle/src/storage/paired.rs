use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, instrument, warn};

use super::{Error, Store};
use crate::Pointer;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Couples a fast (local, durable) [Store] with a slow (remote) one.
///
/// `put` writes through to the fast store and appends the pointer to a
/// durable propagation log; a background task copies logged blocks to the
/// slow store in order, retrying forever. `get` reads through: a slow-store
/// hit populates the fast store before returning.
///
/// A pointer is visible to local readers immediately after `put` returns; it
/// becomes visible to remote readers only once propagated. [Self::drain]
/// completes the log in the foreground, which `push` relies on before
/// declaring a revision reachable.
pub struct PairedStore {
    fast: Arc<dyn Store>,
    slow: Arc<dyn Store>,
    log: Mutex<PropagationLog>,
    // Serializes consumers of the log head (the propagator task and drain),
    // so an entry is popped by the same consumer that copied it.
    consume: Mutex<()>,
    notify: Notify,
}

struct PropagationLog {
    file: tokio::fs::File,
    pending: VecDeque<Pointer>,
}

impl PairedStore {
    /// Opens the propagation log (creating it if absent) and loads any
    /// entries left over from a previous run. Call [Self::spawn_propagator]
    /// right away so a crash mid-push is recovered without waiting for the
    /// next local write.
    pub async fn new(
        fast: Arc<dyn Store>,
        slow: Arc<dyn Store>,
        log_path: &Path,
    ) -> Result<Self, Error> {
        let mut pending = VecDeque::new();
        match tokio::fs::read_to_string(log_path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.is_empty()) {
                    let pointer = Pointer::from_hex(line).map_err(|e| {
                        Error::StorageError(format!(
                            "corrupt propagation log {:?}: {}",
                            log_path, e
                        ))
                    })?;
                    pending.push_back(pointer);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        if !pending.is_empty() {
            debug!(backlog = pending.len(), "resuming propagation log");
        }
        Ok(Self {
            fast,
            slow,
            log: Mutex::new(PropagationLog { file, pending }),
            consume: Mutex::new(()),
            notify: Notify::new(),
        })
    }

    /// Starts the background propagator. It runs until the process exits,
    /// backing off exponentially on slow-store failures; it never fails a
    /// foreground operation.
    pub fn spawn_propagator(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match this.propagate_next().await {
                    Ok(true) => backoff = INITIAL_BACKOFF,
                    Ok(false) => this.notify.notified().await,
                    Err(e) => {
                        warn!(backoff = ?backoff, "propagation failed: {}", e);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    }

    /// Propagates every logged block to the slow store, in the foreground.
    /// On return the propagation log is empty.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<(), Error> {
        while self.propagate_next().await? {}
        Ok(())
    }

    /// Number of blocks still awaiting propagation.
    pub async fn pending(&self) -> usize {
        self.log.lock().await.pending.len()
    }

    /// Copies the block at the head of the log to the slow store and pops
    /// it; truncates the log file once fully drained. Returns false when
    /// there is nothing left to do.
    async fn propagate_next(&self) -> Result<bool, Error> {
        let _consumer = self.consume.lock().await;
        let head = self.log.lock().await.pending.front().cloned();
        let Some(pointer) = head else {
            return Ok(false);
        };
        let data = self.fast.get(&pointer).await?.ok_or_else(|| {
            Error::StorageError(format!("pending block {} missing from fast store", pointer))
        })?;
        self.slow.put(&pointer, data).await?;
        let mut log = self.log.lock().await;
        log.pending.pop_front();
        if log.pending.is_empty() {
            // Fully drained: the file's entries are all propagated, so the
            // whole prefix can go. A crash before this point replays the
            // suffix; slow-store puts are idempotent.
            log.file.set_len(0).await?;
            log.file.sync_data().await?;
        }
        Ok(true)
    }
}

#[async_trait]
impl Store for PairedStore {
    #[instrument(skip(self), fields(blob.pointer = %pointer))]
    async fn get(&self, pointer: &Pointer) -> Result<Option<Bytes>, Error> {
        if let Some(data) = self.fast.get(pointer).await? {
            return Ok(Some(data));
        }
        match self.slow.get(pointer).await? {
            None => Ok(None),
            Some(data) => {
                // Read-through: keep a local copy so the next read is fast.
                // Not logged for propagation; it came from the remote.
                self.fast.put(pointer, data.clone()).await?;
                Ok(Some(data))
            }
        }
    }

    #[instrument(skip(self, data), fields(blob.pointer = %pointer, blob.len = data.len()))]
    async fn put(&self, pointer: &Pointer, data: Bytes) -> Result<(), Error> {
        self.fast.put(pointer, data).await?;
        let mut log = self.log.lock().await;
        log.file
            .write_all(format!("{}\n", pointer).as_bytes())
            .await?;
        log.file.sync_data().await?;
        log.pending.push_back(pointer.clone());
        drop(log);
        self.notify.notify_one();
        Ok(())
    }

    #[instrument(skip(self), fields(blob.pointer = %pointer))]
    async fn delete(&self, pointer: &Pointer) -> Result<(), Error> {
        // Remote blocks are never deleted here; collecting unreachable
        // remote blocks requires coordination with the propagation log.
        self.fast.delete(pointer).await
    }

    async fn contains(&self, pointer: &Pointer) -> Result<bool, Error> {
        Ok(self.fast.contains(pointer).await? || self.slow.contains(pointer).await?)
    }
}
