use std::sync::Arc;

use url::Url;

use super::{DiskStore, Error, MemoryStore, Store};

/// Constructs a [Store] from a URI, as given by the `remote-store`
/// configuration option.
///
/// The following schemes are supported:
/// - `memory://` ([MemoryStore])
/// - `disk:///some/path` ([DiskStore])
pub async fn from_addr(uri: &str) -> Result<Arc<dyn Store>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    Ok(match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Arc::new(MemoryStore::default())
        }
        "disk" => {
            if url.has_host() {
                return Err(Error::StorageError("no host allowed".to_string()));
            }
            if url.path().is_empty() || url.path() == "/" {
                return Err(Error::StorageError("invalid disk store path".to_string()));
            }
            Arc::new(DiskStore::new(url.path().into()).await?)
        }
        scheme => {
            return Err(Error::StorageError(format!("unknown scheme: {}", scheme)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::from_addr;

    async fn check(uri: &str, is_ok: bool) {
        assert_eq!(from_addr(uri).await.is_ok(), is_ok, "{}", uri);
    }

    #[tokio::test]
    async fn schemes() {
        check("memory://", true).await;
        check("memory://host", false).await;
        check("memory:///", false).await;
        check("http://foo.example/test", false).await;
        check("disk://", false).await;
        check("disk:///", false).await;
        check("disk://host/tmp/x", false).await;

        let dir = tempfile::tempdir().unwrap();
        check(&format!("disk://{}", dir.path().display()), true).await;
    }
}
