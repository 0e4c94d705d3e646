use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{pull_worklog, tree_diff, Error, Revision, Store, Tree};
use crate::block::Factory;
use crate::storage::{DiskStore, MemoryStore, PairedStore};
use crate::Pointer;

/// Small on purpose, so a few bytes of content span several blocks.
const BLOCK_SIZE: usize = 16;

async fn new_store(dir: &Path) -> Arc<Store> {
    let staging = Arc::new(DiskStore::new(dir.join("staging")).await.unwrap());
    let cache = Arc::new(DiskStore::new(dir.join("cache")).await.unwrap());
    let remote = Arc::new(MemoryStore::default());
    let paired = Arc::new(
        PairedStore::new(cache, remote, &dir.join("propagation.log"))
            .await
            .unwrap(),
    );
    let factory = Factory::new(staging, paired, &[1; 32], BLOCK_SIZE).unwrap();
    Arc::new(Store::new(factory, &dir.join("base")).await.unwrap())
}

async fn working(store: &Arc<Store>) -> Tree {
    Tree::with_root(store.clone(), Duration::from_secs(3600))
        .await
        .unwrap()
}

async fn read_all(tree: &mut Tree, id: super::NodeId) -> Vec<u8> {
    let size = tree.info(id).unwrap().size as usize;
    let mut buf = vec![0u8; size];
    let n = tree.read_at(id, &mut buf, 0).await.unwrap();
    buf.truncate(n);
    buf
}

async fn overwrite(tree: &mut Tree, id: super::NodeId, content: &[u8]) {
    tree.truncate(id, 0).await.unwrap();
    tree.write_at(id, content, 0).await.unwrap();
}

#[tokio::test]
async fn create_write_read_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();

    let f = t.add(root, "hello", 0o644).await.unwrap();
    t.write_at(f, b"world", 0).await.unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(t.read_at(f, &mut buf, 0).await.unwrap(), 5);
    assert_eq!(&buf, b"world");

    t.remove(f).await.unwrap();
    assert!(matches!(
        t.walk(root, &["hello"]).await,
        Err(Error::NotExist)
    ));
}

#[tokio::test]
async fn flush_and_reattach_round_trips_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;

    let sizes = [
        0,
        1,
        BLOCK_SIZE - 1,
        BLOCK_SIZE,
        BLOCK_SIZE + 1,
        10 * BLOCK_SIZE,
    ];
    {
        let mut t = working(&store).await;
        let root = t.attach();
        for (i, n) in sizes.iter().enumerate() {
            let f = t.add(root, &format!("f{}", i), 0o644).await.unwrap();
            let content: Vec<u8> = (0..*n).map(|j| (j % 251) as u8).collect();
            t.write_at(f, &content, 0).await.unwrap();
            assert_eq!(t.info(f).unwrap().size, *n as u64);
        }
        t.flush().await.unwrap();
    }
    // a fresh tree over the same store sees identical bytes
    let mut t = working(&store).await;
    let root = t.attach();
    for (i, n) in sizes.iter().enumerate() {
        let name = format!("f{}", i);
        let walked = t.walk(root, &[&name]).await.unwrap();
        assert_eq!(walked.len(), 1);
        let content = read_all(&mut t, walked[0]).await;
        let expect: Vec<u8> = (0..*n).map(|j| (j % 251) as u8).collect();
        assert_eq!(content, expect, "size {}", n);
    }
}

#[tokio::test]
async fn flush_and_reattach_nested() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    {
        let mut t = working(&store).await;
        let root = t.attach();
        let a = t.add(root, "a", super::DMDIR | 0o755).await.unwrap();
        let b = t.add(a, "b", super::DMDIR | 0o755).await.unwrap();
        let c = t.add(b, "c", 0o644).await.unwrap();
        t.write_at(c, b"x", 0).await.unwrap();
        t.flush().await.unwrap();
    }
    let mut t = working(&store).await;
    let root = t.attach();
    let walked = t.walk(root, &["a", "b", "c"]).await.unwrap();
    assert_eq!(walked.len(), 3);
    assert_eq!(read_all(&mut t, walked[2]).await, b"x");
}

#[tokio::test]
async fn overwrite_spanning_sealed_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let f = t.add(root, "f", 0o644).await.unwrap();

    let mut content: Vec<u8> = (0..40).map(|j| j as u8).collect();
    t.write_at(f, &content, 0).await.unwrap();
    t.flush().await.unwrap(); // seals three blocks

    // rewrite five bytes across the first block boundary
    t.write_at(f, &[0xaa; 5], 14).await.unwrap();
    content[14..19].copy_from_slice(&[0xaa; 5]);
    assert_eq!(read_all(&mut t, f).await, content);

    // and the rewrite survives a flush/reattach cycle
    t.flush().await.unwrap();
    let mut t2 = working(&store).await;
    let root2 = t2.attach();
    let walked = t2.walk(root2, &["f"]).await.unwrap();
    assert_eq!(read_all(&mut t2, walked[0]).await, content);
}

#[tokio::test]
async fn write_past_end_zero_fills() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let f = t.add(root, "sparse", 0o644).await.unwrap();

    t.write_at(f, b"end", (3 * BLOCK_SIZE) as u64).await.unwrap();
    assert_eq!(t.info(f).unwrap().size, 3 * BLOCK_SIZE as u64 + 3);
    let content = read_all(&mut t, f).await;
    assert!(content[..3 * BLOCK_SIZE].iter().all(|b| *b == 0));
    assert_eq!(&content[3 * BLOCK_SIZE..], b"end");
}

#[tokio::test]
async fn truncate_shrinks_and_extends() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let f = t.add(root, "t", 0o644).await.unwrap();

    let content: Vec<u8> = (0..40).map(|j| j as u8).collect();
    t.write_at(f, &content, 0).await.unwrap();
    t.flush().await.unwrap();

    t.truncate(f, 18).await.unwrap();
    assert_eq!(read_all(&mut t, f).await, &content[..18]);

    t.truncate(f, 24).await.unwrap();
    let extended = read_all(&mut t, f).await;
    assert_eq!(&extended[..18], &content[..18]);
    assert!(extended[18..].iter().all(|b| *b == 0));
    assert_eq!(extended.len(), 24);
}

#[tokio::test]
async fn version_strictly_increases() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let f = t.add(root, "v", 0o644).await.unwrap();

    let v1 = t.info(f).unwrap().version;
    t.write_at(f, b"data", 0).await.unwrap();
    let v2 = t.info(f).unwrap().version;
    assert!(v2 > v1);
    t.touch(f, 12345).unwrap();
    let v3 = t.info(f).unwrap().version;
    assert!(v3 > v2);
    t.set_perm(f, 0o600).unwrap();
    assert!(t.info(f).unwrap().version > v3);
}

#[tokio::test]
async fn names_are_unique_within_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();

    t.add(root, "x", 0o644).await.unwrap();
    assert!(matches!(
        t.add(root, "x", 0o644).await,
        Err(Error::Exists)
    ));

    let f = t.add(root, "y", 0o644).await.unwrap();
    assert!(matches!(t.set_name(f, "x"), Err(Error::Exists)));
    assert!(matches!(
        t.add(f, "under-a-file", 0o644).await,
        Err(Error::NotADir)
    ));
}

#[tokio::test]
async fn remove_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();

    let d = t.add(root, "d", super::DMDIR | 0o755).await.unwrap();
    t.add(d, "child", 0o644).await.unwrap();
    assert!(matches!(t.remove(d).await, Err(Error::NotEmpty)));
    assert!(matches!(t.remove(root).await, Err(Error::PermissionDenied)));

    // the merge flavor drops the whole subtree
    t.remove_for_merge(d).await.unwrap();
    assert!(matches!(t.walk(root, &["d"]).await, Err(Error::NotExist)));
}

#[tokio::test]
async fn walk_partial_and_dotdot() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let a = t.add(root, "a", super::DMDIR | 0o755).await.unwrap();
    t.add(a, "b", 0o644).await.unwrap();

    // proper prefix resolves without error
    let walked = t.walk(root, &["a", "nope", "deeper"]).await.unwrap();
    assert_eq!(walked, vec![a]);

    // nothing resolves: not-exist
    assert!(matches!(t.walk(root, &["zz"]).await, Err(Error::NotExist)));

    // dotdot, and dotdot at the root resolving to itself
    let walked = t.walk(a, &["..", "a", "b"]).await.unwrap();
    assert_eq!(walked.len(), 3);
    let walked = t.walk(root, &[".."]).await.unwrap();
    assert_eq!(walked, vec![root]);
}

#[tokio::test]
async fn unlinked_nodes_reject_access() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let f = t.add(root, "gone", 0o644).await.unwrap();
    t.ref_node(f, "test fid");
    t.remove(f).await.unwrap();

    assert!(t.is_unlinked(f));
    assert!(matches!(
        t.write_at(f, b"x", 0).await,
        Err(Error::Unlinked)
    ));
    let mut buf = [0u8; 1];
    assert!(matches!(
        t.read_at(f, &mut buf, 0).await,
        Err(Error::Unlinked)
    ));
    assert!(matches!(t.touch(f, 1), Err(Error::Unlinked)));

    // the arena entry goes with the last reference
    t.unref_node(f, "test fid");
    assert!(matches!(t.info(f), Err(Error::NotExist)));
}

#[tokio::test]
async fn rename_back_and_forth_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let f = t.add(root, "a", 0o644).await.unwrap();
    t.write_at(f, b"stable", 0).await.unwrap();
    t.flush().await.unwrap();
    let before = t.root_pointer();

    t.rename("a", "b").await.unwrap();
    t.rename("b", "a").await.unwrap();
    t.flush().await.unwrap();
    assert_eq!(t.root_pointer(), before);
}

#[tokio::test]
async fn rename_moves_across_directories() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let src = t.add(root, "src", super::DMDIR | 0o755).await.unwrap();
    t.add(root, "dst", super::DMDIR | 0o755).await.unwrap();
    let f = t.add(src, "file", 0o644).await.unwrap();
    t.write_at(f, b"moved", 0).await.unwrap();

    t.rename("src/file", "dst/renamed").await.unwrap();
    assert!(matches!(
        t.walk(root, &["src", "file"]).await.as_deref(),
        Ok([_]) // only src resolves
    ));
    let walked = t.walk(root, &["dst", "renamed"]).await.unwrap();
    assert_eq!(walked.len(), 2);
    assert_eq!(read_all(&mut t, walked[1]).await, b"moved");

    // destination collisions and cycles are rejected
    t.add(root, "other", 0o644).await.unwrap();
    assert!(matches!(
        t.rename("other", "dst/renamed").await,
        Err(Error::Exists)
    ));
    assert!(matches!(
        t.rename("dst", "dst/renamed/inside").await,
        Err(Error::Exists) | Err(Error::NotADir) | Err(Error::PermissionDenied)
    ));
}

#[tokio::test]
async fn trim_collapses_and_rehydrates() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let d = t.add(root, "d", super::DMDIR | 0o755).await.unwrap();
    let f = t.add(d, "f", 0o644).await.unwrap();
    t.write_at(f, b"resident", 0).await.unwrap();
    t.flush().await.unwrap();

    t.trim();
    // the subtree still reads back after collapsing
    let walked = t.walk(root, &["d", "f"]).await.unwrap();
    assert_eq!(walked.len(), 2);
    assert_eq!(read_all(&mut t, walked[1]).await, b"resident");
}

#[tokio::test]
async fn trim_spares_referenced_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let d = t.add(root, "d", super::DMDIR | 0o755).await.unwrap();
    let f = t.add(d, "f", 0o644).await.unwrap();
    t.flush().await.unwrap();
    t.ref_node(f, "open fid");

    t.trim();
    // the pinned node keeps its identity
    assert_eq!(t.info(f).unwrap().name, "f");
    assert_eq!(t.list_nodes_in_use(), vec!["/d/f".to_string()]);
}

#[tokio::test]
async fn graft_from_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let src = t.add(root, "src", super::DMDIR | 0o755).await.unwrap();
    let f = t.add(src, "file.txt", 0o644).await.unwrap();
    t.write_at(f, b"shared", 0).await.unwrap();
    t.flush().await.unwrap();

    let donor = t.node_pointer(f).unwrap();
    let copy = t.graft(root, &donor, "copy.txt").await.unwrap();
    assert_eq!(read_all(&mut t, copy).await, b"shared");
    assert!(matches!(
        t.graft(root, &donor, "copy.txt").await,
        Err(Error::Exists)
    ));

    // the new name survives flush and reattach
    t.flush().await.unwrap();
    let mut t2 = working(&store).await;
    let root2 = t2.attach();
    let walked = t2.walk(root2, &["copy.txt"]).await.unwrap();
    assert_eq!(read_all(&mut t2, walked[0]).await, b"shared");
}

// ---------------------------------------------------------------------
// Pull worklogs. History is built by flushing the working tree and storing
// revision records at three states: base, remote, local.

struct History {
    store: Arc<Store>,
    base_rev: Pointer,
    remote_rev: Pointer,
    local_rev: Pointer,
}

/// base: a = "base\n"; a remote edit and an optional local edit on top of
/// it. Mtimes are pinned so that equal content means equal pointers: bodies
/// embed the mtime, and these tests compare by pointer.
async fn build_history(
    dir: &Path,
    remote_change: &str,
    local_change: Option<&str>,
) -> History {
    let store = new_store(dir).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let a = t.add(root, "a", 0o644).await.unwrap();
    t.write_at(a, b"base\n", 0).await.unwrap();
    t.touch(a, 1000).unwrap();
    t.flush().await.unwrap();
    let base_rev = store
        .store_revision(&Revision::new(t.root_pointer(), Pointer::zero()))
        .await
        .unwrap();

    overwrite(&mut t, a, remote_change.as_bytes()).await;
    t.touch(a, 1000).unwrap();
    t.flush().await.unwrap();
    let remote_rev = store
        .store_revision(&Revision::new(t.root_pointer(), base_rev.clone()))
        .await
        .unwrap();

    // rebuild the local lineage from the base
    overwrite(&mut t, a, b"base\n").await;
    t.touch(a, 1000).unwrap();
    if let Some(content) = local_change {
        overwrite(&mut t, a, content.as_bytes()).await;
        t.touch(a, 1000).unwrap();
    }
    t.flush().await.unwrap();
    let local_rev = store
        .store_revision(&Revision::new(t.root_pointer(), base_rev.clone()))
        .await
        .unwrap();

    History {
        store,
        base_rev,
        remote_rev,
        local_rev,
    }
}

async fn worklog_for(h: &History) -> String {
    let mut w = Tree::with_revision(h.store.clone(), &h.local_rev).await.unwrap();
    let mut l = Tree::with_revision(h.store.clone(), &h.base_rev).await.unwrap();
    let mut r = Tree::with_revision(h.store.clone(), &h.remote_rev)
        .await
        .unwrap();
    pull_worklog(&mut w, &mut l, &mut r, &h.remote_rev)
        .await
        .unwrap()
}

#[tokio::test]
async fn pull_remote_only_change_grafts() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_history(dir.path(), "remote\n", None).await;
    let log = worklog_for(&h).await;
    let rev = h.remote_rev.hex();
    assert_eq!(log, format!("unlink a\ngraft {}/a a\n", rev));
}

#[tokio::test]
async fn pull_local_only_change_is_silent() {
    let dir = tempfile::tempdir().unwrap();
    // remote lineage re-records the base content: only local changed
    let h = build_history(dir.path(), "base\n", Some("local\n")).await;
    let log = worklog_for(&h).await;
    assert!(log.is_empty(), "unexpected worklog: {}", log);
}

#[tokio::test]
async fn pull_identical_changes_are_silent() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_history(dir.path(), "same\n", Some("same\n")).await;
    let log = worklog_for(&h).await;
    assert!(log.is_empty(), "unexpected worklog: {}", log);
}

#[tokio::test]
async fn pull_conflict_keeps_local_and_diffs() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_history(dir.path(), "remote\n", Some("local\n")).await;
    let log = worklog_for(&h).await;
    let rev = h.remote_rev.hex();
    assert!(log.contains(&format!("keep-local-for {}/a", rev)), "{}", log);
    assert!(log.contains("# -local"), "{}", log);
    assert!(log.contains("# +remote"), "{}", log);
}

#[tokio::test]
async fn pull_respects_keep_local_for() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_history(dir.path(), "remote\n", Some("local\n")).await;
    let mut w = Tree::with_revision(h.store.clone(), &h.local_rev).await.unwrap();
    let mut l = Tree::with_revision(h.store.clone(), &h.base_rev).await.unwrap();
    let mut r = Tree::with_revision(h.store.clone(), &h.remote_rev)
        .await
        .unwrap();
    w.ignore(&h.remote_rev.hex(), "a");
    let log = pull_worklog(&mut w, &mut l, &mut r, &h.remote_rev)
        .await
        .unwrap();
    assert!(log.is_empty(), "unexpected worklog: {}", log);
}

#[tokio::test]
async fn pull_remote_deletion_unlinks() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let mut t = working(&store).await;
    let root = t.attach();
    let a = t.add(root, "a", 0o644).await.unwrap();
    t.write_at(a, b"doomed\n", 0).await.unwrap();
    t.flush().await.unwrap();
    let base_rev = store
        .store_revision(&Revision::new(t.root_pointer(), Pointer::zero()))
        .await
        .unwrap();

    t.remove(a).await.unwrap();
    t.flush().await.unwrap();
    let remote_rev = store
        .store_revision(&Revision::new(t.root_pointer(), base_rev.clone()))
        .await
        .unwrap();

    let mut w = Tree::with_revision(store.clone(), &base_rev).await.unwrap();
    let mut l = Tree::with_revision(store.clone(), &base_rev).await.unwrap();
    let mut r = Tree::with_revision(store.clone(), &remote_rev).await.unwrap();
    let log = pull_worklog(&mut w, &mut l, &mut r, &remote_rev)
        .await
        .unwrap();
    assert_eq!(log, "unlink a\n");
}

#[tokio::test]
async fn diff_renders_changed_files() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_history(dir.path(), "remote\n", Some("local\n")).await;
    let mut w = Tree::with_revision(h.store.clone(), &h.local_rev).await.unwrap();
    let mut b = Tree::with_revision(h.store.clone(), &h.base_rev).await.unwrap();
    let diff = tree_diff(&mut w, &mut b, None, false).await.unwrap();
    assert!(diff.contains("-base"), "{}", diff);
    assert!(diff.contains("+local"), "{}", diff);
}
