//! Capability contract checks, run against every in-process backend kind.

use std::sync::Arc;

use polystore::adapter::{read_to_vec, write_bytes, KvAdapter, LocalAdapter, ObjectAdapter};
use polystore::{StorageAdapter, StorageError};
use tempfile::TempDir;

// === helpers ===

/// One adapter of each in-process kind; the temp dir keeps the local root alive.
async fn adapters() -> (TempDir, Vec<(&'static str, Arc<dyn StorageAdapter>)>) {
    let temp = tempfile::tempdir().unwrap();
    let local = LocalAdapter::open(temp.path()).await.unwrap();
    let adapters: Vec<(&'static str, Arc<dyn StorageAdapter>)> = vec![
        ("local", Arc::new(local)),
        ("object", Arc::new(ObjectAdapter::in_memory())),
        ("kv", Arc::new(KvAdapter::in_memory())),
    ];
    (temp, adapters)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

// === tests ===

#[tokio::test]
async fn test_write_then_read_is_identical() {
    let (_temp, adapters) = adapters().await;
    for (name, adapter) in adapters {
        for (path, len) in [("/small.txt", 5), ("/nested/deep/large.bin", 700_000), ("/empty", 0)] {
            let data = payload(len);
            let written = write_bytes(adapter.as_ref(), path, data.clone()).await.unwrap();
            assert_eq!(written, len as u64, "{} write {}", name, path);
            assert_eq!(read_to_vec(adapter.as_ref(), path).await.unwrap(), data, "{} read {}", name, path);
            assert_eq!(adapter.stat(path).await.unwrap().size, len as u64, "{} stat {}", name, path);
        }
    }
}

#[tokio::test]
async fn test_overwrite_replaces_content() {
    let (_temp, adapters) = adapters().await;
    for (name, adapter) in adapters {
        write_bytes(adapter.as_ref(), "/f.txt", "first version").await.unwrap();
        write_bytes(adapter.as_ref(), "/f.txt", "second").await.unwrap();
        assert_eq!(read_to_vec(adapter.as_ref(), "/f.txt").await.unwrap(), b"second", "{}", name);
    }
}

#[tokio::test]
async fn test_list_returns_every_child_under_directory() {
    let (_temp, adapters) = adapters().await;
    for (name, adapter) in adapters {
        adapter.make_container("/dir").await.unwrap();
        adapter.make_container("/dir/sub").await.unwrap();
        for i in 0..4 {
            write_bytes(adapter.as_ref(), &format!("/dir/file{}.txt", i), "x").await.unwrap();
        }
        write_bytes(adapter.as_ref(), "/dir/sub/inner.txt", "y").await.unwrap();

        let entries = adapter.list("/dir").await.unwrap();
        assert_eq!(entries.len(), 5, "{}: {:?}", name, entries);
        for entry in &entries {
            assert!(entry.path.starts_with("/dir/"), "{}: {}", name, entry.path);
        }
        assert_eq!(entries.iter().filter(|e| e.is_dir()).count(), 1, "{}", name);
    }
}

#[tokio::test]
async fn test_missing_entries_are_not_found() {
    let (_temp, adapters) = adapters().await;
    for (name, adapter) in adapters {
        assert!(
            matches!(adapter.stat("/nope.txt").await, Err(StorageError::NotFound(_))),
            "{} stat",
            name
        );
        assert!(adapter.read("/nope.txt").await.is_err(), "{} read", name);
    }
}

#[tokio::test]
async fn test_delete_is_recursive() {
    let (_temp, adapters) = adapters().await;
    for (name, adapter) in adapters {
        write_bytes(adapter.as_ref(), "/tree/a.txt", "a").await.unwrap();
        write_bytes(adapter.as_ref(), "/tree/b/c.txt", "c").await.unwrap();

        adapter.delete("/tree").await.unwrap();
        assert!(
            matches!(adapter.stat("/tree").await, Err(StorageError::NotFound(_))),
            "{}",
            name
        );
        assert!(adapter.stat("/tree/b/c.txt").await.is_err(), "{}", name);
    }
}

#[tokio::test]
async fn test_rename_and_copy() {
    let (_temp, adapters) = adapters().await;
    for (name, adapter) in adapters {
        write_bytes(adapter.as_ref(), "/src/one.txt", "one").await.unwrap();
        write_bytes(adapter.as_ref(), "/src/two/two.txt", "two").await.unwrap();

        let copied = adapter.copy("/src", "/copy", None).await.unwrap();
        assert_eq!(copied, 6, "{}", name);
        assert_eq!(read_to_vec(adapter.as_ref(), "/copy/two/two.txt").await.unwrap(), b"two");

        adapter.rename("/src", "/moved").await.unwrap();
        assert!(adapter.stat("/src/one.txt").await.is_err(), "{}", name);
        assert_eq!(read_to_vec(adapter.as_ref(), "/moved/one.txt").await.unwrap(), b"one");
        assert_eq!(adapter.usage("/moved").await.unwrap(), 6, "{}", name);
    }
}

#[tokio::test]
async fn test_space_is_never_an_error() {
    let (_temp, adapters) = adapters().await;
    for (name, adapter) in adapters {
        let space = adapter.space().await.unwrap();
        if let (Some(available), Some(total)) = (space.available, space.total) {
            assert!(available <= total, "{}", name);
        }
    }
}

#[tokio::test]
async fn test_local_root_containment() {
    let temp = tempfile::tempdir().unwrap();
    let data = temp.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(temp.path().join("secret.txt"), "outside").unwrap();

    let adapter = LocalAdapter::open(&data).await.unwrap();
    for path in ["../secret.txt", "../../etc/passwd", "/a/../../secret.txt"] {
        assert!(
            matches!(adapter.read(path).await, Err(StorageError::PermissionDenied(_))),
            "{}",
            path
        );
    }
    assert!(write_bytes(&adapter, "../escape.txt", "x").await.is_err());
    assert!(!temp.path().join("escape.txt").exists());
}
