//! Archive round trips across backends for every supported format.

use std::sync::Arc;

use polystore::adapter::{read_to_vec, write_bytes, KvAdapter, LocalAdapter, ObjectAdapter};
use polystore::archive::{ArchiveEngine, ArchiveFormat, CompressRequest, DecompressRequest};
use polystore::{StorageAdapter, StorageError, StorageRegistry};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// === helpers ===

async fn engine() -> (TempDir, Arc<StorageRegistry>, ArchiveEngine) {
    let temp = tempfile::tempdir().unwrap();
    let registry = Arc::new(StorageRegistry::new());
    registry
        .register("local", Arc::new(LocalAdapter::open(temp.path()).await.unwrap()))
        .unwrap();
    registry
        .register("object", Arc::new(ObjectAdapter::in_memory()))
        .unwrap();
    registry.register("kv", Arc::new(KvAdapter::in_memory())).unwrap();
    let engine = ArchiveEngine::new(registry.clone());
    (temp, registry, engine)
}

/// Relative path and contents of every file in the fixture tree
fn fixture() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("readme.md", b"# project\n".to_vec()),
        ("src/main.rs", b"fn main() { println!(\"hi\"); }\n".to_vec()),
        ("src/util/mod.rs", (0..200_000u32).map(|i| (i % 251) as u8).collect()),
        ("empty.txt", Vec::new()),
    ]
}

async fn seed(adapter: &dyn StorageAdapter) {
    for (path, data) in fixture() {
        write_bytes(adapter, &format!("/project/{}", path), data).await.unwrap();
    }
    adapter.make_container("/project/assets").await.unwrap();
}

// === tests ===

#[tokio::test]
async fn test_round_trip_every_format() {
    let (_temp, registry, engine) = engine().await;
    let object = registry.get("object").unwrap();
    let local = registry.get("local").unwrap();
    seed(object.as_ref()).await;
    let token = CancellationToken::new();

    for format in ArchiveFormat::ALL {
        let archive_path = format!("/out/project.{}", format.extension());
        let summary = engine
            .compress(
                &CompressRequest {
                    source_backend: "object".into(),
                    sources: vec!["/project".into()],
                    dest_backend: "kv".into(),
                    output_path: archive_path.clone(),
                    format: None,
                },
                None,
                &token,
            )
            .await
            .unwrap();
        assert_eq!(summary.format, format);
        assert_eq!(summary.files, fixture().len(), "{}", format);

        let listing = engine.list_archive("kv", &archive_path).await.unwrap();
        assert_eq!(listing.total_files, fixture().len(), "{}", format);
        assert!(listing.entries.iter().any(|e| e.is_dir && e.path == "project/assets"));

        let target = format!("/extract-{}", format.extension());
        let extracted = engine
            .decompress(
                &DecompressRequest {
                    source_backend: "kv".into(),
                    archive_path: archive_path.clone(),
                    dest_backend: "local".into(),
                    output_path: target.clone(),
                    create_subfolder: false,
                },
                None,
                &token,
            )
            .await
            .unwrap();
        assert_eq!(extracted.files, fixture().len(), "{}", format);

        for (path, data) in fixture() {
            let restored = read_to_vec(local.as_ref(), &format!("{}/project/{}", target, path))
                .await
                .unwrap();
            assert_eq!(restored, data, "{}: {}", format, path);
        }
        assert!(local
            .stat(&format!("{}/project/assets", target))
            .await
            .unwrap()
            .is_dir());
    }
}

#[tokio::test]
async fn test_decompress_into_subfolder() {
    let (_temp, registry, engine) = engine().await;
    let local = registry.get("local").unwrap();
    seed(local.as_ref()).await;
    let token = CancellationToken::new();

    engine
        .compress(
            &CompressRequest {
                source_backend: "local".into(),
                sources: vec!["/project/readme.md".into(), "/project/src".into()],
                dest_backend: "local".into(),
                output_path: "/bundle.tar.gz".into(),
                format: None,
            },
            None,
            &token,
        )
        .await
        .unwrap();

    let summary = engine
        .decompress(
            &DecompressRequest {
                source_backend: "local".into(),
                archive_path: "/bundle.tar.gz".into(),
                dest_backend: "object".into(),
                output_path: "/unpacked".into(),
                create_subfolder: true,
            },
            None,
            &token,
        )
        .await
        .unwrap();

    assert_eq!(summary.output_path, "/unpacked/bundle");
    let object = registry.get("object").unwrap();
    assert_eq!(
        read_to_vec(object.as_ref(), "/unpacked/bundle/readme.md").await.unwrap(),
        b"# project\n"
    );
    assert_eq!(
        read_to_vec(object.as_ref(), "/unpacked/bundle/src/main.rs").await.unwrap(),
        fixture()[1].1
    );
}

#[tokio::test]
async fn test_unsupported_extension_is_rejected() {
    let (_temp, registry, engine) = engine().await;
    seed(registry.get("kv").unwrap().as_ref()).await;
    let token = CancellationToken::new();

    let result = engine
        .compress(
            &CompressRequest {
                source_backend: "kv".into(),
                sources: vec!["/project".into()],
                dest_backend: "kv".into(),
                output_path: "/project.rar".into(),
                format: None,
            },
            None,
            &token,
        )
        .await;
    assert!(matches!(result, Err(StorageError::Unsupported(_))));
    assert!(registry.get("kv").unwrap().stat("/project.rar").await.is_err());

    let result = engine.list_archive("kv", "/project/readme.md").await;
    assert!(matches!(result, Err(StorageError::Unsupported(_))));
}

#[tokio::test]
async fn test_cancelled_compress_leaves_no_archive() {
    let (_temp, registry, engine) = engine().await;
    seed(registry.get("object").unwrap().as_ref()).await;
    let token = CancellationToken::new();
    token.cancel();

    let result = engine
        .compress(
            &CompressRequest {
                source_backend: "object".into(),
                sources: vec!["/project".into()],
                dest_backend: "object".into(),
                output_path: "/project.zip".into(),
                format: None,
            },
            None,
            &token,
        )
        .await;
    assert!(matches!(result, Err(StorageError::Cancelled)));
    assert!(registry.get("object").unwrap().stat("/project.zip").await.is_err());
}
