//! Directory scans against a counting in-memory registry.

mod common;

use aimodel_core::{
    FailureKind, Identification, LocalModelIndex, ScanItem, ScanOptions, Settings, Sidecar,
    UnidentifiedReason,
};
use common::{sha256_hex, CountingRegistry};
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const KNOWN: &[u8] = b"known model weights";
const UNKNOWN: &[u8] = b"some other weights";

fn setup() -> (TempDir, Arc<CountingRegistry>, LocalModelIndex) {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("known.safetensors"), KNOWN).unwrap();
    std::fs::write(temp.path().join("mystery.pt"), UNKNOWN).unwrap();
    std::fs::write(temp.path().join("readme.txt"), b"not a model").unwrap();

    let registry = Arc::new(CountingRegistry::default());
    registry.add_match(&sha256_hex(KNOWN), 11, 110);
    let index = LocalModelIndex::new(registry.clone(), Settings::default());
    (temp, registry, index)
}

fn options() -> ScanOptions {
    ScanOptions {
        recursive: true,
        refresh: false,
    }
}

#[tokio::test]
async fn test_scan_identifies_and_persists() {
    let (temp, registry, index) = setup();

    let report = index.scan_all(temp.path(), options()).await;

    assert!(report.failures.is_empty());
    assert_eq!(report.models.len(), 2);
    assert_eq!(registry.identify_count(), 2);

    let known = report.identified().next().unwrap();
    assert_eq!(known.identity(), Some((11, 110)));
    assert_eq!(known.file.content_hash, sha256_hex(KNOWN));
    assert_eq!(known.file.remote_version_id, Some(110));

    let mystery = report.unidentified().next().unwrap();
    assert_eq!(
        mystery.identification,
        Identification::Unidentified {
            reason: UnidentifiedReason::UnknownHash,
            from_cache: false
        }
    );

    let sidecar = Sidecar::load(&temp.path().join("known.safetensors"))
        .unwrap()
        .unwrap();
    assert_eq!(sidecar.identity(), Some((11, 110)));
    assert_eq!(sidecar.model_name.as_deref(), Some("Model 11"));
    assert!(sidecar.hash_cache.is_some());
    assert!(!temp.path().join("readme.json").exists());
}

#[tokio::test]
async fn test_second_scan_does_no_work() {
    let (temp, registry, index) = setup();
    index.scan_all(temp.path(), options()).await;

    let report = index.scan_all(temp.path(), options()).await;

    assert_eq!(registry.identify_count(), 2);
    assert_eq!(report.models.len(), 2);
    assert!(report.models.iter().all(|m| m.fully_cached()));
    assert_eq!(report.identified().count(), 1);
}

#[tokio::test]
async fn test_refresh_asks_registry_but_reuses_hash() {
    let (temp, registry, index) = setup();
    index.scan_all(temp.path(), options()).await;

    let report = index
        .scan_all(
            temp.path(),
            ScanOptions {
                recursive: true,
                refresh: true,
            },
        )
        .await;

    assert_eq!(registry.identify_count(), 4);
    assert!(report.models.iter().all(|m| m.hash_from_cache));
    assert!(report.models.iter().all(|m| !m.fully_cached()));
}

#[tokio::test]
async fn test_changed_file_is_rehashed_and_reidentified() {
    let (temp, registry, index) = setup();
    index.scan_all(temp.path(), options()).await;

    let path = temp.path().join("mystery.pt");
    std::fs::write(&path, KNOWN).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    drop(file);

    let report = index.scan_all(temp.path(), options()).await;

    assert_eq!(registry.identify_count(), 3);
    let changed = report
        .models
        .iter()
        .find(|m| m.file.path == path)
        .unwrap();
    assert!(!changed.hash_from_cache);
    assert_eq!(changed.identity(), Some((11, 110)));
}

#[tokio::test]
async fn test_unavailable_registry_is_not_cached() {
    let (temp, registry, index) = setup();
    registry.unavailable.store(true, Ordering::SeqCst);

    let report = index.scan_all(temp.path(), options()).await;

    assert!(report.failures.is_empty());
    assert!(report.models.iter().all(|m| matches!(
        m.identification,
        Identification::Unidentified {
            reason: UnidentifiedReason::RegistryUnavailable,
            ..
        }
    )));

    registry.unavailable.store(false, Ordering::SeqCst);
    let report = index.scan_all(temp.path(), options()).await;

    assert_eq!(registry.identify_count(), 4);
    assert_eq!(report.identified().count(), 1);
}

#[tokio::test]
async fn test_non_recursive_scan_skips_subdirectories() {
    let (temp, registry, index) = setup();
    let nested = temp.path().join("nested");
    std::fs::create_dir(&nested).unwrap();
    std::fs::write(nested.join("deep.ckpt"), b"deep weights").unwrap();

    let shallow = index
        .scan_all(
            temp.path(),
            ScanOptions {
                recursive: false,
                refresh: false,
            },
        )
        .await;
    assert_eq!(shallow.models.len(), 2);

    let deep = index.scan_all(temp.path(), options()).await;
    assert_eq!(deep.models.len(), 3);
    assert_eq!(registry.identify_count(), 3);
}

#[tokio::test]
async fn test_scan_is_lazy() {
    let (temp, registry, index) = setup();

    let mut items = index.scan(temp.path(), options());
    let first = items.next().await.unwrap();

    assert!(matches!(first, ScanItem::Indexed(_)));
    assert_eq!(registry.identify_count(), 1);
    drop(items);
}

#[tokio::test]
async fn test_single_file_and_missing_root() {
    let (temp, _registry, index) = setup();

    let single = index
        .scan_all(&temp.path().join("known.safetensors"), options())
        .await;
    assert_eq!(single.models.len(), 1);

    let wrong_type = index
        .scan_all(&temp.path().join("readme.txt"), options())
        .await;
    assert_eq!(wrong_type.failures[0].kind, FailureKind::Config);

    let missing = index
        .scan_all(Path::new("/definitely/not/here"), options())
        .await;
    assert!(missing.models.is_empty());
    assert_eq!(missing.failures.len(), 1);
    assert_eq!(missing.failures[0].kind, FailureKind::Io);
}

#[tokio::test]
async fn test_files_sharing_a_stem_are_cached_separately() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("model.safetensors"), b"tensor weights").unwrap();
    std::fs::write(temp.path().join("model.ckpt"), b"pickled weights").unwrap();

    let registry = Arc::new(CountingRegistry::default());
    registry.add_match(&sha256_hex(b"tensor weights"), 11, 110);
    registry.add_match(&sha256_hex(b"pickled weights"), 12, 120);
    let index = LocalModelIndex::new(registry.clone(), Settings::default());

    let first = index.scan_all(temp.path(), options()).await;
    assert_eq!(first.identified().count(), 2);
    assert_eq!(registry.identify_count(), 2);

    let second = index.scan_all(temp.path(), options()).await;
    assert_eq!(registry.identify_count(), 2);
    assert!(second.models.iter().all(|m| m.fully_cached()));

    let identity_of = |name: &str| {
        second
            .models
            .iter()
            .find(|m| m.file.path.ends_with(name))
            .and_then(|m| m.identity())
    };
    assert_eq!(identity_of("model.safetensors"), Some((11, 110)));
    assert_eq!(identity_of("model.ckpt"), Some((12, 120)));
}
