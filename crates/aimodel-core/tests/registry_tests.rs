//! Civitai client and the manager facade against a fake registry API.

mod common;

use aimodel_core::library::{ACTIVATION_TEXT_KEY, DESCRIPTION_KEY, SD_VERSION_KEY};
use aimodel_core::network::HttpClient;
use aimodel_core::{
    AimodelError, CivitaiClient, Classification, DownloadOutcome, ModelManager, ModelRegistry,
    RetryPolicy, ScanOptions, Settings, Sidecar,
};
use common::{payload, sha256_hex, TestServer, PREVIEW_BYTES};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

const SIZE: usize = 64 * 1024;

fn client(server: &TestServer) -> CivitaiClient {
    CivitaiClient::new(
        HttpClient::with_timeout(Duration::from_secs(5)).unwrap(),
        server.api_base(),
        RetryPolicy::none(),
    )
}

fn settings(server: &TestServer, root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.api_base_url = server.api_base();
    settings.default_download_path = root.to_path_buf();
    settings.timeout_secs = 5;
    settings.retry_base_delay_ms = 10;
    settings
}

#[tokio::test]
async fn test_identify_by_hash() {
    let content = payload(SIZE);
    let server = TestServer::start(content.clone()).await;
    server.add_model(42, 420, "Neon", "LORA");
    let client = client(&server);

    let matched = client
        .identify_by_hash(&sha256_hex(&content))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((matched.model_id, matched.version_id), (42, 420));
    assert_eq!(matched.model_name.as_deref(), Some("Neon"));
    assert_eq!(matched.model_type.as_deref(), Some("LORA"));
    let file = matched.file.unwrap();
    assert_eq!(file.sha256, Some(sha256_hex(&content)));
    assert_eq!(file.size_bytes, Some(SIZE as u64));

    let unknown = client.identify_by_hash(&"ab".repeat(32)).await.unwrap();
    assert!(unknown.is_none());
}

#[tokio::test]
async fn test_model_versions_and_missing_model() {
    let server = TestServer::start(payload(SIZE)).await;
    server.add_model(42, 420, "Neon", "LORA");
    let newer = server.version_json(42, 421, "2024-06-01T00:00:00Z");
    server.state.models.lock().unwrap().get_mut(&42).unwrap()["modelVersions"]
        .as_array_mut()
        .unwrap()
        .insert(0, newer);
    let client = client(&server);

    let versions = client.list_versions(42).await.unwrap();
    let ids: Vec<u64> = versions.iter().map(|v| v.version_id).collect();
    assert_eq!(ids, vec![420, 421]);

    let model = client.get_model(42).await.unwrap();
    assert_eq!(model.latest_version().unwrap().version_id, 421);

    let err = client.get_model(7).await.unwrap_err();
    assert!(matches!(err, AimodelError::NotFound { .. }));
}

#[tokio::test]
async fn test_resolve_download_url_follows_one_redirect() {
    let content = payload(SIZE);
    let server = TestServer::start(content.clone()).await;
    server.add_model(42, 420, "Neon", "LORA");

    let resolved = client(&server)
        .resolve_download_url(420, None)
        .await
        .unwrap();

    assert_eq!(resolved.url, server.url("/files/model.bin?token=signed"));
    assert_eq!(resolved.expected_size, Some(SIZE as u64));
    assert_eq!(resolved.expected_hash, Some(sha256_hex(&content)));
    assert_eq!(resolved.file_name, "Neon: Style?.safetensors");
}

#[tokio::test]
async fn test_login_redirect_requires_api_key() {
    let server = TestServer::start(payload(SIZE)).await;
    server.add_model(42, 420, "Neon", "LORA");
    server.state.models.lock().unwrap().get_mut(&42).unwrap()["modelVersions"][0]["files"][0]
        ["downloadUrl"] = server.url("/api/v1/download/private/420").into();

    let err = client(&server)
        .resolve_download_url(420, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AimodelError::AuthRequired { .. }));
}

#[tokio::test]
async fn test_download_model_writes_file_sidecar_and_preview() {
    let content = payload(SIZE);
    let server = TestServer::start(content.clone()).await;
    server.add_model(42, 420, "Neon", "LORA");
    let temp = TempDir::new().unwrap();

    let manager = ModelManager::builder(settings(&server, temp.path()))
        .build()
        .unwrap();
    let outcome = manager.download_model(42, None, None, None).await.unwrap();

    let DownloadOutcome::Completed { path, digest, .. } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(path, temp.path().join("Lora").join("Neon Style.safetensors"));
    assert_eq!(digest, Some(sha256_hex(&content)));
    assert_eq!(std::fs::read(&path).unwrap(), content);

    let sidecar = Sidecar::load(&path).unwrap().unwrap();
    assert_eq!(sidecar.identity(), Some((42, 420)));
    assert_eq!(sidecar.model_type.as_deref(), Some("LORA"));
    assert_eq!(sidecar.extra_str(ACTIVATION_TEXT_KEY), Some("neon style"));
    assert_eq!(sidecar.extra_str(SD_VERSION_KEY), Some("SDXL"));
    assert_eq!(
        sidecar.extra_str(DESCRIPTION_KEY),
        Some("A guide https://example.com/guide")
    );
    assert_eq!(
        std::fs::read(Sidecar::preview_path_for(&path)).unwrap(),
        PREVIEW_BYTES
    );

    // The verified digest seeds the hash cache and the identity, so a scan
    // neither reads the file nor calls the registry.
    let hashed = manager.hash_file(&path).await.unwrap();
    assert!(hashed.from_cache);
    let before = server.state.api_requests.load(Ordering::SeqCst);
    let report = manager
        .scan_all(&temp.path().join("Lora"), ScanOptions::default())
        .await;
    assert_eq!(report.models.len(), 1);
    assert!(report.models[0].fully_cached());
    assert_eq!(server.state.api_requests.load(Ordering::SeqCst), before);

    // Downloading again over an existing file needs overwrite_existing.
    let err = manager
        .download_model(42, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AimodelError::Config { .. }));
}

#[tokio::test]
async fn test_check_updates_and_download_update() {
    let content = payload(SIZE);
    let server = TestServer::start(content.clone()).await;
    server.add_model(42, 420, "Neon", "LORA");
    let temp = TempDir::new().unwrap();

    let manager = ModelManager::builder(settings(&server, temp.path()))
        .build()
        .unwrap();
    manager.download_model(42, None, None, None).await.unwrap();
    let lora_dir = manager.model_dir("LORA");

    let report = manager
        .check_updates(&lora_dir, ScanOptions::default())
        .await;
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].classification, Classification::UpToDate);

    let newer = server.version_json(42, 421, "2024-06-01T00:00:00Z");
    server.state.models.lock().unwrap().get_mut(&42).unwrap()["modelVersions"]
        .as_array_mut()
        .unwrap()
        .push(newer);

    let report = manager
        .check_updates(&lora_dir, ScanOptions::default())
        .await;
    let entry = report.updates().next().unwrap();
    let Classification::UpdateAvailable(target) = &entry.classification else {
        unreachable!();
    };
    assert_eq!(target.version_id, 421);

    let update_dir = temp.path().join("updates");
    let outcome = manager
        .download_update(entry, None, Some(update_dir.as_path()))
        .await
        .unwrap();
    let DownloadOutcome::Completed { path, .. } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(path, update_dir.join("Neon Style.safetensors"));
    let sidecar = Sidecar::load(&path).unwrap().unwrap();
    assert_eq!(sidecar.identity(), Some((42, 421)));
    assert_eq!(sidecar.model_name.as_deref(), Some("Neon"));
}

#[tokio::test]
async fn test_update_file_in_place_and_pick_a_version() {
    let content = payload(SIZE);
    let server = TestServer::start(content.clone()).await;
    server.add_model(42, 420, "Neon", "LORA");
    let temp = TempDir::new().unwrap();

    let mut settings = settings(&server, temp.path());
    settings.overwrite_existing = true;
    let manager = ModelManager::builder(settings).build().unwrap();
    let DownloadOutcome::Completed { path, .. } =
        manager.download_model(42, None, None, None).await.unwrap()
    else {
        panic!("expected completion");
    };

    let current = manager.update_file(&path, None).await.unwrap();
    assert_eq!(current.entry.classification, Classification::UpToDate);
    assert!(current.download.is_none());

    let newer = server.version_json(42, 421, "2024-06-01T00:00:00Z");
    server.state.models.lock().unwrap().get_mut(&42).unwrap()["modelVersions"]
        .as_array_mut()
        .unwrap()
        .push(newer);

    let updated = manager.update_file(&path, None).await.unwrap();
    assert!(matches!(
        updated.entry.classification,
        Classification::UpdateAvailable(ref target) if target.version_id == 421
    ));
    assert!(matches!(
        updated.download,
        Some(DownloadOutcome::Completed { path: ref saved, .. }) if *saved == path
    ));
    assert_eq!(Sidecar::load(&path).unwrap().unwrap().identity(), Some((42, 421)));

    // An explicit version is fetched even when the file is current.
    let pinned = manager.update_file(&path, Some(420)).await.unwrap();
    assert_eq!(pinned.entry.classification, Classification::UpToDate);
    assert!(pinned.download.is_some());
    assert_eq!(Sidecar::load(&path).unwrap().unwrap().identity(), Some((42, 420)));

    let err = manager.update_file(&path, Some(999)).await.unwrap_err();
    assert!(matches!(err, AimodelError::NotFound { .. }));
}

#[tokio::test]
async fn test_model_info_and_local_info() {
    let content = payload(SIZE);
    let server = TestServer::start(content.clone()).await;
    server.add_model(42, 420, "Neon", "LORA");
    let temp = TempDir::new().unwrap();

    let manager = ModelManager::builder(settings(&server, temp.path()))
        .build()
        .unwrap();
    let model = manager.model_info(42).await.unwrap();
    assert_eq!(model.name, "Neon");
    assert_eq!(model.versions.len(), 1);

    let DownloadOutcome::Completed { path, .. } =
        manager.download_model(42, None, None, None).await.unwrap()
    else {
        panic!("expected completion");
    };
    let info = manager.local_info(&path).await.unwrap();
    assert_eq!(info.size, SIZE as u64);
    assert_eq!(info.model_type, "LORA");
    let sidecar = info.sidecar.unwrap();
    assert_eq!(sidecar.sha256, Some(sha256_hex(&content)));
    assert_eq!(sidecar.extra_str(SD_VERSION_KEY), Some("SDXL"));

    // Without a sidecar the type is guessed from the folder name.
    let loose = temp.path().join("embeddings").join("loose.pt");
    std::fs::create_dir_all(loose.parent().unwrap()).unwrap();
    std::fs::write(&loose, b"weights").unwrap();
    let info = manager.local_info(&loose).await.unwrap();
    assert!(info.sidecar.is_none());
    assert_eq!(info.model_type, "TextualInversion");

    let err = manager
        .local_info(&temp.path().join("missing.pt"))
        .await
        .unwrap_err();
    assert!(matches!(err, AimodelError::Io { .. }));
}
