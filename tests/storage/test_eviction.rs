use chrono::Utc;
use hybrid_model_loader::{
    sha256_hex, ArtifactMetadata, ArtifactStore, CodecRegistry, StoreConfig, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn open_store(dir: &TempDir, max_bytes: u64, max_artifacts: usize) -> ArtifactStore {
    let config = StoreConfig {
        root_dir: dir.path().to_path_buf(),
        max_storage_bytes: max_bytes,
        max_artifacts,
        ..StoreConfig::default()
    };
    ArtifactStore::open(config, Arc::new(CodecRegistry::with_defaults()))
        .await
        .unwrap()
}

// "none" compression keeps stored size equal to payload size, which makes
// the quota arithmetic in these tests exact.
fn metadata_for(id: &str, payload: &[u8]) -> ArtifactMetadata {
    let now = Utc::now();
    ArtifactMetadata {
        id: id.to_string(),
        name: id.to_string(),
        version: "1.0".to_string(),
        artifact_type: "model".to_string(),
        description: String::new(),
        tags: Vec::new(),
        created_at: now,
        updated_at: now,
        compression: "none".to_string(),
        checksum: sha256_hex(payload),
        size_bytes: payload.len() as u64,
    }
}

async fn save_sized(store: &ArtifactStore, id: &str, size: usize) {
    let payload = vec![0xABu8; size];
    store
        .save(id, &payload, metadata_for(id, &payload))
        .await
        .unwrap();
    // Keep last-accessed timestamps strictly ordered between saves
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn test_lru_eviction_frees_room_for_new_artifact() {
    let dir = TempDir::new().unwrap();
    // 10KB quota, default 0.8 cleanup threshold -> evict above 8KB projected
    let store = open_store(&dir, 10_000, 16).await;

    save_sized(&store, "oldest", 4_000).await;
    save_sized(&store, "newer", 5_000).await;

    // 9KB cached + 2KB incoming crosses the threshold; the LRU artifact goes
    save_sized(&store, "incoming", 2_000).await;

    assert!(!store.contains("oldest").await);
    assert!(store.contains("newer").await);
    assert!(store.contains("incoming").await);

    let status = store.status().await;
    assert_eq!(status.used_bytes, 7_000);
    assert!(status.last_cleanup.is_some());
}

#[tokio::test]
async fn test_recently_loaded_artifact_is_not_the_victim() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10_000, 16).await;

    save_sized(&store, "first", 4_000).await;
    save_sized(&store, "second", 4_000).await;

    // Touch "first" so "second" becomes the least recently accessed
    store.load("first").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    save_sized(&store, "third", 3_000).await;

    assert!(store.contains("first").await);
    assert!(!store.contains("second").await);
    assert!(store.contains("third").await);
}

#[tokio::test]
async fn test_pinned_artifacts_are_never_evicted() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10_000, 16).await;

    save_sized(&store, "pinned-old", 4_000).await;
    store.pin("pinned-old").await.unwrap();
    save_sized(&store, "plain", 4_000).await;

    save_sized(&store, "incoming", 3_000).await;

    // The pinned artifact is older but survives; the unpinned one goes
    assert!(store.contains("pinned-old").await);
    assert!(!store.contains("plain").await);
    assert!(store.contains("incoming").await);
}

#[tokio::test]
async fn test_quota_exceeded_when_everything_is_pinned() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10_000, 16).await;

    save_sized(&store, "a", 5_000).await;
    store.pin("a").await.unwrap();
    save_sized(&store, "b", 4_000).await;
    store.pin("b").await.unwrap();

    let payload = vec![0xCDu8; 3_000];
    let err = store
        .save("c", &payload, metadata_for("c", &payload))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QuotaExceeded { .. }));

    // Failed save must leave the store untouched
    assert!(!store.contains("c").await);
    assert_eq!(store.status().await.used_bytes, 9_000);
}

#[tokio::test]
async fn test_pinned_save_allowed_above_threshold_within_quota() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10_000, 16).await;

    save_sized(&store, "a", 5_000).await;
    store.pin("a").await.unwrap();

    // 5K pinned + 4K incoming is above the 8K threshold but under the quota,
    // and there is nothing evictable, so the save still goes through.
    save_sized(&store, "b", 4_000).await;
    assert!(store.contains("a").await);
    assert!(store.contains("b").await);
    assert_eq!(store.status().await.used_bytes, 9_000);
}

#[tokio::test]
async fn test_artifact_count_limit_evicts_lru() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 1_000_000, 2).await;

    save_sized(&store, "one", 100).await;
    save_sized(&store, "two", 100).await;
    save_sized(&store, "three", 100).await;

    assert!(!store.contains("one").await);
    assert!(store.contains("two").await);
    assert!(store.contains("three").await);
    assert_eq!(store.status().await.total_artifacts, 2);
}

#[tokio::test]
async fn test_oversized_payload_rejected_outright() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10_000, 16).await;

    let payload = vec![0xEFu8; 20_000];
    let err = store
        .save("huge", &payload, metadata_for("huge", &payload))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QuotaExceeded { .. }));
}

#[tokio::test]
async fn test_replacing_artifact_does_not_double_count() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10_000, 16).await;

    save_sized(&store, "model", 6_000).await;
    // Same id again: its own bytes are reclaimed, no eviction needed
    save_sized(&store, "model", 7_000).await;

    let status = store.status().await;
    assert_eq!(status.total_artifacts, 1);
    assert_eq!(status.used_bytes, 7_000);
}
