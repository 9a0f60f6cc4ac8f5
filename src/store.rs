// src/store.rs - On-disk artifact store with quota enforcement and LRU eviction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::compression::{CodecRegistry, CompressionError};

const INDEX_FILE: &str = "index.json";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Artifact not found: {id}")]
    NotFound { id: String },
    #[error("Checksum mismatch for {id} - expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("Quota exceeded - {required} bytes required, limit is {limit}")]
    QuotaExceeded { required: u64, limit: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Index corrupted: {reason}")]
    Index { reason: String },
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Immutable description of one committed artifact version. A new version
/// of the same id gets a fresh record with a different version/checksum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub artifact_type: String,
    pub description: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// At-rest compression algorithm name, resolved via the codec registry.
    pub compression: String,
    /// Hex sha256 of the uncompressed payload.
    pub checksum: String,
    /// Uncompressed payload size.
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub metadata: ArtifactMetadata,
    pub file_name: String,
    /// On-disk (compressed) size; this is what counts against the quota.
    pub stored_bytes: u64,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatus {
    pub total_artifacts: usize,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl StorageStatus {
    pub fn usage_fraction(&self, max_storage_bytes: u64) -> f32 {
        if max_storage_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f32 / max_storage_bytes as f32
    }
}

/// How eviction breaks ties between unpinned artifacts with the same
/// last-access time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionTieBreak {
    /// Remove the larger artifact first, maximizing freed space.
    LargestFirst,
    SmallestFirst,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root_dir: PathBuf,
    pub max_storage_bytes: u64,
    pub max_artifacts: usize,
    /// Eviction starts once projected usage exceeds this fraction of
    /// `max_storage_bytes`.
    pub cleanup_threshold: f64,
    pub tie_break: EvictionTieBreak,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./model-cache"),
            max_storage_bytes: 10 * 1024 * 1024 * 1024,
            max_artifacts: 32,
            cleanup_threshold: 0.8,
            tie_break: EvictionTieBreak::LargestFirst,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedIndex {
    artifacts: HashMap<String, CachedArtifact>,
    last_cleanup: Option<DateTime<Utc>>,
}

struct StoreState {
    index: HashMap<String, CachedArtifact>,
    used_bytes: u64,
    last_cleanup: Option<DateTime<Utc>>,
}

/// Persists binary artifacts plus JSON metadata under one directory.
/// Artifacts become visible only after a verified, fully-written payload;
/// the index file is rewritten atomically on every mutation.
pub struct ArtifactStore {
    config: StoreConfig,
    codecs: Arc<CodecRegistry>,
    state: Arc<RwLock<StoreState>>,
}

impl ArtifactStore {
    /// Opens (or creates) the store directory, restoring the index from a
    /// previous run. Leftover temp files and index entries whose payload is
    /// missing are discarded.
    pub async fn open(config: StoreConfig, codecs: Arc<CodecRegistry>) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&config.root_dir).await?;

        let mut index: HashMap<String, CachedArtifact> = HashMap::new();
        let mut last_cleanup = None;

        let index_path = config.root_dir.join(INDEX_FILE);
        if tokio::fs::try_exists(&index_path).await? {
            let raw = tokio::fs::read(&index_path).await?;
            let persisted: PersistedIndex =
                serde_json::from_slice(&raw).map_err(|e| StoreError::Index {
                    reason: e.to_string(),
                })?;
            index = persisted.artifacts;
            last_cleanup = persisted.last_cleanup;
        }

        // Crash recovery: interrupted writes leave temp files behind, and an
        // index entry without its payload is unservable.
        let mut entries = tokio::fs::read_dir(&config.root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) {
                warn!(file = %name, "removing leftover temp file");
                tokio::fs::remove_file(entry.path()).await.ok();
            }
        }
        let mut missing = Vec::new();
        for (id, cached) in &index {
            if !tokio::fs::try_exists(&config.root_dir.join(&cached.file_name)).await? {
                missing.push(id.clone());
            }
        }
        for id in missing {
            warn!(id = %id, "dropping index entry with missing payload");
            index.remove(&id);
        }

        let used_bytes = index.values().map(|c| c.stored_bytes).sum();
        info!(
            artifacts = index.len(),
            used_bytes,
            root = %config.root_dir.display(),
            "artifact store opened"
        );

        Ok(Self {
            config,
            codecs,
            state: Arc::new(RwLock::new(StoreState {
                index,
                used_bytes,
                last_cleanup,
            })),
        })
    }

    /// Commits a payload and its metadata atomically. Evicts first when the
    /// projected usage would cross the cleanup threshold; fails without
    /// persisting anything when no evictable artifact can make room.
    pub async fn save(
        &self,
        id: &str,
        payload: &[u8],
        mut metadata: ArtifactMetadata,
    ) -> Result<(), StoreError> {
        let actual_checksum = sha256_hex(payload);
        if metadata.checksum.is_empty() {
            metadata.checksum = actual_checksum.clone();
        } else if metadata.checksum != actual_checksum {
            return Err(StoreError::ChecksumMismatch {
                id: id.to_string(),
                expected: metadata.checksum,
                actual: actual_checksum,
            });
        }
        metadata.size_bytes = payload.len() as u64;

        let codec = self.codecs.get(&metadata.compression)?;
        let stored = codec.compress(payload)?;
        let stored_len = stored.len() as u64;

        // Single write-lock scope: eviction, payload write and index rewrite
        // form one atomic mutation as far as readers are concerned.
        let mut state = self.state.write().await;

        if stored_len > self.config.max_storage_bytes {
            return Err(StoreError::QuotaExceeded {
                required: stored_len,
                limit: self.config.max_storage_bytes,
            });
        }

        let replaced_bytes = state.index.get(id).map(|c| c.stored_bytes).unwrap_or(0);
        let replaced_count = usize::from(state.index.contains_key(id));
        self.evict_for(&mut state, id, stored_len, replaced_bytes, replaced_count)
            .await?;

        let file_name = artifact_file_name(id);
        let path = self.config.root_dir.join(&file_name);
        if let Err(e) = write_atomic(&path, &stored).await {
            // Evictions already happened; record them before surfacing the error
            if let Err(persist_err) = self.persist_index(&state).await {
                warn!(
                    error = %persist_err,
                    "failed to persist index after aborted save; stale entries are dropped on next open"
                );
            }
            return Err(e);
        }

        let pinned = state.index.get(id).map(|c| c.pinned).unwrap_or(false);
        let previous = state.index.insert(
            id.to_string(),
            CachedArtifact {
                metadata,
                file_name,
                stored_bytes: stored_len,
                last_accessed: Utc::now(),
                access_count: 0,
                pinned,
            },
        );
        state.used_bytes = state.used_bytes - previous.map(|c| c.stored_bytes).unwrap_or(0)
            + stored_len;

        self.persist_index(&state).await?;
        debug!(id = %id, stored_bytes = stored_len, used_bytes = state.used_bytes, "artifact saved");
        Ok(())
    }

    /// Reads, decompresses and verifies an artifact, bumping its last-access
    /// time. A corrupted entry is removed so it cannot be served again.
    pub async fn load(&self, id: &str) -> Result<(bytes::Bytes, ArtifactMetadata), StoreError> {
        let mut state = self.state.write().await;

        let cached = state
            .index
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        let raw = tokio::fs::read(self.config.root_dir.join(&cached.file_name)).await?;
        let codec = self.codecs.get(&cached.metadata.compression)?;
        let payload = codec.decompress(&raw)?;

        let actual = sha256_hex(&payload);
        if actual != cached.metadata.checksum {
            warn!(id = %id, "cached artifact failed checksum verification, removing");
            tokio::fs::remove_file(self.config.root_dir.join(&cached.file_name))
                .await
                .ok();
            state.used_bytes = state.used_bytes.saturating_sub(cached.stored_bytes);
            state.index.remove(id);
            self.persist_index(&state).await?;
            return Err(StoreError::ChecksumMismatch {
                id: id.to_string(),
                expected: cached.metadata.checksum,
                actual,
            });
        }

        let entry = state
            .index
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        entry.last_accessed = Utc::now();
        entry.access_count += 1;
        let metadata = entry.metadata.clone();
        self.persist_index(&state).await?;

        Ok((bytes::Bytes::from(payload), metadata))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.index.remove(id) {
            Some(cached) => {
                tokio::fs::remove_file(self.config.root_dir.join(&cached.file_name))
                    .await
                    .ok();
                state.used_bytes = state.used_bytes.saturating_sub(cached.stored_bytes);
                self.persist_index(&state).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.index.contains_key(id)
    }

    /// Index-only lookup; does not touch the payload or the access clock.
    pub async fn get_metadata(&self, id: &str) -> Option<ArtifactMetadata> {
        self.state
            .read()
            .await
            .index
            .get(id)
            .map(|c| c.metadata.clone())
    }

    /// Full index entry, including bookkeeping. Does not bump last-access.
    pub async fn get_cached(&self, id: &str) -> Option<CachedArtifact> {
        self.state.read().await.index.get(id).cloned()
    }

    pub async fn list_cached(&self) -> HashMap<String, CachedArtifact> {
        self.state.read().await.index.clone()
    }

    pub async fn status(&self) -> StorageStatus {
        let state = self.state.read().await;
        StorageStatus {
            total_artifacts: state.index.len(),
            used_bytes: state.used_bytes,
            available_bytes: self
                .config
                .max_storage_bytes
                .saturating_sub(state.used_bytes),
            last_cleanup: state.last_cleanup,
        }
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.config.max_storage_bytes
    }

    pub async fn pin(&self, id: &str) -> Result<(), StoreError> {
        self.set_pinned(id, true).await
    }

    pub async fn unpin(&self, id: &str) -> Result<(), StoreError> {
        self.set_pinned(id, false).await
    }

    async fn set_pinned(&self, id: &str, pinned: bool) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let entry = state
            .index
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        entry.pinned = pinned;
        self.persist_index(&state).await
    }

    /// Removes least-recently-accessed unpinned artifacts until the incoming
    /// payload fits under the cleanup threshold and the artifact count limit.
    async fn evict_for(
        &self,
        state: &mut StoreState,
        incoming_id: &str,
        incoming_bytes: u64,
        replaced_bytes: u64,
        replaced_count: usize,
    ) -> Result<(), StoreError> {
        let threshold =
            (self.config.max_storage_bytes as f64 * self.config.cleanup_threshold) as u64;
        let mut evicted_any = false;

        loop {
            let projected = state.used_bytes - replaced_bytes + incoming_bytes;
            let projected_count = state.index.len() - replaced_count + 1;
            if projected <= threshold && projected_count <= self.config.max_artifacts {
                break;
            }

            let victim = state
                .index
                .values()
                .filter(|c| !c.pinned && c.metadata.id != incoming_id)
                .min_by(|a, b| {
                    a.last_accessed.cmp(&b.last_accessed).then_with(|| {
                        match self.config.tie_break {
                            EvictionTieBreak::LargestFirst => b.stored_bytes.cmp(&a.stored_bytes),
                            EvictionTieBreak::SmallestFirst => a.stored_bytes.cmp(&b.stored_bytes),
                        }
                    })
                })
                .map(|c| c.metadata.id.clone());

            let Some(victim_id) = victim else {
                // Nothing evictable left. The save may still proceed above the
                // cleanup threshold as long as the hard quota holds.
                if projected <= self.config.max_storage_bytes
                    && projected_count <= self.config.max_artifacts
                {
                    break;
                }
                return Err(StoreError::QuotaExceeded {
                    required: incoming_bytes,
                    limit: self.config.max_storage_bytes,
                });
            };

            if let Some(cached) = state.index.remove(&victim_id) {
                info!(id = %victim_id, freed = cached.stored_bytes, "evicting artifact");
                tokio::fs::remove_file(self.config.root_dir.join(&cached.file_name))
                    .await
                    .ok();
                state.used_bytes = state.used_bytes.saturating_sub(cached.stored_bytes);
                evicted_any = true;
            }
        }

        if evicted_any {
            state.last_cleanup = Some(Utc::now());
        }
        Ok(())
    }

    async fn persist_index(&self, state: &StoreState) -> Result<(), StoreError> {
        let persisted = PersistedIndex {
            artifacts: state.index.clone(),
            last_cleanup: state.last_cleanup,
        };
        let encoded = serde_json::to_vec_pretty(&persisted).map_err(|e| StoreError::Index {
            reason: e.to_string(),
        })?;
        write_atomic(&self.config.root_dir.join(INDEX_FILE), &encoded).await
    }
}

/// Temp-file write followed by fsync and rename, so a crash never leaves a
/// partially-written file under the final name.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp_path = tmp_path_for(path);
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(TMP_SUFFIX);
    path.with_file_name(name)
}

fn artifact_file_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.bin", safe)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
