// src/loader.rs - Hybrid loading orchestrator: cache-hit vs full-fetch vs delta-fetch

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compression::{CodecRegistry, CompressionError};
use crate::delta::{DeltaError, DeltaUpdateManager};
use crate::fetcher::{FetchError, ModelFetcher};
use crate::health::{FetchOutcome, NetworkHealth, NetworkHealthMonitor};
use crate::store::{sha256_hex, ArtifactMetadata, ArtifactStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Storage failure: {message}")]
    Storage { message: String },
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("Checksum mismatch - expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error("Load cancelled")]
    Cancelled,
    #[error("Loader is shut down")]
    ShutDown,
}

impl From<StoreError> for LoadError {
    fn from(e: StoreError) -> Self {
        LoadError::Storage {
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    NetworkFull,
    NetworkDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// One load request, created by the caller and consumed once.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub id: String,
    pub source_url: String,
    pub expected_version: String,
    /// Hex sha256 of the uncompressed payload.
    pub expected_checksum: String,
    /// Transport/at-rest compression algorithm name.
    pub compression: String,
    pub priority: LoadPriority,
    pub force_download: bool,
}

impl LoadRequest {
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        expected_version: impl Into<String>,
        expected_checksum: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            expected_version: expected_version.into(),
            expected_checksum: expected_checksum.into(),
            compression: "zstd".to_string(),
            priority: LoadPriority::Medium,
            force_download: false,
        }
    }

    pub fn with_priority(mut self, priority: LoadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = compression.into();
        self
    }

    pub fn force_download(mut self) -> Self {
        self.force_download = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LoadResult {
    pub metadata: ArtifactMetadata,
    pub payload: Bytes,
    pub source: LoadSource,
    pub duration: Duration,
    /// Transferred (or stored) bytes over uncompressed payload bytes.
    pub compression_ratio: f32,
    pub session_id: String,
}

/// Lifecycle record of one load attempt for a given artifact id.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub artifact_id: String,
    pub source: Option<LoadSource>,
    pub status: SessionStatus,
    pub progress_pct: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

#[derive(Debug, Clone)]
pub enum LoadEvent {
    Queued { id: String, priority: LoadPriority },
    Dispatched { id: String },
    CacheHit { id: String },
    FetchStarted { id: String, source: LoadSource },
    DeltaFallback { id: String },
    Completed { id: String, source: LoadSource, duration_ms: u64 },
    Failed { id: String, error: String },
    Cancelled { id: String },
}

#[derive(Debug, Clone)]
pub struct LoaderStats {
    pub sessions_created: u64,
    pub active_sessions: usize,
    pub avg_load_time_ms: f64,
    pub cache_hit_rate: f32,
    /// Fraction of the storage quota currently in use.
    pub storage_usage: f32,
    pub network_health: NetworkHealth,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub max_concurrent_loads: usize,
    /// Extra attempts after the first for transient network failures.
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub enable_delta_updates: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 2,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            enable_delta_updates: true,
        }
    }
}

type LoadOutcome = Result<LoadResult, LoadError>;

struct QueuedLoad {
    priority: LoadPriority,
    seq: u64,
    session_id: String,
    request: LoadRequest,
}

impl PartialEq for QueuedLoad {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedLoad {}

impl PartialOrd for QueuedLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority wins, FIFO within a tier
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ActiveSession {
    session: Session,
    result_tx: broadcast::Sender<LoadOutcome>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct StatsAccum {
    sessions_created: u64,
    requests: u64,
    completed: u64,
    total_load_time_ms: u64,
    cache_hits: u64,
}

struct LoaderState {
    sessions: HashMap<String, ActiveSession>,
    queue: BinaryHeap<QueuedLoad>,
    next_seq: u64,
    stats: StatsAccum,
    event_tx: Option<mpsc::UnboundedSender<LoadEvent>>,
}

struct LoaderInner {
    config: LoaderConfig,
    store: Arc<ArtifactStore>,
    fetcher: Arc<dyn ModelFetcher>,
    codecs: Arc<CodecRegistry>,
    health: Arc<NetworkHealthMonitor>,
    delta_mgr: Arc<DeltaUpdateManager>,
    state: Mutex<LoaderState>,
    semaphore: Arc<Semaphore>,
    queue_notify: Notify,
    shutdown: CancellationToken,
}

/// Orchestrates model loads: consults the cache, picks full vs delta fetch
/// based on network health, enforces a bounded-concurrency priority queue,
/// and guarantees single-flight per artifact id.
#[derive(Clone)]
pub struct HybridLoader {
    inner: Arc<LoaderInner>,
}

impl HybridLoader {
    pub fn new(
        config: LoaderConfig,
        store: Arc<ArtifactStore>,
        fetcher: Arc<dyn ModelFetcher>,
        codecs: Arc<CodecRegistry>,
        health: Arc<NetworkHealthMonitor>,
        delta_mgr: Arc<DeltaUpdateManager>,
    ) -> Self {
        let inner = Arc::new(LoaderInner {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_loads)),
            config,
            store,
            fetcher,
            codecs,
            health,
            delta_mgr,
            state: Mutex::new(LoaderState {
                sessions: HashMap::new(),
                queue: BinaryHeap::new(),
                next_seq: 0,
                stats: StatsAccum::default(),
                event_tx: None,
            }),
            queue_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_dispatcher(inner.clone()));

        Self { inner }
    }

    /// Loads a model, serving from cache when possible. Concurrent calls for
    /// the same id attach to the in-flight session and share its result.
    pub async fn load_model(&self, request: LoadRequest) -> Result<LoadResult, LoadError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(LoadError::ShutDown);
        }

        let mut rx = {
            let mut st = self.inner.state.lock().await;
            st.stats.requests += 1;

            let attached = match st.sessions.get_mut(&request.id) {
                Some(active)
                    if matches!(
                        active.session.status,
                        SessionStatus::Pending | SessionStatus::InProgress
                    ) =>
                {
                    active.session.access_count += 1;
                    active.session.last_accessed = Utc::now();
                    debug!(id = %request.id, "attaching to in-flight session");
                    Some(active.result_tx.subscribe())
                }
                _ => None,
            };

            match attached {
                Some(rx) => rx,
                None => {
                    let id = request.id.clone();
                    let session_id = Uuid::new_v4().to_string();
                    let (tx, rx) = broadcast::channel(4);
                    let session = Session {
                        session_id: session_id.clone(),
                        artifact_id: id.clone(),
                        source: None,
                        status: SessionStatus::Pending,
                        progress_pct: 0.0,
                        created_at: Utc::now(),
                        last_accessed: Utc::now(),
                        access_count: 1,
                    };
                    st.sessions.insert(
                        id.clone(),
                        ActiveSession {
                            session,
                            result_tx: tx,
                            cancel: self.inner.shutdown.child_token(),
                        },
                    );
                    st.stats.sessions_created += 1;

                    let seq = st.next_seq;
                    st.next_seq += 1;
                    LoaderInner::emit(
                        &st,
                        LoadEvent::Queued {
                            id: id.clone(),
                            priority: request.priority,
                        },
                    );
                    st.queue.push(QueuedLoad {
                        priority: request.priority,
                        seq,
                        session_id,
                        request,
                    });
                    rx
                }
            }
        };
        self.inner.queue_notify.notify_one();

        match rx.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(LoadError::Cancelled),
        }
    }

    /// Cancels any in-flight session for this id and drops its record. The
    /// cached artifact, if any, stays on disk. Returns false when no session
    /// existed.
    pub async fn unload_model(&self, id: &str) -> bool {
        let mut st = self.inner.state.lock().await;
        match st.sessions.remove(id) {
            Some(active) => {
                let was_live = matches!(
                    active.session.status,
                    SessionStatus::Pending | SessionStatus::InProgress
                );
                active.cancel.cancel();
                if was_live {
                    info!(id = %id, "cancelling in-flight load");
                    let _ = active.result_tx.send(Err(LoadError::Cancelled));
                    LoaderInner::emit(&st, LoadEvent::Cancelled { id: id.to_string() });
                }
                true
            }
            None => false,
        }
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(id)
            .map(|a| a.session.clone())
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .values()
            .map(|a| a.session.clone())
            .collect()
    }

    /// Per-id loading status updates as an event stream. Single listener:
    /// subscribing again replaces the previous stream, which then closes.
    pub async fn subscribe_events(&self) -> mpsc::UnboundedReceiver<LoadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().await.event_tx = Some(tx);
        rx
    }

    pub async fn stats(&self) -> LoaderStats {
        let (sessions_created, active_sessions, avg_load_time_ms, cache_hit_rate) = {
            let st = self.inner.state.lock().await;
            let active = st
                .sessions
                .values()
                .filter(|a| {
                    matches!(
                        a.session.status,
                        SessionStatus::Pending | SessionStatus::InProgress
                    )
                })
                .count();
            let avg = if st.stats.completed > 0 {
                st.stats.total_load_time_ms as f64 / st.stats.completed as f64
            } else {
                0.0
            };
            let hit_rate = if st.stats.requests > 0 {
                st.stats.cache_hits as f32 / st.stats.requests as f32
            } else {
                0.0
            };
            (st.stats.sessions_created, active, avg, hit_rate)
        };

        let status = self.inner.store.status().await;
        LoaderStats {
            sessions_created,
            active_sessions,
            avg_load_time_ms,
            cache_hit_rate,
            storage_usage: status.usage_fraction(self.inner.store.max_storage_bytes()),
            network_health: self.inner.health.classification().await,
        }
    }

    /// Stops the dispatcher and fails every live session with `Cancelled`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut st = self.inner.state.lock().await;
        st.queue.clear();
        for active in st.sessions.values_mut() {
            if matches!(
                active.session.status,
                SessionStatus::Pending | SessionStatus::InProgress
            ) {
                active.session.status = SessionStatus::Cancelled;
                let _ = active.result_tx.send(Err(LoadError::Cancelled));
            }
        }
    }
}

async fn run_dispatcher(inner: Arc<LoaderInner>) {
    loop {
        // Admission first: a permit bounds concurrent loads, then the
        // highest-priority queued request is picked at dispatch time.
        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            permit = inner.semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        let queued = loop {
            if let Some(q) = inner.state.lock().await.queue.pop() {
                break q;
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = inner.queue_notify.notified() => {}
            }
        };

        let task_inner = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            task_inner.execute(queued).await;
        });
    }
}

impl LoaderInner {
    async fn execute(self: Arc<Self>, queued: QueuedLoad) {
        let request = queued.request;
        let id = request.id.clone();

        let (session_id, result_tx, cancel) = {
            let mut st = self.state.lock().await;
            let Some(active) = st.sessions.get_mut(&id) else {
                // Unloaded while still queued
                return;
            };
            if active.session.session_id != queued.session_id
                || active.session.status != SessionStatus::Pending
            {
                return;
            }
            active.session.status = SessionStatus::InProgress;
            active.session.progress_pct = 10.0;
            active.session.last_accessed = Utc::now();
            let handles = (
                active.session.session_id.clone(),
                active.result_tx.clone(),
                active.cancel.clone(),
            );
            Self::emit(&st, LoadEvent::Dispatched { id: id.clone() });
            handles
        };

        debug!(id = %id, session = %session_id, "dispatching load");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            result = self.run_pipeline(&request, &session_id) => result,
        };

        let mut st = self.state.lock().await;
        match &outcome {
            Ok(result) => {
                if let Some(active) = st.sessions.get_mut(&id) {
                    active.session.status = SessionStatus::Completed;
                    active.session.progress_pct = 100.0;
                    active.session.source = Some(result.source);
                    active.session.last_accessed = Utc::now();
                }
                st.stats.completed += 1;
                st.stats.total_load_time_ms += result.duration.as_millis() as u64;
                if result.source == LoadSource::Cache {
                    st.stats.cache_hits += 1;
                }
                Self::emit(
                    &st,
                    LoadEvent::Completed {
                        id: id.clone(),
                        source: result.source,
                        duration_ms: result.duration.as_millis() as u64,
                    },
                );
            }
            Err(LoadError::Cancelled) => {
                // Partial data is discarded; the session record was already
                // removed by unload_model (or shutdown marked it).
                debug!(id = %id, "load cancelled, discarding partial data");
            }
            Err(e) => {
                warn!(id = %id, error = %e, "load failed");
                if let Some(active) = st.sessions.get_mut(&id) {
                    active.session.status = SessionStatus::Failed;
                    active.session.last_accessed = Utc::now();
                }
                Self::emit(
                    &st,
                    LoadEvent::Failed {
                        id: id.clone(),
                        error: e.to_string(),
                    },
                );
            }
        }
        drop(st);

        let _ = result_tx.send(outcome);
    }

    async fn run_pipeline(
        &self,
        request: &LoadRequest,
        session_id: &str,
    ) -> Result<LoadResult, LoadError> {
        let started = Instant::now();

        // Unsupported algorithm is a configuration error; no I/O attempted
        self.codecs.get(&request.compression)?;

        if !request.force_download {
            if let Some(cached) = self.store.get_cached(&request.id).await {
                if cached.metadata.version == request.expected_version
                    && cached.metadata.checksum == request.expected_checksum
                {
                    match self.store.load(&request.id).await {
                        Ok((payload, metadata)) => {
                            self.emit_event(LoadEvent::CacheHit {
                                id: request.id.clone(),
                            })
                            .await;
                            let ratio = if metadata.size_bytes > 0 {
                                cached.stored_bytes as f32 / metadata.size_bytes as f32
                            } else {
                                1.0
                            };
                            return Ok(LoadResult {
                                metadata,
                                payload,
                                source: LoadSource::Cache,
                                duration: started.elapsed(),
                                compression_ratio: ratio,
                                session_id: session_id.to_string(),
                            });
                        }
                        Err(e) => {
                            warn!(id = %request.id, error = %e, "cache entry unreadable, fetching from network");
                        }
                    }
                }
            }
        }

        let delta_base = if self.config.enable_delta_updates && !request.force_download {
            self.store
                .get_metadata(&request.id)
                .await
                .filter(|m| m.version != request.expected_version)
        } else {
            None
        };

        let mut source = LoadSource::NetworkFull;
        let mut fetched: Option<(Vec<u8>, u64)> = None;

        if let Some(base_meta) = delta_base {
            // Poor/degraded connectivity biases toward the smaller transfer;
            // a healthy link just takes the full payload.
            if self.health.classification().await != NetworkHealth::Good {
                self.update_progress(&request.id, 30.0).await;
                self.emit_event(LoadEvent::FetchStarted {
                    id: request.id.clone(),
                    source: LoadSource::NetworkDelta,
                })
                .await;
                match self.attempt_delta(request, &base_meta).await {
                    Ok(result) => {
                        fetched = Some(result);
                        source = LoadSource::NetworkDelta;
                    }
                    Err(e) => {
                        warn!(id = %request.id, error = %e, "delta attempt failed, falling back to full fetch");
                        self.emit_event(LoadEvent::DeltaFallback {
                            id: request.id.clone(),
                        })
                        .await;
                    }
                }
            }
        }

        let (payload, transferred) = match fetched {
            Some(result) => result,
            None => {
                self.update_progress(&request.id, 30.0).await;
                self.emit_event(LoadEvent::FetchStarted {
                    id: request.id.clone(),
                    source: LoadSource::NetworkFull,
                })
                .await;
                self.fetch_full_verified(request).await?
            }
        };

        self.update_progress(&request.id, 80.0).await;

        let now = Utc::now();
        let metadata = ArtifactMetadata {
            id: request.id.clone(),
            name: request.id.clone(),
            version: request.expected_version.clone(),
            artifact_type: "model".to_string(),
            description: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            compression: request.compression.clone(),
            checksum: request.expected_checksum.clone(),
            size_bytes: payload.len() as u64,
        };
        self.store.save(&request.id, &payload, metadata.clone()).await?;

        let compression_ratio = if payload.is_empty() {
            1.0
        } else {
            transferred as f32 / payload.len() as f32
        };

        Ok(LoadResult {
            metadata,
            payload: Bytes::from(payload),
            source,
            duration: started.elapsed(),
            compression_ratio,
            session_id: session_id.to_string(),
        })
    }

    /// One delta attempt: fetch the patch against the cached base, apply it,
    /// verify the result. Any failure here falls back to a full fetch.
    async fn attempt_delta(
        &self,
        request: &LoadRequest,
        base_meta: &ArtifactMetadata,
    ) -> Result<(Vec<u8>, u64), LoadError> {
        let (base_payload, _) = self.store.load(&request.id).await?;

        let fetch_started = Instant::now();
        let fetch_result = self
            .fetcher
            .fetch_delta(&request.source_url, &base_meta.checksum)
            .await;
        self.health
            .record_outcome(FetchOutcome {
                latency: fetch_started.elapsed(),
                success: fetch_result.is_ok(),
            })
            .await;
        let payload = fetch_result?;
        let transferred = payload.bytes.len() as u64;

        let patch = match &payload.compression {
            Some(name) => self.codecs.get(name)?.decompress(&payload.bytes)?,
            None => payload.bytes.to_vec(),
        };

        let rebuilt = self.delta_mgr.apply_delta(&base_payload, &patch)?;
        let actual = sha256_hex(&rebuilt);
        if actual != request.expected_checksum {
            return Err(LoadError::ChecksumMismatch {
                expected: request.expected_checksum.clone(),
                actual,
            });
        }

        debug!(
            id = %request.id,
            transferred,
            payload_len = rebuilt.len(),
            "delta fetch applied"
        );
        Ok((rebuilt, transferred))
    }

    /// Full fetch with retry for transient errors, then decompression and
    /// checksum verification. A mismatch discards the bytes; nothing is saved.
    async fn fetch_full_verified(&self, request: &LoadRequest) -> Result<(Vec<u8>, u64), LoadError> {
        let mut attempt = 0usize;
        let payload = loop {
            let fetch_started = Instant::now();
            let result = self.fetcher.fetch_full(&request.source_url).await;
            self.health
                .record_outcome(FetchOutcome {
                    latency: fetch_started.elapsed(),
                    success: result.is_ok(),
                })
                .await;

            match result {
                Ok(p) => break p,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        id = %request.id,
                        attempt,
                        error = %e,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let transferred = payload.bytes.len() as u64;
        let algorithm = payload
            .compression
            .clone()
            .unwrap_or_else(|| request.compression.clone());
        let decompressed = self.codecs.get(&algorithm)?.decompress(&payload.bytes)?;

        let actual = sha256_hex(&decompressed);
        if actual != request.expected_checksum {
            return Err(LoadError::ChecksumMismatch {
                expected: request.expected_checksum.clone(),
                actual,
            });
        }

        Ok((decompressed, transferred))
    }

    async fn update_progress(&self, id: &str, pct: f32) {
        let mut st = self.state.lock().await;
        if let Some(active) = st.sessions.get_mut(id) {
            active.session.progress_pct = pct;
        }
    }

    async fn emit_event(&self, event: LoadEvent) {
        let st = self.state.lock().await;
        Self::emit(&st, event);
    }

    fn emit(st: &LoaderState, event: LoadEvent) {
        if let Some(tx) = &st.event_tx {
            let _ = tx.send(event);
        }
    }
}
