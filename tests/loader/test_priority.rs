use async_trait::async_trait;
use bytes::Bytes;
use hybrid_model_loader::{
    sha256_hex, ArtifactStore, CodecRegistry, DeltaConfig, DeltaUpdateManager, FetchError,
    FetchedPayload, HealthConfig, HybridLoader, LoadPriority, LoadRequest, ModelFetcher,
    NetworkHealthMonitor, LoaderConfig, StoreConfig,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Records the order URLs are fetched in. Gated URLs block until released,
/// so tests can saturate the loader's permits before queueing more work.
struct OrderRecordingFetcher {
    payloads: Mutex<HashMap<String, Bytes>>,
    calls: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl OrderRecordingFetcher {
    fn new() -> Self {
        Self {
            payloads: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn serve(&self, url: &str, payload: &[u8]) {
        self.payloads
            .lock()
            .unwrap()
            .insert(url.to_string(), Bytes::copy_from_slice(payload));
    }

    fn gate(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), gate.clone());
        gate
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelFetcher for OrderRecordingFetcher {
    async fn fetch_full(&self, url: &str) -> Result<FetchedPayload, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let gate = self.gates.lock().unwrap().get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let payload = self.payloads.lock().unwrap().get(url).cloned();
        match payload {
            Some(bytes) => Ok(FetchedPayload {
                bytes,
                compression: None,
            }),
            None => Err(FetchError::Status { code: 404 }),
        }
    }

    async fn fetch_delta(
        &self,
        _url: &str,
        _base_checksum: &str,
    ) -> Result<FetchedPayload, FetchError> {
        Err(FetchError::DeltaUnavailable)
    }
}

async fn build_loader(
    dir: &TempDir,
    fetcher: Arc<OrderRecordingFetcher>,
    max_concurrent: usize,
) -> HybridLoader {
    let store_config = StoreConfig {
        root_dir: dir.path().to_path_buf(),
        max_storage_bytes: 10_000_000,
        ..StoreConfig::default()
    };
    let codecs = Arc::new(CodecRegistry::with_defaults());
    let store = Arc::new(
        ArtifactStore::open(store_config, codecs.clone())
            .await
            .unwrap(),
    );
    HybridLoader::new(
        LoaderConfig {
            max_concurrent_loads: max_concurrent,
            retry_delay: Duration::from_millis(10),
            ..LoaderConfig::default()
        },
        store,
        fetcher,
        codecs,
        Arc::new(NetworkHealthMonitor::new(HealthConfig::default())),
        Arc::new(DeltaUpdateManager::new(DeltaConfig::default())),
    )
}

fn url_for(id: &str) -> String {
    format!("https://models.example.com/{}.bin", id)
}

fn request_for(id: &str, payload: &[u8], priority: LoadPriority) -> LoadRequest {
    LoadRequest::new(id, url_for(id), "1.0", sha256_hex(payload))
        .with_compression("none")
        .with_priority(priority)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_queued_loads_dispatch_by_priority_then_fifo() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(OrderRecordingFetcher::new());
    let loader = build_loader(&dir, fetcher.clone(), 2).await;

    let payload = vec![0x11u8; 256];
    for id in ["warm1", "warm2", "low", "crit1", "med", "high", "crit2"] {
        fetcher.serve(&url_for(id), &payload);
    }

    // Saturate both permits with gated loads
    let gate1 = fetcher.gate(&url_for("warm1"));
    let gate2 = fetcher.gate(&url_for("warm2"));
    let mut warm_handles = Vec::new();
    for id in ["warm1", "warm2"] {
        let l = loader.clone();
        let req = request_for(id, &payload, LoadPriority::Medium);
        warm_handles.push(tokio::spawn(async move { l.load_model(req).await }));
    }
    let f = fetcher.clone();
    wait_for(move || f.calls().len() == 2).await;

    // Queue five more in mixed order while nothing can dispatch
    let submissions = [
        ("low", LoadPriority::Low),
        ("crit1", LoadPriority::Critical),
        ("med", LoadPriority::Medium),
        ("high", LoadPriority::High),
        ("crit2", LoadPriority::Critical),
    ];
    let mut handles = Vec::new();
    for (id, priority) in submissions {
        let l = loader.clone();
        let req = request_for(id, &payload, priority);
        handles.push(tokio::spawn(async move { l.load_model(req).await }));
        // Make sure this one is enqueued before submitting the next,
        // so FIFO order within a tier is well defined
        tokio::time::timeout(Duration::from_secs(5), async {
            while loader.get_session(id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session not queued in time");
    }

    gate1.notify_one();
    gate2.notify_one();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    for handle in warm_handles {
        handle.await.unwrap().unwrap();
    }

    let order: Vec<String> = fetcher.calls()[2..].to_vec();
    let expected: Vec<String> = ["crit1", "crit2", "high", "med", "low"]
        .iter()
        .map(|id| url_for(id))
        .collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(OrderRecordingFetcher::new());
    let loader = build_loader(&dir, fetcher.clone(), 2).await;

    let payload = vec![0x22u8; 128];
    let mut gates = Vec::new();
    let mut handles = Vec::new();
    for id in ["a", "b", "c", "d"] {
        fetcher.serve(&url_for(id), &payload);
        gates.push(fetcher.gate(&url_for(id)));
        let l = loader.clone();
        let req = request_for(id, &payload, LoadPriority::Medium);
        handles.push(tokio::spawn(async move { l.load_model(req).await }));
    }

    let f = fetcher.clone();
    wait_for(move || f.calls().len() == 2).await;

    // With both permits held, nothing else may start
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetcher.calls().len(), 2);

    for gate in &gates {
        gate.notify_one();
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(fetcher.calls().len(), 4);
}
