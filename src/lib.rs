pub mod compression;
pub mod delta;
pub mod fetcher;
pub mod health;
pub mod loader;
pub mod store;

// Re-export main types
pub use compression::{
    CodecRegistry, CompressionCodec, CompressionError, GzipCodec, NoneCodec, ZstdCodec,
};
pub use delta::{DeltaConfig, DeltaError, DeltaUpdateManager};
pub use fetcher::{
    FetchError, FetchedPayload, FetcherConfig, HttpModelFetcher, ModelFetcher, COMPRESSION_HEADER,
};
pub use health::{FetchOutcome, HealthConfig, HealthSnapshot, NetworkHealth, NetworkHealthMonitor};
pub use loader::{
    HybridLoader, LoadError, LoadEvent, LoadPriority, LoadRequest, LoadResult, LoadSource,
    LoaderConfig, LoaderStats, Session, SessionStatus,
};
pub use store::{
    sha256_hex, ArtifactMetadata, ArtifactStore, CachedArtifact, EvictionTieBreak, StorageStatus,
    StoreConfig, StoreError,
};
