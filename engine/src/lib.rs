//! shelfdb - a vector database engine.
//!
//! Stores dense embedding vectors with text and metadata, organized into
//! libraries, and answers k-NN similarity queries through three
//! interchangeable index kinds (flat, IVF, LSH-SimHash). Per-library
//! reader/writer locking allows many concurrent searches while mutations
//! serialize; durable storage plus deterministic index rebuild gives full
//! recovery on restart.

// ===== Core modules =====

// Error taxonomy with stable kind tags
pub mod error;

// Scalar vector math (dot, norms, cosine)
pub mod vector;

// k-NN indexes: contract, flat, IVF, LSH-SimHash
pub mod index;

// Entities: Library, Document, Chunk, SearchResult
pub mod schema;

// In-memory library store with per-library RW locks
pub mod store;

// Service facade: CRUD + search with locking, index deltas, rollback
pub mod service;

// Persistence adapter: memory and file-backed document stores
pub mod persist;

// Startup recovery: reload state, rebuild indexes
pub mod recovery;

// Embedding provider client (text -> vector)
pub mod embedding;

// REST surface under /v1
pub mod http;

// Metrics and observability: Prometheus counters and histograms
pub mod metrics;

// Configuration from environment variables
pub mod config;

// ===== Public API =====

pub use config::{AppConfig, EmbeddingConfig};
pub use embedding::EmbeddingClient;
pub use error::{EngineError, Result};
pub use http::{router, AppState};
pub use index::{
    build_index, FlatIndex, IndexKind, IndexParams, IndexStats, IvfIndex, IvfParams, LshIndex,
    LshParams, SearchHit, VectorIndex,
};
pub use persist::{FileStorage, MemoryStorage, StorageBackend, StorageSnapshot};
pub use recovery::recover;
pub use schema::{Chunk, Document, Library, LibraryStats, SearchResult};
pub use service::{ChunkPatch, DocumentPatch, LibraryPatch, NewChunk, VectorDbService};
pub use store::{LibraryHandle, LibraryState, LibraryStore};
